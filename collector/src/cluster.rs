//! Shared runtime context: the store pool, the immutable cluster
//! configuration and one adapter connection per enabled service.

use std::collections::BTreeMap;
use std::sync::Arc;

use shared::config::ClusterConfig;
use shared::types::ServiceType;
use sqlx::PgPool;
use tracing::warn;

use crate::connection::LiquidConnection;

pub struct Cluster {
    pub pool: PgPool,
    pub config: Arc<ClusterConfig>,
    connections: BTreeMap<ServiceType, Arc<LiquidConnection>>,
}

impl Cluster {
    pub fn new(pool: PgPool, config: Arc<ClusterConfig>) -> Self {
        let connections = config
            .liquids
            .iter()
            .map(|(service_type, liquid_config)| {
                (
                    service_type.clone(),
                    Arc::new(LiquidConnection::new(
                        service_type.clone(),
                        liquid_config,
                        config.availability_zones.clone(),
                    )),
                )
            })
            .collect();
        Cluster {
            pool,
            config,
            connections,
        }
    }

    pub fn connection(&self, service_type: &str) -> Option<Arc<LiquidConnection>> {
        self.connections
            .get(&ServiceType::from(service_type))
            .cloned()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<LiquidConnection>> {
        self.connections.values()
    }

    pub fn enabled_services(&self) -> Vec<String> {
        self.connections
            .keys()
            .map(|service_type| service_type.as_str().to_string())
            .collect()
    }

    /// Seed every adapter's `ServiceInfo` cache (and the catalog) once at
    /// startup. Unreachable adapters are logged and retried by the first
    /// scheduled scrape; they must not keep the process from starting.
    pub async fn refresh_all(&self) {
        for connection in self.connections.values() {
            let result = async {
                let mut tx = self.pool.begin().await?;
                connection.refresh(&mut tx).await.map_err(anyhow::Error::from)?;
                tx.commit().await?;
                anyhow::Ok(())
            }
            .await;
            if let Err(e) = result {
                warn!(
                    service = %connection.service_type(),
                    error = %e,
                    "initial service info refresh failed, scrape jobs will retry"
                );
            }
        }
    }
}
