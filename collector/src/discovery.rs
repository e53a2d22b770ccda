//! Domain/project discovery.
//!
//! Enumerates the projects this cluster serves, either from a static list in
//! the configuration or from the identity service, and keeps the `projects`
//! and `project_services` tables in sync: one `project_services` row per
//! (project, enabled service) pair, rows for vanished projects deleted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use shared::config::{ClusterConfig, DiscoveryMethod, StaticProject};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredProject {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
    pub domain_uuid: Uuid,
    pub domain_name: String,
}

/// Source of the project list. The identity service itself is an external
/// collaborator; only this contract crosses the boundary.
#[async_trait]
pub trait ProjectLister: Send + Sync {
    async fn list_projects(&self) -> anyhow::Result<Vec<DiscoveredProject>>;
}

/// Serves the projects pinned in the configuration file.
pub struct StaticLister {
    projects: Vec<StaticProject>,
}

impl StaticLister {
    pub fn new(projects: Vec<StaticProject>) -> Self {
        StaticLister { projects }
    }
}

#[async_trait]
impl ProjectLister for StaticLister {
    async fn list_projects(&self) -> anyhow::Result<Vec<DiscoveredProject>> {
        Ok(self
            .projects
            .iter()
            .map(|p| DiscoveredProject {
                uuid: p.uuid,
                name: p.name.clone(),
                parent_uuid: p.parent_uuid,
                domain_uuid: p.domain_uuid,
                domain_name: p.domain_name.clone(),
            })
            .collect())
    }
}

/// Queries the identity service's project listing endpoint.
pub struct HttpProjectLister {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProjectListResponse {
    projects: Vec<DiscoveredProject>,
}

impl HttpProjectLister {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpProjectLister {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl ProjectLister for HttpProjectLister {
    async fn list_projects(&self) -> anyhow::Result<Vec<DiscoveredProject>> {
        let url = format!("{}/v1/projects", self.endpoint);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "identity service returned HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        let parsed: ProjectListResponse = response.json().await?;
        Ok(parsed.projects)
    }
}

/// Build the lister matching the configured discovery method. The identity
/// endpoint comes from the environment because it carries deployment-local
/// credentials handling, not cluster semantics.
pub fn lister_for(config: &ClusterConfig) -> anyhow::Result<Arc<dyn ProjectLister>> {
    match config.discovery.method {
        DiscoveryMethod::Static => Ok(Arc::new(StaticLister::new(
            config.discovery.static_projects.clone(),
        ))),
        DiscoveryMethod::List => {
            let endpoint = std::env::var("IDENTITY_ENDPOINT")
                .map_err(|_| anyhow::anyhow!("discovery.method = list requires IDENTITY_ENDPOINT"))?;
            Ok(Arc::new(HttpProjectLister::new(endpoint)))
        }
    }
}

/// Reconcile the project catalog against a fresh listing.
pub async fn sync_projects(
    pool: &PgPool,
    projects: &[DiscoveredProject],
    enabled_services: &[String],
) -> anyhow::Result<()> {
    for project in projects {
        sqlx::query(
            r#"
            INSERT INTO projects (uuid, name, parent_uuid, domain_uuid, domain_name)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (uuid) DO UPDATE
            SET name = EXCLUDED.name,
                parent_uuid = EXCLUDED.parent_uuid,
                domain_uuid = EXCLUDED.domain_uuid,
                domain_name = EXCLUDED.domain_name
            "#,
        )
        .bind(project.uuid)
        .bind(&project.name)
        .bind(project.parent_uuid)
        .bind(project.domain_uuid)
        .bind(&project.domain_name)
        .execute(pool)
        .await?;

        for service_type in enabled_services {
            sqlx::query(
                r#"
                INSERT INTO project_services (project_id, service_type)
                SELECT p.id, $2 FROM projects p WHERE p.uuid = $1
                ON CONFLICT (project_id, service_type) DO NOTHING
                "#,
            )
            .bind(project.uuid)
            .bind(service_type)
            .execute(pool)
            .await?;
        }
    }

    // projects that vanished from the listing disappear with all their rows
    let known: Vec<Uuid> = projects.iter().map(|p| p.uuid).collect();
    let deleted = sqlx::query("DELETE FROM projects WHERE uuid <> ALL($1)")
        .bind(&known)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted > 0 {
        info!(projects = deleted, "removed vanished projects");
    }
    Ok(())
}

/// Periodic discovery loop. Failures are logged and retried on the next
/// tick; discovery has no per-row scheduler state.
pub async fn run_discovery_loop(
    pool: PgPool,
    lister: Arc<dyn ProjectLister>,
    enabled_services: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "discovery loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match lister.list_projects().await {
            Ok(projects) => {
                if let Err(e) = sync_projects(&pool, &projects, &enabled_services).await {
                    error!(error = %e, "project sync failed");
                } else {
                    info!(projects = projects.len(), "project discovery completed");
                }
            }
            Err(e) => warn!(error = %e, "project listing failed"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(crate::scheduler::jittered(interval)) => {}
        }
    }
    info!("discovery loop stopped");
}
