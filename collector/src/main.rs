//! Granary collector: the control plane of a multi-tenant cloud quota
//! manager.
//!
//! This binary:
//! - discovers domains and projects and seeds their scheduler rows
//! - scrapes capacity and per-project usage from backend adapters (liquids)
//! - reconciles the versioned service catalog into PostgreSQL
//! - computes per-project quotas under the autogrow distribution model and
//!   pushes them back to the adapters
//! - drives the commitment lifecycle (confirm, expire, convert) and the
//!   resulting mail notifications
//!
//! At-most-once execution per (project, service, jobtype) rests on
//! `SELECT ... FOR UPDATE SKIP LOCKED` row claims; no in-process locks are
//! held across adapter calls.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::ClusterConfig;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use collector::cluster::Cluster;
use collector::demand::{DemandSource, StoreDemandSource};
use collector::scheduler::{spawn_workers, JobSettings};
use collector::{capacity, commitment, discovery, mail, metrics, quota, rates, reconcile, serve, usage};

#[derive(Parser)]
#[command(name = "granary", about = "Multi-tenant cloud quota manager control plane")]
struct Cli {
    /// Path to the cluster configuration file.
    #[arg(long, env = "GRANARY_CONFIG", default_value = "granary.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collection scheduler (scrapes, quota distribution,
    /// commitments, mail).
    Collect,
    /// Run the operational HTTP surface (health, metrics, cluster report).
    Serve {
        #[arg(long, env = "GRANARY_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },
    /// One-shot diagnostic: scrape capacity for one service and dump the
    /// per-AZ result as JSON.
    TestScanCapacity {
        #[arg(long)]
        service: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "granary=info,collector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    let cli = Cli::parse();

    let config = match ClusterConfig::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(command: Command, config: Arc<ClusterConfig>) -> anyhow::Result<()> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(&database_url)
        .await?;
    info!("database connected");

    metrics::register_all();
    let cluster = Arc::new(Cluster::new(pool, config));

    match command {
        Command::Collect => collect(cluster).await,
        Command::Serve { listen } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(true);
            });
            serve::run_server(cluster, listen, shutdown_rx).await
        }
        Command::TestScanCapacity { service } => test_scan_capacity(cluster, &service).await,
    }
}

async fn collect(cluster: Arc<Cluster>) -> anyhow::Result<()> {
    info!("collector starting");

    reconcile::orphan_sweep(&cluster.pool, &cluster.enabled_services()).await?;
    cluster.refresh_all().await;

    let lister = discovery::lister_for(&cluster.config)?;
    match lister.list_projects().await {
        Ok(projects) => {
            discovery::sync_projects(&cluster.pool, &projects, &cluster.enabled_services())
                .await?;
        }
        Err(e) => warn!(error = %e, "initial project discovery failed, the loop will retry"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(discovery::run_discovery_loop(
        cluster.pool.clone(),
        Arc::clone(&lister),
        cluster.enabled_services(),
        Duration::from_secs(3 * 60),
        shutdown_rx.clone(),
    ));

    let demand_source: Arc<dyn DemandSource> = Arc::new(StoreDemandSource::new(
        cluster.pool.clone(),
        Arc::clone(&cluster.config),
    ));

    let scrape_settings = JobSettings::default();
    let sweep_settings = JobSettings {
        idle_interval: Duration::from_secs(60),
        ..JobSettings::default()
    };

    spawn_workers(
        &mut tasks,
        Arc::new(capacity::CapacityScrapeJob::new(
            Arc::clone(&cluster),
            Arc::clone(&demand_source),
        )),
        scrape_settings.clone(),
        shutdown_rx.clone(),
    );
    spawn_workers(
        &mut tasks,
        Arc::new(usage::UsageScrapeJob::new(Arc::clone(&cluster))),
        scrape_settings.clone(),
        shutdown_rx.clone(),
    );
    spawn_workers(
        &mut tasks,
        Arc::new(rates::RateScrapeJob::new(Arc::clone(&cluster))),
        scrape_settings.clone(),
        shutdown_rx.clone(),
    );
    spawn_workers(
        &mut tasks,
        Arc::new(quota::QuotaApplyJob::new(Arc::clone(&cluster))),
        scrape_settings.clone(),
        shutdown_rx.clone(),
    );
    spawn_workers(
        &mut tasks,
        Arc::new(commitment::CommitmentConfirmJob::new(Arc::clone(&cluster))),
        sweep_settings.clone(),
        shutdown_rx.clone(),
    );
    spawn_workers(
        &mut tasks,
        Arc::new(commitment::CommitmentExpireJob::new(Arc::clone(&cluster))),
        sweep_settings.clone(),
        shutdown_rx.clone(),
    );

    if cluster.config.mail_notifications.is_some() {
        let endpoint = std::env::var("MAIL_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("mail_notifications requires MAIL_ENDPOINT"))?;
        let sender = Arc::new(mail::HttpMailSender::new(endpoint));
        spawn_workers(
            &mut tasks,
            Arc::new(mail::MailDeliveryJob::new(cluster.pool.clone(), sender)),
            sweep_settings.clone(),
            shutdown_rx.clone(),
        );
    }

    info!("collector started");
    shutdown_signal().await;
    info!("shutdown requested, draining workers");
    let _ = shutdown_tx.send(true);

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("workers did not drain within the shutdown timeout, aborting");
        tasks.abort_all();
    }
    info!("collector stopped");
    Ok(())
}

async fn test_scan_capacity(cluster: Arc<Cluster>, service: &str) -> anyhow::Result<()> {
    let connection = cluster
        .connection(service)
        .ok_or_else(|| anyhow::anyhow!("service {service:?} is not configured"))?;
    let demand_source = StoreDemandSource::new(
        cluster.pool.clone(),
        Arc::clone(&cluster.config),
    );

    let mut tx = cluster.pool.begin().await?;
    connection.refresh(&mut tx).await?;
    let capacities = connection.scrape_capacity(&mut tx, &demand_source).await?;
    // keep the catalog reconcile, discard nothing else
    tx.commit().await?;

    println!("{}", serde_json::to_string_pretty(&capacities)?);
    Ok(())
}

/// Signal handling support.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("received Ctrl+C");
    }
}
