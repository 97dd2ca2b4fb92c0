use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use farm_sync::config::{self, Config};
use farm_sync::connectivity::{
    run_probe_loop, Connectivity, ConnectivityMonitor, ConnectivityProbe, HttpProbe,
};
use farm_sync::gateway::SubmissionGateway;
use farm_sync::model::{RecordKind, SubmitOutcome};
use farm_sync::queue::{QueueStore, SqliteQueue};
use farm_sync::reconciler::{spawn_auto_sync, SyncReconciler};
use farm_sync::remote::{HttpRecordApi, RecordApi};
use farm_sync::status::StatusAggregator;

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline capture queue for farm field records")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write an example config file
    Init,
    /// Capture one record (delivered now or queued)
    Submit {
        /// feed, health, weight, egg or mortality
        #[arg(long)]
        kind: RecordKind,
        /// Record body as JSON
        #[arg(long)]
        payload: String,
    },
    /// Replay queued records now
    Sync,
    /// Print the sync status as JSON
    Status,
    /// List queued records
    Pending {
        /// Include records that are already synced
        #[arg(long)]
        all: bool,
    },
    /// Delete synced records older than the given age
    Prune {
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Watch connectivity and sync on every reconnect until Ctrl-C
    Run,
}

struct Services {
    monitor: ConnectivityMonitor,
    probe: Arc<dyn ConnectivityProbe>,
    queue: Arc<SqliteQueue>,
    gateway: SubmissionGateway,
    reconciler: Arc<SyncReconciler>,
    status: StatusAggregator,
}

impl Services {
    async fn build(cfg: &Config) -> Result<Self> {
        let queue = Arc::new(SqliteQueue::open(&cfg.database_url()).await?);
        let api: Arc<dyn RecordApi> = Arc::new(HttpRecordApi::from_config(cfg)?);
        let probe: Arc<dyn ConnectivityProbe> = Arc::new(HttpProbe::new(
            &cfg.remote.base_url,
            &cfg.remote.health_path,
            cfg.remote.timeout(),
        )?);
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let store: Arc<dyn QueueStore> = queue.clone();
        let timeout = cfg.remote.timeout();

        let gateway =
            SubmissionGateway::new(monitor.clone(), store.clone(), api.clone(), timeout);
        let reconciler = Arc::new(SyncReconciler::new(store.clone(), api, timeout));
        let status = StatusAggregator::new(monitor.clone(), store, reconciler.clone());
        Ok(Self {
            monitor,
            probe,
            queue,
            gateway,
            reconciler,
            status,
        })
    }

    async fn probe_once(&self) {
        self.monitor.observe(self.probe.probe().await);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    if let Command::Init = args.command {
        if args.config.exists() {
            bail!("{} already exists", args.config.display());
        }
        std::fs::write(&args.config, config::example())
            .with_context(|| format!("failed to write {}", args.config.display()))?;
        info!(path = %args.config.display(), "wrote example config");
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let services = Services::build(&cfg).await?;

    let result = run_command(args.command, &cfg, &services).await;
    services.queue.close().await;
    result
}

async fn run_command(command: Command, cfg: &Config, services: &Services) -> Result<()> {
    match command {
        // Handled in main before any config is loaded.
        Command::Init => {}
        Command::Submit { kind, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            services.probe_once().await;
            match services.gateway.submit(kind, payload).await? {
                SubmitOutcome::Submitted { id } => println!("submitted {id}"),
                SubmitOutcome::Queued(entry) => println!("queued {} (#{})", entry.id, entry.seq),
            }
        }
        Command::Sync => {
            services.probe_once().await;
            if !services.monitor.is_online() {
                println!("offline; {} records pending", services.queue.count().await);
                return Ok(());
            }
            if let Some(summary) = services.reconciler.reconcile().await {
                println!("{summary}");
            }
        }
        Command::Status => {
            services.probe_once().await;
            let status = services.status.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Pending { all } => {
            let entries = if all {
                services.queue.list_all().await
            } else {
                services.queue.list_pending().await
            };
            for e in entries {
                println!(
                    "#{:<5} {} {:<9} {} synced={} attempts={} {}",
                    e.seq,
                    e.id,
                    e.endpoint.as_str(),
                    e.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                    e.synced,
                    e.attempts,
                    e.payload
                );
            }
        }
        Command::Prune { older_than_hours } => {
            let Some(hours) = cfg.app.prune_hours(older_than_hours) else {
                println!("retention is disabled (app.purge_after_hours: 0); pass --older-than-hours to prune");
                return Ok(());
            };
            let cutoff = config::purge_cutoff(Utc::now(), hours)
                .with_context(|| format!("retention of {hours} hours is out of range"))?;
            let removed = services.queue.purge_synced(cutoff).await;
            println!("removed {removed} synced records");
        }
        Command::Run => run_daemon(cfg, services).await?,
    }
    Ok(())
}

async fn run_daemon(cfg: &Config, services: &Services) -> Result<()> {
    let auto_sync = spawn_auto_sync(&services.monitor, services.reconciler.clone());
    let probe_loop = tokio::spawn(run_probe_loop(
        services.monitor.clone(),
        services.probe.clone(),
        cfg.app.probe_interval(),
    ));

    // Prune on the probe cadence; cheap when nothing is due.
    let retention = cfg.app.retention_hours();
    let queue = services.queue.clone();
    let interval = cfg.app.probe_interval();
    let pruner = tokio::spawn(async move {
        let Some(hours) = retention else { return };
        loop {
            let Some(cutoff) = config::purge_cutoff(Utc::now(), hours) else {
                warn!(hours, "retention window out of range; pruning stopped");
                return;
            };
            let removed = queue.purge_synced(cutoff).await;
            if removed > 0 {
                info!(removed, "purged synced records");
            }
            tokio::time::sleep(interval).await;
        }
    });

    info!(pending = services.queue.count().await, "farm-sync running");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }
    info!("shutting down");

    probe_loop.abort();
    pruner.abort();
    auto_sync.shutdown().await;
    Ok(())
}
