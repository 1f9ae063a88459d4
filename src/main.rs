use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use awbsync::clock::{system_clock, SharedClock};
use awbsync::config::Config;
use awbsync::limits::Limits;
use awbsync::queue::{self, JobQueue};
use awbsync::scheduler::{Scheduler, SweepKind, SweepTicker};
use awbsync::service::SyncService;
use awbsync::storage::{self, ShipmentStore};
use awbsync::upstream::CourierClient;
use awbsync::utils::retry::{retry, retry_if, Backoff};
use awbsync::worker::{spawn_workers, SyncContext};
use awbsync::{api, metrics};

#[derive(Parser)]
#[command(
    name = "awbsync",
    version,
    about = "Courier tracking sync with fleet-wide rate limiting and circuit breaking",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Read configuration from a TOML file instead of the environment
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); defaults to AWBSYNC_LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync workers
    Worker {
        /// Worker loops in this process
        #[arg(short = 'n', long, default_value = "1")]
        concurrency: usize,
    },

    /// Run the sweep timer (full, priority, retention)
    Scheduler,

    /// Serve the HTTP surface
    Serve {
        /// Listen address, overrides AWBSYNC_BIND
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run workers, the sweep timer and the HTTP surface together
    All {
        /// Worker loops in this process
        #[arg(short = 'n', long, default_value = "1")]
        concurrency: usize,
    },

    /// Force sync 1 to 20 AWBs
    Sync {
        #[arg(required = true, num_args = 1..)]
        awbs: Vec<String>,
    },

    /// Add AWBs to tracking and sync them right away
    Track {
        #[arg(required = true, num_args = 1..)]
        awbs: Vec<String>,
    },

    /// Re-arm a quarantined shipment
    Reset { awb: String },

    /// Print queue, limiter and backlog status as JSON
    Status,

    /// Run one sweep now (full, priority, retention)
    Sweep { kind: SweepKind },

    /// Create the shipment store schema
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "awbsync starting");

    match cli.command {
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            migrate(store.as_ref()).await?;
            println!("Schema ready");
        }
        Commands::Worker { concurrency } => {
            let app = App::bootstrap(config).await?;
            let shutdown_rx = shutdown_on_ctrl_c();
            init_metrics();
            app.run_workers(concurrency, shutdown_rx).await?;
        }
        Commands::Scheduler => {
            let app = App::bootstrap(config).await?;
            let shutdown_rx = shutdown_on_ctrl_c();
            init_metrics();
            app.run_ticker(shutdown_rx).await;
        }
        Commands::Serve { bind } => {
            let app = App::bootstrap(config).await?;
            let shutdown_rx = shutdown_on_ctrl_c();
            init_metrics();
            let bind = bind.unwrap_or_else(|| app.config.server.bind.clone());
            api::serve(app.service.clone(), &bind, wait_for(shutdown_rx)).await?;
        }
        Commands::All { concurrency } => {
            let app = Arc::new(App::bootstrap(config).await?);
            let shutdown_rx = shutdown_on_ctrl_c();
            init_metrics();

            let workers = tokio::spawn({
                let app = app.clone();
                let rx = shutdown_rx.clone();
                async move { app.run_workers(concurrency, rx).await }
            });
            let ticker = tokio::spawn({
                let app = app.clone();
                let rx = shutdown_rx.clone();
                async move { app.run_ticker(rx).await }
            });

            api::serve(
                app.service.clone(),
                &app.config.server.bind,
                wait_for(shutdown_rx),
            )
            .await?;
            ticker.await?;
            workers.await??;
        }
        Commands::Sync { awbs } => {
            let app = App::bootstrap(config).await?;
            let job = app.service.force_sync(awbs.as_slice()).await?;
            println!("Enqueued batch {} ({} AWBs)", job.batch_id, job.awbs.len());
        }
        Commands::Track { awbs } => {
            let app = App::bootstrap(config).await?;
            let outcome = app.service.add_to_tracking(awbs.as_slice()).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Reset { awb } => {
            let app = App::bootstrap(config).await?;
            if app.service.reset_shipment(&awb).await? {
                println!("{awb} re-armed");
            } else {
                anyhow::bail!("{awb} is not tracked");
            }
        }
        Commands::Status => {
            let app = App::bootstrap(config).await?;
            let status = app.service.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Sweep { kind } => {
            let app = App::bootstrap(config).await?;
            let outcome = app.scheduler.run(kind).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    tracing::info!("awbsync finished");
    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("awbsync=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new(format!("awbsync={level},warn"))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn init_metrics() {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Prometheus metrics disabled");
    }
}

/// Flip the returned receiver to `true` on Ctrl-C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current work");
        }
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for(mut shutdown_rx: watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn connect_store(config: &Config) -> Result<Arc<dyn ShipmentStore>> {
    retry(&Backoff::startup(), "open shipment store", || storage::from_config(config))
        .await
        .context("Failed to open shipment store")
}

async fn migrate(store: &dyn ShipmentStore) -> Result<()> {
    retry_if(
        &Backoff::startup(),
        "create schema",
        || async { store.migrate().await.map_err(anyhow::Error::from) },
        |e| e.to_string().to_ascii_lowercase().contains("connection"),
    )
    .await
    .context("Failed to create schema")
}

/// Everything wired from one configuration
struct App {
    config: Config,
    clock: SharedClock,
    store: Arc<dyn ShipmentStore>,
    queue: Arc<dyn JobQueue>,
    limits: Limits,
    scheduler: Arc<Scheduler>,
    service: Arc<SyncService>,
}

impl App {
    async fn bootstrap(config: Config) -> Result<Self> {
        let clock = system_clock();
        let backoff = Backoff::startup();

        let store = connect_store(&config).await?;
        migrate(store.as_ref()).await?;

        let queue = retry(&backoff, "open job queue", || queue::from_config(&config, clock.clone()))
            .await
            .context("Failed to open job queue")?;
        let limits = retry(&backoff, "open constraint store", || {
            Limits::from_config(&config, clock.clone())
        })
            .await
            .context("Failed to open constraint store")?;

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            &config,
        ));
        let service = Arc::new(SyncService::new(
            store.clone(),
            queue.clone(),
            scheduler.clone(),
            limits.clone(),
            clock.clone(),
        ));

        Ok(Self {
            config,
            clock,
            store,
            queue,
            limits,
            scheduler,
            service,
        })
    }

    async fn run_workers(&self, concurrency: usize, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let api = CourierClient::new(&self.config.upstream).context("Invalid upstream settings")?;
        let ctx = SyncContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            api: Arc::new(api),
            limits: self.limits.clone(),
            clock: self.clock.clone(),
        };

        let handles = spawn_workers(concurrency, ctx, &self.config.worker, shutdown_rx);
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Worker task panicked");
            }
        }
        Ok(())
    }

    async fn run_ticker(&self, shutdown_rx: watch::Receiver<bool>) {
        let ticker = Arc::new(SweepTicker::new(self.scheduler.clone(), &self.config.scheduler));
        let stopper = ticker.clone();
        tokio::spawn(async move {
            wait_for(shutdown_rx).await;
            stopper.stop();
        });
        ticker.run().await;
    }
}
