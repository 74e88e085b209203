use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use qsa_monitor::bridge::protocol::{CacheInfo, WorkerMetadata};
use qsa_monitor::transport::{AdminState, ServerConfig, serve};
use qsa_monitor::{
    FixedBackoff, LogBuffer, LogBufferLayer, Probe, ProbeConfig, Registry, RegistryConfig,
    Responder, StaticMetadata, StatsAccumulator,
};

/// Where a worker looks for the admin when nothing else is configured.
const DEFAULT_ADMIN_ADDR: &str = "localhost:9999";

#[derive(Parser)]
#[command(name = "qsa-monitor", about = "QGIS Server instance monitoring", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the admin HTTP API and, when a monitoring port is set, the registry
    Admin {
        /// HTTP bind address
        #[arg(long, env = "QSA_HOST", default_value = "0.0.0.0")]
        host: String,
        /// HTTP port
        #[arg(long, env = "QSA_PORT", default_value_t = 5000)]
        port: u16,
        /// Address the monitoring registry listens on
        #[arg(long, env = "QSA_QGISSERVER_MONITORING_HOST", default_value = "0.0.0.0")]
        monitoring_host: String,
        /// Monitoring port; 0 disables monitoring
        #[arg(long, env = "QSA_QGISSERVER_MONITORING_PORT", default_value_t = 0)]
        monitoring_port: u16,
    },
    /// Run a standalone worker probe until Ctrl-C
    Worker {
        /// Admin monitoring address (host:port)
        #[arg(long, env = "QSA_MONITOR_ADDR", default_value = DEFAULT_ADMIN_ADDR)]
        admin: String,
        /// Seconds between connection attempts
        #[arg(long, default_value_t = 3)]
        backoff_secs: u64,
        /// Number of log lines kept for the `logs` command
        #[arg(long, default_value_t = qsa_monitor::probe::DEFAULT_LOG_CAPACITY)]
        log_capacity: usize,
        /// Active server plugin (repeatable)
        #[arg(long = "plugin")]
        plugins: Vec<String>,
        /// Available data provider (repeatable)
        #[arg(long = "provider")]
        providers: Vec<String>,
        /// Cached project path; only its file name is reported (repeatable)
        #[arg(long = "project")]
        projects: Vec<String>,
    },
}

/// Initialize tracing with QSA_LOG and LOG_FORMAT support.
///
/// When `log_buffer` is given every event is also copied into it.
fn init_tracing(log_buffer: Option<LogBuffer>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("QSA_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(base_level)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(log_buffer.map(LogBufferLayer::new));

    if use_json {
        let _ = subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

async fn run_admin(
    server: ServerConfig,
    monitoring_host: String,
    monitoring_port: u16,
) -> anyhow::Result<()> {
    let registry = if monitoring_port == 0 {
        tracing::info!("QGIS Server monitoring is not activated");
        None
    } else {
        let config = RegistryConfig::new(format!("{monitoring_host}:{monitoring_port}"));
        let registry = Registry::start(config)
            .await
            .context("failed to start monitoring registry")?;
        Some(Arc::new(registry))
    };

    serve(server, AdminState::new(registry)).await
}

async fn run_worker(
    admin: String,
    backoff: Duration,
    logs: LogBuffer,
    metadata: WorkerMetadata,
) -> anyhow::Result<()> {
    let responder = Responder::new(
        Arc::new(StaticMetadata(metadata)),
        logs,
        Arc::new(StatsAccumulator::default()),
    );
    let config = ProbeConfig::new(admin).with_backoff(Arc::new(FixedBackoff(backoff)));
    let probe = Probe::new(config, responder).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    tracing::info!("Received SIGINT, shutting down...");

    probe.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Admin {
            host,
            port,
            monitoring_host,
            monitoring_port,
        } => {
            init_tracing(None);
            let server = ServerConfig::default().with_host(host).with_port(port);
            run_admin(server, monitoring_host, monitoring_port).await
        }
        Commands::Worker {
            admin,
            backoff_secs,
            log_capacity,
            plugins,
            providers,
            projects,
        } => {
            let logs = LogBuffer::new(log_capacity);
            init_tracing(Some(logs.clone()));
            let metadata = WorkerMetadata {
                plugins,
                providers,
                cache: CacheInfo::from_project_paths(projects),
                ..Default::default()
            };
            run_worker(admin, Duration::from_secs(backoff_secs), logs, metadata).await
        }
    }
}
