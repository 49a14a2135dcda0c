use job_server::{
    api::{create_metrics_router, create_rest_api},
    JobServerBuilder, ServerConfig, StorageBackend,
};
use job_server_engine::{AlwaysFail, AlwaysSucceed, DummyHandler, EngineMetrics};
use axum::Router;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "job-server")]
#[command(about = "Job execution server with bounded retries", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// API host
    #[arg(long)]
    host: Option<String>,

    /// API port
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for the file backend (implies `backend: file`)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Delay before a failed job is retried, in milliseconds
    #[arg(long)]
    cooldown_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_missing = !args.config.exists();
    let mut config = if config_missing {
        ServerConfig::default()
    } else {
        ServerConfig::from_file(&args.config)?
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.persistence.backend = StorageBackend::File;
        config.persistence.data_dir = data_dir;
    }
    if let Some(cooldown_ms) = args.cooldown_ms {
        config.engine.retry_cooldown_ms = cooldown_ms;
    }

    init_tracing(&config);

    if config_missing {
        tracing::warn!("Config file {:?} not found, using defaults", args.config);
    }
    tracing::info!("Starting job server with config: {:?}", config);

    let store = config.open_store()?;
    let metrics = Arc::new(EngineMetrics::new()?);

    let mut builder = JobServerBuilder::new(store, config.engine.clone(), metrics);
    builder
        .register_handler("dummy", DummyHandler::default())
        .await?;
    builder
        .register_handler("always-succeed", AlwaysSucceed)
        .await?;
    builder.register_handler("always-fail", AlwaysFail).await?;

    let server = Arc::new(builder.start().await?);

    // Start metrics server
    let metrics_app = create_metrics_router(server.clone());
    let metrics_addr = config.metrics_addr();
    tokio::spawn(async move {
        if let Err(e) = serve(metrics_app, &metrics_addr, "Metrics server").await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // Run REST API until ctrl-c
    let api = create_rest_api(server.clone());
    serve(api, &config.bind_addr(), "REST API").await?;

    server.shutdown().await;
    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.monitoring.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn serve(app: Router, addr: &str, name: &str) -> anyhow::Result<()> {
    tracing::info!("{} listening on {}", name, addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

