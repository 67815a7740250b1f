//! NSDb Server - HTTP front end for the core engine

mod api;

use nsdb_core::config::parse_duration;
use nsdb_core::{Engine, NsdbConfig, NsdbError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration, read from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Engine configuration
    pub engine: NsdbConfig,
}

impl ServerConfig {
    fn from_env() -> Result<Self, NsdbError> {
        let mut engine = NsdbConfig::default();

        if let Ok(path) = std::env::var("NSDB_BASE_PATH") {
            engine.base_path = PathBuf::from(path);
        }
        if let Ok(v) = std::env::var("NSDB_SHARD_INTERVAL") {
            engine.shard_interval = parse_duration(&v)?;
        }
        if let Ok(v) = std::env::var("NSDB_WRITE_SCHEDULER_INTERVAL") {
            engine.write_scheduler_interval = parse_duration(&v)?;
        }
        if let Ok(v) = std::env::var("NSDB_PASSIVATE_AFTER") {
            engine.passivate_after = parse_duration(&v)?;
        }
        if let Ok(v) = std::env::var("NSDB_QUERY_DEFAULT_LIMIT") {
            engine.default_limit = v
                .parse()
                .map_err(|_| NsdbError::Config(format!("invalid query.default_limit: {}", v)))?;
        }
        if let Ok(v) = std::env::var("NSDB_REPLICATION_FACTOR") {
            engine.replication_factor = v
                .parse()
                .map_err(|_| NsdbError::Config(format!("invalid replication.factor: {}", v)))?;
        }

        let http_addr = std::env::var("NSDB_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
            .parse()
            .map_err(|e| NsdbError::Config(format!("invalid listen address: {}", e)))?;

        Ok(Self { http_addr, engine })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };

    info!("starting NSDb server");
    info!("data directory: {:?}", config.engine.base_path);
    info!("listening on http://{}", config.http_addr);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ NsdbError::Config(_)) => {
            error!("{}", e);
            ExitCode::from(1)
        }
        Err(e @ NsdbError::IndexIo(_)) => {
            error!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(64)
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), NsdbError> {
    let engine = Arc::new(Engine::open(config.engine)?);

    let app = api::create_router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .map_err(NsdbError::IndexIo)?;
    info!("NSDb server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(NsdbError::IndexIo)?;

    info!("draining accumulators");
    engine.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
