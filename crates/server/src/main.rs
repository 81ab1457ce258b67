use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetwarden_server::db::duckdb_service::DuckDBService;
use fleetwarden_server::engine::Engine;
use fleetwarden_server::server::config::{ServerConfig, TransportKind};
use fleetwarden_server::transport::{Connector, LocalConnector, SshConnector};
use fleetwarden_server::version::VERSION;
use fleetwarden_server::web::create_axum_router;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "fleetwarden.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,duckdb=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C.");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM.");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Manually check for --version before full parsing to keep the output simple.
    if std::env::args().any(|arg| arg == "--version") {
        println!("Server version: {VERSION}");
        return Ok(());
    }

    let args = Args::parse();

    // --- Server Config Setup ---
    // Loaded before logging so the log directory is configurable.
    let server_config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&server_config.log_dir);
    info!("Starting server, version: {}", VERSION);

    std::fs::create_dir_all(&server_config.data_dir)?;

    // --- DuckDB Setup ---
    let duckdb_service = match DuckDBService::open(&server_config.database_path) {
        Ok(service) => {
            info!(path = %server_config.database_path.display(), "Successfully initialized DuckDB service.");
            service
        }
        Err(e) => {
            error!("Failed to create DuckDB service: {}", e);
            return Err(e.into());
        }
    };

    // --- Transport Setup ---
    let connector: Arc<dyn Connector> = match server_config.transport {
        TransportKind::Ssh => Arc::new(SshConnector::new(Duration::from_secs(
            server_config.keepalive_interval_secs,
        ))),
        TransportKind::Local => {
            info!("Using the local shell transport; every host runs on this machine.");
            Arc::new(LocalConnector)
        }
    };

    // --- Engine Setup ---
    let engine = match Engine::build(&server_config, connector, Some(duckdb_service)).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to build engine: {}", e);
            return Err(e.into());
        }
    };
    engine.start().await?;

    // --- Axum HTTP Server Setup ---
    let addr: SocketAddr = server_config.listen_address.parse()?;
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    info!(address = %addr, "HTTP server listening with TCP Keepalive");

    let app = create_axum_router(engine.clone());
    // Stopping the engine ends agent sockets and log streams, which lets the
    // graceful shutdown drain.
    let stopping = engine.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stopping.shutdown().await;
        })
        .await
        .map_err(Box::new)?;

    info!("Server stopped.");
    Ok(())
}
