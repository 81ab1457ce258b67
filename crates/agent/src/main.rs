mod agent_modules;

use clap::Parser;
use std::error::Error;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent_modules::communication::{
    next_reconnect_delay, push_session, with_jitter, DEFAULT_RECONNECT_DELAY,
};
use agent_modules::config::load_cli_config;
use agent_modules::metrics::MetricsCollector;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file
    #[arg(short, long, default_value = "agent_config.toml")]
    config: String,
}

fn init_logging() {
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info` level if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

async fn run(config_path: &str) -> Result<(), Box<dyn Error>> {
    let agent_cli_config = match load_cli_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Critical error loading configuration. Exiting.");
            return Err(e);
        }
    };
    let url = agent_cli_config.ingress_url();
    let every = Duration::from_secs(agent_cli_config.interval_secs.max(1));
    let mut collector = MetricsCollector::new();
    let mut reconnect_delay = DEFAULT_RECONNECT_DELAY;

    loop {
        info!(url = %url, "Connecting to server.");
        let started = tokio::time::Instant::now();
        match push_session(&url, every, &mut collector).await {
            Ok(()) => info!("Session ended."),
            Err(e) => warn!(error = %e, "Session failed."),
        }
        // A session that lasted a while counts as a successful connection.
        if started.elapsed() > every * 2 {
            reconnect_delay = DEFAULT_RECONNECT_DELAY;
        }
        let wait = with_jitter(reconnect_delay);
        info!(delay_ms = wait.as_millis() as u64, "Reconnecting after delay.");
        tokio::time::sleep(wait).await;
        reconnect_delay = next_reconnect_delay(reconnect_delay);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if std::env::args().any(|arg| arg == "--version") {
        println!("Agent version: {VERSION}");
        return Ok(());
    }
    let args = Args::parse();

    init_logging();
    info!(version = VERSION, "Starting agent...");

    tokio::select! {
        result = run(&args.config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received; agent stopping.");
            Ok(())
        }
    }
}
