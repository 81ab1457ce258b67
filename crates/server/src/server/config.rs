use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::vault::default_key_path;

const ENV_PREFIX: &str = "FLEETWARDEN_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ssh,
    Local,
}

impl TransportKind {
    fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(TransportKind::Ssh),
            "local" => Ok(TransportKind::Local),
            other => Err(format!("Unknown transport '{other}', expected 'ssh' or 'local'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_address: String,
    pub data_dir: String,
    pub log_dir: String,
    pub vault_key_path: PathBuf,
    pub database_path: PathBuf,
    pub scripts_dir: String,
    pub transport: TransportKind,

    pub pool_max_age_secs: u64,
    pub pool_max_idle_secs: u64,
    pub pool_reap_interval_secs: u64,

    pub health_interval_secs: u64,
    pub health_warmup_secs: u64,
    pub health_host_delay_secs: u64,
    pub health_probe_timeout_secs: u64,
    pub agent_fresh_secs: u64,

    pub dial_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub history_output_cap_bytes: usize,
    pub task_retry_delay_ms: u64,

    pub job_default_timeout_mins: u64,
    pub log_default_lines: u32,

    pub notify_webhook_url: Option<String>,
    pub notify_webhook_template: Option<String>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    listen_address: Option<String>,
    data_dir: Option<String>,
    log_dir: Option<String>,
    vault_key_path: Option<String>,
    database_path: Option<String>,
    scripts_dir: Option<String>,
    transport: Option<String>,
    pool_max_age_secs: Option<u64>,
    pool_max_idle_secs: Option<u64>,
    pool_reap_interval_secs: Option<u64>,
    health_interval_secs: Option<u64>,
    health_warmup_secs: Option<u64>,
    health_host_delay_secs: Option<u64>,
    health_probe_timeout_secs: Option<u64>,
    agent_fresh_secs: Option<u64>,
    dial_timeout_secs: Option<u64>,
    keepalive_interval_secs: Option<u64>,
    history_output_cap_bytes: Option<usize>,
    task_retry_delay_ms: Option<u64>,
    job_default_timeout_mins: Option<u64>,
    log_default_lines: Option<u32>,
    notify_webhook_url: Option<String>,
    notify_webhook_template: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_scripts_dir() -> String {
    "scripts".to_string()
}

impl ServerConfig {
    /// File values first, then `FLEETWARDEN_*` environment variables on top.
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: PartialServerConfig = match config_path {
            Some(path_str) => {
                let path = Path::new(path_str);
                if path.exists() {
                    let contents = fs::read_to_string(path)
                        .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
                    toml::from_str(&contents)
                        .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))?
                } else {
                    PartialServerConfig::default()
                }
            }
            None => PartialServerConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialServerConfig = envy::prefixed(ENV_PREFIX)
            .from_env::<PartialServerConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialServerConfig, file: PartialServerConfig) -> Result<Self, String> {
        let transport = match env.transport.as_deref().or(file.transport.as_deref()) {
            Some(value) => TransportKind::parse(value)?,
            None => TransportKind::Ssh,
        };
        Ok(Self::build(env, file, transport))
    }

    fn build(env: PartialServerConfig, file: PartialServerConfig, transport: TransportKind) -> Self {
        let data_dir = env.data_dir.or(file.data_dir).unwrap_or_else(default_data_dir);
        ServerConfig {
            listen_address: env.listen_address.or(file.listen_address)
                .unwrap_or_else(default_listen_address),
            log_dir: env.log_dir.or(file.log_dir)
                .unwrap_or_else(default_log_dir),
            vault_key_path: env.vault_key_path.or(file.vault_key_path)
                .map(PathBuf::from)
                .unwrap_or_else(|| default_key_path(&data_dir)),
            database_path: env.database_path.or(file.database_path)
                .map(PathBuf::from)
                .unwrap_or_else(|| Path::new(&data_dir).join("fleetwarden.duckdb")),
            scripts_dir: env.scripts_dir.or(file.scripts_dir)
                .unwrap_or_else(default_scripts_dir),
            transport,
            pool_max_age_secs: env.pool_max_age_secs.or(file.pool_max_age_secs).unwrap_or(300),
            pool_max_idle_secs: env.pool_max_idle_secs.or(file.pool_max_idle_secs).unwrap_or(120),
            pool_reap_interval_secs: env.pool_reap_interval_secs.or(file.pool_reap_interval_secs).unwrap_or(30),
            health_interval_secs: env.health_interval_secs.or(file.health_interval_secs).unwrap_or(300),
            health_warmup_secs: env.health_warmup_secs.or(file.health_warmup_secs).unwrap_or(30),
            health_host_delay_secs: env.health_host_delay_secs.or(file.health_host_delay_secs).unwrap_or(2),
            health_probe_timeout_secs: env.health_probe_timeout_secs.or(file.health_probe_timeout_secs).unwrap_or(10),
            agent_fresh_secs: env.agent_fresh_secs.or(file.agent_fresh_secs).unwrap_or(30),
            dial_timeout_secs: env.dial_timeout_secs.or(file.dial_timeout_secs).unwrap_or(300),
            keepalive_interval_secs: env.keepalive_interval_secs.or(file.keepalive_interval_secs).unwrap_or(30),
            history_output_cap_bytes: env.history_output_cap_bytes.or(file.history_output_cap_bytes)
                .unwrap_or(1024 * 1024),
            task_retry_delay_ms: env.task_retry_delay_ms.or(file.task_retry_delay_ms).unwrap_or(2000),
            job_default_timeout_mins: env.job_default_timeout_mins.or(file.job_default_timeout_mins).unwrap_or(30),
            log_default_lines: env.log_default_lines.or(file.log_default_lines).unwrap_or(100),
            notify_webhook_url: env.notify_webhook_url.or(file.notify_webhook_url),
            notify_webhook_template: env.notify_webhook_template.or(file.notify_webhook_template),
            data_dir,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::build(
            PartialServerConfig::default(),
            PartialServerConfig::default(),
            TransportKind::Ssh,
        )
    }
}
