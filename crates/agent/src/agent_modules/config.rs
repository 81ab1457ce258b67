use serde::Deserialize;
use std::{error::Error, fs, path::Path};
use tracing::info;

fn default_interval_secs() -> u64 {
    10
}

#[derive(Deserialize, Debug, Clone)]
pub struct AgentCliConfig {
    /// Control plane base URL, e.g. `ws://10.0.0.1:8080` or `https://fw.example.com`.
    pub server_url: String,
    pub host_id: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl AgentCliConfig {
    /// Agent ingress endpoint for this host.
    pub fn ingress_url(&self) -> String {
        let base = self.server_url.trim().trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws/agent?id={}", encode_query_value(&self.host_id))
    }
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

pub fn load_cli_config(config_path_str: &str) -> Result<AgentCliConfig, Box<dyn Error>> {
    let config_path = Path::new(config_path_str);
    let config_str = fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read agent config file '{config_path_str}': {e}"))?;

    let agent_cli_config: AgentCliConfig = toml::from_str(&config_str)
        .map_err(|e| format!("Failed to parse agent config file '{config_path_str}': {e}"))?;
    if agent_cli_config.host_id.trim().is_empty() {
        return Err("host_id must not be empty".into());
    }

    info!(host_id = %agent_cli_config.host_id, server_url = %agent_cli_config.server_url, "Loaded agent config.");
    Ok(agent_cli_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, id: &str) -> AgentCliConfig {
        AgentCliConfig {
            server_url: url.to_string(),
            host_id: id.to_string(),
            interval_secs: 10,
        }
    }

    #[test]
    fn http_base_becomes_websocket_url() {
        assert_eq!(
            config("http://10.0.0.1:8080/", "h1").ingress_url(),
            "ws://10.0.0.1:8080/ws/agent?id=h1"
        );
        assert_eq!(
            config("https://fw.example.com", "h1").ingress_url(),
            "wss://fw.example.com/ws/agent?id=h1"
        );
        assert_eq!(
            config("ws://fw:8080", "web 1&x").ingress_url(),
            "ws://fw:8080/ws/agent?id=web%201%26x"
        );
    }

    #[test]
    fn loads_toml_with_default_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "server_url = \"ws://fw:8080\"\nhost_id = \"h1\"\n").unwrap();
        let config = load_cli_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.host_id, "h1");
        assert_eq!(config.interval_secs, 10);
    }

    #[test]
    fn rejects_empty_host_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "server_url = \"ws://fw:8080\"\nhost_id = \"\"\n").unwrap();
        assert!(load_cli_config(path.to_str().unwrap()).is_err());
    }
}
