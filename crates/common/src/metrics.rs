use serde::{Deserialize, Deserializer, Serialize};

/// One metrics snapshot for a host, either probed over SSH by the server or
/// pushed by the host-resident agent.
///
/// Every value is carried as an optional string. Agents may send numbers or
/// strings for any field and the frame is normalised on parse; fields the
/// server does not know are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostMetrics {
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mem_total: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mem_used: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mem_usage: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub swap_total: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub swap_used: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub disk_total: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub disk_used: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub net_rx: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub net_tx: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub processes: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub users: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Field names in probe order. Shared by the SSH prober and the agent.
pub const METRIC_FIELDS: [&str; 21] = [
    "hostname",
    "uptime",
    "load_avg",
    "cpu_cores",
    "cpu_usage",
    "mem_total",
    "mem_used",
    "mem_usage",
    "swap_total",
    "swap_used",
    "disk_total",
    "disk_used",
    "disk_usage",
    "kernel",
    "os",
    "arch",
    "net_rx",
    "net_tx",
    "processes",
    "users",
    "ip_address",
];

impl HostMetrics {
    /// Parses an agent push frame.
    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Sets a metric by its wire name. Unknown names are ignored and
    /// empty values clear the field.
    pub fn set(&mut self, field: &str, value: Option<String>) {
        let value = value.filter(|v| !v.is_empty());
        let slot = match field {
            "hostname" => &mut self.hostname,
            "uptime" => &mut self.uptime,
            "load_avg" => &mut self.load_avg,
            "cpu_cores" => &mut self.cpu_cores,
            "cpu_usage" => &mut self.cpu_usage,
            "mem_total" => &mut self.mem_total,
            "mem_used" => &mut self.mem_used,
            "mem_usage" => &mut self.mem_usage,
            "swap_total" => &mut self.swap_total,
            "swap_used" => &mut self.swap_used,
            "disk_total" => &mut self.disk_total,
            "disk_used" => &mut self.disk_used,
            "disk_usage" => &mut self.disk_usage,
            "kernel" => &mut self.kernel,
            "os" => &mut self.os,
            "arch" => &mut self.arch,
            "net_rx" => &mut self.net_rx,
            "net_tx" => &mut self.net_tx,
            "processes" => &mut self.processes,
            "users" => &mut self.users,
            "ip_address" => &mut self.ip_address,
            _ => return,
        };
        *slot = value;
    }

    /// Reads a percentage metric such as `cpu_usage` ("42.5" or "42.5%").
    pub fn percent(value: Option<&String>) -> Option<f64> {
        value.and_then(|v| v.trim().trim_end_matches('%').trim().parse::<f64>().ok())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_accepts_numbers_and_strings() {
        let frame = r#"{"hostname":"web-1","cpu_usage":12.5,"mem_usage":"40.0","processes":311}"#;
        let metrics = HostMetrics::from_frame(frame).unwrap();
        assert_eq!(metrics.hostname.as_deref(), Some("web-1"));
        assert_eq!(metrics.cpu_usage.as_deref(), Some("12.5"));
        assert_eq!(metrics.mem_usage.as_deref(), Some("40.0"));
        assert_eq!(metrics.processes.as_deref(), Some("311"));
        assert!(metrics.disk_usage.is_none());
    }

    #[test]
    fn frame_ignores_unknown_fields_and_nulls() {
        let frame = r#"{"gpu_temp":71,"kernel":null,"arch":"x86_64"}"#;
        let metrics = HostMetrics::from_frame(frame).unwrap();
        assert!(metrics.kernel.is_none());
        assert_eq!(metrics.arch.as_deref(), Some("x86_64"));
    }

    #[test]
    fn set_covers_every_field() {
        let mut metrics = HostMetrics::default();
        for field in METRIC_FIELDS {
            metrics.set(field, Some("1".to_string()));
        }
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json.as_object().unwrap().len(), METRIC_FIELDS.len());
    }

    #[test]
    fn percent_strips_suffix() {
        assert_eq!(HostMetrics::percent(Some(&"87%".to_string())), Some(87.0));
        assert_eq!(HostMetrics::percent(Some(&"n/a".to_string())), None);
        assert_eq!(HostMetrics::percent(None), None);
    }
}
