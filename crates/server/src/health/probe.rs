use fleetwarden_common::metrics::METRIC_FIELDS;
use fleetwarden_common::HostMetrics;
use futures::future::join_all;

use crate::transport::{Transport, TransportError};

/// Shell snippet per metric, in [`METRIC_FIELDS`] order.
const PROBE_COMMANDS: [&str; 21] = [
    "cat /proc/sys/kernel/hostname 2>/dev/null || hostname",
    "uptime -p 2>/dev/null || uptime",
    "cut -d' ' -f1-3 /proc/loadavg",
    "nproc",
    "top -bn1 | awk '/Cpu\\(s\\)/ {printf \"%.1f\", 100 - $8}'",
    "free -b | awk '/^Mem:/ {print $2}'",
    "free -b | awk '/^Mem:/ {print $3}'",
    "free | awk '/^Mem:/ {printf \"%.1f\", $3 / $2 * 100}'",
    "free -b | awk '/^Swap:/ {print $2}'",
    "free -b | awk '/^Swap:/ {print $3}'",
    "df -B1 / | awk 'NR==2 {print $2}'",
    "df -B1 / | awk 'NR==2 {print $3}'",
    "df / | awk 'NR==2 {gsub(\"%\", \"\", $5); print $5}'",
    "uname -r",
    ". /etc/os-release 2>/dev/null && echo \"$PRETTY_NAME\"",
    "uname -m",
    "awk 'NR>2 && $1 !~ /lo:/ {rx += $2} END {print rx}' /proc/net/dev",
    "awk 'NR>2 && $1 !~ /lo:/ {tx += $10} END {print tx}' /proc/net/dev",
    "ps -e --no-headers | wc -l",
    "who | wc -l",
    "hostname -I 2>/dev/null | awk '{print $1}'",
];

/// Runs every metric command concurrently over one transport. A failing
/// command leaves its metric unset; a lost connection fails the probe.
pub async fn collect_metrics(transport: &dyn Transport) -> Result<HostMetrics, TransportError> {
    let outputs = join_all(PROBE_COMMANDS.iter().map(|cmd| transport.exec(cmd, None))).await;
    let mut metrics = HostMetrics::default();
    for (field, output) in METRIC_FIELDS.iter().zip(outputs) {
        match output {
            Ok(out) if out.success() => metrics.set(field, Some(out.stdout.trim().to_string())),
            Ok(_) => {}
            Err(e) if e.is_connection_lost() => return Err(e),
            Err(_) => {}
        }
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;

    #[tokio::test]
    async fn probes_local_shell() {
        let metrics = collect_metrics(&LocalTransport::new()).await.unwrap();
        assert!(metrics.hostname.is_some());
        assert!(metrics.kernel.is_some());
        assert!(metrics.arch.is_some());
    }

    #[tokio::test]
    async fn closed_transport_fails() {
        let transport = LocalTransport::new();
        transport.close().await;
        assert!(collect_metrics(&transport).await.is_err());
    }
}
