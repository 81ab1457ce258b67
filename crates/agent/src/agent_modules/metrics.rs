use fleetwarden_common::HostMetrics;
use std::net::IpAddr;
use sysinfo::{Disks, Networks, ProcessRefreshKind, ProcessesToUpdate, System};

/// Keeps sysinfo state between snapshots; CPU usage needs two refreshes to
/// be meaningful.
pub struct MetricsCollector {
    sys: System,
    networks: Networks,
    disks: Disks,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        Self {
            sys,
            networks: Networks::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// One snapshot with the same field formats the SSH probe produces.
    pub fn collect(&mut self) -> HostMetrics {
        self.sys.refresh_cpu_all();
        self.sys.refresh_memory();
        self.sys
            .refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());
        self.networks.refresh(true);
        self.disks.refresh(true);

        let mut metrics = HostMetrics::default();
        metrics.set("hostname", System::host_name());
        metrics.set("uptime", Some(format_uptime(System::uptime())));
        let load = System::load_average();
        metrics.set(
            "load_avg",
            Some(format!("{:.2} {:.2} {:.2}", load.one, load.five, load.fifteen)),
        );
        metrics.set("cpu_cores", Some(self.sys.cpus().len().to_string()));
        metrics.set("cpu_usage", Some(format!("{:.1}", self.sys.global_cpu_usage())));

        let mem_total = self.sys.total_memory();
        let mem_used = self.sys.used_memory();
        metrics.set("mem_total", Some(mem_total.to_string()));
        metrics.set("mem_used", Some(mem_used.to_string()));
        metrics.set("mem_usage", percent(mem_used, mem_total));
        metrics.set("swap_total", Some(self.sys.total_swap().to_string()));
        metrics.set("swap_used", Some(self.sys.used_swap().to_string()));

        // Root filesystem when it is listed, otherwise every disk.
        let root: Vec<_> = self
            .disks
            .list()
            .iter()
            .filter(|d| d.mount_point() == std::path::Path::new("/"))
            .collect();
        let disks: Vec<_> = if root.is_empty() {
            self.disks.list().iter().collect()
        } else {
            root
        };
        let disk_total: u64 = disks.iter().map(|d| d.total_space()).sum();
        let disk_used: u64 = disks
            .iter()
            .map(|d| d.total_space().saturating_sub(d.available_space()))
            .sum();
        metrics.set("disk_total", Some(disk_total.to_string()));
        metrics.set("disk_used", Some(disk_used.to_string()));
        metrics.set(
            "disk_usage",
            (disk_total > 0).then(|| format!("{:.0}", disk_used as f64 / disk_total as f64 * 100.0)),
        );

        metrics.set("kernel", System::kernel_version());
        metrics.set("os", System::long_os_version());
        metrics.set("arch", Some(std::env::consts::ARCH.to_string()));

        let mut rx = 0u64;
        let mut tx = 0u64;
        let mut ip: Option<IpAddr> = None;
        for (name, data) in self.networks.iter() {
            if name == "lo" {
                continue;
            }
            rx += data.total_received();
            tx += data.total_transmitted();
            if ip.is_none() {
                ip = data
                    .ip_networks()
                    .iter()
                    .map(|n| n.addr)
                    .find(|addr| addr.is_ipv4() && !addr.is_loopback());
            }
        }
        metrics.set("net_rx", Some(rx.to_string()));
        metrics.set("net_tx", Some(tx.to_string()));
        metrics.set("processes", Some(self.sys.processes().len().to_string()));
        metrics.set("ip_address", ip.map(|addr| addr.to_string()));
        metrics
    }
}

fn percent(used: u64, total: u64) -> Option<String> {
    (total > 0).then(|| format!("{:.1}", used as f64 / total as f64 * 100.0))
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days} day{}", if days == 1 { "" } else { "s" }));
    }
    if hours > 0 {
        parts.push(format!("{hours} hour{}", if hours == 1 { "" } else { "s" }));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{minutes} minute{}", if minutes == 1 { "" } else { "s" }));
    }
    format!("up {}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_reads_like_uptime_p() {
        assert_eq!(format_uptime(59), "up 0 minutes");
        assert_eq!(format_uptime(3_660), "up 1 hour, 1 minute");
        assert_eq!(format_uptime(2 * 86_400 + 5 * 60), "up 2 days, 5 minutes");
    }

    #[test]
    fn percent_of_zero_total_is_unset() {
        assert_eq!(percent(1, 0), None);
        assert_eq!(percent(1, 4).as_deref(), Some("25.0"));
    }

    #[test]
    fn snapshot_has_core_fields() {
        let mut collector = MetricsCollector::new();
        let metrics = collector.collect();
        assert!(metrics.cpu_cores.is_some());
        assert!(metrics.mem_total.is_some());
        assert_eq!(metrics.arch.as_deref(), Some(std::env::consts::ARCH));
    }
}
