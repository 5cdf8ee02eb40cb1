//! Telemetry collection using sysinfo, plus the NIC/disk filtering rules.
//!
//! `collect_report` re-reads the kernel on every call; the instantaneous
//! network speed measurement samples counters twice, one second apart, so a
//! call blocks for about a second.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use sysinfo::{Disks, System};
use time::OffsetDateTime;
use tracing::warn;

use crate::config::AgentConfig;
use crate::gpu;
use crate::net_stats::{self, last_reset_date, safe_delta};
use crate::state::AgentState;
use crate::types::{
    ConnectionsReport, CpuReport, DiskReport, LoadReport, MemReport, NetworkReport,
    TelemetryReport,
};

/// Interfaces whose names start with these prefixes are never reported:
/// loopback plus the common bridge/container/VM virtual devices.
pub const NIC_VIRTUAL_PREFIXES: [&str; 9] = [
    "lo", "br", "cni", "docker", "podman", "flannel", "veth", "virbr", "vmbr",
];

pub fn parse_nics(csv: &str) -> HashSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Prefix blocklist first, then the whitelist if configured, else the
/// blacklist if configured.
pub fn should_include_nic(
    name: &str,
    include: &HashSet<String>,
    exclude: &HashSet<String>,
) -> bool {
    if NIC_VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    if !include.is_empty() {
        return include.contains(name);
    }
    if !exclude.is_empty() {
        return !exclude.contains(name);
    }
    true
}

/// Names of the interfaces the agent currently reports on.
pub fn interface_list(cfg: &AgentConfig) -> Vec<String> {
    let include = parse_nics(&cfg.include_nics);
    let exclude = parse_nics(&cfg.exclude_nics);
    net_stats::kernel_counters()
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| should_include_nic(name, &include, &exclude))
        .collect()
}

/// Mountpoint filter for disk aggregation: keep `/` always, drop temp
/// mounts, network filesystems (by fstype or by mount options), overlay and
/// loop devices.
pub fn is_physical_filesystem(
    fstype: &str,
    device: &str,
    mountpoint: &str,
    options: &str,
) -> bool {
    if mountpoint == "/" {
        return true;
    }
    let mp = mountpoint.to_ascii_lowercase();
    if matches!(
        mp.as_str(),
        "/tmp" | "/var/tmp" | "/dev/shm" | "/run" | "/run/lock"
    ) {
        return false;
    }
    let fstype = fstype.to_ascii_lowercase();
    if fstype.starts_with("nfs")
        || fstype.starts_with("cifs")
        || fstype.starts_with("smb")
        || fstype == "vboxsf"
        || fstype == "9p"
        || fstype.contains("fuse")
    {
        return false;
    }
    // Mapped network drives surface only through mount options, not fstype.
    let options = options.to_ascii_lowercase();
    if options.contains("remote") || options.contains("network") {
        return false;
    }
    if fstype == "overlay" || fstype == "tmpfs" || fstype == "devtmpfs" {
        return false;
    }
    if device.starts_with("/dev/loop") {
        return false;
    }
    true
}

/// Mountpoint -> comma-joined mount options from the kernel mount table.
/// Empty off Linux; sysinfo does not expose options.
fn mount_options_table() -> HashMap<String, String> {
    #[cfg(target_os = "linux")]
    {
        let mut table = HashMap::new();
        if let Ok(mounts) = std::fs::read_to_string("/proc/mounts") {
            for line in mounts.lines() {
                let mut fields = line.split_whitespace();
                let _device = fields.next();
                let mountpoint = fields.next();
                let _fstype = fields.next();
                let options = fields.next();
                if let (Some(mountpoint), Some(options)) = (mountpoint, options) {
                    table.insert(mountpoint.to_string(), options.to_string());
                }
            }
        }
        table
    }
    #[cfg(not(target_os = "linux"))]
    {
        HashMap::new()
    }
}

/// Aggregate (total, used) bytes over the monitored mountpoints.
pub fn disk_usage(cfg: &AgentConfig) -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    let mount_options = mount_options_table();
    let mut total = 0u64;
    let mut used = 0u64;
    if cfg.include_mountpoints.is_empty() {
        for disk in disks.list() {
            let fstype = disk.file_system().to_string_lossy();
            let device = disk.name().to_string_lossy();
            let mountpoint = disk.mount_point().to_string_lossy();
            let options = mount_options
                .get(mountpoint.as_ref())
                .map(String::as_str)
                .unwrap_or("");
            if is_physical_filesystem(&fstype, &device, &mountpoint, options) {
                total += disk.total_space();
                used += disk.total_space().saturating_sub(disk.available_space());
            }
        }
    } else {
        for wanted in mountpoint_list(cfg) {
            if let Some(disk) = disks
                .list()
                .iter()
                .find(|d| d.mount_point() == Path::new(&wanted))
            {
                total += disk.total_space();
                used += disk.total_space().saturating_sub(disk.available_space());
            }
        }
    }
    (total, used)
}

/// Mountpoints the agent monitors (configured list or the auto-detected
/// physical ones).
pub fn mountpoint_list(cfg: &AgentConfig) -> Vec<String> {
    if !cfg.include_mountpoints.is_empty() {
        return cfg
            .include_mountpoints
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    let disks = Disks::new_with_refreshed_list();
    let mount_options = mount_options_table();
    disks
        .list()
        .iter()
        .filter(|d| {
            let mountpoint = d.mount_point().to_string_lossy();
            let options = mount_options
                .get(mountpoint.as_ref())
                .map(String::as_str)
                .unwrap_or("");
            is_physical_filesystem(
                &d.file_system().to_string_lossy(),
                &d.name().to_string_lossy(),
                &mountpoint,
                options,
            )
        })
        .map(|d| d.mount_point().to_string_lossy().into_owned())
        .collect()
}

/// Count processes. On Unix-like systems this counts numeric entries in
/// `/proc` (honoring the `HOST_PROC` override); elsewhere it falls back to
/// the platform enumeration sysinfo provides.
pub fn process_count(host_proc: Option<&str>) -> usize {
    #[cfg(unix)]
    {
        let proc_dir = host_proc
            .filter(|p| Path::new(p).is_dir())
            .unwrap_or("/proc");
        match std::fs::read_dir(proc_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.parse::<u64>().is_ok())
                })
                .count(),
            Err(_) => 0,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = host_proc;
        let mut sys = System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        sys.processes().len()
    }
}

/// (tcp, udp) connection counts from the kernel tables.
pub fn connections_count() -> (usize, usize) {
    #[cfg(target_os = "linux")]
    {
        let count = |path: &str| -> usize {
            std::fs::read_to_string(path)
                .map(|s| s.lines().count().saturating_sub(1))
                .unwrap_or(0)
        };
        let tcp = count("/proc/net/tcp") + count("/proc/net/tcp6");
        let udp = count("/proc/net/udp") + count("/proc/net/udp6");
        (tcp, udp)
    }
    #[cfg(not(target_os = "linux"))]
    {
        (0, 0)
    }
}

fn summed_counters(include: &HashSet<String>, exclude: &HashSet<String>) -> (u64, u64) {
    let mut up = 0u64;
    let mut down = 0u64;
    for (name, reading) in net_stats::kernel_counters() {
        if should_include_nic(&name, include, exclude) {
            up += reading.tx;
            down += reading.rx;
        }
    }
    (up, down)
}

/// Totals and instantaneous speeds over the monitored interfaces.
///
/// Speeds always come from two kernel counter reads one second apart.
/// Totals come from the traffic store window when monthly rotation is on,
/// otherwise from the second kernel read.
pub async fn network_speed(state: &AgentState) -> NetworkReport {
    let include = parse_nics(&state.cfg.include_nics);
    let exclude = parse_nics(&state.cfg.exclude_nics);

    let (up1, down1) = summed_counters(&include, &exclude);
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let (up2, down2) = summed_counters(&include, &exclude);

    let up_speed = safe_delta(up2, up1);
    let down_speed = safe_delta(down2, down1);

    let (total_up, total_down) = if state.cfg.month_rotate != 0 {
        // Idempotent; covers a store that was stopped or never started.
        let _ = state.traffic.start_or_continue();
        let now = OffsetDateTime::now_utc();
        let since = last_reset_date(state.cfg.month_rotate, now);
        let totals = state
            .traffic
            .total_between(since.unix_timestamp().max(0) as u64, now.unix_timestamp().max(0) as u64);
        let mut up = 0u64;
        let mut down = 0u64;
        for (name, total) in totals {
            if should_include_nic(&name, &include, &exclude) {
                up += total.tx;
                down += total.rx;
            }
        }
        (up, down)
    } else {
        (up2, down2)
    };

    NetworkReport {
        up: up_speed,
        down: down_speed,
        total_up,
        total_down,
    }
}

/// One coherent telemetry tick.
pub async fn collect_report(state: &AgentState) -> TelemetryReport {
    let (cpu, ram, swap) = {
        let mut sys = state.sys.lock().await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = CpuReport {
            usage: sys.global_cpu_usage(),
            per_core: sys.cpus().iter().map(|c| c.cpu_usage()).collect(),
        };
        let mem_total = sys.total_memory();
        let mem_used = if state.cfg.memory_include_cache {
            mem_total.saturating_sub(sys.free_memory())
        } else {
            mem_total.saturating_sub(sys.available_memory())
        };
        let ram = MemReport {
            total: mem_total,
            used: mem_used,
        };
        let swap = MemReport {
            total: sys.total_swap(),
            used: sys.used_swap(),
        };
        (cpu, ram, swap)
    };

    let (disk_total, disk_used) = disk_usage(&state.cfg);
    let load = System::load_average();
    let (tcp, udp) = connections_count();
    let network = network_speed(state).await;

    let gpu = if state.cfg.gpu {
        match gpu::collect() {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("gpu collection failed: {e}");
                None
            }
        }
    } else {
        None
    };

    TelemetryReport {
        message: "report",
        cpu,
        ram,
        swap,
        disk: DiskReport {
            total: disk_total,
            used: disk_used,
        },
        load: LoadReport {
            load1: load.one,
            load5: load.five,
            load15: load.fifteen,
        },
        network,
        connections: ConnectionsReport { tcp, udp },
        process: process_count(state.cfg.host_proc.as_deref()),
        uptime: System::uptime(),
        gpu,
        timestamp: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
    }
}
