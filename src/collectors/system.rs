use crate::collectors::command::run_command;
use crate::config::ContainerConfig;
use crate::snapshot::{DiskIoCounters, NetIoCounters};
use serde::Serialize;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, ProcessExt, System, SystemExt};
use thiserror::Error;
use tracing::debug;

// Usage is the delta between two refreshes at least this far apart.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read control group file {path}: {source}")]
    Cgroup {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    Active,
    #[serde(rename = "Not Active")]
    NotActive,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Active => "Active",
            ServiceStatus::NotActive => "Not Active",
            ServiceStatus::Error => "Error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-level metric providers. Every method fails soft except container
/// detection, whose only failure is an unreadable control group file.
#[allow(async_fn_in_trait)]
pub trait HostProbe {
    async fn cpu_percent(&mut self) -> f64;
    fn memory_percent(&mut self) -> f64;
    /// `None` when the configured mount is not among the host's disks.
    fn disk_percent(&mut self) -> Option<f64>;
    fn disk_io_counters(&mut self) -> DiskIoCounters;
    fn net_io_counters(&mut self) -> NetIoCounters;
    fn is_containerized(&self) -> Result<bool, ProbeError>;
    fn hostname(&self) -> String;
    /// Worker count of the application server, `""` when no worker flag is found.
    fn worker_count(&mut self) -> String;
    fn load_average(&mut self) -> Option<f64>;
    fn uptime_secs(&self) -> u64;
    async fn service_status(&self, name: &str) -> ServiceStatus;
}

pub struct SysinfoProbe {
    system: System,
    cpu_refreshed_at: Instant,
    disk_mount: PathBuf,
    container: ContainerConfig,
    command_timeout: Duration,
}

impl SysinfoProbe {
    pub fn new(disk_mount: PathBuf, container: ContainerConfig, command_timeout: Duration) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            cpu_refreshed_at: Instant::now(),
            disk_mount,
            container,
            command_timeout,
        }
    }
}

impl HostProbe for SysinfoProbe {
    async fn cpu_percent(&mut self) -> f64 {
        let since = self.cpu_refreshed_at.elapsed();
        if since < CPU_SAMPLE_INTERVAL {
            tokio::time::sleep(CPU_SAMPLE_INTERVAL - since).await;
        }
        self.system.refresh_cpu();
        self.cpu_refreshed_at = Instant::now();
        self.system.global_cpu_info().cpu_usage() as f64
    }

    fn memory_percent(&mut self) -> f64 {
        self.system.refresh_memory();
        percent(self.system.used_memory(), self.system.total_memory())
    }

    fn disk_percent(&mut self) -> Option<f64> {
        self.system.refresh_disks_list();
        self.system.refresh_disks();
        let disk = self
            .system
            .disks()
            .iter()
            .find(|d| d.mount_point() == self.disk_mount.as_path());
        match disk {
            Some(d) => Some(disk_usage_percent(d.total_space(), d.available_space())),
            None => {
                debug!(mount = %self.disk_mount.display(), "mount not found among disks");
                None
            }
        }
    }

    fn disk_io_counters(&mut self) -> DiskIoCounters {
        collect_disk_io()
    }

    fn net_io_counters(&mut self) -> NetIoCounters {
        self.system.refresh_networks_list();
        self.system.refresh_networks();
        self.system
            .networks()
            .iter()
            .fold(NetIoCounters::default(), |mut acc, (_iface, data)| {
                acc.bytes_sent += data.total_transmitted();
                acc.bytes_recv += data.total_received();
                acc.packets_sent += data.total_packets_transmitted();
                acc.packets_recv += data.total_packets_received();
                acc.errin += data.total_errors_on_received();
                acc.errout += data.total_errors_on_transmitted();
                acc
            })
    }

    fn is_containerized(&self) -> Result<bool, ProbeError> {
        detect_container(&self.container)
    }

    fn hostname(&self) -> String {
        self.system
            .host_name()
            .map(|h| h.trim().to_string())
            .unwrap_or_default()
    }

    fn worker_count(&mut self) -> String {
        self.system.refresh_processes();
        let lines = gunicorn_command_lines(
            self.system
                .processes()
                .values()
                .map(|p| (p.pid(), p.name(), p.cmd())),
        );
        parse_worker_count(lines.iter().map(String::as_str))
    }

    fn load_average(&mut self) -> Option<f64> {
        let cores = self.system.cpus().len();
        normalized_load(self.system.load_average().five, cores)
    }

    fn uptime_secs(&self) -> u64 {
        self.system.uptime()
    }

    async fn service_status(&self, name: &str) -> ServiceStatus {
        let argv: Vec<String> = ["sudo", "-n", "service", name, "status"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match run_command(&argv, None, self.command_timeout).await {
            Ok(output) => classify_service_output(&output),
            Err(err) => {
                debug!(service = %name, error = %err, "service status check failed");
                ServiceStatus::Error
            }
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

/// Used share of a filesystem as `(total - available) / total`.
///
/// Blocks reserved for root count as used here, so on ext4 this reads about a
/// point higher than `df`, which divides by `used + available`. sysinfo does
/// not expose the free-block count needed for the `df` figure.
pub fn disk_usage_percent(total: u64, available: u64) -> f64 {
    percent(total.saturating_sub(available), total)
}

/// Command lines of gunicorn processes in ascending pid order, like a `ps` listing.
pub fn gunicorn_command_lines<'a, K: Ord>(
    processes: impl IntoIterator<Item = (K, &'a str, &'a [String])>,
) -> Vec<String> {
    let mut matching: Vec<(K, String)> = processes
        .into_iter()
        .filter(|(_, name, cmd)| {
            name.contains("gunicorn") || cmd.iter().any(|a| a.contains("gunicorn"))
        })
        .map(|(pid, _, cmd)| (pid, cmd.join(" ")))
        .collect();
    matching.sort_by(|a, b| a.0.cmp(&b.0));
    matching.into_iter().map(|(_, line)| line).collect()
}

/// Finds the worker count in process command lines: `-w N`, `-wN`,
/// `--workers N` or `--workers=N`.
pub fn parse_worker_count<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    for line in lines {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "-w" || token == "--workers" {
                if let Some(value) = tokens.next() {
                    return value.to_string();
                }
            } else if let Some(value) = token.strip_prefix("--workers=") {
                return value.to_string();
            } else if let Some(value) = token.strip_prefix("-w") {
                if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
                    return value.to_string();
                }
            }
        }
    }
    String::new()
}

/// Five-minute load average as a percentage of logical core capacity.
pub fn normalized_load(load: f64, cores: usize) -> Option<f64> {
    if cores == 0 || !load.is_finite() {
        return None;
    }
    Some(load * 100.0 / cores as f64)
}

pub fn classify_service_output(output: &str) -> ServiceStatus {
    if output.contains("running") {
        ServiceStatus::Active
    } else {
        ServiceStatus::NotActive
    }
}

pub fn detect_container(cfg: &ContainerConfig) -> Result<bool, ProbeError> {
    if cfg.marker_path.exists() {
        return Ok(true);
    }
    cgroup_mentions_runtime(&cfg.cgroup_path, &cfg.runtimes)
}

fn cgroup_mentions_runtime(path: &Path, runtimes: &[String]) -> Result<bool, ProbeError> {
    let text = std::fs::read_to_string(path).map_err(|source| ProbeError::Cgroup {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text
        .lines()
        .any(|line| runtimes.iter().any(|rt| line.contains(rt.as_str()))))
}

#[cfg(target_os = "linux")]
fn collect_disk_io() -> DiskIoCounters {
    let Ok(text) = fs::read_to_string("/proc/diskstats") else {
        return DiskIoCounters::default();
    };
    sum_diskstats(&text, |dev| Path::new("/sys/block").join(dev).exists())
}

#[cfg(not(target_os = "linux"))]
fn collect_disk_io() -> DiskIoCounters {
    DiskIoCounters::default()
}

/// Sums `/proc/diskstats` rows for whole devices, skipping loop and ram devices.
///
/// Format: major minor name reads r_merged r_sectors r_time writes w_merged w_sectors w_time ...
pub fn sum_diskstats(content: &str, is_whole_disk: impl Fn(&str) -> bool) -> DiskIoCounters {
    const SECTOR_BYTES: u64 = 512;

    let mut acc = DiskIoCounters::default();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }
        let device = parts[2];
        if device.starts_with("loop") || device.starts_with("ram") || !is_whole_disk(device) {
            continue;
        }
        let get_val = |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        acc.read_count += get_val(3);
        acc.read_bytes += get_val(5) * SECTOR_BYTES;
        acc.read_time_ms += get_val(6);
        acc.write_count += get_val(7);
        acc.write_bytes += get_val(9) * SECTOR_BYTES;
        acc.write_time_ms += get_val(10);
    }
    acc
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub hostname: String,
    pub containerized: Option<bool>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: Option<f64>,
    pub disk_io: DiskIoCounters,
    pub net_io: NetIoCounters,
    pub gunicorn_workers: String,
    pub load_average: Option<f64>,
    pub uptime_secs: u64,
    pub services: Vec<(String, ServiceStatus)>,
}

pub async fn probe_report<P: HostProbe>(probe: &mut P, services: &[String]) -> ProbeReport {
    let containerized = match probe.is_containerized() {
        Ok(v) => Some(v),
        Err(err) => {
            debug!(error = %err, "container detection failed");
            None
        }
    };
    let mut service_statuses = Vec::with_capacity(services.len());
    for name in services {
        let status = probe.service_status(name).await;
        debug!(service = %name, status = %status, "service probed");
        service_statuses.push((name.clone(), status));
    }

    ProbeReport {
        hostname: probe.hostname(),
        containerized,
        cpu_percent: probe.cpu_percent().await,
        memory_percent: probe.memory_percent(),
        disk_percent: probe.disk_percent(),
        disk_io: probe.disk_io_counters(),
        net_io: probe.net_io_counters(),
        gunicorn_workers: probe.worker_count(),
        load_average: probe.load_average(),
        uptime_secs: probe.uptime_secs(),
        services: service_statuses,
    }
}
