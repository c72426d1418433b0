use crate::collectors::command::{run_command, CommandError};
use crate::collectors::system::HostProbe;
use crate::config::Config;
use crate::snapshot::{now_date_time, SiteData, NOT_AVAILABLE};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const SITE_CONFIG_FILE: &str = "site_config.json";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("site list command failed: {0}")]
    Command(#[from] CommandError),
    #[error("site list is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("site list must be a JSON object keyed by site name")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum SiteConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Where sites come from and where they live on disk.
#[allow(async_fn_in_trait)]
pub trait SiteDirectory {
    async fn list_sites(&self) -> Result<Vec<String>, DiscoveryError>;
    fn locate(&self, site_id: &str) -> Option<PathBuf>;
}

pub struct BenchSites {
    command: Vec<String>,
    bench_dir: Option<PathBuf>,
    sites_root: Option<PathBuf>,
    search_root: PathBuf,
    timeout: Duration,
}

impl BenchSites {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            command: cfg.site_list_command.clone(),
            bench_dir: cfg.bench_dir.clone(),
            sites_root: cfg.sites_root.clone(),
            search_root: cfg.search_root.clone(),
            timeout: cfg.command_timeout(),
        }
    }
}

impl SiteDirectory for BenchSites {
    async fn list_sites(&self) -> Result<Vec<String>, DiscoveryError> {
        let stdout = run_command(&self.command, self.bench_dir.as_deref(), self.timeout).await?;
        parse_site_list(&stdout)
    }

    fn locate(&self, site_id: &str) -> Option<PathBuf> {
        match &self.sites_root {
            Some(root) => locate_in_root(root, site_id),
            None => locate_by_walk(&self.search_root, site_id),
        }
    }
}

/// Top-level keys of `{"site": [apps...], ...}`, in document order.
pub fn parse_site_list(text: &str) -> Result<Vec<String>, DiscoveryError> {
    match serde_json::from_str::<Value>(text.trim())? {
        Value::Object(map) => Ok(map.keys().cloned().collect()),
        _ => Err(DiscoveryError::NotAnObject),
    }
}

pub fn locate_in_root(root: &Path, site_id: &str) -> Option<PathBuf> {
    if site_id.is_empty() || site_id.contains('/') || site_id == "." || site_id == ".." {
        return None;
    }
    let candidate = root.join(site_id);
    candidate.is_dir().then_some(candidate)
}

/// Depth-first walk from `root`; each directory's children are checked for
/// `site_id` before descending. A symlink to a directory can match by name
/// but is never descended into.
pub fn locate_by_walk(root: &Path, site_id: &str) -> Option<PathBuf> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        // (path, name matches, real directory)
        let mut children: Vec<(PathBuf, bool, bool)> = entries
            .flatten()
            .filter_map(|e| {
                let file_type = e.file_type().ok()?;
                let path = e.path();
                let is_real_dir = file_type.is_dir();
                let is_dir_link = file_type.is_symlink()
                    && fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
                if !is_real_dir && !is_dir_link {
                    return None;
                }
                Some((path, e.file_name() == site_id, is_real_dir))
            })
            .collect();
        children.sort();

        if let Some((found, _, _)) = children.iter().find(|(_, matches, _)| *matches) {
            return Some(found.clone());
        }
        pending.extend(
            children
                .into_iter()
                .rev()
                .filter(|(_, _, descend)| *descend)
                .map(|(path, _, _)| path),
        );
    }
    None
}

/// Reads `db_name` from the site's config file. A missing file or key yields
/// the sentinel; an unreadable or malformed file is an error.
pub fn read_db_name(site_path: &Path) -> Result<String, SiteConfigError> {
    let path = site_path.join(SITE_CONFIG_FILE);
    let path_display = path.display().to_string();
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path_display, "site config missing");
            return Ok(NOT_AVAILABLE.to_string());
        }
        Err(source) => {
            return Err(SiteConfigError::Read {
                path: path_display,
                source,
            })
        }
    };

    let value: Value = serde_json::from_str(&text).map_err(|source| SiteConfigError::Parse {
        path: path_display,
        source,
    })?;
    Ok(match value.get("db_name") {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Null) | None => NOT_AVAILABLE.to_string(),
        Some(other) => other.to_string(),
    })
}

pub fn collect_site<P: HostProbe>(
    site_path: &Path,
    probe: &mut P,
) -> Result<SiteData, SiteConfigError> {
    let db_name = read_db_name(site_path)?;
    let site_size = match apparent_size(site_path) {
        Ok(bytes) => human_size(bytes),
        Err(err) => {
            debug!(path = %site_path.display(), error = %err, "site size unavailable");
            String::new()
        }
    };

    Ok(SiteData {
        db_name,
        site_size,
        gunicorn_processes: probe.worker_count(),
        date_time: now_date_time(),
    })
}

/// Sum of file lengths below `path`, not following symlinks. Unreadable
/// entries below the root are skipped; an unreadable root is an error.
pub fn apparent_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = meta.len();
    let mut pending = vec![path.to_path_buf()];
    let mut root = true;
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if root => return Err(err),
            Err(_) => continue,
        };
        root = false;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            total += meta.len();
            if meta.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(total)
}

/// Renders a byte count the way `du -h` does: powers of 1024, rounded up,
/// one decimal below 10.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["K", "M", "G", "T", "P", "E"];

    if bytes < 1024 {
        return bytes.to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    value /= 1024.0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }

    if value < 10.0 {
        let tenths = (value * 10.0).ceil() / 10.0;
        if tenths >= 10.0 {
            return format!("10{}", UNITS[unit]);
        }
        format!("{tenths:.1}{}", UNITS[unit])
    } else {
        let whole = value.ceil();
        if whole >= 1024.0 && unit + 1 < UNITS.len() {
            return format!("1.0{}", UNITS[unit + 1]);
        }
        format!("{whole:.0}{}", UNITS[unit])
    }
}
