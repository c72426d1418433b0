use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_site_list_command")]
    pub site_list_command: Vec<String>,
    #[serde(default)]
    pub bench_dir: Option<PathBuf>,
    #[serde(default)]
    pub sites_root: Option<PathBuf>,
    #[serde(default = "default_search_root")]
    pub search_root: PathBuf,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
    #[serde(default)]
    pub process_all_sites: bool,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,
    #[serde(default)]
    pub container: ContainerConfig,
    pub publisher: PublisherConfig,
    #[serde(default = "default_services")]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerConfig {
    #[serde(default = "default_marker_path")]
    pub marker_path: PathBuf,
    #[serde(default = "default_cgroup_path")]
    pub cgroup_path: PathBuf,
    #[serde(default = "default_runtimes")]
    pub runtimes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    pub url: String,
    #[serde(default = "default_doctype")]
    pub doctype: String,
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default = "default_authorization_env")]
    pub authorization_env: String,
    #[serde(default = "default_publish_timeout")]
    pub timeout: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            marker_path: default_marker_path(),
            cgroup_path: default_cgroup_path(),
            runtimes: default_runtimes(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.site_list_command.is_empty() || self.site_list_command[0].trim().is_empty() {
            return Err(ConfigError::Validation(
                "site_list_command must name a program".to_string(),
            ));
        }
        if self.search_root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "search_root must not be empty".to_string(),
            ));
        }
        parse_positive_duration("command_timeout", &self.command_timeout)?;
        if self.container.runtimes.iter().any(|r| r.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "container.runtimes must not contain empty names".to_string(),
            ));
        }

        validate_publisher(&self.publisher)?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        humantime::parse_duration(self.command_timeout.trim())
            .unwrap_or_else(|_| Duration::from_secs(30))
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../resmon.yaml.example")
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        humantime::parse_duration(self.timeout.trim())
            .unwrap_or_else(|_| Duration::from_secs(10))
    }

    /// Environment variable wins over the inline value; blank values count as unset.
    pub fn resolve_authorization(&self) -> Result<String, ConfigError> {
        if let Ok(v) = std::env::var(&self.authorization_env) {
            if !v.trim().is_empty() {
                return Ok(v.trim().to_string());
            }
        }
        self.authorization
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "no publisher authorization: set '{}' in the environment or publisher.authorization in config",
                    self.authorization_env
                ))
            })
    }
}

fn validate_publisher(cfg: &PublisherConfig) -> Result<(), ConfigError> {
    if cfg.url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "publisher.url is required".to_string(),
        ));
    }
    let url = Url::parse(cfg.url.trim()).map_err(|err| {
        ConfigError::Validation(format!("publisher.url '{}' is not a valid URL: {err}", cfg.url))
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::Validation(format!(
            "publisher.url '{}' must use http or https",
            cfg.url
        )));
    }
    if cfg.doctype.trim().is_empty() {
        return Err(ConfigError::Validation(
            "publisher.doctype must not be empty".to_string(),
        ));
    }
    parse_positive_duration("publisher.timeout", &cfg.timeout)?;
    if cfg.retention_days < 1 {
        return Err(ConfigError::Validation(
            "publisher.retention_days must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn parse_positive_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    let parsed = humantime::parse_duration(value.trim()).map_err(|err| {
        ConfigError::Validation(format!("{field} '{value}' is not a duration: {err}"))
    })?;
    if parsed.is_zero() {
        return Err(ConfigError::Validation(format!("{field} must be > 0")));
    }
    Ok(parsed)
}

fn default_site_list_command() -> Vec<String> {
    ["bench", "--site", "all", "list-apps", "--format", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_search_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_command_timeout() -> String {
    "30s".to_string()
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_marker_path() -> PathBuf {
    PathBuf::from("/.dockerenv")
}

fn default_cgroup_path() -> PathBuf {
    PathBuf::from("/proc/self/cgroup")
}

fn default_runtimes() -> Vec<String> {
    ["docker", "containerd", "kubepods", "lxc", "podman"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_doctype() -> String {
    "Resource Monitor".to_string()
}

fn default_authorization_env() -> String {
    "RESMON_AUTHORIZATION".to_string()
}

fn default_publish_timeout() -> String {
    "10s".to_string()
}

const fn default_retention_days() -> u32 {
    7
}

fn default_services() -> Vec<String> {
    vec!["nginx".to_string(), "mysql".to_string()]
}
