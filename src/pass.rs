use crate::collectors::site::{collect_site, DiscoveryError, SiteConfigError, SiteDirectory};
use crate::collectors::system::HostProbe;
use crate::publisher::{publish, DocumentStore};
use crate::snapshot::{now_date_time, HealthSnapshot, HostIo};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[derive(Debug, Clone)]
pub struct PassOptions {
    pub doctype: String,
    /// Publish one record per resolvable site instead of stopping at the first.
    pub all_sites: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub discovered: usize,
    pub published: Vec<String>,
    pub unresolved: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Builds the snapshot for one site, or `None` when the site has no directory.
pub async fn assemble<D: SiteDirectory, P: HostProbe>(
    sites: &D,
    probe: &mut P,
    site_id: &str,
) -> Result<Option<HealthSnapshot>, SiteConfigError> {
    let Some(site_path) = sites.locate(site_id) else {
        return Ok(None);
    };
    debug!(site = %site_id, path = %site_path.display(), "site located");

    let mut site = collect_site(&site_path, probe)?;

    let containerized = match probe.is_containerized() {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "container detection failed, assuming bare host");
            false
        }
    };
    let host_io = if containerized {
        HostIo::Container {
            docker_container: probe.hostname(),
        }
    } else {
        HostIo::Bare {
            disk_io: probe.disk_io_counters(),
            net_io: probe.net_io_counters(),
        }
    };

    let disk_usage = probe.disk_percent();
    let memory_usage = probe.memory_percent();
    let cpu_usage = probe.cpu_percent().await;
    site.date_time = now_date_time();

    Ok(Some(HealthSnapshot {
        server_information: site_id.to_string(),
        site,
        host_io,
        disk_usage,
        memory_usage,
        cpu_usage,
    }))
}

/// One collection pass: discover sites, then assemble and publish snapshots.
pub async fn run<D, P, S>(
    sites: &D,
    probe: &mut P,
    store: &S,
    opts: &PassOptions,
) -> Result<PassReport, PassError>
where
    D: SiteDirectory,
    P: HostProbe,
    S: DocumentStore,
{
    let site_ids = sites.list_sites().await?;
    info!(count = site_ids.len(), "sites discovered");

    let mut report = PassReport {
        discovered: site_ids.len(),
        ..PassReport::default()
    };

    for site_id in site_ids {
        let snapshot = match assemble(sites, probe, &site_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(site = %site_id, "site directory not found");
                report.unresolved.push(site_id);
                continue;
            }
            Err(err) => {
                warn!(site = %site_id, error = %err, "skipping site with unreadable config");
                report.skipped.push(site_id);
                continue;
            }
        };

        match publish(store, &opts.doctype, &snapshot).await {
            Ok(_status) => report.published.push(site_id),
            Err(err) => {
                error!(site = %site_id, error = %err, "failed to publish snapshot");
                report.failed.push(site_id);
            }
        }

        if !opts.all_sites {
            break;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::FakeProbe;
    use crate::collectors::site::SITE_CONFIG_FILE;
    use crate::publisher::{Document, PublishError};
    use crate::snapshot::{DiskIoCounters, NetIoCounters};
    use chrono::NaiveDateTime;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeSites {
        listed: Result<Vec<String>, ()>,
        dirs: HashMap<String, PathBuf>,
        located: Mutex<Vec<String>>,
        _root: TempDir,
    }

    impl FakeSites {
        /// `resolvable` sites get a directory with a `site_config.json`.
        fn new(listed: &[&str], resolvable: &[(&str, Option<&str>)]) -> Self {
            let root = tempfile::tempdir().unwrap();
            let mut dirs = HashMap::new();
            for (site, config) in resolvable {
                let dir = root.path().join(site);
                std::fs::create_dir_all(&dir).unwrap();
                if let Some(config) = config {
                    std::fs::write(dir.join(SITE_CONFIG_FILE), config).unwrap();
                }
                dirs.insert(site.to_string(), dir);
            }
            Self {
                listed: Ok(listed.iter().map(|s| s.to_string()).collect()),
                dirs,
                located: Mutex::new(Vec::new()),
                _root: root,
            }
        }
    }

    impl SiteDirectory for FakeSites {
        async fn list_sites(&self) -> Result<Vec<String>, DiscoveryError> {
            match &self.listed {
                Ok(list) => Ok(list.clone()),
                Err(()) => Err(DiscoveryError::NotAnObject),
            }
        }

        fn locate(&self, site_id: &str) -> Option<PathBuf> {
            self.located.lock().unwrap().push(site_id.to_string());
            self.dirs.get(site_id).cloned()
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        docs: Mutex<Vec<Value>>,
        reject: bool,
    }

    impl DocumentStore for RecordingStore {
        async fn insert(&self, doc: &Document<'_>) -> Result<u16, PublishError> {
            if self.reject {
                return Err(PublishError::Url("rejected".to_string()));
            }
            self.docs
                .lock()
                .unwrap()
                .push(serde_json::to_value(doc).unwrap());
            Ok(200)
        }

        async fn delete_older_than(
            &self,
            _doctype: &str,
            _cutoff: NaiveDateTime,
        ) -> Result<usize, PublishError> {
            Ok(0)
        }
    }

    fn opts(all_sites: bool) -> PassOptions {
        PassOptions {
            doctype: "Resource Monitor".to_string(),
            all_sites,
        }
    }

    fn bare_probe() -> FakeProbe {
        FakeProbe {
            containerized: Some(false),
            hostname: "bench-01".to_string(),
            workers: "4".to_string(),
            cpu: 12.0,
            memory: 48.5,
            disk: Some(70.25),
            disk_io: DiskIoCounters {
                read_count: 7,
                ..DiskIoCounters::default()
            },
            net_io: NetIoCounters {
                bytes_sent: 99,
                ..NetIoCounters::default()
            },
        }
    }

    const DB_CONFIG: &str = r#"{"db_name": "_b_db"}"#;

    #[tokio::test]
    async fn first_resolvable_site_only() {
        let sites = FakeSites::new(&["a", "b", "c"], &[("b", Some(DB_CONFIG)), ("c", None)]);
        let store = RecordingStore::default();
        let mut probe = bare_probe();

        let report = run(&sites, &mut probe, &store, &opts(false)).await.unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(report.published, vec!["b"]);
        assert_eq!(report.unresolved, vec!["a"]);
        assert_eq!(*sites.located.lock().unwrap(), vec!["a", "b"]);

        let docs = store.docs.lock().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["server_information"], "b");
        assert_eq!(docs[0]["db_name"], "_b_db");
        assert_eq!(docs[0]["doctype"], "Resource Monitor");
        assert_eq!(docs[0]["gunicorn_processes"], "4");
        assert_eq!(docs[0]["cpu_usage"], "12.0");
        assert_eq!(docs[0]["memory_usage"], "48.5");
    }

    #[tokio::test]
    async fn all_sites_mode_publishes_each_resolvable_site() {
        let sites = FakeSites::new(
            &["a", "b", "c"],
            &[("a", Some(DB_CONFIG)), ("c", None)],
        );
        let store = RecordingStore::default();
        let mut probe = bare_probe();

        let report = run(&sites, &mut probe, &store, &opts(true)).await.unwrap();

        assert_eq!(report.published, vec!["a", "c"]);
        assert_eq!(report.unresolved, vec!["b"]);
        let docs = store.docs.lock().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["db_name"], "not available");
    }

    #[tokio::test]
    async fn no_matching_site_is_still_success() {
        let sites = FakeSites::new(&["a", "b"], &[]);
        let store = RecordingStore::default();
        let mut probe = bare_probe();

        let report = run(&sites, &mut probe, &store, &opts(false)).await.unwrap();

        assert!(report.published.is_empty());
        assert_eq!(report.unresolved, vec!["a", "b"]);
        assert!(store.docs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_config_skips_site_and_continues() {
        let sites = FakeSites::new(
            &["a", "b"],
            &[("a", Some("{ not json")), ("b", Some(DB_CONFIG))],
        );
        let store = RecordingStore::default();
        let mut probe = bare_probe();

        let report = run(&sites, &mut probe, &store, &opts(false)).await.unwrap();

        assert_eq!(report.skipped, vec!["a"]);
        assert_eq!(report.published, vec!["b"]);
    }

    #[tokio::test]
    async fn discovery_failure_aborts_pass() {
        let mut sites = FakeSites::new(&[], &[]);
        sites.listed = Err(());
        let store = RecordingStore::default();
        let mut probe = bare_probe();

        let res = run(&sites, &mut probe, &store, &opts(false)).await;
        assert!(matches!(res, Err(PassError::Discovery(_))));
    }

    #[tokio::test]
    async fn publish_failure_is_reported_not_fatal() {
        let sites = FakeSites::new(&["a", "b"], &[("a", None), ("b", None)]);
        let store = RecordingStore {
            reject: true,
            ..RecordingStore::default()
        };
        let mut probe = bare_probe();

        let report = run(&sites, &mut probe, &store, &opts(true)).await.unwrap();
        assert_eq!(report.failed, vec!["a", "b"]);
        assert!(report.published.is_empty());
    }

    #[tokio::test]
    async fn bare_host_snapshot_carries_io_counters() {
        let sites = FakeSites::new(&["a"], &[("a", None)]);
        let mut probe = bare_probe();

        let snap = assemble(&sites, &mut probe, "a").await.unwrap().unwrap();
        assert_eq!(
            snap.host_io,
            HostIo::Bare {
                disk_io: probe.disk_io,
                net_io: probe.net_io,
            }
        );
        let record = serde_json::to_value(snap.to_record()).unwrap();
        assert!(record.get("disk_io").is_some());
        assert!(record.get("net_io").is_some());
        assert!(record.get("docker_container").is_none());
        assert!(record.get("is_docker").is_none());
    }

    #[tokio::test]
    async fn container_snapshot_carries_hostname() {
        let sites = FakeSites::new(&["a"], &[("a", None)]);
        let mut probe = FakeProbe {
            containerized: Some(true),
            ..bare_probe()
        };

        let snap = assemble(&sites, &mut probe, "a").await.unwrap().unwrap();
        assert_eq!(
            snap.host_io,
            HostIo::Container {
                docker_container: "bench-01".to_string(),
            }
        );
        let record = serde_json::to_value(snap.to_record()).unwrap();
        assert_eq!(record["docker_container"], "bench-01");
        assert_eq!(record["is_docker"], "1");
        assert!(record.get("disk_io").is_none());
        assert!(record.get("net_io").is_none());
    }

    #[tokio::test]
    async fn unreadable_cgroup_falls_back_to_bare_host() {
        let sites = FakeSites::new(&["a"], &[("a", None)]);
        let mut probe = FakeProbe {
            containerized: None,
            ..bare_probe()
        };

        let snap = assemble(&sites, &mut probe, "a").await.unwrap().unwrap();
        assert!(matches!(snap.host_io, HostIo::Bare { .. }));
    }

    #[tokio::test]
    async fn missing_disk_mount_records_blank_disk_usage() {
        let sites = FakeSites::new(&["a"], &[("a", None)]);
        let store = RecordingStore::default();
        let mut probe = FakeProbe {
            disk: None,
            ..bare_probe()
        };

        let report = run(&sites, &mut probe, &store, &opts(false)).await.unwrap();
        assert_eq!(report.published, vec!["a"]);
        let docs = store.docs.lock().unwrap();
        assert_eq!(docs[0]["disk_usage"], "");
        assert_eq!(docs[0]["memory_usage"], "48.5");
    }

    #[tokio::test]
    async fn unresolvable_site_yields_no_snapshot() {
        let sites = FakeSites::new(&["a"], &[]);
        let mut probe = bare_probe();
        assert!(assemble(&sites, &mut probe, "a").await.unwrap().is_none());
    }
}
