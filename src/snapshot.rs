use serde::Serialize;
use std::fmt;

pub const NOT_AVAILABLE: &str = "not available";
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Per-site part of a snapshot, before host metrics are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteData {
    pub db_name: String,
    pub site_size: String,
    pub gunicorn_processes: String,
    pub date_time: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskIoCounters {
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_time_ms: u64,
    pub write_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetIoCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
}

impl fmt::Display for DiskIoCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read_count={}, write_count={}, read_bytes={}, write_bytes={}, read_time={}, write_time={}",
            self.read_count,
            self.write_count,
            self.read_bytes,
            self.write_bytes,
            self.read_time_ms,
            self.write_time_ms
        )
    }
}

impl fmt::Display for NetIoCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes_sent={}, bytes_recv={}, packets_sent={}, packets_recv={}, errin={}, errout={}",
            self.bytes_sent,
            self.bytes_recv,
            self.packets_sent,
            self.packets_recv,
            self.errin,
            self.errout
        )
    }
}

/// Host I/O branch of a snapshot. Containers report where they run, bare hosts
/// report their I/O counters; never both.
#[derive(Debug, Clone, PartialEq)]
pub enum HostIo {
    Container {
        docker_container: String,
    },
    Bare {
        disk_io: DiskIoCounters,
        net_io: NetIoCounters,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub server_information: String,
    pub site: SiteData,
    pub host_io: HostIo,
    /// `None` when the disk could not be read; stored as `""`.
    pub disk_usage: Option<f64>,
    pub memory_usage: f64,
    pub cpu_usage: f64,
}

/// Flat, string-valued form of a snapshot as the dashboard stores it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub site_size: String,
    pub gunicorn_processes: String,
    pub date_time: String,
    pub is_bench_site: String,
    pub server_information: String,
    pub db_name: String,
    #[serde(flatten)]
    pub host_io: HostIoRecord,
    pub disk_usage: String,
    pub memory_usage: String,
    pub cpu_usage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostIoRecord {
    Container {
        docker_container: String,
        is_docker: String,
    },
    Bare {
        disk_io: String,
        net_io: String,
    },
}

impl HealthSnapshot {
    pub fn to_record(&self) -> SnapshotRecord {
        let host_io = match &self.host_io {
            HostIo::Container { docker_container } => HostIoRecord::Container {
                docker_container: docker_container.clone(),
                is_docker: "1".to_string(),
            },
            HostIo::Bare { disk_io, net_io } => HostIoRecord::Bare {
                disk_io: disk_io.to_string(),
                net_io: net_io.to_string(),
            },
        };

        SnapshotRecord {
            site_size: self.site.site_size.clone(),
            gunicorn_processes: self.site.gunicorn_processes.clone(),
            date_time: self.site.date_time.clone(),
            is_bench_site: "1".to_string(),
            server_information: self.server_information.clone(),
            db_name: self.site.db_name.clone(),
            host_io,
            disk_usage: self.disk_usage.map(format_percent).unwrap_or_default(),
            memory_usage: format_percent(self.memory_usage),
            cpu_usage: format_percent(self.cpu_usage),
        }
    }
}

pub fn format_percent(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.1}")
    } else {
        String::new()
    }
}

pub fn now_date_time() -> String {
    chrono::Local::now().format(DATE_TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn site() -> SiteData {
        SiteData {
            db_name: "_1bd3e0294da19198".to_string(),
            site_size: "120M".to_string(),
            gunicorn_processes: "4".to_string(),
            date_time: "2026-10-19 10:00:00".to_string(),
        }
    }

    fn snapshot(host_io: HostIo) -> HealthSnapshot {
        HealthSnapshot {
            server_information: "site-a.local".to_string(),
            site: site(),
            host_io,
            disk_usage: Some(41.26),
            memory_usage: 63.0,
            cpu_usage: 7.04,
        }
    }

    fn as_object(record: &SnapshotRecord) -> serde_json::Map<String, Value> {
        match serde_json::to_value(record).unwrap() {
            Value::Object(map) => map,
            other => panic!("record serialized to {other:?}"),
        }
    }

    #[test]
    fn container_record_has_docker_fields_only() {
        let record = snapshot(HostIo::Container {
            docker_container: "a1b2c3".to_string(),
        })
        .to_record();
        let map = as_object(&record);

        assert_eq!(map["docker_container"], "a1b2c3");
        assert_eq!(map["is_docker"], "1");
        assert!(!map.contains_key("disk_io"));
        assert!(!map.contains_key("net_io"));
    }

    #[test]
    fn bare_record_has_io_fields_only() {
        let record = snapshot(HostIo::Bare {
            disk_io: DiskIoCounters {
                read_count: 10,
                ..DiskIoCounters::default()
            },
            net_io: NetIoCounters {
                bytes_recv: 2048,
                ..NetIoCounters::default()
            },
        })
        .to_record();
        let map = as_object(&record);

        assert!(map["disk_io"].as_str().unwrap().contains("read_count=10"));
        assert!(map["net_io"].as_str().unwrap().contains("bytes_recv=2048"));
        assert!(!map.contains_key("docker_container"));
        assert!(!map.contains_key("is_docker"));
    }

    #[test]
    fn every_field_is_a_string() {
        let record = snapshot(HostIo::Container {
            docker_container: "a1b2c3".to_string(),
        })
        .to_record();
        let map = as_object(&record);

        assert!(map.values().all(Value::is_string));
        assert_eq!(map["is_bench_site"], "1");
        assert_eq!(map["disk_usage"], "41.3");
        assert_eq!(map["memory_usage"], "63.0");
        assert_eq!(map["cpu_usage"], "7.0");
        assert_eq!(map["server_information"], "site-a.local");
        assert!(!map.contains_key("doctype"));
    }

    #[test]
    fn unreadable_disk_is_stored_blank() {
        let mut snap = snapshot(HostIo::Container {
            docker_container: "a1b2c3".to_string(),
        });
        snap.disk_usage = None;
        let map = as_object(&snap.to_record());
        assert_eq!(map["disk_usage"], "");
    }

    #[test]
    fn non_finite_percent_is_blank() {
        assert_eq!(format_percent(f64::NAN), "");
        assert_eq!(format_percent(100.0), "100.0");
    }

    #[test]
    fn date_time_has_expected_shape() {
        let stamp = now_date_time();
        assert!(chrono::NaiveDateTime::parse_from_str(&stamp, DATE_TIME_FORMAT).is_ok());
        assert_eq!(stamp.len(), 19);
    }
}
