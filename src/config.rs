use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{SchedulerError, SchedulerResult};

const DEFAULT_BROKER_CONFIG_PATH: &str = "configs/broker.toml";
const DEFAULT_WORKER_CONFIG_PATH: &str = "configs/worker.toml";

/// Default KVS database when the address carries no `/DB` suffix.
pub const DEFAULT_KVS_DB: i64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen port for the submission/query API.
    pub port: u16,
    /// KVS address, `host:port` with an optional `/DB` suffix.
    pub kvs_addr: String,
    /// Log file path; empty logs to stderr.
    pub log_path: String,
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 9595,
            kvs_addr: "127.0.0.1:6379".to_string(),
            log_path: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        load_config(DEFAULT_BROKER_CONFIG_PATH, path)
            .context("invalid broker configuration")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// KVS address, `host:port` with an optional `/DB` suffix.
    pub kvs_addr: String,
    /// Log file path; empty logs to stderr.
    pub log_path: String,
    pub log_level: String,
    /// Root directory script targets are resolved under.
    pub bin_path: String,
    /// Seconds to sleep between task claims; zero disables throttling.
    pub period: u64,
    /// TTL in seconds applied to result hashes.
    pub result_keep_time: u64,
    /// Default per-attempt timeout in seconds when a task carries none.
    pub task_run_time: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kvs_addr: "127.0.0.1:6379".to_string(),
            log_path: String::new(),
            log_level: "info".to_string(),
            bin_path: "./bin".to_string(),
            period: 0,
            result_keep_time: 3600,
            task_run_time: 60,
        }
    }
}

impl WorkerConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        load_config(DEFAULT_WORKER_CONFIG_PATH, path)
            .context("invalid worker configuration")
    }
}

fn load_config<T, P>(default_path: &str, path: Option<P>) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let mut builder = Config::builder().add_source(
        File::from(PathBuf::from(default_path))
            .format(FileFormat::Toml)
            .required(false),
    );

    if let Some(path) = path {
        builder = builder.add_source(
            File::from(path.as_ref())
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("TASKWHEEL").separator("__"));

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

/// Split a KVS address into `host:port` and database number.
///
/// Accepts `host:port` or `host:port/DB`; a non-numeric suffix is rejected.
pub fn split_kvs_addr(addr: &str) -> SchedulerResult<(String, i64)> {
    match addr.split_once('/') {
        None => Ok((addr.to_string(), DEFAULT_KVS_DB)),
        Some((host, db)) => {
            let db = db.parse().map_err(|_| SchedulerError::InvalidArgument)?;
            Ok((host.to_string(), db))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn broker_defaults() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.port, 9595);
        assert_eq!(cfg.kvs_addr, "127.0.0.1:6379");
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn worker_defaults() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.period, 0);
        assert_eq!(cfg.result_keep_time, 3600);
        assert_eq!(cfg.task_run_time, 60);
    }

    #[test]
    fn split_addr_without_db() {
        let (host, db) = split_kvs_addr("10.0.0.5:6379").unwrap();
        assert_eq!(host, "10.0.0.5:6379");
        assert_eq!(db, DEFAULT_KVS_DB);
    }

    #[test]
    fn split_addr_with_db() {
        let (host, db) = split_kvs_addr("10.0.0.5:6379/3").unwrap();
        assert_eq!(host, "10.0.0.5:6379");
        assert_eq!(db, 3);
    }

    #[test]
    fn split_addr_rejects_garbage_db() {
        assert!(split_kvs_addr("10.0.0.5:6379/three").is_err());
    }

    #[test]
    fn load_worker_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "kvs_addr = \"redis.internal:6379/1\"\nbin_path = \"/opt/tasks\"\nperiod = 2"
        )
        .unwrap();

        let cfg = WorkerConfig::load_from_path(Some(file.path())).unwrap();
        assert_eq!(cfg.kvs_addr, "redis.internal:6379/1");
        assert_eq!(cfg.bin_path, "/opt/tasks");
        assert_eq!(cfg.period, 2);
        // Unspecified keys keep their defaults.
        assert_eq!(cfg.task_run_time, 60);
    }
}
