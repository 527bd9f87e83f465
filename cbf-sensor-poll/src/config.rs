//! Poller configuration
//!
//! Handles:
//! - TOML file from `CBF_POLL_CONFIG` or the OS config directory
//! - Environment overrides (`CBF_KATCP`, `CBF_POLL_TIME`, `CBF_JSON_DUMPS`, `CBF_SENSOR_FILE`)
//! - Defaults when no file exists

use crate::error::{PollError, Result};
use crate::katcp::Endpoint;
use crate::retry::RetryPolicy;
use crate::snapshot::SnapshotWriter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "CBF_POLL_CONFIG";
pub const KATCP_ENV: &str = "CBF_KATCP";
pub const POLL_TIME_ENV: &str = "CBF_POLL_TIME";
pub const JSON_DUMPS_ENV: &str = "CBF_JSON_DUMPS";
pub const SENSOR_FILE_ENV: &str = "CBF_SENSOR_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Primary KATCP endpoint, `ip:port`
    pub katcp: Endpoint,
    pub poll_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// `json_dumps` next to the executable unless set
    pub json_dumps_dir: PathBuf,
    /// Replaces the computed `sensor_values.json` path
    pub sensor_file: Option<PathBuf>,
    /// Snapshot file prefix; the KATCP host when unset
    pub instrument_name: Option<String>,
    /// Passed to `?array-list` to restrict discovery to one array
    pub array_filter: Option<String>,
    pub discovery_workers: usize,
    pub connect_retry: RetryPolicy,
    pub discovery_backoff_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            katcp: Endpoint::new("10.103.254.6", 7147),
            poll_interval_secs: 10,
            connect_timeout_secs: 10,
            request_timeout_secs: 10,
            json_dumps_dir: default_dumps_dir(),
            sensor_file: None,
            instrument_name: None,
            array_filter: None,
            discovery_workers: 4,
            connect_retry: RetryPolicy::default(),
            discovery_backoff_secs: 60,
        }
    }
}

impl PollerConfig {
    /// Load from the configured location, then apply the process
    /// environment on top
    pub async fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };
        let mut config = Self::load_from(&path).await?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file gives the defaults; an unreadable or invalid one is an error
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: PollerConfig = toml::from_str(&content)
            .map_err(|e| PollError::Config(format!("{}: {e}", path.display())))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// OS-specific default location
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path =
            dirs::config_dir().ok_or_else(|| PollError::Config("could not find config directory".into()))?;
        path.push("cbf-sensor-poll");
        path.push("config.toml");
        Ok(path)
    }

    /// Apply overrides from `lookup` (the process environment in `load`)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(katcp) = lookup(KATCP_ENV) {
            self.katcp = katcp.parse()?;
        }
        if let Some(secs) = lookup(POLL_TIME_ENV) {
            self.poll_interval_secs = secs
                .trim()
                .parse()
                .map_err(|e| PollError::Config(format!("{POLL_TIME_ENV}={secs:?}: {e}")))?;
        }
        if let Some(dir) = lookup(JSON_DUMPS_ENV) {
            self.json_dumps_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup(SENSOR_FILE_ENV) {
            self.sensor_file = Some(PathBuf::from(file));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(PollError::Config("poll_interval_secs must be positive".into()));
        }
        if self.discovery_workers == 0 {
            return Err(PollError::Config("discovery_workers must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn discovery_backoff(&self) -> Duration {
        Duration::from_secs(self.discovery_backoff_secs)
    }

    pub fn instrument(&self) -> &str {
        self.instrument_name.as_deref().unwrap_or(&self.katcp.host)
    }

    /// `<instrument>.<array>`
    pub fn snapshot_prefix(&self, array_name: &str) -> String {
        format!("{}.{}", self.instrument(), array_name)
    }

    /// Writer for one of `array_count` monitored arrays. With several
    /// arrays the `sensor_file` override gets the array name inserted, so
    /// no two arrays share a file.
    pub fn snapshot_writer(&self, array_name: &str, array_count: usize) -> SnapshotWriter {
        let writer = SnapshotWriter::new(&self.json_dumps_dir, &self.snapshot_prefix(array_name));
        match &self.sensor_file {
            Some(file) if array_count > 1 => writer.with_sensor_file(per_array_file(file, array_name)),
            Some(file) => writer.with_sensor_file(file),
            None => writer,
        }
    }
}

fn default_dumps_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("json_dumps")))
        .unwrap_or_else(|| PathBuf::from("json_dumps"))
}

/// `cbf.sensor_values.json` -> `cbf.array0.sensor_values.json`,
/// `out.json` -> `out.array0.json`
fn per_array_file(file: &Path, array_name: &str) -> PathBuf {
    let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let renamed = match name.strip_suffix(".sensor_values.json") {
        Some(stem) => format!("{stem}.{array_name}.sensor_values.json"),
        None => match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{array_name}.{ext}"),
            _ => format!("{name}.{array_name}"),
        },
    };
    file.with_file_name(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.katcp.to_string(), "10.103.254.6:7147");
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.connect_retry.max_attempts, 3);
        assert_eq!(config.snapshot_prefix("array0"), "10.103.254.6.array0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_path() {
        if let Ok(path) = PollerConfig::config_file_path() {
            assert!(path.to_string_lossy().contains("cbf-sensor-poll"));
            assert!(path.ends_with("config.toml"));
        }
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PollerConfig::load_from(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config, PollerConfig::default());
    }

    #[tokio::test]
    async fn test_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
katcp = "127.0.0.1:7147"
poll_interval_secs = 5
instrument_name = "bc8n856M4k"

[connect_retry]
max_attempts = 5
backoff_secs = 1
"#,
        )
        .unwrap();

        let config = PollerConfig::load_from(&path).await.unwrap();
        assert_eq!(config.katcp, Endpoint::new("127.0.0.1", 7147));
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.connect_retry, RetryPolicy::new(5, Duration::from_secs(1)));
        assert_eq!(config.request_timeout_secs, 10);
        assert_eq!(config.snapshot_prefix("array0"), "bc8n856M4k.array0");
    }

    #[tokio::test]
    async fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "katcp = \"no-port\"\n").unwrap();
        assert!(matches!(PollerConfig::load_from(&path).await, Err(PollError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (KATCP_ENV, "192.168.1.10:7147"),
            (POLL_TIME_ENV, "3"),
            (JSON_DUMPS_ENV, "/tmp/dumps"),
            (SENSOR_FILE_ENV, "/srv/cbf.sensor_values.json"),
        ]
        .into_iter()
        .collect();

        let mut config = PollerConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.katcp.host, "192.168.1.10");
        assert_eq!(config.poll_interval_secs, 3);
        assert_eq!(config.json_dumps_dir, PathBuf::from("/tmp/dumps"));

        let writer = config.snapshot_writer("array0", 1);
        assert_eq!(writer.paths().sensor_values, PathBuf::from("/srv/cbf.sensor_values.json"));
        assert_eq!(
            writer.paths().ordered_sensor_values,
            PathBuf::from("/srv/cbf.ordered_sensor_values.json")
        );
    }

    #[test]
    fn test_sensor_file_is_split_per_array() {
        let config = PollerConfig {
            sensor_file: Some(PathBuf::from("/srv/cbf.sensor_values.json")),
            ..PollerConfig::default()
        };
        let first = config.snapshot_writer("array0", 2);
        let second = config.snapshot_writer("array1", 2);
        assert_ne!(first.paths(), second.paths());
        assert_eq!(first.paths().sensor_values, PathBuf::from("/srv/cbf.array0.sensor_values.json"));
        assert_eq!(
            second.paths().ordered_sensor_values,
            PathBuf::from("/srv/cbf.array1.ordered_sensor_values.json")
        );

        let plain = PollerConfig {
            sensor_file: Some(PathBuf::from("/srv/out.json")),
            ..PollerConfig::default()
        };
        assert_eq!(
            plain.snapshot_writer("array0", 3).paths().sensor_values,
            PathBuf::from("/srv/out.array0.json")
        );
    }

    #[test]
    fn test_default_dumps_dir_follows_executable() {
        let config = PollerConfig::default();
        assert!(config.json_dumps_dir.ends_with("json_dumps"));
        if let Ok(exe) = std::env::current_exe() {
            assert_eq!(Some(config.json_dumps_dir.as_path()), exe.parent().map(|d| d.join("json_dumps")).as_deref());
        }
    }

    #[test]
    fn test_bad_env_values() {
        let mut config = PollerConfig::default();
        assert!(config.apply_env(|k| (k == POLL_TIME_ENV).then(|| "soon".to_string())).is_err());
        assert!(config.apply_env(|k| (k == KATCP_ENV).then(|| "nohost".to_string())).is_err());

        config.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
