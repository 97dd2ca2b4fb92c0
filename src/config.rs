//! Configuration loader and validator for the sync daemon and CLI.
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Longest accepted retention for synced entries: a century.
pub const MAX_PURGE_AFTER_HOURS: u64 = 24 * 365 * 100;

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub probe_interval_ms: u64,
    /// Synced entries older than this are purged; 0 keeps them forever.
    #[serde(default)]
    pub purge_after_hours: u64,
}

/// Remote record API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub token: String,
    pub timeout_ms: u64,
    pub health_path: String,
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Retention in hours; `None` when synced entries are kept forever.
    pub fn retention_hours(&self) -> Option<u64> {
        (self.purge_after_hours > 0).then_some(self.purge_after_hours)
    }

    /// Age for an on-demand prune: an explicit override, else the retention.
    pub fn prune_hours(&self, older_than_hours: Option<u64>) -> Option<u64> {
        older_than_hours.or(self.retention_hours())
    }
}

/// Instant `hours` before `now`, or `None` when it falls outside chrono's range.
pub fn purge_cutoff(now: DateTime<Utc>, hours: u64) -> Option<DateTime<Utc>> {
    let hours = i64::try_from(hours).ok()?;
    now.checked_sub_signed(chrono::Duration::try_hours(hours)?)
}

impl Remote {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins over the file under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/farm-sync.db", self.app.resolved_data_dir())
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.probe_interval_ms must be > 0"));
    }
    if cfg.app.purge_after_hours > MAX_PURGE_AFTER_HOURS {
        return Err(ConfigError::Invalid(
            "app.purge_after_hours must be at most 876000 (100 years)",
        ));
    }

    let base = cfg.remote.base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if Url::parse(base).is_err() {
        return Err(ConfigError::Invalid("remote.base_url must be an absolute URL"));
    }
    // Url::join drops the last path segment unless the base ends with '/'.
    if !base.ends_with('/') {
        return Err(ConfigError::Invalid("remote.base_url must end with '/'"));
    }
    if cfg.remote.token.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.token must be non-empty"));
    }
    if cfg.remote.timeout_ms == 0 {
        return Err(ConfigError::Invalid("remote.timeout_ms must be > 0"));
    }
    if cfg.remote.health_path.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.health_path must be non-empty"));
    }

    Ok(())
}

/// Example configuration written by `farm-sync init`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  probe_interval_ms: 5000
  purge_after_hours: 72

remote:
  base_url: "https://api.example.com/"
  token: "YOUR_API_TOKEN"
  timeout_ms: 10000
  health_path: "v1/health"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.remote.timeout(), Duration::from_secs(10));
        assert_eq!(cfg.app.retention_hours(), Some(72));
    }

    #[test]
    fn purge_after_defaults_to_disabled() {
        let yaml = example().replace("  purge_after_hours: 72\n", "");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.app.purge_after_hours, 0);
        assert!(cfg.app.retention_hours().is_none());
    }

    #[test]
    fn prune_without_age_or_retention_is_skipped() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        assert_eq!(cfg.app.prune_hours(None), Some(72));
        assert_eq!(cfg.app.prune_hours(Some(0)), Some(0));

        cfg.app.purge_after_hours = 0;
        assert_eq!(cfg.app.prune_hours(None), None);
        assert_eq!(cfg.app.prune_hours(Some(24)), Some(24));
    }

    #[test]
    fn oversized_retention_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.purge_after_hours = 10_000_000_000;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.purge_after_hours")),
            _ => panic!("wrong error"),
        }

        cfg.app.purge_after_hours = MAX_PURGE_AFTER_HOURS;
        validate(&cfg).unwrap();
        assert!(purge_cutoff(Utc::now(), MAX_PURGE_AFTER_HOURS).is_some());
    }

    #[test]
    fn purge_cutoff_out_of_range_is_none() {
        let now = Utc::now();
        assert_eq!(purge_cutoff(now, 0), Some(now));
        assert_eq!(
            purge_cutoff(now, 72),
            Some(now - chrono::Duration::hours(72))
        );
        assert!(purge_cutoff(now, 10_000_000_000).is_none());
        assert!(purge_cutoff(now, 10_000_000_000_000_000).is_none());
        assert!(purge_cutoff(now, u64::MAX).is_none());
    }

    #[test]
    fn invalid_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remote.token = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("remote.token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_base_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remote.base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remote.base_url = "https://api.example.com/farm".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("end with '/'")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remote.timeout_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.probe_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.remote.health_path, "v1/health");
    }
}
