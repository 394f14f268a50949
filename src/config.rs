//! Configuration management with YAML support

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::queue::MAX_RETRY_DELAY_SECS;

const MAX_SHUTDOWN_GRACE_SECS: u64 = 24 * 3600;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub fetch: FetchConfig,
}

/// Where captures, artifacts and logs live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,

    /// Overrides for individual locations; `None` derives from `root`
    #[serde(default)]
    pub captures_dir: Option<String>,
    #[serde(default)]
    pub backup_dir: Option<String>,
    #[serde(default)]
    pub metadata_dir: Option<String>,
    #[serde(default)]
    pub content_dir: Option<String>,
    #[serde(default)]
    pub logs_dir: Option<String>,
    #[serde(default)]
    pub queue_file: Option<String>,
    #[serde(default)]
    pub content_db: Option<String>,
}

/// Retry and staleness policy for the processing queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Items processing longer than this are reported as stuck
    #[serde(default = "default_max_processing_minutes")]
    pub max_processing_minutes: i64,

    /// Default threshold for the stale-item sweep
    #[serde(default = "default_stale_item_hours")]
    pub stale_item_hours: f64,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Restrict this pool to some item types
    #[serde(default)]
    pub item_types: Option<Vec<String>>,

    #[serde(default = "default_processor_id")]
    pub processor_id: String,
}

/// Failure notification channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_enabled")]
    pub desktop: bool,

    #[serde(default = "default_enabled")]
    pub console: bool,

    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
}

/// HTTP fetch settings used by the article handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

// Default value functions
fn default_storage_root() -> String {
    "~/.local/share/capturekeep".to_string()
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> u64 {
    3600
}

fn default_max_processing_minutes() -> i64 {
    30
}

fn default_stale_item_hours() -> f64 {
    2.0
}

fn default_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_processor_id() -> String {
    "worker".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_log_retention_days() -> i64 {
    30
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("capturekeep/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            captures_dir: None,
            backup_dir: None,
            metadata_dir: None,
            content_dir: None,
            logs_dir: None,
            queue_file: None,
            content_db: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            base_delay_secs: default_base_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_secs: default_max_delay_secs(),
            max_processing_minutes: default_max_processing_minutes(),
            stale_item_hours: default_stale_item_hours(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            item_types: None,
            processor_id: default_processor_id(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            desktop: true,
            console: true,
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

impl StorageConfig {
    fn resolve(&self, custom: &Option<String>, default_name: &str) -> PathBuf {
        match custom {
            Some(p) => expand(p),
            None => self.root_path().join(default_name),
        }
    }

    pub fn root_path(&self) -> PathBuf {
        expand(&self.root)
    }

    pub fn captures_path(&self) -> PathBuf {
        self.resolve(&self.captures_dir, "captures")
    }

    pub fn backup_path(&self) -> PathBuf {
        self.resolve(&self.backup_dir, "backup")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.resolve(&self.metadata_dir, "metadata")
    }

    pub fn content_path(&self) -> PathBuf {
        self.resolve(&self.content_dir, "content")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.resolve(&self.logs_dir, "logs")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.resolve(&self.queue_file, "queue.json")
    }

    pub fn content_db_path(&self) -> PathBuf {
        self.resolve(&self.content_db, "content.db")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.logs_path().join("capture_audit.jsonl")
    }

    pub fn failure_log_path(&self) -> PathBuf {
        self.logs_path().join("failures.jsonl")
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./capturekeep.yaml (current directory)
    /// 3. ~/.config/capturekeep/capturekeep.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "capturekeep.yaml".to_string(),
            shellexpand::tilde("~/.config/capturekeep/capturekeep.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)
                    .with_context(|| format!("Failed to read config file: {}", search_path))?;
                let config: Config = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", search_path))?;
                config.validate()?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Configuration rooted at a single directory, used by tests and embedders
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let mut config = Config::default();
        config.storage.root = root.to_string_lossy().to_string();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.processor.workers == 0 {
            bail!("processor.workers must be >= 1");
        }
        if self.queue.max_retry_attempts == 0 {
            bail!("queue.max_retry_attempts must be >= 1");
        }
        if self.queue.backoff_multiplier < 1.0 {
            bail!("queue.backoff_multiplier must be >= 1.0");
        }
        if self.queue.max_delay_secs < self.queue.base_delay_secs {
            bail!("queue.max_delay_secs must be >= queue.base_delay_secs");
        }
        if self.queue.max_delay_secs > MAX_RETRY_DELAY_SECS {
            bail!("queue.max_delay_secs must be <= {}", MAX_RETRY_DELAY_SECS);
        }
        if self.processor.shutdown_grace_secs > MAX_SHUTDOWN_GRACE_SECS {
            bail!("processor.shutdown_grace_secs must be <= {}", MAX_SHUTDOWN_GRACE_SECS);
        }
        if self.queue.max_processing_minutes < 0 {
            bail!("queue.max_processing_minutes must be >= 0");
        }
        if let Err(e) = check_hours(self.queue.stale_item_hours) {
            bail!("queue.stale_item_hours {}", e);
        }
        if let Err(e) = check_days(self.notifier.log_retention_days) {
            bail!("notifier.log_retention_days {}", e);
        }
        Ok(())
    }
}

fn check_hours(hours: f64) -> std::result::Result<f64, String> {
    if hours.is_finite() && hours >= 0.0 {
        Ok(hours)
    } else {
        Err(format!("must be a finite number >= 0, got {}", hours))
    }
}

fn check_days(days: i64) -> std::result::Result<i64, String> {
    if days >= 0 {
        Ok(days)
    } else {
        Err(format!("must be >= 0, got {}", days))
    }
}

/// Command-line parser for an age in hours
pub fn parse_hours(s: &str) -> std::result::Result<f64, String> {
    let hours: f64 = s.trim().parse().map_err(|e| format!("{}", e))?;
    check_hours(hours)
}

/// Command-line parser for a retention in days
pub fn parse_days(s: &str) -> std::result::Result<i64, String> {
    let days: i64 = s.trim().parse().map_err(|e| format!("{}", e))?;
    check_days(days)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.max_retry_attempts, 3);
        assert_eq!(config.queue.backoff_multiplier, 2.0);
        assert_eq!(config.processor.workers, 2);
        assert!(config.notifier.desktop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_paths_follow_root() {
        let config = Config::with_root("/tmp/ck");
        assert_eq!(config.storage.queue_path(), PathBuf::from("/tmp/ck/queue.json"));
        assert_eq!(config.storage.backup_path(), PathBuf::from("/tmp/ck/backup"));
        assert_eq!(
            config.storage.failure_log_path(),
            PathBuf::from("/tmp/ck/logs/failures.jsonl")
        );
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = Config::default();
        config.queue.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.processor.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        for stale in [-1.0, f64::NAN, f64::INFINITY] {
            let mut config = Config::default();
            config.queue.stale_item_hours = stale;
            assert!(config.validate().is_err(), "stale_item_hours {}", stale);
        }

        let mut config = Config::default();
        config.queue.max_processing_minutes = -5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.notifier.log_retention_days = -1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.max_delay_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.processor.shutdown_grace_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_duration_parsers() {
        assert_eq!(parse_hours("1.5"), Ok(1.5));
        assert_eq!(parse_hours("0"), Ok(0.0));
        assert!(parse_hours("-2").is_err());
        assert!(parse_hours("NaN").is_err());
        assert!(parse_hours("inf").is_err());
        assert!(parse_hours("soon").is_err());

        assert_eq!(parse_days("30"), Ok(30));
        assert!(parse_days("-1").is_err());
        assert!(parse_days("1.5").is_err());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
storage:
  root: /srv/capture
  backup_dir: /mnt/backup/capture

queue:
  max_retry_attempts: 5
  base_delay_secs: 10

processor:
  workers: 4
  item_types: [url, text]

notifier:
  desktop: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.root, "/srv/capture");
        assert_eq!(config.storage.backup_path(), PathBuf::from("/mnt/backup/capture"));
        assert_eq!(config.storage.captures_path(), PathBuf::from("/srv/capture/captures"));
        assert_eq!(config.queue.max_retry_attempts, 5);
        assert_eq!(config.queue.max_delay_secs, 3600);
        assert_eq!(config.processor.workers, 4);
        assert_eq!(
            config.processor.item_types,
            Some(vec!["url".to_string(), "text".to_string()])
        );
        assert!(!config.notifier.desktop);
        assert!(config.notifier.console);
    }
}
