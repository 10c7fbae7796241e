// src/config/mod.rs
// Notifier configuration: TOML file first, environment variables on top

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{NotifierError, NotifierResult};
use crate::parser::LogLevel;

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "log-notifier.toml";

/// Upper bound for the dedup and rate-limit windows (one year)
pub const MAX_WINDOW_MINUTES: i64 = 60 * 24 * 365;

/// Upper bound for `retention_days` (a century)
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub debug: bool,
    /// Environment tag used when an entry does not carry one
    pub environment: String,
    pub database_url: String,
    /// Levels that are ingested; everything else is dropped by the parser
    pub levels: Vec<LogLevel>,
    pub check_interval_secs: u64,
    /// Records older than this are purged by the retention sweep; 0 keeps them forever
    pub retention_days: i64,
    pub logs: LogsConfig,
    pub dedup: DedupConfig,
    pub masking: MaskingConfig,
    pub rate_limit: RateLimitConfig,
    pub stream: StreamConfig,
    pub notification: NotificationConfig,
    pub server: ServerConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            environment: "production".to_string(),
            database_url: "sqlite:log-notifier.db".to_string(),
            levels: LogLevel::DEFAULT_MONITORED.to_vec(),
            check_interval_secs: 10,
            retention_days: 30,
            logs: LogsConfig::default(),
            dedup: DedupConfig::default(),
            masking: MaskingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            stream: StreamConfig::default(),
            notification: NotificationConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// A single log file, or a directory when `scan_all` is set
    pub path: PathBuf,
    /// Watch every matching file in `path` instead of exactly `path`
    pub scan_all: bool,
    /// File extension picked up in directory mode
    pub extension: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("storage/logs"),
            scan_all: true,
            extension: "log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub window_minutes: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskRuleConfig {
    pub pattern: String,
    /// Falls back to `MaskingConfig::replacement`
    #[serde(default)]
    pub replacement: Option<String>,
}

impl MaskRuleConfig {
    fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            replacement: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    pub replacement: String,
    /// Applied in order to messages and traces
    pub rules: Vec<MaskRuleConfig>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            replacement: "[REDACTED]".to_string(),
            rules: vec![
                MaskRuleConfig::new(r#"(?i)password["']?\s*[=:]\s*["']?[^"'&\s]+"#),
                MaskRuleConfig::new(r#"(?i)api[_-]?key["']?\s*[=:]\s*["']?[^"'&\s]+"#),
                MaskRuleConfig::new(r#"(?i)secret["']?\s*[=:]\s*["']?[^"'&\s]+"#),
                MaskRuleConfig::new(r#"(?i)token["']?\s*[=:]\s*["']?[^"'&\s]+"#),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_notifications: u32,
    pub window_minutes: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_notifications: 10,
            window_minutes: 5,
        }
    }
}

/// Where the live stream reads new records from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSourceKind {
    /// The durable error store
    Store,
    /// The in-memory ring of recently created records
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bounded session length before the server closes the stream
    pub session_secs: u64,
    pub heartbeat_secs: u64,
    pub poll_millis: u64,
    /// Maximum records emitted per tick (and on resume)
    pub batch_size: usize,
    pub recent_capacity: usize,
    pub source: StreamSourceKind,
}

impl StreamConfig {
    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_millis)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_secs: 25,
            heartbeat_secs: 10,
            poll_millis: 250,
            batch_size: 10,
            recent_capacity: 100,
            source: StreamSourceKind::Store,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    /// Base URL of the dashboard, used to build per-error links
    pub dashboard_url: String,
    pub icon: String,
    pub badge: String,
    pub require_interaction: bool,
    /// Levels that trigger a notification; empty means every monitored level
    pub levels: Vec<LogLevel>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Application Error".to_string(),
            dashboard_url: "/log-notifier".to_string(),
            icon: "/log-notifier/icon.png".to_string(),
            badge: "/log-notifier/badge.png".to_string(),
            require_interaction: true,
            levels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8087,
        }
    }
}

fn strip_env_comment(raw: &str) -> &str {
    raw.split('#').next().unwrap_or("").trim()
}

/// Read and parse one environment variable, ignoring a trailing `# comment`
/// and surrounding whitespace
fn env_var<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = std::env::var(key).ok()?;
    let clean = strip_env_comment(&raw);
    match clean.parse::<T>() {
        Ok(parsed) => {
            debug!(key, value = clean, "Config value from environment");
            Some(parsed)
        }
        Err(_) => {
            warn!(key, value = %raw, "Could not parse environment value, ignoring");
            None
        }
    }
}

impl NotifierConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist and parse. Without one, `log-notifier.toml`
    /// in the working directory is used when present, defaults otherwise.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> NotifierResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    debug!("Config file not found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> NotifierResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NotifierError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&contents)
            .map_err(|e| NotifierError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded config from file");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> NotifierResult<Self> {
        toml::from_str(contents).map_err(|e| NotifierError::Config(e.to_string()))
    }

    /// Overlay `LOG_NOTIFIER_*` environment variables
    pub fn apply_env(&mut self) {
        if let Some(v) = env_var("LOG_NOTIFIER_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = env_var("LOG_NOTIFIER_DEBUG") {
            self.debug = v;
        }
        if let Some(v) = env_var::<String>("LOG_NOTIFIER_LOG_PATH") {
            self.logs.path = PathBuf::from(v);
        }
        if let Some(v) = env_var("LOG_NOTIFIER_SCAN_ALL_LOGS") {
            self.logs.scan_all = v;
        }
        if let Some(v) = env_var("LOG_NOTIFIER_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env_var("LOG_NOTIFIER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env_var("LOG_NOTIFIER_PORT") {
            self.server.port = v;
        }
        if let Some(v) = env_var::<String>("LOG_NOTIFIER_LEVELS") {
            let levels: Vec<LogLevel> = v
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if levels.is_empty() {
                warn!(value = %v, "LOG_NOTIFIER_LEVELS has no known levels, ignoring");
            } else {
                self.levels = levels;
            }
        }
    }

    pub fn validate(&self) -> NotifierResult<()> {
        if self.levels.is_empty() {
            return Err(NotifierError::Config("at least one level must be monitored".into()));
        }
        if !(1..=MAX_WINDOW_MINUTES).contains(&self.dedup.window_minutes) {
            return Err(NotifierError::Config(format!(
                "dedup.window_minutes must be between 1 and {MAX_WINDOW_MINUTES}"
            )));
        }
        if !(1..=MAX_WINDOW_MINUTES).contains(&self.rate_limit.window_minutes) {
            return Err(NotifierError::Config(format!(
                "rate_limit.window_minutes must be between 1 and {MAX_WINDOW_MINUTES}"
            )));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(NotifierError::Config(format!(
                "retention_days must be at most {MAX_RETENTION_DAYS}"
            )));
        }
        if self.stream.poll_millis == 0 || self.stream.heartbeat_secs == 0 {
            return Err(NotifierError::Config("stream intervals must be non-zero".into()));
        }
        if self.stream.batch_size == 0 {
            return Err(NotifierError::Config("stream.batch_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Saturates instead of overflowing for unvalidated configs
    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.dedup.window_minutes).unwrap_or(chrono::Duration::MAX)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
environment = "staging"
levels = ["error", "critical"]

[logs]
path = "/var/log/app/app.log"
scan_all = false

[dedup]
window_minutes = 15

[[masking.rules]]
pattern = "card=\\d+"
replacement = "card=****"

[stream]
source = "memory"
"#;
        let config = NotifierConfig::from_toml(toml).unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(config.levels, vec![LogLevel::Error, LogLevel::Critical]);
        assert!(!config.logs.scan_all);
        assert_eq!(config.dedup.window_minutes, 15);
        assert!(config.dedup.enabled);
        assert_eq!(config.masking.rules.len(), 1);
        assert_eq!(config.masking.rules[0].replacement.as_deref(), Some("card=****"));
        assert_eq!(config.stream.source, StreamSourceKind::Memory);
        assert_eq!(config.rate_limit.max_notifications, 10);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = NotifierConfig::from_toml("").unwrap();
        assert!(config.enabled);
        assert_eq!(config.levels, LogLevel::DEFAULT_MONITORED.to_vec());
        assert_eq!(config.masking.rules.len(), 4);
        assert_eq!(config.stream.session_secs, 25);
    }

    #[test]
    fn test_unknown_level_is_rejected() {
        assert!(NotifierConfig::from_toml(r#"levels = ["fatal"]"#).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_levels() {
        let config = NotifierConfig {
            levels: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_windows_and_retention() {
        let mut config = NotifierConfig::default();
        config.dedup.window_minutes = i64::MAX;
        assert!(config.validate().is_err());

        let mut config = NotifierConfig::default();
        config.rate_limit.window_minutes = MAX_WINDOW_MINUTES + 1;
        assert!(config.validate().is_err());

        let mut config = NotifierConfig::default();
        config.retention_days = i64::MAX / 1000;
        assert!(config.validate().is_err());

        let mut config = NotifierConfig::default();
        config.dedup.window_minutes = MAX_WINDOW_MINUTES;
        config.retention_days = MAX_RETENTION_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dedup_window_saturates() {
        let mut config = NotifierConfig::default();
        config.dedup.window_minutes = i64::MAX;
        assert_eq!(config.dedup_window(), chrono::Duration::MAX);
    }

    #[test]
    fn test_env_values_drop_trailing_comments() {
        assert_eq!(strip_env_comment("  8087 # dashboard port"), "8087");
        assert_eq!(strip_env_comment("false"), "false");
        assert_eq!(strip_env_comment("# unset"), "");
        assert_eq!(strip_env_comment("15 # minutes").parse::<i64>().unwrap(), 15);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = NotifierConfig::load(Some(Path::new("/nonexistent/log-notifier.toml"))).unwrap_err();
        assert!(matches!(err, NotifierError::Config(_)));
    }
}
