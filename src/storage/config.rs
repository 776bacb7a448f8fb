//! Configuration for the stream log
//!
//! Loaded from TOML, then overridden from `STREAM_LEDGER_*` environment
//! variables. Every section has a `Default` and a `test()` preset.

use super::error::LogError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration shared by every stream in a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Key prefix for all records in the metadata backend
    pub metadata_prefix: String,
    pub rollover: RolloverPolicy,
    pub retry: RetryConfig,
    pub cursor: CursorConfig,
    /// Completion window for each backend call
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            metadata_prefix: "stream-ledger".to_string(),
            rollover: RolloverPolicy::default(),
            retry: RetryConfig::default(),
            cursor: CursorConfig::default(),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl LogConfig {
    /// Small segments and short timeouts for tests
    pub fn test() -> Self {
        LogConfig {
            metadata_prefix: "test".to_string(),
            rollover: RolloverPolicy::entries(4),
            retry: RetryConfig::default(),
            cursor: CursorConfig::default(),
            operation_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_rollover(mut self, rollover: RolloverPolicy) -> Self {
        self.rollover = rollover;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, LogError> {
        let config: LogConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LogError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `STREAM_LEDGER_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), LogError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), LogError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, LogError> {
            raw.trim()
                .parse()
                .map_err(|_| LogError::InvalidConfig(format!("{}={} is not valid", key, raw)))
        }

        if let Some(v) = lookup("STREAM_LEDGER_METADATA_PREFIX") {
            self.metadata_prefix = v;
        }
        if let Some(v) = lookup("STREAM_LEDGER_MAX_ENTRIES") {
            self.rollover.max_entries = match v.trim() {
                "" | "0" | "none" => None,
                raw => Some(parse("STREAM_LEDGER_MAX_ENTRIES", raw)?),
            };
        }
        if let Some(v) = lookup("STREAM_LEDGER_MAX_BYTES") {
            self.rollover.max_bytes = match v.trim() {
                "" | "0" | "none" => None,
                raw => Some(parse("STREAM_LEDGER_MAX_BYTES", raw)?),
            };
        }
        if let Some(v) = lookup("STREAM_LEDGER_OPERATION_TIMEOUT_MS") {
            let ms: u64 = parse("STREAM_LEDGER_OPERATION_TIMEOUT_MS", &v)?;
            self.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("STREAM_LEDGER_CURSOR_START") {
            self.cursor.start = match v.trim().to_ascii_lowercase().as_str() {
                "earliest" => CursorStart::Earliest,
                "latest" => CursorStart::Latest,
                other => {
                    return Err(LogError::InvalidConfig(format!(
                        "STREAM_LEDGER_CURSOR_START={} is not earliest|latest",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("STREAM_LEDGER_CURSOR_PERSIST") {
            self.cursor.persist_on_advance = parse("STREAM_LEDGER_CURSOR_PERSIST", &v)?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), LogError> {
        if self.metadata_prefix.is_empty() || self.metadata_prefix.contains("//") {
            return Err(LogError::InvalidConfig(format!(
                "metadata_prefix {:?} is not a usable key prefix",
                self.metadata_prefix
            )));
        }
        if self.operation_timeout.is_zero() {
            return Err(LogError::InvalidConfig(
                "operation_timeout must be positive".to_string(),
            ));
        }
        if self.retry.max_cas_retries == 0 || self.retry.max_sealed_retries == 0 {
            return Err(LogError::InvalidConfig(
                "retry bounds must be at least 1".to_string(),
            ));
        }
        self.rollover.validate()
    }
}

/// When the active segment is sealed and a new one started
///
/// A segment rolls once any enabled limit is reached. `None` disables a limit;
/// with both disabled the stream stays in one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloverPolicy {
    pub max_entries: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        RolloverPolicy {
            max_entries: Some(50_000),
            max_bytes: Some(64 * 1024 * 1024),
        }
    }
}

impl RolloverPolicy {
    pub fn entries(max_entries: u64) -> Self {
        RolloverPolicy {
            max_entries: Some(max_entries),
            max_bytes: None,
        }
    }

    pub fn bytes(max_bytes: u64) -> Self {
        RolloverPolicy {
            max_entries: None,
            max_bytes: Some(max_bytes),
        }
    }

    pub fn unbounded() -> Self {
        RolloverPolicy {
            max_entries: None,
            max_bytes: None,
        }
    }

    /// Whether a segment holding `entries`/`bytes` must roll before the next append
    ///
    /// An empty segment never rolls, so one oversized payload still lands.
    pub fn should_roll(&self, entries: u64, bytes: u64) -> bool {
        if entries == 0 {
            return false;
        }
        self.max_entries.is_some_and(|max| entries >= max)
            || self.max_bytes.is_some_and(|max| bytes >= max)
    }

    fn validate(&self) -> Result<(), LogError> {
        if self.max_entries == Some(0) || self.max_bytes == Some(0) {
            return Err(LogError::InvalidConfig(
                "rollover limits must be positive (omit to disable)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounds for internally retried races
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Metadata CAS attempts during one rollover
    pub max_cas_retries: u32,
    /// Append attempts when a concurrent rollover sealed the target segment
    pub max_sealed_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_cas_retries: 5,
            max_sealed_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorStart {
    /// First entry of the stream
    #[default]
    Earliest,
    /// Current tail; only entries appended after open are read
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Start position for a cursor with no stored state
    pub start: CursorStart,
    /// Store the position after every successful read
    pub persist_on_advance: bool,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = LogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cursor.start, CursorStart::Earliest);
        assert!(!config.cursor.persist_on_advance);
        assert!(LogConfig::test().validate().is_ok());
    }

    #[test]
    fn test_should_roll() {
        let policy = RolloverPolicy::entries(2);
        assert!(!policy.should_roll(0, 0));
        assert!(!policy.should_roll(1, 1_000_000));
        assert!(policy.should_roll(2, 0));

        let policy = RolloverPolicy::bytes(100);
        assert!(!policy.should_roll(0, 500));
        assert!(!policy.should_roll(10, 99));
        assert!(policy.should_roll(1, 100));

        assert!(!RolloverPolicy::unbounded().should_roll(u64::MAX, u64::MAX));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = LogConfig::from_toml_str(
            r#"
            metadata_prefix = "broker"
            operation_timeout = 2500

            [rollover]
            max_entries = 2

            [cursor]
            start = "latest"
            persist_on_advance = true
            "#,
        )
        .unwrap();

        assert_eq!(config.metadata_prefix, "broker");
        assert_eq!(config.operation_timeout, Duration::from_millis(2500));
        assert_eq!(config.rollover.max_entries, Some(2));
        // Unspecified fields keep their defaults
        assert_eq!(config.rollover.max_bytes, RolloverPolicy::default().max_bytes);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.cursor.start, CursorStart::Latest);
        assert!(config.cursor.persist_on_advance);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(matches!(
            LogConfig::from_toml_str("[rollover]\nmax_entries = 0\n"),
            Err(LogError::InvalidConfig(_))
        ));
        assert!(matches!(
            LogConfig::from_toml_str("operation_timeout = \"soon\""),
            Err(LogError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STREAM_LEDGER_MAX_ENTRIES", "10"),
            ("STREAM_LEDGER_MAX_BYTES", "none"),
            ("STREAM_LEDGER_OPERATION_TIMEOUT_MS", "750"),
            ("STREAM_LEDGER_CURSOR_START", "Latest"),
        ]
        .into_iter()
        .collect();

        let mut config = LogConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.rollover, RolloverPolicy::entries(10));
        assert_eq!(config.operation_timeout, Duration::from_millis(750));
        assert_eq!(config.cursor.start, CursorStart::Latest);
    }

    #[test]
    fn test_bad_env_override() {
        let mut config = LogConfig::default();
        let err = config
            .apply_overrides(|k| (k == "STREAM_LEDGER_OPERATION_TIMEOUT_MS").then(|| "fast".to_string()))
            .unwrap_err();
        assert!(matches!(err, LogError::InvalidConfig(_)));
    }
}
