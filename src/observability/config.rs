//! Logging Configuration
//!
//! Loaded from environment variables for 12-factor compliance.

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directives (default: RUST_LOG, else "info")
    pub filter: String,
    /// Output format (STREAM_LEDGER_LOG_FORMAT=json|text, default: text)
    pub format: LogFormat,
    /// Service name attached to the startup event (default: stream-ledger)
    pub service_name: String,
    /// Extra fields logged once at startup (STREAM_LEDGER_LOG_TAGS)
    pub global_tags: Vec<(String, String)>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
            service_name: "stream-ledger".to_string(),
            global_tags: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            filter: lookup("RUST_LOG")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: match lookup("STREAM_LEDGER_LOG_FORMAT").as_deref() {
                Some("json") | Some("JSON") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            service_name: lookup("STREAM_LEDGER_SERVICE").unwrap_or(defaults.service_name),
            global_tags: parse_tags(&lookup("STREAM_LEDGER_LOG_TAGS").unwrap_or_default()),
        }
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }
}

/// Parse "key1:value1,key2:value2"
fn parse_tags(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|tag| {
            let (k, v) = tag.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
