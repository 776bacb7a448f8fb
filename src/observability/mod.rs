//! Logging setup
//!
//! Library code only emits `tracing` events. Binaries call [`init_tracing`]
//! once to install a `tracing-subscriber` fmt subscriber filtered by
//! `RUST_LOG`.

pub mod config;

pub use config::{LogFormat, LoggingConfig};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// Returns `false` if one was already installed (tests call this repeatedly).
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    };

    if installed {
        tracing::info!(
            service = %config.service_name,
            tags = ?config.global_tags,
            "logging initialized"
        );
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
