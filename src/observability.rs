//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `TOOLRELAY_LOG_FORMAT=json`. Filter defaults to `info` if `RUST_LOG` is unset.
pub fn init_tracing() {
    let format = std::env::var("TOOLRELAY_LOG_FORMAT").ok();
    init_tracing_from_config(&with_log_format(ObservabilityConfig::default(), format.as_deref()));
}

fn with_log_format(mut config: ObservabilityConfig, format: Option<&str>) -> ObservabilityConfig {
    if let Some(format) = format {
        config.json_logs = format.eq_ignore_ascii_case("json");
    }
    config
}

/// Initialize tracing from an [`ObservabilityConfig`]. `RUST_LOG` still wins
/// over the configured level when set.
pub fn init_tracing_from_config(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

        let result = if config.json_logs {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::with_log_format;
    use crate::types::ObservabilityConfig;

    #[test]
    fn log_format_override() {
        let json = with_log_format(ObservabilityConfig::default(), Some("JSON"));
        assert!(json.json_logs);
        assert_eq!(json.log_level, "info");

        let configured = ObservabilityConfig {
            json_logs: true,
            ..Default::default()
        };
        assert!(!with_log_format(configured.clone(), Some("text")).json_logs);
        assert!(with_log_format(configured, None).json_logs);
    }
}
