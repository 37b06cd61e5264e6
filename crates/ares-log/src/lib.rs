//! Structured logging and tracing for the Ares planet viewer.
//!
//! Console output carries uptime timestamps and module paths; debug builds can
//! additionally write JSON lines to a log file. The filter honours `RUST_LOG`
//! and otherwise falls back to the configured log level.

use std::path::Path;

use ares_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config specify one.
///
/// HTTP and TLS internals are held at `warn`; a tile stream issues thousands of requests.
pub const DEFAULT_FILTER: &str = "info,ureq=warn,rustls=warn";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE_NAME: &str = "ares.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - Optional directory for the JSON log file (debug builds only)
/// * `debug_build` - Whether file logging may be enabled
/// * `config` - Optional configuration providing the log level
///
/// # Examples
///
/// ```no_run
/// use ares_config::Config;
/// use ares_log::init_logging;
///
/// let config = Config::default();
/// init_logging(None, false, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_string(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // fetch and geometry workers are named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let file_logging = debug_build && config.is_none_or(|config| config.debug.log_to_file);
    if file_logging
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        // A second init (e.g. from tests) is not an error worth surfacing.
        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// Resolve the filter directive string from the config, falling back to [`DEFAULT_FILTER`].
pub fn filter_string(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            let level = config.debug.log_level.trim();
            if level.contains('=') || level.contains(',') {
                level.to_string()
            } else {
                format!("{level},ureq=warn,rustls=warn")
            }
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("ureq=warn"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_plain_level_gets_noise_suppression() {
        let mut config = Config::default();
        config.debug.log_level = "debug".to_string();
        let filter = filter_string(Some(&config));
        assert_eq!(filter, "debug,ureq=warn,rustls=warn");
    }

    #[test]
    fn test_directive_level_passes_through() {
        let mut config = Config::default();
        config.debug.log_level = "warn,ares_tiles=trace".to_string();
        assert_eq!(filter_string(Some(&config)), "warn,ares_tiles=trace");
    }

    #[test]
    fn test_empty_level_uses_default() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_string(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_string(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid_filters = [
            "info",
            "debug,ares_tiles=trace",
            "warn,ares_tiles::scheduler=debug",
            "error",
        ];

        for filter_str in &valid_filters {
            let result = EnvFilter::try_from(*filter_str);
            assert!(result.is_ok(), "Failed to parse filter: {}", filter_str);
        }
    }

    #[test]
    fn test_file_logger_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");
        let mut config = Config::default();
        config.debug.log_to_file = true;

        init_logging(Some(&log_dir), true, Some(&config));
        assert!(log_dir.join(LOG_FILE_NAME).exists());
    }
}
