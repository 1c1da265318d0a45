//! Logging setup shared by the Teamcast binaries
//!
//! Output goes to stderr in one of three formats. The format and level come
//! from `TEAMCAST_LOG_FORMAT` / `TEAMCAST_LOG_LEVEL` unless the caller sets
//! them, and `RUST_LOG` still wins over both when present.
//!
//! ```no_run
//! use libteamcast::logging::LoggingConfig;
//!
//! LoggingConfig::from_env(false).init();
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const FORMAT_ENV: &str = "TEAMCAST_LOG_FORMAT";
pub const LEVEL_ENV: &str = "TEAMCAST_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text output (no colors, for piping)
    Text,
    /// One JSON object per line, for log shippers
    Json,
    /// Pretty-printed with colors (for development)
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>, verbose: bool) -> Self {
        Self {
            format,
            level: level.into(),
            verbose,
        }
    }

    /// Read format and level from the environment, falling back to text/info.
    /// An unparseable format is ignored rather than fatal.
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var(FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var(LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        Self::new(format, level, verbose)
    }

    /// Directive string handed to `EnvFilter` when `RUST_LOG` is unset.
    /// sqlx statement logging is capped at warn unless asked for.
    pub fn directives(&self) -> String {
        let level = if self.verbose { "debug" } else { self.level.as_str() };
        if level.contains("sqlx") {
            level.to_string()
        } else {
            format!("{level},sqlx=warn")
        }
    }

    /// Install the global subscriber. Returns false if one was already set,
    /// which happens when several tests initialize logging.
    pub fn init(&self) -> bool {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.directives()));

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init(),
        };
        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml"
            .parse::<LogFormat>()
            .unwrap_err()
            .contains("Invalid log format: 'xml'"));
    }

    #[test]
    fn test_directives() {
        let config = LoggingConfig::new(LogFormat::Text, "warn", false);
        assert_eq!(config.directives(), "warn,sqlx=warn");

        let verbose = LoggingConfig::new(LogFormat::Text, "warn", true);
        assert_eq!(verbose.directives(), "debug,sqlx=warn");

        let explicit = LoggingConfig::new(LogFormat::Text, "info,sqlx=debug", false);
        assert_eq!(explicit.directives(), "info,sqlx=debug");
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(FORMAT_ENV, "json");
        std::env::set_var(LEVEL_ENV, "trace");
        let config = LoggingConfig::from_env(false);
        std::env::remove_var(FORMAT_ENV);
        std::env::remove_var(LEVEL_ENV);

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "trace");
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_bad_format() {
        std::env::set_var(FORMAT_ENV, "yaml");
        let config = LoggingConfig::from_env(true);
        std::env::remove_var(FORMAT_ENV);

        assert_eq!(config.format, LogFormat::Text);
        assert!(config.verbose);
    }
}
