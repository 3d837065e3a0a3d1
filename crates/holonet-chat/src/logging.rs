//! Tracing setup: a console layer and a log file layer.
//!
//! `RUST_LOG` overrides the console level. The file layer always uses the
//! configured level. A log file that cannot be opened is fatal.

use holonet_types::config::LogConfig;
use holonet_types::error::HolonetError;
use std::fs::{File, OpenOptions};
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Open the log file for appending, creating parent directories.
pub fn open_log_file(config: &LogConfig) -> Result<File, HolonetError> {
    if let Some(parent) = config.file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            HolonetError::Configuration(format!(
                "cannot create log directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file)
        .map_err(|e| {
            HolonetError::Configuration(format!(
                "cannot open log file {}: {e}",
                config.file.display()
            ))
        })
}

fn level(name: &str) -> Result<LevelFilter, HolonetError> {
    LevelFilter::from_str(name)
        .map_err(|_| HolonetError::Configuration(format!("invalid log level '{name}'")))
}

/// Install the global subscriber.
pub fn init_tracing(config: &LogConfig) -> Result<(), HolonetError> {
    let file = open_log_file(config)?;
    let file_level = level(&config.file_level)?;
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.console_level))
        .map_err(|e| HolonetError::Configuration(format!("invalid console log level: {e}")))?;

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);
    let file = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_filter(file_level);

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| HolonetError::Configuration(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_created_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file: dir.path().join("logs").join("chat.log"),
            ..LogConfig::default()
        };
        open_log_file(&config).unwrap();
        assert!(config.file.exists());
    }

    #[test]
    fn test_unwritable_log_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a log file.
        let config = LogConfig {
            file: dir.path().to_path_buf(),
            ..LogConfig::default()
        };
        assert!(matches!(
            open_log_file(&config),
            Err(HolonetError::Configuration(_))
        ));
    }

    #[test]
    fn test_level_names() {
        assert_eq!(level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(level("off").unwrap(), LevelFilter::OFF);
        assert!(level("loud").is_err());
    }
}
