//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` fmt subscriber driven by [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when set.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(!config.log_to_file)
        .with_writer(output(config)?);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

/// Writer for the configured outputs; console and file together tee to both
fn output(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    if !config.log_to_file {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    }
    let path = config.log_file_path.as_deref().ok_or_else(|| {
        ProtocolError::ConfigError("log_file_path must be set when log_to_file is true".into())
    })?;
    let file = Mutex::new(OpenOptions::new().create(true).append(true).open(path)?);
    Ok(if config.log_to_console {
        BoxMakeWriter::new(std::io::stdout.and(file))
    } else {
        BoxMakeWriter::new(file)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn file_output_requires_a_path() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: None,
            ..LoggingConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(ProtocolError::ConfigError(_))));
    }

    #[test]
    fn console_and_file_both_receive_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.log");
        let config = LoggingConfig {
            log_to_console: true,
            log_to_file: true,
            log_file_path: Some(path.to_string_lossy().into_owned()),
            ..LoggingConfig::default()
        };
        let writer = output(&config).unwrap();
        writer.make_writer().write_all(b"tee check\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "tee check\n");
    }

    #[test]
    fn second_install_is_refused() {
        let dir = std::env::temp_dir().join(format!("mmtls-log-{}", std::process::id()));
        let config = LoggingConfig {
            log_to_console: false,
            log_to_file: true,
            log_file_path: Some(dir.to_string_lossy().into_owned()),
            json_format: true,
            ..LoggingConfig::default()
        };
        let first = init_logging(&config);
        let second = init_logging(&config);
        assert!(first.is_ok());
        assert!(second.is_err());
        let _ = std::fs::remove_file(&dir);
    }
}
