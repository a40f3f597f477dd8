//! Logging bootstrap
//!
//! The server keeps the local terminal in raw mode for the life of the
//! session, so its logs go to a file; the client logs to stderr. Filtering
//! comes from the `PTYCAST_LOG` env var.

use std::path::PathBuf;

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{PtycastError, Result};

/// Log output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Log to stderr (client)
    Stderr,
    /// Log to file (server; stderr shares the raw terminal)
    File,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub output: LogOutput,
    /// Filter directive, e.g. "info" or "ptycast=debug,russh=warn"
    pub filter: String,
}

impl LogConfig {
    /// Config for the client: stderr, quiet by default.
    pub fn client() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: std::env::var("PTYCAST_LOG").unwrap_or_else(|_| "warn".into()),
        }
    }

    /// Config for the server: file sink.
    pub fn server() -> Self {
        Self {
            output: LogOutput::File,
            filter: std::env::var("PTYCAST_LOG").unwrap_or_else(|_| "info".into()),
        }
    }
}

fn log_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "ptycast")
        .map(|dirs| dirs.data_local_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Initialize the global subscriber.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| PtycastError::usage(format!("invalid log filter: {}", e)))?;

    let fmt_layer = fmt::layer().with_target(true);

    match config.output {
        LogOutput::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| {
                    PtycastError::terminal(format!("failed to init logging: {}", e))
                })?;
        }
        LogOutput::File => {
            let dir = log_dir();
            std::fs::create_dir_all(&dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("ptycast.log"))?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(file).with_ansi(false))
                .try_init()
                .map_err(|e| {
                    PtycastError::terminal(format!("failed to init logging: {}", e))
                })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = LogConfig::client();
        assert_eq!(config.output, LogOutput::Stderr);
    }

    #[test]
    fn test_server_config_uses_file() {
        let config = LogConfig::server();
        assert_eq!(config.output, LogOutput::File);
    }
}
