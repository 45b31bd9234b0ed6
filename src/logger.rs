use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::settings::{LogFormat, LoggingConfig};

/// Component-scoped logger, prefixes every line with the component name.
#[derive(Debug, Clone)]
pub struct Logger {
    name: String,
}

impl Logger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn info(&self, message: &str) {
        info!("[{}] {}", self.name, message);
    }

    pub fn warn(&self, message: &str) {
        warn!("[{}] {}", self.name, message);
    }

    pub fn error(&self, message: &str) {
        error!("[{}] {}", self.name, message);
    }

    pub fn debug(&self, message: &str) {
        debug!("[{}] {}", self.name, message);
    }
}

pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", path.display(), e))?;
            fmt::writer::BoxMakeWriter::new(Arc::new(file))
        }
        None => fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    let result = match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(writer)),
        ),
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(config.file.is_none())),
        ),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to set global subscriber: {}", e))?;

    Ok(())
}
