//! Keep-alive indicator
//!
//! Signals to whatever supervises the host that the relay is doing
//! long-running work and should be left alone. Held from a successful
//! `start` until `stop`.

use crate::config::IndicatorConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub trait KeepAliveIndicator: Send + Sync {
    fn acquire(&self, title: &str, text: &str) -> Result<()>;

    /// Safe to call when not held
    fn release(&self);
}

/// Only logs; for hosts with nothing to tell
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl KeepAliveIndicator for LogIndicator {
    fn acquire(&self, title: &str, text: &str) -> Result<()> {
        info!("{}: {}", title, text);
        Ok(())
    }

    fn release(&self) {
        info!("Keep-alive indicator released");
    }
}

/// Writes a marker file while held, so process supervisors and scripts can
/// see the relay is active. The file holds the title, the text and our pid.
#[derive(Debug, Clone)]
pub struct MarkerFileIndicator {
    path: PathBuf,
}

impl MarkerFileIndicator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl KeepAliveIndicator for MarkerFileIndicator {
    fn acquire(&self, title: &str, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let content = format!("{}\n{}\npid={}\n", title, text, std::process::id());
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write marker file {:?}", self.path))?;

        debug!("Marker file written: {:?}", self.path);
        Ok(())
    }

    fn release(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Marker file removed: {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove marker file {:?}: {}", self.path, e),
        }
    }
}

/// Marker file when `[indicator].marker_path` is set, log only otherwise
pub fn from_config(config: &IndicatorConfig) -> Arc<dyn KeepAliveIndicator> {
    match &config.marker_path {
        Some(path) => Arc::new(MarkerFileIndicator::new(path.clone())),
        None => Arc::new(LogIndicator),
    }
}
