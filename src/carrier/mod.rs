//! Carrier gateway: hands text segments to the telephony network
//!
//! Drivers:
//! - `log`: dry run, every segment is logged instead of sent
//! - `http`: POSTs each segment to an HTTP SMS API (feature `http-carrier`)
//!
//! Bodies longer than the carrier's single-part limit are cut with
//! [`split_for_carrier`] before they reach a driver.

#[cfg(feature = "http-carrier")]
pub mod http;

use crate::config::{CarrierConfig, CarrierDriver};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error("invalid destination number {0:?}")]
    InvalidDestination(String),

    #[error("carrier request failed: {0}")]
    Http(String),

    #[error("carrier rejected segment with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait CarrierGateway: Send + Sync {
    /// Longest body, in characters, the carrier accepts as one message
    fn max_part_len(&self) -> usize;

    async fn send_segment(&self, destination: &str, body: &str) -> Result<(), CarrierError>;
}

/// Cut `body` into ordered parts of at most `max_len` characters.
///
/// An empty body still produces one (empty) part. Parts never split a
/// character, so concatenating them gives back `body` exactly.
pub fn split_for_carrier(body: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let chars: Vec<char> = body.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }

    chars
        .chunks(max_len)
        .map(|part| part.iter().collect())
        .collect()
}

/// Phone numbers: optional leading `+`, digits, and the usual separators
pub fn check_destination(destination: &str) -> Result<(), CarrierError> {
    let trimmed = destination.trim();
    let digits = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
    let well_formed = trimmed.char_indices().all(|(i, c)| {
        c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')') || (c == '+' && i == 0)
    });

    if digits == 0 || !well_formed {
        return Err(CarrierError::InvalidDestination(destination.to_string()));
    }
    Ok(())
}

/// Logs segments instead of sending them
#[derive(Debug, Clone)]
pub struct LogGateway {
    max_part_len: usize,
}

impl LogGateway {
    pub fn new(max_part_len: usize) -> Self {
        Self { max_part_len }
    }
}

#[async_trait]
impl CarrierGateway for LogGateway {
    fn max_part_len(&self) -> usize {
        self.max_part_len
    }

    async fn send_segment(&self, destination: &str, body: &str) -> Result<(), CarrierError> {
        check_destination(destination)?;
        info!(
            "[dry run] SMS to {} ({} chars): {}",
            destination,
            body.chars().count(),
            body
        );
        Ok(())
    }
}

/// Build the gateway selected by `[carrier].driver`
pub fn from_config(config: &CarrierConfig) -> anyhow::Result<Arc<dyn CarrierGateway>> {
    match config.driver {
        CarrierDriver::Log => {
            info!("Carrier driver: log (dry run)");
            Ok(Arc::new(LogGateway::new(config.max_part_len)))
        }
        #[cfg(feature = "http-carrier")]
        CarrierDriver::Http => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("[carrier].url is required for the http driver"))?;
            info!("Carrier driver: http ({})", url);
            let gateway = http::HttpGateway::new(url, config.token.clone(), config.max_part_len)?;
            Ok(Arc::new(gateway))
        }
        #[cfg(not(feature = "http-carrier"))]
        CarrierDriver::Http => {
            anyhow::bail!("http carrier driver requested but the http-carrier feature is disabled")
        }
    }
}
