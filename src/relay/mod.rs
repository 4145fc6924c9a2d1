//! Relay controller: broker message in, paced carrier sends out
//!
//! Inbound payloads are decoded on the broker's delivery task and queued as
//! jobs. A single worker task drains the queue and talks to the carrier,
//! keeping at least `pacing` between any two consecutive sends so bursts
//! don't trip carrier rate limits. Nothing is ever acknowledged back to the
//! broker.

pub mod envelope;

use crate::broker::{MessageHandler, TOPIC};
use crate::carrier::CarrierGateway;
use crate::config::RelayConfig;
use chrono::{DateTime, Utc};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use envelope::{EnvelopeError, RelayEnvelope};

/// Outcome of one carrier send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    pub destination: String,
    /// Zero-based position within the envelope's segment sequence
    pub index: usize,
    pub total: usize,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl SegmentReport {
    pub fn is_delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Told about every send attempt and every payload that could not be decoded.
///
/// Called from the relay worker and the broker delivery task respectively;
/// implementations must not block.
pub trait RelayObserver: Send + Sync + 'static {
    fn on_relayed(&self, _report: &SegmentReport) {}

    fn on_malformed(&self, _error: &EnvelopeError) {}
}

/// Writes relay outcomes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RelayObserver for LogObserver {
    fn on_relayed(&self, report: &SegmentReport) {
        match &report.error {
            None => info!(
                "SMS segment {}/{} sent to {}",
                report.index + 1,
                report.total,
                report.destination
            ),
            Some(e) => warn!(
                "SMS segment {}/{} to {} failed: {}",
                report.index + 1,
                report.total,
                report.destination,
                e
            ),
        }
    }
}

#[derive(Debug)]
struct RelayJob {
    destination: String,
    segments: Vec<String>,
}

pub struct RelayController {
    queue: mpsc::Sender<RelayJob>,
    worker: Mutex<Option<JoinHandle<()>>>,
    observer: Arc<dyn RelayObserver>,
    max_part_len: usize,
}

impl RelayController {
    /// Start the worker task. Must be called inside a tokio runtime.
    pub fn spawn(
        gateway: Arc<dyn CarrierGateway>,
        observer: Arc<dyn RelayObserver>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let max_part_len = gateway.max_part_len();
        let worker = tokio::spawn(run_worker(rx, gateway, observer.clone(), config.pacing()));

        Arc::new(Self {
            queue,
            worker: Mutex::new(Some(worker)),
            observer,
            max_part_len,
        })
    }

    /// Decode `payload` and queue it for sending
    pub fn relay(&self, payload: &[u8]) -> Result<(), EnvelopeError> {
        let envelope = match RelayEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed relay envelope: {}", e);
                notify(|| self.observer.on_malformed(&e));
                return Err(e);
            }
        };

        let job = RelayJob {
            segments: envelope.segments(self.max_part_len),
            destination: envelope.phone_number,
        };
        debug!(
            "Queueing {} segment(s) for {}",
            job.segments.len(),
            job.destination
        );

        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!("Relay queue full, dropping message for {}", job.destination)
            }
            Err(TrySendError::Closed(job)) => {
                warn!("Relay stopped, dropping message for {}", job.destination)
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// Abandon queued work and stop the worker. Never blocks.
    pub fn shutdown(&self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(task) = worker.take() {
                task.abort();
                info!("Relay worker stopped");
            }
        }
    }
}

impl MessageHandler for RelayController {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != TOPIC {
            debug!("Ignoring message on {}", topic);
            return;
        }
        // Malformed payloads are already reported
        let _ = self.relay(payload);
    }
}

impl Drop for RelayController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run an observer callback, containing any panic
fn notify(callback: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("Relay observer panicked");
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<RelayJob>,
    gateway: Arc<dyn CarrierGateway>,
    observer: Arc<dyn RelayObserver>,
    pacing: Duration,
) {
    let mut last_send: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        let total = job.segments.len();
        info!("Relaying {} segment(s) to {}", total, job.destination);

        for (index, segment) in job.segments.iter().enumerate() {
            if let Some(last) = last_send {
                tokio::time::sleep_until(last + pacing).await;
            }

            let outcome = gateway.send_segment(&job.destination, segment).await;
            last_send = Some(Instant::now());

            let report = SegmentReport {
                destination: job.destination.clone(),
                index,
                total,
                error: outcome.err().map(|e| e.to_string()),
                sent_at: Utc::now(),
            };
            if let Some(e) = &report.error {
                error!(
                    "Carrier send {}/{} to {} failed: {}",
                    index + 1,
                    total,
                    job.destination,
                    e
                );
            }
            notify(|| observer.on_relayed(&report));
        }
    }

    debug!("Relay queue closed, worker exiting");
}
