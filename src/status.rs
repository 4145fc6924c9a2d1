//! Single-slot connection status distribution
//!
//! Holds the latest "subscribed" flag. Observers attached at any point see
//! the current value straight away and every later overwrite, but never a
//! backlog: a slow observer may skip intermediate values.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives the boolean subscribed/connected status
pub trait StatusObserver: Send + Sync + 'static {
    fn on_status(&self, subscribed: bool);
}

impl<F> StatusObserver for F
where
    F: Fn(bool) + Send + Sync + 'static,
{
    fn on_status(&self, subscribed: bool) {
        self(subscribed)
    }
}

#[derive(Debug)]
pub struct StatusBus {
    slot: watch::Sender<bool>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(false);
        Self { slot }
    }

    /// Overwrite the slot and wake every attached observer
    pub fn publish(&self, subscribed: bool) {
        let previous = self.slot.send_replace(subscribed);
        if previous != subscribed {
            debug!("Status changed: {} -> {}", previous, subscribed);
        }
    }

    pub fn current(&self) -> bool {
        *self.slot.borrow()
    }

    /// Raw receiver for callers that prefer to await changes themselves
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.slot.subscribe()
    }

    /// Deliver the current value to `observer` now, then every later publish
    /// until the returned [`Attachment`] is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, observer: impl StatusObserver) -> Attachment {
        let mut rx = self.slot.subscribe();
        observer.on_status(*rx.borrow());

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let subscribed = *rx.borrow_and_update();
                observer.on_status(subscribed);
            }
        });

        debug!("Status observer attached");
        Attachment { task }
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps an observer attached; dropping it detaches
#[must_use = "dropping the attachment detaches the observer"]
pub struct Attachment {
    task: JoinHandle<()>,
}

impl Attachment {
    pub fn detach(self) {}
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.task.abort();
        debug!("Status observer detached");
    }
}
