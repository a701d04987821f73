//! # Restore Coordinator
//!
//! A single-slot mailbox between whoever requests a restore (a control API
//! handler) and the session loop that owns the container's foreground
//! process.
//!
//! ```text
//!   producer                     coordinator                    session loop
//!   ────────                     ───────────                    ────────────
//!   enqueue("v3") ──► busy = true, ref = "v3" ──► signal ──► consume_signal()
//!   enqueue("v4") ──► RestoreInProgress                          current_ref() = "v3"
//!                                                                ...restore...
//!                                              busy = false ◄── finish()
//! ```
//!
//! Producers never block: the signal channel has capacity one and `enqueue`
//! uses `try_send`. Only one request is ever accepted until `finish`.

use crate::error::{Error, Result};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Slot {
    busy: bool,
    reference: Option<String>,
}

/// Single-slot restore mailbox.
pub struct RestoreCoordinator {
    slot: Mutex<Slot>,
    signal_tx: mpsc::Sender<()>,
    signal_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Default for RestoreCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreCoordinator {
    /// Creates an idle coordinator.
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            slot: Mutex::new(Slot::default()),
            signal_tx,
            signal_rx: tokio::sync::Mutex::new(signal_rx),
        }
    }

    fn slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    /// Accepts a restore request for `reference`.
    ///
    /// # Errors
    ///
    /// [`Error::RestoreInProgress`] if a request is pending or running.
    /// [`Error::Internal`] if the slot lock is poisoned.
    pub fn enqueue(&self, reference: impl Into<String>) -> Result<()> {
        let reference = reference.into();
        {
            let mut slot = self.slot()?;
            if slot.busy {
                return Err(Error::RestoreInProgress);
            }
            slot.busy = true;
            slot.reference = Some(reference.clone());
        }
        // A full channel already carries a wakeup.
        if self.signal_tx.try_send(()).is_err() {
            debug!("restore signal already queued");
        }
        info!(reference = %reference, "restore requested");
        Ok(())
    }

    /// Waits for the next restore signal.
    pub async fn consume_signal(&self) {
        let mut rx = self.signal_rx.lock().await;
        // The sender lives in `self`, so the channel never closes here.
        let _ = rx.recv().await;
    }

    /// Takes a queued signal without waiting. Returns true if one was queued.
    pub fn try_consume_signal(&self) -> bool {
        match self.signal_rx.try_lock() {
            Ok(mut rx) => rx.try_recv().is_ok(),
            Err(_) => false,
        }
    }

    /// Returns the accepted reference, if a request is pending.
    pub fn current_ref(&self) -> Result<Option<String>> {
        Ok(self.slot()?.reference.clone())
    }

    /// Returns true while a request is pending or running.
    pub fn is_pending(&self) -> Result<bool> {
        Ok(self.slot()?.busy)
    }

    /// Releases the slot so the next request can be accepted.
    pub fn finish(&self) -> Result<()> {
        let mut slot = self.slot()?;
        slot.busy = false;
        slot.reference = None;
        debug!("restore slot released");
        Ok(())
    }
}
