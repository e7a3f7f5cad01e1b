//! Ingestion worker.
//!
//! Raw event strings arrive from an external datagram receiver. A single
//! worker decodes them in arrival order and applies zaps to the ledger, so
//! per-source ordering is preserved. Malformed records are logged and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DecodeError, ZapError, ZapResult};
use crate::event::{decode, StbEvent};
use crate::ledger::ViewerLedger;

/// What happened to one ingested record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A channel zap was applied to the ledger.
    Zap,
    /// A status change was accepted and ignored.
    Status,
}

/// Counters of ingested records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Zaps applied to the ledger.
    pub zaps: u64,
    /// Status changes accepted and ignored.
    pub status_changes: u64,
    /// Records that failed to decode.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    zaps: AtomicU64,
    status_changes: AtomicU64,
    rejected: AtomicU64,
}

/// Decodes raw records and feeds zaps to a ledger.
#[derive(Clone)]
pub struct Ingestor {
    ledger: Arc<dyn ViewerLedger>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("ledger", &self.ledger.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Ingestor {
    /// Creates an ingestor writing to `ledger`.
    pub fn new(ledger: Arc<dyn ViewerLedger>) -> Self {
        Self {
            ledger,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Decodes one record and applies it.
    ///
    /// # Errors
    ///
    /// Returns [`ZapError::Decode`] for malformed records (counted as
    /// rejected) and [`ZapError::Ledger`] if the ledger is unusable.
    pub fn ingest(&self, raw: &str) -> ZapResult<IngestOutcome> {
        let event = decode(raw).map_err(|e: DecodeError| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            ZapError::from(e)
        })?;

        match event {
            StbEvent::Zap(zap) => {
                self.ledger.log_event(zap)?;
                self.counters.zaps.fetch_add(1, Ordering::Relaxed);
                Ok(IngestOutcome::Zap)
            }
            StbEvent::Status(status) => {
                debug!(source = %status.source_ip, status = %status, "status change ignored");
                self.counters.status_changes.fetch_add(1, Ordering::Relaxed);
                Ok(IngestOutcome::Status)
            }
        }
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            zaps: self.counters.zaps.load(Ordering::Relaxed),
            status_changes: self.counters.status_changes.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Runs the ingestion loop on a dedicated thread.
    ///
    /// The thread exits once every sender of `rx` is dropped, or when the
    /// ledger fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self, rx: Receiver<String>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("chzap-ingest".to_string())
            .spawn(move || self.run(&rx))
    }

    fn run(&self, rx: &Receiver<String>) {
        for raw in rx {
            match self.ingest(&raw) {
                Ok(_) => {}
                Err(ZapError::Decode(e)) => {
                    warn!(error = %e, record = %raw.trim_end(), "dropping malformed event");
                }
                Err(e) => {
                    warn!(error = %e, "ledger unusable; stopping ingestion");
                    return;
                }
            }
        }
        debug!(stats = ?self.stats(), "ingestion channel closed");
    }
}
