//! Abstract ledger trait for chzap.
//!
//! The trait is the capability set every viewer-ledger backend offers. Callers
//! (ranking, subscription streams, reports) only ever see this trait, so a
//! sharded or otherwise specialised backend can replace the in-memory one
//! without touching them.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;
use crate::event::ChannelZap;

/// Dwell-time statistics for one channel.
///
/// Only qualifying dwells (longer than the flip-through threshold) are
/// sampled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DwellStats {
    /// Number of qualifying dwells recorded.
    pub sample_count: u32,
    /// Arithmetic mean of the recorded dwells.
    pub average_dwell: Duration,
}

impl DwellStats {
    /// Folds one more dwell into the running mean.
    ///
    /// `avg' = avg + (dwell - avg) / n'`, computed in signed nanoseconds.
    pub fn record(&mut self, dwell: Duration) {
        self.sample_count = self.sample_count.saturating_add(1);

        let old = i128::try_from(self.average_dwell.as_nanos()).unwrap_or(i128::MAX);
        let sample = i128::try_from(dwell.as_nanos()).unwrap_or(i128::MAX);
        let avg = old + (sample - old) / i128::from(self.sample_count);

        self.average_dwell = Duration::from_nanos(u64::try_from(avg.max(0)).unwrap_or(u64::MAX));
    }
}

/// Live viewer accounting fed by channel zaps.
///
/// # Concurrency
/// - Every method must be safe under unbounded concurrent callers
/// - `log_event` is atomic: readers never observe a half-applied zap
/// - Queries return copies, never references into internal state
pub trait ViewerLedger: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Applies one channel zap.
    ///
    /// Zaps from the same source must be applied in the order they were
    /// received.
    fn log_event(&self, zap: ChannelZap) -> LedgerResult<()>;

    /// Current viewers of `channel`; 0 if the channel was never seen.
    fn live_viewers(&self, channel: &str) -> LedgerResult<u64>;

    /// Every channel seen as the source or target of a zap.
    fn known_channels(&self) -> LedgerResult<BTreeSet<String>>;

    /// Number of known channels.
    fn channel_count(&self) -> LedgerResult<usize>;

    /// Point-in-time copy of all live viewer counts.
    fn snapshot_viewer_counts(&self) -> LedgerResult<HashMap<String, u64>>;

    /// Point-in-time copy of per-channel dwell statistics.
    ///
    /// Backends that do not track dwell time return `Ok(None)`. Channels with
    /// no qualifying sample are absent from the map.
    fn snapshot_dwell_stats(&self) -> LedgerResult<Option<HashMap<String, DwellStats>>> {
        Ok(None)
    }

    /// Number of distinct sources with a remembered last zap.
    fn tracked_sources(&self) -> LedgerResult<usize>;
}
