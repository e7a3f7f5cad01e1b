//! Top-N channel ranking.
//!
//! Rankings are computed from a viewer-count snapshot and never mutate the
//! ledger.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;
use crate::event::OFF_CHANNEL;
use crate::ledger::ViewerLedger;

/// Default length of a ranking pushed to subscribers.
pub const DEFAULT_TOP_N: usize = 10;

/// One ranked channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopNEntry {
    /// Channel name.
    pub channel: String,
    /// Live viewers.
    pub viewers: u64,
}

/// Ranks a viewer-count snapshot.
///
/// Skips [`OFF_CHANNEL`] and channels without viewers, orders by viewers
/// descending with ties broken by channel name ascending, and keeps at most
/// `n` entries.
#[must_use]
pub fn rank(counts: HashMap<String, u64>, n: usize) -> Vec<TopNEntry> {
    let mut entries: Vec<TopNEntry> = counts
        .into_iter()
        .filter(|(channel, viewers)| *viewers >= 1 && channel != OFF_CHANNEL)
        .map(|(channel, viewers)| TopNEntry { channel, viewers })
        .collect();

    entries.sort_by(|a, b| {
        b.viewers
            .cmp(&a.viewers)
            .then_with(|| a.channel.cmp(&b.channel))
    });
    entries.truncate(n);
    entries
}

/// The `n` most-watched channels of `ledger`.
///
/// Returns an empty list when no channel has viewers.
pub fn top_n<L: ViewerLedger + ?Sized>(ledger: &L, n: usize) -> LedgerResult<Vec<TopNEntry>> {
    Ok(rank(ledger.snapshot_viewer_counts()?, n))
}
