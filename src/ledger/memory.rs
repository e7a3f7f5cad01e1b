//! In-memory ledger backend.
//!
//! Tracks the last zap of every source, live counts per channel and dwell
//! statistics per channel. One `RwLock` guards all three maps so a zap is
//! applied as a single step and queries always copy out a consistent view.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::event::ChannelZap;
use crate::ledger::traits::{DwellStats, ViewerLedger};

fn poisoned(context: &'static str) -> LedgerError {
    LedgerError::Poisoned { context }
}

/// Ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Dwells must be strictly longer than this to be sampled. Shorter ones
    /// are flip-throughs: they move live counts but not dwell statistics.
    pub min_qualifying_dwell: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_qualifying_dwell: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    last_seen: HashMap<String, ChannelZap>,
    live: HashMap<String, u64>,
    dwell: HashMap<String, DwellStats>,
}

/// Thread-safe in-memory [`ViewerLedger`].
///
/// State grows with the number of distinct sources and channels seen over the
/// process lifetime; nothing is ever evicted.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    config: LedgerConfig,
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(LedgerState::default()),
        }
    }

    /// The configuration this ledger was built with.
    #[must_use]
    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

impl ViewerLedger for InMemoryLedger {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn log_event(&self, zap: ChannelZap) -> LedgerResult<()> {
        let mut guard = self.state.write().map_err(|_| poisoned("ledger.log_event"))?;
        let state = &mut *guard;

        *state.live.entry(zap.to_channel.clone()).or_insert(0) += 1;
        let from = state.live.entry(zap.from_channel.clone()).or_insert(0);

        if let Some(previous) = state.last_seen.get(&zap.source_ip) {
            *from = from.saturating_sub(1);

            // Negative dwells (out-of-order clocks) never qualify.
            if let Ok(dwell) = zap.duration_since(previous).to_std() {
                if dwell > self.config.min_qualifying_dwell {
                    state
                        .dwell
                        .entry(previous.to_channel.clone())
                        .or_default()
                        .record(dwell);
                }
            }
        }

        tracing::trace!(
            source = %zap.source_ip,
            from = %zap.from_channel,
            to = %zap.to_channel,
            "zap logged"
        );

        state.last_seen.insert(zap.source_ip.clone(), zap);
        Ok(())
    }

    fn live_viewers(&self, channel: &str) -> LedgerResult<u64> {
        let state = self.state.read().map_err(|_| poisoned("ledger.live_viewers"))?;
        Ok(state.live.get(channel).copied().unwrap_or(0))
    }

    fn known_channels(&self) -> LedgerResult<BTreeSet<String>> {
        let state = self.state.read().map_err(|_| poisoned("ledger.known_channels"))?;
        Ok(state.live.keys().cloned().collect())
    }

    fn channel_count(&self) -> LedgerResult<usize> {
        let state = self.state.read().map_err(|_| poisoned("ledger.channel_count"))?;
        Ok(state.live.len())
    }

    fn snapshot_viewer_counts(&self) -> LedgerResult<HashMap<String, u64>> {
        let state = self
            .state
            .read()
            .map_err(|_| poisoned("ledger.snapshot_viewer_counts"))?;
        Ok(state.live.clone())
    }

    fn snapshot_dwell_stats(&self) -> LedgerResult<Option<HashMap<String, DwellStats>>> {
        let state = self
            .state
            .read()
            .map_err(|_| poisoned("ledger.snapshot_dwell_stats"))?;
        Ok(Some(state.dwell.clone()))
    }

    fn tracked_sources(&self) -> LedgerResult<usize> {
        let state = self.state.read().map_err(|_| poisoned("ledger.tracked_sources"))?;
        Ok(state.last_seen.len())
    }
}
