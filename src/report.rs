//! Local viewer report.
//!
//! Renders the live state of a ledger for a console: the viewer count of one
//! watched channel and a local top-N table. [`ReportLoop`] re-renders both on
//! a fixed tick until it is stopped.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReportError;
use crate::ledger::ViewerLedger;
use crate::ranking::{top_n, DEFAULT_TOP_N};

/// Channels that must be known before a top-N table is rendered.
pub const DEFAULT_MIN_CHANNELS: usize = 2;

/// Report configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Time between two renders.
    pub interval: Duration,
    /// Channel whose viewer count is reported on every tick, if any.
    pub channel: Option<String>,
    /// Length of the top table; 0 disables it.
    pub top_n: usize,
    /// Known channels required before the top table is rendered.
    pub min_channels: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            channel: None,
            top_n: DEFAULT_TOP_N,
            min_channels: DEFAULT_MIN_CHANNELS,
        }
    }
}

/// One line with the live viewers of `channel`, e.g.
/// `NRK1:             12 viewers`.
///
/// # Errors
///
/// Returns [`ReportError::Ledger`] if the ledger is unusable.
pub fn render_channel_viewers<L: ViewerLedger + ?Sized>(
    ledger: &L,
    channel: &str,
) -> Result<String, ReportError> {
    let viewers = ledger.live_viewers(channel)?;
    Ok(format!("{:<18}{viewers} viewers", format!("{channel}:")))
}

/// A ranked table of the `n` most-watched channels.
///
/// # Errors
///
/// Returns [`ReportError::NotReady`] while fewer than `min_channels` channels
/// are known.
pub fn render_top_table<L: ViewerLedger + ?Sized>(
    ledger: &L,
    n: usize,
    min_channels: usize,
) -> Result<String, ReportError> {
    let have = ledger.channel_count()?;
    if have < min_channels {
        return Err(ReportError::NotReady {
            have,
            need: min_channels,
        });
    }

    let mut out = String::from("\n    Channel\t     Viewers");
    for (i, entry) in top_n(ledger, n)?.iter().enumerate() {
        let _ = write!(out, "\n{:>2}: {:<18}{:>3}", i + 1, entry.channel, entry.viewers);
    }
    Ok(out)
}

#[cfg(feature = "transport-grpc")]
pub use ticker::{ReportHandle, ReportLoop};

#[cfg(feature = "transport-grpc")]
mod ticker {
    use std::sync::Arc;

    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::{interval_at, Instant, MissedTickBehavior};
    use tracing::{debug, warn};

    use super::{render_channel_viewers, render_top_table, ReportConfig};
    use crate::error::ReportError;
    use crate::ledger::ViewerLedger;

    /// Periodic report driven by a tokio interval.
    pub struct ReportLoop;

    impl ReportLoop {
        /// Starts rendering into `sink` every `config.interval`.
        ///
        /// The first render happens one interval after the call. Must be
        /// called from within a tokio runtime.
        pub fn spawn<F>(ledger: Arc<dyn ViewerLedger>, config: ReportConfig, mut sink: F) -> ReportHandle
        where
            F: FnMut(String) + Send + 'static,
        {
            let (stop_tx, mut stop_rx) = watch::channel(false);

            let task = tokio::spawn(async move {
                let period = config.interval.max(std::time::Duration::from_millis(1));
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = stop_rx.changed() => break,
                    }

                    if let Some(channel) = &config.channel {
                        match render_channel_viewers(ledger.as_ref(), channel) {
                            Ok(line) => sink(line),
                            Err(e) => {
                                warn!(error = %e, "report stopped");
                                return;
                            }
                        }
                    }

                    if config.top_n == 0 {
                        continue;
                    }
                    match render_top_table(ledger.as_ref(), config.top_n, config.min_channels) {
                        Ok(table) => sink(table),
                        Err(ReportError::NotReady { have, need }) => {
                            debug!(have, need, "too few channels for a top table");
                        }
                        Err(e) => {
                            warn!(error = %e, "report stopped");
                            return;
                        }
                    }
                }
                debug!("report loop stopped");
            });

            ReportHandle { stop: stop_tx, task }
        }
    }

    /// Controls a running [`ReportLoop`]. Dropping it stops the loop.
    #[derive(Debug)]
    pub struct ReportHandle {
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    impl ReportHandle {
        /// Stops the loop and waits for it to exit.
        pub async fn stop(self) {
            self.stop.send_replace(true);
            let _ = self.task.await;
        }

        /// Returns true once the loop has exited.
        #[must_use]
        pub fn is_finished(&self) -> bool {
            self.task.is_finished()
        }
    }
}
