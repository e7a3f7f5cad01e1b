//! Viewer ledger: the live aggregate of viewer counts and dwell statistics.
//!
//! [`ViewerLedger`] is the interface every consumer uses; [`InMemoryLedger`]
//! is the backend.

mod memory;
mod traits;

pub use memory::{InMemoryLedger, LedgerConfig};
pub use traits::{DwellStats, ViewerLedger};
