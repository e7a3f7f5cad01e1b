//! # chzap - Live channel zap ledger
//!
//! chzap ingests set-top-box channel-change ("zap") events, keeps a live
//! per-channel viewer count and dwell-time statistics, and streams ranked
//! top-N snapshots to remote subscribers on a cadence each subscriber picks.
//!
//! ## Core Concepts
//!
//! - **Zap**: One box switching from one channel to another at a point in time
//! - **Ledger**: The concurrency-safe viewer and dwell-time state
//! - **Dwell**: Time a box stayed on a channel; dwells under 5s are flip-throughs
//! - **Top-N**: The most-watched channels, ties broken by channel name
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chzap::{top_n, InMemoryLedger, Ingestor};
//!
//! let ledger = Arc::new(InMemoryLedger::default());
//! let ingestor = Ingestor::new(ledger.clone());
//!
//! ingestor.ingest("2013/07/20, 21:56:13, 10.213.223.232, NRK1, TV2 Norge")?;
//! let top = top_n(ledger.as_ref(), 10)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;

// Ledger, ranking and ingestion
pub mod ingest;
pub mod ledger;
pub mod ranking;
pub mod report;

// Subscription streaming
#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use error::{
    ClientError, DecodeError, LedgerError, LedgerResult, ProtocolError, ReportError, ZapError,
    ZapResult,
};
pub use event::{decode, ChannelZap, StatusChange, StbEvent, OFF_CHANNEL};
pub use ingest::{IngestOutcome, IngestStats, Ingestor};
pub use ledger::{DwellStats, InMemoryLedger, LedgerConfig, ViewerLedger};
pub use ranking::{rank, top_n, TopNEntry, DEFAULT_TOP_N};
pub use report::{render_channel_viewers, render_top_table, ReportConfig};

#[cfg(feature = "transport-grpc")]
pub use report::{ReportHandle, ReportLoop};
