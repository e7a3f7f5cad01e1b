//! Error types for chzap.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! exact failure: a malformed record, a poisoned ledger, a bad subscription
//! request, a broken subscription stream or a report with too little data.

use thiserror::Error;

/// A raw event record that could not be decoded.
///
/// The offending record is dropped by the ingestion path; it never reaches the
/// ledger and never stops ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Event of length {len} is shorter than the minimum of {min}")]
    TooShort {
        len: usize,
        min: usize,
    },

    #[error("Could not parse timestamp '{field}': {reason}")]
    InvalidTimestamp {
        field: String,
        reason: String,
    },

    #[error("Event needs 2 or 3 fields, but found {found}")]
    FieldCount {
        found: usize,
    },

    #[error("Event field {index} is empty")]
    EmptyField {
        index: usize,
    },
}

/// Errors surfaced by a viewer ledger backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Ledger lock poisoned: {context}")]
    Poisoned {
        context: &'static str,
    },
}

/// A viewer report that cannot be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("Only {have} of {need} channels seen so far")]
    NotReady {
        have: usize,
        need: usize,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// An invalid initial subscription request.
///
/// Closes that subscriber's connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Refresh interval must be greater than zero")]
    ZeroRefreshInterval,

    #[error("Refresh interval of {requested}s exceeds maximum of {max}s")]
    RefreshIntervalTooLong {
        requested: u32,
        max: u32,
    },

    #[error("Unknown statistic selector: {value}")]
    UnknownStatistic {
        value: i32,
    },
}

/// Errors raised by a subscription client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Connection failed: {message}")]
    Connect {
        message: String,
    },

    #[error("Error response from server: '{status}'")]
    ServerStatus {
        status: String,
    },

    #[error("Malformed response: {message}")]
    Malformed {
        message: String,
    },

    #[error("Unexpected stream error ({code}): {message}")]
    UnexpectedStatus {
        code: String,
        message: String,
    },

    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectsExhausted {
        attempts: u32,
    },
}

impl ClientError {
    /// Returns true if the server or the payload violated the protocol.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::ServerStatus { .. } | Self::Malformed { .. } | Self::UnexpectedStatus { .. }
        )
    }
}

/// Top-level error type for chzap.
#[derive(Debug, Error)]
pub enum ZapError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}

impl ZapError {
    /// Returns true if this is a decode error.
    #[must_use]
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    /// Returns true if this is a client error.
    #[must_use]
    pub const fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    /// Returns true if re-subscribing may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Client(e) => matches!(
                e,
                ClientError::Connect { .. } | ClientError::ReconnectsExhausted { .. }
            ),
            Self::Decode(_) | Self::Ledger(_) | Self::Protocol(_) | Self::Report(_) => false,
        }
    }
}

/// Result type alias for chzap operations.
pub type ZapResult<T> = Result<T, ZapError>;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
