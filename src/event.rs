//! Set-top-box event records.
//!
//! A raw record carries a fixed-width timestamp followed by comma-separated
//! fields:
//!
//! ```text
//! 2013/07/20, 21:56:13, 10.213.223.232, NRK1, TV2 Norge    (channel zap)
//! 2013/07/20, 21:56:13, 10.213.223.232, HDMI_Status: 0     (status change)
//! ```
//!
//! Decoding is pure: the same input always yields the same typed event.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Channel name used for "no channel", e.g. a box being switched on or off.
pub const OFF_CHANNEL: &str = "OFF";

/// Records shorter than this cannot hold a timestamp and two fields.
pub const MIN_EVENT_LEN: usize = 30;

const DATETIME_FORMAT: &str = "%Y/%m/%d, %H:%M:%S";
const DATE_FORMAT: &str = "%Y/%m/%d";
const TIMESTAMP_LEN: usize = 20;
const FIELD_SEPARATOR: &str = ", ";
const FIELDS_OFFSET: usize = TIMESTAMP_LEN + FIELD_SEPARATOR.len();

/// A viewer switching from one channel to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelZap {
    /// When the switch happened.
    pub time: NaiveDateTime,
    /// Address of the set-top box.
    pub source_ip: String,
    /// Channel switched away from ([`OFF_CHANNEL`] when the box was off).
    pub from_channel: String,
    /// Channel switched to.
    pub to_channel: String,
}

impl ChannelZap {
    /// Time elapsed between `earlier` and this zap.
    ///
    /// Negative when `earlier` actually happened after this zap.
    #[must_use]
    pub fn duration_since(&self, earlier: &Self) -> Duration {
        self.time - earlier.time
    }

    /// The zap's date as `YYYY/MM/DD`.
    #[must_use]
    pub fn date(&self) -> String {
        self.time.format(DATE_FORMAT).to_string()
    }
}

impl fmt::Display for ChannelZap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Time: {}, Date: {}, fromChan: {}, toChan: {}, IP: {}",
            self.time.format("%H:%M:%S"),
            self.date(),
            self.from_channel,
            self.to_channel,
            self.source_ip
        )
    }
}

/// A device status report (e.g. power or HDMI state).
///
/// Accepted by the ingestion path but never folded into viewer accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// When the status was reported.
    pub time: NaiveDateTime,
    /// Address of the set-top box.
    pub source_ip: String,
    /// Raw status text.
    pub status_text: String,
}

impl fmt::Display for StatusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_text)
    }
}

/// A decoded set-top-box event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StbEvent {
    /// A channel change.
    Zap(ChannelZap),
    /// A status report.
    Status(StatusChange),
}

impl StbEvent {
    /// Address of the reporting set-top box.
    #[must_use]
    pub fn source_ip(&self) -> &str {
        match self {
            Self::Zap(z) => &z.source_ip,
            Self::Status(s) => &s.source_ip,
        }
    }

    /// Timestamp of the event.
    #[must_use]
    pub const fn time(&self) -> NaiveDateTime {
        match self {
            Self::Zap(z) => z.time,
            Self::Status(s) => s.time,
        }
    }

    /// Returns the zap if this is a channel change.
    #[must_use]
    pub fn into_zap(self) -> Option<ChannelZap> {
        match self {
            Self::Zap(z) => Some(z),
            Self::Status(_) => None,
        }
    }
}

impl FromStr for StbEvent {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

/// Decodes one raw record into a typed event.
///
/// # Errors
///
/// Returns [`DecodeError`] when the record is too short, the timestamp does not
/// match `YYYY/MM/DD, HH:MM:SS`, a field is empty, or the number of trailing
/// fields is neither 2 nor 3.
pub fn decode(raw: &str) -> Result<StbEvent, DecodeError> {
    let too_short = || DecodeError::TooShort {
        len: raw.len(),
        min: MIN_EVENT_LEN,
    };

    if raw.len() < MIN_EVENT_LEN {
        return Err(too_short());
    }

    // Byte offsets may land inside a multi-byte character on garbage input.
    let stamp = raw.get(..TIMESTAMP_LEN).ok_or_else(too_short)?;
    let rest = raw.get(FIELDS_OFFSET..).ok_or_else(too_short)?;

    let time = NaiveDateTime::parse_from_str(stamp, DATETIME_FORMAT).map_err(|e| {
        DecodeError::InvalidTimestamp {
            field: stamp.to_string(),
            reason: e.to_string(),
        }
    })?;

    if raw.get(TIMESTAMP_LEN..FIELDS_OFFSET) != Some(FIELD_SEPARATOR) {
        return Err(DecodeError::InvalidTimestamp {
            field: raw.get(..FIELDS_OFFSET).unwrap_or(stamp).to_string(),
            reason: "timestamp is not followed by a field separator".to_string(),
        });
    }

    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    if fields.len() != 2 && fields.len() != 3 {
        return Err(DecodeError::FieldCount {
            found: fields.len(),
        });
    }
    if let Some(index) = fields.iter().position(|f| f.is_empty()) {
        return Err(DecodeError::EmptyField { index });
    }

    let event = match fields.as_slice() {
        [ip, status] => StbEvent::Status(StatusChange {
            time,
            source_ip: (*ip).to_string(),
            status_text: (*status).to_string(),
        }),
        [ip, from, to] => StbEvent::Zap(ChannelZap {
            time,
            source_ip: (*ip).to_string(),
            from_channel: (*from).to_string(),
            to_channel: (*to).to_string(),
        }),
        _ => {
            return Err(DecodeError::FieldCount {
                found: fields.len(),
            })
        }
    };

    Ok(event)
}
