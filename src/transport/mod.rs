//! gRPC subscription transport.
//!
//! A subscriber sends one `SubscribeRequest` and then receives a
//! `Notification` on every refresh until it disconnects. The `status` field of
//! each notification is `"1"` when it carries a ranking and `"2: <hint>"` while
//! the server has nothing to rank yet; any other status is an unrecoverable
//! server-side error.

use std::time::Duration;

pub mod client;
pub mod server;

pub mod proto {
    #![allow(missing_docs, clippy::pedantic)]
    tonic::include_proto!("chzap");
}

pub use client::{
    connect, subscribe, subscribe_with, ClientConfig, NotificationSource, RankedChannel,
    SubscriptionEvent,
};
pub use proto::Statistic;
pub use server::{
    snapshot_notification, SubscriberId, SubscriptionConfig, SubscriptionHandle,
    SubscriptionRequest, SubscriptionService,
};

/// Status of a notification carrying a ranking.
pub const STATUS_OK: &str = "1";

/// Status prefix of a notification sent while no channel is known yet.
pub const STATUS_NOT_READY: &str = "2";

/// Renders a duration truncated to whole seconds, e.g. `1h2m3s`, `4m0s`, `17s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
