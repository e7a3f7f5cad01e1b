//! Subscription service.
//!
//! Each accepted subscription gets its own task that pushes a ranked snapshot
//! of the shared ledger every refresh interval. The task ends when the
//! subscriber goes away, when a push fails, or when the service is shut down.
//! The server never reconnects to a subscriber.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{LedgerResult, ProtocolError};
use crate::ledger::{DwellStats, ViewerLedger};
use crate::ranking::{top_n, TopNEntry, DEFAULT_TOP_N};

use super::proto::subscription_server::{Subscription, SubscriptionServer};
use super::proto::{self, Statistic};
use super::{format_duration, STATUS_NOT_READY, STATUS_OK};

/// Subscription service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Length of every pushed ranking.
    pub top_n: usize,
    /// Wait before re-checking an empty ledger, whatever the subscriber asked for.
    pub not_ready_retry: Duration,
    /// Largest refresh interval a subscriber may request.
    pub max_refresh_interval_seconds: u32,
    /// Notifications buffered per subscriber.
    pub stream_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
            not_ready_retry: Duration::from_secs(3),
            max_refresh_interval_seconds: 3600,
            stream_capacity: 4,
        }
    }
}

/// A validated subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Time between pushes.
    pub refresh_interval: Duration,
    /// Statistic fields to fill.
    pub statistic: Statistic,
}

impl SubscriptionRequest {
    /// Validates a wire request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for a zero or oversized interval and for an
    /// unknown statistic selector.
    pub fn from_proto(
        req: &proto::SubscribeRequest,
        config: &SubscriptionConfig,
    ) -> Result<Self, ProtocolError> {
        if req.refresh_interval_seconds == 0 {
            return Err(ProtocolError::ZeroRefreshInterval);
        }
        if req.refresh_interval_seconds > config.max_refresh_interval_seconds {
            return Err(ProtocolError::RefreshIntervalTooLong {
                requested: req.refresh_interval_seconds,
                max: config.max_refresh_interval_seconds,
            });
        }
        let statistic = Statistic::try_from(req.statistic)
            .map_err(|_| ProtocolError::UnknownStatistic { value: req.statistic })?;

        Ok(Self {
            refresh_interval: Duration::from_secs(u64::from(req.refresh_interval_seconds)),
            statistic,
        })
    }
}

/// Identifier of one subscription, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    /// Creates a random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Control handle for a running [`SubscriptionService`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    shutdown: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl SubscriptionHandle {
    /// Stops every streaming loop and refuses new subscriptions.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Number of subscriptions currently streaming.
    #[must_use]
    pub fn active_subscribers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// gRPC subscription service over a shared ledger.
pub struct SubscriptionService {
    ledger: Arc<dyn ViewerLedger>,
    config: SubscriptionConfig,
    handle: SubscriptionHandle,
}

impl fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("ledger", &self.ledger.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SubscriptionService {
    /// Creates a service over `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn ViewerLedger>, config: SubscriptionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ledger,
            config,
            handle: SubscriptionHandle {
                shutdown: Arc::new(shutdown),
                active: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// A handle that outlives [`Self::into_server`].
    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Wraps the service for `tonic::transport::Server::add_service`.
    #[must_use]
    pub fn into_server(self) -> SubscriptionServer<Self> {
        SubscriptionServer::new(self)
    }
}

fn status_from_protocol_error(err: &ProtocolError) -> Status {
    Status::invalid_argument(err.to_string())
}

fn not_ready(retry: Duration) -> proto::Notification {
    proto::Notification {
        status: format!(
            "{STATUS_NOT_READY}: The server has not yet logged any channels. Retrying in {}",
            format_duration(retry)
        ),
        entries: Vec::new(),
    }
}

fn channel_entry(entry: TopNEntry, stats: DwellStats, statistic: Statistic) -> proto::ChannelEntry {
    let mut out = proto::ChannelEntry {
        channel_name: entry.channel,
        viewer_count: u32::try_from(entry.viewers).unwrap_or(u32::MAX),
        ..Default::default()
    };

    if matches!(statistic, Statistic::Summary | Statistic::SampleSize) {
        out.sample_size = stats.sample_count;
    }
    if matches!(statistic, Statistic::Summary | Statistic::AverageDuration) {
        out.average_duration = format_duration(stats.average_dwell);
    }
    out
}

/// Builds an `Ok` notification with the `n` most-watched channels.
///
/// Dwell statistics are filled according to `statistic`; they stay zero when
/// the ledger does not track dwell time or a channel has no samples.
pub fn snapshot_notification<L: ViewerLedger + ?Sized>(
    ledger: &L,
    statistic: Statistic,
    n: usize,
) -> LedgerResult<proto::Notification> {
    let ranking = top_n(ledger, n)?;
    let stats = ledger.snapshot_dwell_stats()?.unwrap_or_default();

    let entries = ranking
        .into_iter()
        .map(|entry| {
            let channel_stats = stats.get(&entry.channel).copied().unwrap_or_default();
            channel_entry(entry, channel_stats, statistic)
        })
        .collect();

    Ok(proto::Notification {
        status: STATUS_OK.to_string(),
        entries,
    })
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn stream_loop(
    ledger: Arc<dyn ViewerLedger>,
    config: SubscriptionConfig,
    request: SubscriptionRequest,
    tx: mpsc::Sender<Result<proto::Notification, Status>>,
    mut shutdown: watch::Receiver<bool>,
    _active: ActiveGuard,
) {
    loop {
        if *shutdown.borrow_and_update() {
            debug!("service shutting down");
            return;
        }

        let push = match ledger.channel_count() {
            Ok(count) if count < 1 => Ok((not_ready(config.not_ready_retry), config.not_ready_retry)),
            Ok(_) => snapshot_notification(&*ledger, request.statistic, config.top_n)
                .map(|n| (n, request.refresh_interval)),
            Err(e) => Err(e),
        };

        let (notification, wait) = match push {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "ledger read failed; closing subscription");
                let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                return;
            }
        };

        if tx.send(Ok(notification)).await.is_err() {
            debug!("subscriber disconnected");
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = tx.closed() => {
                debug!("subscriber disconnected");
                return;
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    debug!("service dropped");
                    return;
                }
            }
        }
    }
}

#[tonic::async_trait]
impl Subscription for SubscriptionService {
    type SubscribeStream = ReceiverStream<Result<proto::Notification, Status>>;

    async fn subscribe(
        &self,
        request: Request<proto::SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let request = SubscriptionRequest::from_proto(&req, &self.config).map_err(|e| {
            warn!(error = %e, "rejecting subscription");
            status_from_protocol_error(&e)
        })?;

        if *self.handle.shutdown.borrow() {
            return Err(Status::unavailable("subscription service is shutting down"));
        }

        let id = SubscriberId::new();
        info!(
            subscriber = %id,
            refresh_interval = ?request.refresh_interval,
            statistic = request.statistic.as_str_name(),
            "subscription accepted"
        );

        let (tx, rx) = mpsc::channel(self.config.stream_capacity.max(1));
        let active = ActiveGuard::enter(&self.handle.active);
        tokio::spawn(
            stream_loop(
                Arc::clone(&self.ledger),
                self.config.clone(),
                request,
                tx,
                self.handle.shutdown.subscribe(),
                active,
            )
            .instrument(info_span!("subscriber", id = %id)),
        );

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{BTreeSet, HashMap};

    use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
    use tokio::time::Instant;
    use tokio_stream::StreamExt;
    use tonic::Code;

    use crate::event::{ChannelZap, OFF_CHANNEL};
    use crate::ledger::InMemoryLedger;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 7, 20)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap()
    }

    fn zap(secs: i64, ip: &str, from: &str, to: &str) -> ChannelZap {
        ChannelZap {
            time: t0() + ChronoDuration::seconds(secs),
            source_ip: ip.to_string(),
            from_channel: from.to_string(),
            to_channel: to.to_string(),
        }
    }

    fn seeded_ledger() -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::default());
        ledger.log_event(zap(0, "ip1", OFF_CHANNEL, "NRK1")).unwrap();
        ledger.log_event(zap(10, "ip1", "NRK1", "TV2")).unwrap();
        ledger.log_event(zap(0, "ip2", OFF_CHANNEL, "TV2")).unwrap();
        ledger.log_event(zap(0, "ip3", OFF_CHANNEL, "NRK1")).unwrap();
        ledger
    }

    fn request(secs: u32, statistic: Statistic) -> Request<proto::SubscribeRequest> {
        Request::new(proto::SubscribeRequest {
            refresh_interval_seconds: secs,
            statistic: statistic as i32,
        })
    }

    /// Reports viewer counts but no dwell statistics.
    struct CountsOnly(InMemoryLedger);

    impl ViewerLedger for CountsOnly {
        fn name(&self) -> &'static str {
            "counts-only"
        }
        fn log_event(&self, zap: ChannelZap) -> LedgerResult<()> {
            self.0.log_event(zap)
        }
        fn live_viewers(&self, channel: &str) -> LedgerResult<u64> {
            self.0.live_viewers(channel)
        }
        fn known_channels(&self) -> LedgerResult<BTreeSet<String>> {
            self.0.known_channels()
        }
        fn channel_count(&self) -> LedgerResult<usize> {
            self.0.channel_count()
        }
        fn snapshot_viewer_counts(&self) -> LedgerResult<HashMap<String, u64>> {
            self.0.snapshot_viewer_counts()
        }
        fn tracked_sources(&self) -> LedgerResult<usize> {
            self.0.tracked_sources()
        }
    }

    #[tokio::test]
    async fn rejects_zero_interval() {
        let svc = SubscriptionService::new(seeded_ledger(), SubscriptionConfig::default());
        let err = svc.subscribe(request(0, Statistic::Summary)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(svc.handle().active_subscribers(), 0);
    }

    #[tokio::test]
    async fn rejects_unknown_statistic_and_long_interval() {
        let svc = SubscriptionService::new(seeded_ledger(), SubscriptionConfig::default());

        let err = svc
            .subscribe(Request::new(proto::SubscribeRequest {
                refresh_interval_seconds: 1,
                statistic: 42,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = svc.subscribe(request(7200, Statistic::Summary)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ledger_sends_not_ready_on_fixed_retry() {
        let ledger = Arc::new(InMemoryLedger::default());
        let svc = SubscriptionService::new(ledger.clone(), SubscriptionConfig::default());
        let mut stream = svc
            .subscribe(request(1, Statistic::Summary))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.status.starts_with("2: "), "status was {}", first.status);
        assert!(first.entries.is_empty());

        let start = Instant::now();
        ledger.log_event(zap(0, "ip1", OFF_CHANNEL, "NRK1")).unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(second.status, STATUS_OK);
        assert_eq!(second.entries[0].channel_name, "NRK1");
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_on_requested_cadence() {
        let svc = SubscriptionService::new(seeded_ledger(), SubscriptionConfig::default());
        let mut stream = svc
            .subscribe(request(2, Statistic::ViewerCount))
            .await
            .unwrap()
            .into_inner();

        stream.next().await.unwrap().unwrap();
        let start = Instant::now();
        stream.next().await.unwrap().unwrap();
        stream.next().await.unwrap().unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn selector_controls_statistic_fields() {
        let ledger = seeded_ledger();
        let svc = SubscriptionService::new(ledger, SubscriptionConfig::default());

        let first_entry = |n: proto::Notification| {
            n.entries
                .into_iter()
                .find(|e| e.channel_name == "NRK1")
                .unwrap()
        };

        let mut summary = svc.subscribe(request(1, Statistic::Summary)).await.unwrap().into_inner();
        let e = first_entry(summary.next().await.unwrap().unwrap());
        assert_eq!((e.viewer_count, e.sample_size, e.average_duration.as_str()), (1, 1, "10s"));

        let mut sample = svc.subscribe(request(1, Statistic::SampleSize)).await.unwrap().into_inner();
        let e = first_entry(sample.next().await.unwrap().unwrap());
        assert_eq!((e.viewer_count, e.sample_size, e.average_duration.as_str()), (1, 1, ""));

        let mut avg = svc
            .subscribe(request(1, Statistic::AverageDuration))
            .await
            .unwrap()
            .into_inner();
        let e = first_entry(avg.next().await.unwrap().unwrap());
        assert_eq!((e.viewer_count, e.sample_size, e.average_duration.as_str()), (1, 0, "10s"));

        let mut viewers = svc.subscribe(request(1, Statistic::ViewerCount)).await.unwrap().into_inner();
        let e = first_entry(viewers.next().await.unwrap().unwrap());
        assert_eq!((e.viewer_count, e.sample_size, e.average_duration.as_str()), (1, 0, ""));
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_without_dwell_tracking_leaves_stats_zero() {
        let inner = InMemoryLedger::default();
        inner.log_event(zap(0, "ip1", OFF_CHANNEL, "NRK1")).unwrap();
        inner.log_event(zap(60, "ip1", "NRK1", "TV2")).unwrap();
        let svc = SubscriptionService::new(Arc::new(CountsOnly(inner)), SubscriptionConfig::default());

        let mut stream = svc.subscribe(request(1, Statistic::Summary)).await.unwrap().into_inner();
        let n = stream.next().await.unwrap().unwrap();
        assert_eq!(n.status, STATUS_OK);
        assert_eq!(n.entries.len(), 1);
        assert_eq!(n.entries[0].channel_name, "TV2");
        assert_eq!(n.entries[0].sample_size, 0);
        assert_eq!(n.entries[0].average_duration, "0s");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscriber_releases_its_loop() {
        let svc = SubscriptionService::new(seeded_ledger(), SubscriptionConfig::default());
        let handle = svc.handle();

        let mut stream = svc.subscribe(request(5, Statistic::Summary)).await.unwrap().into_inner();
        stream.next().await.unwrap().unwrap();
        assert_eq!(handle.active_subscribers(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.active_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_streams_and_refuses_new_ones() {
        let svc = SubscriptionService::new(seeded_ledger(), SubscriptionConfig::default());
        let handle = svc.handle();

        let mut stream = svc.subscribe(request(60, Statistic::Summary)).await.unwrap().into_inner();
        stream.next().await.unwrap().unwrap();

        handle.shutdown();
        assert!(stream.next().await.is_none());
        assert_eq!(handle.active_subscribers(), 0);

        let err = svc.subscribe(request(1, Statistic::Summary)).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_service_ends_streams() {
        let svc = SubscriptionService::new(seeded_ledger(), SubscriptionConfig::default());

        let mut stream = svc.subscribe(request(10, Statistic::Summary)).await.unwrap().into_inner();
        stream.next().await.unwrap().unwrap();

        let start = Instant::now();
        drop(svc);
        assert!(stream.next().await.is_none());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn snapshot_notification_ranks_and_excludes_off() {
        let ledger = seeded_ledger();
        for i in 0..5 {
            ledger
                .log_event(zap(0, &format!("off{i}"), "NRK1", OFF_CHANNEL))
                .unwrap();
        }
        let n = snapshot_notification(&*ledger, Statistic::ViewerCount, 10).unwrap();
        let names: Vec<&str> = n.entries.iter().map(|e| e.channel_name.as_str()).collect();
        assert_eq!(names, ["TV2", "NRK1"]);
        assert_eq!(ledger.live_viewers(OFF_CHANNEL).unwrap(), 5);
    }
}
