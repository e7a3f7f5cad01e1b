//! Subscription client.
//!
//! [`subscribe_with`] turns a [`NotificationSource`] into an endless stream of
//! [`SubscriptionEvent`]s. A stream that ends gracefully, a transport that
//! reports itself unavailable, or a connection cut mid-stream is re-opened
//! after a fixed delay, up to a bounded number of consecutive attempts.
//! Anything else the server sends that does not fit the protocol ends the
//! stream with a [`ClientError`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::error::ClientError;

use super::proto::subscription_client::SubscriptionClient;
use super::proto::{self, Statistic};
use super::{STATUS_NOT_READY, STATUS_OK};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wait before re-opening an ended stream.
    pub retry_delay: Duration,
    /// Consecutive re-open attempts before giving up.
    pub max_reconnects: u32,
    /// Events buffered between the background task and the caller.
    pub buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            max_reconnects: 5,
            buffer: 16,
        }
    }
}

/// One ranked channel as received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedChannel {
    /// Channel name.
    pub channel: String,
    /// Live viewers.
    pub viewers: u32,
    /// Qualifying dwells sampled; 0 unless requested.
    pub sample_size: u32,
    /// Mean dwell such as `4m10s`; empty unless requested.
    pub average_duration: String,
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    /// The server has nothing to rank yet.
    NotReady {
        /// Human-readable retry hint.
        hint: String,
    },
    /// A ranked snapshot, most-watched first.
    Ranking {
        /// Ranked channels.
        channels: Vec<RankedChannel>,
    },
}

/// Something that can open a notification stream.
///
/// Implemented for the generated gRPC client; tests substitute scripted
/// streams.
#[tonic::async_trait]
pub trait NotificationSource: Send + 'static {
    /// The notification stream type.
    type Stream: Stream<Item = Result<proto::Notification, Status>> + Send + 'static;

    /// Opens a new subscription.
    async fn open(&mut self, request: proto::SubscribeRequest) -> Result<Self::Stream, Status>;
}

#[tonic::async_trait]
impl NotificationSource for SubscriptionClient<Channel> {
    type Stream = tonic::Streaming<proto::Notification>;

    async fn open(&mut self, request: proto::SubscribeRequest) -> Result<Self::Stream, Status> {
        Ok(self.subscribe(request).await?.into_inner())
    }
}

/// Connects to a subscription server, e.g. `http://127.0.0.1:11101`.
///
/// # Errors
///
/// Returns [`ClientError::Connect`] if the address is invalid or the server
/// cannot be reached.
pub async fn connect(addr: impl Into<String>) -> Result<SubscriptionClient<Channel>, ClientError> {
    let channel = Channel::from_shared(addr.into())
        .map_err(|e| ClientError::Connect {
            message: format!("invalid server address: {e}"),
        })?
        .connect()
        .await
        .map_err(|e| ClientError::Connect {
            message: e.to_string(),
        })?;
    Ok(SubscriptionClient::new(channel))
}

/// Connects to `addr` and subscribes.
///
/// # Errors
///
/// Returns [`ClientError::Connect`] if the server cannot be reached.
pub async fn subscribe(
    addr: impl Into<String>,
    refresh_interval_seconds: u32,
    statistic: Statistic,
    config: ClientConfig,
) -> Result<ReceiverStream<Result<SubscriptionEvent, ClientError>>, ClientError> {
    let client = connect(addr).await?;
    let request = proto::SubscribeRequest {
        refresh_interval_seconds,
        statistic: statistic as i32,
    };
    Ok(subscribe_with(client, request, config))
}

/// Subscribes through `source` and streams events until a fatal error.
///
/// The stream ends right after yielding an error. Dropping it stops the
/// background task.
pub fn subscribe_with<S: NotificationSource>(
    source: S,
    request: proto::SubscribeRequest,
    config: ClientConfig,
) -> ReceiverStream<Result<SubscriptionEvent, ClientError>> {
    let (tx, rx) = mpsc::channel(config.buffer.max(1));
    tokio::spawn(run(source, request, config, tx));
    ReceiverStream::new(rx)
}

/// Unavailable servers and connections cut under a stream are retried.
fn is_disconnect(status: &Status) -> bool {
    if status.code() == Code::Unavailable {
        return true;
    }

    let mut source = std::error::Error::source(status);
    while let Some(err) = source {
        if err.is::<h2::Error>() || err.is::<hyper::Error>() || err.is::<std::io::Error>() {
            return true;
        }
        source = err.source();
    }
    false
}

fn unexpected(status: &Status) -> ClientError {
    ClientError::UnexpectedStatus {
        code: format!("{:?}", status.code()),
        message: status.message().to_string(),
    }
}

fn interpret(notification: proto::Notification) -> Result<SubscriptionEvent, ClientError> {
    let status = notification.status.trim();

    if status.is_empty() {
        return Err(ClientError::Malformed {
            message: "notification without status".to_string(),
        });
    }

    if let Some(hint) = status.strip_prefix(STATUS_NOT_READY) {
        return Ok(SubscriptionEvent::NotReady {
            hint: hint.trim_start_matches(':').trim().to_string(),
        });
    }

    if !status.starts_with(STATUS_OK) {
        return Err(ClientError::ServerStatus {
            status: status.to_string(),
        });
    }

    let channels = notification
        .entries
        .into_iter()
        .map(|e| {
            if e.channel_name.is_empty() {
                return Err(ClientError::Malformed {
                    message: "ranked entry without channel name".to_string(),
                });
            }
            Ok(RankedChannel {
                channel: e.channel_name,
                viewers: e.viewer_count,
                sample_size: e.sample_size,
                average_duration: e.average_duration,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SubscriptionEvent::Ranking { channels })
}

async fn run<S: NotificationSource>(
    mut source: S,
    request: proto::SubscribeRequest,
    config: ClientConfig,
    tx: mpsc::Sender<Result<SubscriptionEvent, ClientError>>,
) {
    let mut attempts = 0u32;

    loop {
        match source.open(request.clone()).await {
            Ok(stream) => {
                let mut stream = Box::pin(stream);
                while let Some(item) = stream.next().await {
                    let event = match item {
                        Ok(notification) => {
                            attempts = 0;
                            interpret(notification)
                        }
                        Err(status) if is_disconnect(&status) => {
                            debug!(error = %status, "subscription transport dropped");
                            break;
                        }
                        Err(status) => Err(unexpected(&status)),
                    };

                    let fatal = event.is_err();
                    if tx.send(event).await.is_err() || fatal {
                        return;
                    }
                }
            }
            Err(status) if is_disconnect(&status) => {
                debug!(error = %status, "subscription server unavailable");
            }
            Err(status) => {
                let _ = tx.send(Err(unexpected(&status))).await;
                return;
            }
        }

        attempts += 1;
        if attempts > config.max_reconnects {
            let _ = tx
                .send(Err(ClientError::ReconnectsExhausted {
                    attempts: config.max_reconnects,
                }))
                .await;
            return;
        }

        warn!(
            attempt = attempts,
            retry_in = ?config.retry_delay,
            "subscription stream ended; reconnecting"
        );
        tokio::select! {
            () = tokio::time::sleep(config.retry_delay) => {}
            () = tx.closed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    type Script = Result<Vec<Result<proto::Notification, Status>>, Status>;

    struct ScriptedSource {
        scripts: VecDeque<Script>,
        opens: Arc<AtomicU32>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Script>) -> (Self, Arc<AtomicU32>) {
            let opens = Arc::new(AtomicU32::new(0));
            (
                Self {
                    scripts: scripts.into(),
                    opens: Arc::clone(&opens),
                },
                opens,
            )
        }
    }

    #[tonic::async_trait]
    impl NotificationSource for ScriptedSource {
        type Stream = tokio_stream::Iter<std::vec::IntoIter<Result<proto::Notification, Status>>>;

        async fn open(&mut self, _request: proto::SubscribeRequest) -> Result<Self::Stream, Status> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.scripts.pop_front() {
                Some(Ok(items)) => Ok(tokio_stream::iter(items)),
                Some(Err(status)) => Err(status),
                None => Ok(tokio_stream::iter(Vec::new())),
            }
        }
    }

    fn ok(channels: &[(&str, u32)]) -> Result<proto::Notification, Status> {
        Ok(proto::Notification {
            status: STATUS_OK.to_string(),
            entries: channels
                .iter()
                .map(|(name, viewers)| proto::ChannelEntry {
                    channel_name: (*name).to_string(),
                    viewer_count: *viewers,
                    ..Default::default()
                })
                .collect(),
        })
    }

    fn status(s: &str) -> Result<proto::Notification, Status> {
        Ok(proto::Notification {
            status: s.to_string(),
            entries: Vec::new(),
        })
    }

    fn request() -> proto::SubscribeRequest {
        proto::SubscribeRequest {
            refresh_interval_seconds: 1,
            statistic: Statistic::ViewerCount as i32,
        }
    }

    fn config(max_reconnects: u32) -> ClientConfig {
        ClientConfig {
            max_reconnects,
            ..ClientConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn yields_rankings_and_reconnects_after_end_of_stream() {
        let (source, opens) = ScriptedSource::new(vec![
            Ok(vec![ok(&[("NRK1", 3)])]),
            Ok(vec![ok(&[("TV2", 5), ("NRK1", 2)])]),
        ]);
        let mut events = subscribe_with(source, request(), config(5));

        let start = Instant::now();
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            SubscriptionEvent::Ranking {
                channels: vec![RankedChannel {
                    channel: "NRK1".to_string(),
                    viewers: 3,
                    sample_size: 0,
                    average_duration: String::new(),
                }],
            }
        );

        let SubscriptionEvent::Ranking { channels } = events.next().await.unwrap().unwrap() else {
            panic!("expected ranking");
        };
        assert_eq!(channels[0].channel, "TV2");
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_is_surfaced_and_not_fatal() {
        let (source, _) = ScriptedSource::new(vec![Ok(vec![
            status("2: The server has not yet logged any channels. Retrying in 3s"),
            ok(&[("NRK1", 1)]),
        ])]);
        let mut events = subscribe_with(source, request(), config(5));

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            SubscriptionEvent::NotReady {
                hint: "The server has not yet logged any channels. Retrying in 3s".to_string(),
            }
        );
        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            SubscriptionEvent::Ranking { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_is_fatal() {
        let (source, opens) = ScriptedSource::new(vec![Ok(vec![
            status("3: internal failure"),
            ok(&[("NRK1", 1)]),
        ])]);
        let mut events = subscribe_with(source, request(), config(5));

        let err = events.next().await.unwrap().unwrap_err();
        assert_eq!(
            err,
            ClientError::ServerStatus {
                status: "3: internal failure".to_string(),
            }
        );
        assert!(err.is_protocol());
        assert!(events.next().await.is_none());
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payloads_are_fatal() {
        let (source, _) = ScriptedSource::new(vec![Ok(vec![status("")])]);
        let mut events = subscribe_with(source, request(), config(5));
        assert!(matches!(
            events.next().await.unwrap(),
            Err(ClientError::Malformed { .. })
        ));

        let (source, _) = ScriptedSource::new(vec![Ok(vec![ok(&[("", 4)])])]);
        let mut events = subscribe_with(source, request(), config(5));
        assert!(matches!(
            events.next().await.unwrap(),
            Err(ClientError::Malformed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transport_error_is_fatal() {
        let (source, _) = ScriptedSource::new(vec![Err(Status::invalid_argument("bad interval"))]);
        let mut events = subscribe_with(source, request(), config(5));

        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedStatus { ref message, .. } if message == "bad interval"));
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cut_connection_is_retried() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        let (source, opens) = ScriptedSource::new(vec![
            Ok(vec![
                ok(&[("NRK1", 1)]),
                Err(Status::from_error(Box::new(h2::Error::from(h2::Reason::CANCEL)))),
            ]),
            Ok(vec![Err(Status::from_error(Box::new(reset)))]),
            Ok(vec![ok(&[("NRK1", 2)])]),
        ]);
        let mut events = subscribe_with(source, request(), config(5));

        assert!(events.next().await.unwrap().is_ok());
        let SubscriptionEvent::Ranking { channels } = events.next().await.unwrap().unwrap() else {
            panic!("expected ranking");
        };
        assert_eq!(channels[0].viewers, 2);
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn only_transport_failures_count_as_disconnects() {
        assert!(is_disconnect(&Status::unavailable("connection refused")));
        assert!(is_disconnect(&Status::from_error(Box::new(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        )))));
        assert!(!is_disconnect(&Status::unknown("h2 protocol error")));
        assert!(!is_disconnect(&Status::internal("ledger poisoned")));
        assert!(!is_disconnect(&Status::invalid_argument("bad interval")));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_are_bounded() {
        let (source, opens) = ScriptedSource::new(vec![
            Err(Status::unavailable("connection refused")),
            Ok(vec![Err(Status::unavailable("reset"))]),
        ]);
        let mut events = subscribe_with(source, request(), config(2));

        let start = Instant::now();
        let err = events.next().await.unwrap().unwrap_err();
        assert_eq!(err, ClientError::ReconnectsExhausted { attempts: 2 });
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn received_message_resets_reconnect_budget() {
        // Without the reset the second end of stream would exceed the budget.
        let (source, opens) = ScriptedSource::new(vec![
            Ok(vec![]),
            Ok(vec![ok(&[("NRK1", 1)])]),
            Ok(vec![ok(&[("NRK1", 2)])]),
        ]);
        let mut events = subscribe_with(source, request(), config(1));

        assert!(events.next().await.unwrap().is_ok());
        assert!(events.next().await.unwrap().is_ok());
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }
}
