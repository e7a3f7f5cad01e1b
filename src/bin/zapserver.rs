//! chzap collection server
//!
//! Joins the zap event multicast group, feeds every datagram to the ledger and
//! serves ranked top-N subscriptions over gRPC.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::TrySendError;
use tokio::net::UdpSocket;
use tokio::signal;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chzap::transport::{SubscriptionConfig, SubscriptionService};
use chzap::{InMemoryLedger, Ingestor, LedgerConfig, ReportConfig, ReportLoop, ViewerLedger};

/// Datagram read buffer.
const BUF_SIZE: usize = 4096;

/// Raw events queued between the socket and the ingestion worker.
const QUEUE_DEPTH: usize = 16 * 1024;

/// Server configuration
struct Config {
    /// Address the subscription service binds to
    addr: SocketAddr,
    /// Multicast group and port of the event feed
    mcast: SocketAddrV4,
    /// Channel to report on locally, if any
    report: Option<String>,
    /// Local report interval
    interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 11101)),
            mcast: SocketAddrV4::new(Ipv4Addr::new(224, 0, 1, 130), 10000),
            report: None,
            interval: Duration::from_secs(1),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i + 1).map_or_else(
        || {
            eprintln!("error: {flag} requires a value");
            std::process::exit(1);
        },
        String::as_str,
    )
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                let raw = value(&args, i, "--port");
                let port: u16 = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid port number: {raw}");
                    std::process::exit(1);
                });
                config.addr.set_port(port);
                i += 2;
            }
            "--mcast" | "-m" => {
                let raw = value(&args, i, "--mcast");
                config.mcast = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid multicast address: {raw}");
                    std::process::exit(1);
                });
                i += 2;
            }
            "--report" | "-r" => {
                config.report = Some(value(&args, i, "--report").to_string());
                i += 2;
            }
            "--interval" | "-i" => {
                let raw = value(&args, i, "--interval");
                let secs: u64 = raw.parse().ok().filter(|s| *s > 0).unwrap_or_else(|| {
                    eprintln!("error: invalid interval: {raw}");
                    std::process::exit(1);
                });
                config.interval = Duration::from_secs(secs);
                i += 2;
            }
            "--help" | "-h" => {
                println!("zapserver - chzap collection server");
                println!();
                println!("USAGE:");
                println!("    zapserver [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --port <PORT>         Subscription port [default: 11101]");
                println!("    -m, --mcast <ADDR>        Multicast ip:port [default: 224.0.1.130:10000]");
                println!("    -r, --report <CHANNEL>    Print viewers of CHANNEL and a local top 10");
                println!("    -i, --interval <SECS>     Local report interval [default: 1]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn join_feed(mcast: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, mcast.port())).await?;
    socket.join_multicast_v4(*mcast.ip(), Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

async fn read_feed(socket: UdpSocket, tx: crossbeam_channel::Sender<String>) {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut dropped = 0u64;

    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "multicast receive failed");
                continue;
            }
        };

        let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
        match tx.try_send(raw) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    warn!(%from, dropped, "ingestion queue full; dropping events");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("ingestion worker gone; stopping feed");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args();
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "chzap server starting");

    let ledger: Arc<dyn ViewerLedger> = Arc::new(InMemoryLedger::new(LedgerConfig::default()));

    let ingestor = Ingestor::new(Arc::clone(&ledger));
    let stats = ingestor.clone();
    let (tx, rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
    let worker = ingestor.spawn(rx)?;

    let socket = join_feed(config.mcast).await?;
    info!(mcast = %config.mcast, "listening for zap events");
    let feed = tokio::spawn(read_feed(socket, tx));

    let report = config.report.map(|channel| {
        let report_config = ReportConfig {
            interval: config.interval,
            channel: Some(channel),
            ..ReportConfig::default()
        };
        ReportLoop::spawn(Arc::clone(&ledger), report_config, |line| println!("{line}"))
    });

    let service = SubscriptionService::new(Arc::clone(&ledger), SubscriptionConfig::default());
    let handle = service.handle();

    info!(addr = %config.addr, "serving subscriptions; press Ctrl+C to stop");

    Server::builder()
        .add_service(service.into_server())
        .serve_with_shutdown(config.addr, async move {
            let _ = signal::ctrl_c().await;
            handle.shutdown();
        })
        .await?;

    if let Some(report) = report {
        report.stop().await;
    }
    feed.abort();
    let _ = feed.await;
    tokio::task::spawn_blocking(move || worker.join())
        .await?
        .map_err(|_| "ingestion worker panicked")?;

    info!(stats = ?stats.stats(), "shut down");
    Ok(())
}
