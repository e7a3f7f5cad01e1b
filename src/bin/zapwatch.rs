//! chzap subscription client
//!
//! Subscribes to a zapserver and prints every ranked snapshot it pushes.

use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chzap::transport::{subscribe, ClientConfig, RankedChannel, Statistic, SubscriptionEvent};

/// Client configuration
struct Config {
    /// Server URI
    server: String,
    /// Seconds between pushes
    interval: u32,
    /// Statistic columns to request
    statistic: Statistic,
    /// Print JSON lines instead of tables
    json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:11101".to_string(),
            interval: 2,
            statistic: Statistic::Summary,
            json: false,
        }
    }
}

fn parse_statistic(raw: &str) -> Option<Statistic> {
    Statistic::from_str_name(&raw.to_ascii_uppercase().replace('-', "_"))
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
            "--server" | "-s" => {
                config.server = value(&args, i, "--server").to_string();
                i += 2;
            }
            "--interval" | "-i" => {
                let raw = value(&args, i, "--interval");
                config.interval = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid interval: {raw}");
                    std::process::exit(1);
                });
                i += 2;
            }
            "--statistic" => {
                let raw = value(&args, i, "--statistic");
                config.statistic = parse_statistic(raw).unwrap_or_else(|| {
                    eprintln!("error: unknown statistic: {raw}");
                    std::process::exit(1);
                });
                i += 2;
            }
            "--json" => {
                config.json = true;
                i += 1;
            }
            "--help" | "-h" => {
                println!("zapwatch - chzap subscription client");
                println!();
                println!("USAGE:");
                println!("    zapwatch [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -s, --server <URI>        Server [default: http://127.0.0.1:11101]");
                println!("    -i, --interval <SECS>     Refresh interval [default: 2]");
                println!("        --statistic <NAME>    summary | sample-size | average-duration | viewer-count");
                println!("                              [default: summary]");
                println!("        --json                Print one JSON object per update");
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
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn render(channels: &[RankedChannel], statistic: Statistic) -> String {
    let samples = matches!(statistic, Statistic::Summary | Statistic::SampleSize);
    let average = matches!(statistic, Statistic::Summary | Statistic::AverageDuration);

    let mut out = String::from("\n    Channel\t     Viewers");
    if samples {
        out.push_str("   Samples");
    }
    if average {
        out.push_str("   Avg. dwell");
    }

    for (i, ch) in channels.iter().enumerate() {
        out.push_str(&format!("\n{:>2}: {:<18}{:>8}", i + 1, ch.channel, ch.viewers));
        if samples {
            out.push_str(&format!("{:>10}", ch.sample_size));
        }
        if average {
            out.push_str(&format!("{:>13}", ch.average_duration));
        }
    }
    out
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args();
    init_tracing();

    info!(server = %config.server, "subscribing");
    let mut events = subscribe(
        config.server.clone(),
        config.interval,
        config.statistic,
        ClientConfig::default(),
    )
    .await?;

    while let Some(event) = events.next().await {
        let event = event?;
        if config.json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match event {
            SubscriptionEvent::NotReady { hint } => println!("{hint}"),
            SubscriptionEvent::Ranking { channels } => println!("{}", render(&channels, config.statistic)),
        }
    }

    Ok(())
}
