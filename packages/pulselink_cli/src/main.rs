use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use pulselink::store::{FileStore, SubscriberState, SubscriberView};
use pulselink::{RelayConfig, RelayPipeline, RemoteStoreSubscriber, StoreConfig};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "pulselink")]
#[command(about = "Run and inspect the heart-rate relay")]
#[command(version)]
struct Cli {
    /// Relay configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the full pipeline over the simulated link
    Simulate {
        /// Number of samples to produce
        #[arg(short = 'n', long, default_value = "20")]
        samples: u32,

        /// Resting heart rate the simulated sensor wanders around
        #[arg(long, default_value = "72")]
        base_bpm: f64,

        /// Time between samples
        #[arg(long, default_value = "250")]
        interval_ms: u64,

        /// Samples START..END (exclusive) are produced while the companion
        /// is unreachable, e.g. `5..9`
        #[arg(long, value_parser = parse_window)]
        unreachable: Option<(u32, u32)>,

        /// Write to a file store in this directory instead of the configured store
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// List sessions in a file store
    Sessions {
        #[arg(long)]
        data_dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print one session's samples from a file store
    Show {
        #[arg(long)]
        data_dir: PathBuf,

        #[arg(short, long)]
        session: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Follow the newest session in the configured store until Ctrl-C
    Watch,
}

fn parse_window(raw: &str) -> Result<(u32, u32), String> {
    let (start, end) = raw
        .split_once("..")
        .ok_or_else(|| format!("expected START..END, got {:?}", raw))?;
    let start: u32 = start.trim().parse().map_err(|e| format!("bad start: {}", e))?;
    let end: u32 = end.trim().parse().map_err(|e| format!("bad end: {}", e))?;
    if end <= start {
        return Err(format!("empty window {}..{}", start, end));
    }
    Ok((start, end))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(RelayConfig::default()),
    }
}

fn format_time(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp.to_string(),
    }
}

fn print_view(view: &SubscriberView) {
    let session = view.current_session_id.as_deref().unwrap_or("-");
    match view.current_heart_rate {
        Some(bpm) => println!(
            "[viewer] session {} | {:.1} bpm | {} samples | {}",
            session,
            bpm,
            view.samples_seen,
            view.last_timestamp.map(format_time).unwrap_or_default()
        ),
        None => println!("[viewer] session {} | waiting for samples", session),
    }
}

/// Print every subscriber view update until the subscriber goes away.
fn spawn_view_printer(mut updates: broadcast::Receiver<SubscriberView>) {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(view) => print_view(&view),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("viewer output skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn simulate(
    mut config: RelayConfig,
    samples: u32,
    base_bpm: f64,
    interval: Duration,
    unreachable: Option<(u32, u32)>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(data_dir) = data_dir {
        config.store = StoreConfig::File { data_dir };
    }
    let pipeline = RelayPipeline::simulated(&config)?;
    spawn_view_printer(pipeline.subscriber().observe_view().watch());
    pipeline.settle().await;
    println!("[link] {}", pipeline.producer().monitor().status_text());

    let start = Utc::now().timestamp();
    for i in 0..samples {
        if let Some((from, to)) = unreachable {
            if i == from {
                pipeline.network().set_reachable(false);
                println!("[link] {}", pipeline.producer().monitor().status_text());
            } else if i == to {
                pipeline.network().set_reachable(true);
                println!("[link] {}", pipeline.producer().monitor().status_text());
            }
        }

        let bpm = base_bpm + 6.0 * (i as f64 * 0.45).sin();
        let disposition = pipeline.send(bpm, start + i as i64)?;
        println!("[sensor] #{:<3} {:.1} bpm -> {:?}", i, bpm, disposition);

        tokio::time::sleep(interval).await;
        pipeline.settle().await;
    }

    let producer = pipeline.producer().stats();
    let consumer = pipeline.consumer().stats();
    let writer = pipeline.consumer().writer().stats();
    println!();
    println!(
        "sensor:    {} dispatched, {} dropped while unreachable, {} send failures",
        producer.dispatched, producer.dropped_unreachable, producer.send_failures
    );
    println!(
        "companion: {} received, {} forwarded, {} malformed",
        consumer.received, consumer.forwarded, consumer.malformed
    );
    println!("store:     {} written, {} failed", writer.written, writer.failed);
    if let Some(session) = pipeline.consumer().sessions().current() {
        println!("session:   {}", session);
    }

    pipeline.shutdown().await;
    Ok(())
}

fn list_sessions(data_dir: &PathBuf, json: bool) -> anyhow::Result<()> {
    let store = FileStore::open(data_dir)
        .with_context(|| format!("opening store in {}", data_dir.display()))?;
    let sessions = store.sessions();
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions in {}", data_dir.display());
        return Ok(());
    }
    for session in sessions {
        println!("{}  {} samples", session.id, session.sample_count);
    }
    Ok(())
}

fn show_session(data_dir: &PathBuf, session: &str, json: bool) -> anyhow::Result<()> {
    let store = FileStore::open(data_dir)
        .with_context(|| format!("opening store in {}", data_dir.display()))?;
    let samples = store.samples(session)?;
    if samples.is_empty() && !store.sessions().iter().any(|s| s.id == session) {
        bail!("no session {} in {}", session, data_dir.display());
    }
    if json {
        let records: Vec<_> = samples.into_iter().map(|(_, record)| record).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for (key, record) in samples {
        println!(
            "{}  {}  {:.1} bpm",
            key,
            format_time(record.timestamp),
            record.heart_rate
        );
    }
    Ok(())
}

async fn watch(config: RelayConfig) -> anyhow::Result<()> {
    let store = config.open_store()?;
    let subscriber = RemoteStoreSubscriber::start(store);
    spawn_view_printer(subscriber.observe_view().watch());
    let mut states = subscriber.observe_state().watch();

    println!("Watching {} store, Ctrl-C to stop", config.store.backend_name());
    loop {
        tokio::select! {
            state = states.recv() => match state {
                Ok(SubscriberState::Failed(reason)) => {
                    eprintln!("[viewer] listener failed: {}; resubscribing", reason);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    subscriber.resubscribe();
                }
                Ok(state) => log::info!("subscriber: {:?}", state),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    subscriber.dispose().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            samples,
            base_bpm,
            interval_ms,
            unreachable,
            data_dir,
        } => {
            let config = load_config(cli.config.as_ref())?;
            simulate(
                config,
                samples,
                base_bpm,
                Duration::from_millis(interval_ms),
                unreachable,
                data_dir,
            )
            .await
        }
        Command::Sessions { data_dir, json } => list_sessions(&data_dir, json),
        Command::Show {
            data_dir,
            session,
            json,
        } => show_session(&data_dir, &session, json),
        Command::Watch => watch(load_config(cli.config.as_ref())?).await,
    }
}
