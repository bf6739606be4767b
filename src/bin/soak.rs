//! Soak driver for the playback core
//!
//! Runs the session registry against the simulated resolver and transport:
//! several chats enqueue tracks concurrently while a clock task completes
//! active streams, with occasional pause/resume/volume traffic mixed in.
//! Exits non-zero if any enqueued track neither finishes nor fails.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vc_jukebox::sim::{SimResolver, SimTransport};
use vc_jukebox::{
    ChatId, Config, SessionEvent, SessionRegistry, SessionState, SourceResolver, Track,
    VoiceTransport,
};

#[derive(Parser, Debug)]
#[command(name = "jukebox-soak", about = "Soak the playback core against simulated adapters")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "JUKEBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Number of concurrent chats
    #[arg(long, default_value_t = 4)]
    chats: i64,

    /// Tracks enqueued per chat
    #[arg(long, default_value_t = 8)]
    tracks: usize,

    /// Simulated play time per track, in milliseconds
    #[arg(long, default_value_t = 50)]
    track_ms: u64,

    /// Log filter (overrides the config file level)
    #[arg(long, env = "JUKEBOX_LOG")]
    log: Option<String>,
}

#[derive(Default)]
struct Counters {
    started: AtomicUsize,
    finished: AtomicUsize,
    failed: AtomicUsize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let filter = args
        .log
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_new(&filter).context("invalid log filter")?;
    match &config.logging.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    info!(
        chats = args.chats,
        tracks = args.tracks,
        "starting soak run"
    );

    let resolver = Arc::new(SimResolver::with_delay(Duration::from_millis(5)));
    let transport = Arc::new(SimTransport::new());
    let registry = Arc::new(SessionRegistry::new(
        &config,
        Arc::clone(&resolver) as Arc<dyn SourceResolver>,
        Arc::clone(&transport) as Arc<dyn VoiceTransport>,
    ));
    let sweeper = registry.spawn_sweeper();

    // Tally session events while the run is in flight.
    let counters = Arc::new(Counters::default());
    let mut events = registry.events().subscribe();
    let tally = Arc::clone(&counters);
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::TrackStarted { .. } => {
                    tally.started.fetch_add(1, Ordering::Relaxed);
                }
                SessionEvent::TrackFinished { .. } => {
                    tally.finished.fetch_add(1, Ordering::Relaxed);
                }
                SessionEvent::TrackFailed { chat, title, reason, .. } => {
                    warn!(%chat, "track '{title}' failed: {reason}");
                    tally.failed.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    });

    // Clock task: every track interval, complete each chat's active stream.
    let clock_transport = Arc::clone(&transport);
    let chats = args.chats;
    let track_ms = args.track_ms;
    let clock_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(track_ms));
        loop {
            ticker.tick().await;
            for c in 0..chats {
                clock_transport.end_active(ChatId(c));
            }
        }
    });

    // One driver per chat: enqueue tracks with a little control-command noise.
    let mut drivers = Vec::new();
    for c in 0..args.chats {
        let registry = Arc::clone(&registry);
        let tracks = args.tracks;
        drivers.push(tokio::spawn(async move {
            let chat = ChatId(c);
            let session = registry.get_or_create(chat).await;
            for i in 0..tracks {
                let track = Track::new(format!("chat {c} song {i}"), c);
                if let Err(e) = session.enqueue(track).await {
                    warn!(%chat, "enqueue rejected: {e}");
                }
                if i % 3 == 0 {
                    let _ = session.set_volume(100 + (i as u16 % 100)).await;
                }
                if i % 5 == 4 {
                    let _ = session.pause().await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let _ = session.resume().await;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }));
    }
    for driver in drivers {
        driver.await.context("chat driver panicked")?;
    }

    // Drain: wait until every session has gone idle with an empty queue.
    let drained = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let snapshot = registry.snapshot().await;
            if snapshot
                .iter()
                .all(|(_, status)| status.state == SessionState::Idle && status.idle_since.is_some())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    clock_task.abort();
    sweeper.abort();
    registry.shutdown().await;
    drop(registry);
    let _ = event_task.await;

    let started = counters.started.load(Ordering::Relaxed);
    let finished = counters.finished.load(Ordering::Relaxed);
    let failed = counters.failed.load(Ordering::Relaxed);
    let submitted = args.chats as usize * args.tracks;
    info!(
        submitted,
        started, finished, failed, "soak run complete ({} resolver calls)",
        resolver.calls()
    );

    drained.ok().context("sessions did not drain within 60s")?;
    anyhow::ensure!(
        finished + failed >= submitted,
        "{} tracks unaccounted for",
        submitted.saturating_sub(finished + failed)
    );

    Ok(())
}
