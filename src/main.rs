//! Sudoku Arena
//!
//! `serve` runs the store relay. `demo` plays a full match between two bots
//! over an in-process store. `bot <ws-url> [name]` plays one bot against
//! whoever it gets paired with on a relay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sudoku_arena::{
    network::{
        backend::sync_clock,
        leaderboard::{period_display_name, period_key, LeaderboardAggregator},
        server::{ServerConfig, StoreServer},
        session::{SessionPhase, SessionSnapshot},
        RemoteBackend,
    },
    ArenaClient, ArenaConfig, ArenaIdentity, ClientHandle, InMemoryBackend, PlayerProfile,
    ServerClock, SyncBackend, VERSION,
};

/// Delay between bot placements.
const BOT_PACE: Duration = Duration::from_millis(150);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    info!("Sudoku Arena v{}", VERSION);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve().await,
        Some("demo") => demo().await,
        Some("bot") => {
            let Some(url) = args.get(1) else {
                bail!("usage: sudoku-arena bot <ws-url> [name]");
            };
            let name = args.get(2).map(String::as_str).unwrap_or("Bot");
            remote_bot(url, name).await
        }
        Some(other) => bail!("unknown mode {:?}; expected serve, demo or bot", other),
    }
}

async fn serve() -> anyhow::Result<()> {
    let store = InMemoryBackend::from_config(&ArenaConfig::from_env());
    let server = StoreServer::new(ServerConfig::from_env(), store);
    tokio::select! {
        result = server.run() => result.context("store relay failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            server.shutdown();
        }
    }
    Ok(())
}

async fn demo() -> anyhow::Result<()> {
    info!("=== Starting Demo Match ===");

    let config = ArenaConfig {
        start_grace: Duration::from_secs(1),
        matchmaking_retry_interval: Duration::from_millis(250),
        ..ArenaConfig::from_env()
    };
    let backend: Arc<dyn SyncBackend> = Arc::new(InMemoryBackend::from_config(&config));

    let spawn = |name: &str| {
        ArenaClient::new(
            ArenaIdentity::from_install_secret(name),
            PlayerProfile::named(name),
            backend.clone(),
            ServerClock::system(),
            config.clone(),
        )
        .spawn()
    };
    let (ann, ann_task) = spawn("Ann");
    let (bo, bo_task) = spawn("Bo");

    // Ann plays faster.
    let (ann_end, bo_end) = tokio::join!(
        play_bot(ann.clone(), BOT_PACE),
        play_bot(bo.clone(), BOT_PACE * 2)
    );
    info!("Ann: {:?}, score {}", ann_end.phase, ann_end.live_score);
    info!("Bo: {:?}, score {}", bo_end.phase, bo_end.live_score);

    ann.leave()?;
    bo.leave()?;
    ann_task.await?;
    bo_task.await?;

    // Submissions run detached; give them a moment to land.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let leaderboard = LeaderboardAggregator::new(backend, &config);
    let period = period_key(ServerClock::system().now_epoch());
    info!("=== Leaderboard {} ===", period_display_name(&period));
    for (place, stats) in leaderboard.fetch_all(&period).await?.iter().enumerate() {
        info!(
            "#{} {} - {} games, average {:.0}, best {:.0}",
            place + 1,
            stats.display_name,
            stats.games_played,
            stats.average_score,
            stats.best_score
        );
    }
    Ok(())
}

async fn remote_bot(url: &str, name: &str) -> anyhow::Result<()> {
    let config = ArenaConfig::from_env();
    let remote = RemoteBackend::connect_with_config(url, &config)
        .await
        .with_context(|| format!("connecting to {}", url))?;
    let backend: Arc<dyn SyncBackend> = Arc::new(remote);

    let clock = ServerClock::system();
    sync_clock(&clock, backend.clone(), sudoku_arena::core::clock::OFFSET_REFRESH_INTERVAL);

    let (handle, task) = ArenaClient::new(
        ArenaIdentity::generate(),
        PlayerProfile::named(name),
        backend,
        clock.clone(),
        config,
    )
    .spawn();

    let end = play_bot(handle.clone(), BOT_PACE).await;
    info!("{} finished: {:?}, score {}", name, end.phase, end.live_score);

    handle.leave()?;
    task.await?;
    clock.stop();
    Ok(())
}

/// Fill the board with solution digits until the match ends.
async fn play_bot(mut handle: ClientHandle, pace: Duration) -> SessionSnapshot {
    let playing = |s: &SessionSnapshot| s.phase == SessionPhase::Playing || s.phase.is_terminal();
    let Ok(mut snapshot) = handle.wait_for(playing).await else {
        return handle.snapshot();
    };

    while !snapshot.phase.is_terminal() {
        if !snapshot.effects.move_blocked {
            if let Some(cell) = snapshot.board.iter().find(|c| c.value.is_none()) {
                if handle.select(cell.position()).is_err() || handle.place(cell.solution).is_err() {
                    break;
                }
            }
        }
        tokio::time::sleep(pace).await;
        snapshot = handle.snapshot();
    }
    snapshot
}
