//! End-to-end matches between two clients over a shared store.
//!
//! Each test spawns two `ArenaClient`s against the same store, either
//! in-process or behind the WebSocket relay, and drives them through the
//! handles the UI would use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;

use sudoku_arena::game::state::MatchState;
use sudoku_arena::network::backend::paths;
use sudoku_arena::network::leaderboard::period_key;
use sudoku_arena::network::server::{ServerConfig, StoreServer};
use sudoku_arena::network::session::{SessionPhase, SessionSnapshot};
use sudoku_arena::network::{ClientHandle, RemoteBackend};
use sudoku_arena::puzzle::Difficulty;
use sudoku_arena::{
    ArenaClient, ArenaConfig, ArenaIdentity, InMemoryBackend, PlayerProfile, ServerClock, SyncBackend,
};

const WAIT: Duration = Duration::from_secs(20);

// ============================================================================
// Helpers
// ============================================================================

fn fast_config() -> ArenaConfig {
    ArenaConfig {
        matchmaking_retry_interval: Duration::from_millis(50),
        start_grace: Duration::from_millis(300),
        difficulty: Difficulty::Simple,
        ..ArenaConfig::default()
    }
}

fn spawn_player(
    backend: &Arc<dyn SyncBackend>,
    name: &str,
    seed: u64,
) -> (ClientHandle, tokio::task::JoinHandle<()>) {
    ArenaClient::new(
        ArenaIdentity::from_install_secret(name),
        PlayerProfile::named(name),
        backend.clone(),
        ServerClock::system(),
        fast_config(),
    )
    .with_seed(seed)
    .spawn()
}

async fn wait_until(
    handle: &mut ClientHandle,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("timed out waiting for client")
        .expect("client stopped")
}

fn is_playing(snapshot: &SessionSnapshot) -> bool {
    snapshot.phase == SessionPhase::Playing
}

/// Place every missing solution digit, one command pair per cell.
async fn solve(handle: &mut ClientHandle) -> SessionSnapshot {
    loop {
        let snapshot = handle.snapshot();
        if snapshot.phase.is_terminal() {
            return snapshot;
        }
        if !snapshot.effects.move_blocked {
            if let Some(cell) = snapshot.board.iter().find(|c| c.value.is_none()) {
                handle.select(cell.position()).unwrap();
                handle.place(cell.solution).unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn shared_record(backend: &Arc<dyn SyncBackend>, match_id: &str) -> MatchState {
    let value = backend.read(&paths::match_shared(match_id)).await.unwrap().unwrap();
    MatchState::from_value(&value).unwrap()
}

async fn leaderboard_entry(backend: &Arc<dyn SyncBackend>, name: &str) -> Option<Value> {
    let stable = ArenaIdentity::from_install_secret(name).stable_id().clone();
    let period = period_key(ServerClock::system().now_epoch());
    for _ in 0..100 {
        let entry = backend
            .read(&paths::leaderboard_entry(&period, stable.as_str()))
            .await
            .unwrap();
        if entry.is_some() {
            return entry;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_first_to_finish_wins_and_both_are_ranked() {
    let backend: Arc<dyn SyncBackend> = Arc::new(InMemoryBackend::new());
    let (mut ann, ann_task) = spawn_player(&backend, "Ann", 1);
    let (mut bo, bo_task) = spawn_player(&backend, "Bo", 2);

    let a = wait_until(&mut ann, is_playing).await;
    let b = wait_until(&mut bo, is_playing).await;
    assert_eq!(a.match_id, b.match_id);
    assert_eq!(a.board.iter().map(|c| c.solution).collect::<Vec<_>>(), b.board.iter().map(|c| c.solution).collect::<Vec<_>>());

    let won = tokio::time::timeout(WAIT, solve(&mut ann)).await.unwrap();
    assert_eq!(won.phase, SessionPhase::Won);
    assert_eq!(won.squares_left, 0);

    let lost = wait_until(&mut bo, |s| s.phase.is_terminal()).await;
    assert_eq!(lost.phase, SessionPhase::Lost);

    let match_id = won.match_id.clone().unwrap();
    let shared = shared_record(&backend, &match_id).await;
    assert_eq!(shared.winner_player_id.as_ref(), Some(ann.player()));

    let ann_stats = leaderboard_entry(&backend, "Ann").await.expect("winner not ranked");
    let bo_stats = leaderboard_entry(&backend, "Bo").await.expect("loser not ranked");
    assert_eq!(ann_stats["gamesPlayed"], 1);
    assert_eq!(bo_stats["gamesPlayed"], 1);
    assert!(ann_stats["bestScore"].as_f64().unwrap() > bo_stats["bestScore"].as_f64().unwrap());

    ann.leave().unwrap();
    bo.leave().unwrap();
    ann_task.await.unwrap();
    bo_task.await.unwrap();
}

#[tokio::test]
async fn test_quit_during_play_forfeits() {
    let backend: Arc<dyn SyncBackend> = Arc::new(InMemoryBackend::new());
    let (mut ann, ann_task) = spawn_player(&backend, "Ann", 3);
    let (mut bo, bo_task) = spawn_player(&backend, "Bo", 4);

    let a = wait_until(&mut ann, is_playing).await;
    wait_until(&mut bo, is_playing).await;

    bo.quit().unwrap();
    bo_task.await.unwrap();
    assert_eq!(bo.snapshot().phase, SessionPhase::Left);

    let end = wait_until(&mut ann, |s| s.phase.is_terminal()).await;
    assert_eq!(end.phase, SessionPhase::OpponentQuit);

    let shared = shared_record(&backend, a.match_id.as_deref().unwrap()).await;
    assert_eq!(shared.quit_player_id.as_ref(), Some(bo.player()));
    assert_eq!(shared.winner_player_id, None);

    ann.leave().unwrap();
    ann_task.await.unwrap();
}

#[tokio::test]
async fn test_leaving_while_waiting_withdraws_from_queue() {
    let backend: Arc<dyn SyncBackend> = Arc::new(InMemoryBackend::new());
    let (mut ann, ann_task) = spawn_player(&backend, "Ann", 5);

    let waiting = wait_until(&mut ann, |s| s.match_id.is_some()).await;
    assert_eq!(waiting.phase, SessionPhase::WaitingForOpponent);

    ann.leave().unwrap();
    ann_task.await.unwrap();
    let entry = backend.read(&paths::queue_entry(ann.player().as_str())).await.unwrap();
    assert!(entry.is_none());

    let (mut bo, bo_task) = spawn_player(&backend, "Bo", 6);
    let bo_waiting = wait_until(&mut bo, |s| s.match_id.is_some()).await;
    assert_ne!(bo_waiting.match_id, waiting.match_id);
    assert_eq!(bo_waiting.phase, SessionPhase::WaitingForOpponent);

    bo.shutdown().unwrap();
    bo_task.await.unwrap();
}

#[tokio::test]
async fn test_match_over_websocket_relay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(StoreServer::new(ServerConfig::default(), InMemoryBackend::new()));
    let running = server.clone();
    let server_task = tokio::spawn(async move { running.serve(listener).await });

    let url = format!("ws://{}", addr);
    let ann_backend: Arc<dyn SyncBackend> = Arc::new(RemoteBackend::connect(&url).await.unwrap());
    let bo_backend: Arc<dyn SyncBackend> = Arc::new(RemoteBackend::connect(&url).await.unwrap());

    let (mut ann, ann_task) = spawn_player(&ann_backend, "Ann", 7);
    let (mut bo, bo_task) = spawn_player(&bo_backend, "Bo", 8);

    let a = wait_until(&mut ann, is_playing).await;
    let b = wait_until(&mut bo, is_playing).await;
    assert_eq!(a.match_id, b.match_id);
    assert_eq!(a.opponent.name, "Bo");
    assert_eq!(b.opponent.name, "Ann");

    ann.send_emoji("Emoji3").unwrap();
    let seen = wait_until(&mut bo, |s| s.opponent_emoji.is_some()).await;
    assert_eq!(seen.opponent_emoji.unwrap().text, "Emoji3");

    let won = tokio::time::timeout(WAIT, solve(&mut ann)).await.unwrap();
    assert_eq!(won.phase, SessionPhase::Won);
    let lost = wait_until(&mut bo, |s| s.phase.is_terminal()).await;
    assert_eq!(lost.phase, SessionPhase::Lost);

    ann.leave().unwrap();
    bo.leave().unwrap();
    ann_task.await.unwrap();
    bo_task.await.unwrap();

    server.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), server_task).await;
}
