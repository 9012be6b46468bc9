//! Arena Client
//!
//! Drives one [`MatchSession`] against a [`SyncBackend`]. A single task owns
//! the session: it runs matchmaking until paired, forwards store notifications
//! and timer ticks into the session, and carries out the actions the session
//! returns. The UI talks to the running client through a [`ClientHandle`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ArenaConfig;
use crate::core::clock::ServerClock;
use crate::core::rng::derive_seed;
use crate::game::events::MultiplayerEvent;
use crate::game::score::ArenaMatchResult;
use crate::game::state::{MatchState, PlayerBoardState, PlayerId, PlayerProfile};
use crate::puzzle::grid::CellPosition;

use super::backend::{paths, BackendError, ChildAdded, Subscription, SyncBackend};
use super::identity::ArenaIdentity;
use super::leaderboard::LeaderboardAggregator;
use super::matchmaking::{MatchmakingCoordinator, MatchmakingError, SharedUpdate};
use super::session::{board_update_fields, MatchSession, SessionAction, SessionSnapshot};

/// Live score and punishment countdown cadence.
const CLOCK_TICK: Duration = Duration::from_secs(1);
/// Reveal countdown and notice expiry cadence.
const COUNTDOWN_TICK: Duration = Duration::from_millis(250);
/// Floor for the matchmaking retry interval.
const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// COMMANDS AND HANDLE
// =============================================================================

/// Input from the UI.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientCommand {
    /// Select a cell.
    Select(CellPosition),
    /// Place a digit in the selected cell.
    Place(u8),
    /// Send an emoji to the opponent.
    SendEmoji(String),
    /// Forfeit the match and stop.
    Quit,
    /// Leave the arena screen and stop.
    Leave,
    /// Stop without touching the match.
    Shutdown,
}

/// The client task is gone.
#[derive(Debug, Error)]
#[error("arena client has stopped")]
pub struct ClientStopped;

/// Cheap handle to a running [`ArenaClient`].
#[derive(Clone)]
pub struct ClientHandle {
    player: PlayerId,
    commands: mpsc::UnboundedSender<ClientCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl ClientHandle {
    /// Session player ID.
    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    /// Queue a command.
    pub fn send(&self, command: ClientCommand) -> Result<(), ClientStopped> {
        self.commands.send(command).map_err(|_| ClientStopped)
    }

    /// Select a cell.
    pub fn select(&self, position: CellPosition) -> Result<(), ClientStopped> {
        self.send(ClientCommand::Select(position))
    }

    /// Place a digit.
    pub fn place(&self, digit: u8) -> Result<(), ClientStopped> {
        self.send(ClientCommand::Place(digit))
    }

    /// Send an emoji.
    pub fn send_emoji(&self, emoji: impl Into<String>) -> Result<(), ClientStopped> {
        self.send(ClientCommand::SendEmoji(emoji.into()))
    }

    /// Forfeit and stop.
    pub fn quit(&self) -> Result<(), ClientStopped> {
        self.send(ClientCommand::Quit)
    }

    /// Leave and stop.
    pub fn leave(&self) -> Result<(), ClientStopped> {
        self.send(ClientCommand::Leave)
    }

    /// Stop without forfeiting.
    pub fn shutdown(&self) -> Result<(), ClientStopped> {
        self.send(ClientCommand::Shutdown)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    ///
    /// Returns [`ClientStopped`] if the client stops first and its final
    /// snapshot does not match.
    pub async fn wait_for(
        &mut self,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, ClientStopped> {
        loop {
            {
                let snapshot = self.snapshots.borrow_and_update();
                if predicate(&snapshot) {
                    return Ok(snapshot.clone());
                }
            }
            if self.snapshots.changed().await.is_err() {
                let last = self.snapshots.borrow().clone();
                return if predicate(&last) { Ok(last) } else { Err(ClientStopped) };
            }
        }
    }
}

// =============================================================================
// MATCH FEEDS
// =============================================================================

enum FeedUpdate {
    Shared(Option<Value>),
    Players(Option<Value>),
    Event(ChildAdded),
}

/// A notification tagged with the match it was subscribed for.
struct Tagged {
    match_id: String,
    update: FeedUpdate,
}

/// The three subscriptions of one match, each pumped by its own task.
/// Dropping the feeds aborts the tasks, which drops the subscriptions.
struct MatchFeeds {
    match_id: String,
    tasks: Vec<JoinHandle<()>>,
}

impl MatchFeeds {
    async fn open(
        backend: &dyn SyncBackend,
        match_id: &str,
        tx: &mpsc::UnboundedSender<Tagged>,
    ) -> Result<Self, BackendError> {
        let shared = backend.subscribe(&paths::match_shared(match_id)).await?;
        let players = backend.subscribe(&paths::match_players(match_id)).await?;
        let events = backend.subscribe_child_added(&paths::match_events(match_id)).await?;

        let tasks = vec![
            forward(shared, match_id, tx.clone(), FeedUpdate::Shared),
            forward(players, match_id, tx.clone(), FeedUpdate::Players),
            forward(events, match_id, tx.clone(), FeedUpdate::Event),
        ];
        debug!("subscribed to match {}", match_id);
        Ok(Self { match_id: match_id.to_string(), tasks })
    }
}

impl Drop for MatchFeeds {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn forward<T: Send + 'static>(
    mut subscription: Subscription<T>,
    match_id: &str,
    tx: mpsc::UnboundedSender<Tagged>,
    wrap: fn(T) -> FeedUpdate,
) -> JoinHandle<()> {
    let match_id = match_id.to_string();
    tokio::spawn(async move {
        while let Some(item) = subscription.recv().await {
            let tagged = Tagged { match_id: match_id.clone(), update: wrap(item) };
            if tx.send(tagged).is_err() {
                break;
            }
        }
    })
}

// =============================================================================
// CLIENT
// =============================================================================

/// One player in the arena, ready to be spawned.
pub struct ArenaClient {
    identity: ArenaIdentity,
    profile: PlayerProfile,
    backend: Arc<dyn SyncBackend>,
    clock: ServerClock,
    config: ArenaConfig,
    seed: Option<u64>,
}

impl ArenaClient {
    /// Client for `identity` over `backend`.
    pub fn new(
        identity: ArenaIdentity,
        profile: PlayerProfile,
        backend: Arc<dyn SyncBackend>,
        clock: ServerClock,
        config: ArenaConfig,
    ) -> Self {
        Self { identity, profile, backend, clock, config, seed: None }
    }

    /// Fix the seed used for punishment picks and generated puzzles.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Start the client task.
    pub fn spawn(self) -> (ClientHandle, JoinHandle<()>) {
        let (driver, handle, inputs) = self.into_driver();
        let task = tokio::spawn(driver.run(inputs));
        (handle, task)
    }

    fn into_driver(self) -> (Driver, ClientHandle, DriverInputs) {
        let player = self.identity.session_id().clone();
        let seed = self
            .seed
            .unwrap_or_else(|| derive_seed("arena-session", &[player.as_str()]));
        let puzzle_seed = derive_seed("arena-puzzle", &[player.as_str(), &seed.to_string()]);

        let session = MatchSession::new(
            player.clone(),
            self.identity.stable_id().clone(),
            self.profile.clone(),
            self.config.clone(),
            seed,
        );
        let matchmaker = MatchmakingCoordinator::new(self.backend.clone(), self.clock.clone(), self.config.clone())
            .with_seed(puzzle_seed);
        let leaderboard = LeaderboardAggregator::new(self.backend.clone(), &self.config);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (found_tx, found_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

        let driver = Driver {
            player: player.clone(),
            profile: self.profile,
            config: self.config,
            backend: self.backend,
            clock: self.clock,
            matchmaker: Arc::new(matchmaker),
            leaderboard: Arc::new(leaderboard),
            session,
            feeds: None,
            search_task: None,
            feed_tx,
            found_tx,
            snapshots: snapshot_tx,
        };
        let handle = ClientHandle { player, commands: command_tx, snapshots: snapshot_rx };
        let inputs = DriverInputs { commands: command_rx, feeds: feed_rx, found: found_rx };
        (driver, handle, inputs)
    }
}

type Found = (u64, Result<MatchState, MatchmakingError>);

struct DriverInputs {
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    feeds: mpsc::UnboundedReceiver<Tagged>,
    found: mpsc::UnboundedReceiver<Found>,
}

struct Driver {
    player: PlayerId,
    profile: PlayerProfile,
    config: ArenaConfig,
    backend: Arc<dyn SyncBackend>,
    clock: ServerClock,
    matchmaker: Arc<MatchmakingCoordinator>,
    leaderboard: Arc<LeaderboardAggregator>,
    session: MatchSession,
    feeds: Option<MatchFeeds>,
    /// Matchmaking round in flight.
    search_task: Option<JoinHandle<()>>,
    feed_tx: mpsc::UnboundedSender<Tagged>,
    found_tx: mpsc::UnboundedSender<Found>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl Driver {
    async fn run(mut self, inputs: DriverInputs) {
        let DriverInputs { mut commands, feeds: mut feed_rx, found: mut found_rx } = inputs;
        info!("arena client {} started", self.player);

        let mut clock_tick = tokio::time::interval(CLOCK_TICK);
        let mut countdown_tick = tokio::time::interval(COUNTDOWN_TICK);
        let mut retry_tick =
            tokio::time::interval(self.config.matchmaking_retry_interval.max(MIN_RETRY_INTERVAL));
        for ticker in [&mut clock_tick, &mut countdown_tick, &mut retry_tick] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }

                Some((token, result)) = found_rx.recv() => {
                    self.on_found(token, result).await;
                }

                Some(tagged) = feed_rx.recv() => {
                    self.on_feed(tagged).await;
                }

                _ = clock_tick.tick() => {
                    let now = self.clock.now_epoch();
                    self.session.tick_clock();
                    self.session.tick_punishment(now);
                    self.resubscribe_if_needed().await;
                }

                _ = countdown_tick.tick() => {
                    let now = self.clock.now_epoch();
                    let actions = self.session.tick_countdown(now);
                    self.session.expire_notices(now);
                    self.execute(actions).await;
                }

                _ = retry_tick.tick(), if self.session.is_searching() && self.search_task.is_none() => {
                    self.search().await;
                }
            }

            self.publish();
        }

        self.feeds = None;
        self.publish();
        info!("arena client {} stopped", self.player);
    }

    fn publish(&self) {
        let _ = self.snapshots.send(self.session.snapshot());
    }

    /// Returns `false` when the client should stop.
    async fn handle_command(&mut self, command: ClientCommand) -> bool {
        let now = self.clock.now_epoch();
        match command {
            ClientCommand::Select(position) => self.session.select(position),
            ClientCommand::Place(digit) => {
                let actions = self.session.place(digit, now);
                self.execute(actions).await;
            }
            ClientCommand::SendEmoji(emoji) => {
                let actions = self.session.send_emoji(&emoji, now);
                self.execute(actions).await;
            }
            ClientCommand::Quit => {
                self.cancel_search();
                let actions = self.session.quit(now);
                self.execute(actions).await;
                return false;
            }
            ClientCommand::Leave => {
                self.cancel_search();
                let actions = self.session.leave(now);
                self.execute(actions).await;
                return false;
            }
            ClientCommand::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    async fn shutdown(&mut self) {
        self.feeds = None;
        self.cancel_search();
        if let Err(e) = self.matchmaker.leave_queue(&self.player).await {
            debug!("leaving queue on shutdown failed: {}", e);
        }
    }

    // ===== MATCHMAKING =====

    fn cancel_search(&mut self) {
        if let Some(task) = self.search_task.take() {
            task.abort();
        }
    }

    /// One matchmaking round. A waiting match that filled up since the last
    /// round is locked directly instead of searching again.
    async fn search(&mut self) {
        if let Some(match_id) = self.session.match_id().map(str::to_string) {
            match self.matchmaker.load_match(&match_id).await {
                Ok(Some(state)) if state.is_full() && state.contains(&self.player) => {
                    let actions = self.session.on_shared_state(Some(state), self.clock.now_epoch());
                    self.execute(actions).await;
                    if !self.session.is_searching() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("re-reading waiting match {} failed: {}", match_id, e),
            }
        }

        let token = self.session.begin_search();

        let matchmaker = self.matchmaker.clone();
        let player = self.player.clone();
        let profile = self.profile.clone();
        let difficulty = self.config.difficulty;
        let found_tx = self.found_tx.clone();
        self.search_task = Some(tokio::spawn(async move {
            let result = matchmaker.enter_queue(&player, &profile, difficulty).await;
            let _ = found_tx.send((token, result));
        }));
    }

    async fn on_found(&mut self, token: u64, result: Result<MatchState, MatchmakingError>) {
        self.search_task = None;
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                warn!("matchmaking for {} failed, will retry: {}", self.player, e);
                return;
            }
        };

        let match_id = state.match_id.clone();
        let joined_elsewhere = state.is_full() && state.contains(&self.player);
        let actions = self.session.adopt_match(token, state, self.clock.now_epoch());
        if self.session.match_id() == Some(match_id.as_str()) {
            self.ensure_feeds(&match_id).await;
        } else {
            // The round joined a match this session will never play.
            if joined_elsewhere {
                self.withdraw_from(&match_id).await;
            }
            // Paired while this round was in flight; withdraw whatever it queued.
            if self.session.locked_match_id().is_some() {
                if let Err(e) = self.matchmaker.leave_queue(&self.player).await {
                    debug!("withdrawing late queue entry failed: {}", e);
                }
            }
        }
        self.execute(actions).await;
    }

    /// Leave `match_id` so its host goes back to waiting.
    async fn withdraw_from(&self, match_id: &str) {
        info!("{} withdrawing from unused match {}", self.player, match_id);
        if let Err(e) = self.matchmaker.detach(match_id, &self.player).await {
            warn!("detaching from match {} failed: {}", match_id, e);
        }
        let board = paths::match_player(match_id, self.player.as_str());
        if let Err(e) = self.backend.remove(&board).await {
            debug!("removing board in {} failed: {}", match_id, e);
        }
    }

    async fn ensure_feeds(&mut self, match_id: &str) {
        if self.feeds.as_ref().is_some_and(|f| f.match_id == match_id) {
            return;
        }
        self.feeds = None;
        match MatchFeeds::open(self.backend.as_ref(), match_id, &self.feed_tx).await {
            Ok(feeds) => self.feeds = Some(feeds),
            Err(e) => warn!("subscribing to match {} failed: {}", match_id, e),
        }
    }

    async fn resubscribe_if_needed(&mut self) {
        if self.session.phase().is_terminal() {
            return;
        }
        if let Some(match_id) = self.session.match_id().map(str::to_string) {
            self.ensure_feeds(&match_id).await;
        }
    }

    // ===== STORE NOTIFICATIONS =====

    async fn on_feed(&mut self, tagged: Tagged) {
        if self.feeds.as_ref().map(|f| f.match_id.as_str()) != Some(tagged.match_id.as_str()) {
            return;
        }
        let now = self.clock.now_epoch();

        let actions = match tagged.update {
            FeedUpdate::Shared(value) => match value.as_ref().and_then(MatchState::from_value) {
                Some(state) => self.session.on_shared_state(Some(state), now),
                None => {
                    debug!("match {} record missing or unreadable", tagged.match_id);
                    Vec::new()
                }
            },
            FeedUpdate::Players(value) => {
                let mut actions = Vec::new();
                if let Some(Value::Object(players)) = value {
                    for (key, board) in &players {
                        if key == self.player.as_str() {
                            continue;
                        }
                        if let Some(board) = PlayerBoardState::from_value(board) {
                            actions.extend(self.session.on_opponent_board(board, now));
                        }
                    }
                }
                actions
            }
            FeedUpdate::Event(ChildAdded { key, value }) => match MultiplayerEvent::from_value(&key, &value) {
                Some(event) => self.session.on_event(event, now),
                None => {
                    debug!("skipping malformed event {}", key);
                    Vec::new()
                }
            },
        };
        self.execute(actions).await;
    }

    // ===== ACTIONS =====

    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut pending: VecDeque<SessionAction> = actions.into();

        while let Some(action) = pending.pop_front() {
            let match_id = self.session.match_id().map(str::to_string);
            #[cfg(feature = "debug-tracing")]
            tracing::trace!("{} executing {:?} in {:?}", self.player, action, match_id);

            match action {
                SessionAction::LeaveQueue => {
                    if let Err(e) = self.matchmaker.leave_queue(&self.player).await {
                        debug!("leaving queue failed: {}", e);
                    }
                }
                SessionAction::SubmitResult(result) => self.submit(result),
                action => {
                    let Some(match_id) = match_id else {
                        debug!("no match for {:?}", action);
                        continue;
                    };
                    let follow_up = self.apply_to_match(&match_id, action).await;
                    pending.extend(follow_up);
                }
            }
        }
    }

    async fn apply_to_match(&mut self, match_id: &str, action: SessionAction) -> Vec<SessionAction> {
        let update = match action {
            SessionAction::SyncBoard(board) => {
                let path = paths::match_player(match_id, self.player.as_str());
                if let Err(e) = self.backend.update(&path, board_update_fields(&board)).await {
                    debug!("board sync for {} failed: {}", match_id, e);
                }
                return Vec::new();
            }
            SessionAction::SendEvent(event) => {
                let path = paths::match_event(match_id, &event.id);
                if let Err(e) = self.backend.write(&path, event.to_value()).await {
                    debug!("event {} for {} not sent: {}", event.id, match_id, e);
                }
                return Vec::new();
            }
            SessionAction::MarkReady => self.matchmaker.mark_ready(match_id, &self.player).await,
            SessionAction::ArmCountdown => self.matchmaker.arm_countdown(match_id, &self.player).await,
            SessionAction::AnnounceWinner => self.matchmaker.announce_winner(match_id, &self.player).await,
            SessionAction::RecordQuit => self.matchmaker.record_quit(match_id, &self.player).await,
            SessionAction::Detach => self.matchmaker.detach(match_id, &self.player).await,
            SessionAction::LeaveQueue | SessionAction::SubmitResult(_) => return Vec::new(),
        };

        match update {
            Ok(SharedUpdate { state: Some(state), .. }) => {
                self.session.on_shared_state(Some(state), self.clock.now_epoch())
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!("update of match {} failed: {}", match_id, e);
                Vec::new()
            }
        }
    }

    /// Leaderboard submission runs detached; a failure never touches the
    /// session.
    fn submit(&self, result: ArenaMatchResult) {
        let leaderboard = self.leaderboard.clone();
        let min_matches = self.config.min_matches;
        tokio::spawn(async move {
            match leaderboard.record_match_result(&result, min_matches).await {
                Ok(stats) => info!(
                    "recorded {} for {}: {} games, average {:.0}",
                    result.match_id, stats.player_id, stats.games_played, stats.average_score
                ),
                Err(e) => warn!("leaderboard submission failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::InMemoryBackend;
    use crate::network::session::SessionPhase;
    use crate::puzzle::Difficulty;

    fn fast_config() -> ArenaConfig {
        ArenaConfig {
            matchmaking_retry_interval: Duration::from_millis(50),
            start_grace: Duration::from_millis(300),
            difficulty: Difficulty::Simple,
            ..ArenaConfig::default()
        }
    }

    fn client(backend: &Arc<InMemoryBackend>, name: &str, seed: u64) -> ArenaClient {
        ArenaClient::new(
            ArenaIdentity::from_install_secret(name),
            PlayerProfile::named(name),
            backend.clone(),
            ServerClock::system(),
            fast_config(),
        )
        .with_seed(seed)
    }

    async fn host_match(backend: &Arc<InMemoryBackend>, id: &str) -> MatchState {
        let matchmaker = MatchmakingCoordinator::new(backend.clone(), ServerClock::system(), fast_config());
        matchmaker
            .enter_queue(&PlayerId::from(id), &PlayerProfile::named(id), Difficulty::Simple)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lone_client_waits_in_queue() {
        let backend = Arc::new(InMemoryBackend::new());
        let (mut handle, task) = client(&backend, "Ann", 1).spawn();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), handle.wait_for(|s| s.match_id.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.phase, SessionPhase::WaitingForOpponent);

        let entry = backend.read(&paths::queue_entry(handle.player().as_str())).await.unwrap();
        assert!(entry.is_some());

        handle.shutdown().unwrap();
        task.await.unwrap();
        let entry = backend.read(&paths::queue_entry(handle.player().as_str())).await.unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_two_clients_reach_playing() {
        let backend = Arc::new(InMemoryBackend::new());
        let (mut ann, ann_task) = client(&backend, "Ann", 1).spawn();
        let (mut bo, bo_task) = client(&backend, "Bo", 2).spawn();

        let playing = |s: &SessionSnapshot| s.phase == SessionPhase::Playing;
        let a = tokio::time::timeout(Duration::from_secs(10), ann.wait_for(playing)).await.unwrap().unwrap();
        let b = tokio::time::timeout(Duration::from_secs(10), bo.wait_for(playing)).await.unwrap().unwrap();

        assert_eq!(a.match_id, b.match_id);
        assert_eq!(a.opponent.name, "Bo");
        assert_eq!(b.opponent.name, "Ann");

        ann.shutdown().unwrap();
        bo.shutdown().unwrap();
        ann_task.await.unwrap();
        bo_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_join_after_pairing_is_withdrawn() {
        let backend = Arc::new(InMemoryBackend::new());
        let (mut driver, _handle, _inputs) = client(&backend, "Ann", 1).into_driver();
        let me = driver.player.clone();
        let profile = PlayerProfile::named("Ann");

        // Two rounds in flight: the first pairs with Xu, the second joins Hal's match.
        let first = host_match(&backend, "p-xu").await;
        let late_token = driver.session.begin_search();
        let token = driver.session.begin_search();
        let paired = driver.matchmaker.enter_queue(&me, &profile, Difficulty::Simple).await.unwrap();
        assert_eq!(paired.match_id, first.match_id);

        let second = host_match(&backend, "p-hal").await;
        let late = driver.matchmaker.join_existing(&second.match_id, &me, &profile).await.unwrap();
        assert!(late.is_full());

        driver.on_found(token, Ok(paired)).await;
        assert_eq!(driver.session.locked_match_id(), Some(first.match_id.as_str()));
        driver.on_found(late_token, Ok(late)).await;

        assert_eq!(driver.session.match_id(), Some(first.match_id.as_str()));
        let hal = driver.matchmaker.load_match(&second.match_id).await.unwrap().unwrap();
        assert_eq!(hal.player_ids, vec![PlayerId::from("p-hal")]);
        assert_eq!(hal.started_at_epoch, None);
        let board = backend.read(&paths::match_player(&second.match_id, me.as_str())).await.unwrap();
        assert!(board.is_none());
        let entry = backend.read(&paths::queue_entry(me.as_str())).await.unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_client() {
        let backend = Arc::new(InMemoryBackend::new());
        let (handle, task) = client(&backend, "Ann", 1).spawn();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_stop_fail() {
        let backend = Arc::new(InMemoryBackend::new());
        let (handle, task) = client(&backend, "Ann", 1).spawn();
        handle.leave().unwrap();
        task.await.unwrap();
        assert!(handle.place(3).is_err());
    }
}
