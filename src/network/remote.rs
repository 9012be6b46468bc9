//! Remote Store Client
//!
//! [`SyncBackend`] over a WebSocket connection to the store relay. Requests
//! are correlated by ID; subscription notifications are routed by the
//! subscription ID the relay assigns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ArenaConfig;
use crate::core::clock::ServerTimeSample;

use super::backend::{
    optimistic_transact, BackendError, ChildAdded, CompareAndSet, StorePath, Subscription,
    SyncBackend, TransactFn, TransactResult,
};
use super::memory::DEFAULT_TRANSACT_ATTEMPTS;
use super::protocol::{ClientMessage, ErrorCode, ServerMessage, SubscriptionMode};

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

enum SubscriptionSender {
    Value(mpsc::UnboundedSender<Option<Value>>),
    Child(mpsc::UnboundedSender<ChildAdded>),
}

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, oneshot::Sender<ServerMessage>>,
    /// Subscriptions awaiting their `Subscribed` reply, by request ID.
    pending_subscriptions: HashMap<u64, SubscriptionSender>,
    /// Live subscriptions, by subscription ID.
    subscriptions: HashMap<u64, SubscriptionSender>,
}

struct RemoteInner {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    routes: Mutex<Routes>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
    request_timeout: Duration,
    max_attempts: u32,
}

impl RemoteInner {
    fn routes(&self) -> Result<std::sync::MutexGuard<'_, Routes>, BackendError> {
        self.routes
            .lock()
            .map_err(|_| BackendError::Unavailable("route table poisoned".to_string()))
    }

    /// Deliver one relay message. Runs on the reader task only, so routing
    /// follows relay order.
    fn dispatch(&self, msg: ServerMessage) {
        let Ok(mut routes) = self.routes.lock() else {
            return;
        };
        match msg {
            ServerMessage::Change { subscription_id, value } => {
                if let Some(SubscriptionSender::Value(tx)) = routes.subscriptions.get(&subscription_id) {
                    let _ = tx.send(value);
                }
            }
            ServerMessage::ChildAdded { subscription_id, key, value } => {
                if let Some(SubscriptionSender::Child(tx)) = routes.subscriptions.get(&subscription_id) {
                    let _ = tx.send(ChildAdded { key, value });
                }
            }
            ServerMessage::Hello { server_version } => {
                info!("connected to store relay v{}", server_version);
            }
            ServerMessage::Shutdown { reason } => {
                warn!("store relay shutting down: {}", reason);
                self.closed.store(true, Ordering::SeqCst);
            }
            other => {
                let Some(request_id) = other.request_id() else {
                    return;
                };
                if let ServerMessage::Subscribed { subscription_id, .. } = &other {
                    if let Some(sender) = routes.pending_subscriptions.remove(&request_id) {
                        routes.subscriptions.insert(*subscription_id, sender);
                    }
                } else {
                    routes.pending_subscriptions.remove(&request_id);
                }
                if let Some(reply) = routes.pending.remove(&request_id) {
                    let _ = reply.send(other);
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut routes) = self.routes.lock() {
            *routes = Routes::default();
        }
    }
}

/// Shared store reached through the relay. Cloning shares the connection.
#[derive(Clone)]
pub struct RemoteBackend {
    inner: Arc<RemoteInner>,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

impl RemoteBackend {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:8080`).
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        Self::connect_with(url, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TRANSACT_ATTEMPTS).await
    }

    /// Connect using the configured transaction attempt limit.
    pub async fn connect_with_config(url: &str, config: &ArenaConfig) -> Result<Self, BackendError> {
        Self::connect_with(url, DEFAULT_REQUEST_TIMEOUT, config.transact_max_retries).await
    }

    /// Connect with explicit request timeout and transaction attempt limit.
    pub async fn connect_with(
        url: &str,
        request_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, BackendError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let inner = Arc::new(RemoteInner {
            outgoing,
            routes: Mutex::new(Routes::default()),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            request_timeout,
            max_attempts: max_attempts.max(1),
        });

        // Writer
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("failed to serialize relay request: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader
        let reader_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let Some(inner) = reader_inner.upgrade() else {
                    break;
                };
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(msg) => inner.dispatch(msg),
                        Err(e) => debug!("unparseable relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("relay connection error: {}", e);
                        break;
                    }
                }
            }
            if let Some(inner) = reader_inner.upgrade() {
                inner.close();
            }
            debug!("relay reader stopped");
        });

        Ok(Self { inner })
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request(&self, request_id: u64, msg: ClientMessage) -> Result<ServerMessage, BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.routes()?.pending.insert(request_id, tx);
        if self.inner.outgoing.send(msg).is_err() {
            self.inner.routes()?.pending.remove(&request_id);
            return Err(BackendError::Closed);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(ServerMessage::Error(e))) => Err(match e.code {
                ErrorCode::InvalidPath => BackendError::InvalidPath(e.message),
                _ => BackendError::Unavailable(e.message),
            }),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BackendError::Closed),
            Err(_) => {
                if let Ok(mut routes) = self.inner.routes() {
                    routes.pending.remove(&request_id);
                    routes.pending_subscriptions.remove(&request_id);
                }
                Err(BackendError::Unavailable("request timed out".to_string()))
            }
        }
    }

    async fn expect_ack(&self, request_id: u64, msg: ClientMessage) -> Result<(), BackendError> {
        match self.request(request_id, msg).await? {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn open_subscription(
        &self,
        path: &StorePath,
        mode: SubscriptionMode,
        sender: SubscriptionSender,
    ) -> Result<u64, BackendError> {
        let request_id = self.next_request_id();
        self.inner.routes()?.pending_subscriptions.insert(request_id, sender);
        let msg = ClientMessage::Subscribe { request_id, path: path.to_string(), mode };
        match self.request(request_id, msg).await? {
            ServerMessage::Subscribed { subscription_id, .. } => Ok(subscription_id),
            other => Err(unexpected(other)),
        }
    }

    fn cancel_hook(&self, subscription_id: u64) -> impl FnOnce() + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                if let Ok(mut routes) = inner.routes.lock() {
                    routes.subscriptions.remove(&subscription_id);
                }
                let _ = inner.outgoing.send(ClientMessage::Unsubscribe { subscription_id });
            }
        }
    }
}

fn unexpected(msg: ServerMessage) -> BackendError {
    BackendError::Unavailable(format!("unexpected relay reply: {:?}", msg))
}

#[async_trait]
impl SyncBackend for RemoteBackend {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, BackendError> {
        let request_id = self.next_request_id();
        let msg = ClientMessage::Read { request_id, path: path.to_string() };
        match self.request(request_id, msg).await? {
            ServerMessage::ReadResult { value, .. } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, path: &StorePath, value: Value) -> Result<(), BackendError> {
        let request_id = self.next_request_id();
        self.expect_ack(request_id, ClientMessage::Write { request_id, path: path.to_string(), value })
            .await
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), BackendError> {
        let request_id = self.next_request_id();
        self.expect_ack(request_id, ClientMessage::Update { request_id, path: path.to_string(), fields })
            .await
    }

    async fn remove(&self, path: &StorePath) -> Result<(), BackendError> {
        let request_id = self.next_request_id();
        self.expect_ack(request_id, ClientMessage::Remove { request_id, path: path.to_string() })
            .await
    }

    async fn transact(
        &self,
        path: &StorePath,
        apply: TransactFn<'_>,
    ) -> Result<TransactResult, BackendError> {
        optimistic_transact(self, path, apply, self.inner.max_attempts).await
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription<Option<Value>>, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .open_subscription(path, SubscriptionMode::Value, SubscriptionSender::Value(tx))
            .await?;
        Ok(Subscription::with_cancel(rx, self.cancel_hook(id)))
    }

    async fn subscribe_child_added(
        &self,
        path: &StorePath,
    ) -> Result<Subscription<ChildAdded>, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .open_subscription(path, SubscriptionMode::ChildAdded, SubscriptionSender::Child(tx))
            .await?;
        Ok(Subscription::with_cancel(rx, self.cancel_hook(id)))
    }

    async fn server_time(&self) -> Result<ServerTimeSample, BackendError> {
        let request_id = self.next_request_id();
        let sent = Instant::now();
        let ping = ClientMessage::Ping { request_id, timestamp: epoch_millis() };
        match self.request(request_id, ping).await? {
            ServerMessage::Pong { server_time, .. } => Ok(ServerTimeSample {
                server_time_ms: server_time,
                round_trip_ms: sent.elapsed().as_secs_f64() * 1000.0,
            }),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl CompareAndSet for RemoteBackend {
    async fn snapshot(&self, path: &StorePath) -> Result<Option<Value>, BackendError> {
        self.read(path).await
    }

    async fn compare_and_set(
        &self,
        path: &StorePath,
        expected: Option<Value>,
        value: Value,
    ) -> Result<Result<(), Option<Value>>, BackendError> {
        let request_id = self.next_request_id();
        let msg = ClientMessage::CompareAndSet { request_id, path: path.to_string(), expected, value };
        match self.request(request_id, msg).await? {
            ServerMessage::CasResult { committed: true, .. } => Ok(Ok(())),
            ServerMessage::CasResult { current, .. } => Ok(Err(current)),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ServerClock;
    use crate::network::backend::Transaction;
    use crate::network::memory::InMemoryBackend;
    use crate::network::server::{ServerConfig, StoreServer};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn start_relay() -> (Arc<StoreServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(StoreServer::new(ServerConfig::default(), InMemoryBackend::new()));
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, format!("ws://{}", addr))
    }

    fn path(s: &str) -> StorePath {
        StorePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_remote_read_write_transact() {
        let (server, url) = start_relay().await;
        let remote = RemoteBackend::connect(&url).await.unwrap();

        remote.write(&path("a/b"), json!({"x": 1})).await.unwrap();
        assert_eq!(remote.read(&path("a/b/x")).await.unwrap(), Some(json!(1)));
        assert_eq!(
            server.store().read(&path("a/b")).await.unwrap(),
            Some(json!({"x": 1}))
        );

        let increment = |current: Option<&Value>| {
            Transaction::Commit(json!(current.and_then(Value::as_i64).unwrap_or(0) + 1))
        };
        remote.transact(&path("n"), &increment).await.unwrap();
        let result = remote.transact(&path("n"), &increment).await.unwrap();
        assert_eq!(result.value, Some(json!(2)));

        assert!(matches!(
            remote.read(&StorePath::root("bad#path")).await,
            Ok(None)
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_remote_subscriptions() {
        let (server, url) = start_relay().await;
        let remote = RemoteBackend::connect(&url).await.unwrap();

        let mut values = remote.subscribe(&path("s")).await.unwrap();
        assert_eq!(values.recv().await, Some(None));

        let mut children = remote.subscribe_child_added(&path("events")).await.unwrap();
        remote.write(&path("s"), json!("hi")).await.unwrap();
        remote.write(&path("events/e1"), json!({"n": 1})).await.unwrap();

        assert_eq!(values.recv().await, Some(Some(json!("hi"))));
        assert_eq!(children.recv().await.unwrap().key, "e1");

        drop(values);
        drop(children);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.subscription_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_remote_offset_is_small_locally() {
        let (server, url) = start_relay().await;
        let remote = RemoteBackend::connect(&url).await.unwrap();
        let sample = remote.server_time().await.unwrap();
        assert!(sample.round_trip_ms >= 0.0);

        let clock = ServerClock::system();
        let offset = clock.apply_sample(sample).unwrap();
        assert!(offset.abs() < 1_000.0);
        server.shutdown();
    }
}
