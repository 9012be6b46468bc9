//! WebSocket Store Relay
//!
//! Exposes an [`InMemoryBackend`] to remote clients. Each connection gets a
//! reader loop, a writer task, and one forwarding task per subscription.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use super::backend::{BackendError, CompareAndSet, StorePath, SyncBackend};
use super::memory::InMemoryBackend;
use super::protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage, SubscriptionMode};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("ARENA_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("ARENA_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            version: defaults.version,
        }
    }
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// Connected client bookkeeping.
struct ConnectedClient {
    connected_at: Instant,
    subscriptions: usize,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The store relay.
pub struct StoreServer {
    config: ServerConfig,
    store: InMemoryBackend,
    clients: Clients,
    shutdown_tx: broadcast::Sender<()>,
}

impl StoreServer {
    /// Create a relay over `store`.
    pub fn new(config: ServerConfig, store: InMemoryBackend) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), StoreServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), StoreServerError> {
        info!("Store relay listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let store = self.store.clone();
        let version = self.config.version.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(256);

            clients.write().await.insert(addr, ConnectedClient {
                connected_at: Instant::now(),
                subscriptions: 0,
            });

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let _ = msg_tx.send(ServerMessage::Hello { server_version: version }).await;

            let mut connection = Connection {
                store,
                sender: msg_tx.clone(),
                subscriptions: BTreeMap::new(),
                next_subscription_id: 1,
            };

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => connection.handle(client_msg).await,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(error_reply(
                                            None,
                                            ErrorCode::InvalidMessage,
                                            "Invalid message format".to_string(),
                                        )).await;
                                    }
                                }
                                if let Some(client) = clients.write().await.get_mut(&addr) {
                                    client.subscriptions = connection.subscriptions.len();
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            connection.close();
            drop(msg_tx);
            let _ = tokio::time::timeout(std::time::Duration::from_millis(200), sender_task).await;

            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    "Client {} cleaned up after {:?}",
                    addr,
                    client.connected_at.elapsed()
                );
            }
        });
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Live subscriptions across all connections.
    pub async fn subscription_count(&self) -> usize {
        self.clients.read().await.values().map(|c| c.subscriptions).sum()
    }

    /// The store being relayed.
    pub fn store(&self) -> &InMemoryBackend {
        &self.store
    }
}

fn error_reply(request_id: Option<u64>, code: ErrorCode, message: String) -> ServerMessage {
    ServerMessage::Error(ServerError { request_id, code, message })
}

fn backend_error_reply(request_id: u64, e: BackendError) -> ServerMessage {
    let code = match e {
        BackendError::InvalidPath(_) => ErrorCode::InvalidPath,
        BackendError::Unavailable(_) | BackendError::Closed => ErrorCode::Unavailable,
        _ => ErrorCode::InternalError,
    };
    error_reply(Some(request_id), code, e.to_string())
}

fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

/// Per-connection request handling.
struct Connection {
    store: InMemoryBackend,
    sender: mpsc::Sender<ServerMessage>,
    subscriptions: BTreeMap<u64, JoinHandle<()>>,
    next_subscription_id: u64,
}

impl Connection {
    async fn handle(&mut self, msg: ClientMessage) {
        let reply = match msg {
            ClientMessage::Read { request_id, path } => {
                match self.read(&path).await {
                    Ok(value) => ServerMessage::ReadResult { request_id, value },
                    Err(e) => backend_error_reply(request_id, e),
                }
            }
            ClientMessage::Write { request_id, path, value } => {
                let result = match StorePath::parse(&path) {
                    Ok(path) => self.store.write(&path, value).await,
                    Err(e) => Err(e),
                };
                ack(request_id, result)
            }
            ClientMessage::Update { request_id, path, fields } => {
                let result = match StorePath::parse(&path) {
                    Ok(path) => self.store.update(&path, fields).await,
                    Err(e) => Err(e),
                };
                ack(request_id, result)
            }
            ClientMessage::Remove { request_id, path } => {
                let result = match StorePath::parse(&path) {
                    Ok(path) => self.store.remove(&path).await,
                    Err(e) => Err(e),
                };
                ack(request_id, result)
            }
            ClientMessage::CompareAndSet { request_id, path, expected, value } => {
                let result = match StorePath::parse(&path) {
                    Ok(path) => self.store.compare_and_set(&path, expected, value).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(Ok(())) => ServerMessage::CasResult { request_id, committed: true, current: None },
                    Ok(Err(current)) => ServerMessage::CasResult { request_id, committed: false, current },
                    Err(e) => backend_error_reply(request_id, e),
                }
            }
            ClientMessage::Subscribe { request_id, path, mode } => {
                match self.subscribe(request_id, &path, mode).await {
                    Ok(()) => return,
                    Err(e) => backend_error_reply(request_id, e),
                }
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                if let Some(task) = self.subscriptions.remove(&subscription_id) {
                    task.abort();
                    debug!("subscription {} cancelled", subscription_id);
                }
                return;
            }
            ClientMessage::Ping { request_id, timestamp } => ServerMessage::Pong {
                request_id,
                timestamp,
                server_time: epoch_millis(),
            },
        };
        let _ = self.sender.send(reply).await;
    }

    async fn read(&self, path: &str) -> Result<Option<serde_json::Value>, BackendError> {
        let path = StorePath::parse(path)?;
        self.store.read(&path).await
    }

    async fn subscribe(
        &mut self,
        request_id: u64,
        path: &str,
        mode: SubscriptionMode,
    ) -> Result<(), BackendError> {
        let path = StorePath::parse(path)?;
        let subscription_id = self.next_subscription_id;
        self.next_subscription_id += 1;

        // Reply before the forwarding task can emit the first notification.
        let sender = self.sender.clone();
        let task = match mode {
            SubscriptionMode::Value => {
                let mut sub = self.store.subscribe(&path).await?;
                let _ = sender.send(ServerMessage::Subscribed { request_id, subscription_id }).await;
                tokio::spawn(async move {
                    while let Some(value) = sub.recv().await {
                        if sender.send(ServerMessage::Change { subscription_id, value }).await.is_err() {
                            break;
                        }
                    }
                })
            }
            SubscriptionMode::ChildAdded => {
                let mut sub = self.store.subscribe_child_added(&path).await?;
                let _ = sender.send(ServerMessage::Subscribed { request_id, subscription_id }).await;
                tokio::spawn(async move {
                    while let Some(added) = sub.recv().await {
                        let msg = ServerMessage::ChildAdded {
                            subscription_id,
                            key: added.key,
                            value: added.value,
                        };
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                })
            }
        };
        debug!("subscription {} on {} ({:?})", subscription_id, path, mode);
        self.subscriptions.insert(subscription_id, task);
        Ok(())
    }

    fn close(&mut self) {
        for (_, task) in std::mem::take(&mut self.subscriptions) {
            task.abort();
        }
    }
}

fn ack(request_id: u64, result: Result<(), BackendError>) -> ServerMessage {
    match result {
        Ok(()) => ServerMessage::Ack { request_id },
        Err(e) => backend_error_reply(request_id, e),
    }
}
