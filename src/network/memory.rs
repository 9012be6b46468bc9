//! In-Process Store
//!
//! A JSON tree implementing [`SyncBackend`]. Backs the relay server and the
//! tests. Subscribers are notified after every mutation; value subscribers
//! only when the value at their path actually changed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::ArenaConfig;
use crate::core::clock::ServerTimeSample;

use super::backend::{
    optimistic_transact, BackendError, ChildAdded, CompareAndSet, StorePath, Subscription,
    SyncBackend, TransactFn, TransactResult,
};

/// Default optimistic transaction attempts.
pub const DEFAULT_TRANSACT_ATTEMPTS: u32 = 25;

struct ValueWatcher {
    path: StorePath,
    last: Option<Value>,
    sender: mpsc::UnboundedSender<Option<Value>>,
}

struct ChildWatcher {
    path: StorePath,
    seen: BTreeSet<String>,
    sender: mpsc::UnboundedSender<ChildAdded>,
}

struct StoreInner {
    root: Value,
    value_watchers: Vec<ValueWatcher>,
    child_watchers: Vec<ChildWatcher>,
}

/// In-memory shared store. Cloning shares the same tree.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<StoreInner>>,
    offset_ms_bits: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    max_attempts: u32,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("offset_ms", &f64::from_bits(self.offset_ms_bits.load(Ordering::SeqCst)))
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

impl InMemoryBackend {
    /// Empty store.
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_TRANSACT_ATTEMPTS)
    }

    /// Empty store with a custom transaction attempt limit.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                root: Value::Object(Map::new()),
                value_watchers: Vec::new(),
                child_watchers: Vec::new(),
            })),
            offset_ms_bits: Arc::new(AtomicU64::new(0f64.to_bits())),
            unavailable: Arc::new(AtomicBool::new(false)),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Empty store using the configured transaction attempt limit.
    pub fn from_config(config: &ArenaConfig) -> Self {
        Self::with_max_attempts(config.transact_max_retries)
    }

    /// Skew of the reported server time against this machine's wall clock.
    pub fn set_server_offset_ms(&self, offset_ms: f64) {
        self.offset_ms_bits.store(offset_ms.to_bits(), Ordering::SeqCst);
    }

    /// Make every operation fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copy of the whole tree.
    pub fn dump(&self) -> Value {
        self.lock().map(|inner| inner.root.clone()).unwrap_or(Value::Null)
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, BackendError> {
        self.inner
            .lock()
            .map_err(|_| BackendError::Unavailable("store lock poisoned".to_string()))
    }

    /// Apply `f`, then notify watchers whose path overlaps one of `changed`.
    fn mutate(&self, changed: &[&StorePath], f: impl FnOnce(&mut Value)) -> Result<(), BackendError> {
        self.check_available()?;
        let mut inner = self.lock()?;
        f(&mut inner.root);
        inner.notify(changed);
        Ok(())
    }
}

impl StoreInner {
    /// Only watchers on, above or below a changed path are looked at, and
    /// only values that are actually sent get cloned.
    fn notify(&mut self, changed: &[&StorePath]) {
        let root = &self.root;
        let touched = |path: &StorePath| changed.iter().any(|c| overlaps(c, path));

        self.value_watchers.retain_mut(|watcher| {
            if !touched(&watcher.path) {
                return !watcher.sender.is_closed();
            }
            let current = get_at(root, &watcher.path);
            if current == watcher.last.as_ref() {
                return !watcher.sender.is_closed();
            }
            watcher.last = current.cloned();
            watcher.sender.send(watcher.last.clone()).is_ok()
        });

        self.child_watchers.retain_mut(|watcher| {
            if !touched(&watcher.path) {
                return !watcher.sender.is_closed();
            }
            let children = match get_at(root, &watcher.path) {
                Some(Value::Object(map)) => Some(map),
                _ => None,
            };
            watcher.seen.retain(|key| children.is_some_and(|map| map.contains_key(key)));
            for (key, value) in children.into_iter().flatten() {
                if watcher.seen.contains(key) {
                    continue;
                }
                watcher.seen.insert(key.clone());
                let added = ChildAdded { key: key.clone(), value: value.clone() };
                if watcher.sender.send(added).is_err() {
                    return false;
                }
            }
            !watcher.sender.is_closed()
        });
    }
}

// =============================================================================
// TREE OPERATIONS
// =============================================================================

/// One path is a prefix of the other.
fn overlaps(a: &StorePath, b: &StorePath) -> bool {
    a.segments().zip(b.segments()).all(|(x, y)| x == y)
}

fn get_at<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Drop nulls and empty objects so a stored tree never holds them.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Object(cleaned)
            }
        }
        other => other,
    }
}

fn set_at(root: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *root = value;
        return;
    };
    if !root.is_object() {
        if value.is_null() {
            return;
        }
        *root = Value::Object(Map::new());
    }
    let Value::Object(map) = root else {
        return;
    };

    if rest.is_empty() {
        if value.is_null() {
            map.remove(*first);
        } else {
            map.insert((*first).to_string(), value);
        }
        return;
    }

    if value.is_null() && !map.contains_key(*first) {
        return;
    }
    let child = map.entry((*first).to_string()).or_insert(Value::Null);
    set_at(child, rest, value);
    if child.is_null() || child.as_object().is_some_and(Map::is_empty) {
        map.remove(*first);
    }
}

fn write_at(root: &mut Value, path: &StorePath, value: Value) {
    let segments: Vec<&str> = path.segments().collect();
    set_at(root, &segments, normalize(value));
}

// =============================================================================
// BACKEND IMPL
// =============================================================================

#[async_trait]
impl SyncBackend for InMemoryBackend {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, BackendError> {
        self.check_available()?;
        let inner = self.lock()?;
        Ok(get_at(&inner.root, path).cloned())
    }

    async fn write(&self, path: &StorePath, value: Value) -> Result<(), BackendError> {
        trace!("write {}", path);
        self.mutate(&[path], |root| write_at(root, path, value))
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), BackendError> {
        trace!("update {} ({} fields)", path, fields.len());
        let mut targets = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let mut target = path.clone();
            for segment in key.split('/').filter(|s| !s.is_empty()) {
                target = target.child(segment);
            }
            targets.push((target, value));
        }
        let changed: Vec<StorePath> = targets.iter().map(|(target, _)| target.clone()).collect();
        let changed: Vec<&StorePath> = changed.iter().collect();
        self.mutate(&changed, |root| {
            for (target, value) in targets {
                write_at(root, &target, value);
            }
        })
    }

    async fn transact(
        &self,
        path: &StorePath,
        apply: TransactFn<'_>,
    ) -> Result<TransactResult, BackendError> {
        optimistic_transact(self, path, apply, self.max_attempts).await
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription<Option<Value>>, BackendError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock()?;
        let current = get_at(&inner.root, path).cloned();
        let _ = tx.send(current.clone());
        inner.value_watchers.push(ValueWatcher { path: path.clone(), last: current, sender: tx });
        Ok(Subscription::new(rx))
    }

    async fn subscribe_child_added(
        &self,
        path: &StorePath,
    ) -> Result<Subscription<ChildAdded>, BackendError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock()?;
        let mut seen = BTreeSet::new();
        if let Some(Value::Object(children)) = get_at(&inner.root, path) {
            for (key, value) in children {
                seen.insert(key.clone());
                let _ = tx.send(ChildAdded { key: key.clone(), value: value.clone() });
            }
        }
        inner.child_watchers.push(ChildWatcher { path: path.clone(), seen, sender: tx });
        Ok(Subscription::new(rx))
    }

    async fn server_time(&self) -> Result<ServerTimeSample, BackendError> {
        self.check_available()?;
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
            * 1000.0;
        let skew_ms = f64::from_bits(self.offset_ms_bits.load(Ordering::SeqCst));
        Ok(ServerTimeSample { server_time_ms: wall_ms + skew_ms, round_trip_ms: 0.0 })
    }
}

#[async_trait]
impl CompareAndSet for InMemoryBackend {
    async fn snapshot(&self, path: &StorePath) -> Result<Option<Value>, BackendError> {
        self.read(path).await
    }

    async fn compare_and_set(
        &self,
        path: &StorePath,
        expected: Option<Value>,
        value: Value,
    ) -> Result<Result<(), Option<Value>>, BackendError> {
        self.check_available()?;
        let mut inner = self.lock()?;
        let current = get_at(&inner.root, path).cloned();
        if current != expected {
            return Ok(Err(current));
        }
        write_at(&mut inner.root, path, value);
        inner.notify(&[path]);
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::backend::Transaction;
    use serde_json::json;

    fn path(s: &str) -> StorePath {
        StorePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let store = InMemoryBackend::new();
        store.write(&path("a/b"), json!({"x": 1})).await.unwrap();
        assert_eq!(store.read(&path("a/b/x")).await.unwrap(), Some(json!(1)));

        store.remove(&path("a/b")).await.unwrap();
        assert_eq!(store.read(&path("a/b")).await.unwrap(), None);
        // Empty parents are pruned.
        assert_eq!(store.read(&path("a")).await.unwrap(), None);

        store.remove(&path("a/b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_null_field_clears_it() {
        let store = InMemoryBackend::new();
        store.write(&path("m"), json!({"a": 1, "b": 2})).await.unwrap();
        store.write(&path("m"), json!({"a": 1, "b": null})).await.unwrap();
        assert_eq!(store.read(&path("m")).await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_update_merges() {
        let store = InMemoryBackend::new();
        store.write(&path("m"), json!({"a": 1, "b": 2})).await.unwrap();
        let mut fields = Map::new();
        fields.insert("b".into(), json!(3));
        fields.insert("c/d".into(), json!(true));
        store.update(&path("m"), fields).await.unwrap();
        assert_eq!(
            store.read(&path("m")).await.unwrap(),
            Some(json!({"a": 1, "b": 3, "c": {"d": true}}))
        );
    }

    #[tokio::test]
    async fn test_transact_commit_and_abort() {
        let store = InMemoryBackend::new();
        let increment = |current: Option<&Value>| {
            let n = current.and_then(Value::as_i64).unwrap_or(0);
            Transaction::Commit(json!(n + 1))
        };
        for _ in 0..3 {
            store.transact(&path("counter"), &increment).await.unwrap();
        }
        assert_eq!(store.read(&path("counter")).await.unwrap(), Some(json!(3)));

        let abort = |_: Option<&Value>| Transaction::Abort;
        let result = store.transact(&path("counter"), &abort).await.unwrap();
        assert!(!result.committed);
        assert_eq!(result.value, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_concurrent_transactions_do_not_lose_updates() {
        let store = InMemoryBackend::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let increment = |current: Option<&Value>| {
                    let n = current.and_then(Value::as_i64).unwrap_or(0);
                    Transaction::Commit(json!(n + 1))
                };
                for _ in 0..5 {
                    store.transact(&path("n"), &increment).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.read(&path("n")).await.unwrap(), Some(json!(40)));
    }

    #[tokio::test]
    async fn test_value_subscription_sends_initial_and_changes() {
        let store = InMemoryBackend::new();
        let mut sub = store.subscribe(&path("s")).await.unwrap();
        assert_eq!(sub.recv().await, Some(None));

        store.write(&path("s"), json!(1)).await.unwrap();
        store.write(&path("other"), json!(1)).await.unwrap();
        store.write(&path("s"), json!(1)).await.unwrap();
        store.write(&path("s"), json!(2)).await.unwrap();

        assert_eq!(sub.recv().await, Some(Some(json!(1))));
        assert_eq!(sub.recv().await, Some(Some(json!(2))));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_child_added_subscription() {
        let store = InMemoryBackend::new();
        store.write(&path("events/e1"), json!({"n": 1})).await.unwrap();

        let mut sub = store.subscribe_child_added(&path("events")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().key, "e1");

        store.write(&path("events/e2"), json!({"n": 2})).await.unwrap();
        store.write(&path("events/e1"), json!({"n": 3})).await.unwrap();
        let added = sub.recv().await.unwrap();
        assert_eq!(added.key, "e2");
        assert_eq!(added.value, json!({"n": 2}));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_transact_gives_up_after_configured_attempts() {
        let config = ArenaConfig { transact_max_retries: 3, ..ArenaConfig::default() };
        let store = InMemoryBackend::from_config(&config);
        let target = path("counter");
        store.write(&target, json!(0)).await.unwrap();

        // Every attempt races a competing write, so none can commit.
        let rival = store.clone();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let apply = |_: Option<&Value>| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            rival.mutate(&[&target], |root| write_at(root, &target, json!(n * 100))).unwrap();
            Transaction::Commit(json!(-1))
        };

        let result = store.transact(&target, &apply).await;
        assert_eq!(result.unwrap_err(), BackendError::Conflict(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unrelated_write_does_not_wake_watchers() {
        let store = InMemoryBackend::new();
        let mut shared = store.subscribe(&path("matches/M1/shared")).await.unwrap();
        let mut events = store.subscribe_child_added(&path("matches/M1/events")).await.unwrap();
        assert_eq!(shared.recv().await, Some(None));

        store.write(&path("queue/p-1"), json!({"matchID": "M2"})).await.unwrap();
        store.write(&path("matches/M2/shared"), json!({"matchID": "M2"})).await.unwrap();
        // A merge update below the watched path reaches it.
        store
            .update(&path("matches/M1"), serde_json::from_value(json!({"shared/status": "waiting"})).unwrap())
            .await
            .unwrap();
        store.write(&path("matches/M1/events/e1"), json!({"kind": "emoji"})).await.unwrap();

        assert_eq!(shared.recv().await, Some(Some(json!({"status": "waiting"}))));
        assert_eq!(events.recv().await.unwrap().key, "e1");
        assert!(shared.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let store = InMemoryBackend::new();
        let sub = store.subscribe(&path("s")).await.unwrap();
        drop(sub);
        store.write(&path("s"), json!(1)).await.unwrap();
        assert_eq!(store.lock().unwrap().value_watchers.len(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryBackend::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.write(&path("a"), json!(1)).await,
            Err(BackendError::Unavailable(_))
        ));
        store.set_unavailable(false);
        store.set_server_offset_ms(250.0);
        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64() * 1000.0;
        let sample = store.server_time().await.unwrap();
        assert!(sample.server_time_ms - before >= 250.0);
        assert!(sample.server_time_ms - before < 1_250.0);
    }
}
