//! Ensemble: the shared, server side of the coordination store.
//!
//! Holds node data and live sessions in redb and fans out change
//! notifications per namespace. Clients talk to it through
//! [`StoreClient`]; the remaining public methods are operational hooks
//! (session expiry, availability) used by tests and tooling.
//!
//! A session that no client operation has touched for longer than the
//! session timeout is expired by [`Ensemble::reap_expired`], which
//! [`Ensemble::spawn_reaper`] runs in the background.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use beacon_core::epoch_millis;

use crate::client::StoreClient;
use crate::error::{StoreError, StoreResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(40);

/// Thread-safe coordination store backend.
#[derive(Clone)]
pub struct Ensemble {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    /// namespace → revision sender.
    watchers: Mutex<HashMap<String, watch::Sender<u64>>>,
    next_session: AtomicU64,
    available: AtomicBool,
    /// session id → last time its client reached the ensemble.
    last_seen: Mutex<HashMap<u64, Instant>>,
    session_timeout_ms: AtomicU64,
}

impl Ensemble {
    /// Open (or create) an on-disk ensemble.
    ///
    /// Sessions from a previous run are gone, so their ephemeral nodes are
    /// purged; persistent nodes survive.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let ensemble = Self::from_db(db)?;
        let purged = ensemble.purge_sessions()?;
        debug!(?path, purged, "ensemble opened");
        Ok(ensemble)
    }

    /// Create an in-memory ensemble.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let ensemble = Self::from_db(db)?;
        debug!("in-memory ensemble opened");
        Ok(ensemble)
    }

    fn from_db(db: Database) -> StoreResult<Self> {
        let ensemble = Self {
            inner: Arc::new(Inner {
                db,
                watchers: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                available: AtomicBool::new(true),
                last_seen: Mutex::new(HashMap::new()),
                session_timeout_ms: AtomicU64::new(DEFAULT_SESSION_TIMEOUT.as_millis() as u64),
            }),
        };
        ensemble.ensure_tables()?;
        Ok(ensemble)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Connect a new client with a fresh session.
    pub fn connect(&self) -> StoreResult<StoreClient> {
        StoreClient::connect(self.clone())
    }

    // ── Operational hooks ──────────────────────────────────────────

    /// Simulate the ensemble becoming (un)reachable. While unavailable every
    /// client operation fails with `ConnectionLost`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        info!(available, "ensemble availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Expire a session as the server would after missed heartbeats.
    /// Returns the number of ephemeral nodes removed.
    pub fn expire_session(&self, token: SessionToken) -> StoreResult<usize> {
        let removed = self.remove_session(token)?;
        warn!(session = %token, removed, "session expired");
        Ok(removed)
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        self.inner
            .session_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
        debug!(?timeout, "session timeout set");
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.session_timeout_ms.load(Ordering::SeqCst))
    }

    /// Expire every session idle for longer than the session timeout.
    /// Returns the number of ephemeral nodes removed.
    pub fn reap_expired(&self) -> StoreResult<usize> {
        let timeout = self.session_timeout();
        let now = Instant::now();
        let idle: Vec<SessionToken> = self
            .last_seen()
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(id, _)| SessionToken(*id))
            .collect();

        let mut removed = 0;
        for token in idle {
            let nodes = self.remove_session(token)?;
            warn!(session = %token, removed = nodes, ?timeout, "session timed out");
            removed += nodes;
        }
        Ok(removed)
    }

    /// Run [`reap_expired`](Self::reap_expired) every quarter of the session
    /// timeout until the last handle to the ensemble is dropped.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(inner) = inner.upgrade() {
                let ensemble = Ensemble { inner };
                if let Err(e) = ensemble.reap_expired() {
                    warn!(error = %e, "session reaper pass failed");
                }
                let period = (ensemble.session_timeout() / 4).max(Duration::from_millis(10));
                drop(ensemble);
                tokio::time::sleep(period).await;
            }
            debug!("session reaper stopped");
        })
    }

    /// Ids of all live sessions.
    pub fn live_sessions(&self) -> StoreResult<Vec<SessionToken>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            results.push(SessionToken(key.value()));
        }
        Ok(results)
    }

    /// Number of direct children under `namespace`.
    pub fn child_count(&self, namespace: &str) -> StoreResult<usize> {
        Ok(self.children(namespace)?.len())
    }

    // ── Client-facing operations ───────────────────────────────────

    pub(crate) fn check_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::ConnectionLost("ensemble unreachable".to_string()))
        }
    }

    pub(crate) fn open_session(&self) -> StoreResult<SessionToken> {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let info = SessionInfo {
            id,
            created_at_ms: epoch_millis(),
        };
        let value = serde_json::to_vec(&info).map_err(map_err!(Serialize))?;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.last_seen().insert(id, Instant::now());
        debug!(session = %SessionToken(id), "session opened");
        Ok(SessionToken(id))
    }

    pub(crate) fn close_session(&self, token: SessionToken) -> StoreResult<usize> {
        let removed = self.remove_session(token)?;
        debug!(session = %token, removed, "session closed");
        Ok(removed)
    }

    /// Record that the session's client reached the ensemble.
    pub(crate) fn touch(&self, token: SessionToken) {
        self.last_seen().insert(token.0, Instant::now());
    }

    pub(crate) fn is_live(&self, token: SessionToken) -> StoreResult<bool> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        Ok(table.get(token.0).map_err(map_err!(Read))?.is_some())
    }

    pub(crate) fn create(
        &self,
        session: SessionToken,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> StoreResult<()> {
        check_path(path)?;
        let now = epoch_millis();
        let node = StoredNode {
            data: data.to_vec(),
            owner: (mode == CreateMode::Ephemeral).then_some(session.0),
            version: 0,
            created_at_ms: now,
            modified_at_ms: now,
        };
        let value = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;

        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            if sessions.get(session.0).map_err(map_err!(Read))?.is_none() {
                return Err(StoreError::SessionExpired(session.0));
            }
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            if table.get(path).map_err(map_err!(Read))?.is_some() {
                return Err(StoreError::NodeExists(path.to_string()));
            }
            table
                .insert(path, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, ?mode, session = %session, "node created");
        self.notify(parent_path(path));
        Ok(())
    }

    pub(crate) fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        check_path(path)?;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let existing = table
                .get(path)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(existing) = existing else {
                return Err(StoreError::NoNode(path.to_string()));
            };
            let mut node: StoredNode =
                serde_json::from_slice(&existing).map_err(map_err!(Deserialize))?;
            node.data = data.to_vec();
            node.version += 1;
            node.modified_at_ms = epoch_millis();
            let value = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            table
                .insert(path, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.notify(parent_path(path));
        Ok(())
    }

    pub(crate) fn delete(&self, path: &str) -> StoreResult<()> {
        check_path(path)?;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(path).map_err(map_err!(Write))?.is_some();
        }
        if !existed {
            return Err(StoreError::NoNode(path.to_string()));
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, "node deleted");
        self.notify(parent_path(path));
        Ok(())
    }

    pub(crate) fn get(&self, path: &str) -> StoreResult<Option<StoredNode>> {
        check_path(path)?;
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(path).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: StoredNode =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn children(&self, namespace: &str) -> StoreResult<Vec<ChildNode>> {
        let prefix = if namespace == "/" {
            "/".to_string()
        } else {
            check_path(namespace)?;
            format!("{namespace}/")
        };

        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let Some(name) = key.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            // Grandchildren share the prefix but are not direct children.
            if name.contains('/') {
                continue;
            }
            let node: StoredNode =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(ChildNode {
                name: name.to_string(),
                data: node.data,
            });
        }
        Ok(results)
    }

    pub(crate) fn subscribe(&self, namespace: &str) -> watch::Receiver<u64> {
        let mut watchers = self
            .inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        watchers
            .entry(namespace.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    // ── Internals ──────────────────────────────────────────────────

    fn last_seen(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Instant>> {
        self.inner
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, namespace: &str) {
        let watchers = self
            .inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = watchers.get(namespace) {
            tx.send_modify(|revision| *revision += 1);
        }
    }

    /// Drop a session and every ephemeral node it owns.
    ///
    /// The owned-node scan and the removal share one write transaction, so
    /// a concurrent `create` either lands before it (and is removed) or
    /// sees the session gone.
    fn remove_session(&self, token: SessionToken) -> StoreResult<usize> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let mut owned = Vec::new();
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            sessions.remove(token.0).map_err(map_err!(Write))?;

            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let node: StoredNode =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if node.owner == Some(token.0) {
                    owned.push(key.value().to_string());
                }
            }
            for path in &owned {
                table.remove(path.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.last_seen().remove(&token.0);

        for path in &owned {
            self.notify(parent_path(path));
        }
        Ok(owned.len())
    }

    /// Forget all sessions (and their ephemeral nodes) left by a previous
    /// process. Returns the number of nodes removed.
    fn purge_sessions(&self) -> StoreResult<usize> {
        let sessions = self.live_sessions()?;
        let max_id = sessions.iter().map(|s| s.0).max().unwrap_or(0);
        self.inner.next_session.store(max_id + 1, Ordering::SeqCst);

        let mut removed = 0;
        for token in sessions {
            removed += self.remove_session(token)?;
        }
        Ok(removed)
    }
}

fn check_path(path: &str) -> StoreResult<()> {
    if is_valid_path(path) {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}
