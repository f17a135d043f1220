//! Membership publisher: this node's registration record in the store.
//!
//! ```text
//! UNREGISTERED ──true──▶ PUBLISHED ──false──▶ WITHDRAWN
//!                        │   ▲  ▲                 │
//!                        └───┘  └──────true───────┘
//!                       refresh
//! any ──stop──▶ STOPPED
//! ```
//!
//! A failed side effect leaves the state unchanged. The next verdict
//! re-attempts convergence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use beacon_core::{NodeMetadata, ServiceNode, node_path};
use beacon_store::{
    CoordinationStore, CreateMode, SessionEvent, SessionToken, StoreError, StoreResult,
};

use crate::error::{BundleError, BundleResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublisherState {
    Unregistered,
    Published,
    Withdrawn,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub publishes: u64,
    pub refreshes: u64,
    pub withdrawals: u64,
    pub store_failures: u64,
}

#[derive(Default)]
struct Counters {
    publishes: AtomicU64,
    refreshes: AtomicU64,
    withdrawals: AtomicU64,
    store_failures: AtomicU64,
}

struct PublisherInner {
    state: PublisherState,
    /// Session the record was created under.
    published_session: Option<SessionToken>,
    session_events: watch::Receiver<SessionEvent>,
}

impl PublisherInner {
    /// Whether the store has announced a session other than the one the
    /// record was created under.
    fn session_changed(&mut self) -> bool {
        let current = match *self.session_events.borrow_and_update() {
            SessionEvent::Connected(token) => Some(token),
            SessionEvent::Closed => None,
        };
        current != self.published_session
    }
}

/// Drives one registry record. Transitions are serialized.
pub struct MembershipPublisher {
    store: Arc<dyn CoordinationStore>,
    metadata: NodeMetadata,
    path: String,
    retry: RetryPolicy,
    inner: Mutex<PublisherInner>,
    counters: Counters,
}

impl MembershipPublisher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: &str,
        service: &str,
        metadata: NodeMetadata,
        retry: RetryPolicy,
    ) -> Self {
        let path = node_path(namespace, service, &metadata);
        let session_events = store.session_events();
        Self {
            store,
            metadata,
            path,
            retry,
            inner: Mutex::new(PublisherInner {
                state: PublisherState::Unregistered,
                published_session: None,
                session_events,
            }),
            counters: Counters::default(),
        }
    }

    /// Registry path of this node's record.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    pub async fn state(&self) -> PublisherState {
        self.inner.lock().await.state
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            publishes: self.counters.publishes.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            withdrawals: self.counters.withdrawals.load(Ordering::Relaxed),
            store_failures: self.counters.store_failures.load(Ordering::Relaxed),
        }
    }

    /// Move the record toward `target` (present or absent). Returns the
    /// resulting state.
    pub async fn apply(&self, target: bool) -> PublisherState {
        let mut inner = self.inner.lock().await;

        let result = match (inner.state, target) {
            (PublisherState::Stopped, _) => {
                debug!(path = %self.path, "publisher stopped, ignoring verdict");
                return PublisherState::Stopped;
            }
            (PublisherState::Unregistered | PublisherState::Withdrawn, false) => {
                return inner.state;
            }
            (PublisherState::Unregistered | PublisherState::Withdrawn, true) => {
                self.publish().await.map(|session| {
                    inner.published_session = session;
                    PublisherState::Published
                })
            }
            (PublisherState::Published, true) => {
                if inner.session_changed() {
                    self.republish().await.map(|session| {
                        inner.published_session = session;
                        PublisherState::Published
                    })
                } else {
                    self.refresh().await.map(|session| {
                        if let Some(session) = session {
                            inner.published_session = Some(session);
                        }
                        PublisherState::Published
                    })
                }
            }
            (PublisherState::Published, false) => self.withdraw().await.map(|()| {
                inner.published_session = None;
                PublisherState::Withdrawn
            }),
        };

        match result {
            Ok(state) => {
                if state != inner.state {
                    info!(path = %self.path, from = ?inner.state, to = ?state, "membership changed");
                }
                inner.state = state;
            }
            Err(e) => {
                self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %self.path, state = ?inner.state, target, error = %e, "membership transition failed, will retry next cycle");
            }
        }
        inner.state
    }

    /// Delete the record if present, release the store session, and refuse
    /// every later transition. Bounded by `timeout`.
    pub async fn stop(&self, timeout: Duration) -> BundleResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == PublisherState::Stopped {
            return Ok(());
        }
        let was_published = inner.state == PublisherState::Published;
        inner.state = PublisherState::Stopped;
        inner.published_session = None;

        // Close even when the withdrawal failed; the store then times the
        // session out and the record goes with it.
        let result = tokio::time::timeout(timeout, async {
            let withdrawn = if was_published {
                self.withdraw().await
            } else {
                Ok(())
            };
            let closed = self.store.close().await;
            withdrawn.and(closed)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!(path = %self.path, "publisher stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %self.path, error = %e, "publisher stop incomplete, store session expiry will clean up");
                Err(BundleError::Store(e))
            }
            Err(_) => {
                warn!(path = %self.path, ?timeout, "publisher stop timed out");
                Err(BundleError::ShutdownTimeout(timeout))
            }
        }
    }

    // ── Store side effects ─────────────────────────────────────────

    fn payload(&self) -> StoreResult<Vec<u8>> {
        ServiceNode::healthy(self.metadata.clone())
            .to_payload()
            .map_err(|e| StoreError::Serialize(e.to_string()))
    }

    /// Create the record. An existing record at our path (same identity)
    /// is refreshed instead.
    async fn publish(&self) -> StoreResult<Option<SessionToken>> {
        let payload = self.payload()?;
        let created = self
            .retry
            .run("create", || {
                self.store
                    .create(&self.path, &payload, CreateMode::Ephemeral)
            })
            .await;

        match created {
            Ok(()) => {
                self.counters.publishes.fetch_add(1, Ordering::Relaxed);
                info!(path = %self.path, "node published");
                Ok(self.store.session())
            }
            Err(StoreError::NodeExists(_)) => {
                debug!(path = %self.path, "record already present, refreshing");
                let recreated = self.refresh().await?;
                Ok(recreated.or_else(|| self.store.session()))
            }
            Err(e) => Err(e),
        }
    }

    /// Rewrite the record's timestamp. A record the store removed behind
    /// our back is re-created.
    async fn refresh(&self) -> StoreResult<Option<SessionToken>> {
        let payload = self.payload()?;
        let updated = self
            .retry
            .run("set_data", || self.store.set_data(&self.path, &payload))
            .await;

        match updated {
            Ok(()) => {
                self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(path = %self.path, "node refreshed");
                Ok(None)
            }
            Err(StoreError::NoNode(_)) => {
                warn!(path = %self.path, "record vanished from store, re-creating");
                self.create_fresh().await
            }
            Err(e) => Err(e),
        }
    }

    /// The session changed since publish: any record at our path belongs
    /// to the dead session, so replace it.
    async fn republish(&self) -> StoreResult<Option<SessionToken>> {
        let present = self
            .retry
            .run("exists", || self.store.exists(&self.path))
            .await?;
        if present {
            debug!(path = %self.path, "removing record owned by previous session");
            self.withdraw_quiet().await?;
        }
        info!(path = %self.path, "store session changed, re-creating record");
        self.create_fresh().await
    }

    async fn create_fresh(&self) -> StoreResult<Option<SessionToken>> {
        let payload = self.payload()?;
        self.retry
            .run("create", || {
                self.store
                    .create(&self.path, &payload, CreateMode::Ephemeral)
            })
            .await?;
        self.counters.publishes.fetch_add(1, Ordering::Relaxed);
        info!(path = %self.path, "node published");
        Ok(self.store.session())
    }

    async fn withdraw(&self) -> StoreResult<()> {
        self.withdraw_quiet().await?;
        self.counters.withdrawals.fetch_add(1, Ordering::Relaxed);
        info!(path = %self.path, "node withdrawn");
        Ok(())
    }

    /// Delete the record; an absent record is already converged.
    async fn withdraw_quiet(&self) -> StoreResult<()> {
        match self
            .retry
            .run("delete", || self.store.delete(&self.path))
            .await
        {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
