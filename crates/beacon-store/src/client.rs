//! StoreClient: one participant's connection to the [`Ensemble`].

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::ensemble::Ensemble;
use crate::error::{StoreError, StoreResult};
use crate::store::CoordinationStore;
use crate::types::*;

/// A client holding one session at a time.
///
/// Every operation that reaches the ensemble keeps the session alive.
/// When the ensemble expires the session, the next operation opens a
/// replacement, publishes [`SessionEvent::Connected`] with the new token
/// and fails with `SessionExpired` so the caller can re-assert its
/// ephemeral state.
pub struct StoreClient {
    ensemble: Ensemble,
    session: Mutex<Option<SessionToken>>,
    events: watch::Sender<SessionEvent>,
}

impl StoreClient {
    pub(crate) fn connect(ensemble: Ensemble) -> StoreResult<Self> {
        ensemble.check_available()?;
        let token = ensemble.open_session()?;
        let (events, _) = watch::channel(SessionEvent::Connected(token));
        debug!(session = %token, "store client connected");
        Ok(Self {
            ensemble,
            session: Mutex::new(Some(token)),
            events,
        })
    }

    /// The session to run the next operation under.
    fn live_session(&self) -> StoreResult<SessionToken> {
        self.ensemble.check_available()?;
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(token) = *session else {
            return Err(StoreError::Closed);
        };
        if self.ensemble.is_live(token)? {
            self.ensemble.touch(token);
            return Ok(token);
        }

        let fresh = self.ensemble.open_session()?;
        *session = Some(fresh);
        self.events.send_replace(SessionEvent::Connected(fresh));
        warn!(expired = %token, session = %fresh, "session re-established");
        Err(StoreError::SessionExpired(token.0))
    }
}

#[async_trait]
impl CoordinationStore for StoreClient {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()> {
        let session = self.live_session()?;
        self.ensemble.create(session, path, data, mode)
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        self.live_session()?;
        self.ensemble.set_data(path, data)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.live_session()?;
        self.ensemble.delete(path)
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.live_session()?;
        Ok(self.ensemble.get(path)?.is_some())
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        self.live_session()?;
        Ok(self.ensemble.get(path)?.map(|node| node.data))
    }

    async fn get_children(&self, namespace: &str) -> StoreResult<Vec<ChildNode>> {
        self.live_session()?;
        self.ensemble.children(namespace)
    }

    async fn watch(&self, namespace: &str) -> StoreResult<watch::Receiver<u64>> {
        self.live_session()?;
        Ok(self.ensemble.subscribe(namespace))
    }

    fn session(&self) -> Option<SessionToken> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_events(&self) -> watch::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> StoreResult<()> {
        let token = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(token) = token else {
            return Ok(());
        };
        self.events.send_replace(SessionEvent::Closed);
        if let Err(e) = self.ensemble.check_available() {
            warn!(session = %token, "store unreachable at close, session left to time out");
            return Err(e);
        }
        self.ensemble.close_session(token)?;
        Ok(())
    }
}
