use super::core::SessionCore;
use super::gate::SessionState;
use crate::error::{CoreError, Result};
use crate::runtime::RuntimeInner;
use crate::types::SessionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The live-session table.
///
/// The lock only covers bookkeeping. Waiting for a session to release its
/// resources always happens with the table unlocked.
pub(crate) struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<SessionCore>>>,
    max_sessions: usize,
    idle_timeout: Option<Duration>,
}

impl SessionManager {
    pub(crate) fn new(max_sessions: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            idle_timeout,
        }
    }

    pub(crate) fn create(&self, runtime: Weak<RuntimeInner>) -> Result<Arc<SessionCore>> {
        if self.len() >= self.max_sessions {
            self.reap_idle();
        }

        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_sessions {
            return Err(CoreError::ResourceExhausted(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }
        let core = Arc::new(SessionCore::new(runtime));
        sessions.insert(core.id(), core.clone());
        log::info!(
            "Created session {} ({} live)",
            core.id(),
            sessions.len()
        );
        Ok(core)
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Arc<SessionCore>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Cancel the session's in-flight call, wait for release, then forget it.
    ///
    /// Returns `false` if the session was not live. Idempotent.
    pub(crate) fn destroy(&self, id: SessionId) -> bool {
        let Some(core) = self.get(id) else {
            return false;
        };
        core.close_blocking();
        self.forget(id)
    }

    pub(crate) async fn destroy_async(&self, id: SessionId) -> bool {
        let Some(core) = self.get(id) else {
            return false;
        };
        core.close().await;
        self.forget(id)
    }

    fn forget(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().remove(&id).is_some();
        if removed {
            log::info!("Destroyed session {id}");
        }
        removed
    }

    /// Destroy every live session. Returns how many were destroyed.
    pub(crate) fn destroy_all(&self) -> usize {
        let ids = self.ids();
        ids.into_iter().filter(|id| self.destroy(*id)).count()
    }

    /// Destroy sessions that have been idle longer than the configured
    /// timeout. Does nothing when no timeout is configured.
    pub(crate) fn reap_idle(&self) -> Vec<SessionId> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let expired: Vec<SessionId> = self
            .sessions
            .lock()
            .values()
            .filter(|core| core.state() == SessionState::Active && core.idle_for() >= timeout)
            .map(|core| core.id())
            .collect();

        expired
            .into_iter()
            .filter(|id| {
                let reaped = self.destroy(*id);
                if reaped {
                    log::info!("Reaped session {id} after {timeout:?} idle");
                }
                reaped
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().copied().collect()
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }
}
