//! The process-wide runtime: authenticated once, owns the model registry, the
//! live-session table and the sandbox memory budget.
use crate::auth::{AuthValidator, CredentialHash};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, Result};
use crate::inference::InferenceEngine;
use crate::model::ModelRegistry;
use crate::sandbox::MemoryBudget;
use crate::session::{AsyncSession, Session, SessionManager};
use crate::types::SessionId;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};


pub(crate) struct RuntimeInner {
    credential: CredentialHash,
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: ModelRegistry,
    pub(crate) sessions: SessionManager,
    pub(crate) engine: InferenceEngine,
    pub(crate) budget: MemoryBudget,
    shut_down: AtomicBool,
    started: Instant,
}

impl RuntimeInner {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Point-in-time health snapshot of a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub version: &'static str,
    pub uptime: Duration,
    pub live_sessions: usize,
    pub max_sessions: usize,
    pub loaded_models: usize,
    pub inferences_in_flight: usize,
    pub arena_bytes_in_use: usize,
    pub live_arenas: usize,
    pub shut_down: bool,
}

/// Entry point of the kernel.
///
/// Authentication happens exactly once, here. Sessions created from a runtime
/// hold only a weak reference to it, so dropping the runtime tears everything
/// down: live sessions are destroyed and models unloaded.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(credential: &str, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let credential = AuthValidator::from_config(&config.auth)
            .validate(credential)
            .inspect_err(|e| log::warn!("Runtime authentication failed: {e}"))?;

        let inner = RuntimeInner {
            credential,
            registry: ModelRegistry::new(),
            sessions: SessionManager::new(config.max_sessions, config.session_idle_timeout()),
            engine: InferenceEngine::new(),
            budget: MemoryBudget::new(&config.sandbox),
            shut_down: AtomicBool::new(false),
            started: Instant::now(),
            config,
        };
        log::info!(
            "Runtime {} started (max {} sessions)",
            Self::version(),
            inner.config.max_sessions
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.is_shut_down() {
            return Err(CoreError::RuntimeShutDown);
        }
        Ok(())
    }

    pub fn create_session(&self) -> Result<Session> {
        self.ensure_live()?;
        let core = self.inner.sessions.create(Arc::downgrade(&self.inner))?;
        Ok(Session::new(core))
    }

    pub fn create_async_session(&self) -> Result<AsyncSession> {
        self.ensure_live()?;
        let core = self.inner.sessions.create(Arc::downgrade(&self.inner))?;
        Ok(AsyncSession::new(core))
    }

    /// Destroy a session by id. Returns `false` if it was not live.
    pub fn destroy_session(&self, id: SessionId) -> bool {
        self.inner.sessions.destroy(id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.ids()
    }

    pub fn has_session(&self, id: SessionId) -> bool {
        self.inner.sessions.contains(id)
    }

    pub fn model_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn reap_idle_sessions(&self) -> Vec<SessionId> {
        self.inner.sessions.reap_idle()
    }

    pub fn stats(&self) -> RuntimeStats {
        let inner = &self.inner;
        RuntimeStats {
            version: Self::version(),
            uptime: inner.started.elapsed(),
            live_sessions: inner.sessions.len(),
            max_sessions: inner.config.max_sessions,
            loaded_models: inner.registry.len(),
            inferences_in_flight: inner.registry.total_in_flight(),
            arena_bytes_in_use: inner.budget.in_use(),
            live_arenas: inner.budget.live_arenas(),
            shut_down: inner.is_shut_down(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Destroy every session, then unload every model. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let destroyed = self.inner.sessions.destroy_all();
        self.unload_models(destroyed);
    }

    /// Like [`Runtime::shutdown`], but waits for sessions without blocking
    /// the executor.
    pub async fn shutdown_async(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut destroyed = 0;
        for id in self.inner.sessions.ids() {
            if self.inner.sessions.destroy_async(id).await {
                destroyed += 1;
            }
        }
        self.unload_models(destroyed);
    }

    fn unload_models(&self, sessions_destroyed: usize) {
        let left = self.inner.registry.unload_all();
        log::info!(
            "Runtime shut down: {sessions_destroyed} session(s) destroyed, {} model(s) left loaded",
            left.len()
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("credential", &self.inner.credential)
            .field("sessions", &self.inner.sessions.len())
            .field("models", &self.inner.registry.len())
            .field("shut_down", &self.inner.is_shut_down())
            .finish()
    }
}
