use super::gate::{ExecutionGate, ExecutionPermit, SessionState};
use crate::error::{CoreError, Result};
use crate::inference::{Deadline, Generation, InferenceEngine, InferenceParams};
use crate::runtime::RuntimeInner;
use crate::sandbox::ScratchArena;
use crate::types::SessionId;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

/// A generation ready to be consumed, plus what the caller needs to do so.
pub(crate) struct Prepared {
    pub engine: InferenceEngine,
    pub generation: Generation,
    pub stream_buffer: usize,
}

/// State shared by the blocking and cooperative session handles.
pub(crate) struct SessionCore {
    id: SessionId,
    created_at: SystemTime,
    gate: Arc<ExecutionGate>,
    runtime: Weak<RuntimeInner>,
}

impl SessionCore {
    pub(crate) fn new(runtime: Weak<RuntimeInner>) -> Self {
        let id = SessionId::new();
        Self {
            id,
            created_at: SystemTime::now(),
            gate: ExecutionGate::new(id),
            runtime,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub(crate) fn state(&self) -> SessionState {
        self.gate.state()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.gate.idle_for()
    }

    pub(crate) fn cancel(&self) -> bool {
        let cancelled = self.gate.cancel();
        if cancelled {
            log::debug!("Cancellation requested for session {}", self.id);
        }
        cancelled
    }

    fn runtime(&self) -> Result<Arc<RuntimeInner>> {
        match self.runtime.upgrade() {
            Some(runtime) if !runtime.is_shut_down() => Ok(runtime),
            _ => Err(CoreError::RuntimeShutDown),
        }
    }

    pub(crate) fn prepare(&self, params: &InferenceParams) -> Result<Prepared> {
        let runtime = self.runtime()?;
        let permit = self.gate.begin()?;
        Self::launch(&runtime, permit, params)
    }

    pub(crate) async fn prepare_async(&self, params: &InferenceParams) -> Result<Prepared> {
        let runtime = self.runtime()?;
        let permit = self.gate.begin_async().await?;
        Self::launch(&runtime, permit, params)
    }

    fn launch(
        runtime: &RuntimeInner,
        permit: ExecutionPermit,
        params: &InferenceParams,
    ) -> Result<Prepared> {
        params.validate()?;
        let lease = runtime.registry.lease(params.model_id)?;
        let arena = ScratchArena::allocate(
            &runtime.budget,
            permit.session(),
            lease.info(),
            runtime.config.sandbox.bytes_per_token,
        )?;
        let deadline =
            Deadline::from_timeout(params.effective_timeout(runtime.config.default_timeout()));
        let generation = runtime
            .engine
            .start(permit, lease, arena, params, deadline)?;
        Ok(Prepared {
            engine: runtime.engine,
            generation,
            stream_buffer: runtime.config.stream_buffer,
        })
    }

    /// Cancel any in-flight call and block until it has released.
    pub(crate) fn close_blocking(&self) {
        self.gate.close_blocking();
    }

    pub(crate) async fn close(&self) {
        self.gate.close().await;
    }

    /// Destroy through the manager, then make sure the gate is closed even if
    /// the runtime is gone or a reap already dropped the session from the table.
    pub(crate) fn destroy(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.sessions.destroy(self.id);
        }
        self.close_blocking();
    }

    pub(crate) async fn destroy_async(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.sessions.destroy_async(self.id).await;
        }
        self.close().await;
    }
}
