use super::core::SessionCore;
use super::gate::SessionState;
use crate::error::Result;
use crate::inference::{InferenceParams, InferenceResult, TokenStream};
use crate::types::SessionId;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A blocking session handle.
///
/// Calls on one session are serialized: while an inference is in flight a
/// second call fails with [`InferenceError::SessionBusy`](crate::InferenceError::SessionBusy).
/// Dropping the handle destroys the session.
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> SessionId {
        self.core.id()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn created_at(&self) -> SystemTime {
        self.core.created_at()
    }

    pub fn idle_for(&self) -> Duration {
        self.core.idle_for()
    }

    /// Run a generation to completion on the calling thread.
    pub fn infer(&self, params: &InferenceParams) -> Result<InferenceResult> {
        let prepared = self.core.prepare(params)?;
        prepared.engine.run(prepared.generation)
    }

    /// Start a generation on a producer thread and return its token stream.
    ///
    /// The session stays busy until the stream ends or is dropped.
    pub fn infer_streaming(&self, params: &InferenceParams) -> Result<TokenStream> {
        let prepared = self.core.prepare(params)?;
        TokenStream::spawn(
            prepared.engine,
            prepared.generation,
            prepared.stream_buffer,
        )
    }

    /// Request cancellation of the in-flight call, if any. Returns immediately.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    /// Cancel any in-flight call and block until its resources are released.
    /// Idempotent.
    pub fn destroy(&self) {
        self.core.destroy();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.core.state() != SessionState::Destroyed {
            self.core.destroy();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
