use super::core::SessionCore;
use super::gate::SessionState;
use crate::error::Result;
use crate::inference::{AsyncTokenStream, InferenceParams, InferenceResult};
use crate::types::SessionId;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// An async session handle for use on a tokio runtime.
///
/// Shares its state machine with [`Session`](super::Session). Generation runs
/// on a producer thread; the futures returned here only wait on it, so model
/// backends never block an executor worker.
pub struct AsyncSession {
    core: Arc<SessionCore>,
}

impl AsyncSession {
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

    pub async fn infer(&self, params: &InferenceParams) -> Result<InferenceResult> {
        let prepared = self.core.prepare_async(params).await?;
        prepared.engine.run_async(prepared.generation).await
    }

    /// Start a generation on a producer thread and return its token stream.
    pub async fn infer_streaming(&self, params: &InferenceParams) -> Result<AsyncTokenStream> {
        let prepared = self.core.prepare_async(params).await?;
        AsyncTokenStream::spawn(prepared.generation, prepared.stream_buffer)
    }

    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    /// Cancel any in-flight call and wait for its resources to be released.
    /// Idempotent.
    pub async fn destroy(&self) {
        self.core.destroy_async().await;
    }
}

impl Drop for AsyncSession {
    fn drop(&mut self) {
        if self.core.state() == SessionState::Destroyed {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let core = self.core.clone();
                handle.spawn(async move { core.destroy_async().await });
            }
            Err(_) => self.core.destroy(),
        }
    }
}

impl std::fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
