use super::cancel::{CancelToken, Deadline};
use super::core::{Generation, InferenceEngine};
use super::emitter::{ChannelEmitter, EmitControl};
use super::job::JobHandle;
use super::result::{StopReason, StreamChunk};
use crate::error::{CoreError, InferenceError, Result};
use crate::types::SessionId;
use std::iter::FusedIterator;

type Item = std::result::Result<StreamChunk, CoreError>;

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The final chunk was delivered.
    Completed,
    Failed,
    Cancelled,
}

/// A lazy, finite, non-restartable sequence of generated tokens.
///
/// Chunks are produced on a dedicated thread and delivered through a bounded
/// channel. Once the stream observes cancellation, chunks still buffered are
/// discarded, so what was delivered is always a prefix of the full output.
///
/// The stream ends after the final chunk, after an error, or on cancellation.
/// By the time it reports its end the session is free for another call.
pub struct TokenStream {
    session: SessionId,
    rx: crossbeam::channel::Receiver<Item>,
    cancel: CancelToken,
    deadline: Option<Deadline>,
    job: JobHandle,
    end: Option<StreamEnd>,
}

impl TokenStream {
    pub(crate) fn spawn(
        engine: InferenceEngine,
        mut generation: Generation,
        buffer: usize,
    ) -> Result<Self> {
        let session = generation.session();
        let cancel = generation.cancel_token().clone();
        let deadline = generation.deadline();
        let (tx, rx) = crossbeam::channel::bounded(buffer.max(1));
        let emitter = ChannelEmitter::new(tx, cancel.clone());

        let job = JobHandle::spawn(session, cancel.clone(), move || {
            match engine.drive(&mut generation, &emitter) {
                Ok(StopReason::TimedOut) => {
                    let budget = deadline.map(|d| d.budget()).unwrap_or_default();
                    emitter.fail(CoreError::Timeout(budget));
                }
                Ok(_) => {}
                Err(e) => {
                    if emitter.fail(e) == EmitControl::Stop {
                        log::trace!("Stream consumer for session {session} left before the error");
                    }
                }
            }
            drop(generation);
        })?;

        Ok(Self {
            session,
            rx,
            cancel,
            deadline,
            job,
            end: None,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// How the stream ended, once it has.
    pub fn end(&self) -> Option<StreamEnd> {
        self.end
    }

    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    /// Request cancellation. The next poll returns `None`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Collect every remaining chunk.
    ///
    /// Fails with [`InferenceError::StreamConsumed`] if the stream has already
    /// ended. A cancelled stream yields the chunks delivered before the
    /// cancellation.
    pub fn drain(&mut self) -> Result<Vec<StreamChunk>> {
        if self.is_terminated() {
            return Err(InferenceError::StreamConsumed.into());
        }
        self.by_ref().collect()
    }

    /// Stop consuming: cancel the producer and wait for it to release.
    pub fn abandon(mut self) {
        self.cancel();
        self.finish(StreamEnd::Cancelled);
    }

    fn finish(&mut self, end: StreamEnd) -> Option<CoreError> {
        self.end = Some(end);
        self.job.join().err().map(CoreError::from)
    }

    fn terminate_cancelled(&mut self) -> Option<Item> {
        self.cancel();
        self.finish(StreamEnd::Cancelled).map(Err)
    }

    fn receive(&self) -> Option<std::result::Result<Item, Expired>> {
        let timer = match self.deadline {
            Some(deadline) => crossbeam::channel::at(deadline.instant()),
            None => crossbeam::channel::never(),
        };
        crossbeam::select! {
            recv(self.rx) -> msg => msg.ok().map(Ok),
            recv(self.cancel.signal()) -> _ => None,
            recv(timer) -> _ => Some(Err(Expired)),
        }
    }
}

struct Expired;

impl Iterator for TokenStream {
    type Item = Item;

    fn next(&mut self) -> Option<Item> {
        if self.end.is_some() {
            return None;
        }
        if self.cancel.is_cancelled() {
            return self.terminate_cancelled();
        }

        match self.receive() {
            Some(Ok(Ok(chunk))) => {
                if self.cancel.is_cancelled() {
                    return self.terminate_cancelled();
                }
                if chunk.is_final {
                    if let Some(e) = self.finish(StreamEnd::Completed) {
                        return Some(Err(e));
                    }
                }
                Some(Ok(chunk))
            }
            Some(Ok(Err(e))) => {
                let panicked = self.finish(StreamEnd::Failed);
                Some(Err(panicked.unwrap_or(e)))
            }
            Some(Err(Expired)) => {
                self.cancel();
                let budget = self.deadline.map(|d| d.budget()).unwrap_or_default();
                let panicked = self.finish(StreamEnd::Failed);
                Some(Err(panicked.unwrap_or(CoreError::Timeout(budget))))
            }
            // Disconnected without a final chunk or error, or woken by cancel.
            None => {
                if self.cancel.is_cancelled() {
                    self.terminate_cancelled()
                } else {
                    self.finish(StreamEnd::Failed)
                        .or_else(|| {
                            Some(CoreError::Internal(
                                "stream producer exited without a final chunk".into(),
                            ))
                        })
                        .map(Err)
                }
            }
        }
    }
}

impl FusedIterator for TokenStream {}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if self.end.is_none() {
            self.cancel();
        }
        // `job` joins the producer when it drops.
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("session", &self.session)
            .field("end", &self.end)
            .finish()
    }
}
