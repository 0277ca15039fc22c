use super::cancel::{CancelToken, Deadline};
use super::emitter::{CollectEmitter, EmitControl, Emitter};
use super::job;
use super::params::{InferenceParams, SamplingConfig};
use super::result::{InferenceResult, StopReason, StreamChunk};
use crate::error::{CoreError, InferenceError, Result};
use crate::model::{ModelLease, Step};
use crate::sandbox::ScratchArena;
use crate::session::ExecutionPermit;
use crate::types::{SessionId, TokenId};
use std::time::{Duration, Instant};

/// Outcome of one [`Generation::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Chunk(StreamChunk),
    Done(StopReason),
}

/// A running generation.
///
/// Owns everything one inference call needs. Dropping it releases the arena,
/// then the model lease, then the session's execution slot.
pub struct Generation {
    arena: ScratchArena,
    lease: ModelLease,
    sampling: SamplingConfig,
    max_new_tokens: usize,
    deadline: Option<Deadline>,
    started: Instant,
    prefilled: bool,
    emitted: usize,
    // One token of look-ahead so the last chunk can be marked final.
    pending: Option<TokenId>,
    finished: Option<StopReason>,
    permit: ExecutionPermit,
}

impl Generation {
    /// Produce the next chunk, or the reason the generation ended.
    ///
    /// Cancellation and the deadline are checked before every backend call.
    /// Once `Done` has been returned, every later call returns it again.
    pub fn advance(&mut self) -> Result<Progress> {
        loop {
            if let Some(reason) = self.finished {
                return Ok(Progress::Done(reason));
            }
            if self.permit.cancel_token().is_cancelled() {
                return Ok(self.interrupt(StopReason::Cancelled));
            }
            if self.deadline.is_some_and(|d| d.is_expired()) {
                return Ok(self.interrupt(StopReason::TimedOut));
            }

            let backend = self.lease.backend();
            if !self.prefilled {
                let mut ctx = self.arena.decode_context(&self.sampling);
                backend.prefill(&mut ctx).map_err(InferenceError::Backend)?;
                self.prefilled = true;
                continue;
            }

            if self.arena.generated().len() >= self.max_new_tokens || self.arena.is_full() {
                return Ok(self.complete(StopReason::LengthLimit));
            }

            let mut ctx = self.arena.decode_context(&self.sampling);
            let step = backend.next_token(&mut ctx).map_err(InferenceError::Backend)?;
            match step {
                Step::Token(token) => {
                    self.arena.push(token);
                    if let Some(previous) = self.pending.replace(token) {
                        return Ok(Progress::Chunk(self.chunk(previous, false)));
                    }
                }
                Step::EndOfSequence => return Ok(self.complete(StopReason::EndOfSequence)),
            }
        }
    }

    /// Natural end: flush the look-ahead token as the final chunk.
    fn complete(&mut self, reason: StopReason) -> Progress {
        self.finished = Some(reason);
        match self.pending.take() {
            Some(token) => Progress::Chunk(self.chunk(token, true)),
            None => self.done(reason),
        }
    }

    /// Cancellation or timeout: the look-ahead token is never delivered.
    fn interrupt(&mut self, reason: StopReason) -> Progress {
        self.pending = None;
        self.finished = Some(reason);
        self.done(reason)
    }

    fn done(&self, reason: StopReason) -> Progress {
        log::debug!(
            "Generation for session {} stopped: {reason} after {} token(s)",
            self.session(),
            self.emitted
        );
        Progress::Done(reason)
    }

    fn chunk(&mut self, token: TokenId, is_final: bool) -> StreamChunk {
        let chunk = StreamChunk {
            token,
            index: self.emitted,
            is_final,
        };
        self.emitted += 1;
        chunk
    }

    pub fn session(&self) -> SessionId {
        self.permit.session()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.permit.cancel_token()
    }

    pub fn cancel(&self) {
        self.permit.cancel_token().cancel();
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Turn a stop reason into the caller-facing outcome. Consumes the
    /// generation so its resources are released before the result is returned.
    pub fn settle(self, reason: StopReason, tokens: Vec<TokenId>) -> Result<InferenceResult> {
        let elapsed = self.elapsed();
        let budget = self.deadline.map(|d| d.budget());
        drop(self);
        match reason {
            StopReason::Cancelled => Err(CoreError::Cancelled),
            StopReason::TimedOut => Err(CoreError::Timeout(budget.unwrap_or(elapsed))),
            StopReason::LengthLimit | StopReason::EndOfSequence => Ok(InferenceResult {
                token_count: tokens.len(),
                tokens,
                stop_reason: reason,
                elapsed,
            }),
        }
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("session", &self.session())
            .field("model", &self.lease.info().id)
            .field("arena", &self.arena.id())
            .field("emitted", &self.emitted)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Drives a model backend token by token inside a sandbox arena.
#[derive(Debug, Default, Clone, Copy)]
pub struct InferenceEngine;

impl InferenceEngine {
    pub fn new() -> Self {
        Self
    }

    /// Validate the prompt against the model and set up a generation.
    ///
    /// No backend call happens here; the prompt is prefilled on the first
    /// [`Generation::advance`].
    pub fn start(
        &self,
        permit: ExecutionPermit,
        lease: ModelLease,
        mut arena: ScratchArena,
        params: &InferenceParams,
        deadline: Option<Deadline>,
    ) -> Result<Generation> {
        let info = lease.info();
        if let Some(token) = params
            .tokens
            .iter()
            .find(|t| **t as usize >= info.vocab_size)
        {
            return Err(InferenceError::InvalidParams(format!(
                "token {token} is outside the vocabulary of model {} ({} entries)",
                info.id, info.vocab_size
            ))
            .into());
        }
        arena.load_prompt(&params.tokens)?;

        log::debug!(
            "Starting generation for session {} on model {} in {} ({} prompt tokens, max {} new)",
            permit.session(),
            info.id,
            arena.id(),
            params.tokens.len(),
            params.max_new_tokens
        );
        Ok(Generation {
            arena,
            lease,
            sampling: params.sampling.clone().unwrap_or_default(),
            max_new_tokens: params.max_new_tokens,
            deadline,
            started: Instant::now(),
            prefilled: false,
            emitted: 0,
            pending: None,
            finished: None,
            permit,
        })
    }

    /// Run `generation` to its end, handing every chunk to `emitter`.
    ///
    /// An emitter asking to stop cancels the generation.
    pub fn drive(
        &self,
        generation: &mut Generation,
        emitter: &dyn Emitter<StreamChunk>,
    ) -> Result<StopReason> {
        loop {
            match generation.advance()? {
                Progress::Chunk(chunk) => {
                    if emitter.emit(chunk)? == EmitControl::Stop {
                        generation.cancel();
                    }
                }
                Progress::Done(reason) => {
                    emitter.end()?;
                    return Ok(reason);
                }
            }
        }
    }

    /// Run `generation` on the calling thread and collect its output.
    pub fn run(&self, mut generation: Generation) -> Result<InferenceResult> {
        let collector = CollectEmitter::new();
        let reason = self.drive(&mut generation, &collector)?;
        let tokens = collector.into_inner().into_iter().map(|c| c.token).collect();
        generation.settle(reason, tokens)
    }

    /// Cooperative twin of [`InferenceEngine::run`].
    ///
    /// The generation runs on its own producer thread, so the backend never
    /// blocks an executor worker and the session is released even if this
    /// future is never polled again. The deadline is raced on the executor;
    /// dropping the future cancels the generation.
    pub async fn run_async(&self, generation: Generation) -> Result<InferenceResult> {
        let engine = *self;
        let session = generation.session();
        let cancel = generation.cancel_token().clone();
        let deadline = generation.deadline();
        let mut finished = job::spawn_detached(session, move || engine.run(generation))?;
        let _abandon = CancelOnDrop(&cancel);

        let outcome = match deadline {
            Some(deadline) => {
                let expiry = tokio::time::Instant::from_std(deadline.instant());
                tokio::select! {
                    outcome = &mut finished => outcome,
                    _ = tokio::time::sleep_until(expiry) => {
                        cancel.cancel();
                        (&mut finished).await
                    }
                }
            }
            None => (&mut finished).await,
        };

        // A deadline caught by the race above surfaces as a cancellation.
        match (job::settle_detached(outcome)?, deadline) {
            (Err(CoreError::Cancelled), Some(deadline)) if deadline.is_expired() => {
                Err(CoreError::Timeout(deadline.budget()))
            }
            (result, _) => result,
        }
    }
}

struct CancelOnDrop<'a>(&'a CancelToken);

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
