use super::budget::{MemoryBudget, Reservation};
use crate::error::{CoreError, InferenceError};
use crate::inference::SamplingConfig;
use crate::model::{DecodeContext, ModelInfo};
use crate::types::{ArenaId, SessionId, TokenId};

/// Scratch memory for exactly one in-flight inference.
///
/// The arena is owned by value by the generation that uses it; nothing else
/// holds a reference, so two sessions can never touch the same arena.
pub struct ScratchArena {
    owner: SessionId,
    context: Vec<TokenId>,
    capacity: usize,
    prompt_len: usize,
    scratch: Box<[u8]>,
    reservation: Reservation,
}

impl ScratchArena {
    /// Allocate an arena sized from the model's context window.
    pub fn allocate(
        budget: &MemoryBudget,
        owner: SessionId,
        info: &ModelInfo,
        bytes_per_token: usize,
    ) -> Result<Self, CoreError> {
        let bytes = info
            .context_window
            .checked_mul(bytes_per_token)
            .ok_or_else(|| {
                CoreError::ResourceExhausted(format!(
                    "arena size overflows for context window {}",
                    info.context_window
                ))
            })?;
        let reservation = budget.try_reserve(owner, bytes)?;
        log::trace!(
            "Allocated {} ({bytes} bytes) for session {owner}",
            reservation.id()
        );
        Ok(Self {
            owner,
            context: Vec::with_capacity(info.context_window),
            capacity: info.context_window,
            prompt_len: 0,
            scratch: vec![0u8; bytes].into_boxed_slice(),
            reservation,
        })
    }

    pub fn id(&self) -> ArenaId {
        self.reservation.id()
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    /// Copy the prompt into the context buffer.
    pub fn load_prompt(&mut self, tokens: &[TokenId]) -> Result<(), InferenceError> {
        if tokens.len() > self.capacity {
            return Err(InferenceError::ContextExceeded {
                max: self.capacity,
                got: tokens.len(),
            });
        }
        self.context.clear();
        self.context.extend_from_slice(tokens);
        self.prompt_len = tokens.len();
        Ok(())
    }

    /// Append a generated token. Returns `false` if the context is full.
    pub fn push(&mut self, token: TokenId) -> bool {
        if self.is_full() {
            return false;
        }
        self.context.push(token);
        true
    }

    pub fn is_full(&self) -> bool {
        self.context.len() >= self.capacity
    }

    pub fn context(&self) -> &[TokenId] {
        &self.context
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.context[self.prompt_len..]
    }

    pub fn decode_context<'a>(
        &'a mut self,
        sampling: &'a SamplingConfig,
    ) -> DecodeContext<'a> {
        let generated = self.context.len() - self.prompt_len;
        DecodeContext {
            tokens: &self.context,
            scratch: &mut self.scratch,
            sampling,
            generated,
        }
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        self.scratch.fill(0);
        self.context.clear();
        log::trace!("Released {} of session {}", self.reservation.id(), self.owner);
    }
}
