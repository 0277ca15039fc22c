use crate::inference::SamplingConfig;
use crate::types::TokenId;

/// What the backend produced for one decode step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Token(TokenId),
    EndOfSequence,
}

/// The view of a sandbox arena handed to a backend for one call.
///
/// `tokens` is the full context so far (prompt followed by everything generated).
/// `scratch` is private to the current inference and is zeroed once it ends.
pub struct DecodeContext<'a> {
    pub tokens: &'a [TokenId],
    pub scratch: &'a mut [u8],
    pub sampling: &'a SamplingConfig,
    /// Number of tokens generated so far in this call.
    pub generated: usize,
}

/// Opaque next-token capability of a loaded model.
///
/// Implementations must be safe to call from several sessions at once; any
/// per-call state belongs in [`DecodeContext::scratch`].
pub trait ModelBackend: Send + Sync + 'static {
    /// Called once with the prompt before the first `next_token`.
    fn prefill(&self, _ctx: &mut DecodeContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produce the next token given the context.
    fn next_token(&self, ctx: &mut DecodeContext<'_>) -> anyhow::Result<Step>;

    /// Release backend-held resources. Called once, when the model is unloaded.
    fn release(&self) {}
}
