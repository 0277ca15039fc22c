use crate::types::TokenId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a generation ended.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `max_new_tokens` reached or the context window is full.
    LengthLimit,
    /// The backend signalled end-of-sequence.
    EndOfSequence,
    Cancelled,
    TimedOut,
}

impl StopReason {
    /// Whether the generation ran to one of its natural ends.
    pub fn is_complete(self) -> bool {
        matches!(self, StopReason::LengthLimit | StopReason::EndOfSequence)
    }
}

/// Output of a batch inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub tokens: Vec<TokenId>,
    pub stop_reason: StopReason,
    pub token_count: usize,
    pub elapsed: Duration,
}

/// One element of a streamed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub token: TokenId,
    /// 0-based position among generated tokens.
    pub index: usize,
    pub is_final: bool,
}
