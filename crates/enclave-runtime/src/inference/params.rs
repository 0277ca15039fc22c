use crate::error::InferenceError;
use crate::types::{ModelId, TokenId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sampling knobs forwarded verbatim to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// 0.0 is deterministic.
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(InferenceError::InvalidParams(
                "temperature must be >= 0".into(),
            ));
        }
        if self.top_p.is_nan() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(InferenceError::InvalidParams(
                "top_p must be in (0, 1]".into(),
            ));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty <= 0.0 {
            return Err(InferenceError::InvalidParams(
                "repetition_penalty must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// One generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub model_id: ModelId,
    pub tokens: Vec<TokenId>,
    pub max_new_tokens: usize,
    pub sampling: Option<SamplingConfig>,
    /// Overrides the session default when set.
    pub timeout: Option<Duration>,
}

impl InferenceParams {
    pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;

    pub fn new(model_id: impl Into<ModelId>, tokens: impl Into<Vec<TokenId>>) -> Self {
        Self {
            model_id: model_id.into(),
            tokens: tokens.into(),
            max_new_tokens: Self::DEFAULT_MAX_NEW_TOKENS,
            sampling: None,
            timeout: None,
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = Some(sampling);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.tokens.is_empty() {
            return Err(InferenceError::InvalidParams(
                "input token sequence must not be empty".into(),
            ));
        }
        if self.max_new_tokens == 0 {
            return Err(InferenceError::InvalidParams(
                "max_new_tokens must be > 0".into(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(InferenceError::InvalidParams("timeout must be > 0".into()));
        }
        if let Some(sampling) = &self.sampling {
            sampling.validate()?;
        }
        Ok(())
    }

    /// The deadline budget for this call given the session default.
    pub fn effective_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.timeout.or(default)
    }
}
