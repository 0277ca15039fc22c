use crate::error::ModelError;
use crate::types::ModelId;
use serde::{Deserialize, Serialize};

/// Static description of a registered model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: ModelId,
    pub display_name: String,
    /// Maximum number of tokens (prompt plus generated) a call may hold.
    pub context_window: usize,
    pub vocab_size: usize,
}

impl ModelInfo {
    pub fn new(
        id: impl Into<ModelId>,
        display_name: impl Into<String>,
        context_window: usize,
        vocab_size: usize,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            context_window,
            vocab_size,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        if self.context_window == 0 {
            return Err(ModelError::InvalidInfo(format!(
                "model {} has a zero context window",
                self.id
            )));
        }
        if self.vocab_size == 0 {
            return Err(ModelError::InvalidInfo(format!(
                "model {} has an empty vocabulary",
                self.id
            )));
        }
        Ok(())
    }
}
