use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A token identifier in a model's vocabulary.
pub type TokenId = u32;

/// Identifier of a registered model.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Deref, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ModelId(pub u64);

/// Identifier of a live session. Fresh for every session ever created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Deref, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Handle of a live sandbox arena in the memory budget ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Deref)]
#[display("arena#{_0}")]
pub struct ArenaId(u64);

impl ArenaId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}
