//! Sandboxed, offline inference runtime kernel.
//!
//! A [`Runtime`] is authenticated once, holds a [`ModelRegistry`] of opaque
//! [`ModelBackend`]s and hands out [`Session`]s (blocking) or
//! [`AsyncSession`]s (tokio). Each session runs at most one inference at a
//! time inside its own sandbox arena, returning either an [`InferenceResult`]
//! or a lazily produced [`TokenStream`] / [`AsyncTokenStream`].
pub mod auth;
pub mod config;
pub mod error;
pub mod inference;
pub mod logging;
pub mod model;
pub mod runtime;
pub mod sandbox;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::{AuthValidator, CredentialHash};
pub use config::{ConfigError, RuntimeConfig, SandboxConfig};
pub use error::{AuthError, CoreError, ErrorKind, InferenceError, ModelError, Result};
pub use inference::{
    AsyncTokenStream, CancelToken, InferenceParams, InferenceResult, SamplingConfig, StopReason,
    StreamChunk, StreamEnd, TokenStream,
};
pub use model::{DecodeContext, ModelBackend, ModelInfo, ModelRegistry, Step};
pub use runtime::{Runtime, RuntimeStats};
pub use session::{AsyncSession, Session, SessionState};
pub use types::{ModelId, SessionId, TokenId};
