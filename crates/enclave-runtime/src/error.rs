use crate::config::ConfigError;
use crate::types::{ModelId, SessionId};
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// The fixed error taxonomy exposed at the kernel boundary.
///
/// Bindings are expected to map each kind to a distinct failure type rather than
/// collapsing them. Every kind is a specialisation of [`ErrorKind::Core`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Model,
    Inference,
    Timeout,
    Cancellation,
    Core,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credential")]
    InvalidCredential,
    #[error("Credential cannot be empty")]
    EmptyCredential,
    #[error("No credential secret is configured")]
    NoSecretConfigured,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model not found: {0}")]
    UnknownModel(ModelId),
    #[error("Model already registered: {0}")]
    AlreadyRegistered(ModelId),
    #[error("Model {id} has {in_flight} inference(s) in flight")]
    InUse { id: ModelId, in_flight: usize },
    #[error("Invalid model info: {0}")]
    InvalidInfo(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Invalid inference parameters: {0}")]
    InvalidParams(String),
    #[error("Session {0} already has an inference in flight")]
    SessionBusy(SessionId),
    #[error("Context length exceeded: max {max}, got {got}")]
    ContextExceeded { max: usize, got: usize },
    #[error("Model backend execution failed: {0}")]
    Backend(anyhow::Error),
    #[error("Stream has already been consumed")]
    StreamConsumed,
    #[error("Inference producer panicked: {0}")]
    ProducerPanicked(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Authentication(#[from] AuthError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("Inference cancelled")]
    Cancelled,
    #[error("Session {0} is closed")]
    SessionClosed(SessionId),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Runtime has been shut down")]
    RuntimeShutDown,
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Authentication(_) => ErrorKind::Authentication,
            CoreError::Model(_) => ErrorKind::Model,
            CoreError::Inference(_) => ErrorKind::Inference,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Cancelled | CoreError::SessionClosed(_) => ErrorKind::Cancellation,
            CoreError::ResourceExhausted(_)
            | CoreError::RuntimeShutDown
            | CoreError::Config(_)
            | CoreError::Internal(_) => ErrorKind::Core,
        }
    }

    /// Whether retrying the same call (possibly after waiting or adjusting the
    /// request) can succeed without a new runtime.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Authentication(_)
            | CoreError::SessionClosed(_)
            | CoreError::RuntimeShutDown
            | CoreError::Config(_)
            | CoreError::Internal(_) => false,
            CoreError::Inference(InferenceError::StreamConsumed) => false,
            _ => true,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, CoreError::Inference(InferenceError::SessionBusy(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CoreError::from(AuthError::InvalidCredential), ErrorKind::Authentication)]
    #[case(CoreError::from(ModelError::UnknownModel(ModelId(99))), ErrorKind::Model)]
    #[case(CoreError::from(InferenceError::StreamConsumed), ErrorKind::Inference)]
    #[case(CoreError::Timeout(Duration::from_millis(1)), ErrorKind::Timeout)]
    #[case(CoreError::Cancelled, ErrorKind::Cancellation)]
    #[case(CoreError::ResourceExhausted("sessions".into()), ErrorKind::Core)]
    fn every_variant_maps_to_its_kind(#[case] error: CoreError, #[case] kind: ErrorKind) {
        assert_eq!(error.kind(), kind);
    }

    #[test]
    fn kind_names_are_snake_case() {
        assert_eq!(ErrorKind::Cancellation.to_string(), "cancellation");
        assert_eq!("timeout".parse::<ErrorKind>().unwrap(), ErrorKind::Timeout);
    }

    #[test]
    fn busy_is_retryable_but_auth_is_not() {
        let busy = CoreError::from(InferenceError::SessionBusy(SessionId::new()));
        assert!(busy.is_busy());
        assert!(busy.is_retryable());
        assert!(!CoreError::from(AuthError::InvalidCredential).is_retryable());
    }
}
