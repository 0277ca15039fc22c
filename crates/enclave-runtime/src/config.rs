use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use std::{fs, io};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// A configured credential secret. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(**redacted**)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Credentials accepted by `Runtime::new`. Any one of them authenticates.
    pub secrets: Vec<Secret>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Scratch bytes reserved per context-window slot.
    pub bytes_per_token: usize,
    /// Upper bound on a single arena.
    pub max_arena_bytes: usize,
    /// Upper bound on all live arenas together.
    pub max_total_arena_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            bytes_per_token: 16,
            max_arena_bytes: 64 * 1024 * 1024,
            max_total_arena_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Process-wide runtime configuration.
///
/// Every field has a default so partial JSON documents are accepted:
///
/// ```ignore
/// let config = RuntimeConfig::from_json_str(r#"{ "auth": { "secrets": ["tok-A"] }, "max_sessions": 8 }"#)?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub auth: AuthConfig,
    pub max_sessions: usize,
    /// Default per-call deadline. `None` disables the deadline.
    pub default_timeout_ms: Option<u64>,
    /// Sessions idle for longer than this are reaped. `None` keeps them forever.
    pub session_idle_timeout_ms: Option<u64>,
    /// Chunks buffered between a stream producer and its consumer.
    pub stream_buffer: usize,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auth: AuthConfig::default(),
            max_sessions: 64,
            default_timeout_ms: Some(30_000),
            session_idle_timeout_ms: None,
            stream_buffer: 4,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration accepting a single secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            auth: AuthConfig {
                secrets: vec![Secret::new(secret)],
            },
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be > 0".into()));
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::Invalid("stream_buffer must be > 0".into()));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be > 0 when set".into(),
            ));
        }
        let sandbox = &self.sandbox;
        if sandbox.bytes_per_token == 0 {
            return Err(ConfigError::Invalid("sandbox.bytes_per_token must be > 0".into()));
        }
        if sandbox.max_arena_bytes > sandbox.max_total_arena_bytes {
            return Err(ConfigError::Invalid(
                "sandbox.max_arena_bytes cannot exceed sandbox.max_total_arena_bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_ms.map(Duration::from_millis)
    }
}
