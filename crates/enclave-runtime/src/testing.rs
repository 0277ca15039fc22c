//! Deterministic model backends for tests.
use crate::config::RuntimeConfig;
use crate::model::{DecodeContext, ModelBackend, ModelInfo, Step};
use crate::runtime::Runtime;
use crate::types::TokenId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// The secret accepted by [`runtime_with_model`].
pub const TEST_CREDENTIAL: &str = "tok-A";

/// A runtime authenticated with [`TEST_CREDENTIAL`] and `backend` registered
/// as model `1` (context window 2048, vocabulary 32 000).
pub fn runtime_with_model(
    config: RuntimeConfig,
    backend: ScriptedBackend,
) -> (Runtime, Arc<ScriptedBackend>) {
    let mut config = config;
    if config.auth.secrets.is_empty() {
        config.auth = RuntimeConfig::with_secret(TEST_CREDENTIAL).auth;
    }
    let runtime = match Runtime::new(TEST_CREDENTIAL, config) {
        Ok(runtime) => runtime,
        Err(e) => panic!("test runtime failed to start: {e}"),
    };
    let backend = Arc::new(backend);
    if let Err(e) = runtime.registry().register(
        1,
        backend.clone(),
        ModelInfo::new(1, "scripted", 2048, 32_000),
    ) {
        panic!("test model failed to register: {e}");
    }
    (runtime, backend)
}

#[derive(Debug, Clone)]
enum Script {
    /// Each token is the previous context token plus one.
    Counting,
    /// Emit these tokens in order, then end the sequence.
    Fixed(Vec<TokenId>),
}

/// A [`ModelBackend`] that follows a script.
///
/// It also stamps the number of generated tokens into the arena scratch and
/// checks the stamp on the next step, so two calls sharing scratch memory fail
/// loudly.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Script,
    eos_after: Option<usize>,
    delay: Option<Duration>,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    prefills: AtomicUsize,
    steps: AtomicUsize,
    released: AtomicBool,
}

impl ScriptedBackend {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            eos_after: None,
            delay: None,
            fail_at: None,
            panic_at: None,
            prefills: AtomicUsize::new(0),
            steps: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn counting() -> Self {
        Self::with_script(Script::Counting)
    }

    pub fn fixed(tokens: impl Into<Vec<TokenId>>) -> Self {
        Self::with_script(Script::Fixed(tokens.into()))
    }

    /// End the sequence once `n` tokens have been generated.
    pub fn with_eos_after(mut self, n: usize) -> Self {
        self.eos_after = Some(n);
        self
    }

    /// Sleep this long in every `next_token` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Return an error when asked for the token at generated index `n`.
    pub fn failing_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// Panic when asked for the token at generated index `n`.
    pub fn panicking_at(mut self, n: usize) -> Self {
        self.panic_at = Some(n);
        self
    }

    pub fn prefill_count(&self) -> usize {
        self.prefills.load(Ordering::SeqCst)
    }

    /// Total `next_token` calls across every session.
    pub fn step_count(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// What an uninterrupted call with this prompt would produce.
    pub fn expected(&self, prompt: &[TokenId], max_new_tokens: usize) -> Vec<TokenId> {
        let limit = self.eos_after.map_or(max_new_tokens, |n| n.min(max_new_tokens));
        match &self.script {
            Script::Counting => {
                let last = prompt.last().copied().unwrap_or(0);
                (1..=limit as TokenId).map(|i| last.wrapping_add(i)).collect()
            }
            Script::Fixed(tokens) => tokens.iter().copied().take(limit).collect(),
        }
    }
}

fn stamp(scratch: &mut [u8], value: usize) {
    if let Some(slot) = scratch.get_mut(..8) {
        slot.copy_from_slice(&(value as u64).to_le_bytes());
    }
}

fn read_stamp(scratch: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = scratch.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

impl ModelBackend for ScriptedBackend {
    fn prefill(&self, ctx: &mut DecodeContext<'_>) -> anyhow::Result<()> {
        self.prefills.fetch_add(1, Ordering::SeqCst);
        stamp(ctx.scratch, 0);
        Ok(())
    }

    fn next_token(&self, ctx: &mut DecodeContext<'_>) -> anyhow::Result<Step> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let index = ctx.generated;
        if self.panic_at == Some(index) {
            panic!("scripted panic at token {index}");
        }
        if self.fail_at == Some(index) {
            anyhow::bail!("scripted failure at token {index}");
        }
        if let Some(seen) = read_stamp(ctx.scratch) {
            anyhow::ensure!(
                seen == index as u64,
                "scratch stamp {seen} does not match generated count {index}"
            );
        }
        if self.eos_after.is_some_and(|n| index >= n) {
            return Ok(Step::EndOfSequence);
        }

        let token = match &self.script {
            Script::Counting => ctx.tokens.last().copied().unwrap_or(0).wrapping_add(1),
            Script::Fixed(tokens) => match tokens.get(index) {
                Some(token) => *token,
                None => return Ok(Step::EndOfSequence),
            },
        };
        stamp(ctx.scratch, index + 1);
        Ok(Step::Token(token))
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
