use crate::config::SandboxConfig;
use crate::error::CoreError;
use crate::types::{ArenaId, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRecord {
    pub owner: SessionId,
    pub bytes: usize,
}

struct BudgetInner {
    max_per_arena: usize,
    max_total: usize,
    in_use: AtomicUsize,
    next_id: AtomicU64,
    ledger: Mutex<HashMap<ArenaId, ArenaRecord>>,
}

/// Runtime-wide accounting of sandbox memory.
///
/// Every live arena is recorded in a ledger under an [`ArenaId`] handle
/// together with the session that owns it.
#[derive(Clone)]
pub struct MemoryBudget {
    inner: Arc<BudgetInner>,
}

impl MemoryBudget {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                max_per_arena: config.max_arena_bytes,
                max_total: config.max_total_arena_bytes,
                in_use: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                ledger: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Reserve `bytes` for an arena owned by `owner`.
    pub fn try_reserve(&self, owner: SessionId, bytes: usize) -> Result<Reservation, CoreError> {
        let inner = &self.inner;
        if bytes > inner.max_per_arena {
            return Err(CoreError::ResourceExhausted(format!(
                "arena of {bytes} bytes exceeds the per-arena limit of {} bytes",
                inner.max_per_arena
            )));
        }

        let previous = inner.in_use.fetch_add(bytes, Ordering::SeqCst);
        if previous + bytes > inner.max_total {
            inner.in_use.fetch_sub(bytes, Ordering::SeqCst);
            return Err(CoreError::ResourceExhausted(format!(
                "sandbox memory exhausted: {} of {} bytes in use, {bytes} requested",
                previous, inner.max_total
            )));
        }

        let id = ArenaId::new(inner.next_id.fetch_add(1, Ordering::Relaxed));
        inner.ledger.lock().insert(id, ArenaRecord { owner, bytes });
        Ok(Reservation {
            id,
            bytes,
            inner: self.inner.clone(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::SeqCst)
    }

    pub fn live_arenas(&self) -> usize {
        self.inner.ledger.lock().len()
    }

    pub fn live_arenas_for(&self, owner: SessionId) -> usize {
        self.inner
            .ledger
            .lock()
            .values()
            .filter(|record| record.owner == owner)
            .count()
    }

    pub fn record(&self, id: ArenaId) -> Option<ArenaRecord> {
        self.inner.ledger.lock().get(&id).copied()
    }
}

/// RAII claim on sandbox memory; released on drop.
pub struct Reservation {
    id: ArenaId,
    bytes: usize,
    inner: Arc<BudgetInner>,
}

impl Reservation {
    pub fn id(&self) -> ArenaId {
        self.id
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner.ledger.lock().remove(&self.id);
        self.inner.in_use.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}
