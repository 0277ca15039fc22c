use crate::error::{CoreError, InferenceError};
use crate::inference::CancelToken;
use crate::types::SessionId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observable lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Active,
    InferenceRunning,
    Cancelling,
    Destroyed,
}

enum Slot {
    Idle,
    Running(CancelToken),
    Cancelling(CancelToken),
    Destroyed,
}

struct GateInner {
    slot: Slot,
    closing: bool,
    last_active: Instant,
}

/// Serializes the calls of one session.
///
/// At most one [`ExecutionPermit`] exists at a time. A second caller fails
/// fast with [`InferenceError::SessionBusy`] instead of queueing. Closing the
/// gate cancels the holder and waits until its permit is dropped.
pub(crate) struct ExecutionGate {
    session: SessionId,
    inner: Mutex<GateInner>,
    idle: Condvar,
    released: tokio::sync::Notify,
}

impl ExecutionGate {
    pub(crate) fn new(session: SessionId) -> Arc<Self> {
        Arc::new(Self {
            session,
            inner: Mutex::new(GateInner {
                slot: Slot::Idle,
                closing: false,
                last_active: Instant::now(),
            }),
            idle: Condvar::new(),
            released: tokio::sync::Notify::new(),
        })
    }

    /// Claim the gate, blocking only while a cancelled call winds down.
    pub(crate) fn begin(self: &Arc<Self>) -> Result<ExecutionPermit, CoreError> {
        let mut inner = self.inner.lock();
        loop {
            match self.try_claim(&mut inner)? {
                Some(permit) => return Ok(permit),
                None => self.idle.wait(&mut inner),
            }
        }
    }

    /// Async twin of [`ExecutionGate::begin`].
    pub(crate) async fn begin_async(self: &Arc<Self>) -> Result<ExecutionPermit, CoreError> {
        loop {
            let released = self.released.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(permit) = self.try_claim(&mut inner)? {
                    return Ok(permit);
                }
            }
            released.await;
        }
    }

    /// `Ok(None)` means a cancelled call still holds the gate.
    fn try_claim(
        self: &Arc<Self>,
        inner: &mut GateInner,
    ) -> Result<Option<ExecutionPermit>, CoreError> {
        if inner.closing {
            return Err(CoreError::SessionClosed(self.session));
        }
        match inner.slot {
            Slot::Idle => {
                let cancel = CancelToken::new();
                inner.slot = Slot::Running(cancel.clone());
                inner.last_active = Instant::now();
                Ok(Some(ExecutionPermit {
                    gate: Arc::clone(self),
                    cancel,
                }))
            }
            Slot::Running(_) => Err(InferenceError::SessionBusy(self.session).into()),
            Slot::Cancelling(_) => Ok(None),
            Slot::Destroyed => Err(CoreError::SessionClosed(self.session)),
        }
    }

    /// Move a running call to `Cancelling`. Returns whether there was one.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        Self::cancel_locked(&mut inner)
    }

    fn cancel_locked(inner: &mut GateInner) -> bool {
        let slot = std::mem::replace(&mut inner.slot, Slot::Idle);
        let (slot, cancelled) = match slot {
            Slot::Running(cancel) => {
                cancel.cancel();
                (Slot::Cancelling(cancel), true)
            }
            other => (other, false),
        };
        inner.slot = slot;
        cancelled
    }

    /// Mark closing and cancel the holder. Returns `true` while a permit is out.
    fn start_close(inner: &mut GateInner) -> bool {
        inner.closing = true;
        Self::cancel_locked(inner);
        match inner.slot {
            Slot::Running(_) | Slot::Cancelling(_) => true,
            Slot::Idle | Slot::Destroyed => {
                inner.slot = Slot::Destroyed;
                false
            }
        }
    }

    /// Close the gate and block until the in-flight call has released.
    pub(crate) fn close_blocking(&self) {
        let mut inner = self.inner.lock();
        while Self::start_close(&mut inner) {
            self.idle.wait(&mut inner);
        }
    }

    /// Close the gate and wait, without blocking the executor, for release.
    pub(crate) async fn close(&self) {
        loop {
            let released = self.released.notified();
            let busy = Self::start_close(&mut self.inner.lock());
            if !busy {
                return;
            }
            released.await;
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        match self.inner.lock().slot {
            Slot::Idle => SessionState::Active,
            Slot::Running(_) => SessionState::InferenceRunning,
            Slot::Cancelling(_) => SessionState::Cancelling,
            Slot::Destroyed => SessionState::Destroyed,
        }
    }

    /// Time since the last call started or ended. Zero while a call runs.
    pub(crate) fn idle_for(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.slot {
            Slot::Idle => inner.last_active.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn release(&self) {
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.slot, Slot::Destroyed) {
                inner.slot = Slot::Idle;
            }
            inner.last_active = Instant::now();
        }
        self.idle.notify_all();
        self.released.notify_waiters();
    }
}

/// Proof that the holder owns the session's single execution slot.
///
/// Dropping the permit returns the session to `Active` and wakes anyone
/// waiting to close it.
pub struct ExecutionPermit {
    gate: Arc<ExecutionGate>,
    cancel: CancelToken,
}

impl ExecutionPermit {
    pub fn session(&self) -> SessionId {
        self.gate.session
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for ExecutionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPermit")
            .field("session", &self.gate.session)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn second_claim_fails_fast_with_busy() {
        let gate = ExecutionGate::new(SessionId::new());
        let permit = gate.begin().unwrap();
        assert_eq!(gate.state(), SessionState::InferenceRunning);

        let err = gate.begin().unwrap_err();
        assert!(err.is_busy());

        drop(permit);
        assert_eq!(gate.state(), SessionState::Active);
        assert!(gate.begin().is_ok());
    }

    #[test]
    fn cancel_flips_the_permit_token() {
        let gate = ExecutionGate::new(SessionId::new());
        assert!(!gate.cancel());

        let permit = gate.begin().unwrap();
        assert!(gate.cancel());
        assert!(permit.cancel_token().is_cancelled());
        assert_eq!(gate.state(), SessionState::Cancelling);
        assert!(!gate.cancel());
    }

    #[test]
    fn claim_waits_for_a_cancelled_call_to_release() {
        let gate = ExecutionGate::new(SessionId::new());
        let permit = gate.begin().unwrap();
        gate.cancel();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(permit);
        });
        let next = gate.begin();
        releaser.join().unwrap();
        assert!(next.is_ok());
    }

    #[test]
    fn close_waits_for_release_and_is_idempotent() {
        let gate = ExecutionGate::new(SessionId::new());
        let permit = gate.begin().unwrap();
        let token = permit.cancel_token().clone();

        let releaser = std::thread::spawn(move || {
            while !permit.cancel_token().is_cancelled() {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(10));
            drop(permit);
        });
        gate.close_blocking();
        assert!(token.is_cancelled());
        assert_eq!(gate.state(), SessionState::Destroyed);
        releaser.join().unwrap();

        gate.close_blocking();
        let err = gate.begin().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancellation);
    }

    #[tokio::test]
    async fn async_close_waits_for_release() {
        let gate = ExecutionGate::new(SessionId::new());
        let permit = gate.begin_async().await.unwrap();

        let task = tokio::spawn(async move {
            permit.cancel_token().cancelled().await;
            drop(permit);
        });
        gate.close().await;
        assert_eq!(gate.state(), SessionState::Destroyed);
        task.await.unwrap();
    }
}
