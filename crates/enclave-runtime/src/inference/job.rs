use super::cancel::CancelToken;
use crate::error::{CoreError, InferenceError};
use crate::types::SessionId;
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Handle on a producer thread running one generation.
pub(crate) struct JobHandle {
    session: SessionId,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub(crate) fn spawn<F>(
        session: SessionId,
        cancel: CancelToken,
        job: F,
    ) -> Result<Self, CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        let join = spawn_thread(session, job)?;
        Ok(Self {
            session,
            cancel,
            join: Some(join),
        })
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the producer to exit. Later calls return `Ok(())` immediately.
    pub(crate) fn join(&mut self) -> Result<(), InferenceError> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|e| InferenceError::ProducerPanicked(panic_message(e.as_ref()))),
            None => Ok(()),
        }
    }
}

/// Run `job` on a detached producer thread.
///
/// The outcome, or the panic payload, arrives on the returned receiver. The
/// thread owns everything `job` captures, so releasing it never depends on
/// the receiver being polled.
pub(crate) fn spawn_detached<T, F>(
    session: SessionId,
    job: F,
) -> Result<oneshot::Receiver<std::thread::Result<T>>, CoreError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    spawn_thread(session, move || {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(job));
        if tx.send(outcome).is_err() {
            log::trace!("Nobody is waiting for the producer of session {session}");
        }
    })?;
    Ok(rx)
}

fn spawn_thread<F>(session: SessionId, job: F) -> Result<JoinHandle<()>, CoreError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("enclave-gen-{session}"))
        .spawn(job)
        .map_err(|e| {
            CoreError::ResourceExhausted(format!("failed to spawn producer thread: {e}"))
        })
}

/// Map the outcome of a [`spawn_detached`] job onto the crate error type.
pub(crate) fn settle_detached<T>(
    outcome: std::result::Result<std::thread::Result<T>, oneshot::error::RecvError>,
) -> Result<T, CoreError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => {
            Err(InferenceError::ProducerPanicked(panic_message(payload.as_ref())).into())
        }
        Err(_) => Err(CoreError::Internal("producer thread exited without a result".into())),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "producer panicked".to_string()
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel();
        if let Err(e) = self.join() {
            log::warn!("Producer for session {} ended abnormally: {e}", self.session);
        }
    }
}
