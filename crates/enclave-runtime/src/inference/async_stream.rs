use super::cancel::{CancelToken, Deadline};
use super::core::{Generation, Progress};
use super::job;
use super::result::{StopReason, StreamChunk};
use super::stream::StreamEnd;
use crate::error::{CoreError, InferenceError, Result};
use crate::types::SessionId;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

type Item = std::result::Result<StreamChunk, CoreError>;

/// Async twin of [`TokenStream`](super::TokenStream).
///
/// Chunks are produced on a dedicated thread, so a slow backend never holds
/// up an executor worker, and consumed from a tokio task. Dropping the stream
/// cancels the producer, which then releases the session at its next
/// checkpoint without needing the executor.
pub struct AsyncTokenStream {
    session: SessionId,
    rx: mpsc::Receiver<Item>,
    cancel: CancelToken,
    deadline: Option<Deadline>,
    done: Option<oneshot::Receiver<std::thread::Result<()>>>,
    end: Option<StreamEnd>,
}

/// The producer side, living on the generation thread.
struct Producer {
    tx: mpsc::Sender<Item>,
    cancel: CancelToken,
    runtime: Handle,
}

impl Producer {
    /// Hand `item` to the consumer, waiting while the buffer is full.
    /// Returns `false` once the consumer is gone or the call is cancelled.
    fn send(&self, item: Item) -> bool {
        let item = match self.tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(item)) => item,
        };
        self.runtime.block_on(async {
            tokio::select! {
                sent = self.tx.send(item) => sent.is_ok(),
                _ = self.cancel.cancelled() => false,
            }
        })
    }

    fn run(self, mut generation: Generation) {
        loop {
            match generation.advance() {
                Ok(Progress::Chunk(chunk)) => {
                    if !self.send(Ok(chunk)) {
                        generation.cancel();
                    }
                }
                Ok(Progress::Done(StopReason::TimedOut)) => {
                    let budget = generation.deadline().map(|d| d.budget()).unwrap_or_default();
                    drop(generation);
                    self.send(Err(CoreError::Timeout(budget)));
                    return;
                }
                Ok(Progress::Done(_)) => return,
                Err(e) => {
                    self.send(Err(e));
                    return;
                }
            }
        }
    }
}

impl AsyncTokenStream {
    /// Start the producer thread. Must be called from within a tokio runtime.
    pub(crate) fn spawn(generation: Generation, buffer: usize) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            CoreError::Internal(format!("async streams need a tokio runtime: {e}"))
        })?;
        let session = generation.session();
        let cancel = generation.cancel_token().clone();
        let deadline = generation.deadline();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let producer = Producer {
            tx,
            cancel: cancel.clone(),
            runtime,
        };
        let done = job::spawn_detached(session, move || producer.run(generation))?;
        Ok(Self {
            session,
            rx,
            cancel,
            deadline,
            done: Some(done),
            end: None,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn end(&self) -> Option<StreamEnd> {
        self.end
    }

    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The next chunk, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Item> {
        if self.end.is_some() {
            return None;
        }
        if self.cancel.is_cancelled() {
            return self.terminate_cancelled().await;
        }

        let received = match self.deadline {
            Some(deadline) => {
                let expiry = tokio::time::Instant::from_std(deadline.instant());
                tokio::select! {
                    item = self.rx.recv() => Received::Item(item),
                    _ = self.cancel.cancelled() => Received::Item(None),
                    _ = tokio::time::sleep_until(expiry) => Received::Expired,
                }
            }
            None => tokio::select! {
                item = self.rx.recv() => Received::Item(item),
                _ = self.cancel.cancelled() => Received::Item(None),
            },
        };

        match received {
            Received::Item(Some(Ok(chunk))) => {
                if self.cancel.is_cancelled() {
                    return self.terminate_cancelled().await;
                }
                if chunk.is_final {
                    if let Some(e) = self.finish(StreamEnd::Completed).await {
                        return Some(Err(e));
                    }
                }
                Some(Ok(chunk))
            }
            Received::Item(Some(Err(e))) => {
                let panicked = self.finish(StreamEnd::Failed).await;
                Some(Err(panicked.unwrap_or(e)))
            }
            Received::Expired => {
                self.cancel();
                let budget = self.deadline.map(|d| d.budget()).unwrap_or_default();
                let panicked = self.finish(StreamEnd::Failed).await;
                Some(Err(panicked.unwrap_or(CoreError::Timeout(budget))))
            }
            Received::Item(None) => {
                if self.cancel.is_cancelled() {
                    self.terminate_cancelled().await
                } else {
                    self.finish(StreamEnd::Failed)
                        .await
                        .or_else(|| {
                            Some(CoreError::Internal(
                                "stream producer exited without a final chunk".into(),
                            ))
                        })
                        .map(Err)
                }
            }
        }
    }

    /// Collect every remaining chunk. See [`TokenStream::drain`](super::TokenStream::drain).
    pub async fn drain(&mut self) -> Result<Vec<StreamChunk>> {
        if self.is_terminated() {
            return Err(InferenceError::StreamConsumed.into());
        }
        let mut chunks = Vec::new();
        while let Some(item) = self.next().await {
            chunks.push(item?);
        }
        Ok(chunks)
    }

    /// Cancel the producer and wait until it has released the session.
    pub async fn abandon(mut self) {
        self.cancel();
        self.finish(StreamEnd::Cancelled).await;
    }

    async fn terminate_cancelled(&mut self) -> Option<Item> {
        self.cancel();
        self.finish(StreamEnd::Cancelled).await.map(Err)
    }

    async fn finish(&mut self, end: StreamEnd) -> Option<CoreError> {
        self.end = Some(end);
        self.rx.close();
        let done = self.done.take()?;
        job::settle_detached(done.await).err()
    }
}

enum Received {
    Item(Option<Item>),
    Expired,
}

impl Drop for AsyncTokenStream {
    fn drop(&mut self) {
        if self.end.is_none() {
            self.cancel();
        }
    }
}

impl std::fmt::Debug for AsyncTokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTokenStream")
            .field("session", &self.session)
            .field("end", &self.end)
            .finish()
    }
}
