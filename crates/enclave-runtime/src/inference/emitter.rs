use super::cancel::CancelToken;
use crate::error::CoreError;
use parking_lot::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EmitControl {
    Continue,
    Stop,
}

/// The sending side of a generation's output.
pub trait Emitter<T>: Send + Sync {
    fn emit(&self, item: T) -> Result<EmitControl, CoreError>;

    /// Called once when the producer has nothing more to send.
    fn end(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// An emitter that collects all emitted items into a vector.
pub struct CollectEmitter<T>(Mutex<Vec<T>>);

impl<T> CollectEmitter<T> {
    pub fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0.into_inner()
    }
}

impl<T> Default for CollectEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Emitter<T> for CollectEmitter<T> {
    fn emit(&self, item: T) -> Result<EmitControl, CoreError> {
        self.0.lock().push(item);
        Ok(EmitControl::Continue)
    }
}

/// Emitter backed by a bounded crossbeam channel of results.
///
/// A full channel blocks the producer until the consumer catches up or the
/// generation is cancelled, whichever comes first. A disconnected consumer
/// stops the producer.
pub struct ChannelEmitter<T> {
    tx: crossbeam::channel::Sender<Result<T, CoreError>>,
    cancel: CancelToken,
}

impl<T: Send> ChannelEmitter<T> {
    pub fn new(tx: crossbeam::channel::Sender<Result<T, CoreError>>, cancel: CancelToken) -> Self {
        Self { tx, cancel }
    }

    /// Forward a terminal error to the consumer.
    pub fn fail(&self, error: CoreError) -> EmitControl {
        self.send(Err(error))
    }

    fn send(&self, item: Result<T, CoreError>) -> EmitControl {
        match self.tx.try_send(item) {
            Ok(()) => EmitControl::Continue,
            Err(crossbeam::channel::TrySendError::Disconnected(_)) => EmitControl::Stop,
            Err(crossbeam::channel::TrySendError::Full(item)) => {
                crossbeam::select! {
                    send(self.tx, item) -> res => match res {
                        Ok(()) => EmitControl::Continue,
                        Err(_) => EmitControl::Stop,
                    },
                    recv(self.cancel.signal()) -> _ => EmitControl::Stop,
                }
            }
        }
    }
}

impl<T: Send> Emitter<T> for ChannelEmitter<T> {
    fn emit(&self, item: T) -> Result<EmitControl, CoreError> {
        Ok(self.send(Ok(item)))
    }
}
