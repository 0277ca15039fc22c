//! Inference execution pipeline.
//!
//! A call is turned into a [`Generation`] by [`InferenceEngine::start`] and then
//! consumed in one of three styles:
//! * Batch: [`InferenceEngine::run`] drives it to the end on the calling thread and collects the tokens;
//!   [`InferenceEngine::run_async`] does so on a producer thread and awaits the result.
//! * Streaming: a [`TokenStream`] runs it on a producer thread and hands out [`StreamChunk`]s.
//! * Async streaming: an [`AsyncTokenStream`] does the same and is consumed from a tokio task.
//!
//! Every style observes the same [`CancelToken`] and [`Deadline`] at each token boundary.
mod async_stream;
mod cancel;
mod core;
mod emitter;
mod job;
mod params;
mod result;
mod stream;


pub use async_stream::AsyncTokenStream;
pub use cancel::{CancelToken, Deadline};
pub use self::core::{Generation, InferenceEngine, Progress};
pub use emitter::{ChannelEmitter, CollectEmitter, EmitControl, Emitter};
pub use params::{InferenceParams, SamplingConfig};
pub use result::{InferenceResult, StopReason, StreamChunk};
pub use stream::{StreamEnd, TokenStream};
