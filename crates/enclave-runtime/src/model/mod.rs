//! Model registry and the opaque backend capability it hands out.
mod backend;
mod info;
mod registry;

pub use backend::{DecodeContext, ModelBackend, Step};
pub use info::ModelInfo;
pub use registry::{ModelLease, ModelRegistry};
