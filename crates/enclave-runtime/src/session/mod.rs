//! Session lifecycle: the execution gate, the live-session table and the
//! blocking and async handles built on them.
mod blocking;
mod cooperative;
mod core;
mod gate;
mod manager;

#[cfg(test)]
mod tests;

pub use blocking::Session;
pub use cooperative::AsyncSession;
pub use gate::{ExecutionPermit, SessionState};

#[cfg(test)]
pub(crate) use gate::ExecutionGate;
pub(crate) use manager::SessionManager;
