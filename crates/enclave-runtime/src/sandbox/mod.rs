//! Per-inference isolation: memory accounting and scratch arenas.
mod arena;
mod budget;

pub use arena::ScratchArena;
pub use budget::{ArenaRecord, MemoryBudget, Reservation};
