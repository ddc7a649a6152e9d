//! Store adapters for the registry ports.

mod memory;

pub use memory::{MemoryState, MemoryStore};
