//! Built-in store backends.

mod memory;

pub use memory::MemoryStore;
