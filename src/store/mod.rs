mod memory;

pub use memory::{MemoryStore, StoreState};
