//! Storage abstraction for Raft persistent state.

pub mod memory;
pub mod traits;

pub use traits::{Storage, StorageError};
