//! Storage abstraction for Raft persistent state.
//!
//! Raft requires certain state to be persisted to stable storage before
//! responding to RPCs: current term, vote, and log entries. Durable engines
//! plug in behind this trait; the crate ships the in-memory implementation.

use thiserror::Error;

use crate::core::log::Entry;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Storage not initialized
    #[error("storage not initialized")]
    NotInitialized,
}

/// Storage trait for Raft persistent state
///
/// Implementations must ensure durability before returning from the save
/// operations. All operations are synchronous to keep the core state
/// machine simple; the `Send` bound is required for use in async contexts.
pub trait Storage: Send {
    /// Load the current term from storage.
    /// Returns 0 if no term has been persisted (fresh start).
    fn load_term(&self) -> Result<u64, StorageError>;

    /// Save the current term to storage.
    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    /// Load the voted_for value from storage.
    /// Returns None if no vote has been cast in the current term.
    fn load_voted_for(&self) -> Result<Option<u64>, StorageError>;

    /// Save the voted_for value to storage.
    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError>;

    /// Load all log entries from storage.
    fn load_log(&self) -> Result<Vec<Entry>, StorageError>;

    /// Append entries after any existing entries.
    fn append_entries(&mut self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Remove all entries with `index >= from_index`.
    /// Used for conflict resolution in AppendEntries.
    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError>;
}
