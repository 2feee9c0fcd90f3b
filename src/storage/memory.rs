//! In-memory storage implementation.
//!
//! Fast, no side effects, no persistence across restarts.

use super::{Storage, StorageError};
use crate::core::log::Entry;

/// In-memory storage implementation
///
/// Stores all state in memory. Ideal for tests and for clusters whose
/// durability story lives elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    term: u64,
    voted_for: Option<u64>,
    log: Vec<Entry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        Ok(self.term)
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.term = term;
        Ok(())
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.voted_for)
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<Entry>, StorageError> {
        Ok(self.log.clone())
    }

    fn append_entries(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        // Entries are 1-indexed, so the entry at index N sits at position N-1
        if from_index > 0 {
            let truncate_pos = (from_index - 1) as usize;
            if truncate_pos < self.log.len() {
                self.log.truncate(truncate_pos);
            }
        } else {
            self.log.clear();
        }
        Ok(())
    }
}
