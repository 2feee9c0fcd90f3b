//! Log entries and the append-only replicated log.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque client payload carried through the log.
///
/// The consensus core never interprets the contents; clients and tests rely
/// only on equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message(String);

impl Message {
    pub fn new(payload: impl Into<String>) -> Self {
        Message(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Message(payload.to_string())
    }
}

impl From<String> for Message {
    fn from(payload: String) -> Self {
        Message(payload)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Term when the entry was received by the leader
    pub term: u64,
    /// Index in the log (1-indexed)
    pub index: u64,
    /// Client payload stored in this entry
    pub message: Message,
}

/// Append-only, 1-indexed sequence of entries.
///
/// Owned exclusively by one server's [`RaftState`](crate::core::raft::RaftState).
/// Indices are contiguous starting at 1 and terms never decrease as the
/// index increases.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<Entry>,
}

impl RaftLog {
    pub fn new() -> Self {
        RaftLog { entries: Vec::new() }
    }

    /// Rebuild a log from previously persisted entries.
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        RaftLog { entries }
    }

    /// Append a new entry with `index = last_index() + 1`.
    pub fn append(&mut self, term: u64, message: Message) -> Entry {
        let entry = Entry {
            term,
            index: self.last_index() + 1,
            message,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Append an entry replicated from a leader. The caller is responsible
    /// for having resolved any conflict at this index first.
    pub fn push(&mut self, entry: Entry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Get the entry at a 1-based index.
    pub fn get(&self, index: u64) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, if present.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// Contiguous sub-sequence from `index` (inclusive) to the end.
    pub fn entries_from(&self, index: u64) -> &[Entry] {
        let start = index.saturating_sub(1) as usize;
        if start >= self.entries.len() {
            &[]
        } else {
            &self.entries[start..]
        }
    }

    /// Index of the last entry, or 0 for an empty log.
    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last entry, or 0 for an empty log.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Remove all entries with `index >= from_index`.
    pub fn truncate_from(&mut self, from_index: u64) {
        if from_index == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate((from_index - 1) as usize);
        }
    }

    /// First index of the run of same-term entries ending at `index`.
    ///
    /// Used to build the conflict hint returned on an AppendEntries
    /// mismatch: the leader can skip back over the whole conflicting term.
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_contiguous_indices() {
        let mut log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);

        let e1 = log.append(1, Message::new("a"));
        let e2 = log.append(1, Message::new("b"));
        let e3 = log.append(2, Message::new("c"));

        assert_eq!(e1.index, 1);
        assert_eq!(e2.index, 2);
        assert_eq!(e3.index, 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_get_and_term_at() {
        let mut log = RaftLog::new();
        log.append(1, Message::new("a"));
        log.append(3, Message::new("b"));

        assert_eq!(log.get(0), None);
        assert_eq!(log.get(1).unwrap().message, Message::new("a"));
        assert_eq!(log.term_at(2), Some(3));
        assert_eq!(log.term_at(3), None);
    }

    #[test]
    fn test_entries_from() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(1, Message::new(format!("m{}", i)));
        }

        let tail = log.entries_from(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].index, 3);
        assert_eq!(tail[2].index, 5);

        assert_eq!(log.entries_from(1).len(), 5);
        assert!(log.entries_from(6).is_empty());
        assert!(RaftLog::new().entries_from(1).is_empty());
    }

    #[test]
    fn test_truncate_from() {
        let mut log = RaftLog::new();
        for _ in 0..4 {
            log.append(1, Message::new("x"));
        }

        log.truncate_from(3);
        assert_eq!(log.last_index(), 2);

        // Truncating beyond the end keeps everything
        log.truncate_from(10);
        assert_eq!(log.last_index(), 2);

        log.truncate_from(1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_first_index_of_term() {
        let mut log = RaftLog::new();
        log.append(1, Message::new("a")); // 1
        log.append(2, Message::new("b")); // 2
        log.append(2, Message::new("c")); // 3
        log.append(2, Message::new("d")); // 4
        log.append(3, Message::new("e")); // 5

        assert_eq!(log.first_index_of_term(1), 1);
        assert_eq!(log.first_index_of_term(4), 2);
        assert_eq!(log.first_index_of_term(3), 2);
        assert_eq!(log.first_index_of_term(5), 5);
    }
}
