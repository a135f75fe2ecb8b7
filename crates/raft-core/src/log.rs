//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via state.rs
//! what: LogEntry struct, sentinel-anchored Log, consistency checks, conflict merge

use serde::{Deserialize, Serialize, Serializer};

use crate::error::RaftError;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, command: Vec<u8>) -> Self {
        Self { term, command }
    }

    fn sentinel() -> Self {
        Self::new(0, Vec::new())
    }
}

/// The replicated log, 1-indexed.
///
/// Index 0 always holds a term-0 sentinel, so `prev_log_index = 0` matches
/// on every peer and `last_index()` of a fresh log is 0.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<LogEntry>")]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// Create a log holding only the sentinel
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::sentinel()],
        }
    }

    /// Index of the last entry (0 when only the sentinel is present)
    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    /// Term of the last entry (0 when only the sentinel is present)
    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.term)
    }

    /// True when the log holds no entries besides the sentinel
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 1
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// Whether this log holds an entry at `index` carrying `term`.
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Clone every entry from `index` to the end.
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = (index as usize).clamp(1, self.entries.len());
        self.entries[start..].to_vec()
    }

    /// Append at the tail, returning the new entry's index.
    pub fn append(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    /// Store `entries` right after `prev_log_index`.
    ///
    /// Caller must have checked `matches(prev_log_index, ..)`. Existing
    /// entries with the same term are kept; the first conflicting entry and
    /// everything after it are replaced. Returns whether the log changed.
    pub fn merge(&mut self, prev_log_index: u64, entries: Vec<LogEntry>) -> bool {
        let mut changed = false;
        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_log_index + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.entries.truncate(index as usize);
                    self.entries.push(entry);
                }
                None => self.entries.push(entry),
            }
            changed = true;
        }
        changed
    }
}

impl TryFrom<Vec<LogEntry>> for Log {
    type Error = RaftError;

    fn try_from(entries: Vec<LogEntry>) -> Result<Self, Self::Error> {
        match entries.first() {
            None => Err(RaftError::CorruptState("log is missing its sentinel".into())),
            Some(first) if first.term != 0 => Err(RaftError::CorruptState(format!(
                "log sentinel has term {}",
                first.term
            ))),
            Some(_) => Ok(Self { entries }),
        }
    }
}

impl Serialize for Log {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}
