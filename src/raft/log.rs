//! The replicated log: an index-addressed entry sequence that can be
//! truncated at the back (conflict resolution) and compacted at the front
//! (snapshots).

use serde::{Deserialize, Serialize};

use super::{LogIndex, Term};

/// A single entry in the replicated log. Indices are 1-based; index 0 means
/// "before the first entry".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    /// Opaque command bytes; the state machine interprets them.
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Vec<u8>) -> Self {
        Self {
            index,
            term,
            command,
        }
    }
}

/// In-memory log with a snapshot marker standing in for the compacted
/// prefix. Entry at global index `i` lives at offset `i - snapshot_index - 1`.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the persisted record.
    pub fn from_parts(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<LogEntry>) -> Self {
        Self {
            entries,
            snapshot_index,
            snapshot_term,
        }
    }

    pub fn last_index(&self) -> LogIndex {
        match self.entries.last() {
            Some(entry) => entry.index,
            None => self.snapshot_index,
        }
    }

    pub fn last_term(&self) -> Term {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self.snapshot_term,
        }
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = (index - self.snapshot_index - 1) as usize;
        self.entries.get(offset)
    }

    /// Term of the entry at `index`. The snapshot marker answers for
    /// `snapshot_index` itself (and for index 0 on a fresh log).
    pub fn term(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            Some(self.snapshot_term)
        } else {
            self.get(index).map(|entry| entry.term)
        }
    }

    /// Append a fresh leader-side entry, assigning it the next index.
    pub fn append_command(&mut self, term: Term, command: Vec<u8>) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(index, term, command));
        index
    }

    /// Follower-side merge: skip entries already present with a matching
    /// term, truncate the suffix at the first conflict, append the rest.
    /// Returns the index of the last entry covered by `entries` (or the
    /// current last index for a pure heartbeat).
    pub fn merge(&mut self, entries: Vec<LogEntry>) -> LogIndex {
        let mut last_new = self.last_index();
        for entry in entries {
            if entry.index <= self.snapshot_index {
                // Already compacted away; the snapshot covers it.
                last_new = last_new.max(entry.index);
                continue;
            }
            match self.term(entry.index) {
                Some(existing_term) if existing_term == entry.term => {
                    last_new = entry.index;
                }
                Some(_) => {
                    self.truncate_from(entry.index);
                    last_new = entry.index;
                    self.entries.push(entry);
                }
                None => {
                    last_new = entry.index;
                    self.entries.push(entry);
                }
            }
        }
        last_new
    }

    /// Drop `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.snapshot_index {
            self.entries.clear();
        } else {
            let offset = (index - self.snapshot_index - 1) as usize;
            self.entries.truncate(offset);
        }
    }

    /// Entries from `start` (inclusive), bounded by `limit`.
    pub fn entries_from(&self, start: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start <= self.snapshot_index {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        if offset >= self.entries.len() {
            return Vec::new();
        }
        let end = (offset + limit).min(self.entries.len());
        self.entries[offset..end].to_vec()
    }

    /// First index carrying `term`, for conflict hints.
    pub fn first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .find(|entry| entry.term == term)
            .map(|entry| entry.index)
    }

    /// Last index carrying `term`, for leader-side backoff.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.term == term)
            .map(|entry| entry.index)
    }

    /// Discard the prefix up to and including `index`, replacing it with a
    /// snapshot marker. `index` must name a live entry or the marker itself.
    pub fn compact_to(&mut self, index: LogIndex, term: Term) {
        if index <= self.snapshot_index {
            return;
        }
        let keep_from = (index - self.snapshot_index) as usize;
        if keep_from >= self.entries.len() {
            self.entries.clear();
        } else {
            self.entries.drain(..keep_from);
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Throw the whole log away and start over from an installed snapshot.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
