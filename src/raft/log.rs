use super::{Index, MemberSet, Term, NO_INDEX, NO_TERM};
use crate::encoding;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};

/// A log entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was appended by a leader.
    pub term: Term,
    /// The entry content.
    pub content: Content,
}

impl encoding::Value for Entry {}

impl Entry {
    pub fn new(term: Term, content: Content) -> Self {
        Self { term, content }
    }
}

/// Log entry content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Content {
    /// Appended by a newly elected leader. Committing it commits all entries
    /// from previous terms, and it delimits entries by leader reign.
    NewLeaderBarrier,
    /// A new voting member set, which takes effect once committed.
    Membership(MemberSet),
    /// An opaque application payload.
    Data(Vec<u8>),
}

impl Content {
    /// Returns the approximate payload size in bytes, for cache accounting.
    pub fn size(&self) -> usize {
        match self {
            Self::NewLeaderBarrier => 0,
            Self::Membership(members) => members.len() * std::mem::size_of::<u64>(),
            Self::Data(data) => data.len(),
        }
    }
}

/// A Raft log store. Entries are indexed from 0, and -1 means no index.
///
/// The log may be pruned from the start once entries have been captured in a
/// snapshot. The prev index is the index of the last pruned entry (or -1), and
/// the log retains that entry's term so that it can still be used to check log
/// matching. Entries may also be truncated from the end, if they conflict with
/// a new leader's log. Committed entries must never be truncated, but the log
/// doesn't know the commit index, so that's up to the caller.
///
/// Appends must be durable once the call returns.
pub trait RaftLog: Send {
    /// Appends entries to the log, returning the new append index.
    fn append(&mut self, entries: &[Entry]) -> Result<Index>;

    /// Removes all entries at or after the given index.
    fn truncate(&mut self, from_index: Index) -> Result<()>;

    /// Prunes entries up to and including the given index, if they exist.
    /// Returns the new prev index.
    fn prune(&mut self, safe_index: Index) -> Result<Index>;

    /// Discards the entire log and continues from the given index and term,
    /// e.g. after installing a snapshot. Returns the new append index.
    fn skip(&mut self, index: Index, term: Term) -> Result<Index>;

    /// Returns the index of the last appended entry, or -1 if none.
    fn append_index(&self) -> Index;

    /// Returns the index of the last pruned or skipped entry, or -1 if none.
    fn prev_index(&self) -> Index;

    /// Returns the term of the entry at the given index, or -1 if it is not
    /// known. The term of the prev index is known.
    fn read_entry_term(&self, index: Index) -> Result<Term>;

    /// Reads the entry at the given index, if it exists and hasn't been pruned.
    fn read(&self, index: Index) -> Result<Option<Entry>>;
}

/// An in-memory log. Not durable, used for tests and the demo cluster.
pub struct MemoryLog {
    entries: Vec<Entry>,
    prev_index: Index,
    prev_term: Term,
}

impl MemoryLog {
    /// Creates a new, empty in-memory log.
    pub fn new() -> Self {
        Self { entries: Vec::new(), prev_index: NO_INDEX, prev_term: NO_TERM }
    }

    /// Returns the vector offset for a log index.
    fn offset(&self, index: Index) -> Option<usize> {
        if index <= self.prev_index || index > self.append_index() {
            return None;
        }
        Some((index - self.prev_index - 1) as usize)
    }
}

impl RaftLog for MemoryLog {
    fn append(&mut self, entries: &[Entry]) -> Result<Index> {
        let mut last_term = self.read_entry_term(self.append_index())?;
        for entry in entries {
            if entry.term < last_term {
                return Err(Error::Internal(format!(
                    "Non-monotonic term {} for entry {}, previous term {}",
                    entry.term,
                    self.append_index() + 1,
                    last_term
                )));
            }
            last_term = entry.term;
            self.entries.push(entry.clone());
        }
        Ok(self.append_index())
    }

    fn truncate(&mut self, from_index: Index) -> Result<()> {
        if from_index <= self.prev_index || from_index > self.append_index() {
            return Err(Error::Internal(format!(
                "Can't truncate from {}, log has entries {}..={}",
                from_index,
                self.prev_index + 1,
                self.append_index()
            )));
        }
        let keep = (from_index - self.prev_index - 1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn prune(&mut self, safe_index: Index) -> Result<Index> {
        let safe_index = safe_index.min(self.append_index());
        if safe_index <= self.prev_index {
            return Ok(self.prev_index);
        }
        self.prev_term = self.read_entry_term(safe_index)?;
        let count = (safe_index - self.prev_index) as usize;
        self.entries.drain(..count);
        self.prev_index = safe_index;
        Ok(self.prev_index)
    }

    fn skip(&mut self, index: Index, term: Term) -> Result<Index> {
        if index > self.append_index() {
            self.entries.clear();
            self.prev_index = index;
            self.prev_term = term;
        }
        Ok(self.append_index())
    }

    fn append_index(&self) -> Index {
        self.prev_index + self.entries.len() as Index
    }

    fn prev_index(&self) -> Index {
        self.prev_index
    }

    fn read_entry_term(&self, index: Index) -> Result<Term> {
        if index == self.prev_index {
            return Ok(self.prev_term);
        }
        Ok(self.offset(index).map_or(NO_TERM, |offset| self.entries[offset].term))
    }

    fn read(&self, index: Index) -> Result<Option<Entry>> {
        Ok(self.offset(index).map(|offset| self.entries[offset].clone()))
    }
}
