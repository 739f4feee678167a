//! In-memory view of the replicated log
//! Retained entries follow the last snapshot; everything at or below
//! `snapshot_index` lives only in the snapshot.

use std::collections::VecDeque;

use crate::error::LogConflict;
use crate::raft::types::{LogEntry, LogIndex, Term};

#[derive(Debug, Default)]
pub struct ReplicatedLog {
    entries: VecDeque<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    commit_index: LogIndex,
    last_applied: LogIndex,
    data_size: usize,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log whose prefix up to `(index, term)` is held by a snapshot.
    pub fn from_snapshot(index: LogIndex, term: Term) -> Self {
        ReplicatedLog {
            snapshot_index: index,
            snapshot_term: term,
            commit_index: index,
            last_applied: index,
            ..Default::default()
        }
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Earliest index still retained as an entry.
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of retained command sizes.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    pub fn is_present(&self, index: LogIndex) -> bool {
        self.position(index).is_some()
    }

    /// Term of the entry at `index`, including the snapshot boundary and the
    /// empty-log sentinel at index 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Append the next entry.
    pub fn append(&mut self, entry: LogEntry) -> Result<(), LogConflict> {
        let last_index = self.last_index();
        if entry.index != last_index + 1 {
            return Err(LogConflict::NotContiguous {
                index: entry.index,
                last_index,
            });
        }
        let last_term = self.last_term();
        if entry.term < last_term {
            return Err(LogConflict::TermRegression {
                index: entry.index,
                term: entry.term,
                last_term,
            });
        }
        self.data_size += entry.command.size();
        self.entries.push_back(entry);
        Ok(())
    }

    /// Remove every entry from `index` onward. Committed entries are never removed.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<Vec<LogEntry>, LogConflict> {
        if index <= self.commit_index {
            return Err(LogConflict::TruncateCommitted {
                index,
                commit_index: self.commit_index,
            });
        }
        let Some(pos) = self.position(index) else {
            return Ok(Vec::new());
        };
        let removed: Vec<LogEntry> = self.entries.drain(pos..).collect();
        self.data_size -= removed.iter().map(|e| e.command.size()).sum::<usize>();
        Ok(removed)
    }

    /// Lazily iterate over retained entries starting at `index`.
    pub fn entries_from(&self, index: LogIndex) -> impl Iterator<Item = &LogEntry> + '_ {
        let start = if index <= self.snapshot_index {
            0
        } else {
            ((index - self.snapshot_index - 1) as usize).min(self.entries.len())
        };
        self.entries.range(start..)
    }

    /// Entries from `index` bounded by count and total command size. The first
    /// entry is always included so that oversized commands still make progress.
    pub fn slice(&self, index: LogIndex, max_entries: usize, max_bytes: usize) -> Vec<LogEntry> {
        let mut size = 0usize;
        let mut out = Vec::new();
        for entry in self.entries_from(index).take(max_entries.max(1)) {
            size += entry.command.size();
            if !out.is_empty() && size > max_bytes {
                break;
            }
            out.push(entry.clone());
        }
        out
    }

    /// Discard entries up to and including `upto`, which a snapshot now covers.
    pub fn compact(&mut self, upto: LogIndex) -> Result<(), LogConflict> {
        if upto > self.commit_index {
            return Err(LogConflict::CompactUncommitted {
                index: upto,
                commit_index: self.commit_index,
            });
        }
        if upto <= self.snapshot_index {
            return Ok(());
        }
        let term = self.term_at(upto).unwrap_or(self.snapshot_term);
        while let Some(front) = self.entries.front() {
            if front.index > upto {
                break;
            }
            self.data_size -= front.command.size();
            self.entries.pop_front();
        }
        self.snapshot_index = upto;
        self.snapshot_term = term;
        Ok(())
    }

    /// Replace the whole log with a received snapshot boundary. If the log
    /// already holds the boundary entry, the suffix after it is kept.
    pub fn install_snapshot(&mut self, index: LogIndex, term: Term) {
        if self.term_at(index) == Some(term) && index >= self.snapshot_index {
            while let Some(front) = self.entries.front() {
                if front.index > index {
                    break;
                }
                self.data_size -= front.command.size();
                self.entries.pop_front();
            }
        } else {
            self.entries.clear();
            self.data_size = 0;
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
    }

    /// Advance the commit index. Never moves backwards or past the last entry.
    pub fn set_commit_index(&mut self, index: LogIndex) -> bool {
        let index = index.min(self.last_index());
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }

    pub fn set_last_applied(&mut self, index: LogIndex) {
        debug_assert!(index <= self.commit_index);
        self.last_applied = index;
    }
}
