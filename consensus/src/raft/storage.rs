use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use slog::{info, warn, Logger};

use crate::error::StorageError;
use crate::raft::codec::RaftCodec;
use crate::raft::journal::{write_atomic, Journal, JournalMeta};
use crate::raft::snapshot_store::SnapshotStore;
use crate::raft::types::{LogEntry, LogIndex, Snapshot, TermInfo};

const TERM_INFO_FILE: &str = "term_info";

/// Everything a Raft instance reloads when it starts.
#[derive(Debug, Default, Clone)]
pub struct RecoveredState {
    pub term_info: TermInfo,
    pub snapshot: Option<Snapshot>,
    /// Contiguous entries following the snapshot.
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
}

/// Durable state of one Raft instance. Every call must be stable on return.
pub trait RaftStorage: Send {
    fn recover(&mut self) -> Result<RecoveredState, StorageError>;

    fn persist_term_info(&mut self, info: &TermInfo) -> Result<(), StorageError>;

    /// Append entries; an entry at an already journaled index replaces it and
    /// everything after it.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError>;

    fn persist_commit(&mut self, commit_index: LogIndex) -> Result<(), StorageError>;

    /// Persist a snapshot and drop the journal prefix it covers.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}

/// Keep only entries that directly follow the snapshot boundary.
fn contiguous_after(entries: Vec<LogEntry>, snapshot_index: LogIndex) -> Vec<LogEntry> {
    let mut next = snapshot_index + 1;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries.into_iter().filter(|e| e.index > snapshot_index) {
        if entry.index != next {
            break;
        }
        next += 1;
        out.push(entry);
    }
    out
}

fn assemble(
    term_info: TermInfo,
    snapshot: Option<Snapshot>,
    entries: Vec<LogEntry>,
    meta: JournalMeta,
) -> RecoveredState {
    let snapshot_index = snapshot.as_ref().map_or(0, |s| s.last_included_index);
    let entries = contiguous_after(entries, snapshot_index);
    let last_index = entries.last().map_or(snapshot_index, |e| e.index);
    let commit_index = meta.commit_index.max(snapshot_index).min(last_index);
    RecoveredState {
        term_info,
        snapshot,
        entries,
        commit_index,
    }
}

/// On-disk storage: `term_info`, the segment journal with `journal.meta`,
/// and snapshot files, all under one directory.
pub struct FileStorage {
    base_path: PathBuf,
    codec: RaftCodec,
    journal: Journal,
    snapshots: SnapshotStore,
    logger: Logger,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(
        base_path: P,
        persistence_id: &str,
        codec: RaftCodec,
        entries_per_segment: usize,
        snapshots_to_retain: usize,
        logger: Logger,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        let journal = Journal::open(
            &base_path,
            codec.clone(),
            entries_per_segment,
            logger.clone(),
        )?;
        let snapshots = SnapshotStore::new(
            &base_path,
            persistence_id,
            codec.clone(),
            snapshots_to_retain,
            logger.clone(),
        )?;
        Ok(FileStorage {
            base_path,
            codec,
            journal,
            snapshots,
            logger,
        })
    }

    fn read_term_info(&self) -> Result<TermInfo, StorageError> {
        let path = self.base_path.join(TERM_INFO_FILE);
        if !path.exists() {
            return Ok(TermInfo::default());
        }
        let raw = fs::read(&path)?;
        self.codec
            .decode_term_info(Bytes::from(raw))
            .map_err(|source| StorageError::Corrupt {
                file: path.display().to_string(),
                source,
            })
    }
}

impl RaftStorage for FileStorage {
    fn recover(&mut self) -> Result<RecoveredState, StorageError> {
        let term_info = self.read_term_info()?;
        let snapshot = self.snapshots.load_latest()?;
        let replay = self.journal.replay()?;
        let snapshot_index = snapshot.as_ref().map_or(0, |s| s.last_included_index);
        if let Some(first) = replay.entries.first() {
            if first.index > snapshot_index + 1 {
                warn!(self.logger, "journal does not follow the latest snapshot";
                    "first_index" => first.index, "snapshot_index" => snapshot_index);
            }
        }
        let state = assemble(term_info, snapshot, replay.entries, replay.meta);
        info!(self.logger, "recovered storage";
            "term" => state.term_info.term,
            "snapshot_index" => state.snapshot.as_ref().map_or(0, |s| s.last_included_index),
            "entries" => state.entries.len(),
            "commit_index" => state.commit_index);
        Ok(state)
    }

    fn persist_term_info(&mut self, info: &TermInfo) -> Result<(), StorageError> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("storage::persist_term_info", |_| Err(StorageError::Injected(
            "persist_term_info".to_owned()
        )));
        write_atomic(
            &self.base_path,
            TERM_INFO_FILE,
            &self.codec.encode_term_info(info),
        )
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("storage::append_entries", |_| Err(StorageError::Injected(
            "append_entries".to_owned()
        )));
        self.journal.append(entries)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.journal.truncate_from(index)
    }

    fn persist_commit(&mut self, commit_index: LogIndex) -> Result<(), StorageError> {
        self.journal.persist_meta(&JournalMeta { commit_index })
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        #[cfg(feature = "failpoints")]
        fail::fail_point!("storage::save_snapshot", |_| Err(StorageError::Injected(
            "save_snapshot".to_owned()
        )));
        self.snapshots.save(snapshot)?;
        self.journal.compact(snapshot.last_included_index)
    }
}

#[derive(Debug, Default)]
struct MemInner {
    term_info: TermInfo,
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    meta: JournalMeta,
    fail_writes: bool,
}

/// In-memory storage. Clones share the same state, so an instance can be
/// dropped and rebuilt over what it persisted.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn wl(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every following write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.wl().fail_writes = fail;
    }

    pub fn term_info(&self) -> TermInfo {
        self.wl().term_info
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.wl().entries.clone()
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.wl().snapshot.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.wl().meta.commit_index
    }

    fn writable(&self, op: &str) -> Result<MutexGuard<'_, MemInner>, StorageError> {
        let inner = self.wl();
        if inner.fail_writes {
            return Err(StorageError::Injected(op.to_owned()));
        }
        Ok(inner)
    }
}

impl RaftStorage for MemStorage {
    fn recover(&mut self) -> Result<RecoveredState, StorageError> {
        let inner = self.wl();
        Ok(assemble(
            inner.term_info,
            inner.snapshot.clone(),
            inner.entries.clone(),
            inner.meta,
        ))
    }

    fn persist_term_info(&mut self, info: &TermInfo) -> Result<(), StorageError> {
        self.writable("persist_term_info")?.term_info = *info;
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut inner = self.writable("append_entries")?;
        if let Some(first) = entries.first() {
            inner.entries.retain(|e| e.index < first.index);
            inner.entries.extend_from_slice(entries);
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.writable("truncate_from")?
            .entries
            .retain(|e| e.index < index);
        Ok(())
    }

    fn persist_commit(&mut self, commit_index: LogIndex) -> Result<(), StorageError> {
        self.writable("persist_commit")?.meta = JournalMeta { commit_index };
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut inner = self.writable("save_snapshot")?;
        inner
            .entries
            .retain(|e| e.index > snapshot.last_included_index);
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
