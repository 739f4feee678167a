//! Durable log journal
//! Entries are appended to `segment_<first-index>.log` files that roll over
//! after a fixed number of records. Commit progress lives in `journal.meta`.
//!
//! Journals written by older releases may also contain apply markers and
//! delete markers; those are folded into plain entries by
//! [`migrate_legacy`] the first time the journal is replayed, after which the
//! segments are rewritten in the current layout.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use slog::{info, warn, Logger};

use crate::error::StorageError;
use crate::raft::codec::RaftCodec;
use crate::raft::segment::Segment;
use crate::raft::types::{LogEntry, LogIndex};

const META_FILE: &str = "journal.meta";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    Entry(LogEntry),
    /// Older releases journaled the applied index as a separate record.
    LegacyApplied { to_index: LogIndex },
    /// Older releases journaled truncation as a record instead of cutting files.
    LegacyDelete { from_index: LogIndex },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalMeta {
    pub commit_index: LogIndex,
}

/// Result of folding a record stream into a list of entries.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Migrated {
    pub entries: Vec<LogEntry>,
    /// Highest index a legacy apply marker recorded.
    pub applied: LogIndex,
    /// Whether any legacy record was seen.
    pub converted: bool,
}

/// Fold journal records into the entry list they describe. Later entries
/// replace earlier ones at the same or higher index.
pub fn migrate_legacy(records: impl IntoIterator<Item = JournalRecord>) -> Migrated {
    fn cut(entries: &mut Vec<LogEntry>, from: LogIndex) {
        let keep = entries.iter().take_while(|e| e.index < from).count();
        entries.truncate(keep);
    }

    let mut out = Migrated::default();
    for record in records {
        match record {
            JournalRecord::Entry(entry) => {
                cut(&mut out.entries, entry.index);
                out.entries.push(entry);
            }
            JournalRecord::LegacyApplied { to_index } => {
                out.applied = out.applied.max(to_index);
                out.converted = true;
            }
            JournalRecord::LegacyDelete { from_index } => {
                cut(&mut out.entries, from_index);
                out.converted = true;
            }
        }
    }
    out
}

/// What a journal replay recovered.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<LogEntry>,
    pub meta: JournalMeta,
}

pub struct Journal {
    dir: PathBuf,
    codec: RaftCodec,
    segments: BTreeMap<LogIndex, Segment>,
    entries_per_segment: usize,
    logger: Logger,
}

impl Journal {
    pub fn open<P: AsRef<Path>>(
        dir: P,
        codec: RaftCodec,
        entries_per_segment: usize,
        logger: Logger,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = BTreeMap::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            let Some(first_index) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Segment::parse_file_name)
            else {
                continue;
            };
            let segment = Segment::open(&path, first_index)?;
            if segment.discarded_tail() > 0 {
                warn!(logger, "discarded torn journal tail";
                    "segment" => %path.display(), "bytes" => segment.discarded_tail());
            }
            segments.insert(first_index, segment);
        }

        Ok(Journal {
            dir,
            codec,
            segments,
            entries_per_segment: entries_per_segment.max(1),
            logger,
        })
    }

    /// Read every segment and the commit meta. Legacy journals are converted
    /// and rewritten in place.
    pub fn replay(&mut self) -> Result<Replay, StorageError> {
        let mut records = Vec::new();
        for segment in self.segments.values_mut() {
            let file = segment.path().display().to_string();
            for raw in segment.read_all()? {
                let record = self
                    .codec
                    .decode_journal_record(Bytes::from(raw))
                    .map_err(|source| StorageError::Corrupt {
                        file: file.clone(),
                        source,
                    })?;
                records.push(record);
            }
        }

        let migrated = migrate_legacy(records);
        let mut meta = self.read_meta()?;
        if migrated.converted {
            info!(self.logger, "converting legacy journal";
                "entries" => migrated.entries.len(), "applied" => migrated.applied);
            meta.commit_index = meta.commit_index.max(migrated.applied);
            self.rewrite(&migrated.entries)?;
            self.persist_meta(&meta)?;
        }

        Ok(Replay {
            entries: migrated.entries,
            meta,
        })
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        for (_, segment) in std::mem::take(&mut self.segments) {
            segment.remove()?;
        }
        self.append(entries)
    }

    pub fn last_index(&self) -> Option<LogIndex> {
        self.segments
            .values()
            .next_back()
            .filter(|s| !s.is_empty())
            .map(|s| s.last_index())
    }

    fn new_segment(&mut self, first_index: LogIndex) -> Result<(), StorageError> {
        let path = self.dir.join(Segment::file_name(first_index));
        let segment = Segment::open(path, first_index)?;
        self.segments.insert(first_index, segment);
        Ok(())
    }

    /// Append entries, replacing any journaled suffix they overlap.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };

        match self.last_index() {
            Some(last) if first.index <= last => self.truncate_from(first.index)?,
            Some(last) if first.index > last + 1 => {
                // the log jumped past the journal through a snapshot install
                for (_, segment) in std::mem::take(&mut self.segments) {
                    segment.remove()?;
                }
            }
            _ => {}
        }

        let mut rest = entries;
        while !rest.is_empty() {
            let needs_segment = match self.segments.values().next_back() {
                None => true,
                Some(active) => active.len() >= self.entries_per_segment,
            };
            if needs_segment {
                self.new_segment(rest[0].index)?;
            }
            let Some(active) = self.segments.values_mut().next_back() else {
                break;
            };
            let room = self.entries_per_segment - active.len();
            let (batch, tail) = rest.split_at(room.min(rest.len()));
            let records: Vec<Bytes> = batch
                .iter()
                .map(|e| self.codec.encode_journal_record(&JournalRecord::Entry(e.clone())))
                .collect();
            active.append(&records)?;
            rest = tail;
        }
        Ok(())
    }

    /// Drop every journaled entry from `index` onward.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        let doomed: Vec<LogIndex> = self.segments.range(index..).map(|(&k, _)| k).collect();
        for first_index in doomed {
            if let Some(segment) = self.segments.remove(&first_index) {
                segment.remove()?;
            }
        }
        if let Some(segment) = self.segments.values_mut().next_back() {
            if index <= segment.last_index() {
                segment.truncate((index - segment.first_index()) as usize)?;
            }
        }
        Ok(())
    }

    /// Remove whole segments a snapshot at `upto` covers.
    pub fn compact(&mut self, upto: LogIndex) -> Result<(), StorageError> {
        let covered: Vec<LogIndex> = self
            .segments
            .values()
            .filter(|s| s.is_empty() || s.last_index() <= upto)
            .map(|s| s.first_index())
            .collect();
        for first_index in covered {
            if let Some(segment) = self.segments.remove(&first_index) {
                segment.remove()?;
            }
        }
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn read_meta(&self) -> Result<JournalMeta, StorageError> {
        let path = self.dir.join(META_FILE);
        if !path.exists() {
            return Ok(JournalMeta::default());
        }
        let raw = fs::read(&path)?;
        self.codec
            .decode_journal_meta(Bytes::from(raw))
            .map_err(|source| StorageError::Corrupt {
                file: path.display().to_string(),
                source,
            })
    }

    pub fn persist_meta(&self, meta: &JournalMeta) -> Result<(), StorageError> {
        write_atomic(&self.dir, META_FILE, &self.codec.encode_journal_meta(meta))
    }

    /// Write records in the given order without conversion. Used to seed a
    /// journal in the older layout.
    #[cfg(test)]
    pub fn write_raw(&mut self, first_index: LogIndex, records: &[JournalRecord]) -> Result<(), StorageError> {
        self.new_segment(first_index)?;
        let encoded: Vec<Bytes> = records
            .iter()
            .map(|r| self.codec.encode_journal_record(r))
            .collect();
        if let Some(segment) = self.segments.get_mut(&first_index) {
            segment.append(&encoded)?;
        }
        Ok(())
    }
}

/// Write `name` under `dir` through a temporary file and a rename. The
/// directory is synced so the rename itself survives a crash.
pub fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<(), StorageError> {
    let tmp = dir.join(format!("{}.tmp", name));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, dir.join(name))?;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}
