//! Snapshot files
//! `snapshot-<persistence-id>-<sequence-nr>-<timestamp>`, each holding an
//! encoded snapshot record followed by its SHA3-256 digest. The sequence
//! number is the last included log index.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use digest::Digest;
use lazy_static::lazy_static;
use regex::Regex;
use sha3::Sha3_256;
use slog::{debug, info, warn, Logger};

use crate::error::StorageError;
use crate::raft::codec::RaftCodec;
use crate::raft::journal::write_atomic;
use crate::raft::types::{LogIndex, Snapshot};

const DIGEST_LEN: usize = 32;

lazy_static! {
    static ref SNAPSHOT_NAME: Regex = Regex::new(r"^snapshot-(.+)-(\d+)-(\d+)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub sequence_nr: LogIndex,
    pub timestamp: u128,
}

pub struct SnapshotStore {
    dir: PathBuf,
    persistence_id: String,
    codec: RaftCodec,
    retain: usize,
    logger: Logger,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(
        dir: P,
        persistence_id: impl Into<String>,
        codec: RaftCodec,
        retain: usize,
        logger: Logger,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotStore {
            dir,
            persistence_id: persistence_id.into(),
            codec,
            retain: retain.max(1),
            logger,
        })
    }

    /// Snapshot files of this persistence id, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotFile>, StorageError> {
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = SNAPSHOT_NAME.captures(name) else {
                continue;
            };
            if &caps[1] != self.persistence_id {
                continue;
            }
            let (Ok(sequence_nr), Ok(timestamp)) = (caps[2].parse(), caps[3].parse()) else {
                continue;
            };
            files.push(SnapshotFile {
                path,
                sequence_nr,
                timestamp,
            });
        }
        files.sort_by(|a, b| (b.sequence_nr, b.timestamp).cmp(&(a.sequence_nr, a.timestamp)));
        Ok(files)
    }

    /// Persist a snapshot and prune all but the newest retained files.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, StorageError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let name = format!(
            "snapshot-{}-{}-{}",
            self.persistence_id, snapshot.last_included_index, timestamp
        );

        let record = self.codec.encode_snapshot(snapshot);
        let digest = Sha3_256::digest(&record);
        let mut data = Vec::with_capacity(record.len() + DIGEST_LEN);
        data.extend_from_slice(&record);
        data.extend_from_slice(&digest);
        write_atomic(&self.dir, &name, &data)?;

        info!(self.logger, "saved snapshot";
            "index" => snapshot.last_included_index,
            "term" => snapshot.last_included_term,
            "bytes" => data.len(),
            "sha3" => hex::encode(&digest[..8]));

        for stale in self.list()?.into_iter().skip(self.retain) {
            debug!(self.logger, "removing old snapshot"; "path" => %stale.path.display());
            fs::remove_file(&stale.path)?;
        }
        Ok(self.dir.join(name))
    }

    /// Newest snapshot that passes its digest check.
    pub fn load_latest(&self) -> Result<Option<Snapshot>, StorageError> {
        for file in self.list()? {
            match self.load(&file.path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(StorageError::Io(e)) => return Err(StorageError::Io(e)),
                Err(e) => {
                    warn!(self.logger, "skipping unreadable snapshot";
                        "path" => %file.path.display(), "error" => %e);
                }
            }
        }
        Ok(None)
    }

    fn load(&self, path: &Path) -> Result<Snapshot, StorageError> {
        let mut data = fs::read(path)?;
        let file = path.display().to_string();
        if data.len() < DIGEST_LEN {
            return Err(StorageError::Corrupt {
                file,
                source: crate::error::CodecError::Truncated {
                    needed: DIGEST_LEN,
                    remaining: data.len(),
                },
            });
        }
        let trailer = data.split_off(data.len() - DIGEST_LEN);
        if Sha3_256::digest(&data).as_slice() != trailer.as_slice() {
            return Err(StorageError::Checksum { file });
        }
        self.codec
            .decode_snapshot(Bytes::from(data))
            .map_err(|source| StorageError::Corrupt { file, source })
    }
}
