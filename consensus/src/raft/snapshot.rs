//! Snapshot capture and chunked transfer
//!
//! [`SnapshotManager`] tracks the local capture cycle and keeps the latest
//! snapshot around for followers that need it. [`LeaderInstallSnapshotState`]
//! is the sender side of one transfer, [`SnapshotTracker`] the receiver side.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::raft::messages::{FIRST_CHUNK_INDEX, INVALID_CHUNK_INDEX};
use crate::raft::types::{ClusterConfig, LogIndex, ServerId, Snapshot, Term};

pub fn chunk_hash(data: &[u8]) -> u32 {
    fxhash::hash32(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Persisting,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureState::Idle => "idle",
            CaptureState::Capturing => "capturing",
            CaptureState::Persisting => "persisting",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct SnapshotManager {
    state: CaptureState,
    latest: Option<Arc<Snapshot>>,
}

impl SnapshotManager {
    pub fn new(latest: Option<Snapshot>) -> Self {
        SnapshotManager {
            state: CaptureState::Idle,
            latest: latest.map(Arc::new),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn set_state(&mut self, state: CaptureState) {
        self.state = state;
    }

    /// Most recent snapshot captured, installed or recovered.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.clone()
    }

    pub fn record(&mut self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.latest = Some(snapshot.clone());
        self.state = CaptureState::Idle;
        snapshot
    }
}

/// Outcome of a chunk acknowledgement on the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAck {
    /// Another chunk is ready to go out.
    Next,
    /// The follower has the whole snapshot.
    Done,
    /// Reply to a chunk other than the one in flight.
    Stale,
}

/// Sender side of one chunked snapshot transfer.
#[derive(Debug)]
pub struct LeaderInstallSnapshotState {
    snapshot: Arc<Snapshot>,
    chunk_size: usize,
    total_chunks: u32,
    chunk_index: u32,
    last_chunk_hash: Option<u32>,
    retries: u32,
    ticks_waiting: u64,
    restarts: u32,
}

impl LeaderInstallSnapshotState {
    pub fn new(snapshot: Arc<Snapshot>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let len = snapshot.state.len();
        let total_chunks = len.div_ceil(chunk_size).max(1) as u32;
        LeaderInstallSnapshotState {
            snapshot,
            chunk_size,
            total_chunks,
            chunk_index: FIRST_CHUNK_INDEX,
            last_chunk_hash: None,
            retries: 0,
            ticks_waiting: 0,
            restarts: 0,
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    /// How many times the transfer went back to the first chunk.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn chunk_bytes(&self, chunk_index: u32) -> Bytes {
        let start = (chunk_index - FIRST_CHUNK_INDEX) as usize * self.chunk_size;
        let len = self.snapshot.state.len();
        let start = start.min(len);
        let end = (start + self.chunk_size).min(len);
        self.snapshot.state.slice(start..end)
    }

    /// Chunk to (re)send: index, data and the hash of the previous chunk.
    pub fn current_chunk(&mut self) -> (u32, Bytes, Option<u32>) {
        self.ticks_waiting = 0;
        (
            self.chunk_index,
            self.chunk_bytes(self.chunk_index),
            self.last_chunk_hash,
        )
    }

    pub fn is_last_chunk(&self, chunk_index: u32) -> bool {
        chunk_index == self.total_chunks
    }

    pub fn chunk_acked(&mut self, chunk_index: u32) -> ChunkAck {
        if chunk_index != self.chunk_index {
            return ChunkAck::Stale;
        }
        if self.is_last_chunk(chunk_index) {
            return ChunkAck::Done;
        }
        self.last_chunk_hash = Some(chunk_hash(&self.chunk_bytes(chunk_index)));
        self.chunk_index += 1;
        self.retries = 0;
        ChunkAck::Next
    }

    /// Count a failed attempt at the current chunk. Returns true when the
    /// transfer went back to the first chunk.
    pub fn chunk_failed(&mut self, max_retries: u32) -> bool {
        self.retries += 1;
        if self.retries > max_retries {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.chunk_index = FIRST_CHUNK_INDEX;
        self.last_chunk_hash = None;
        self.retries = 0;
        self.ticks_waiting = 0;
        self.restarts += 1;
    }

    /// Advance the reply timeout by one heartbeat tick; true once it expired.
    pub fn tick(&mut self, timeout_ticks: u64) -> bool {
        self.ticks_waiting += 1;
        self.ticks_waiting > timeout_ticks
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("expected chunk {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("hash of chunk {chunk_index} does not match its predecessor")]
    HashMismatch { chunk_index: u32 },
}

/// Receiver side of a chunked snapshot transfer.
#[derive(Debug)]
pub struct SnapshotTracker {
    leader_id: ServerId,
    last_included_index: LogIndex,
    last_included_term: Term,
    total_chunks: u32,
    last_chunk_index: u32,
    last_chunk_hash: Option<u32>,
    data: BytesMut,
}

impl SnapshotTracker {
    pub fn new(
        leader_id: ServerId,
        last_included_index: LogIndex,
        last_included_term: Term,
        total_chunks: u32,
    ) -> Self {
        SnapshotTracker {
            leader_id,
            last_included_index,
            last_included_term,
            total_chunks,
            last_chunk_index: INVALID_CHUNK_INDEX,
            last_chunk_hash: None,
            data: BytesMut::new(),
        }
    }

    /// Whether a chunk belongs to the transfer this tracker assembles.
    pub fn matches(&self, leader_id: ServerId, index: LogIndex, term: Term) -> bool {
        self.leader_id == leader_id
            && self.last_included_index == index
            && self.last_included_term == term
    }

    pub fn last_chunk_index(&self) -> u32 {
        self.last_chunk_index
    }

    /// Add the next chunk. Returns true once the final chunk arrived.
    pub fn add_chunk(
        &mut self,
        chunk_index: u32,
        data: &[u8],
        last_chunk_hash_code: Option<u32>,
    ) -> Result<bool, ChunkError> {
        let expected = self.last_chunk_index + 1;
        if chunk_index != expected {
            return Err(ChunkError::OutOfOrder {
                expected,
                got: chunk_index,
            });
        }
        if let Some(hash) = last_chunk_hash_code {
            if self.last_chunk_hash != Some(hash) {
                return Err(ChunkError::HashMismatch { chunk_index });
            }
        }
        self.data.extend_from_slice(data);
        self.last_chunk_index = chunk_index;
        self.last_chunk_hash = Some(chunk_hash(data));
        Ok(chunk_index == self.total_chunks)
    }

    /// Assemble the received snapshot.
    pub fn into_snapshot(self, cluster_config: Option<ClusterConfig>) -> Snapshot {
        Snapshot {
            last_included_index: self.last_included_index,
            last_included_term: self.last_included_term,
            state: self.data.freeze(),
            cluster_config,
        }
    }
}
