//! Error types shared by the Raft core and its collaborators.

use std::io;

use thiserror::Error;

use crate::raft::types::{LogIndex, ServerId, Term};

/// Errors reported to clients of a Raft instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<ServerId> },

    /// The entry was overwritten by a different leader before it committed.
    #[error("entry {index} was replaced before commit")]
    EntryDropped { index: LogIndex },

    #[error("leadership transfer in progress")]
    LeadershipTransferInProgress,

    #[error("leadership transfer failed: {reason}")]
    LeadershipTransferFailed { reason: String },

    /// The instance stopped after a persistence failure.
    #[error("raft instance halted: {reason}")]
    Halted { reason: String },

    #[error("payload tag {tag} is not a registered application type")]
    InvalidPayload { tag: u8 },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// The instance shut down before answering.
    #[error("raft instance stopped")]
    Stopped,
}

/// Failures of the durable storage layer. Always fatal to the instance.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt record in {file}: {source}")]
    Corrupt { file: String, source: CodecError },

    #[error("checksum mismatch in {file}")]
    Checksum { file: String },

    #[error("injected failure: {0}")]
    Injected(String),
}

/// Wire and record decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("bad frame magic {0:#04x}")]
    BadMagic(u8),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message tag {0}")]
    UnknownMessage(u8),

    #[error("unknown payload type {0}")]
    UnknownPayloadType(u8),

    #[error("payload tag {0} is reserved")]
    ReservedPayloadType(u8),

    #[error("payload tag {0} registered twice")]
    DuplicatePayloadType(u8),

    #[error("unknown record kind {0}")]
    UnknownRecord(u8),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Rejected append to the replicated log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogConflict {
    #[error("entry index {index} does not follow last index {last_index}")]
    NotContiguous { index: LogIndex, last_index: LogIndex },

    #[error("entry term {term} at index {index} precedes last term {last_term}")]
    TermRegression {
        index: LogIndex,
        term: Term,
        last_term: Term,
    },

    #[error("cannot truncate committed index {index} (commit index {commit_index})")]
    TruncateCommitted {
        index: LogIndex,
        commit_index: LogIndex,
    },

    #[error("cannot compact to {index} beyond commit index {commit_index}")]
    CompactUncommitted {
        index: LogIndex,
        commit_index: LogIndex,
    },
}
