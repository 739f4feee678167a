//! Peer RPC messages
//! Every message carries the sender's term; replies name the replying server
//! so the receiver can match them to its peer bookkeeping.

use bytes::Bytes;

use crate::raft::types::{ClusterConfig, LogEntry, LogIndex, ServerId, Term};

/// First chunk of a snapshot transfer.
pub const FIRST_CHUNK_INDEX: u32 = 1;
/// Chunk index a follower replies with when it cannot accept the chunk it got.
pub const INVALID_CHUNK_INDEX: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteReply {
    pub term: Term,
    pub voter_id: ServerId,
    pub vote_granted: bool,
    /// Highest wire version the voter understands.
    pub raft_version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub follower_id: ServerId,
    pub success: bool,
    /// On success the last index verified against the leader, otherwise the
    /// follower's own last index.
    pub log_last_index: LogIndex,
    pub log_last_term: Term,
    /// The follower has nothing in common with the leader's log.
    pub force_install_snapshot: bool,
    pub raft_version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: ServerId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Bytes,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Hash of the previous chunk; absent on the first one.
    pub last_chunk_hash_code: Option<u32>,
    pub server_config: Option<ClusterConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotReply {
    pub term: Term,
    pub follower_id: ServerId,
    pub chunk_index: u32,
    pub success: bool,
}

/// Tells a caught-up follower to start an election right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutNow {
    pub term: Term,
    pub leader_id: ServerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftRpc {
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotReply(InstallSnapshotReply),
    TimeoutNow(TimeoutNow),
}

impl RaftRpc {
    pub fn term(&self) -> Term {
        match self {
            RaftRpc::RequestVote(m) => m.term,
            RaftRpc::RequestVoteReply(m) => m.term,
            RaftRpc::AppendEntries(m) => m.term,
            RaftRpc::AppendEntriesReply(m) => m.term,
            RaftRpc::InstallSnapshot(m) => m.term,
            RaftRpc::InstallSnapshotReply(m) => m.term,
            RaftRpc::TimeoutNow(m) => m.term,
        }
    }

    pub fn sender(&self) -> ServerId {
        match self {
            RaftRpc::RequestVote(m) => m.candidate_id,
            RaftRpc::RequestVoteReply(m) => m.voter_id,
            RaftRpc::AppendEntries(m) => m.leader_id,
            RaftRpc::AppendEntriesReply(m) => m.follower_id,
            RaftRpc::InstallSnapshot(m) => m.leader_id,
            RaftRpc::InstallSnapshotReply(m) => m.follower_id,
            RaftRpc::TimeoutNow(m) => m.leader_id,
        }
    }

    /// Metric label.
    pub fn name(&self) -> &'static str {
        match self {
            RaftRpc::RequestVote(_) => "request_vote",
            RaftRpc::RequestVoteReply(_) => "request_vote_reply",
            RaftRpc::AppendEntries(_) => "append_entries",
            RaftRpc::AppendEntriesReply(_) => "append_entries_reply",
            RaftRpc::InstallSnapshot(_) => "install_snapshot",
            RaftRpc::InstallSnapshotReply(_) => "install_snapshot_reply",
            RaftRpc::TimeoutNow(_) => "timeout_now",
        }
    }
}
