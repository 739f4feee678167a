//! Core Raft data types
//! Log entries, commands, term/vote records, snapshots and cluster membership.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Identifier of a member of the cluster, as listed in the node configuration.
pub type ServerId = u64;
/// Raft term (election epoch).
pub type Term = u64;
/// Position of an entry in the replicated log, starting at 1.
pub type LogIndex = u64;

/// Opaque application operation together with its dispatch tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub tag: u8,
    pub data: Bytes,
}

impl Payload {
    pub fn new(tag: u8, data: impl Into<Bytes>) -> Self {
        Payload {
            tag,
            data: data.into(),
        }
    }
}

/// Command carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Appended by a freshly elected leader to commit prior-term entries.
    Noop,
    /// Membership change; effective once the entry commits.
    ClusterConfig(ClusterConfig),
    /// State machine operation.
    Application(Payload),
}

impl Command {
    /// Approximate in-memory footprint, used for size-based compaction.
    pub fn size(&self) -> usize {
        match self {
            Command::Noop => 0,
            Command::ClusterConfig(config) => config.servers.len() * 9,
            Command::Application(payload) => payload.data.len(),
        }
    }
}

/// A single entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Command,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Command) -> Self {
        LogEntry {
            index,
            term,
            command,
        }
    }
}

/// Durable election state.
///
/// A server votes at most once per term; advancing the term clears the vote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermInfo {
    pub term: Term,
    pub voted_for: Option<ServerId>,
}

impl TermInfo {
    pub fn new(term: Term) -> Self {
        TermInfo {
            term,
            voted_for: None,
        }
    }

    pub fn with_vote(term: Term, voted_for: ServerId) -> Self {
        TermInfo {
            term,
            voted_for: Some(voted_for),
        }
    }
}

/// Membership record of a single server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: ServerId,
    pub voting: bool,
}

/// Set of cluster members and their voting status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    servers: BTreeMap<ServerId, bool>,
}

impl ClusterConfig {
    pub fn new(servers: impl IntoIterator<Item = ServerInfo>) -> Self {
        ClusterConfig {
            servers: servers.into_iter().map(|s| (s.id, s.voting)).collect(),
        }
    }

    /// All members voting, the usual bootstrap shape.
    pub fn voting(ids: impl IntoIterator<Item = ServerId>) -> Self {
        ClusterConfig {
            servers: ids.into_iter().map(|id| (id, true)).collect(),
        }
    }

    pub fn servers(&self) -> impl Iterator<Item = ServerInfo> + '_ {
        self.servers
            .iter()
            .map(|(&id, &voting)| ServerInfo { id, voting })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.servers.contains_key(&id)
    }

    pub fn is_voting(&self, id: ServerId) -> bool {
        self.servers.get(&id).copied().unwrap_or(false)
    }

    pub fn voting_members(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers
            .iter()
            .filter(|(_, &voting)| voting)
            .map(|(&id, _)| id)
    }

    pub fn voting_count(&self) -> usize {
        self.servers.values().filter(|&&voting| voting).count()
    }

    /// Strict majority of the voting members.
    pub fn quorum(&self) -> usize {
        self.voting_count() / 2 + 1
    }

    pub fn with_server(&self, info: ServerInfo) -> Self {
        let mut servers = self.servers.clone();
        servers.insert(info.id, info.voting);
        ClusterConfig { servers }
    }

    pub fn without_server(&self, id: ServerId) -> Self {
        let mut servers = self.servers.clone();
        servers.remove(&id);
        ClusterConfig { servers }
    }
}

impl fmt::Display for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, server) in self.servers().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if server.voting {
                write!(f, "{}", server.id)?;
            } else {
                write!(f, "{}(non-voting)", server.id)?;
            }
        }
        write!(f, "]")
    }
}

/// Point-in-time image of the state machine and the log prefix it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub state: Bytes,
    pub cluster_config: Option<ClusterConfig>,
}

/// Role reported by a Raft instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftRole {
    Follower,
    Candidate,
    /// Elected, waiting for the term's first entry to commit.
    PreLeader,
    Leader,
    /// Leader that lost contact with a quorum of voting followers.
    IsolatedLeader,
}

impl RaftRole {
    pub fn is_leader(self) -> bool {
        matches!(self, RaftRole::Leader | RaftRole::IsolatedLeader)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::PreLeader => "pre_leader",
            RaftRole::Leader => "leader",
            RaftRole::IsolatedLeader => "isolated_leader",
        }
    }
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
