use crate::raft::codec::WireVersion;
use crate::raft::snapshot::LeaderInstallSnapshotState;
use crate::raft::types::{LogIndex, ServerId};

/// Leader-side replication progress of one follower.
#[derive(Debug)]
pub struct PeerState {
    pub id: ServerId,
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    /// An AppendEntries carrying entries is waiting for its reply.
    pub replication_in_flight: bool,
    /// Leader tick at which the follower last answered.
    pub last_heard_tick: u64,
    /// Set while the follower receives a snapshot instead of entries.
    pub install: Option<LeaderInstallSnapshotState>,
}

impl PeerState {
    pub fn new(id: ServerId, last_index: LogIndex, tick: u64) -> Self {
        PeerState {
            id,
            next_index: last_index + 1,
            match_index: 0,
            replication_in_flight: false,
            last_heard_tick: tick,
            install: None,
        }
    }

    /// Record acknowledged progress. Match never moves backwards.
    pub fn matched(&mut self, index: LogIndex) -> bool {
        let advanced = index > self.match_index;
        if advanced {
            self.match_index = index;
        }
        self.next_index = self.next_index.max(self.match_index + 1);
        advanced
    }

    pub fn is_active(&self, tick: u64, window: u64) -> bool {
        tick.saturating_sub(self.last_heard_tick) <= window
    }

    pub fn is_installing(&self) -> bool {
        self.install.is_some()
    }
}

/// Wire version to use towards a peer that advertised `advertised`, or V1
/// when it has not said anything yet.
pub fn send_version(advertised: Option<u8>) -> WireVersion {
    advertised.map_or(WireVersion::PRIOR, WireVersion::negotiate)
}
