use slog::{debug, error, info, warn};

use crate::error::StorageError;
use crate::metrics;
use crate::raft::actor::RaftActor;
use crate::raft::behavior::Behavior;
use crate::raft::messages::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, RaftRpc,
    FIRST_CHUNK_INDEX, INVALID_CHUNK_INDEX,
};
use crate::raft::snapshot::SnapshotTracker;
use crate::raft::types::{LogIndex, ServerId, Snapshot, Term};
use crate::raft::StateMachine;

impl<S: StateMachine> RaftActor<S> {
    /// A message from the leader of the current term arrived.
    fn follow(&mut self, leader: ServerId) {
        if matches!(self.behavior, Behavior::Follower) {
            self.set_leader(Some(leader));
            self.arm_election_timer();
        } else {
            self.become_follower(Some(leader));
        }
    }

    pub(crate) fn handle_append_entries(&mut self, m: AppendEntries) -> Result<(), StorageError> {
        if m.term < self.term_info.term {
            debug!(self.logger, "rejecting append from stale leader";
                "leader" => m.leader_id, "term" => m.term);
            self.reply_append(m.leader_id, false, self.log.last_index(), false);
            return Ok(());
        }
        self.follow(m.leader_id);

        let prev = m.prev_log_index;
        let snapshot_index = self.log.snapshot_index();
        let consistent = prev < snapshot_index || self.log.term_at(prev) == Some(m.prev_log_term);
        if !consistent {
            let last_index = self.log.last_index();
            debug!(self.logger, "log mismatch";
                "prev_log_index" => prev,
                "prev_log_term" => m.prev_log_term,
                "last_index" => last_index);
            let force = last_index == 0 && prev > 0;
            self.reply_append(m.leader_id, false, last_index, force);
            return Ok(());
        }

        let verified = (prev + m.entries.len() as LogIndex).max(snapshot_index);
        let mut fresh = Vec::new();
        for entry in m.entries {
            if entry.index <= snapshot_index {
                continue;
            }
            if fresh.is_empty() {
                match self.log.term_at(entry.index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        if !self.remove_conflicting(entry.index)? {
                            let last_index = self.log.last_index();
                            self.reply_append(m.leader_id, false, last_index, false);
                            return Ok(());
                        }
                    }
                    None => {}
                }
            }
            fresh.push(entry);
        }
        if !fresh.is_empty() {
            self.storage.append_entries(&fresh)?;
            for entry in fresh {
                if let Err(e) = self.log.append(entry) {
                    error!(self.logger, "append from leader rejected"; "error" => %e);
                    break;
                }
            }
        }

        if self.log.set_commit_index(m.leader_commit.min(verified)) {
            self.apply_committed()?;
        }
        self.reply_append(m.leader_id, true, verified, false);
        Ok(())
    }

    /// Drop entries from `index` on. Returns false when they are committed.
    fn remove_conflicting(&mut self, index: LogIndex) -> Result<bool, StorageError> {
        match self.log.truncate_from(index) {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!(self.logger, "removing conflicting entries";
                        "from" => index, "count" => removed.len());
                    self.storage.truncate_from(index)?;
                    self.trackers.truncated(index);
                }
                Ok(true)
            }
            Err(e) => {
                error!(self.logger, "leader conflicts with committed entry, refusing append"; "error" => %e);
                Ok(false)
            }
        }
    }

    fn reply_append(&mut self, leader: ServerId, success: bool, last_index: LogIndex, force: bool) {
        let reply = AppendEntriesReply {
            term: self.term_info.term,
            follower_id: self.id,
            success,
            log_last_index: last_index,
            log_last_term: self.log.term_at(last_index).unwrap_or(0),
            force_install_snapshot: force,
            raft_version: self.current_version(),
        };
        self.send(leader, RaftRpc::AppendEntriesReply(reply));
    }

    pub(crate) fn handle_install_snapshot(&mut self, m: InstallSnapshot) -> Result<(), StorageError> {
        if m.term < self.term_info.term {
            self.reply_chunk(m.leader_id, m.chunk_index, false);
            return Ok(());
        }
        self.follow(m.leader_id);

        let (index, term) = (m.last_included_index, m.last_included_term);
        let restart = match &self.install {
            None => true,
            Some(tracker) => {
                !tracker.matches(m.leader_id, index, term)
                    || (m.chunk_index == FIRST_CHUNK_INDEX
                        && tracker.last_chunk_index() > FIRST_CHUNK_INDEX)
            }
        };
        if restart {
            debug!(self.logger, "receiving snapshot";
                "leader" => m.leader_id, "index" => index, "chunks" => m.total_chunks);
            self.install = Some(SnapshotTracker::new(m.leader_id, index, term, m.total_chunks));
        }
        let Some(tracker) = self.install.as_mut() else {
            return Ok(());
        };
        if m.chunk_index == tracker.last_chunk_index() {
            self.reply_chunk(m.leader_id, m.chunk_index, true);
            return Ok(());
        }

        match tracker.add_chunk(m.chunk_index, &m.data, m.last_chunk_hash_code) {
            Ok(false) => self.reply_chunk(m.leader_id, m.chunk_index, true),
            Ok(true) => {
                if let Some(tracker) = self.install.take() {
                    self.complete_install(tracker.into_snapshot(m.server_config))?;
                }
                self.reply_chunk(m.leader_id, m.chunk_index, true);
            }
            Err(e) => {
                warn!(self.logger, "snapshot chunk rejected"; "error" => %e);
                self.install = None;
                self.reply_chunk(m.leader_id, INVALID_CHUNK_INDEX, false);
            }
        }
        Ok(())
    }

    fn reply_chunk(&mut self, leader: ServerId, chunk_index: u32, success: bool) {
        let reply = InstallSnapshotReply {
            term: self.term_info.term,
            follower_id: self.id,
            chunk_index,
            success,
        };
        self.send(leader, RaftRpc::InstallSnapshotReply(reply));
    }

    fn complete_install(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        let index: LogIndex = snapshot.last_included_index;
        let term: Term = snapshot.last_included_term;
        if index <= self.log.commit_index() {
            debug!(self.logger, "snapshot already covered by commit"; "index" => index);
            return Ok(());
        }

        self.state_machine
            .restore_snapshot(index, term, &snapshot.state);
        let keeps_suffix = self.log.term_at(index) == Some(term);
        self.log.install_snapshot(index, term);
        self.trackers.superseded(index);
        if !keeps_suffix {
            self.storage.truncate_from(index + 1)?;
            self.trackers.truncated(index + 1);
        }
        self.storage.save_snapshot(&snapshot)?;
        if let Some(config) = &snapshot.cluster_config {
            self.cluster = config.clone();
        }
        self.storage
            .persist_commit(self.log.commit_index())?;

        info!(self.logger, "installed snapshot from leader";
            "index" => index, "term" => term, "bytes" => snapshot.state.len(),
            "kept_suffix" => keeps_suffix, "cluster" => %self.cluster);
        self.snapshots.record(snapshot);
        metrics::RAFT_SNAPSHOTS
            .with_label_values(&[self.member_label(), "installed"])
            .inc();
        Ok(())
    }
}
