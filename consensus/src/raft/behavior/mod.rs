//! Role-specific message handling
//!
//! The handlers are `impl` blocks on [`RaftActor`] split by role. What a
//! role keeps between events lives in [`Behavior`].

use std::collections::{BTreeMap, HashSet, VecDeque};

use slog::{debug, info};

use crate::error::{RaftError, StorageError};
use crate::raft::actor::RaftActor;
use crate::raft::membership::ServerChangeStatus;
use crate::raft::messages::{RaftRpc, RequestVote, RequestVoteReply, TimeoutNow};
use crate::raft::peer::PeerState;
use crate::raft::proposal::Proposal;
use crate::raft::timer::TimerKind;
use crate::raft::types::{LogIndex, RaftRole, ServerId, TermInfo};
use crate::raft::StateMachine;

mod candidate;
mod follower;
mod leader;

pub(crate) enum Behavior {
    Follower,
    Candidate(CandidateState),
    /// Covers PreLeader, Leader and IsolatedLeader; the role tells them apart.
    Leader(LeaderState),
}

#[derive(Default)]
pub(crate) struct CandidateState {
    pub(crate) votes: HashSet<ServerId>,
}

pub(crate) struct LeaderState {
    pub(crate) peers: BTreeMap<ServerId, PeerState>,
    /// Heartbeat ticks since leadership began.
    pub(crate) tick: u64,
    /// Index of the entry appended on election; leadership is established
    /// once it commits.
    pub(crate) noop_index: LogIndex,
    /// Proposals received before leadership was established.
    pub(crate) queued: VecDeque<Proposal>,
}

impl<S: StateMachine> RaftActor<S> {
    pub(crate) fn become_follower(&mut self, leader: Option<ServerId>) {
        let previous = std::mem::replace(&mut self.behavior, Behavior::Follower);
        if let Behavior::Leader(state) = previous {
            info!(self.logger, "stepping down"; "term" => self.term_info.term);
            for proposal in state.queued {
                proposal.reject(RaftError::NotLeader { leader });
            }
            self.timers.cancel(TimerKind::Heartbeat);
            self.timers.cancel(TimerKind::ServerChange);
            self.membership.abort_all(ServerChangeStatus::NoLeader);
        }
        self.set_role(RaftRole::Follower);
        self.set_leader(leader);
        self.arm_election_timer();
    }

    /// Record who leads the current term. Seeing another server lead
    /// completes a pending leadership transfer.
    pub(crate) fn set_leader(&mut self, leader: Option<ServerId>) {
        if self.leader_id != leader {
            debug!(self.logger, "leader changed"; "leader" => ?leader, "term" => self.term_info.term);
            self.leader_id = leader;
        }
        if let Some(leader) = leader.filter(|l| *l != self.id) {
            if let Some(transfer) = self.transfer.take() {
                info!(self.logger, "leadership transferred";
                    "target" => transfer.target, "new_leader" => leader);
                self.timers.cancel(TimerKind::LeadershipTransfer);
                self.complete_transfer(transfer, Ok(()));
            }
        }
    }

    pub(crate) fn handle_request_vote(&mut self, m: RequestVote) -> Result<(), StorageError> {
        let current = self.term_info;
        let up_to_date =
            (m.last_log_term, m.last_log_index) >= (self.log.last_term(), self.log.last_index());
        let free = current.voted_for.map_or(true, |v| v == m.candidate_id);
        let grant = m.term == current.term && free && up_to_date;

        if grant {
            if current.voted_for.is_none() {
                self.term_info = TermInfo::with_vote(current.term, m.candidate_id);
                self.storage.persist_term_info(&self.term_info)?;
            }
            info!(self.logger, "granted vote";
                "candidate" => m.candidate_id, "term" => current.term);
            self.arm_election_timer();
        } else {
            debug!(self.logger, "refused vote";
                "candidate" => m.candidate_id,
                "term" => m.term,
                "voted_for" => ?current.voted_for,
                "up_to_date" => up_to_date);
        }

        let reply = RequestVoteReply {
            term: self.term_info.term,
            voter_id: self.id,
            vote_granted: grant,
            raft_version: self.current_version(),
        };
        self.send(m.candidate_id, RaftRpc::RequestVoteReply(reply));
        Ok(())
    }

    pub(crate) fn handle_timeout_now(&mut self, m: TimeoutNow) -> Result<(), StorageError> {
        if m.term != self.term_info.term || matches!(self.behavior, Behavior::Leader(_)) {
            return Ok(());
        }
        if !self.cluster.is_voting(self.id) {
            debug!(self.logger, "ignoring timeout-now as a non-voting member"; "from" => m.leader_id);
            return Ok(());
        }
        info!(self.logger, "leader asked us to take over"; "from" => m.leader_id);
        self.start_election()
    }

    pub(crate) fn on_election_timeout(&mut self) -> Result<(), StorageError> {
        if matches!(self.behavior, Behavior::Leader(_)) {
            return Ok(());
        }
        if !self.cluster.is_voting(self.id) {
            self.arm_election_timer();
            return Ok(());
        }
        self.start_election()
    }

    /// Work that follows applying committed entries: establishing
    /// leadership, finishing membership changes, and leaving leadership once
    /// removed or demoted.
    pub(crate) fn after_apply(&mut self) -> Result<(), StorageError> {
        if !matches!(self.behavior, Behavior::Leader(_)) {
            return Ok(());
        }
        if self.role == RaftRole::PreLeader {
            self.establish_leadership()?;
        }
        self.check_server_change_committed();
        if !self.cluster.contains(self.id) {
            info!(self.logger, "removed from the cluster, stepping down");
            self.become_follower(None);
            return Ok(());
        }
        if !self.cluster.is_voting(self.id) {
            if self.transfer.is_none() {
                self.hand_over_after_demotion();
            }
            return Ok(());
        }
        self.next_server_change()
    }

    fn hand_over_after_demotion(&mut self) {
        match self.transfer_target(None) {
            Ok(target) => {
                info!(self.logger, "demoted to non-voting, handing over leadership"; "target" => target);
                self.begin_transfer(target, None);
            }
            Err(e) => {
                info!(self.logger, "demoted to non-voting, stepping down"; "reason" => %e);
                self.become_follower(None);
            }
        }
    }

    /// Reconcile leader peer tracking with the effective configuration.
    pub(crate) fn sync_peers(&mut self) {
        let catchup = self.membership.catchup_target();
        let last_index = self.log.last_index();
        let Behavior::Leader(leader) = &mut self.behavior else {
            return;
        };
        let tick = leader.tick;
        for server in self.cluster.servers() {
            if server.id != self.id {
                leader
                    .peers
                    .entry(server.id)
                    .or_insert_with(|| PeerState::new(server.id, last_index, tick));
            }
        }
        let cluster = &self.cluster;
        leader
            .peers
            .retain(|id, _| cluster.contains(*id) || Some(*id) == catchup);
    }
}
