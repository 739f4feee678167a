//! Leader side: replication, commit, heartbeats, membership changes and
//! leadership transfer.

use std::collections::{BTreeMap, VecDeque};

use slog::{debug, info, warn};
use tokio::sync::oneshot;

use crate::error::{RaftError, StorageError};
use crate::raft::actor::{PendingTransfer, RaftActor, TransferRequest};
use crate::raft::behavior::{Behavior, LeaderState};
use crate::raft::membership::{
    plan, Phase, Plan, ServerChangeRequest, ServerChangeStatus,
};
use crate::raft::messages::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, RaftRpc, TimeoutNow,
    INVALID_CHUNK_INDEX,
};
use crate::raft::peer::PeerState;
use crate::raft::proposal::Proposal;
use crate::raft::registry::PayloadKind;
use crate::raft::snapshot::{ChunkAck, LeaderInstallSnapshotState};
use crate::raft::timer::TimerKind;
use crate::raft::types::{
    ClusterConfig, Command, LogIndex, RaftRole, ServerId, ServerInfo,
};
use crate::raft::StateMachine;

impl<S: StateMachine> RaftActor<S> {
    pub(crate) fn become_leader(&mut self) -> Result<(), StorageError> {
        let last_index = self.log.last_index();
        let peers: BTreeMap<ServerId, PeerState> = self
            .cluster
            .servers()
            .filter(|s| s.id != self.id)
            .map(|s| (s.id, PeerState::new(s.id, last_index, 0)))
            .collect();
        info!(self.logger, "won election";
            "term" => self.term_info.term, "peers" => peers.len());

        self.behavior = Behavior::Leader(LeaderState {
            peers,
            tick: 0,
            noop_index: 0,
            queued: VecDeque::new(),
        });
        self.install = None;
        self.timers.cancel(TimerKind::Election);
        self.set_role(RaftRole::PreLeader);
        self.set_leader(Some(self.id));

        let noop_index = self.append_local(Command::Noop)?;
        if let Behavior::Leader(leader) = &mut self.behavior {
            leader.noop_index = noop_index;
        }
        self.arm_heartbeat_timer();
        self.replicate_all();
        self.advance_commit()
    }

    /// Leadership is established once the entry appended on election commits.
    pub(crate) fn establish_leadership(&mut self) -> Result<(), StorageError> {
        let Behavior::Leader(leader) = &mut self.behavior else {
            return Ok(());
        };
        if self.log.commit_index() < leader.noop_index {
            return Ok(());
        }
        let queued = std::mem::take(&mut leader.queued);
        self.set_role(RaftRole::Leader);
        info!(self.logger, "leadership established";
            "term" => self.term_info.term,
            "commit_index" => self.log.commit_index(),
            "queued" => queued.len());

        if queued.is_empty() {
            return Ok(());
        }
        for proposal in queued {
            self.append_proposal(proposal)?;
        }
        self.replicate_all();
        self.advance_commit()
    }

    pub(crate) fn propose(&mut self, proposal: Proposal) -> Result<(), StorageError> {
        let tag = proposal.payload.tag;
        if !matches!(
            self.codec.registry().lookup(tag),
            Ok(PayloadKind::Application(_))
        ) {
            proposal.reject(RaftError::InvalidPayload { tag });
            return Ok(());
        }
        let Behavior::Leader(leader) = &mut self.behavior else {
            proposal.reject(RaftError::NotLeader {
                leader: self.leader_id,
            });
            return Ok(());
        };
        if self.transfer.is_some() {
            proposal.reject(RaftError::LeadershipTransferInProgress);
            return Ok(());
        }
        if self.role == RaftRole::PreLeader {
            leader.queued.push_back(proposal);
            return Ok(());
        }
        self.append_proposal(proposal)?;
        self.replicate_all();
        self.advance_commit()
    }

    fn append_proposal(&mut self, proposal: Proposal) -> Result<(), StorageError> {
        let index = match self.append_local(Command::Application(proposal.payload.clone())) {
            Ok(index) => index,
            Err(e) => {
                proposal.reject(RaftError::Halted {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        debug!(self.logger, "appended proposal"; "id" => %proposal.id, "index" => index);
        self.trackers.track(proposal, index, self.term_info.term);
        Ok(())
    }

    // -- replication --

    pub(crate) fn replicate_all(&mut self) {
        let peers: Vec<ServerId> = match &self.behavior {
            Behavior::Leader(leader) => leader.peers.keys().copied().collect(),
            _ => return,
        };
        for peer in peers {
            self.send_append(peer, false);
        }
    }

    /// Send the next batch of entries to `peer_id`, or start a snapshot
    /// transfer when the entries it needs were compacted. A heartbeat always
    /// sends something so that the follower hears from us.
    pub(crate) fn send_append(&mut self, peer_id: ServerId, heartbeat: bool) {
        let term = self.term_info.term;
        let leader_id = self.id;
        let snapshot_index = self.log.snapshot_index();
        let Behavior::Leader(leader) = &mut self.behavior else {
            return;
        };
        let Some(peer) = leader.peers.get_mut(&peer_id) else {
            return;
        };

        let installing = peer.install.as_ref().map(|i| i.snapshot().clone());
        let rpc = if let Some(snapshot) = installing {
            if !heartbeat {
                return;
            }
            AppendEntries {
                term,
                leader_id,
                prev_log_index: snapshot.last_included_index,
                prev_log_term: snapshot.last_included_term,
                entries: Vec::new(),
                leader_commit: self.log.commit_index(),
            }
        } else if peer.next_index <= snapshot_index {
            let Some(snapshot) = self.snapshots.latest() else {
                warn!(self.logger, "no snapshot to send"; "peer" => peer_id);
                return;
            };
            info!(self.logger, "sending snapshot";
                "peer" => peer_id,
                "next_index" => peer.next_index,
                "snapshot_index" => snapshot.last_included_index);
            peer.install = Some(LeaderInstallSnapshotState::new(
                snapshot,
                self.config.snapshot_chunk_size,
            ));
            peer.replication_in_flight = false;
            self.send_snapshot_chunk(peer_id);
            return;
        } else {
            if peer.replication_in_flight && !heartbeat {
                return;
            }
            let prev_log_index = peer.next_index - 1;
            let entries = if peer.replication_in_flight {
                Vec::new()
            } else {
                self.log.slice(
                    peer.next_index,
                    self.config.max_entries_per_append,
                    self.config.max_append_bytes,
                )
            };
            if !entries.is_empty() {
                peer.replication_in_flight = true;
            }
            AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
                entries,
                leader_commit: self.log.commit_index(),
            }
        };
        self.send(peer_id, RaftRpc::AppendEntries(rpc));
    }

    fn send_snapshot_chunk(&mut self, peer_id: ServerId) {
        let term = self.term_info.term;
        let leader_id = self.id;
        let Behavior::Leader(leader) = &mut self.behavior else {
            return;
        };
        let Some(install) = leader
            .peers
            .get_mut(&peer_id)
            .and_then(|p| p.install.as_mut())
        else {
            return;
        };
        let (chunk_index, data, last_chunk_hash_code) = install.current_chunk();
        let snapshot = install.snapshot();
        let rpc = InstallSnapshot {
            term,
            leader_id,
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            data,
            chunk_index,
            total_chunks: install.total_chunks(),
            last_chunk_hash_code,
            server_config: snapshot.cluster_config.clone(),
        };
        self.send(peer_id, RaftRpc::InstallSnapshot(rpc));
    }

    pub(crate) fn handle_append_entries_reply(
        &mut self,
        m: AppendEntriesReply,
    ) -> Result<(), StorageError> {
        if m.term < self.term_info.term {
            return Ok(());
        }
        let last_index = self.log.last_index();
        let snapshot_index = self.log.snapshot_index();
        let Behavior::Leader(leader) = &mut self.behavior else {
            return Ok(());
        };
        let tick = leader.tick;
        let Some(peer) = leader.peers.get_mut(&m.follower_id) else {
            return Ok(());
        };
        peer.last_heard_tick = tick;
        peer.replication_in_flight = false;
        if peer.is_installing() {
            return Ok(());
        }

        if m.success {
            peer.matched(m.log_last_index);
            peer.next_index = (m.log_last_index + 1).max(peer.match_index + 1);
        } else if m.force_install_snapshot && snapshot_index > 0 {
            debug!(self.logger, "follower asked for a snapshot"; "peer" => m.follower_id);
            peer.next_index = snapshot_index;
        } else {
            let next = peer.next_index;
            let (fl, ft) = (m.log_last_index, m.log_last_term);
            let retry = if fl < snapshot_index {
                fl + 1
            } else {
                match self.log.term_at(fl) {
                    Some(t) if t == ft && fl < last_index => fl + 1,
                    Some(t) if t != ft => fl,
                    _ => next - 1,
                }
            };
            peer.next_index = retry
                .min(next.saturating_sub(1))
                .max(peer.match_index + 1)
                .max(1);
            debug!(self.logger, "follower log mismatch";
                "peer" => m.follower_id,
                "follower_last_index" => fl,
                "next_index" => peer.next_index);
        }
        let pending = peer.next_index <= last_index;

        if m.success {
            self.check_catchup(m.follower_id)?;
            self.check_transfer(m.follower_id);
            self.advance_commit()?;
        }
        if pending {
            self.send_append(m.follower_id, false);
        }
        Ok(())
    }

    pub(crate) fn handle_install_snapshot_reply(
        &mut self,
        m: InstallSnapshotReply,
    ) -> Result<(), StorageError> {
        if m.term < self.term_info.term {
            return Ok(());
        }
        let max_retries = self.config.snapshot_chunk_max_retries;
        let Behavior::Leader(leader) = &mut self.behavior else {
            return Ok(());
        };
        let tick = leader.tick;
        let Some(peer) = leader.peers.get_mut(&m.follower_id) else {
            return Ok(());
        };
        peer.last_heard_tick = tick;
        let Some(install) = peer.install.as_mut() else {
            return Ok(());
        };

        if m.chunk_index == INVALID_CHUNK_INDEX {
            warn!(self.logger, "follower rejected snapshot chunk, restarting transfer";
                "peer" => m.follower_id, "chunk" => install.chunk_index());
            install.reset();
        } else if !m.success {
            if install.chunk_failed(max_retries) {
                warn!(self.logger, "snapshot chunk failed too often, restarting transfer";
                    "peer" => m.follower_id);
            }
        } else {
            match install.chunk_acked(m.chunk_index) {
                ChunkAck::Next => {}
                ChunkAck::Stale => return Ok(()),
                ChunkAck::Done => {
                    let index = install.snapshot().last_included_index;
                    peer.install = None;
                    peer.matched(index);
                    peer.next_index = index + 1;
                    info!(self.logger, "follower installed snapshot";
                        "peer" => m.follower_id, "index" => index);
                    self.check_catchup(m.follower_id)?;
                    self.check_transfer(m.follower_id);
                    self.advance_commit()?;
                    self.send_append(m.follower_id, false);
                    return Ok(());
                }
            }
        }
        self.send_snapshot_chunk(m.follower_id);
        Ok(())
    }

    /// Commit the highest index stored on a quorum of voters, provided it
    /// belongs to the current term.
    pub(crate) fn advance_commit(&mut self) -> Result<(), StorageError> {
        let Behavior::Leader(leader) = &self.behavior else {
            return Ok(());
        };
        let last_index = self.log.last_index();
        let mut matched: Vec<LogIndex> = self
            .cluster
            .voting_members()
            .map(|id| {
                if id == self.id {
                    last_index
                } else {
                    leader.peers.get(&id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        let quorum = self.cluster.quorum();
        if matched.len() < quorum {
            return Ok(());
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[quorum - 1];
        if candidate <= self.log.commit_index()
            || self.log.term_at(candidate) != Some(self.term_info.term)
        {
            return Ok(());
        }
        if self.log.set_commit_index(candidate) {
            debug!(self.logger, "commit advanced"; "commit_index" => candidate);
            self.apply_committed()?;
        }
        Ok(())
    }

    pub(crate) fn on_heartbeat(&mut self) -> Result<(), StorageError> {
        let window = self.config.election_timeout_factor;
        let chunk_timeout = self.config.chunk_timeout_ticks();
        let max_retries = self.config.snapshot_chunk_max_retries;
        let Behavior::Leader(leader) = &mut self.behavior else {
            return Ok(());
        };
        leader.tick += 1;
        let tick = leader.tick;

        let mut resend = Vec::new();
        for peer in leader.peers.values_mut() {
            if let Some(install) = peer.install.as_mut() {
                if install.tick(chunk_timeout) {
                    if install.chunk_failed(max_retries) {
                        warn!(self.logger, "snapshot transfer timed out, restarting";
                            "peer" => peer.id);
                    }
                    resend.push(peer.id);
                }
            }
        }

        let active = self
            .cluster
            .voting_members()
            .filter(|id| *id != self.id)
            .filter(|id| leader.peers.get(id).map_or(false, |p| p.is_active(tick, window)))
            .count();
        let own_vote = usize::from(self.cluster.is_voting(self.id));
        let isolated = active + own_vote < self.cluster.quorum();
        let peers: Vec<ServerId> = leader.peers.keys().copied().collect();

        match self.role {
            RaftRole::Leader if isolated => {
                warn!(self.logger, "lost contact with a quorum"; "active_peers" => active);
                self.set_role(RaftRole::IsolatedLeader);
            }
            RaftRole::IsolatedLeader if !isolated => {
                info!(self.logger, "quorum contact restored"; "active_peers" => active);
                self.set_role(RaftRole::Leader);
            }
            _ => {}
        }

        for peer in resend {
            self.send_snapshot_chunk(peer);
        }
        for peer in peers {
            self.send_append(peer, true);
        }
        self.arm_heartbeat_timer();
        Ok(())
    }

    // -- membership --

    pub(crate) fn change_server(&mut self, request: ServerChangeRequest) -> Result<(), StorageError> {
        if !matches!(self.behavior, Behavior::Leader(_)) {
            request.respond(ServerChangeStatus::NoLeader);
            return Ok(());
        }
        self.membership.enqueue(request);
        self.next_server_change()
    }

    /// Start queued changes until one is running or the queue is empty.
    pub(crate) fn next_server_change(&mut self) -> Result<(), StorageError> {
        while !self.membership.is_busy()
            && matches!(self.behavior, Behavior::Leader(_))
            && self.role != RaftRole::PreLeader
        {
            let Some(request) = self.membership.next_queued() else {
                break;
            };
            self.start_server_change(request)?;
        }
        Ok(())
    }

    fn start_server_change(&mut self, request: ServerChangeRequest) -> Result<(), StorageError> {
        info!(self.logger, "server change requested"; "change" => ?request.change);
        match plan(request.change, &self.cluster, self.id) {
            Plan::Done(status) => {
                debug!(self.logger, "server change answered"; "status" => %status);
                request.respond(status);
            }
            Plan::CatchUp { target, voting } => {
                self.membership
                    .begin(request, Phase::CatchingUp { target, voting });
                self.arm_timer(TimerKind::ServerChange, self.config.server_change_timeout());
                let last_index = self.log.last_index();
                if let Behavior::Leader(leader) = &mut self.behavior {
                    let tick = leader.tick;
                    leader
                        .peers
                        .insert(target, PeerState::new(target, last_index, tick));
                }
                self.send_append(target, false);
            }
            Plan::Append(config) => {
                self.membership.begin(request, Phase::Committing { index: 0 });
                self.arm_timer(TimerKind::ServerChange, self.config.server_change_timeout());
                self.append_config(config)?;
            }
        }
        Ok(())
    }

    fn append_config(&mut self, config: ClusterConfig) -> Result<(), StorageError> {
        info!(self.logger, "appending cluster configuration"; "config" => %config);
        let index = self.append_local(Command::ClusterConfig(config))?;
        self.membership.set_phase(Phase::Committing { index });
        self.replicate_all();
        self.advance_commit()
    }

    /// Move a catching-up server into the configuration once it is close
    /// enough to the end of the log.
    fn check_catchup(&mut self, peer_id: ServerId) -> Result<(), StorageError> {
        let Some(Phase::CatchingUp { target, voting }) = self.membership.phase() else {
            return Ok(());
        };
        if target != peer_id {
            return Ok(());
        }
        let Behavior::Leader(leader) = &self.behavior else {
            return Ok(());
        };
        let matched = leader.peers.get(&target).map_or(0, |p| p.match_index);
        if matched + self.config.catchup_max_lag < self.log.last_index() {
            return Ok(());
        }
        info!(self.logger, "new server caught up"; "server" => target, "match_index" => matched);
        let config = self.cluster.with_server(ServerInfo { id: target, voting });
        self.append_config(config)
    }

    pub(crate) fn check_server_change_committed(&mut self) {
        if let Some(Phase::Committing { index }) = self.membership.phase() {
            if index > 0 && self.log.last_applied() >= index {
                info!(self.logger, "server change committed"; "index" => index);
                self.timers.cancel(TimerKind::ServerChange);
                self.membership.finish(ServerChangeStatus::Ok);
            }
        }
    }

    pub(crate) fn on_server_change_timeout(&mut self) -> Result<(), StorageError> {
        if let Some(target) = self.membership.catchup_target() {
            if let Behavior::Leader(leader) = &mut self.behavior {
                leader.peers.remove(&target);
            }
        }
        warn!(self.logger, "server change timed out"; "change" => ?self.membership.current_change());
        self.membership.time_out();
        Ok(())
    }

    // -- leadership transfer --

    pub(crate) fn transfer_leadership(&mut self, request: TransferRequest) -> Result<(), StorageError> {
        let TransferRequest { target, reply } = request;
        match self.transfer_target(target) {
            Ok(target) if target == self.id => {
                let _ = reply.send(Ok(()));
            }
            Ok(target) => self.begin_transfer(target, Some(reply)),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
        Ok(())
    }

    /// Check that leadership can be handed to `requested`, or pick the
    /// voting follower with the highest match index. Naming this server
    /// is accepted as a transfer with nothing to do.
    pub(crate) fn transfer_target(&self, requested: Option<ServerId>) -> Result<ServerId, RaftError> {
        let Behavior::Leader(leader) = &self.behavior else {
            return Err(RaftError::NotLeader {
                leader: self.leader_id,
            });
        };
        if self.role == RaftRole::PreLeader {
            return Err(RaftError::NotLeader { leader: None });
        }
        if self.transfer.is_some() {
            return Err(RaftError::LeadershipTransferInProgress);
        }

        let target = requested.or_else(|| {
            self.cluster
                .voting_members()
                .filter(|id| *id != self.id)
                .max_by_key(|id| leader.peers.get(id).map_or(0, |p| p.match_index))
        });
        match target {
            Some(id) if id == self.id => Ok(id),
            Some(id) if self.cluster.is_voting(id) && leader.peers.contains_key(&id) => Ok(id),
            Some(id) => Err(RaftError::LeadershipTransferFailed {
                reason: format!("server {} is not a voting peer", id),
            }),
            None => Err(RaftError::LeadershipTransferFailed {
                reason: "no voting follower to hand over to".to_owned(),
            }),
        }
    }

    pub(crate) fn begin_transfer(
        &mut self,
        target: ServerId,
        reply: Option<oneshot::Sender<Result<(), RaftError>>>,
    ) {
        info!(self.logger, "transferring leadership"; "target" => target);
        self.transfer = Some(PendingTransfer {
            target,
            timeout_now_sent: false,
            reply,
        });
        self.arm_timer(
            TimerKind::LeadershipTransfer,
            self.config.leadership_transfer_timeout(),
        );
        self.check_transfer(target);
        if matches!(&self.transfer, Some(t) if !t.timeout_now_sent) {
            self.send_append(target, false);
        }
    }

    /// Tell the transfer target to campaign once it holds our whole log.
    fn check_transfer(&mut self, peer_id: ServerId) {
        let last_index = self.log.last_index();
        let matched = match &self.behavior {
            Behavior::Leader(leader) => leader.peers.get(&peer_id).map_or(0, |p| p.match_index),
            _ => return,
        };
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        if transfer.target != peer_id || transfer.timeout_now_sent || matched < last_index {
            return;
        }
        transfer.timeout_now_sent = true;
        info!(self.logger, "transfer target caught up, sending timeout-now"; "target" => peer_id);
        let rpc = TimeoutNow {
            term: self.term_info.term,
            leader_id: self.id,
        };
        self.send(peer_id, RaftRpc::TimeoutNow(rpc));
    }

    pub(crate) fn on_transfer_timeout(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            warn!(self.logger, "leadership transfer timed out"; "target" => transfer.target);
            let reason = format!("server {} did not take over in time", transfer.target);
            self.complete_transfer(transfer, Err(RaftError::LeadershipTransferFailed { reason }));
        }
    }

    /// Report the outcome of a transfer. A stopping instance stops now; a
    /// leader that is no longer a voter steps down even when no follower
    /// took over.
    pub(crate) fn complete_transfer(&mut self, transfer: PendingTransfer, result: Result<(), RaftError>) {
        let failed = result.is_err();
        if let Some(reply) = transfer.reply {
            let _ = reply.send(result);
        }
        if self.is_stopping() {
            self.shutdown();
            return;
        }
        if failed && matches!(self.behavior, Behavior::Leader(_)) && !self.cluster.is_voting(self.id) {
            info!(self.logger, "no longer a voting member, stepping down");
            self.become_follower(None);
        }
    }
}
