//! The Raft instance
//!
//! [`RaftActor`] owns the replicated log, the term/vote record, the snapshot
//! manager and the current behavior, and reacts to one [`RaftEvent`] at a
//! time. It never blocks on the network: outgoing frames go to a
//! [`Transport`], timers are requested from a [`Scheduler`], and every
//! persistence step completes before the reply that depends on it is sent.
//!
//! A storage failure halts the instance. From then on it answers status
//! queries and fails every other request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use getset::{CopyGetters, Getters};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::oneshot;

use crate::config::RaftConfig;
use crate::error::{RaftError, StorageError};
use crate::metrics;
use crate::raft::behavior::Behavior;
use crate::raft::codec::{RaftCodec, WireVersion};
use crate::raft::log::ReplicatedLog;
use crate::raft::membership::{MembershipCoordinator, ServerChangeRequest, ServerChangeStatus};
use crate::raft::messages::RaftRpc;
use crate::raft::peer::send_version;
use crate::raft::proposal::{Proposal, RequestTrackers};
use crate::raft::registry::PayloadRegistry;
use crate::raft::snapshot::{CaptureState, SnapshotManager, SnapshotTracker};
use crate::raft::storage::RaftStorage;
use crate::raft::timer::{Scheduler, TimerGenerations, TimerKind, TimerMessage};
use crate::raft::types::*;
use crate::raft::StateMachine;
use crate::transport::Transport;

pub enum RaftEvent {
    /// Encoded message from a peer.
    Frame(Bytes),
    Timer(TimerMessage),
    Propose(Proposal),
    ChangeServer(ServerChangeRequest),
    TransferLeadership(TransferRequest),
    Status(oneshot::Sender<RaftStatus>),
    /// Stop the instance, handing leadership over first when leading.
    Shutdown(oneshot::Sender<()>),
}

pub struct TransferRequest {
    /// Server to hand leadership to; the most up-to-date follower if absent.
    pub target: Option<ServerId>,
    pub reply: oneshot::Sender<Result<(), RaftError>>,
}

impl TransferRequest {
    pub fn new(target: Option<ServerId>) -> (Self, oneshot::Receiver<Result<(), RaftError>>) {
        let (tx, rx) = oneshot::channel();
        (TransferRequest { target, reply: tx }, rx)
    }
}

pub(crate) struct PendingTransfer {
    pub(crate) target: ServerId,
    pub(crate) timeout_now_sent: bool,
    /// Absent for transfers started on shutdown or demotion.
    pub(crate) reply: Option<oneshot::Sender<Result<(), RaftError>>>,
}

/// Identity and tuning of an instance.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub id: ServerId,
    pub config: RaftConfig,
    /// Membership used until a snapshot or committed entry says otherwise.
    pub bootstrap: ClusterConfig,
    pub registry: Arc<PayloadRegistry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct RaftStatus {
    #[getset(get_copy = "pub")]
    id: ServerId,
    #[getset(get_copy = "pub")]
    role: RaftRole,
    #[getset(get_copy = "pub")]
    term: Term,
    #[getset(get_copy = "pub")]
    leader_id: Option<ServerId>,
    #[getset(get_copy = "pub")]
    commit_index: LogIndex,
    #[getset(get_copy = "pub")]
    last_applied: LogIndex,
    #[getset(get_copy = "pub")]
    last_index: LogIndex,
    #[getset(get_copy = "pub")]
    snapshot_index: LogIndex,
    #[getset(get = "pub")]
    cluster: ClusterConfig,
    #[getset(get = "pub")]
    halted: Option<String>,
}

pub struct RaftActor<S: StateMachine> {
    pub(crate) id: ServerId,
    pub(crate) config: RaftConfig,
    pub(crate) logger: Logger,
    pub(crate) codec: RaftCodec,
    pub(crate) storage: Box<dyn RaftStorage>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) scheduler: Box<dyn Scheduler>,
    pub(crate) state_machine: S,
    pub(crate) rng: StdRng,
    member_label: String,

    pub(crate) role: RaftRole,
    pub(crate) term_info: TermInfo,
    pub(crate) leader_id: Option<ServerId>,
    pub(crate) log: ReplicatedLog,
    pub(crate) cluster: ClusterConfig,
    pub(crate) peer_versions: HashMap<ServerId, u8>,

    pub(crate) timers: TimerGenerations,
    pub(crate) behavior: Behavior,
    pub(crate) trackers: RequestTrackers,
    pub(crate) snapshots: SnapshotManager,
    pub(crate) install: Option<SnapshotTracker>,
    pub(crate) membership: MembershipCoordinator,
    pub(crate) transfer: Option<PendingTransfer>,
    pub(crate) halted: Option<String>,
    /// Answered once the instance stops.
    stopping: Option<oneshot::Sender<()>>,
    stopped: bool,
}

impl<S: StateMachine> RaftActor<S> {
    /// Build an instance from what `storage` holds: restore the latest
    /// snapshot, reload the log and re-apply committed entries.
    pub fn new(
        options: RaftOptions,
        mut storage: Box<dyn RaftStorage>,
        transport: Arc<dyn Transport>,
        scheduler: Box<dyn Scheduler>,
        mut state_machine: S,
        logger: &Logger,
    ) -> Result<Self, RaftError> {
        options.config.validate()?;
        let id = options.id;
        let logger = logger.new(o!("tag" => format!("peer_{}", id)));
        let halted = |e: StorageError| RaftError::Halted {
            reason: e.to_string(),
        };

        let recovered = storage.recover().map_err(halted)?;
        let mut cluster = options.bootstrap;
        let mut log = match &recovered.snapshot {
            Some(snapshot) => {
                state_machine.restore_snapshot(
                    snapshot.last_included_index,
                    snapshot.last_included_term,
                    &snapshot.state,
                );
                if let Some(config) = &snapshot.cluster_config {
                    cluster = config.clone();
                }
                ReplicatedLog::from_snapshot(
                    snapshot.last_included_index,
                    snapshot.last_included_term,
                )
            }
            None => ReplicatedLog::new(),
        };
        for entry in recovered.entries {
            log.append(entry).map_err(|e| RaftError::Halted {
                reason: format!("recovered log is inconsistent: {}", e),
            })?;
        }
        log.set_commit_index(recovered.commit_index);

        let rng = match options.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ id),
            None => StdRng::from_entropy(),
        };

        let mut actor = RaftActor {
            id,
            codec: RaftCodec::new(options.registry),
            config: options.config,
            logger,
            storage,
            transport,
            scheduler,
            state_machine,
            rng,
            member_label: format!("member-{}", id),
            role: RaftRole::Follower,
            term_info: recovered.term_info,
            leader_id: None,
            log,
            cluster,
            peer_versions: HashMap::new(),
            timers: TimerGenerations::default(),
            behavior: Behavior::Follower,
            trackers: RequestTrackers::default(),
            snapshots: SnapshotManager::new(recovered.snapshot),
            install: None,
            membership: MembershipCoordinator::default(),
            transfer: None,
            halted: None,
            stopping: None,
            stopped: false,
        };

        info!(actor.logger, "raft instance recovered";
            "term" => actor.term_info.term,
            "voted_for" => ?actor.term_info.voted_for,
            "last_index" => actor.log.last_index(),
            "commit_index" => actor.log.commit_index(),
            "cluster" => %actor.cluster);
        actor.apply_committed().map_err(halted)?;
        Ok(actor)
    }

    /// Arm the initial timers.
    pub fn start(&mut self) {
        self.arm_election_timer();
        self.arm_snapshot_timer();
        self.update_gauges();
    }

    pub fn handle(&mut self, event: RaftEvent) {
        if self.stopped {
            self.reject(event, RaftError::Stopped);
            return;
        }
        if let Some(reason) = &self.halted {
            let err = RaftError::Halted {
                reason: reason.clone(),
            };
            match event {
                RaftEvent::Shutdown(reply) => self.begin_shutdown(reply),
                event => self.reject(event, err),
            }
            return;
        }

        let result = match event {
            RaftEvent::Frame(frame) => self.handle_frame(frame),
            RaftEvent::Timer(timer) => self.handle_timer(timer),
            RaftEvent::Propose(proposal) => self.propose(proposal),
            RaftEvent::ChangeServer(request) => self.change_server(request),
            RaftEvent::TransferLeadership(request) => self.transfer_leadership(request),
            RaftEvent::Status(tx) => {
                let _ = tx.send(self.status());
                Ok(())
            }
            RaftEvent::Shutdown(reply) => {
                self.begin_shutdown(reply);
                Ok(())
            }
        };
        if let Err(err) = result {
            self.halt(err);
        }
        self.update_gauges();
    }

    /// Answer `event` without acting on it.
    fn reject(&self, event: RaftEvent, err: RaftError) {
        match event {
            RaftEvent::Propose(p) => p.reject(err),
            RaftEvent::ChangeServer(r) => r.respond(ServerChangeStatus::NoLeader),
            RaftEvent::TransferLeadership(r) => {
                let _ = r.reply.send(Err(err));
            }
            RaftEvent::Status(tx) => {
                let _ = tx.send(self.status());
            }
            RaftEvent::Shutdown(reply) => {
                let _ = reply.send(());
            }
            RaftEvent::Frame(_) | RaftEvent::Timer(_) => {}
        }
    }

    fn handle_frame(&mut self, frame: Bytes) -> Result<(), StorageError> {
        let (version, rpc) = match self.codec.decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(self.logger, "dropping undecodable frame"; "error" => %e);
                return Ok(());
            }
        };
        metrics::RAFT_RPC_RECEIVED
            .with_label_values(&[rpc.name()])
            .inc();

        let from = rpc.sender();
        self.note_version(from, version as u8);
        match &rpc {
            RaftRpc::RequestVoteReply(m) => self.note_version(from, m.raft_version),
            RaftRpc::AppendEntriesReply(m) => self.note_version(from, m.raft_version),
            _ => {}
        }

        if rpc.term() > self.term_info.term {
            info!(self.logger, "observed higher term";
                "term" => rpc.term(), "from" => from, "message" => rpc.name());
            self.update_term(rpc.term())?;
            let leader = match &rpc {
                RaftRpc::AppendEntries(m) => Some(m.leader_id),
                RaftRpc::InstallSnapshot(m) => Some(m.leader_id),
                _ => None,
            };
            self.become_follower(leader);
        }

        match rpc {
            RaftRpc::RequestVote(m) => self.handle_request_vote(m),
            RaftRpc::RequestVoteReply(m) => self.handle_vote_reply(m),
            RaftRpc::AppendEntries(m) => self.handle_append_entries(m),
            RaftRpc::AppendEntriesReply(m) => self.handle_append_entries_reply(m),
            RaftRpc::InstallSnapshot(m) => self.handle_install_snapshot(m),
            RaftRpc::InstallSnapshotReply(m) => self.handle_install_snapshot_reply(m),
            RaftRpc::TimeoutNow(m) => self.handle_timeout_now(m),
        }
    }

    fn handle_timer(&mut self, timer: TimerMessage) -> Result<(), StorageError> {
        if !self.timers.is_current(&timer) {
            return Ok(());
        }
        match timer.kind {
            TimerKind::Election => self.on_election_timeout(),
            TimerKind::Heartbeat => self.on_heartbeat(),
            TimerKind::SnapshotInterval => {
                self.arm_snapshot_timer();
                self.maybe_capture_snapshot(true)
            }
            TimerKind::ServerChange => self.on_server_change_timeout(),
            TimerKind::LeadershipTransfer => {
                self.on_transfer_timeout();
                Ok(())
            }
        }
    }

    fn note_version(&mut self, peer: ServerId, version: u8) {
        let known = self.peer_versions.entry(peer).or_insert(version);
        if version > *known {
            *known = version;
        }
    }

    pub(crate) fn send(&mut self, to: ServerId, rpc: RaftRpc) {
        let version = send_version(self.peer_versions.get(&to).copied());
        metrics::RAFT_RPC_SENT.with_label_values(&[rpc.name()]).inc();
        let frame = self.codec.encode(&rpc, version);
        self.transport.send(to, frame);
    }

    pub(crate) fn current_version(&self) -> u8 {
        WireVersion::CURRENT as u8
    }

    // -- durable state --

    /// Advance to `term`, clearing the vote.
    pub(crate) fn update_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.term_info = TermInfo::new(term);
        self.storage.persist_term_info(&self.term_info)
    }

    /// Append an entry created by this leader.
    pub(crate) fn append_local(&mut self, command: Command) -> Result<LogIndex, StorageError> {
        let entry = LogEntry::new(self.log.last_index() + 1, self.term_info.term, command);
        let index = entry.index;
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        if let Err(e) = self.log.append(entry) {
            error!(self.logger, "local append rejected"; "error" => %e);
        }
        Ok(index)
    }

    /// Apply every committed entry not applied yet.
    pub(crate) fn apply_committed(&mut self) -> Result<(), StorageError> {
        let commit_index = self.log.commit_index();
        if self.log.last_applied() >= commit_index {
            return Ok(());
        }
        while self.log.last_applied() < commit_index {
            let index = self.log.last_applied() + 1;
            let (term, output, config) = {
                let Some(entry) = self.log.get(index) else {
                    error!(self.logger, "committed entry missing from log"; "index" => index);
                    break;
                };
                match &entry.command {
                    Command::Noop => (entry.term, Vec::new(), None),
                    Command::ClusterConfig(config) => (entry.term, Vec::new(), Some(config.clone())),
                    Command::Application(payload) => (
                        entry.term,
                        self.state_machine.apply_committed(index, payload),
                        None,
                    ),
                }
            };
            if let Some(config) = config {
                self.apply_cluster_config(index, config);
            }
            self.log.set_last_applied(index);
            self.trackers.applied(index, term, output);
        }
        self.storage.persist_commit(self.log.commit_index())?;
        self.after_apply()?;
        self.maybe_capture_snapshot(false)
    }

    fn apply_cluster_config(&mut self, index: LogIndex, config: ClusterConfig) {
        info!(self.logger, "cluster configuration committed";
            "index" => index, "from" => %self.cluster, "to" => %config);
        let removed: Vec<ServerId> = match &self.behavior {
            Behavior::Leader(leader) => leader
                .peers
                .keys()
                .copied()
                .filter(|id| !config.contains(*id))
                .collect(),
            _ => Vec::new(),
        };
        self.cluster = config;
        // Removed servers learn the commit from one last append.
        for id in removed {
            if Some(id) != self.membership.catchup_target() {
                self.send_append(id, true);
            }
        }
        self.sync_peers();
    }

    // -- snapshots --

    pub(crate) fn maybe_capture_snapshot(&mut self, interval_elapsed: bool) -> Result<(), StorageError> {
        let applied = self.log.last_applied();
        let since = applied.saturating_sub(self.log.snapshot_index());
        if since == 0 || self.snapshots.state() != CaptureState::Idle {
            return Ok(());
        }
        let due = interval_elapsed
            || since >= self.config.snapshot_batch_count
            || self.log.data_size() >= self.config.snapshot_data_threshold;
        if due {
            self.capture_snapshot()?;
        }
        Ok(())
    }

    pub(crate) fn capture_snapshot(&mut self) -> Result<(), StorageError> {
        let index = self.log.last_applied();
        let term = self.log.term_at(index).unwrap_or(self.log.snapshot_term());
        self.snapshots.set_state(CaptureState::Capturing);
        let state = Bytes::from(self.state_machine.capture_snapshot());
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            state,
            cluster_config: Some(self.cluster.clone()),
        };

        self.snapshots.set_state(CaptureState::Persisting);
        if let Err(e) = self.storage.save_snapshot(&snapshot) {
            self.snapshots.set_state(CaptureState::Idle);
            return Err(e);
        }
        if let Err(e) = self.log.compact(index) {
            warn!(self.logger, "log compaction refused"; "error" => %e);
        }
        info!(self.logger, "captured snapshot";
            "index" => index, "term" => term, "bytes" => snapshot.state.len());
        self.snapshots.record(snapshot);
        metrics::RAFT_SNAPSHOTS
            .with_label_values(&[&self.member_label, "captured"])
            .inc();
        Ok(())
    }

    // -- timers --

    pub(crate) fn election_timeout(&mut self) -> Duration {
        let variance = self.config.election_timeout_variance_ms;
        let jitter = if variance > 0 {
            self.rng.gen_range(0..=variance)
        } else {
            0
        };
        self.config.election_timeout() + Duration::from_millis(jitter)
    }

    pub(crate) fn arm_election_timer(&mut self) {
        let after = self.election_timeout();
        let message = self.timers.next(TimerKind::Election);
        self.scheduler.schedule(after, message);
    }

    pub(crate) fn arm_heartbeat_timer(&mut self) {
        let message = self.timers.next(TimerKind::Heartbeat);
        self.scheduler
            .schedule(self.config.heartbeat_interval(), message);
    }

    fn arm_snapshot_timer(&mut self) {
        if let Some(interval) = self.config.snapshot_interval() {
            let message = self.timers.next(TimerKind::SnapshotInterval);
            self.scheduler.schedule(interval, message);
        }
    }

    pub(crate) fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        let message = self.timers.next(kind);
        self.scheduler.schedule(after, message);
    }

    // -- failure and shutdown --

    fn halt(&mut self, err: StorageError) {
        let reason = err.to_string();
        error!(self.logger, "persistence failed, halting"; "error" => &reason);
        let client_err = RaftError::Halted {
            reason: reason.clone(),
        };
        self.halted = Some(reason);
        self.timers.cancel_all();
        self.fail_pending(client_err, ServerChangeStatus::NoLeader);
        self.behavior = Behavior::Follower;
        self.set_role(RaftRole::Follower);
        self.leader_id = None;
        if self.stopping.is_some() {
            self.shutdown();
        }
    }

    fn fail_pending(&mut self, err: RaftError, change_status: ServerChangeStatus) {
        if let Behavior::Leader(leader) = &mut self.behavior {
            for proposal in leader.queued.drain(..) {
                proposal.reject(err.clone());
            }
        }
        self.trackers.fail_all(err.clone());
        self.membership.abort_all(change_status);
        if let Some(reply) = self.transfer.take().and_then(|t| t.reply) {
            let _ = reply.send(Err(err));
        }
    }

    /// An established leader hands leadership to a caught-up follower and
    /// stops once the transfer ends, whatever its outcome. Anything else
    /// stops right away.
    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        self.stopping = Some(reply);
        if self.halted.is_some() || self.role != RaftRole::Leader {
            self.shutdown();
            return;
        }
        if self.transfer.is_some() {
            info!(self.logger, "stopping after the running leadership transfer");
            return;
        }
        match self.transfer_target(None) {
            Ok(target) => {
                info!(self.logger, "handing over leadership before stopping"; "target" => target);
                self.begin_transfer(target, None);
            }
            Err(e) => {
                debug!(self.logger, "stopping without a leadership transfer"; "reason" => %e);
                self.shutdown();
            }
        }
    }

    /// Fail everything still waiting on this instance and stop.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        info!(self.logger, "raft instance stopping");
        self.stopped = true;
        self.timers.cancel_all();
        self.fail_pending(RaftError::Stopped, ServerChangeStatus::NoLeader);
        if let Some(reply) = self.stopping.take() {
            let _ = reply.send(());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.is_some()
    }

    // -- introspection --

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            role: self.role,
            term: self.term_info.term,
            leader_id: self.leader_id,
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
            last_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
            cluster: self.cluster.clone(),
            halted: self.halted.clone(),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn term_info(&self) -> TermInfo {
        self.term_info
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub(crate) fn set_role(&mut self, role: RaftRole) {
        if self.role == role {
            return;
        }
        info!(self.logger, "role changed"; "from" => %self.role, "to" => %role, "term" => self.term_info.term);
        metrics::RAFT_ROLE_TRANSITIONS
            .with_label_values(&[&self.member_label, role.as_str()])
            .inc();
        self.role = role;
    }

    pub(crate) fn member_label(&self) -> &str {
        &self.member_label
    }

    fn update_gauges(&self) {
        let label = [self.member_label.as_str()];
        metrics::RAFT_TERM
            .with_label_values(&label)
            .set(self.term_info.term as i64);
        metrics::RAFT_COMMIT_INDEX
            .with_label_values(&label)
            .set(self.log.commit_index() as i64);
        metrics::RAFT_LAST_APPLIED
            .with_label_values(&label)
            .set(self.log.last_applied() as i64);
        debug!(self.logger, "progress";
            "role" => %self.role,
            "commit_index" => self.log.commit_index(),
            "last_applied" => self.log.last_applied());
    }
}
