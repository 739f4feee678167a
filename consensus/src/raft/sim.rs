//! Deterministic cluster simulation
//!
//! Instances share a virtual clock and a single message queue. Messages are
//! delivered in send order with no latency; timers fire in deadline order.
//! Partitions, drop filters and crash/restart over shared `MemStorage` let
//! tests drive the protocol through failures while the safety properties
//! are checked after every event.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::logger;
use crate::raft::actor::{RaftActor, RaftEvent, RaftOptions, TransferRequest};
use crate::raft::behavior::Behavior;
use crate::raft::codec::RaftCodec;
use crate::raft::membership::{ServerChange, ServerChangeRequest, ServerChangeStatus};
use crate::raft::messages::RaftRpc;
use crate::raft::proposal::{Proposal, ProposeResult};
use crate::raft::registry::{PayloadRegistry, FIRST_APPLICATION_TAG};
use crate::raft::storage::MemStorage;
use crate::raft::timer::{Scheduler, TimerMessage};
use crate::raft::types::*;
use crate::raft::StateMachine;
use crate::transport::Transport;

pub(crate) const SIM_TAG: u8 = FIRST_APPLICATION_TAG;

pub(crate) type DropFilter = Box<dyn FnMut(ServerId, ServerId, &RaftRpc) -> bool>;

#[derive(Default)]
struct Shared {
    now: u64,
    seq: u64,
    timers: BTreeMap<(u64, u64), (ServerId, TimerMessage)>,
    messages: VecDeque<(ServerId, ServerId, Bytes)>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap()
}

struct SimScheduler {
    id: ServerId,
    shared: Arc<Mutex<Shared>>,
}

impl Scheduler for SimScheduler {
    fn schedule(&mut self, after: Duration, message: TimerMessage) {
        let mut shared = lock(&self.shared);
        let at = shared.now + after.as_millis() as u64;
        shared.seq += 1;
        let seq = shared.seq;
        shared.timers.insert((at, seq), (self.id, message));
    }
}

struct SimTransport {
    id: ServerId,
    shared: Arc<Mutex<Shared>>,
}

impl Transport for SimTransport {
    fn send(&self, to: ServerId, frame: Bytes) {
        lock(&self.shared).messages.push_back((self.id, to, frame));
    }
}

/// What every instance applied, shared across crashes.
#[derive(Default)]
pub(crate) struct ApplyRecord {
    applied: BTreeMap<LogIndex, Bytes>,
    pub(crate) violations: Vec<String>,
}

/// State machine remembering every applied payload.
pub(crate) struct Recorder {
    id: ServerId,
    entries: BTreeMap<LogIndex, Vec<u8>>,
    last: LogIndex,
    record: Arc<Mutex<ApplyRecord>>,
}

impl Recorder {
    pub(crate) fn entries(&self) -> &BTreeMap<LogIndex, Vec<u8>> {
        &self.entries
    }
}

impl StateMachine for Recorder {
    fn apply_committed(&mut self, index: LogIndex, payload: &Payload) -> Vec<u8> {
        let mut record = self.record.lock().unwrap();
        if index <= self.last {
            record
                .violations
                .push(format!("server {} applied {} after {}", self.id, index, self.last));
        }
        match record.applied.get(&index) {
            Some(data) if *data != payload.data => record.violations.push(format!(
                "server {} applied a different payload at {}",
                self.id, index
            )),
            Some(_) => {}
            None => {
                record.applied.insert(index, payload.data.clone());
            }
        }
        self.entries.insert(index, payload.data.to_vec());
        self.last = index;
        payload.data.to_vec()
    }

    fn capture_snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.entries).unwrap()
    }

    fn restore_snapshot(&mut self, index: LogIndex, _term: Term, data: &[u8]) {
        self.entries = if data.is_empty() {
            BTreeMap::new()
        } else {
            bincode::deserialize(data).unwrap()
        };
        self.last = index;
    }
}

pub(crate) struct Sim {
    shared: Arc<Mutex<Shared>>,
    config: RaftConfig,
    bootstrap: ClusterConfig,
    registry: Arc<PayloadRegistry>,
    codec: RaftCodec,
    nodes: BTreeMap<ServerId, RaftActor<Recorder>>,
    storages: BTreeMap<ServerId, MemStorage>,
    isolated: HashSet<ServerId>,
    blocked: HashSet<(ServerId, ServerId)>,
    filter: Option<DropFilter>,
    record: Arc<Mutex<ApplyRecord>>,
    leaders: BTreeMap<Term, ServerId>,
    committed: BTreeMap<LogIndex, Term>,
    commits: BTreeMap<ServerId, LogIndex>,
    violations: Vec<String>,
}

pub(crate) fn sim_config(seed: u64) -> RaftConfig {
    RaftConfig {
        heartbeat_interval_ms: 100,
        election_timeout_factor: 10,
        election_timeout_variance_ms: 500,
        snapshot_interval_ms: 0,
        server_change_timeout_ms: 20_000,
        rng_seed: Some(seed),
        ..RaftConfig::default()
    }
}

pub(crate) fn payload(i: u64) -> Payload {
    Payload::new(SIM_TAG, format!("{:016}", i).into_bytes())
}

impl Sim {
    pub(crate) fn new(ids: &[ServerId], config: RaftConfig) -> Sim {
        let registry = Arc::new(PayloadRegistry::new().with(SIM_TAG, "sim").unwrap());
        let mut sim = Sim {
            shared: Arc::new(Mutex::new(Shared::default())),
            config,
            bootstrap: ClusterConfig::voting(ids.iter().copied()),
            codec: RaftCodec::new(registry.clone()),
            registry,
            nodes: BTreeMap::new(),
            storages: BTreeMap::new(),
            isolated: HashSet::new(),
            blocked: HashSet::new(),
            filter: None,
            record: Arc::default(),
            leaders: BTreeMap::new(),
            committed: BTreeMap::new(),
            commits: BTreeMap::new(),
            violations: Vec::new(),
        };
        for &id in ids {
            sim.add_node(id);
        }
        sim
    }

    /// Start a server with empty storage and the initial configuration.
    pub(crate) fn add_node(&mut self, id: ServerId) {
        self.storages.insert(id, MemStorage::new());
        self.start_node(id);
    }

    fn start_node(&mut self, id: ServerId) {
        let options = RaftOptions {
            id,
            config: self.config.clone(),
            bootstrap: self.bootstrap.clone(),
            registry: self.registry.clone(),
        };
        let recorder = Recorder {
            id,
            entries: BTreeMap::new(),
            last: 0,
            record: self.record.clone(),
        };
        let mut actor = RaftActor::new(
            options,
            Box::new(self.storages[&id].clone()),
            Arc::new(SimTransport {
                id,
                shared: self.shared.clone(),
            }),
            Box::new(SimScheduler {
                id,
                shared: self.shared.clone(),
            }),
            recorder,
            &logger::discard(),
        )
        .unwrap();
        actor.start();
        self.commits.insert(id, actor.log().commit_index());
        self.nodes.insert(id, actor);
    }

    /// Drop a server together with its pending timers and inbound messages.
    pub(crate) fn crash(&mut self, id: ServerId) {
        if let Some(mut actor) = self.nodes.remove(&id) {
            actor.shutdown();
        }
        let mut shared = lock(&self.shared);
        shared.timers.retain(|_, (owner, _)| *owner != id);
        shared.messages.retain(|(_, to, _)| *to != id);
    }

    pub(crate) fn restart(&mut self, id: ServerId) {
        self.crash(id);
        self.start_node(id);
    }

    pub(crate) fn storage(&self, id: ServerId) -> &MemStorage {
        &self.storages[&id]
    }

    pub(crate) fn isolate(&mut self, id: ServerId, isolated: bool) {
        if isolated {
            self.isolated.insert(id);
        } else {
            self.isolated.remove(&id);
        }
    }

    /// Split the cluster: messages between the groups are lost.
    pub(crate) fn partition(&mut self, left: &[ServerId], right: &[ServerId]) {
        for &a in left {
            for &b in right {
                self.blocked.insert((a, b));
                self.blocked.insert((b, a));
            }
        }
    }

    pub(crate) fn heal(&mut self) {
        self.blocked.clear();
        self.isolated.clear();
    }

    /// Drop every message for which `filter` returns true.
    pub(crate) fn set_filter(&mut self, filter: DropFilter) {
        self.filter = Some(filter);
    }

    pub(crate) fn now(&self) -> u64 {
        lock(&self.shared).now
    }

    pub(crate) fn node(&self, id: ServerId) -> &RaftActor<Recorder> {
        &self.nodes[&id]
    }

    pub(crate) fn node_mut(&mut self, id: ServerId) -> &mut RaftActor<Recorder> {
        self.nodes.get_mut(&id).unwrap()
    }

    pub(crate) fn ids(&self) -> Vec<ServerId> {
        self.nodes.keys().copied().collect()
    }

    /// Established leader with the highest term, if any.
    pub(crate) fn leader(&self) -> Option<ServerId> {
        self.nodes
            .values()
            .filter(|n| n.role() == RaftRole::Leader)
            .max_by_key(|n| n.term_info().term)
            .map(|n| n.id())
    }

    fn handle(&mut self, id: ServerId, event: RaftEvent) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.handle(event);
            self.observe(id);
        }
    }

    pub(crate) fn propose(&mut self, id: ServerId, payload: Payload) -> oneshot::Receiver<ProposeResult> {
        let (proposal, rx) = Proposal::new(payload);
        self.handle(id, RaftEvent::Propose(proposal));
        rx
    }

    pub(crate) fn change_server(
        &mut self,
        id: ServerId,
        change: ServerChange,
    ) -> oneshot::Receiver<ServerChangeStatus> {
        let (request, rx) = ServerChangeRequest::new(change);
        self.handle(id, RaftEvent::ChangeServer(request));
        rx
    }

    pub(crate) fn transfer(
        &mut self,
        id: ServerId,
        target: Option<ServerId>,
    ) -> oneshot::Receiver<Result<(), RaftError>> {
        let (request, rx) = TransferRequest::new(target);
        self.handle(id, RaftEvent::TransferLeadership(request));
        rx
    }

    pub(crate) fn shutdown(&mut self, id: ServerId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.handle(id, RaftEvent::Shutdown(tx));
        rx
    }

    fn deliver(&mut self, from: ServerId, to: ServerId, frame: Bytes) {
        if self.isolated.contains(&from)
            || self.isolated.contains(&to)
            || self.blocked.contains(&(from, to))
        {
            return;
        }
        if let Some(filter) = self.filter.as_mut() {
            if let Ok((_, rpc)) = self.codec.decode(frame.clone()) {
                if filter(from, to, &rpc) {
                    return;
                }
            }
        }
        self.handle(to, RaftEvent::Frame(frame));
    }

    /// Process one message, or else the next timer due by `deadline`.
    fn step_before(&mut self, deadline: u64) -> bool {
        let message = lock(&self.shared).messages.pop_front();
        if let Some((from, to, frame)) = message {
            self.deliver(from, to, frame);
            return true;
        }
        let timer = {
            let mut shared = lock(&self.shared);
            match shared.timers.keys().next().copied() {
                Some(key) if key.0 <= deadline => {
                    shared.now = shared.now.max(key.0);
                    shared.timers.remove(&key)
                }
                _ => None,
            }
        };
        match timer {
            Some((id, message)) => {
                self.handle(id, RaftEvent::Timer(message));
                true
            }
            None => false,
        }
    }

    /// Advance virtual time by `ms`.
    pub(crate) fn run_for(&mut self, ms: u64) {
        let deadline = self.now() + ms;
        while self.step_before(deadline) {}
        lock(&self.shared).now = deadline;
    }

    /// Run until `done` holds or `ms` of virtual time passed.
    pub(crate) fn run_until(&mut self, ms: u64, mut done: impl FnMut(&Sim) -> bool) -> bool {
        let deadline = self.now() + ms;
        loop {
            if done(self) {
                return true;
            }
            if !self.step_before(deadline) {
                lock(&self.shared).now = deadline;
                return done(self);
            }
        }
    }

    pub(crate) fn elect(&mut self) -> ServerId {
        assert!(self.run_until(30_000, |s| s.leader().is_some()), "no leader elected");
        self.leader().unwrap()
    }

    /// Check the per-event safety properties on `id`.
    fn observe(&mut self, id: ServerId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let term = node.term_info().term;
        if matches!(node.behavior, Behavior::Leader(_)) {
            match self.leaders.get(&term) {
                Some(&other) if other != id => self.violations.push(format!(
                    "servers {} and {} both lead term {}",
                    other, id, term
                )),
                Some(_) => {}
                None => {
                    self.leaders.insert(term, id);
                    for (&index, &committed_term) in &self.committed {
                        if index > node.log().snapshot_index()
                            && node.log().term_at(index) != Some(committed_term)
                        {
                            self.violations.push(format!(
                                "leader {} of term {} lacks committed entry {}",
                                id, term, index
                            ));
                        }
                    }
                }
            }
        }

        let commit = node.log().commit_index();
        let previous = self.commits.get(&id).copied().unwrap_or(0);
        if commit < previous {
            self.violations.push(format!(
                "commit index of {} went from {} to {}",
                id, previous, commit
            ));
        }
        for index in previous + 1..=commit {
            if let Some(t) = node.log().term_at(index) {
                match self.committed.get(&index) {
                    Some(&existing) if existing != t => self.violations.push(format!(
                        "index {} committed with terms {} and {}",
                        index, existing, t
                    )),
                    Some(_) => {}
                    None => {
                        self.committed.insert(index, t);
                    }
                }
            }
        }
        self.commits.insert(id, commit.max(previous));
    }

    /// Whenever two logs hold an entry with the same index and term, they
    /// agree on every entry up to it.
    pub(crate) fn check_log_matching(&self) {
        let nodes: Vec<&RaftActor<Recorder>> = self.nodes.values().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let lo = a.log().first_index().max(b.log().first_index());
                let hi = a.log().last_index().min(b.log().last_index());
                let Some(top) = (lo..=hi)
                    .rev()
                    .find(|&idx| a.log().term_at(idx) == b.log().term_at(idx))
                else {
                    continue;
                };
                for idx in lo..=top {
                    assert_eq!(
                        a.log().get(idx),
                        b.log().get(idx),
                        "logs of {} and {} differ at {}",
                        a.id(),
                        b.id(),
                        idx
                    );
                }
            }
        }
    }

    pub(crate) fn assert_safe(&self) {
        assert!(self.violations.is_empty(), "{:?}", self.violations);
        let record = self.record.lock().unwrap();
        assert!(record.violations.is_empty(), "{:?}", record.violations);
        drop(record);
        self.check_log_matching();
    }

    /// Every running server applied everything up to `index`.
    pub(crate) fn all_applied(&self, index: LogIndex) -> bool {
        self.nodes.values().all(|n| n.log().last_applied() >= index)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::raft::codec::WireVersion;
    use crate::raft::messages::{AppendEntries, FIRST_CHUNK_INDEX};
    use crate::raft::snapshot::CaptureState;

    fn committed(rx: &mut oneshot::Receiver<ProposeResult>) -> bool {
        matches!(rx.try_recv(), Ok(Ok(_)))
    }

    #[test]
    fn test_three_nodes_elect_and_replicate() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(1));
        let leader = sim.elect();

        let mut results: Vec<_> = (0..10).map(|i| sim.propose(leader, payload(i))).collect();
        let last = sim.node(leader).log().last_index();
        assert!(sim.run_until(5_000, |s| s.all_applied(last)));
        for rx in results.iter_mut() {
            assert!(committed(rx));
        }
        for id in sim.ids() {
            assert_eq!(sim.node(id).state_machine().entries().len(), 10);
            assert_eq!(sim.node(id).leader_id, Some(leader));
        }
        sim.assert_safe();
    }

    #[test]
    fn test_proposals_queue_until_leadership_established() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(2));
        assert!(sim.run_until(30_000, |s| s
            .ids()
            .iter()
            .any(|&id| s.node(id).role() == RaftRole::PreLeader)));
        let pre = sim
            .ids()
            .into_iter()
            .find(|&id| sim.node(id).role() == RaftRole::PreLeader)
            .unwrap();
        let before = sim.node(pre).log().last_index();
        let mut rx = sim.propose(pre, payload(7));
        assert_eq!(sim.node(pre).log().last_index(), before);

        assert!(sim.run_until(5_000, |s| s.node(pre).role() == RaftRole::Leader));
        assert_eq!(sim.node(pre).log().last_index(), before + 1);
        let last = before + 1;
        assert!(sim.run_until(5_000, |s| s.node(pre).log().last_applied() >= last));
        assert!(committed(&mut rx));
        sim.assert_safe();
    }

    #[test]
    fn test_five_node_partition_keeps_minority_uncommitted() {
        let mut sim = Sim::new(&[1, 2, 3, 4, 5], sim_config(3));
        let old = sim.elect();
        let buddy = sim.ids().into_iter().find(|&id| id != old).unwrap();
        let majority: Vec<ServerId> = sim
            .ids()
            .into_iter()
            .filter(|&id| id != old && id != buddy)
            .collect();
        sim.partition(&[old, buddy], &majority);

        let mut lost = sim.propose(old, payload(100));
        let stale_index = sim.node(old).log().last_index();
        assert!(sim.run_until(30_000, |s| s
            .leader()
            .map_or(false, |l| majority.contains(&l))));
        let new = sim.leader().unwrap();
        let mut kept: Vec<_> = (0..5).map(|i| sim.propose(new, payload(i))).collect();
        sim.run_for(2_000);
        for rx in kept.iter_mut() {
            assert!(committed(rx));
        }
        assert!(sim.node(old).log().commit_index() < stale_index);
        assert!(lost.try_recv().is_err());

        sim.heal();
        let last = sim.node(new).log().last_index();
        assert!(sim.run_until(10_000, |s| s.all_applied(last)));
        assert_eq!(sim.node(old).role(), RaftRole::Follower);
        assert_eq!(
            lost.try_recv(),
            Ok(Err(RaftError::EntryDropped { index: stale_index }))
        );
        for id in sim.ids() {
            assert!(!sim
                .node(id)
                .state_machine()
                .entries()
                .values()
                .any(|v| v == &payload(100).data[..]));
        }
        sim.assert_safe();
    }

    #[test]
    fn test_randomized_faults_preserve_safety() {
        for seed in 0..6 {
            let mut config = sim_config(seed);
            config.snapshot_batch_count = 15;
            config.max_entries_per_append = 4;
            config.snapshot_chunk_size = 64;
            let mut sim = Sim::new(&[1, 2, 3, 4, 5], config);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut next = 0u64;

            for _ in 0..60 {
                match rng.gen_range(0..10) {
                    0 => {
                        let id = rng.gen_range(1..=5);
                        sim.restart(id);
                    }
                    1 => {
                        let id = rng.gen_range(1..=5);
                        sim.isolate(id, true);
                    }
                    2 => sim.heal(),
                    _ => {
                        if let Some(leader) = sim.leader() {
                            for _ in 0..rng.gen_range(1..4) {
                                sim.propose(leader, payload(next));
                                next += 1;
                            }
                        }
                    }
                }
                let ms = rng.gen_range(50..1_500);
                sim.run_for(ms);
                sim.assert_safe();
            }

            sim.heal();
            let leader = sim.elect();
            sim.propose(leader, payload(next));
            let last = sim.node(leader).log().last_index();
            assert!(
                sim.run_until(30_000, |s| s.all_applied(last)),
                "seed {} did not converge",
                seed
            );
            sim.run_for(2_000);
            sim.assert_safe();
            let expected = sim.node(leader).state_machine().entries().clone();
            for id in sim.ids() {
                assert_eq!(sim.node(id).state_machine().entries(), &expected, "seed {}", seed);
            }
        }
    }

    /// Bring the cluster to a state where server 3 must install a snapshot
    /// of `entries` applied payloads cut into `chunk_size` chunks.
    fn lagging_follower(entries: u64, chunk_size: usize) -> (Sim, ServerId) {
        let mut config = sim_config(5);
        config.snapshot_chunk_size = chunk_size;
        config.snapshot_chunk_max_retries = 3;
        let mut sim = Sim::new(&[1, 2, 3], config);
        let leader = sim.elect();
        let follower = if leader == 3 { 2 } else { 3 };
        sim.isolate(follower, true);
        for i in 0..entries {
            sim.propose(leader, payload(i));
        }
        let last = sim.node(leader).log().last_index();
        let up_to_date: Vec<ServerId> = sim.ids().into_iter().filter(|&id| id != follower).collect();
        assert!(sim.run_until(5_000, |s| up_to_date
            .iter()
            .all(|&id| s.node(id).log().last_applied() >= last)));
        // Whoever leads once the follower returns must send a snapshot.
        for &id in &up_to_date {
            let applied = sim.node(id).log().last_applied();
            sim.node_mut(id).capture_snapshot().unwrap();
            assert_eq!(sim.node(id).log().snapshot_index(), applied);
            assert_eq!(sim.node(id).snapshots.state(), CaptureState::Idle);
        }
        (sim, leader)
    }

    #[test]
    fn test_snapshot_transfer_restarts_after_dropped_chunk() {
        // 18 payloads of 16 bytes serialize to 584 bytes: ten 64 byte chunks.
        let (mut sim, leader) = lagging_follower(18, 64);
        let follower = if leader == 3 { 2 } else { 3 };
        let snapshot = sim.node(leader).snapshots.latest().unwrap();
        assert_eq!(snapshot.state.len().div_ceil(64), 10);

        let drops = Arc::new(Mutex::new(0u32));
        let first_chunks = Arc::new(Mutex::new(0u32));
        let (d, f) = (drops.clone(), first_chunks.clone());
        sim.set_filter(Box::new(move |_: ServerId, to: ServerId, rpc: &RaftRpc| {
            if to != follower {
                return false;
            }
            match rpc {
                RaftRpc::InstallSnapshot(m) if m.chunk_index == FIRST_CHUNK_INDEX => {
                    *f.lock().unwrap() += 1;
                    false
                }
                RaftRpc::InstallSnapshot(m) if m.chunk_index == 6 => {
                    let mut drops = d.lock().unwrap();
                    if *drops < 4 {
                        *drops += 1;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        }));
        sim.isolate(follower, false);

        assert!(sim.run_until(120_000, |s| s.node(follower).log().snapshot_index()
            >= snapshot.last_included_index));
        assert_eq!(*drops.lock().unwrap(), 4);
        assert!(*first_chunks.lock().unwrap() >= 2);
        assert_ne!(sim.node(follower).role(), RaftRole::Candidate);
        let received = sim.node(follower).state_machine().capture_snapshot();
        assert_eq!(received, snapshot.state.to_vec());

        let (mut fresh, fresh_leader) = lagging_follower(18, 64);
        let fresh_follower = if fresh_leader == 3 { 2 } else { 3 };
        fresh.isolate(fresh_follower, false);
        let index = fresh.node(fresh_leader).log().snapshot_index();
        assert!(fresh.run_until(30_000, |s| s.node(fresh_follower).log().snapshot_index() >= index));
        assert_eq!(
            fresh.node(fresh_follower).state_machine().entries(),
            sim.node(follower).state_machine().entries()
        );
        sim.assert_safe();
        fresh.assert_safe();
    }

    #[test]
    fn test_adding_fourth_server_changes_quorum_at_commit() {
        let mut config = sim_config(6);
        config.catchup_max_lag = 4;
        config.max_entries_per_append = 2;
        let lag = config.catchup_max_lag;
        let mut sim = Sim::new(&[1, 2, 3], config);
        let leader = sim.elect();
        for i in 0..30 {
            sim.propose(leader, payload(i));
        }
        let last = sim.node(leader).log().last_index();
        assert!(sim.run_until(5_000, |s| s.all_applied(last)));

        // Lose the first few batches sent to the new server.
        let dropped = Arc::new(Mutex::new(0u32));
        let d = dropped.clone();
        sim.set_filter(Box::new(move |_: ServerId, to: ServerId, rpc: &RaftRpc| {
            let mut dropped = d.lock().unwrap();
            match rpc {
                RaftRpc::AppendEntries(m) if to == 4 && !m.entries.is_empty() && *dropped < 3 => {
                    *dropped += 1;
                    true
                }
                _ => false,
            }
        }));

        sim.add_node(4);
        let mut rx = sim.change_server(leader, ServerChange::Add { id: 4, voting: true });
        let mut seen_lagging = false;
        let mut seen_pending = false;
        let done = sim.run_until(20_000, |s| {
            let node = s.node(leader);
            let matched = match &node.behavior {
                Behavior::Leader(l) => l.peers.get(&4).map_or(0, |p| p.match_index),
                _ => 0,
            };
            let config_index = node
                .log()
                .entries_from(node.log().first_index())
                .filter(|e| matches!(e.command, Command::ClusterConfig(_)))
                .map(|e| e.index)
                .last();
            match config_index {
                None => {
                    if matched + lag < node.log().last_index() {
                        seen_lagging = true;
                    }
                    false
                }
                Some(index) if node.log().commit_index() < index => {
                    if !seen_pending {
                        assert!(
                            matched + lag >= index - 1,
                            "configuration appended with server 4 at {} of {}",
                            matched,
                            index - 1
                        );
                    }
                    seen_pending = true;
                    assert_eq!(node.cluster().quorum(), 2);
                    assert!(!node.cluster().contains(4));
                    false
                }
                Some(_) => node.log().last_applied() >= node.log().commit_index(),
            }
        });
        assert!(done);
        assert!(seen_lagging);
        assert!(seen_pending);
        assert_eq!(*dropped.lock().unwrap(), 3);
        sim.run_for(500);
        assert_eq!(rx.try_recv(), Ok(ServerChangeStatus::Ok));
        assert_eq!(sim.node(leader).cluster().quorum(), 3);
        assert!(sim.node(4).cluster().is_voting(4));

        // With two of four voters unreachable nothing commits any more.
        let others: Vec<ServerId> = [1, 2, 3].into_iter().filter(|&id| id != leader).collect();
        sim.isolate(others[0], true);
        sim.isolate(others[1], true);
        let commit = sim.node(leader).log().commit_index();
        let mut blocked = sim.propose(leader, payload(99));
        sim.run_for(500);
        assert_eq!(sim.node(leader).log().commit_index(), commit);
        assert!(blocked.try_recv().is_err());
        sim.assert_safe();
    }

    #[test]
    fn test_membership_validation_and_removal() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(7));
        let leader = sim.elect();
        let follower = if leader == 1 { 2 } else { 1 };

        let mut exists = sim.change_server(leader, ServerChange::Add { id: follower, voting: true });
        let mut missing = sim.change_server(leader, ServerChange::Remove { id: 9 });
        let mut unchanged = sim.change_server(leader, ServerChange::ChangeVoting { id: leader, voting: true });
        assert_eq!(exists.try_recv(), Ok(ServerChangeStatus::AlreadyExists));
        assert_eq!(missing.try_recv(), Ok(ServerChangeStatus::DoesNotExist));
        assert_eq!(unchanged.try_recv(), Ok(ServerChangeStatus::Ok));

        let mut from_follower = sim.change_server(follower, ServerChange::Remove { id: leader });
        assert_eq!(from_follower.try_recv(), Ok(ServerChangeStatus::NoLeader));

        let mut removal = sim.change_server(leader, ServerChange::Remove { id: leader });
        assert!(sim.run_until(10_000, |s| s.node(leader).role() == RaftRole::Follower));
        assert_eq!(removal.try_recv(), Ok(ServerChangeStatus::Ok));

        let new = sim.elect();
        assert_ne!(new, leader);
        sim.run_for(10_000);
        assert!(!sim.node(new).cluster().contains(leader));
        assert!(!sim.node(leader).cluster().contains(leader));
        assert_eq!(sim.node(leader).role(), RaftRole::Follower);
        assert_eq!(sim.leader(), Some(new));
        sim.assert_safe();
    }

    #[test]
    fn test_catch_up_timeout_fails_queued_changes() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(8));
        let leader = sim.elect();
        // Server 4 never starts, so it cannot catch up.
        let mut add = sim.change_server(leader, ServerChange::Add { id: 4, voting: true });
        let mut queued = sim.change_server(leader, ServerChange::Add { id: 5, voting: false });
        sim.run_for(25_000);
        assert_eq!(add.try_recv(), Ok(ServerChangeStatus::Timeout));
        assert_eq!(
            queued.try_recv(),
            Ok(ServerChangeStatus::PriorRequestConsensusTimeout)
        );
        assert_eq!(sim.node(leader).cluster().len(), 3);
        sim.assert_safe();
    }

    #[test]
    fn test_non_voting_member_never_campaigns() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(9));
        let leader = sim.elect();
        sim.add_node(4);
        let mut rx = sim.change_server(leader, ServerChange::Add { id: 4, voting: false });
        assert!(sim.run_until(10_000, |s| s.node(4).cluster().contains(4)));
        sim.run_for(500);
        assert_eq!(rx.try_recv(), Ok(ServerChangeStatus::Ok));

        let term = sim.node(4).term_info().term;
        sim.isolate(4, true);
        sim.run_for(20_000);
        assert_eq!(sim.node(4).term_info().term, term);
        assert_eq!(sim.node(4).role(), RaftRole::Follower);
        sim.assert_safe();
    }

    #[test]
    fn test_leadership_transfer() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(10));
        let leader = sim.elect();
        let target = if leader == 3 { 1 } else { 3 };
        let mut rx = sim.transfer(leader, Some(target));
        let mut rejected = sim.propose(leader, payload(1));
        assert_eq!(
            rejected.try_recv(),
            Ok(Err(RaftError::LeadershipTransferInProgress))
        );
        assert!(sim.run_until(5_000, |s| s.leader() == Some(target)));
        sim.run_for(200);
        assert_eq!(rx.try_recv(), Ok(Ok(())));

        // A target that never answers makes the transfer fail.
        sim.isolate(leader, true);
        let mut rx = sim.transfer(target, Some(leader));
        sim.run_for(3_000);
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(RaftError::LeadershipTransferFailed { .. }))
        ));
        assert_eq!(sim.leader(), Some(target));
        sim.assert_safe();
    }

    #[test]
    fn test_demoted_leader_hands_over_and_steps_down() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(13));
        let leader = sim.elect();
        let mut rx = sim.change_server(
            leader,
            ServerChange::ChangeVoting {
                id: leader,
                voting: false,
            },
        );
        assert!(sim.run_until(10_000, |s| s.leader().map_or(false, |l| l != leader)));
        assert_eq!(rx.try_recv(), Ok(ServerChangeStatus::Ok));
        let new = sim.leader().unwrap();

        sim.run_for(5_000);
        let old = sim.node(leader);
        assert_eq!(old.role(), RaftRole::Follower);
        assert_eq!(old.leader_id, Some(new));
        assert!(old.transfer.is_none());
        assert!(old.cluster().contains(leader));
        assert!(!old.cluster().is_voting(leader));
        assert_eq!(sim.leader(), Some(new));

        let mut rx = sim.propose(new, payload(1));
        sim.run_for(500);
        assert!(committed(&mut rx));
        assert_eq!(sim.node(new).cluster().quorum(), 2);
        assert!(sim.run_until(1_000, |s| s.node(leader).log().last_applied()
            >= s.node(new).log().commit_index()));
        assert_eq!(sim.node(leader).state_machine().entries().len(), 1);
        sim.assert_safe();
    }

    #[test]
    fn test_shutdown_hands_over_leadership() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(14));
        let leader = sim.elect();
        let mut rx = sim.propose(leader, payload(1));
        sim.run_for(500);
        assert!(committed(&mut rx));
        let term = sim.node(leader).term_info().term;

        let started = sim.now();
        let mut stopped = sim.shutdown(leader);
        assert!(sim.node(leader).transfer.is_some());
        assert!(!sim.node(leader).is_stopped());
        assert!(sim.run_until(5_000, |s| s.node(leader).is_stopped()));
        assert_eq!(stopped.try_recv(), Ok(()));
        // Faster than any election timeout.
        assert!(sim.now() - started < 1_000);

        let mut late = sim.propose(leader, payload(2));
        assert_eq!(late.try_recv(), Ok(Err(RaftError::Stopped)));

        assert!(sim.run_until(5_000, |s| s.leader().map_or(false, |l| l != leader)));
        let new = sim.leader().unwrap();
        assert!(sim.node(new).term_info().term > term);
        let mut rx = sim.propose(new, payload(3));
        sim.run_for(500);
        assert!(committed(&mut rx));

        // A follower stops at once.
        let follower = sim.ids().into_iter().find(|&id| id != leader && id != new).unwrap();
        let mut stopped = sim.shutdown(follower);
        assert_eq!(stopped.try_recv(), Ok(()));
        assert!(sim.node(follower).is_stopped());
        sim.assert_safe();
    }

    #[test]
    fn test_restart_recovers_from_storage() {
        let mut config = sim_config(11);
        config.snapshot_batch_count = 8;
        let mut sim = Sim::new(&[1, 2, 3], config);
        let leader = sim.elect();
        for i in 0..20 {
            sim.propose(leader, payload(i));
        }
        let last = sim.node(leader).log().last_index();
        assert!(sim.run_until(5_000, |s| s.all_applied(last)));
        assert!(sim.node(leader).log().snapshot_index() > 0);

        for id in sim.ids() {
            sim.restart(id);
        }
        for id in sim.ids() {
            assert_eq!(sim.node(id).state_machine().entries().len(), 20);
            assert_eq!(sim.node(id).log().last_index(), last);
        }
        let leader = sim.elect();
        let mut rx = sim.propose(leader, payload(20));
        sim.run_for(1_000);
        assert!(committed(&mut rx));
        sim.assert_safe();
    }

    #[test]
    fn test_follower_refuses_to_overwrite_committed_entries() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(15));
        let leader = sim.elect();
        for i in 0..5 {
            sim.propose(leader, payload(i));
        }
        let last = sim.node(leader).log().last_index();
        assert!(sim.run_until(5_000, |s| s.all_applied(last)));
        let follower = if leader == 1 { 2 } else { 1 };
        let journaled = sim.storage(follower).entries();

        let index = last - 1;
        let node = sim.node(follower);
        let committed_term = node.log().term_at(index).unwrap();
        let rpc = RaftRpc::AppendEntries(AppendEntries {
            term: node.term_info().term,
            leader_id: leader,
            prev_log_index: index - 1,
            prev_log_term: node.log().term_at(index - 1).unwrap(),
            entries: vec![LogEntry::new(
                index,
                committed_term + 100,
                Command::Application(payload(999)),
            )],
            leader_commit: last,
        });
        let frame = sim.codec.encode(&rpc, WireVersion::CURRENT);
        sim.handle(follower, RaftEvent::Frame(frame));

        let node = sim.node(follower);
        assert_eq!(node.log().last_index(), last);
        assert_eq!(node.log().term_at(index), Some(committed_term));
        assert!(node.status().halted().is_none());
        assert_eq!(sim.storage(follower).entries(), journaled);

        sim.run_for(1_000);
        assert_eq!(sim.storage(follower).entries(), journaled);
        sim.assert_safe();
    }

    #[test]
    fn test_storage_failure_halts_instance() {
        let mut sim = Sim::new(&[1, 2, 3], sim_config(12));
        let leader = sim.elect();
        sim.storage(leader).fail_writes(true);
        let mut rx = sim.propose(leader, payload(1));
        assert!(matches!(rx.try_recv(), Ok(Err(RaftError::Halted { .. }))));
        assert!(sim.node(leader).status().halted().is_some());
        assert_eq!(sim.node(leader).role(), RaftRole::Follower);

        let mut again = sim.propose(leader, payload(2));
        assert!(matches!(again.try_recv(), Ok(Err(RaftError::Halted { .. }))));

        let survivors: Vec<ServerId> = sim.ids().into_iter().filter(|&id| id != leader).collect();
        assert!(sim.run_until(30_000, |s| s.leader().map_or(false, |l| survivors.contains(&l))));
        sim.assert_safe();
    }
}
