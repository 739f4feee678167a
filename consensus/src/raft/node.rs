//! Raft node implementation
//! A [`Node`] owns one [`RaftActor`] and feeds it peer frames, timer firings
//! and client requests from a single tokio task. [`RaftHandle`] is the
//! cloneable client side; the node stops on [`RaftHandle::shutdown`] or once
//! every handle is dropped.

use std::sync::Arc;

use bytes::Bytes;
use slog::Logger;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver};
use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::raft::actor::{RaftActor, RaftEvent, RaftOptions, RaftStatus, TransferRequest};
use crate::raft::membership::{ServerChange, ServerChangeRequest, ServerChangeStatus};
use crate::raft::proposal::Proposal;
use crate::raft::storage::RaftStorage;
use crate::raft::timer::{TimerMessage, TokioScheduler};
use crate::raft::types::{Payload, ServerId};
use crate::raft::StateMachine;
use crate::transport::Transport;

const REQUEST_CHANNEL_SIZE: usize = 1000; // Size of the client request channel

pub struct Node<S: StateMachine> {
    actor: RaftActor<S>,
    my_mailbox: Receiver<Bytes>,         // Frames from other instances
    requests: Receiver<RaftEvent>,       // Client requests
    timers: UnboundedReceiver<TimerMessage>,
}

impl<S: StateMachine> Node<S> {
    /// Recover an instance from `storage` and run it on a new task.
    pub fn start(
        options: RaftOptions,
        storage: Box<dyn RaftStorage>,
        transport: Arc<dyn Transport>,
        my_mailbox: Receiver<Bytes>,
        state_machine: S,
        logger: &Logger,
    ) -> Result<RaftHandle, RaftError> {
        let id = options.id;
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let scheduler = Box::new(TokioScheduler::new(timer_tx));
        let mut actor = RaftActor::new(options, storage, transport, scheduler, state_machine, logger)?;
        actor.start();

        let (tx, requests) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let node = Node {
            actor,
            my_mailbox,
            requests,
            timers,
        };
        tokio::spawn(node.run());
        Ok(RaftHandle { id, requests: tx })
    }

    async fn run(mut self) {
        while !self.actor.is_stopped() {
            tokio::select! {
                Some(frame) = self.my_mailbox.recv() => {
                    self.actor.handle(RaftEvent::Frame(frame));
                    while let Ok(frame) = self.my_mailbox.try_recv() {
                        self.actor.handle(RaftEvent::Frame(frame));
                    }
                }
                Some(timer) = self.timers.recv() => {
                    self.actor.handle(RaftEvent::Timer(timer));
                }
                request = self.requests.recv() => match request {
                    Some(event) => self.actor.handle(event),
                    None => break,
                },
            }
        }
        self.actor.shutdown();
    }
}

/// Client side of a running [`Node`].
#[derive(Clone)]
pub struct RaftHandle {
    id: ServerId,
    requests: Sender<RaftEvent>,
}

impl RaftHandle {
    pub fn id(&self) -> ServerId {
        self.id
    }

    async fn submit(&self, event: RaftEvent) -> Result<(), RaftError> {
        self.requests
            .send(event)
            .await
            .map_err(|_| RaftError::Stopped)
    }

    /// Replicate `payload` and return what the state machine produced when
    /// applying it.
    pub async fn propose(&self, payload: Payload) -> Result<Vec<u8>, RaftError> {
        let (proposal, rx) = Proposal::new(payload);
        self.submit(RaftEvent::Propose(proposal)).await?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub async fn add_server(
        &self,
        id: ServerId,
        voting: bool,
    ) -> Result<ServerChangeStatus, RaftError> {
        self.change_server(ServerChange::Add { id, voting }).await
    }

    pub async fn remove_server(&self, id: ServerId) -> Result<ServerChangeStatus, RaftError> {
        self.change_server(ServerChange::Remove { id }).await
    }

    pub async fn change_voting(
        &self,
        id: ServerId,
        voting: bool,
    ) -> Result<ServerChangeStatus, RaftError> {
        self.change_server(ServerChange::ChangeVoting { id, voting })
            .await
    }

    async fn change_server(&self, change: ServerChange) -> Result<ServerChangeStatus, RaftError> {
        let (request, rx) = ServerChangeRequest::new(change);
        self.submit(RaftEvent::ChangeServer(request)).await?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    /// Hand leadership to `target`, or to the most up-to-date follower.
    pub async fn transfer_leadership(&self, target: Option<ServerId>) -> Result<(), RaftError> {
        let (request, rx) = TransferRequest::new(target);
        self.submit(RaftEvent::TransferLeadership(request)).await?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Stop the node. A leader first hands leadership to a caught-up
    /// follower, waiting at most the leadership transfer timeout.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.submit(RaftEvent::Shutdown(tx)).await?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    pub async fn status(&self) -> Result<RaftStatus, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.submit(RaftEvent::Status(tx)).await?;
        rx.await.map_err(|_| RaftError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RaftConfig;
    use crate::logger;
    use crate::raft::storage::MemStorage;
    use crate::raft::types::{ClusterConfig, RaftRole};
    use crate::state_kv::{KvCommand, KvStore};
    use crate::transport::LocalRouter;

    fn fast_config(seed: u64) -> RaftConfig {
        RaftConfig {
            heartbeat_interval_ms: 20,
            election_timeout_factor: 5,
            election_timeout_variance_ms: 100,
            rng_seed: Some(seed),
            ..RaftConfig::default()
        }
    }

    fn start_cluster(router: &LocalRouter, ids: &[ServerId]) -> Vec<RaftHandle> {
        let bootstrap = ClusterConfig::voting(ids.iter().copied());
        ids.iter()
            .map(|&id| {
                let options = RaftOptions {
                    id,
                    config: fast_config(7),
                    bootstrap: bootstrap.clone(),
                    registry: KvStore::registry().unwrap(),
                };
                Node::start(
                    options,
                    Box::new(MemStorage::new()),
                    router.endpoint(id),
                    router.register(id, 1024),
                    KvStore::new(),
                    &logger::discard(),
                )
                .unwrap()
            })
            .collect()
    }

    async fn wait_for_leader(handles: &[RaftHandle]) -> RaftHandle {
        for _ in 0..200 {
            for handle in handles {
                let status = handle.status().await.unwrap();
                if status.role() == RaftRole::Leader {
                    return handle.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected");
    }

    fn put(key: &str, value: &str) -> Payload {
        KvCommand::Put {
            key: key.to_owned(),
            value: value.as_bytes().to_vec(),
        }
        .to_payload()
        .unwrap()
    }

    #[tokio::test]
    async fn test_cluster_elects_leader_and_commits() {
        let router = LocalRouter::new();
        let handles = start_cluster(&router, &[1, 2, 3]);
        let leader = wait_for_leader(&handles).await;

        for i in 0..5 {
            leader.propose(put(&format!("k{}", i), "v")).await.unwrap();
        }
        let status = leader.status().await.unwrap();
        assert!(status.commit_index() >= 6);

        for _ in 0..100 {
            let mut caught_up = 0;
            for handle in &handles {
                if handle.status().await.unwrap().last_applied() >= status.commit_index() {
                    caught_up += 1;
                }
            }
            if caught_up == handles.len() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("followers did not apply the committed entries");
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let router = LocalRouter::new();
        let handles = start_cluster(&router, &[1, 2, 3]);
        let leader = wait_for_leader(&handles).await;
        let follower = handles.iter().find(|h| h.id() != leader.id()).unwrap();

        match follower.propose(put("a", "b")).await {
            Err(RaftError::NotLeader { .. }) => {}
            other => panic!("unexpected result {:?}", other),
        }
        let unknown = Payload::new(42, &b"x"[..]);
        assert_eq!(
            leader.propose(unknown).await,
            Err(RaftError::InvalidPayload { tag: 42 })
        );
    }

    #[tokio::test]
    async fn test_leader_isolation_and_reelection() {
        let router = LocalRouter::new();
        let handles = start_cluster(&router, &[1, 2, 3]);
        let old = wait_for_leader(&handles).await;

        router.isolate(old.id(), true);
        let rest: Vec<RaftHandle> = handles
            .iter()
            .filter(|h| h.id() != old.id())
            .cloned()
            .collect();
        let new = wait_for_leader(&rest).await;
        assert_ne!(new.id(), old.id());
        new.propose(put("x", "1")).await.unwrap();

        for _ in 0..100 {
            if old.status().await.unwrap().role() == RaftRole::IsolatedLeader {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(old.status().await.unwrap().role(), RaftRole::IsolatedLeader);

        router.isolate(old.id(), false);
        for _ in 0..100 {
            let status = old.status().await.unwrap();
            if status.role() == RaftRole::Follower && status.leader_id() == Some(new.id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("old leader did not rejoin as follower");
    }

    #[tokio::test]
    async fn test_transfer_leadership() {
        let router = LocalRouter::new();
        let handles = start_cluster(&router, &[1, 2, 3]);
        let leader = wait_for_leader(&handles).await;
        let target = handles.iter().find(|h| h.id() != leader.id()).unwrap();

        leader
            .transfer_leadership(Some(target.id()))
            .await
            .unwrap();
        let status = leader.status().await.unwrap();
        assert_eq!(status.role(), RaftRole::Follower);
        assert_eq!(status.leader_id(), Some(target.id()));
    }

    #[tokio::test]
    async fn test_shutdown_hands_over_leadership() {
        let router = LocalRouter::new();
        let handles = start_cluster(&router, &[1, 2, 3]);
        let leader = wait_for_leader(&handles).await;
        leader.propose(put("a", "1")).await.unwrap();

        leader.shutdown().await.unwrap();
        assert_eq!(leader.status().await, Err(RaftError::Stopped));
        assert_eq!(
            leader.propose(put("b", "2")).await,
            Err(RaftError::Stopped)
        );

        let rest: Vec<RaftHandle> = handles
            .iter()
            .filter(|h| h.id() != leader.id())
            .cloned()
            .collect();
        let new = wait_for_leader(&rest).await;
        new.propose(put("c", "3")).await.unwrap();
    }

    #[tokio::test]
    async fn test_proposal_waits_without_quorum() {
        let router = LocalRouter::new();
        let handles = start_cluster(&router, &[1, 2, 3]);
        let leader = wait_for_leader(&handles).await;

        router.isolate(leader.id(), true);
        let pending = tokio::time::timeout(Duration::from_millis(200), leader.propose(put("a", "1")));
        assert!(pending.await.is_err());
        assert!(leader.status().await.unwrap().halted().is_none());
    }
}
