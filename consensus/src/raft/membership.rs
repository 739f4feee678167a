//! Server configuration changes
//! One change runs at a time on the leader. Adding a server first catches it
//! up as a non-voting replication target; the new configuration takes effect
//! when its log entry commits.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::oneshot;

use crate::raft::types::{ClusterConfig, LogIndex, ServerId, ServerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerChangeStatus {
    Ok,
    NoLeader,
    NotSupported,
    AlreadyExists,
    DoesNotExist,
    Timeout,
    PriorRequestConsensusTimeout,
    InvalidRequest,
}

impl fmt::Display for ServerChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerChange {
    Add { id: ServerId, voting: bool },
    Remove { id: ServerId },
    ChangeVoting { id: ServerId, voting: bool },
}

impl ServerChange {
    pub fn server(&self) -> ServerId {
        match *self {
            ServerChange::Add { id, .. }
            | ServerChange::Remove { id }
            | ServerChange::ChangeVoting { id, .. } => id,
        }
    }
}

pub struct ServerChangeRequest {
    pub change: ServerChange,
    pub reply: oneshot::Sender<ServerChangeStatus>,
}

impl ServerChangeRequest {
    pub fn new(change: ServerChange) -> (Self, oneshot::Receiver<ServerChangeStatus>) {
        let (tx, rx) = oneshot::channel();
        (ServerChangeRequest { change, reply: tx }, rx)
    }

    pub fn respond(self, status: ServerChangeStatus) {
        let _ = self.reply.send(status);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Replicating to a new server before it joins the configuration.
    CatchingUp { target: ServerId, voting: bool },
    /// Waiting for the configuration entry at `index` to commit.
    Committing { index: LogIndex },
}

struct InFlight {
    request: ServerChangeRequest,
    phase: Phase,
}

/// Outcome of validating a change against the current configuration.
#[derive(Debug, PartialEq, Eq)]
pub enum Plan {
    /// Answer right away.
    Done(ServerChangeStatus),
    /// Catch the server up before appending a configuration.
    CatchUp { target: ServerId, voting: bool },
    /// Append this configuration now.
    Append(ClusterConfig),
}

/// Decide what a change needs, given the committed configuration and the
/// leader's own id. A demoted leader hands over leadership once the change
/// applies; a leader without followers cannot remove itself.
pub fn plan(change: ServerChange, config: &ClusterConfig, leader: ServerId) -> Plan {
    match change {
        ServerChange::Add { id, voting } => {
            if config.contains(id) {
                Plan::Done(ServerChangeStatus::AlreadyExists)
            } else {
                Plan::CatchUp { target: id, voting }
            }
        }
        ServerChange::Remove { id } => {
            if !config.contains(id) {
                return Plan::Done(ServerChangeStatus::DoesNotExist);
            }
            if id == leader && config.len() == 1 {
                return Plan::Done(ServerChangeStatus::NotSupported);
            }
            let next = config.without_server(id);
            if next.voting_count() == 0 {
                return Plan::Done(ServerChangeStatus::InvalidRequest);
            }
            Plan::Append(next)
        }
        ServerChange::ChangeVoting { id, voting } => {
            if !config.contains(id) {
                return Plan::Done(ServerChangeStatus::DoesNotExist);
            }
            if config.is_voting(id) == voting {
                return Plan::Done(ServerChangeStatus::Ok);
            }
            let next = config.with_server(ServerInfo { id, voting });
            if next.voting_count() == 0 {
                return Plan::Done(ServerChangeStatus::InvalidRequest);
            }
            Plan::Append(next)
        }
    }
}

#[derive(Default)]
pub struct MembershipCoordinator {
    current: Option<InFlight>,
    queue: VecDeque<ServerChangeRequest>,
}

impl MembershipCoordinator {
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.current.as_ref().map(|c| c.phase)
    }

    pub fn current_change(&self) -> Option<ServerChange> {
        self.current.as_ref().map(|c| c.request.change)
    }

    pub fn enqueue(&mut self, request: ServerChangeRequest) {
        self.queue.push_back(request);
    }

    pub fn next_queued(&mut self) -> Option<ServerChangeRequest> {
        self.queue.pop_front()
    }

    pub fn begin(&mut self, request: ServerChangeRequest, phase: Phase) {
        self.current = Some(InFlight { request, phase });
    }

    pub fn set_phase(&mut self, phase: Phase) {
        if let Some(current) = self.current.as_mut() {
            current.phase = phase;
        }
    }

    /// Server being caught up, if any.
    pub fn catchup_target(&self) -> Option<ServerId> {
        match self.phase() {
            Some(Phase::CatchingUp { target, .. }) => Some(target),
            _ => None,
        }
    }

    /// Finish the running change with `status`.
    pub fn finish(&mut self, status: ServerChangeStatus) {
        if let Some(current) = self.current.take() {
            current.request.respond(status);
        }
    }

    /// The running change timed out; everything queued behind it fails too.
    pub fn time_out(&mut self) {
        self.finish(ServerChangeStatus::Timeout);
        for request in self.queue.drain(..) {
            request.respond(ServerChangeStatus::PriorRequestConsensusTimeout);
        }
    }

    /// Leadership was lost or the instance stopped.
    pub fn abort_all(&mut self, status: ServerChangeStatus) {
        self.finish(status);
        for request in self.queue.drain(..) {
            request.respond(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig::voting([1, 2, 3])
    }

    #[test]
    fn test_plan_validates_against_committed_config() {
        assert_eq!(
            plan(ServerChange::Add { id: 2, voting: true }, &config(), 1),
            Plan::Done(ServerChangeStatus::AlreadyExists)
        );
        assert_eq!(
            plan(ServerChange::Add { id: 4, voting: true }, &config(), 1),
            Plan::CatchUp {
                target: 4,
                voting: true
            }
        );
        assert_eq!(
            plan(ServerChange::Remove { id: 9 }, &config(), 1),
            Plan::Done(ServerChangeStatus::DoesNotExist)
        );
        assert_eq!(
            plan(ServerChange::Remove { id: 3 }, &config(), 1),
            Plan::Append(ClusterConfig::voting([1, 2]))
        );
        assert_eq!(
            plan(ServerChange::ChangeVoting { id: 1, voting: false }, &config(), 1),
            Plan::Append(ClusterConfig::voting([2, 3]).with_server(ServerInfo {
                id: 1,
                voting: false
            }))
        );
        assert_eq!(
            plan(ServerChange::Remove { id: 1 }, &ClusterConfig::voting([1]), 1),
            Plan::Done(ServerChangeStatus::NotSupported)
        );
        let with_learner = ClusterConfig::voting([1]).with_server(ServerInfo {
            id: 2,
            voting: false,
        });
        assert_eq!(
            plan(ServerChange::Remove { id: 1 }, &with_learner, 1),
            Plan::Done(ServerChangeStatus::InvalidRequest)
        );
    }

    #[test]
    fn test_timeout_fails_queue_with_prior_request_status() {
        let mut coordinator = MembershipCoordinator::default();
        let (first, mut rx_first) = ServerChangeRequest::new(ServerChange::Remove { id: 3 });
        let (second, mut rx_second) = ServerChangeRequest::new(ServerChange::Remove { id: 2 });
        coordinator.begin(first, Phase::Committing { index: 7 });
        coordinator.enqueue(second);
        assert!(coordinator.is_busy());

        coordinator.time_out();
        assert_eq!(rx_first.try_recv().unwrap(), ServerChangeStatus::Timeout);
        assert_eq!(
            rx_second.try_recv().unwrap(),
            ServerChangeStatus::PriorRequestConsensusTimeout
        );
        assert!(!coordinator.is_busy());
        assert!(coordinator.next_queued().is_none());
    }
}
