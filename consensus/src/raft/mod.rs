//! Raft consensus core
//!
//! A [`RaftActor`](actor::RaftActor) replicates a log of opaque payloads
//! across a cluster and hands committed entries to a [`StateMachine`].
//! [`node::Node`] runs an actor on a tokio task; [`node::RaftHandle`] is the
//! client-facing side.

pub mod actor;
mod behavior;
pub mod codec;
pub mod journal;
pub mod log;
pub mod membership;
pub mod messages;
pub mod node;
pub mod peer;
pub mod proposal;
pub mod registry;
mod segment;
pub mod snapshot;
pub mod snapshot_store;
pub mod storage;
pub mod timer;
pub mod types;

#[cfg(test)]
mod sim;

use self::types::{LogIndex, Payload, Term};

/// Application state driven by committed log entries.
pub trait StateMachine: Send + 'static {
    /// Apply a committed application entry. The returned bytes are handed to
    /// the client that proposed it.
    fn apply_committed(&mut self, index: LogIndex, payload: &Payload) -> Vec<u8>;

    /// Serialize the whole state as of the last applied entry.
    fn capture_snapshot(&self) -> Vec<u8>;

    /// Replace the whole state with a snapshot taken at `index`.
    fn restore_snapshot(&mut self, index: LogIndex, term: Term, data: &[u8]);
}
