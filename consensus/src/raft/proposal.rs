use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;
use uuid::Uuid;

use crate::error::RaftError;
use crate::raft::types::{LogIndex, Payload, Term};

/// State machine output of an applied entry, or why it was never applied.
pub type ProposeResult = Result<Vec<u8>, RaftError>;

pub struct Proposal {
    pub id: Uuid,
    pub payload: Payload,
    pub reply: Sender<ProposeResult>,
}

impl Proposal {
    pub fn new(payload: Payload) -> (Self, Receiver<ProposeResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            id: Uuid::new_v4(),
            payload,
            reply: tx,
        };
        (proposal, rx)
    }

    pub fn reject(self, err: RaftError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Links a client waiting for its entry to the entry's position in the log.
pub struct ClientRequestTracker {
    pub identifier: Uuid,
    pub index: LogIndex,
    pub term: Term,
    client: Sender<ProposeResult>,
}

impl ClientRequestTracker {
    fn complete(self, result: ProposeResult) {
        let _ = self.client.send(result);
    }
}

/// In-flight client requests keyed by log index.
#[derive(Default)]
pub struct RequestTrackers {
    by_index: BTreeMap<LogIndex, ClientRequestTracker>,
}

impl RequestTrackers {
    pub fn track(&mut self, proposal: Proposal, index: LogIndex, term: Term) {
        let tracker = ClientRequestTracker {
            identifier: proposal.id,
            index,
            term,
            client: proposal.reply,
        };
        if let Some(previous) = self.by_index.insert(index, tracker) {
            previous.complete(Err(RaftError::EntryDropped { index }));
        }
    }

    /// Route the apply result of `index` to its client, if one waits for it.
    /// An entry applied at that index under another term replaced the
    /// client's entry.
    pub fn applied(&mut self, index: LogIndex, term: Term, output: Vec<u8>) {
        if let Some(tracker) = self.by_index.remove(&index) {
            if tracker.term == term {
                tracker.complete(Ok(output));
            } else {
                tracker.complete(Err(RaftError::EntryDropped { index }));
            }
        }
    }

    /// Fail every tracker at or after `index`; their entries were truncated.
    pub fn truncated(&mut self, index: LogIndex) {
        for (index, tracker) in self.by_index.split_off(&index) {
            tracker.complete(Err(RaftError::EntryDropped { index }));
        }
    }

    /// Fail every tracker at or below `upto`; an installed snapshot covers
    /// their entries and their results are lost.
    pub fn superseded(&mut self, upto: LogIndex) {
        let rest = self.by_index.split_off(&(upto + 1));
        for (index, tracker) in std::mem::replace(&mut self.by_index, rest) {
            tracker.complete(Err(RaftError::EntryDropped { index }));
        }
    }

    pub fn fail_all(&mut self, err: RaftError) {
        for (_, tracker) in std::mem::take(&mut self.by_index) {
            tracker.complete(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}
