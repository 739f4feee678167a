//! Key-value state machine
//!
//! A small replicated map used by the node binary and the benchmark.
//! Commands travel as bincode-encoded application payloads.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::raft::registry::{PayloadRegistry, FIRST_APPLICATION_TAG};
use crate::raft::types::{LogIndex, Payload, Term};
use crate::raft::StateMachine;

/// Payload tag of key-value commands.
pub const KV_PAYLOAD_TAG: u8 = FIRST_APPLICATION_TAG;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KvCommand {
    pub fn to_payload(&self) -> Result<Payload, bincode::Error> {
        Ok(Payload::new(KV_PAYLOAD_TAG, bincode::serialize(self)?))
    }
}

#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, Vec<u8>>,
    applied: LogIndex,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload table with the key-value command type registered.
    pub fn registry() -> Result<Arc<PayloadRegistry>, CodecError> {
        Ok(Arc::new(
            PayloadRegistry::new().with(KV_PAYLOAD_TAG, "kv_command")?,
        ))
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied
    }
}

impl StateMachine for KvStore {
    /// Returns the value replaced or removed by the command, if any.
    fn apply_committed(&mut self, index: LogIndex, payload: &Payload) -> Vec<u8> {
        if index <= self.applied {
            log::debug!("ignoring redelivered index {} (applied {})", index, self.applied);
            return Vec::new();
        }
        self.applied = index;
        match bincode::deserialize::<KvCommand>(&payload.data) {
            Ok(KvCommand::Put { key, value }) => self.data.insert(key, value).unwrap_or_default(),
            Ok(KvCommand::Delete { key }) => self.data.remove(&key).unwrap_or_default(),
            Err(e) => {
                log::warn!("skipping undecodable kv command at {}: {}", index, e);
                Vec::new()
            }
        }
    }

    fn capture_snapshot(&self) -> Vec<u8> {
        match bincode::serialize(&self.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to serialize kv snapshot: {}", e);
                Vec::new()
            }
        }
    }

    fn restore_snapshot(&mut self, index: LogIndex, _term: Term, data: &[u8]) {
        self.applied = index;
        if data.is_empty() {
            self.data.clear();
            return;
        }
        match bincode::deserialize(data) {
            Ok(map) => self.data = map,
            Err(e) => {
                log::error!("failed to restore kv snapshot at {}: {}", index, e);
                self.data.clear();
            }
        }
    }
}
