//! Peer frame transport
//! The Raft core hands encoded frames to a [`Transport`]; delivery is best
//! effort and lost frames are recovered by the protocol's retries.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::raft::types::ServerId;

pub trait Transport: Send + Sync {
    fn send(&self, to: ServerId, frame: Bytes);
}

#[derive(Default)]
struct RouterInner {
    mailboxes: HashMap<ServerId, Sender<Bytes>>,
    isolated: HashSet<ServerId>,
}

/// In-process transport connecting instances through channels.
#[derive(Clone, Default)]
pub struct LocalRouter {
    inner: Arc<RwLock<RouterInner>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the mailbox of `id`, replacing any previous one.
    pub fn register(&self, id: ServerId, capacity: usize) -> Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(capacity);
        self.write().mailboxes.insert(id, tx);
        rx
    }

    /// Cut `id` off from every other instance, or reconnect it.
    pub fn isolate(&self, id: ServerId, isolated: bool) {
        let mut inner = self.write();
        if isolated {
            inner.isolated.insert(id);
        } else {
            inner.isolated.remove(&id);
        }
    }

    /// Transport used by instance `from`.
    pub fn endpoint(&self, from: ServerId) -> Arc<dyn Transport> {
        Arc::new(RouterEndpoint {
            from,
            router: self.clone(),
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RouterInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, from: ServerId, to: ServerId, frame: Bytes) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if inner.isolated.contains(&from) || inner.isolated.contains(&to) {
            return;
        }
        let Some(mailbox) = inner.mailboxes.get(&to) else {
            log::debug!("no mailbox for {}, dropping frame from {}", to, from);
            return;
        };
        match mailbox.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("mailbox of {} is full, dropping frame from {}", to, from)
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("mailbox of {} is closed", to)
            }
        }
    }
}

struct RouterEndpoint {
    from: ServerId,
    router: LocalRouter,
}

impl Transport for RouterEndpoint {
    fn send(&self, to: ServerId, frame: Bytes) {
        self.router.deliver(self.from, to, frame);
    }
}
