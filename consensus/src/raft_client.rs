//! Raft client implementation
//!
//! Outbound side of the gRPC transport. Every peer gets a long-lived
//! client stream fed from a bounded channel; a broken stream is rebuilt on
//! the next frame sent to that peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tonic::transport::{Channel, Endpoint};

use crate::pb::raft_service_client::RaftServiceClient;
use crate::pb::PostDataRequest;
use crate::raft::types::ServerId;
use crate::transport::Transport;

const PEER_CHANNEL_SIZE: usize = 1000; // Frames buffered per peer

/// Client for a single peer node
struct PeerClient {
    sender: Sender<PostDataRequest>,
    /// Set once the stream failed and the client must be rebuilt
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    fn new(addr: &str) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(addr.to_owned())?.connect_lazy();
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_SIZE);

        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        let addr = addr.to_owned();
        tokio::spawn(async move {
            let mut client = RaftServiceClient::new(channel);
            if let Err(e) = Self::stream_messages(&mut client, receiver).await {
                log::warn!("streaming frames to {} failed: {}", addr, e);
            }
            invalid_clone.store(true, Ordering::SeqCst);
        });

        Ok(Self { sender, invalid })
    }

    async fn stream_messages(
        client: &mut RaftServiceClient<Channel>,
        receiver: Receiver<PostDataRequest>,
    ) -> Result<(), tonic::Status> {
        let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
        client.post_data(stream).await?;
        Ok(())
    }
}

/// [`Transport`] over the peers' `RaftService` endpoints.
pub struct RaftClient {
    id: ServerId,
    addrs: HashMap<ServerId, String>,
    peers: Mutex<HashMap<ServerId, PeerClient>>,
}

/// Address usable by tonic, adding the scheme when the config omits it.
pub fn endpoint_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_owned()
    } else {
        format!("http://{}", addr)
    }
}

impl RaftClient {
    pub fn new(id: ServerId, addrs: impl IntoIterator<Item = (ServerId, String)>) -> RaftClient {
        RaftClient {
            id,
            addrs: addrs
                .into_iter()
                .map(|(peer, addr)| (peer, endpoint_uri(&addr)))
                .collect(),
            peers: Mutex::new(HashMap::new()),
        }
    }
}

impl Transport for RaftClient {
    fn send(&self, to: ServerId, frame: Bytes) {
        let Some(addr) = self.addrs.get(&to) else {
            log::debug!("no address for server {}, dropping frame", to);
            return;
        };
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers
            .get(&to)
            .map_or(false, |peer| peer.invalid.load(Ordering::SeqCst))
        {
            peers.remove(&to);
        }
        if !peers.contains_key(&to) {
            match PeerClient::new(addr) {
                Ok(client) => {
                    peers.insert(to, client);
                }
                Err(e) => {
                    log::error!("bad address {} for server {}: {}", addr, to, e);
                    return;
                }
            }
        }
        let Some(peer) = peers.get(&to) else {
            return;
        };

        let request = PostDataRequest {
            from: self.id,
            data: vec![frame.to_vec()],
        };
        match peer.sender.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::warn!("stream to {} is full, dropping frame", to),
            Err(TrySendError::Closed(_)) => {
                peers.remove(&to);
            }
        }
    }
}
