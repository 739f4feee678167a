//! Node server
//!
//! Wires one Raft node to disk storage, the gRPC peer transport, the client
//! service and the Prometheus endpoint, all configured from
//! [`RuntimeConfig`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::mpsc;

use crate::client_service::ClientServiceSVC;
use crate::config::RuntimeConfig;
use crate::logger;
use crate::metrics;
use crate::pb::client_service_server::ClientServiceServer;
use crate::pb::raft_service_server::RaftServiceServer;
use crate::raft::actor::RaftOptions;
use crate::raft::codec::RaftCodec;
use crate::raft::node::{Node, RaftHandle};
use crate::raft::storage::FileStorage;
use crate::raft::types::ClusterConfig;
use crate::raft_client::RaftClient;
use crate::raft_service::RaftServiceSVC;
use crate::state_kv::KvStore;

const MAILBOX_SIZE: usize = 4096; // Inbound peer frames buffered for the node

pub struct Server {
    handle: RaftHandle,
}

impl Server {
    /// Recover the node from `config.data_dir` and start serving.
    pub async fn start(config: &RuntimeConfig) -> anyhow::Result<Server> {
        let root = logger::root_logger();
        let registry = KvStore::registry()?;
        let storage = FileStorage::open(
            &config.data_dir,
            &format!("member-{}", config.id),
            RaftCodec::new(registry.clone()),
            config.raft.entries_per_segment,
            config.raft.snapshots_to_retain,
            root.new(slog::o!("tag" => "storage")),
        )
        .with_context(|| format!("opening storage in {}", config.data_dir))?;

        let transport = Arc::new(RaftClient::new(
            config.id,
            config.peers().map(|n| (n.id, n.addr.clone())),
        ));
        let options = RaftOptions {
            id: config.id,
            config: config.raft.clone(),
            bootstrap: ClusterConfig::voting(config.node_list.iter().map(|n| n.id)),
            registry,
        };
        let (mailbox, my_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let handle = Node::start(
            options,
            Box::new(storage),
            transport,
            my_mailbox,
            KvStore::new(),
            &root,
        )?;

        let server = Server { handle };
        server.start_grpc_server(&config.addr, RaftServiceSVC::new(mailbox))?;
        server.start_metrics_server(&config.metrics_addr)?;
        Ok(server)
    }

    pub fn handle(&self) -> &RaftHandle {
        &self.handle
    }

    /// Stop the node, handing leadership over first when it leads.
    pub async fn stop(self) {
        log::info!("server {} stop", self.handle.id());
        if let Err(e) = self.handle.shutdown().await {
            log::warn!("server {} was already stopped: {}", self.handle.id(), e);
        }
    }

    fn start_grpc_server(&self, addr: &str, raft_service: RaftServiceSVC) -> anyhow::Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid grpc address {}", addr))?;
        let client_service = ClientServiceSVC::new(self.handle.clone());
        let grpc_server = tonic::transport::Server::builder()
            .add_service(RaftServiceServer::new(raft_service))
            .add_service(ClientServiceServer::new(client_service))
            .serve(addr);
        tokio::spawn(async move {
            if let Err(e) = grpc_server.await {
                log::error!("grpc server failed: {}", e);
            }
        });
        log::info!("grpc server started on {}", addr);
        Ok(())
    }

    fn start_metrics_server(&self, addr: &str) -> anyhow::Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", addr))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move { Ok::<_, hyper::Error>(encode_metrics(&registry)) }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }
}

fn encode_metrics(registry: &prometheus::Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => Response::new(Body::from(buffer)),
        Err(e) => {
            let mut response = Response::new(Body::from(e.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}
