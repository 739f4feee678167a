//! Raft consensus core with a pluggable transport, durable storage and an
//! optional gRPC node.

pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod raft;
pub mod state_kv;
pub mod transport;

#[cfg(feature = "grpc")]
pub mod client_service;
#[cfg(feature = "grpc")]
pub mod raft_client;
#[cfg(feature = "grpc")]
pub mod raft_service;
#[cfg(feature = "grpc")]
pub mod server;

/// Protocol buffer definitions for the peer and client services
#[cfg(feature = "grpc")]
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}
