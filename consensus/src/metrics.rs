//! Metrics collection module for the consensus service
//!
//! Raft progress and RPC traffic are recorded in process-wide Prometheus
//! collectors; the node binary serves them over HTTP.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking client request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Histogram for tracking client method latency
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    pub static ref RAFT_TERM: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_term", "current term"), &["member"]).unwrap();

    pub static ref RAFT_COMMIT_INDEX: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_commit_index", "commit index"), &["member"]).unwrap();

    pub static ref RAFT_LAST_APPLIED: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_last_applied", "last applied index"), &["member"]).unwrap();

    pub static ref RAFT_ROLE_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("raft_role_transitions", "role changes by target role"),
        &["member", "role"]
    )
    .unwrap();

    pub static ref RAFT_ELECTIONS: IntCounterVec =
        IntCounterVec::new(Opts::new("raft_elections", "elections started"), &["member"]).unwrap();

    pub static ref RAFT_RPC_SENT: IntCounterVec =
        IntCounterVec::new(Opts::new("raft_rpc_sent", "peer messages sent"), &["type"]).unwrap();

    pub static ref RAFT_RPC_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("raft_rpc_received", "peer messages received"),
        &["type"]
    )
    .unwrap();

    pub static ref RAFT_SNAPSHOTS: IntCounterVec = IntCounterVec::new(
        Opts::new("raft_snapshots", "snapshots captured or installed"),
        &["member", "kind"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_TERM.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_COMMIT_INDEX.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_LAST_APPLIED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_ROLE_TRANSITIONS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_ELECTIONS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_RPC_SENT.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_RPC_RECEIVED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_SNAPSHOTS.clone()));
}

/// Records metrics for an async operation
///
/// Increments the request counter for `method_name`, runs the handler and
/// observes its execution time.
#[cfg(feature = "grpc")]
pub async fn record_metrics<F, Fut, T>(
    method_name: &'static str,
    handler: F,
) -> Result<T, tonic::Status>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, tonic::Status>> + Send,
{
    let start = std::time::Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}
