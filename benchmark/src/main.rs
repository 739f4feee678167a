use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use hdrhistogram::Histogram;
use tokio::sync::Mutex;
use tokio::time::sleep;

use consensus::config::RaftConfig;
use consensus::raft::actor::RaftOptions;
use consensus::raft::node::{Node, RaftHandle};
use consensus::raft::storage::MemStorage;
use consensus::raft::types::{ClusterConfig, RaftRole, ServerId};
use consensus::state_kv::{KvCommand, KvStore};
use consensus::transport::LocalRouter;

/// Proposal latency of an in-process cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of cluster members
    #[arg(short, long, default_value = "3")]
    nodes: u64,

    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Pause between requests of one client, in ms
    #[arg(short, long, default_value = "0")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Size of every written value in bytes
    #[arg(short, long, default_value = "128")]
    value_size: usize,
}

fn start_cluster(nodes: u64) -> anyhow::Result<Vec<RaftHandle>> {
    let router = LocalRouter::new();
    let ids: Vec<ServerId> = (1..=nodes).collect();
    let bootstrap = ClusterConfig::voting(ids.iter().copied());
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    let mut handles = Vec::new();
    for &id in &ids {
        let options = RaftOptions {
            id,
            config: RaftConfig::default(),
            bootstrap: bootstrap.clone(),
            registry: KvStore::registry()?,
        };
        let handle = Node::start(
            options,
            Box::new(MemStorage::new()),
            router.endpoint(id),
            router.register(id, 4096),
            KvStore::new(),
            &logger,
        )
        .with_context(|| format!("starting node {}", id))?;
        handles.push(handle);
    }
    Ok(handles)
}

async fn wait_for_leader(handles: &[RaftHandle]) -> anyhow::Result<RaftHandle> {
    for _ in 0..100 {
        for handle in handles {
            if handle.status().await?.role() == RaftRole::Leader {
                return Ok(handle.clone());
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("no leader elected")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    let handles = start_cluster(args.nodes)?;
    let leader = wait_for_leader(&handles).await?;
    println!(
        "Leader is node {}; starting benchmark with {} concurrent clients, interval {} ms",
        leader.id(),
        args.concurrency,
        args.interval
    );

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));

    let mut tasks = vec![];
    for client in 0..args.concurrency {
        let leader = leader.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let value_size = args.value_size;
        let interval = args.interval;

        let task = tokio::spawn(async move {
            let mut seq = 0u64;
            loop {
                let command = KvCommand::Put {
                    key: format!("client-{}-{}", client, rand::random::<u16>()),
                    value: vec![seq as u8; value_size],
                };
                seq += 1;
                let payload = match command.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("failed to encode command: {}", e);
                        return;
                    }
                };

                let start = Instant::now();
                match leader.propose(payload).await {
                    Ok(_) => {
                        let micros = start.elapsed().as_micros() as u64;
                        if let Err(e) = histogram.lock().await.record(micros) {
                            log::warn!("latency {} out of range: {}", micros, e);
                        }
                        *total_requests.lock().await += 1;
                    }
                    Err(e) => log::warn!("request failed: {}", e),
                }

                if interval > 0 {
                    sleep(Duration::from_millis(interval)).await;
                }
            }
        });
        tasks.push(task);
    }

    sleep(Duration::from_secs(args.duration)).await;
    for task in tasks {
        task.abort();
    }

    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;
    let status = leader.status().await?;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("Commit index: {}", status.commit_index());
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
