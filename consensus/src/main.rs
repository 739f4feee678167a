use anyhow::Context;
use clap::Parser;
use tokio::signal;

use consensus::config::RuntimeConfig;
use consensus::server::Server;

/// Replicated key-value node
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = RuntimeConfig::from_toml(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    log::info!("starting node {} on {}", config.id, config.addr);

    let server = Server::start(&config).await?;
    shutdown_signal().await;
    server.stop().await;
    Ok(())
}
