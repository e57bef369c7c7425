//! corral Node Agent
//!
//! Reads events as JSON lines on stdin, reconciles them against the local
//! container engine and writes replies as JSON lines on stdout. Logs go to
//! stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use corral_node_agent::runtime::RuntimeClient;
use corral_node_agent::{transport, Agent, Config, Dispatcher, DockerRuntime, MockRuntime, RuntimeBackend};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Events buffered between the reader and the workers.
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::from_env().context("failed to load configuration")?);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!("Starting corral node agent");
    info!(
        hostname = %config.hostname,
        docker_uuid = %config.docker_uuid,
        state_dir = %config.state_dir.display(),
        workers = config.workers,
        runtime = ?config.runtime,
        "Configuration loaded"
    );

    let runtime: Arc<dyn RuntimeClient> = match config.runtime {
        RuntimeBackend::Docker => Arc::new(
            DockerRuntime::connect(config.docker_host.as_deref())
                .context("failed to connect to the container engine")?,
        ),
        RuntimeBackend::Mock => {
            warn!("Using in-memory runtime, nothing on this host will change");
            Arc::new(MockRuntime::new())
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(config.clone(), runtime, None)?);
    let agent = Agent::new(dispatcher, config.workers);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match transport::read_events(stdin, event_tx).await {
            Ok(count) => info!(events = count, "Event stream closed"),
            Err(e) => error!(error = %e, "Failed to read events"),
        }
    });

    let writer = tokio::spawn(async move { transport::write_replies(tokio::io::stdout(), reply_rx).await });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    agent.run(event_rx, reply_tx, shutdown_rx).await;
    reader.abort();

    match writer.await {
        Ok(Ok(count)) => info!(replies = count, "Reply stream closed"),
        Ok(Err(e)) => error!(error = %e, "Failed to write replies"),
        Err(e) => error!(error = %e, "Reply writer panicked"),
    }

    info!("Node agent shutdown complete");
    Ok(())
}
