use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hearth_client::{ClientSyncError, HttpTransport, ReplicaCoordinator, SyncClient};
use hearth_core::resolver::Resolver;
use hearth_graph::GraphIndex;
use hearth_storage::{InMemoryGateway, WriteGate};

/// A Hearth replica: keeps a local copy of the graph and syncs it against
/// the authoritative node.
#[derive(Parser)]
#[command(name = "hearth-client", version, about)]
struct Cli {
    /// Base URL of the server, e.g. http://localhost:4300
    #[arg(long, env = "HEARTH_SERVER_URL")]
    server_url: String,

    /// URL prefix the server mounts its routes under.
    #[arg(long, default_value = "v1")]
    prefix: String,

    /// This replica's node identity. Defaults to a fresh random id.
    #[arg(long, env = "HEARTH_NODE_ID")]
    node_id: Option<String>,

    /// Principal attributed to this replica's writes.
    #[arg(long, default_value = "client", env = "HEARTH_USER_ID")]
    user_id: String,

    /// Seconds between sync cycles.
    #[arg(long, default_value_t = 30)]
    interval_secs: u64,

    /// Run a single sync to convergence and exit.
    #[arg(long)]
    once: bool,

    /// Directory for rolling file logs; stderr only when unset.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // The guard must outlive main or buffered log lines are lost.
    let _appender_guard = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hearth-client.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
            None
        }
    };

    let node_id = cli
        .node_id
        .clone()
        .unwrap_or_else(|| format!("replica-{}", uuid::Uuid::new_v4()));

    let gateway = Arc::new(InMemoryGateway::new());
    let index = GraphIndex::new();
    index
        .rebuild(gateway.as_ref())
        .await
        .context("building graph index")?;
    let gate = Arc::new(WriteGate::new());
    let coordinator = Arc::new(ReplicaCoordinator::new());

    let transport = Arc::new(HttpTransport::new(&cli.server_url, &cli.prefix));
    let client = SyncClient::new(
        transport,
        coordinator.clone(),
        gateway,
        index,
        Resolver::default(),
        gate,
        node_id.clone(),
        cli.user_id.clone(),
    );

    tracing::info!(node_id = %node_id, server = %cli.server_url, "replica starting");
    loop {
        match client.sync_to_convergence().await {
            Ok(report) => {
                tracing::info!(
                    applied = report.applied,
                    next_sequence = report.next_sequence,
                    pending = coordinator.pending().await,
                    "sync converged"
                );
            }
            Err(ClientSyncError::Suspended) => {
                tracing::info!("sync suspended, waiting");
            }
            Err(err) => {
                tracing::warn!(error = %err, health = ?coordinator.health(), "sync cycle failed");
            }
        }
        if cli.once {
            break;
        }
        tokio::time::sleep(Duration::from_secs(cli.interval_secs)).await;
    }
    Ok(())
}
