use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hearth_core::resolver::Resolver;
use hearth_graph::{GraphIndex, NullSink, ToolDispatcher};
use hearth_server::{ServicesBuilder, SyncEngine};
use hearth_storage::{InMemoryGateway, WriteGate};

/// The authoritative Hearth node: owns the change-log sequence and serves
/// the sync endpoint plus the tool catalog.
#[derive(Parser)]
#[command(name = "hearth-server", version, about)]
struct Cli {
    /// Address to bind the HTTP service to.
    #[arg(long, default_value = "0.0.0.0", env = "HEARTH_BIND")]
    bind: String,

    /// Port to bind the HTTP service to.
    #[arg(long, default_value_t = 4300, env = "HEARTH_PORT")]
    port: u16,

    /// This node's identity in sync vectors and change records.
    #[arg(long, default_value = "hearth-server", env = "HEARTH_NODE_ID")]
    node_id: String,

    /// Principal attributed to unauthenticated tool calls.
    #[arg(long, default_value = "server", env = "HEARTH_DEFAULT_USER")]
    default_user: String,

    /// Conflict-resolution tiebreak window in milliseconds.
    #[arg(long, default_value_t = 1000)]
    tiebreak_window_ms: i64,

    /// URL prefix for all routes.
    #[arg(long, default_value = "v1")]
    prefix: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let gateway = Arc::new(InMemoryGateway::new());
    let index = GraphIndex::new();
    index
        .rebuild(gateway.as_ref())
        .await
        .context("building graph index")?;
    let gate = Arc::new(WriteGate::new());

    let engine = Arc::new(SyncEngine::new(
        gateway.clone(),
        index.clone(),
        Resolver::with_window_millis(cli.tiebreak_window_ms),
        gate.clone(),
        cli.node_id.clone(),
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(
        gateway.clone(),
        index,
        gate,
        Arc::new(NullSink),
    ));

    tracing::info!(node_id = %cli.node_id, bind = %cli.bind, port = cli.port, "starting server");
    let (_handle, task) = ServicesBuilder::new(engine, dispatcher, gateway, cli.default_user)
        .prefix(&cli.prefix)
        .bind(&cli.bind)
        .port(cli.port)
        .run()
        .context("starting http service")?;

    task.await?.map_err(Into::into)
}
