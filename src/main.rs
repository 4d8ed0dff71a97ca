//! Relay entry point: config, wiring, signals, graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use y_relay::{
    AllowAll, AuthStrategy, BearerToken, BrokerConnector, DocRegistry, ObjectSnapshotStore,
    PulsarConnector, RelayConfig, RelayContext, RelayServer, SnapshotStore, StorageMode,
    BrokerSupervisor,
};

#[derive(Debug, Parser)]
#[command(name = "y-relay", about = "Stateless relay for Yjs-style collaborative editing")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Require this bearer token on every upgrade request.
    #[arg(long)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    let auth: Arc<dyn AuthStrategy> = match &args.auth_token {
        Some(token) => Arc::new(BearerToken::new(token)),
        None => Arc::new(AllowAll),
    };

    let connector = Arc::new(PulsarConnector::new(config.broker.clone()));
    let broker = connector.connect().await?;
    info!("connected to broker at {}", config.broker.url);

    let store: Option<Arc<dyn SnapshotStore>> = match (config.storage.mode, &config.storage.store) {
        (StorageMode::None, _) => None,
        (_, Some(store_config)) => Some(Arc::new(ObjectSnapshotStore::from_config(store_config)?)),
        // validate() rejected this already
        (_, None) => None,
    };

    let grace = config.timing.shutdown_grace();
    let ctx = RelayContext::new(config, broker, store);
    let registry = DocRegistry::new();
    let shutdown = CancellationToken::new();

    let supervisor = BrokerSupervisor::new(ctx.clone(), registry.clone(), connector);
    tokio::spawn(supervisor.run(shutdown.clone()));

    let server = RelayServer::new(ctx.clone(), registry.clone(), auth);
    let server_shutdown = shutdown.clone();
    let mut server_task = tokio::spawn(async move { server.run(server_shutdown).await });

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    tokio::select! {
        result = &mut server_task => {
            result??;
            return Err("server stopped unexpectedly".into());
        }
        _ = term.recv() => info!("SIGTERM received, shutting down"),
        _ = int.recv() => info!("SIGINT received, shutting down"),
        _ = hup.recv() => info!("SIGHUP received, shutting down"),
    }

    shutdown.cancel();
    let graceful = async {
        registry.close_all().await;
        ctx.cleanup.shutdown().await;
        ctx.broker().close().await;
        let _ = server_task.await;
    };
    if tokio::time::timeout(grace, graceful).await.is_err() {
        error!("graceful shutdown exceeded {}s, forcing exit", grace.as_secs());
        std::process::exit(1);
    }

    info!("shutdown complete");
    Ok(())
}
