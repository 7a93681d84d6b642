use anyhow::{bail, Context};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use trustgate_broker::SecureBroker;
use trustgate_core::config::StorageBackend;
use trustgate_core::{
    logging, AlertChannel, AlertSink, Config, InMemoryGateway, PersistenceGateway, SharedClock,
    SqliteGateway, SystemClock,
};
use trustgate_crypto::CryptoProtocol;
use trustgate_trust_mesh::{RecomputeTrigger, TrustScorer};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default_config(),
    };
    logging::init_from_config(&config.logging);

    let clock = SystemClock::shared();
    let alerts = Arc::new(AlertChannel::new());
    let gateway = open_gateway(&config, clock.clone())?;

    let crypto = Arc::new(
        CryptoProtocol::new(&config.crypto, clock.clone())
            .context("no usable key material")?
            .with_alerts(alerts.clone()),
    );

    let trust = Arc::new(
        TrustScorer::with_config(config.trust.clone(), clock.clone())
            .with_gateway(gateway.clone())
            .with_alerts(alerts.clone()),
    );
    if let Err(e) = trust.restore() {
        warn!(error = %e, "Trust restore failed, starting from neutral priors");
    }
    let scheduler = trust.spawn_scheduler();

    let broker = SecureBroker::builder(crypto.clone(), trust.clone())
        .config(config.broker.clone())
        .clock(clock)
        .alerts(alerts.clone() as Arc<dyn AlertSink>)
        .gateway(gateway)
        .build();
    broker.start()?;

    info!(
        node_id = %config.node.node_id,
        storage = ?config.storage.backend,
        active_key = %crypto.active_key_id(),
        "TrustGate node started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    broker.shutdown().await;
    scheduler.shutdown().await;
    trust.recompute(RecomputeTrigger::Manual);
    info!(node_id = %config.node.node_id, "TrustGate node stopped");
    Ok(())
}

fn open_gateway(config: &Config, clock: SharedClock) -> anyhow::Result<Arc<dyn PersistenceGateway>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryGateway::new(clock))),
        StorageBackend::Sqlite => {
            let path = Path::new(&config.storage.path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let store = SqliteGateway::open(path, clock)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }
    Ok(None)
}
