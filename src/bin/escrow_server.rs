use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use asset_escrow::escrow::engine::{EngineConfig, EscrowEngine};
use asset_escrow::escrow::service::EscrowServiceImpl;
use asset_escrow::escrow::store::SqliteOfferStore;
use asset_escrow::escrow::unix_now;
use asset_escrow::ledger::memory::{Funding, InMemoryLedger};
use asset_escrow::proto::v1::escrow_service_server::EscrowServiceServer;
use clap::Parser as _;
use tonic::transport::Server;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:50061")]
    listen_addr: String,

    #[arg(long)]
    store_path: PathBuf,

    #[arg(long, default_value_t = 30)]
    transfer_timeout_secs: u64,

    /// Default lifetime of new offers; 0 keeps offers open until cancelled.
    #[arg(long, default_value_t = 0)]
    offer_ttl_secs: u64,

    /// How long terminal offers are kept before purging.
    #[arg(long, default_value_t = 7 * 24 * 3600, value_parser = clap::value_parser!(u64).range(1..))]
    retention_secs: u64,

    #[arg(long, default_value_t = 30)]
    maintenance_interval_secs: u64,

    /// Seeds the in-memory ledger, as `party:asset_id:amount`. Repeatable.
    #[arg(long = "fund")]
    funding: Vec<Funding>,
}

#[tokio::main]
async fn main() -> Result<()> {
    asset_escrow::logging::init().ok();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen_addr.parse().context("parse listen_addr")?;

    let ledger = InMemoryLedger::new();
    for f in &args.funding {
        ledger
            .fund(&f.party, f.asset_id, f.amount)
            .with_context(|| format!("fund {}", f.party))?;
        tracing::info!(party = %f.party, asset_id = f.asset_id, amount = f.amount, "ledger funded");
    }

    let store = SqliteOfferStore::open(args.store_path).context("open sqlite store")?;
    tracing::info!(store_path = %store.path().display(), "offer store ready");

    let cfg = EngineConfig {
        transfer_timeout: Duration::from_secs(args.transfer_timeout_secs),
        offer_ttl: (args.offer_ttl_secs > 0).then(|| Duration::from_secs(args.offer_ttl_secs)),
    };
    let engine = Arc::new(EscrowEngine::new(
        cfg,
        Arc::new(ledger),
        Arc::new(Mutex::new(store)),
    ));

    let recovered = engine
        .recover_in_flight()
        .await
        .context("recover in-flight offers")?;
    if recovered.completed > 0 || recovered.reopened > 0 {
        tracing::warn!(
            completed = recovered.completed,
            reopened = recovered.reopened,
            "resolved offers left accepted by a previous run"
        );
    }

    spawn_maintenance_worker(
        engine.clone(),
        Duration::from_secs(args.maintenance_interval_secs),
        Duration::from_secs(args.retention_secs),
    );

    tracing::info!(%listen_addr, "starting escrow gRPC server");

    Server::builder()
        .add_service(EscrowServiceServer::new(EscrowServiceImpl::new(engine)))
        .serve(listen_addr)
        .await
        .context("serve gRPC")?;

    Ok(())
}

fn spawn_maintenance_worker(
    engine: Arc<EscrowEngine<InMemoryLedger>>,
    poll_interval: Duration,
    retention: Duration,
) {
    tokio::spawn(async move {
        loop {
            let now = unix_now();

            match engine.settle_committed().await {
                Ok(settled) if settled > 0 => {
                    tracing::info!(settled, "completed offers with committed transfers");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "settle worker error");
                }
            }

            match engine.expire_stale(now).await {
                Ok(expired) if !expired.is_empty() => {
                    tracing::info!(count = expired.len(), "expired offers cancelled");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "expire worker error");
                }
            }

            if let Err(err) = engine.purge_terminal(now, retention) {
                tracing::warn!(error = %err, "purge worker error");
            }

            tokio::time::sleep(poll_interval).await;
        }
    });
}
