use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tempfile::TempDir;
use tonic::transport::{Channel, Server};

use asset_escrow::escrow::engine::{EngineConfig, EscrowEngine};
use asset_escrow::escrow::service::EscrowServiceImpl;
use asset_escrow::escrow::store::SqliteOfferStore;
use asset_escrow::ledger::memory::InMemoryLedger;
use asset_escrow::proto::v1::escrow_service_client::EscrowServiceClient;
use asset_escrow::proto::v1::escrow_service_server::EscrowServiceServer;

pub fn get_available_addr() -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

pub async fn wait_for<T, F, Fut>(description: &str, timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut sleep_for = Duration::from_millis(50);

    loop {
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {description}");
        }

        if let Some(value) = f().await.with_context(|| format!("poll {description}"))? {
            return Ok(value);
        }

        tokio::time::sleep(sleep_for).await;
        sleep_for = (sleep_for * 2).min(Duration::from_millis(500));
    }
}

pub struct EscrowServer {
    pub url: String,
    pub ledger: Arc<InMemoryLedger>,
    _dir: TempDir,
}

impl EscrowServer {
    /// Serves a fresh engine over an in-memory ledger on a free local port.
    pub async fn start(ledger: InMemoryLedger) -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let store = SqliteOfferStore::open(dir.path().join("offers.sqlite3"))
            .context("open sqlite store")?;
        let ledger = Arc::new(ledger);
        let engine = Arc::new(EscrowEngine::new(
            EngineConfig {
                transfer_timeout: Duration::from_secs(5),
                offer_ttl: None,
            },
            ledger.clone(),
            Arc::new(Mutex::new(store)),
        ));

        let addr = get_available_addr().context("pick listen addr")?;
        tokio::spawn(
            Server::builder()
                .add_service(EscrowServiceServer::new(EscrowServiceImpl::new(engine)))
                .serve(addr),
        );

        Ok(Self {
            url: format!("http://{addr}"),
            ledger,
            _dir: dir,
        })
    }

    pub async fn client(&self) -> Result<EscrowServiceClient<Channel>> {
        wait_for("escrow gRPC server", Duration::from_secs(10), || {
            let url = self.url.clone();
            async move { Ok::<_, anyhow::Error>(EscrowServiceClient::connect(url).await.ok()) }
        })
        .await
    }
}
