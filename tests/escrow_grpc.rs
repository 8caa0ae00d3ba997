mod support;

use anyhow::{Context as _, Result};
use assert_cmd::Command;
use predicates::prelude::*;
use tonic::Code;

use asset_escrow::ledger::memory::InMemoryLedger;
use asset_escrow::proto::v1::{
    AcceptOfferRequest, CancelOfferRequest, CreateOfferRequest, GetOfferRequest,
    ListOffersRequest, OfferStatus,
};

use support::EscrowServer;

fn funded_ledger() -> Result<InMemoryLedger> {
    let ledger = InMemoryLedger::new();
    ledger.fund("alice", 100, 1_000)?;
    ledger.fund("bob", 200, 1_000)?;
    Ok(ledger)
}

fn create_request(creator: &str) -> CreateOfferRequest {
    CreateOfferRequest {
        creator: creator.to_string(),
        asset1_id: 100,
        asset1_amount: 50,
        asset2_id: 200,
        asset2_amount: 30,
        expires_at: 0,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grpc_create_accept_get_list() -> Result<()> {
    let server = EscrowServer::start(funded_ledger()?).await?;
    let mut client = server.client().await?;

    let offer = client
        .create_offer(create_request("alice"))
        .await
        .context("CreateOffer")?
        .into_inner();
    assert_eq!(offer.status, OfferStatus::Open as i32);
    assert!(offer.taker.is_empty());
    assert_eq!(offer.expires_at, 0);

    let done = client
        .accept_offer(AcceptOfferRequest {
            offer_id: offer.offer_id.clone(),
            taker: "bob".to_string(),
        })
        .await
        .context("AcceptOffer")?
        .into_inner();
    assert_eq!(done.status, OfferStatus::Completed as i32);
    assert_eq!(done.taker, "bob");

    let got = client
        .get_offer(GetOfferRequest {
            offer_id: offer.offer_id.clone(),
        })
        .await
        .context("GetOffer")?
        .into_inner();
    assert_eq!(got.status, OfferStatus::Completed as i32);

    let second = client
        .create_offer(create_request("alice"))
        .await
        .context("CreateOffer second")?
        .into_inner();

    let all = client
        .list_offers(ListOffersRequest {
            status: OfferStatus::Unspecified as i32,
        })
        .await
        .context("ListOffers")?
        .into_inner();
    assert_eq!(all.offers.len(), 2);

    let open = client
        .list_offers(ListOffersRequest {
            status: OfferStatus::Open as i32,
        })
        .await
        .context("ListOffers open")?
        .into_inner();
    assert_eq!(open.offers.len(), 1);
    assert_eq!(open.offers[0].offer_id, second.offer_id);

    assert_eq!(server.ledger.balance("bob", 100), 50);
    assert_eq!(server.ledger.balance("alice", 200), 30);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grpc_maps_escrow_errors_to_status_codes() -> Result<()> {
    let server = EscrowServer::start(funded_ledger()?).await?;
    let mut client = server.client().await?;

    let mut same_asset = create_request("alice");
    same_asset.asset2_id = same_asset.asset1_id;
    let status = client.create_offer(same_asset).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut past_expiry = create_request("alice");
    past_expiry.expires_at = 1;
    let status = client.create_offer(past_expiry).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = client
        .create_offer(create_request(""))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = client
        .create_offer(create_request("carol"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);

    let offer = client
        .create_offer(create_request("alice"))
        .await?
        .into_inner();

    let status = client
        .accept_offer(AcceptOfferRequest {
            offer_id: offer.offer_id.clone(),
            taker: "alice".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = client
        .cancel_offer(CancelOfferRequest {
            offer_id: offer.offer_id.clone(),
            caller: "bob".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = client
        .get_offer(GetOfferRequest {
            offer_id: "missing".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let status = client
        .accept_offer(AcceptOfferRequest {
            offer_id: offer.offer_id.clone(),
            taker: "dave".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Aborted);

    let cancelled = client
        .cancel_offer(CancelOfferRequest {
            offer_id: offer.offer_id.clone(),
            caller: "alice".to_string(),
        })
        .await?
        .into_inner();
    assert_eq!(cancelled.status, OfferStatus::Cancelled as i32);

    let status = client
        .accept_offer(AcceptOfferRequest {
            offer_id: offer.offer_id.clone(),
            taker: "bob".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    let status = client
        .list_offers(ListOffersRequest { status: 42 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_prints_offers_as_json() -> Result<()> {
    let server = EscrowServer::start(funded_ledger()?).await?;
    let mut client = server.client().await?;

    let offer = client
        .create_offer(create_request("alice"))
        .await?
        .into_inner();

    let url = server.url.clone();
    let offer_id = offer.offer_id.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        Command::cargo_bin("escrow_cli")
            .context("locate escrow_cli")?
            .args(["--grpc-url", url.as_str(), "accept", "--offer-id", offer_id.as_str()])
            .args(["--taker", "bob"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"completed\""))
            .stdout(predicate::str::contains("\"taker\": \"bob\""));

        Command::cargo_bin("escrow_cli")
            .context("locate escrow_cli")?
            .args(["--grpc-url", url.as_str(), "list", "--status", "completed"])
            .assert()
            .success()
            .stdout(predicate::str::contains(offer_id.as_str()));

        Command::cargo_bin("escrow_cli")
            .context("locate escrow_cli")?
            .args(["--grpc-url", url.as_str(), "cancel", "--offer-id", offer_id.as_str()])
            .args(["--caller", "alice"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("CancelOffer"));

        Ok(())
    })
    .await
    .context("join cli task")??;

    Ok(())
}
