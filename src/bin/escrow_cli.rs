use anyhow::{Context as _, Result};
use asset_escrow::proto::v1::escrow_service_client::EscrowServiceClient;
use asset_escrow::proto::v1::{
    AcceptOfferRequest, CancelOfferRequest, CreateOfferRequest, GetOfferRequest,
    ListOffersRequest, Offer, OfferStatus,
};
use clap::{Parser as _, Subcommand, ValueEnum};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:50061")]
    grpc_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Create {
        #[arg(long)]
        creator: String,

        #[arg(long)]
        asset1_id: u64,

        #[arg(long)]
        asset1_amount: u64,

        #[arg(long)]
        asset2_id: u64,

        #[arg(long)]
        asset2_amount: u64,

        /// Unix seconds; 0 uses the server default.
        #[arg(long, default_value_t = 0)]
        expires_at: u64,
    },
    Accept {
        #[arg(long)]
        offer_id: String,

        #[arg(long)]
        taker: String,
    },
    Cancel {
        #[arg(long)]
        offer_id: String,

        #[arg(long)]
        caller: String,
    },
    Get {
        #[arg(long)]
        offer_id: String,
    },
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Open,
    Accepted,
    Cancelled,
    Completed,
}

impl From<StatusArg> for OfferStatus {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Open => OfferStatus::Open,
            StatusArg::Accepted => OfferStatus::Accepted,
            StatusArg::Cancelled => OfferStatus::Cancelled,
            StatusArg::Completed => OfferStatus::Completed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    asset_escrow::logging::init().ok();
    let args = Args::parse();

    let mut client = EscrowServiceClient::connect(args.grpc_url)
        .await
        .context("connect gRPC")?;

    let out = match args.command {
        Command::Create {
            creator,
            asset1_id,
            asset1_amount,
            asset2_id,
            asset2_amount,
            expires_at,
        } => {
            let offer = client
                .create_offer(CreateOfferRequest {
                    creator,
                    asset1_id,
                    asset1_amount,
                    asset2_id,
                    asset2_amount,
                    expires_at,
                })
                .await
                .context("CreateOffer")?
                .into_inner();

            offer_json(offer)
        }
        Command::Accept { offer_id, taker } => {
            let offer = client
                .accept_offer(AcceptOfferRequest { offer_id, taker })
                .await
                .context("AcceptOffer")?
                .into_inner();

            offer_json(offer)
        }
        Command::Cancel { offer_id, caller } => {
            let offer = client
                .cancel_offer(CancelOfferRequest { offer_id, caller })
                .await
                .context("CancelOffer")?
                .into_inner();

            offer_json(offer)
        }
        Command::Get { offer_id } => {
            let offer = client
                .get_offer(GetOfferRequest { offer_id })
                .await
                .context("GetOffer")?
                .into_inner();

            offer_json(offer)
        }
        Command::List { status } => {
            let status = status.map(OfferStatus::from).unwrap_or(OfferStatus::Unspecified);
            let resp = client
                .list_offers(ListOffersRequest {
                    status: status as i32,
                })
                .await
                .context("ListOffers")?
                .into_inner();

            json!({
              "offers": resp.offers.into_iter().map(offer_json).collect::<Vec<_>>(),
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn offer_json(offer: Offer) -> serde_json::Value {
    let status_str = OfferStatus::try_from(offer.status)
        .ok()
        .map(|s| s.as_str_name().trim_start_matches("OFFER_STATUS_").to_lowercase())
        .unwrap_or_else(|| format!("unknown({})", offer.status));

    json!({
      "offer_id": offer.offer_id,
      "creator": offer.creator,
      "asset1_id": offer.asset1_id,
      "asset1_amount": offer.asset1_amount,
      "asset2_id": offer.asset2_id,
      "asset2_amount": offer.asset2_amount,
      "taker": (!offer.taker.is_empty()).then_some(offer.taker),
      "status": status_str,
      "created_at": offer.created_at,
      "updated_at": offer.updated_at,
      "expires_at": (offer.expires_at != 0).then_some(offer.expires_at),
    })
}
