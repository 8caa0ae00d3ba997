use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::escrow::engine::EscrowEngine;
use crate::escrow::{EscrowError, OfferStatus, SwapOffer};
use crate::ledger::Ledger;
use crate::proto::v1 as pb;

pub struct EscrowServiceImpl<L> {
    engine: Arc<EscrowEngine<L>>,
}

impl<L> Clone for EscrowServiceImpl<L> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<L: Ledger> EscrowServiceImpl<L> {
    pub fn new(engine: Arc<EscrowEngine<L>>) -> Self {
        Self { engine }
    }

    fn offer_to_proto(offer: &SwapOffer) -> pb::Offer {
        pb::Offer {
            offer_id: offer.offer_id.clone(),
            creator: offer.creator.clone(),
            asset1_id: offer.asset1_id,
            asset1_amount: offer.asset1_amount,
            asset2_id: offer.asset2_id,
            asset2_amount: offer.asset2_amount,
            taker: offer.taker.clone().unwrap_or_default(),
            status: status_to_proto(offer.status) as i32,
            created_at: offer.created_at,
            updated_at: offer.updated_at,
            expires_at: offer.expires_at.unwrap_or(0),
        }
    }
}

fn status_to_proto(status: OfferStatus) -> pb::OfferStatus {
    match status {
        OfferStatus::Open => pb::OfferStatus::Open,
        OfferStatus::Accepted => pb::OfferStatus::Accepted,
        OfferStatus::Cancelled => pb::OfferStatus::Cancelled,
        OfferStatus::Completed => pb::OfferStatus::Completed,
    }
}

fn status_from_proto(status: i32) -> Result<Option<OfferStatus>, Status> {
    match pb::OfferStatus::try_from(status) {
        Ok(pb::OfferStatus::Unspecified) => Ok(None),
        Ok(pb::OfferStatus::Open) => Ok(Some(OfferStatus::Open)),
        Ok(pb::OfferStatus::Accepted) => Ok(Some(OfferStatus::Accepted)),
        Ok(pb::OfferStatus::Cancelled) => Ok(Some(OfferStatus::Cancelled)),
        Ok(pb::OfferStatus::Completed) => Ok(Some(OfferStatus::Completed)),
        Err(_) => Err(Status::invalid_argument(format!(
            "unknown offer status: {status}"
        ))),
    }
}

fn error_to_status(err: EscrowError) -> Status {
    match &err {
        EscrowError::InvalidAsset(_)
        | EscrowError::InvalidAmount { .. }
        | EscrowError::InvalidExpiry { .. }
        | EscrowError::SelfAccept(_) => Status::invalid_argument(err.to_string()),
        EscrowError::NotFound(_) => Status::not_found(err.to_string()),
        EscrowError::NotOpen(_) | EscrowError::Expired { .. } => {
            Status::failed_precondition(err.to_string())
        }
        EscrowError::Unauthorized { .. } => Status::permission_denied(err.to_string()),
        EscrowError::TransferFailed { .. } | EscrowError::ReleaseFailed { .. } => {
            Status::aborted(err.to_string())
        }
        EscrowError::EscrowFailed(_) => Status::unavailable(err.to_string()),
        EscrowError::Store(_) => {
            tracing::error!(error = %err, "offer store error");
            Status::internal(format!("offer store: {err:#}"))
        }
    }
}

fn required(value: &str, field: &str) -> Result<(), Status> {
    if value.trim().is_empty() {
        return Err(Status::invalid_argument(format!("{field} is required")));
    }
    Ok(())
}

#[tonic::async_trait]
impl<L: Ledger + 'static> pb::escrow_service_server::EscrowService for EscrowServiceImpl<L> {
    async fn create_offer(
        &self,
        request: Request<pb::CreateOfferRequest>,
    ) -> Result<Response<pb::Offer>, Status> {
        let req = request.into_inner();
        required(&req.creator, "creator")?;

        let created = if req.expires_at == 0 {
            self.engine
                .create(
                    &req.creator,
                    req.asset1_id,
                    req.asset1_amount,
                    req.asset2_id,
                    req.asset2_amount,
                )
                .await
        } else {
            self.engine
                .create_with_expiry(
                    &req.creator,
                    req.asset1_id,
                    req.asset1_amount,
                    req.asset2_id,
                    req.asset2_amount,
                    Some(req.expires_at),
                )
                .await
        };
        let offer = created.map_err(error_to_status)?;

        Ok(Response::new(Self::offer_to_proto(&offer)))
    }

    async fn accept_offer(
        &self,
        request: Request<pb::AcceptOfferRequest>,
    ) -> Result<Response<pb::Offer>, Status> {
        let req = request.into_inner();
        required(&req.offer_id, "offer_id")?;
        required(&req.taker, "taker")?;

        let offer = self
            .engine
            .accept(&req.taker, &req.offer_id)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(Self::offer_to_proto(&offer)))
    }

    async fn cancel_offer(
        &self,
        request: Request<pb::CancelOfferRequest>,
    ) -> Result<Response<pb::Offer>, Status> {
        let req = request.into_inner();
        required(&req.offer_id, "offer_id")?;
        required(&req.caller, "caller")?;

        let offer = self
            .engine
            .cancel(&req.caller, &req.offer_id)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(Self::offer_to_proto(&offer)))
    }

    async fn get_offer(
        &self,
        request: Request<pb::GetOfferRequest>,
    ) -> Result<Response<pb::Offer>, Status> {
        let req = request.into_inner();
        required(&req.offer_id, "offer_id")?;

        let offer = self.engine.get(&req.offer_id).map_err(error_to_status)?;
        Ok(Response::new(Self::offer_to_proto(&offer)))
    }

    async fn list_offers(
        &self,
        request: Request<pb::ListOffersRequest>,
    ) -> Result<Response<pb::ListOffersResponse>, Status> {
        let req = request.into_inner();
        let status = status_from_proto(req.status)?;

        let offers = self
            .engine
            .list(status)
            .map_err(error_to_status)?
            .iter()
            .map(Self::offer_to_proto)
            .collect();
        Ok(Response::new(pb::ListOffersResponse { offers }))
    }
}
