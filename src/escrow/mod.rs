pub mod engine;
pub mod service;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ledger::{AssetId, EscrowHandle, LedgerError, PartyId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Open,
    Accepted,
    Cancelled,
    Completed,
}

impl OfferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OfferStatus::Cancelled | OfferStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOffer {
    pub offer_id: String,
    pub creator: PartyId,

    pub asset1_id: AssetId,
    pub asset1_amount: u64,
    pub asset2_id: AssetId,
    pub asset2_amount: u64,

    /// Set only while the offer is `Accepted` or once it is `Completed`.
    pub taker: Option<PartyId>,
    pub status: OfferStatus,
    pub escrow_handle: EscrowHandle,

    pub created_at: u64,
    pub updated_at: u64,
    pub expires_at: Option<u64>,
}

impl SwapOffer {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("asset1_id and asset2_id must differ: both are {0}")]
    InvalidAsset(AssetId),

    #[error("amounts must be > 0: asset1_amount={asset1_amount} asset2_amount={asset2_amount}")]
    InvalidAmount {
        asset1_amount: u64,
        asset2_amount: u64,
    },

    #[error("expiry {expires_at} is not after now ({now})")]
    InvalidExpiry { expires_at: u64, now: u64 },

    #[error("offer not found: {0}")]
    NotFound(String),

    #[error("offer not open: {0}")]
    NotOpen(String),

    #[error("creator cannot accept its own offer: {0}")]
    SelfAccept(String),

    #[error("only the creator may cancel offer {offer_id}: caller={caller}")]
    Unauthorized { offer_id: String, caller: PartyId },

    #[error("offer {offer_id} expired at {expires_at}")]
    Expired { offer_id: String, expires_at: u64 },

    #[error("escrow deposit failed: {0}")]
    EscrowFailed(#[source] LedgerError),

    #[error("transfer for offer {offer_id} did not commit: {source}")]
    TransferFailed {
        offer_id: String,
        #[source]
        source: LedgerError,
    },

    #[error("release for offer {offer_id} did not commit: {source}")]
    ReleaseFailed {
        offer_id: String,
        #[source]
        source: LedgerError,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
