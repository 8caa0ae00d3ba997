pub mod memory;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type AssetId = u64;
pub type PartyId = String;

/// Opaque reference to a deposit the ledger holds on behalf of an offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscrowHandle(pub String);

impl fmt::Display for EscrowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    Party(PartyId),
    Escrow(EscrowHandle),
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Account::Party(party) => write!(f, "party:{party}"),
            Account::Escrow(handle) => write!(f, "escrow:{handle}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub asset_id: AssetId,
    pub amount: u64,
    pub from: Account,
    pub to: PartyId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub transfer_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance: party={party} asset_id={asset_id} need={need} have={have}")]
    InsufficientBalance {
        party: PartyId,
        asset_id: AssetId,
        need: u64,
        have: u64,
    },

    #[error("unknown escrow handle: {0}")]
    UnknownEscrow(EscrowHandle),

    #[error("escrow {handle} does not match transfer: {detail}")]
    EscrowMismatch { handle: EscrowHandle, detail: String },

    #[error("ledger rejected request: {0}")]
    Rejected(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger did not confirm within {0:?}")]
    Timeout(Duration),
}

/// External ledger the escrow engine drives. Implementations own balances,
/// signatures and persistence of asset movements; the engine only sequences
/// calls around its own status transitions.
#[tonic::async_trait]
pub trait Ledger: Send + Sync {
    /// Moves `amount` of `asset_id` out of `from` into a hold.
    async fn escrow(
        &self,
        asset_id: AssetId,
        amount: u64,
        from: &str,
    ) -> Result<EscrowHandle, LedgerError>;

    /// Applies every transfer or none of them.
    async fn atomic_transfer(&self, transfers: &[Transfer]) -> Result<Committed, LedgerError>;

    /// Returns a held deposit to `to`.
    async fn release(&self, handle: &EscrowHandle, to: &str) -> Result<(), LedgerError>;

    /// Whether the hold behind `handle` still exists. A hold consumed by a
    /// committed transfer group, or released, is gone.
    async fn is_held(&self, handle: &EscrowHandle) -> Result<bool, LedgerError>;
}
