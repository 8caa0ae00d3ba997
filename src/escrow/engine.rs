use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use super::store::SqliteOfferStore;
use super::{EscrowError, OfferStatus, SwapOffer, unix_now};
use crate::ledger::{Account, AssetId, Ledger, LedgerError, Transfer};

const COMPLETION_ATTEMPTS: u32 = 5;
const COMPLETION_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on every ledger call. An accept whose transfer group is
    /// not confirmed in time is rolled back to `Open`.
    pub transfer_timeout: Duration,
    /// Applied to offers created without an explicit expiry.
    pub offer_ttl: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
            offer_ttl: None,
        }
    }
}

/// Outcome of a pass over offers left `Accepted`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    /// Offers whose transfer group had committed, now `Completed`.
    pub completed: usize,
    /// Offers whose escrow hold was still open, now `Open` again.
    pub reopened: usize,
}

/// Two-party swap offers over an external ledger.
///
/// Status changes go through compare-and-set in the store, so concurrent
/// callers racing on one offer see at most one winner; the store lock is
/// never held across a ledger call.
pub struct EscrowEngine<L> {
    cfg: EngineConfig,
    ledger: Arc<L>,
    store: Arc<Mutex<SqliteOfferStore>>,
}

impl<L: Ledger> EscrowEngine<L> {
    pub fn new(cfg: EngineConfig, ledger: Arc<L>, store: Arc<Mutex<SqliteOfferStore>>) -> Self {
        Self { cfg, ledger, store }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    fn store(&self) -> MutexGuard<'_, SqliteOfferStore> {
        self.store.lock().expect("store mutex poisoned")
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.cfg.transfer_timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(LedgerError::Timeout(self.cfg.transfer_timeout)),
        }
    }

    pub async fn create(
        &self,
        creator: &str,
        asset1_id: AssetId,
        asset1_amount: u64,
        asset2_id: AssetId,
        asset2_amount: u64,
    ) -> Result<SwapOffer, EscrowError> {
        let expires_at = self
            .cfg
            .offer_ttl
            .map(|ttl| unix_now().saturating_add(ttl.as_secs().max(1)));
        self.create_with_expiry(
            creator,
            asset1_id,
            asset1_amount,
            asset2_id,
            asset2_amount,
            expires_at,
        )
        .await
    }

    /// Escrows asset1 from `creator` and records a new `Open` offer. Nothing
    /// is written unless the ledger confirms the deposit.
    pub async fn create_with_expiry(
        &self,
        creator: &str,
        asset1_id: AssetId,
        asset1_amount: u64,
        asset2_id: AssetId,
        asset2_amount: u64,
        expires_at: Option<u64>,
    ) -> Result<SwapOffer, EscrowError> {
        if asset1_id == asset2_id {
            return Err(EscrowError::InvalidAsset(asset1_id));
        }
        if asset1_amount == 0 || asset2_amount == 0 {
            return Err(EscrowError::InvalidAmount {
                asset1_amount,
                asset2_amount,
            });
        }
        let now = unix_now();
        if let Some(expires_at) = expires_at
            && expires_at <= now
        {
            return Err(EscrowError::InvalidExpiry { expires_at, now });
        }

        let escrow_handle = self
            .bounded(self.ledger.escrow(asset1_id, asset1_amount, creator))
            .await
            .map_err(EscrowError::EscrowFailed)?;

        let now = unix_now();
        let offer = SwapOffer {
            offer_id: Uuid::new_v4().to_string(),
            creator: creator.to_string(),
            asset1_id,
            asset1_amount,
            asset2_id,
            asset2_amount,
            taker: None,
            status: OfferStatus::Open,
            escrow_handle,
            created_at: now,
            updated_at: now,
            expires_at,
        };

        let inserted = self.store().insert_offer(&offer);
        if let Err(err) = inserted {
            if let Err(release_err) = self
                .bounded(self.ledger.release(&offer.escrow_handle, creator))
                .await
            {
                tracing::error!(
                    escrow_handle = %offer.escrow_handle,
                    creator,
                    error = %release_err,
                    "release after failed insert did not commit"
                );
            }
            return Err(err.into());
        }

        tracing::info!(
            offer_id = %offer.offer_id,
            creator,
            asset1_id,
            asset1_amount,
            asset2_id,
            asset2_amount,
            "offer created"
        );
        Ok(offer)
    }

    /// Swaps the escrowed asset1 for the taker's asset2 in one ledger
    /// transfer group. Returns the `Completed` offer, or rolls the offer back
    /// to `Open` when the group does not commit.
    pub async fn accept(&self, taker: &str, offer_id: &str) -> Result<SwapOffer, EscrowError> {
        let mut offer = self.get(offer_id)?;
        if offer.creator == taker {
            return Err(EscrowError::SelfAccept(offer_id.to_string()));
        }
        if offer.status != OfferStatus::Open {
            return Err(EscrowError::NotOpen(offer_id.to_string()));
        }
        let now = unix_now();
        if let Some(expires_at) = offer.expires_at
            && now >= expires_at
        {
            return Err(EscrowError::Expired {
                offer_id: offer_id.to_string(),
                expires_at,
            });
        }

        let claimed = self.store().compare_and_set_status(
            offer_id,
            OfferStatus::Open,
            OfferStatus::Accepted,
            Some(taker),
            now,
        )?;
        if !claimed {
            return Err(EscrowError::NotOpen(offer_id.to_string()));
        }
        tracing::info!(offer_id, taker, "offer accepted, awaiting transfer");

        let transfers = [
            Transfer {
                asset_id: offer.asset1_id,
                amount: offer.asset1_amount,
                from: Account::Escrow(offer.escrow_handle.clone()),
                to: taker.to_string(),
            },
            Transfer {
                asset_id: offer.asset2_id,
                amount: offer.asset2_amount,
                from: Account::Party(taker.to_string()),
                to: offer.creator.clone(),
            },
        ];

        match self.bounded(self.ledger.atomic_transfer(&transfers)).await {
            Ok(committed) => {
                let now = self
                    .record_completion(offer_id, taker, &committed.transfer_id)
                    .await;
                tracing::info!(
                    offer_id,
                    taker,
                    transfer_id = %committed.transfer_id,
                    "offer completed"
                );

                offer.taker = Some(taker.to_string());
                offer.status = OfferStatus::Completed;
                offer.updated_at = now;
                Ok(offer)
            }
            Err(source) => {
                tracing::warn!(offer_id, taker, error = %source, "transfer failed, reopening offer");
                self.store().compare_and_set_status(
                    offer_id,
                    OfferStatus::Accepted,
                    OfferStatus::Open,
                    None,
                    unix_now(),
                )?;
                Err(EscrowError::TransferFailed {
                    offer_id: offer_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Persists `Accepted -> Completed` once the ledger has moved the assets.
    /// Never fails: a store that keeps refusing the write leaves the offer
    /// `Accepted` with its hold consumed, which `settle_committed` and
    /// `recover_in_flight` finish later.
    async fn record_completion(&self, offer_id: &str, taker: &str, transfer_id: &str) -> u64 {
        for attempt in 1..=COMPLETION_ATTEMPTS {
            let now = unix_now();
            let res = self.store().compare_and_set_status(
                offer_id,
                OfferStatus::Accepted,
                OfferStatus::Completed,
                Some(taker),
                now,
            );
            match res {
                Ok(true) => return now,
                Ok(false) => {
                    let current = self.store().get_offer(offer_id).ok().flatten();
                    if current.as_ref().map(|o| o.status) != Some(OfferStatus::Completed) {
                        tracing::error!(
                            offer_id,
                            transfer_id,
                            status = ?current.map(|o| o.status),
                            "offer was not accepted when its transfer committed"
                        );
                    }
                    return now;
                }
                Err(err) => {
                    tracing::warn!(
                        offer_id,
                        transfer_id,
                        attempt,
                        error = %err,
                        "recording completion failed"
                    );
                }
            }
            if attempt < COMPLETION_ATTEMPTS {
                tokio::time::sleep(COMPLETION_RETRY_DELAY * attempt).await;
            }
        }

        tracing::error!(
            offer_id,
            transfer_id,
            "completion not recorded, offer stays accepted until settled"
        );
        unix_now()
    }

    /// Cancels an `Open` offer and returns the escrowed asset1 to its creator.
    pub async fn cancel(&self, caller: &str, offer_id: &str) -> Result<SwapOffer, EscrowError> {
        let mut offer = self.get(offer_id)?;
        if offer.creator != caller {
            return Err(EscrowError::Unauthorized {
                offer_id: offer_id.to_string(),
                caller: caller.to_string(),
            });
        }
        if offer.status != OfferStatus::Open {
            return Err(EscrowError::NotOpen(offer_id.to_string()));
        }

        let now = unix_now();
        let claimed = self.store().compare_and_set_status(
            offer_id,
            OfferStatus::Open,
            OfferStatus::Cancelled,
            None,
            now,
        )?;
        if !claimed {
            return Err(EscrowError::NotOpen(offer_id.to_string()));
        }

        if let Err(source) = self
            .bounded(self.ledger.release(&offer.escrow_handle, &offer.creator))
            .await
        {
            tracing::warn!(offer_id, error = %source, "release failed, reopening offer");
            self.store().compare_and_set_status(
                offer_id,
                OfferStatus::Cancelled,
                OfferStatus::Open,
                None,
                unix_now(),
            )?;
            return Err(EscrowError::ReleaseFailed {
                offer_id: offer_id.to_string(),
                source,
            });
        }

        tracing::info!(offer_id, creator = %offer.creator, "offer cancelled");
        offer.status = OfferStatus::Cancelled;
        offer.updated_at = now;
        Ok(offer)
    }

    pub fn get(&self, offer_id: &str) -> Result<SwapOffer, EscrowError> {
        let offer = self.store().get_offer(offer_id)?;
        offer.ok_or_else(|| EscrowError::NotFound(offer_id.to_string()))
    }

    pub fn list(&self, status: Option<OfferStatus>) -> Result<Vec<SwapOffer>, EscrowError> {
        Ok(self.store().list_offers(status)?)
    }

    /// Cancels every `Open` offer whose expiry is at or before `now`,
    /// returning the ids that were cancelled.
    pub async fn expire_stale(&self, now: u64) -> Result<Vec<String>, EscrowError> {
        let open = self.list(Some(OfferStatus::Open))?;

        let mut expired = Vec::new();
        for offer in open.into_iter().filter(|o| o.is_expired(now)) {
            match self.cancel(&offer.creator, &offer.offer_id).await {
                Ok(_) => {
                    tracing::info!(offer_id = %offer.offer_id, "expired offer cancelled");
                    expired.push(offer.offer_id);
                }
                Err(EscrowError::NotOpen(_)) => {}
                Err(err) => {
                    tracing::warn!(offer_id = %offer.offer_id, error = %err, "expire offer failed");
                }
            }
        }
        Ok(expired)
    }

    /// Completes `Accepted` offers whose escrow hold the ledger no longer
    /// has. A consumed hold means the transfer group committed, so this is
    /// safe to run while accepts are in flight.
    pub async fn settle_committed(&self) -> Result<usize, EscrowError> {
        let settled = self.settle_accepted(false).await?;
        Ok(settled.completed)
    }

    /// Resolves offers left `Accepted` by a process that stopped while
    /// waiting on the ledger: committed ones complete, the rest reopen. Must
    /// run before the engine serves requests.
    pub async fn recover_in_flight(&self) -> Result<Recovered, EscrowError> {
        self.settle_accepted(true).await
    }

    async fn settle_accepted(&self, reopen: bool) -> Result<Recovered, EscrowError> {
        let in_flight = self.list(Some(OfferStatus::Accepted))?;

        let mut out = Recovered::default();
        for offer in in_flight {
            let held = match self.bounded(self.ledger.is_held(&offer.escrow_handle)).await {
                Ok(held) => held,
                Err(err) => {
                    tracing::warn!(offer_id = %offer.offer_id, error = %err, "hold lookup failed");
                    continue;
                }
            };
            let taker = offer.taker.as_deref().unwrap_or_default();

            if !held {
                let completed = self.store().compare_and_set_status(
                    &offer.offer_id,
                    OfferStatus::Accepted,
                    OfferStatus::Completed,
                    offer.taker.as_deref(),
                    unix_now(),
                )?;
                if completed {
                    tracing::info!(offer_id = %offer.offer_id, taker, "completed offer with committed transfer");
                    out.completed += 1;
                }
            } else if reopen {
                let reopened = self.store().compare_and_set_status(
                    &offer.offer_id,
                    OfferStatus::Accepted,
                    OfferStatus::Open,
                    None,
                    unix_now(),
                )?;
                if reopened {
                    tracing::warn!(offer_id = %offer.offer_id, taker, "reopened in-flight offer");
                    out.reopened += 1;
                }
            }
        }
        Ok(out)
    }

    /// Drops `Cancelled` and `Completed` offers untouched for `retention`.
    /// Retention is raised to more than `transfer_timeout`, since a cancel
    /// whose release fails shows `Cancelled` until it reopens the offer.
    pub fn purge_terminal(&self, now: u64, retention: Duration) -> Result<usize, EscrowError> {
        let floor = self.cfg.transfer_timeout.as_secs() + 1;
        let cutoff = now.saturating_sub(retention.as_secs().max(floor));
        let purged = self.store().purge_terminal(cutoff)?;
        if purged > 0 {
            tracing::info!(purged, cutoff, "purged terminal offers");
        }
        Ok(purged)
    }
}
