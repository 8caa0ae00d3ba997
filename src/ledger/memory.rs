use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use uuid::Uuid;

use super::{Account, AssetId, Committed, EscrowHandle, Ledger, LedgerError, PartyId, Transfer};

/// Initial balance for a party, written as `party:asset_id:amount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Funding {
    pub party: PartyId,
    pub asset_id: AssetId,
    pub amount: u64,
}

impl FromStr for Funding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, ':');
        let amount = parts.next().context("missing amount")?;
        let asset_id = parts.next().context("missing asset_id")?;
        let party = parts.next().context("missing party")?;
        anyhow::ensure!(!party.is_empty(), "party must not be empty");

        Ok(Self {
            party: party.to_string(),
            asset_id: asset_id
                .parse()
                .with_context(|| format!("invalid asset_id {asset_id}"))?,
            amount: amount
                .parse()
                .with_context(|| format!("invalid amount {amount}"))?,
        })
    }
}

#[derive(Debug, Clone)]
struct Hold {
    asset_id: AssetId,
    amount: u64,
    owner: PartyId,
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    balances: HashMap<(PartyId, AssetId), u64>,
    holds: HashMap<EscrowHandle, Hold>,
}

impl LedgerState {
    fn balance(&self, party: &str, asset_id: AssetId) -> u64 {
        self.balances
            .get(&(party.to_string(), asset_id))
            .copied()
            .unwrap_or(0)
    }

    fn debit(&mut self, party: &str, asset_id: AssetId, amount: u64) -> Result<(), LedgerError> {
        let have = self.balance(party, asset_id);
        if have < amount {
            return Err(LedgerError::InsufficientBalance {
                party: party.to_string(),
                asset_id,
                need: amount,
                have,
            });
        }
        self.balances
            .insert((party.to_string(), asset_id), have - amount);
        Ok(())
    }

    fn credit(&mut self, party: &str, asset_id: AssetId, amount: u64) -> Result<(), LedgerError> {
        let balance = self
            .balances
            .entry((party.to_string(), asset_id))
            .or_insert(0);
        *balance = balance.checked_add(amount).ok_or_else(|| {
            LedgerError::Rejected(format!(
                "balance overflow: party={party} asset_id={asset_id}"
            ))
        })?;
        Ok(())
    }

    fn take_hold(
        &mut self,
        handle: &EscrowHandle,
        asset_id: AssetId,
        amount: u64,
    ) -> Result<Hold, LedgerError> {
        let hold = self
            .holds
            .get(handle)
            .ok_or_else(|| LedgerError::UnknownEscrow(handle.clone()))?;
        if hold.asset_id != asset_id || hold.amount != amount {
            return Err(LedgerError::EscrowMismatch {
                handle: handle.clone(),
                detail: format!(
                    "held asset_id={} amount={}, requested asset_id={asset_id} amount={amount}",
                    hold.asset_id, hold.amount
                ),
            });
        }
        self.holds
            .remove(handle)
            .ok_or_else(|| LedgerError::UnknownEscrow(handle.clone()))
    }

    fn apply(&mut self, transfer: &Transfer) -> Result<(), LedgerError> {
        if transfer.amount == 0 {
            return Err(LedgerError::Rejected(format!(
                "zero amount transfer of asset_id={}",
                transfer.asset_id
            )));
        }
        match &transfer.from {
            Account::Party(party) => self.debit(party, transfer.asset_id, transfer.amount)?,
            Account::Escrow(handle) => {
                self.take_hold(handle, transfer.asset_id, transfer.amount)?;
            }
        }
        self.credit(&transfer.to, transfer.asset_id, transfer.amount)
    }
}

/// Process-local ledger with per-party balances and escrow holds. Used by the
/// demo server and tests in place of a real chain.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fund(&self, party: &str, asset_id: AssetId, amount: u64) -> Result<(), LedgerError> {
        self.state
            .lock()
            .expect("ledger mutex poisoned")
            .credit(party, asset_id, amount)
    }

    pub fn balance(&self, party: &str, asset_id: AssetId) -> u64 {
        self.state
            .lock()
            .expect("ledger mutex poisoned")
            .balance(party, asset_id)
    }

    /// Amount currently held under `handle`, if the hold is still open.
    pub fn held(&self, handle: &EscrowHandle) -> Option<u64> {
        self.state
            .lock()
            .expect("ledger mutex poisoned")
            .holds
            .get(handle)
            .map(|hold| hold.amount)
    }
}

#[tonic::async_trait]
impl Ledger for InMemoryLedger {
    async fn escrow(
        &self,
        asset_id: AssetId,
        amount: u64,
        from: &str,
    ) -> Result<EscrowHandle, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::Rejected("escrow amount must be > 0".to_string()));
        }

        let mut state = self.state.lock().expect("ledger mutex poisoned");
        state.debit(from, asset_id, amount)?;

        let handle = EscrowHandle(Uuid::new_v4().to_string());
        state.holds.insert(
            handle.clone(),
            Hold {
                asset_id,
                amount,
                owner: from.to_string(),
            },
        );
        tracing::debug!(%handle, asset_id, amount, from, "escrow hold created");
        Ok(handle)
    }

    async fn atomic_transfer(&self, transfers: &[Transfer]) -> Result<Committed, LedgerError> {
        if transfers.is_empty() {
            return Err(LedgerError::Rejected("empty transfer group".to_string()));
        }

        let mut state = self.state.lock().expect("ledger mutex poisoned");
        let mut next = state.clone();
        for transfer in transfers {
            next.apply(transfer)?;
        }
        *state = next;

        let transfer_id = Uuid::new_v4().to_string();
        tracing::debug!(%transfer_id, legs = transfers.len(), "transfer group committed");
        Ok(Committed { transfer_id })
    }

    async fn release(&self, handle: &EscrowHandle, to: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().expect("ledger mutex poisoned");
        let hold = state
            .holds
            .remove(handle)
            .ok_or_else(|| LedgerError::UnknownEscrow(handle.clone()))?;
        if let Err(err) = state.credit(to, hold.asset_id, hold.amount) {
            state.holds.insert(handle.clone(), hold);
            return Err(err);
        }
        tracing::debug!(%handle, owner = %hold.owner, to, "escrow hold released");
        Ok(())
    }

    async fn is_held(&self, handle: &EscrowHandle) -> Result<bool, LedgerError> {
        Ok(self.held(handle).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_parses_party_with_colons() {
        let funding: Funding = "addr:alice:100:5000".parse().unwrap();
        assert_eq!(funding.party, "addr:alice");
        assert_eq!(funding.asset_id, 100);
        assert_eq!(funding.amount, 5000);

        assert!("100:5000".parse::<Funding>().is_err());
        assert!(":100:5000".parse::<Funding>().is_err());
        assert!("alice:x:5000".parse::<Funding>().is_err());
    }

    #[tokio::test]
    async fn failed_leg_leaves_balances_untouched() {
        let ledger = InMemoryLedger::new();
        ledger.fund("alice", 100, 50).unwrap();
        ledger.fund("bob", 200, 10).unwrap();

        let handle = ledger.escrow(100, 50, "alice").await.unwrap();
        assert_eq!(ledger.balance("alice", 100), 0);
        assert_eq!(ledger.held(&handle), Some(50));

        let err = ledger
            .atomic_transfer(&[
                Transfer {
                    asset_id: 100,
                    amount: 50,
                    from: Account::Escrow(handle.clone()),
                    to: "bob".to_string(),
                },
                Transfer {
                    asset_id: 200,
                    amount: 30,
                    from: Account::Party("bob".to_string()),
                    to: "alice".to_string(),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { need: 30, have: 10, .. }));

        assert_eq!(ledger.held(&handle), Some(50));
        assert!(ledger.is_held(&handle).await.unwrap());
        assert_eq!(ledger.balance("bob", 100), 0);
        assert_eq!(ledger.balance("bob", 200), 10);

        ledger.release(&handle, "alice").await.unwrap();
        assert_eq!(ledger.held(&handle), None);
        assert!(!ledger.is_held(&handle).await.unwrap());
        assert_eq!(ledger.balance("alice", 100), 50);
    }
}
