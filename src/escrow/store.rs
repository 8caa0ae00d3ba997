use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, Row, params};

use super::{OfferStatus, SwapOffer};
use crate::ledger::EscrowHandle;

const OFFER_COLUMNS: &str = r#"
  offer_id,
  creator,
  asset1_id,
  asset1_amount,
  asset2_id,
  asset2_amount,
  taker,
  status,
  escrow_handle,
  created_at,
  updated_at,
  expires_at
"#;

#[derive(Debug)]
pub struct SqliteOfferStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteOfferStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create offer store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_offer(&mut self, offer: &SwapOffer) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO offers (
  offer_id,
  creator,
  asset1_id,
  asset1_amount,
  asset2_id,
  asset2_amount,
  taker,
  status,
  escrow_handle,
  created_at,
  updated_at,
  expires_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
)
"#,
                params![
                    &offer.offer_id,
                    &offer.creator,
                    offer.asset1_id,
                    offer.asset1_amount,
                    offer.asset2_id,
                    offer.asset2_amount,
                    offer.taker.as_deref(),
                    status_to_str(offer.status),
                    &offer.escrow_handle.0,
                    offer.created_at,
                    offer.updated_at,
                    offer.expires_at,
                ],
            )
            .with_context(|| format!("insert offer {}", offer.offer_id))?;
        Ok(())
    }

    pub fn get_offer(&self, offer_id: &str) -> Result<Option<SwapOffer>> {
        self.conn
            .query_row(
                &format!("SELECT {OFFER_COLUMNS} FROM offers WHERE offer_id = ?1"),
                params![offer_id],
                offer_from_row,
            )
            .optional()
            .with_context(|| format!("get offer {offer_id}"))
    }

    /// Lists offers oldest first, optionally restricted to one status.
    pub fn list_offers(&self, status: Option<OfferStatus>) -> Result<Vec<SwapOffer>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
SELECT {OFFER_COLUMNS}
FROM offers
WHERE ?1 IS NULL OR status = ?1
ORDER BY created_at, offer_id
"#
            ))
            .context("prepare list offers")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map(params![status.map(status_to_str)], offer_from_row)
            .context("query list offers")?;

        for row in rows {
            out.push(row.context("read offer row")?);
        }
        Ok(out)
    }

    /// Moves `offer_id` from `expected` to `next` and overwrites `taker`.
    /// Returns false without touching the row when the stored status is not
    /// `expected`.
    pub fn compare_and_set_status(
        &mut self,
        offer_id: &str,
        expected: OfferStatus,
        next: OfferStatus,
        taker: Option<&str>,
        now: u64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE offers
SET status = ?3, taker = ?4, updated_at = ?5
WHERE offer_id = ?1 AND status = ?2
"#,
                params![
                    offer_id,
                    status_to_str(expected),
                    status_to_str(next),
                    taker,
                    now
                ],
            )
            .with_context(|| format!("update offer status {offer_id}"))?;
        Ok(rows == 1)
    }

    /// Deletes terminal offers last updated before `cutoff`.
    pub fn purge_terminal(&mut self, cutoff: u64) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM offers WHERE status IN ('cancelled', 'completed') AND updated_at < ?1",
                params![cutoff],
            )
            .context("purge terminal offers")
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS offers (
  offer_id TEXT PRIMARY KEY,
  creator TEXT NOT NULL,
  asset1_id INTEGER NOT NULL,
  asset1_amount INTEGER NOT NULL,
  asset2_id INTEGER NOT NULL,
  asset2_amount INTEGER NOT NULL,
  taker TEXT,
  status TEXT NOT NULL,
  escrow_handle TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  expires_at INTEGER,
  CHECK (asset1_id != asset2_id),
  CHECK (asset1_amount > 0 AND asset2_amount > 0),
  CHECK ((taker IS NOT NULL) = (status IN ('accepted', 'completed')))
);
CREATE INDEX IF NOT EXISTS offers_status_idx ON offers(status);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn offer_from_row(row: &Row<'_>) -> rusqlite::Result<SwapOffer> {
    let status_str: String = row.get(7)?;
    let expires_at: Option<i64> = row.get(11)?;
    Ok(SwapOffer {
        offer_id: row.get(0)?,
        creator: row.get(1)?,
        asset1_id: u64_column(row, 2, "asset1_id")?,
        asset1_amount: u64_column(row, 3, "asset1_amount")?,
        asset2_id: u64_column(row, 4, "asset2_id")?,
        asset2_amount: u64_column(row, 5, "asset2_amount")?,
        taker: row.get(6)?,
        status: status_from_str(&status_str, 7)?,
        escrow_handle: EscrowHandle(row.get(8)?),
        created_at: u64_column(row, 9, "created_at")?,
        updated_at: u64_column(row, 10, "updated_at")?,
        expires_at: expires_at
            .map(|v| non_negative(v, 11, "expires_at"))
            .transpose()?,
    })
}

fn u64_column(row: &Row<'_>, col: usize, name: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(col)?;
    non_negative(value, col, name)
}

fn non_negative(value: i64, col: usize, name: &str) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("invalid {name} {value}").into(),
        )
    })
}

fn status_to_str(status: OfferStatus) -> &'static str {
    match status {
        OfferStatus::Open => "open",
        OfferStatus::Accepted => "accepted",
        OfferStatus::Cancelled => "cancelled",
        OfferStatus::Completed => "completed",
    }
}

fn status_from_str(s: &str, col: usize) -> rusqlite::Result<OfferStatus> {
    match s {
        "open" => Ok(OfferStatus::Open),
        "accepted" => Ok(OfferStatus::Accepted),
        "cancelled" => Ok(OfferStatus::Cancelled),
        "completed" => Ok(OfferStatus::Completed),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown offer status: {other}").into(),
        )),
    }
}
