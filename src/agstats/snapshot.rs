//! Hourly balance snapshots.
//!
//! Invoked every minute but gated to one snapshot per hour. Hours missed
//! while the process was down are not backfilled; only the current hour is
//! captured on resume.

use crate::agcommon::assets::AssetCache;
use crate::agcommon::db::{self, Database};
use crate::agcommon::error::{AppError, Result};
use crate::agcommon::rates::{usd_amount, ExchangeRates};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

pub struct BalanceSnapshotter {
    db: Arc<Database>,
    assets: Arc<AssetCache>,
    rates: ExchangeRates,
}

impl BalanceSnapshotter {
    pub fn new(db: Arc<Database>, assets: Arc<AssetCache>, rates: ExchangeRates) -> Self {
        Self { db, assets, rates }
    }

    /// Snapshot the live balances for the current wall-clock hour.
    pub fn snapshot(&self) -> Result<()> {
        self.snapshot_at(Utc::now().timestamp())
    }

    /// Snapshot at an explicit point in time. Split out so tests can drive
    /// the hour directly.
    pub fn snapshot_at(&self, now_secs: i64) -> Result<()> {
        let current_hour = now_secs / 3600;
        let last_hour = self.db.last_snapshot_hour()?;
        if current_hour <= last_hour {
            debug!("hour {} already snapshotted, skipping", current_hour);
            return Ok(());
        }

        info!(
            "snapshotting balances for hour {} (last was {})",
            current_hour, last_hour
        );

        let date = db::period_start_date(current_hour * 3600);
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let balances = db::read_live_balances(&tx)?;
        let rates = self.rates.read().unwrap();
        let mut inserted = 0usize;

        for row in balances {
            // the ledger stores the base currency under a sentinel string
            let asset = if row.asset == "base" { None } else { Some(row.asset) };

            if let Some(asset_id) = asset.as_deref() {
                if self.assets.is_empty() {
                    return Err(AppError::AggregationError(
                        "asset metadata cache is empty, refusing to snapshot".to_string(),
                    ));
                }
                // an uncapped asset held by its own definer is self-minted
                // supply, not locked value
                if let Some(info) = db::read_asset_info(&tx, asset_id)? {
                    if info.cap.unwrap_or(0) == 0 && info.definer_address == row.address {
                        continue;
                    }
                }
            }

            let usd_balance = usd_amount(&rates, &self.assets, asset.as_deref(), row.balance);
            db::insert_balance_snapshot(
                &tx,
                current_hour,
                &date,
                &row.address,
                asset.as_deref(),
                row.balance,
                usd_balance,
            )?;
            inserted += 1;
        }

        tx.commit()?;
        info!("balance snapshot done, hour {}: {} rows", current_hour, inserted);
        Ok(())
    }
}
