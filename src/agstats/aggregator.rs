//! Incremental period aggregation.
//!
//! Each pass pulls every ledger response past the stored watermark, merges
//! the inflow and outflow query results into (period, address, asset)
//! buckets, and commits each fully-observed period in its own transaction.
//! The watermark only advances after a commit succeeds, so a crash or a
//! failed commit simply replays the same range on the next tick.

use crate::agcommon::assets::{AssetCache, AssetMetadataResolver};
use crate::agcommon::db::Database;
use crate::agcommon::error::Result;
use crate::agcommon::models::{FlowRow, PeriodBucket, StatsInsert, Timeframe};
use crate::agcommon::rates::{usd_amount, ExchangeRates};
use crate::agstats::scheduler::InFlightRegistry;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct PeriodAggregator {
    db: Arc<Database>,
    assets: Arc<AssetCache>,
    rates: ExchangeRates,
    resolver: Arc<dyn AssetMetadataResolver>,
    in_flight: InFlightRegistry,
}

impl PeriodAggregator {
    pub fn new(
        db: Arc<Database>,
        assets: Arc<AssetCache>,
        rates: ExchangeRates,
        resolver: Arc<dyn AssetMetadataResolver>,
    ) -> Self {
        Self {
            db,
            assets,
            rates,
            resolver,
            in_flight: InFlightRegistry::new(),
        }
    }

    /// Run one aggregation pass for the given timeframe.
    ///
    /// Safe to call again while a pass for the same timeframe is in flight:
    /// the second call is a no-op. Passes for different timeframes touch
    /// disjoint tables and watermark keys and may overlap freely.
    pub async fn aggregate(&self, timeframe: Timeframe) -> Result<()> {
        let Some(_guard) = self.in_flight.try_begin(timeframe.watermark_key()) else {
            debug!("aggregation pass for {:?} already in flight, skipping", timeframe);
            return Ok(());
        };

        let mut watermark = self.db.get_watermark(timeframe.watermark_key())?.unwrap_or(0);
        debug!(
            "aggregating {:?} from response id {}",
            timeframe, watermark
        );

        let inflows = self.db.fetch_inflows(timeframe.minutes(), watermark)?;
        let outflows = self.db.fetch_outflows(timeframe.minutes(), watermark)?;
        let buckets = merge_flows(inflows, outflows);
        if buckets.is_empty() {
            return Ok(());
        }

        // Every distinct asset must be resolvable before USD conversion.
        let missing = self
            .assets
            .missing_from(buckets.iter().filter_map(|b| b.asset.as_deref()));
        if !missing.is_empty() {
            let resolved = self.resolver.resolve(Some(&missing)).await?;
            self.assets.merge(resolved);
        }

        // Streaming close-on-boundary: a period is provably complete once a
        // row with a strictly greater period shows up in the sorted walk.
        // The trailing period stays open for the next pass.
        let mut last_period = 0i64;
        let mut pending: Vec<PeriodBucket> = Vec::new();
        for bucket in buckets {
            if last_period > 0 && bucket.period > last_period {
                self.close_period(timeframe, last_period, &pending, watermark)?;
                pending.clear();
            }
            last_period = bucket.period;
            watermark = watermark.max(bucket.last_response_id);
            pending.push(bucket);
        }

        Ok(())
    }

    /// Commit one closed period and advance the watermark. The inserts share
    /// a single transaction; the watermark write happens only after it
    /// commits.
    fn close_period(
        &self,
        timeframe: Timeframe,
        period: i64,
        buckets: &[PeriodBucket],
        watermark: i64,
    ) -> Result<()> {
        let rows: Vec<StatsInsert> = {
            let rates = self.rates.read().unwrap();
            buckets
                .iter()
                .map(|b| StatsInsert {
                    address: b.address.clone(),
                    asset: b.asset.clone(),
                    amount_in: b.amount_in,
                    amount_out: b.amount_out,
                    usd_amount_in: usd_amount(&rates, &self.assets, b.asset.as_deref(), b.amount_in),
                    usd_amount_out: usd_amount(&rates, &self.assets, b.asset.as_deref(), b.amount_out),
                    triggers_count: b.triggers_count,
                    bounced_count: b.bounced_count,
                    num_users: b.num_users,
                })
                .collect()
        };

        let count = self.db.commit_period(timeframe, period, &rows)?;
        self.db.put_watermark(timeframe.watermark_key(), watermark)?;
        info!(
            "aggregated {:?} period {}: {} rows, watermark now {}",
            timeframe, period, count, watermark
        );
        Ok(())
    }
}

/// Merge the two query sides into one bucket per (period, address, asset),
/// sorted by period ascending.
///
/// When both sides hit the same key, the outflow row contributes its amount
/// and raises the max response id; the inflow side's trigger/bounce/user
/// counters survive (both sides count the same responses, just grouped over
/// different outputs).
pub fn merge_flows(inflows: Vec<FlowRow>, outflows: Vec<FlowRow>) -> Vec<PeriodBucket> {
    let mut map: HashMap<(i64, String, Option<String>), PeriodBucket> = HashMap::new();

    for row in inflows {
        let key = (row.period, row.address.clone(), row.asset.clone());
        map.insert(key, PeriodBucket::from_inflow(row));
    }
    for row in outflows {
        let key = (row.period, row.address.clone(), row.asset.clone());
        match map.entry(key) {
            Entry::Occupied(mut entry) => {
                let bucket = entry.get_mut();
                bucket.last_response_id = bucket.last_response_id.max(row.last_response_id);
                bucket.amount_out = row.amount;
            }
            Entry::Vacant(entry) => {
                entry.insert(PeriodBucket::from_outflow(row));
            }
        }
    }

    let mut buckets: Vec<PeriodBucket> = map.into_values().collect();
    buckets.sort_by_key(|b| b.period);
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agcommon::rates::{new_exchange_rates, BASE_RATE_KEY};
    use crate::agcommon::testutil::{create_ledger_tables, seed_event, test_db, StubResolver};
    use rusqlite::params;

    fn flow(id: i64, period: i64, address: &str, asset: Option<&str>, amount: i64) -> FlowRow {
        FlowRow {
            last_response_id: id,
            period,
            address: address.to_string(),
            asset: asset.map(|a| a.to_string()),
            amount,
            triggers_count: 1,
            bounced_count: 0,
            num_users: 1,
        }
    }

    #[test]
    fn merge_inflow_only_has_zero_outflow() {
        let buckets = merge_flows(vec![flow(1, 100, "A", None, 500)], vec![]);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].amount_in, 500);
        assert_eq!(buckets[0].amount_out, 0);
        assert_eq!(buckets[0].last_response_id, 1);
    }

    #[test]
    fn merge_outflow_only_has_zero_inflow() {
        let buckets = merge_flows(vec![], vec![flow(2, 100, "A", None, 300)]);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].amount_in, 0);
        assert_eq!(buckets[0].amount_out, 300);
    }

    #[test]
    fn merge_both_sides_keeps_independent_sums_and_max_id() {
        let mut inflow = flow(3, 100, "A", Some("tok"), 500);
        inflow.triggers_count = 2;
        inflow.num_users = 2;
        let mut outflow = flow(7, 100, "A", Some("tok"), 300);
        outflow.triggers_count = 1;
        outflow.num_users = 1;

        let buckets = merge_flows(vec![inflow], vec![outflow]);
        assert_eq!(buckets.len(), 1);
        let b = &buckets[0];
        assert_eq!(b.amount_in, 500);
        assert_eq!(b.amount_out, 300);
        assert_eq!(b.last_response_id, 7);
        // the inflow side's counters survive the merge
        assert_eq!(b.triggers_count, 2);
        assert_eq!(b.num_users, 2);
    }

    #[test]
    fn merge_sorts_by_period() {
        let buckets = merge_flows(
            vec![flow(5, 102, "A", None, 1), flow(1, 100, "A", None, 1)],
            vec![flow(3, 101, "B", None, 2)],
        );
        let periods: Vec<i64> = buckets.iter().map(|b| b.period).collect();
        assert_eq!(periods, vec![100, 101, 102]);
    }

    // ------------------------------------------------------------------
    // End-to-end passes against a real database
    // ------------------------------------------------------------------

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        rates: ExchangeRates,
        aggregator: PeriodAggregator,
    }

    fn fixture(resolver: StubResolver) -> Fixture {
        let (dir, db) = test_db();
        create_ledger_tables(&db);
        let db = Arc::new(db);
        let assets = Arc::new(AssetCache::new());
        let rates = new_exchange_rates();
        let aggregator = PeriodAggregator::new(
            db.clone(),
            assets,
            rates.clone(),
            Arc::new(resolver),
        );
        Fixture {
            _dir: dir,
            db,
            rates,
            aggregator,
        }
    }

    /// All hourly stats rows, ordered, without the date columns.
    fn collect_hourly(db: &Database) -> Vec<(i64, String, Option<String>, i64, i64, i64, i64, i64)> {
        let conn = db.conn().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT hour, address, asset, amount_in, amount_out, triggers_count,
                    bounced_count, num_users
                 FROM agent_stats_hourly ORDER BY hour, address, asset",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })
            .unwrap();
        rows.collect::<rusqlite::Result<Vec<_>>>().unwrap()
    }

    fn hour_ts(period: i64, offset: i64) -> i64 {
        period * 3600 + offset
    }

    #[tokio::test]
    async fn walkthrough_scenario_closes_only_proven_periods() {
        let f = fixture(StubResolver::empty());

        // ids 1..3 in period 100, ids 4..5 in period 101
        seed_event(&f.db, 1, hour_ts(100, 10), "AGENT", "USER1", false, &[(None, 100)], &[]);
        seed_event(&f.db, 2, hour_ts(100, 20), "AGENT", "USER2", false, &[(None, 100)], &[]);
        seed_event(&f.db, 3, hour_ts(100, 30), "AGENT", "USER1", false, &[(None, 100)], &[]);
        seed_event(&f.db, 4, hour_ts(101, 10), "AGENT", "USER1", false, &[(None, 50)], &[]);
        seed_event(&f.db, 5, hour_ts(101, 20), "AGENT", "USER3", false, &[(None, 50)], &[]);

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        let rows = collect_hourly(&f.db);
        assert_eq!(rows.len(), 1, "only period 100 is provably closed");
        let (hour, address, asset, amount_in, amount_out, triggers, bounced, users) = rows[0].clone();
        assert_eq!(hour, 100);
        assert_eq!(address, "AGENT");
        assert_eq!(asset, None);
        assert_eq!(amount_in, 300);
        assert_eq!(amount_out, 0);
        assert_eq!(triggers, 3);
        assert_eq!(bounced, 0);
        assert_eq!(users, 2);
        assert_eq!(f.db.get_watermark("last_response_id_60").unwrap(), Some(3));

        // a later event in period 102 lets the next pass close period 101
        seed_event(&f.db, 6, hour_ts(102, 5), "AGENT", "USER1", false, &[(None, 10)], &[]);
        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        let rows = collect_hourly(&f.db);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].0, 101);
        assert_eq!(rows[1].3, 100); // 50 + 50
        assert_eq!(f.db.get_watermark("last_response_id_60").unwrap(), Some(5));
    }

    #[tokio::test]
    async fn repeated_pass_with_no_new_events_is_a_noop() {
        let f = fixture(StubResolver::empty());
        seed_event(&f.db, 1, hour_ts(100, 0), "AGENT", "USER1", false, &[(None, 100)], &[]);
        seed_event(&f.db, 2, hour_ts(101, 0), "AGENT", "USER1", false, &[(None, 100)], &[]);

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();
        let first = collect_hourly(&f.db);
        let watermark = f.db.get_watermark("last_response_id_60").unwrap();

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();
        assert_eq!(collect_hourly(&f.db), first);
        assert_eq!(f.db.get_watermark("last_response_id_60").unwrap(), watermark);
    }

    #[tokio::test]
    async fn split_passes_produce_the_same_rows_as_one_pass() {
        let events: &[(i64, i64, &str, &str)] = &[
            (1, hour_ts(100, 5), "AGENT1", "USER1"),
            (2, hour_ts(100, 15), "AGENT2", "USER2"),
            (3, hour_ts(100, 25), "AGENT1", "USER3"),
            (4, hour_ts(101, 5), "AGENT1", "USER1"),
            (5, hour_ts(101, 15), "AGENT2", "USER1"),
            (6, hour_ts(102, 5), "AGENT1", "USER2"),
        ];

        // one pass over everything
        let a = fixture(StubResolver::empty());
        for (id, ts, agent, user) in events {
            seed_event(&a.db, *id, *ts, agent, user, false, &[(None, 10)], &[]);
        }
        a.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        // restart simulation: first three events, a pass, then the rest
        let b = fixture(StubResolver::empty());
        for (id, ts, agent, user) in &events[..3] {
            seed_event(&b.db, *id, *ts, agent, user, false, &[(None, 10)], &[]);
        }
        b.aggregator.aggregate(Timeframe::Hourly).await.unwrap();
        for (id, ts, agent, user) in &events[3..] {
            seed_event(&b.db, *id, *ts, agent, user, false, &[(None, 10)], &[]);
        }
        b.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        assert_eq!(collect_hourly(&a.db), collect_hourly(&b.db));
        assert_eq!(
            a.db.get_watermark("last_response_id_60").unwrap(),
            b.db.get_watermark("last_response_id_60").unwrap()
        );
    }

    #[tokio::test]
    async fn tail_period_is_deferred() {
        let f = fixture(StubResolver::empty());
        seed_event(&f.db, 1, hour_ts(100, 0), "AGENT", "USER1", false, &[(None, 100)], &[]);
        seed_event(&f.db, 2, hour_ts(100, 30), "AGENT", "USER2", false, &[(None, 100)], &[]);

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        assert!(collect_hourly(&f.db).is_empty());
        assert_eq!(f.db.get_watermark("last_response_id_60").unwrap(), None);
    }

    #[tokio::test]
    async fn outflows_land_in_the_same_bucket() {
        let f = fixture(StubResolver::empty());
        // funds in on the trigger, funds out to a third party on the response
        seed_event(
            &f.db,
            1,
            hour_ts(100, 0),
            "AGENT",
            "USER1",
            false,
            &[(None, 500)],
            &[("USER1", None, 450), ("AGENT", None, 40)],
        );
        seed_event(&f.db, 2, hour_ts(101, 0), "AGENT", "USER1", false, &[(None, 1)], &[]);

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        let rows = collect_hourly(&f.db);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].3, 500, "amount_in");
        // the change output back to the agent itself is not an outflow
        assert_eq!(rows[0].4, 450, "amount_out");
    }

    #[tokio::test]
    async fn same_key_events_collapse_to_one_row() {
        let f = fixture(StubResolver::empty());
        seed_event(&f.db, 1, hour_ts(100, 0), "AGENT", "USER1", true, &[(None, 30)], &[]);
        seed_event(&f.db, 2, hour_ts(100, 40), "AGENT", "USER2", false, &[(None, 70)], &[]);
        seed_event(&f.db, 3, hour_ts(101, 0), "AGENT", "USER1", false, &[(None, 1)], &[]);

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        let rows = collect_hourly(&f.db);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].3, 100);
        assert_eq!(rows[0].5, 2, "triggers_count");
        assert_eq!(rows[0].6, 1, "bounced_count");
        assert_eq!(rows[0].7, 2, "num_users");
    }

    #[tokio::test]
    async fn usd_values_use_resolved_metadata_and_rates() {
        let f = fixture(StubResolver::with(&[("tok", "TOKEN", 2)]));
        {
            let mut rates = f.rates.write().unwrap();
            rates.insert(BASE_RATE_KEY.to_string(), 20.0);
            rates.insert("tok_USD".to_string(), 3.0);
        }

        seed_event(&f.db, 1, hour_ts(100, 0), "AGENT", "USER1", false, &[(None, 1_000_000_000)], &[]);
        seed_event(&f.db, 2, hour_ts(100, 10), "AGENT", "USER1", false, &[(Some("tok"), 200)], &[]);
        seed_event(&f.db, 3, hour_ts(101, 0), "AGENT", "USER1", false, &[(None, 1)], &[]);

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        let conn = f.db.conn().unwrap();
        let base_usd: Option<f64> = conn
            .query_row(
                "SELECT usd_amount_in FROM agent_stats_hourly WHERE hour = 100 AND asset IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(base_usd, Some(20.0));

        // 200 minor units at 2 decimals = 2 TOKEN * 3 USD
        let tok_usd: Option<f64> = conn
            .query_row(
                "SELECT usd_amount_in FROM agent_stats_hourly WHERE hour = 100 AND asset = 'tok'",
                params![],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tok_usd, Some(6.0));
    }

    #[tokio::test]
    async fn unknown_rate_leaves_usd_null() {
        let f = fixture(StubResolver::with(&[("tok", "TOKEN", 0)]));
        seed_event(&f.db, 1, hour_ts(100, 0), "AGENT", "USER1", false, &[(Some("tok"), 10)], &[]);
        seed_event(&f.db, 2, hour_ts(101, 0), "AGENT", "USER1", false, &[(Some("tok"), 1)], &[]);

        f.aggregator.aggregate(Timeframe::Hourly).await.unwrap();

        let conn = f.db.conn().unwrap();
        let usd: Option<f64> = conn
            .query_row(
                "SELECT usd_amount_in FROM agent_stats_hourly WHERE hour = 100",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(usd, None);
    }

    #[tokio::test]
    async fn failed_commit_leaves_watermark_untouched() {
        let f = fixture(StubResolver::with(&[("tok", "TOKEN", 0)]));
        seed_event(&f.db, 1, hour_ts(100, 0), "AGENT", "USER1", false, &[(Some("tok"), 100)], &[]);
        seed_event(&f.db, 2, hour_ts(101, 0), "AGENT", "USER1", false, &[(Some("tok"), 1)], &[]);

        // occupy the unique key the pass will try to insert; the asset must
        // be non-null because SQLite's UNIQUE treats NULLs as distinct
        let conn = f.db.conn().unwrap();
        conn.execute(
            "INSERT INTO agent_stats_hourly (hour, period_start_date, address, asset)
             VALUES (100, '', 'AGENT', 'tok')",
            [],
        )
        .unwrap();
        drop(conn);

        let result = f.aggregator.aggregate(Timeframe::Hourly).await;
        assert!(result.is_err());
        assert_eq!(f.db.get_watermark("last_response_id_60").unwrap(), None);
    }

    #[tokio::test]
    async fn daily_pass_is_independent_of_hourly() {
        let f = fixture(StubResolver::empty());
        // two events one day apart: day periods 4 and 5, hour periods 96.. and 120..
        seed_event(&f.db, 1, 4 * 86400 + 100, "AGENT", "USER1", false, &[(None, 100)], &[]);
        seed_event(&f.db, 2, 5 * 86400 + 100, "AGENT", "USER1", false, &[(None, 100)], &[]);

        f.aggregator.aggregate(Timeframe::Daily).await.unwrap();

        let conn = f.db.conn().unwrap();
        let daily: i64 = conn
            .query_row("SELECT COUNT(*) FROM agent_stats_daily", [], |r| r.get(0))
            .unwrap();
        assert_eq!(daily, 1);
        assert_eq!(f.db.get_watermark("last_response_id_1440").unwrap(), Some(1));
        assert_eq!(f.db.get_watermark("last_response_id_60").unwrap(), None);
    }
}
