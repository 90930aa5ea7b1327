use crate::agcommon::error::{AppError, Result};
use crate::agcommon::models::{
    AssetInfo, BalanceRow, FlowRow, StatsInsert, Timeframe, TopMetric,
};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row, Transaction};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Asset filter for API queries: `None` = all assets, `Some(None)` = base
/// currency only, `Some(Some(id))` = one specific asset.
pub type AssetFilter = Option<Option<String>>;

/// Database handler for the stats tables and the ledger queries.
///
/// The SQLite file is shared with the ledger node: the `units`,
/// `agent_responses`, `outputs`, `agent_balances` and `assets` tables are
/// externally populated and read-only to this service. The stats tables and
/// the watermark store are owned here.
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open the database and create the output tables if missing.
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_tables()?;

        info!("database initialized at {}", db_path.display());
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("failed to get connection: {}", e)))
    }

    /// Create the output tables and the watermark store.
    fn init_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        let stats_columns = "
            period_start_date TEXT NOT NULL,
            address TEXT NOT NULL,
            asset TEXT NULL,
            amount_in INTEGER NOT NULL DEFAULT 0,
            amount_out INTEGER NOT NULL DEFAULT 0,
            usd_amount_in REAL NULL,
            usd_amount_out REAL NULL,
            triggers_count INTEGER NOT NULL DEFAULT 0,
            bounced_count INTEGER NOT NULL DEFAULT 0,
            num_users INTEGER NOT NULL DEFAULT 0,
            creation_date TIMESTAMP DEFAULT CURRENT_TIMESTAMP";

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS agent_stats_hourly (
                hour INTEGER NOT NULL,
                {stats_columns},
                UNIQUE (hour, address, asset)
            );
            CREATE INDEX IF NOT EXISTS agentStatsByHour ON agent_stats_hourly(hour);

            CREATE TABLE IF NOT EXISTS agent_stats_daily (
                day INTEGER NOT NULL,
                {stats_columns},
                UNIQUE (day, address, asset)
            );
            CREATE INDEX IF NOT EXISTS agentStatsByDay ON agent_stats_daily(day);

            CREATE TABLE IF NOT EXISTS agent_balances_hourly (
                hour INTEGER NOT NULL,
                date TEXT NOT NULL,
                address TEXT NOT NULL,
                asset TEXT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                usd_balance REAL NULL,
                UNIQUE (hour, address, asset)
            );
            CREATE INDEX IF NOT EXISTS agentBalancesByHour ON agent_balances_hourly(hour);

            CREATE TABLE IF NOT EXISTS aggregation_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );"
        ))?;

        Ok(())
    }

    /// Create the index the outflow query relies on. Separate from
    /// `init_tables` because the ledger tables must already exist.
    pub fn ensure_ledger_indexes(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS byResponseUnit ON agent_responses(response_unit)",
            [],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Watermark store
    // ------------------------------------------------------------------

    /// Read a watermark value; `None` when the key has never been written.
    pub fn get_watermark(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM aggregation_state WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Persist a watermark value. Visible to every subsequent read once this
    /// returns Ok, including across restarts.
    pub fn put_watermark(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO aggregation_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Aggregation queries
    // ------------------------------------------------------------------

    /// Inflow side: outputs on the trigger unit paid to the executing agent,
    /// i.e. funds moved into the agent's control at invocation time.
    pub fn fetch_inflows(&self, period_minutes: i64, after_response_id: i64) -> Result<Vec<FlowRow>> {
        self.fetch_flows(
            "SELECT
                MAX(r.response_id) AS last_response_id,
                u.timestamp / 60 / ?1 AS period,
                r.agent_address,
                o.asset,
                SUM(o.amount) AS amount,
                COUNT(1) AS triggers_count,
                SUM(r.bounced) AS bounced_count,
                COUNT(DISTINCT r.trigger_address) AS num_users
            FROM agent_responses r
            JOIN units u ON r.trigger_unit = u.unit
            JOIN outputs o ON o.unit = r.trigger_unit AND o.address = r.agent_address
            WHERE r.response_id > ?2
            GROUP BY u.timestamp / 60 / ?1, r.agent_address, o.asset
            ORDER BY period ASC",
            period_minutes,
            after_response_id,
        )
    }

    /// Outflow side: outputs on the response unit paid to anyone but the
    /// agent itself, i.e. funds moved out to other parties. The join
    /// predicate differs from the inflow side, which is why the two
    /// directions are separate queries.
    pub fn fetch_outflows(&self, period_minutes: i64, after_response_id: i64) -> Result<Vec<FlowRow>> {
        self.fetch_flows(
            "SELECT
                MAX(r.response_id) AS last_response_id,
                u.timestamp / 60 / ?1 AS period,
                r.agent_address,
                o.asset,
                SUM(o.amount) AS amount,
                COUNT(1) AS triggers_count,
                SUM(r.bounced) AS bounced_count,
                COUNT(DISTINCT r.trigger_address) AS num_users
            FROM agent_responses r
            JOIN units u ON r.trigger_unit = u.unit
            JOIN outputs o ON o.unit = r.response_unit AND o.address != r.agent_address
            WHERE r.response_id > ?2
            GROUP BY u.timestamp / 60 / ?1, r.agent_address, o.asset
            ORDER BY period ASC",
            period_minutes,
            after_response_id,
        )
    }

    fn fetch_flows(&self, sql: &str, period_minutes: i64, after_response_id: i64) -> Result<Vec<FlowRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![period_minutes, after_response_id], |row| {
            Ok(FlowRow {
                last_response_id: row.get(0)?,
                period: row.get(1)?,
                address: row.get(2)?,
                asset: row.get(3)?,
                amount: row.get(4)?,
                triggers_count: row.get(5)?,
                bounced_count: row.get(6)?,
                num_users: row.get(7)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Insert one closed period's rows inside a single transaction. Either
    /// every row lands or none does; a unique-key conflict (row already
    /// committed by an earlier run) aborts the whole batch.
    pub fn commit_period(&self, timeframe: Timeframe, period: i64, rows: &[StatsInsert]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let sql = format!(
            "INSERT INTO {} (
                {},
                period_start_date,
                address,
                asset,
                amount_in,
                amount_out,
                usd_amount_in,
                usd_amount_out,
                triggers_count,
                bounced_count,
                num_users
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            timeframe.table(),
            timeframe.period_column(),
        );

        let start_date = period_start_date(period * timeframe.period_secs());
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                stmt.execute(params![
                    period,
                    start_date,
                    row.address,
                    row.asset,
                    row.amount_in,
                    row.amount_out,
                    row.usd_amount_in,
                    row.usd_amount_out,
                    row.triggers_count,
                    row.bounced_count,
                    row.num_users,
                ])?;
            }
        }

        tx.commit()?;
        debug!(
            "committed {} rows to {} for period {}",
            rows.len(),
            timeframe.table(),
            period
        );
        Ok(rows.len())
    }

    // ------------------------------------------------------------------
    // Balance snapshots
    // ------------------------------------------------------------------

    /// Highest snapshotted hour, 0 when no snapshot exists yet.
    pub fn last_snapshot_hour(&self) -> Result<i64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(hour) FROM agent_balances_hourly",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }
}

// ----------------------------------------------------------------------
// Transaction-scoped helpers used by the balance snapshotter. The whole
// snapshot pass (reads included) runs on one connection inside one
// transaction, so these take the transaction rather than the pool.
// ----------------------------------------------------------------------

/// Read all live agent balances.
pub fn read_live_balances(tx: &Transaction) -> Result<Vec<BalanceRow>> {
    let mut stmt = tx.prepare("SELECT address, asset, balance FROM agent_balances")?;
    let rows = stmt.query_map([], |row| {
        Ok(BalanceRow {
            address: row.get(0)?,
            asset: row.get(1)?,
            balance: row.get(2)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Look up cap and definer of an asset in the ledger registry.
pub fn read_asset_info(tx: &Transaction, asset: &str) -> Result<Option<AssetInfo>> {
    let mut stmt = tx.prepare("SELECT cap, definer_address FROM assets WHERE asset = ?1")?;
    let mut rows = stmt.query(params![asset])?;
    match rows.next()? {
        Some(row) => Ok(Some(AssetInfo {
            cap: row.get(0)?,
            definer_address: row.get(1)?,
        })),
        None => Ok(None),
    }
}

/// Insert one hourly balance snapshot row.
pub fn insert_balance_snapshot(
    tx: &Transaction,
    hour: i64,
    date: &str,
    address: &str,
    asset: Option<&str>,
    balance: i64,
    usd_balance: Option<f64>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO agent_balances_hourly (hour, date, address, asset, balance, usd_balance)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![hour, date, address, asset, balance, usd_balance],
    )?;
    Ok(())
}

/// Render an epoch-seconds timestamp as a UTC datetime string.
pub fn period_start_date(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

// ----------------------------------------------------------------------
// Read-only API queries
// ----------------------------------------------------------------------

/// Stats row as returned by the /address and /total/activity endpoints.
/// `decimals` is attached by the enrichment step in the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct StatsApiRow {
    pub period: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_out: Option<i64>,
    pub usd_amount_in: Option<f64>,
    pub usd_amount_out: Option<f64>,
    pub triggers_count: i64,
    pub bounced_count: i64,
    pub num_users: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<i32>,
}

/// Balance row as returned by the TVL endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceApiRow {
    pub period: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
    pub usd_balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<i32>,
}

/// Per-address ranking row for /top/agent/:metric.
#[derive(Debug, Clone, Serialize)]
pub struct TopAgentRow {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_out: Option<i64>,
    pub usd_amount_in: Option<f64>,
    pub usd_amount_out: Option<f64>,
    pub triggers_count: i64,
    pub bounced_count: i64,
    pub num_users: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<i32>,
}

/// Per-asset ranking row for /top/asset/tvl and /top/asset/amount_in.
#[derive(Debug, Clone, Serialize)]
pub struct TopAssetRow {
    pub period: i64,
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_balance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_usd_balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_usd_amount_in: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<i32>,
}

fn map_stats_row(row: &Row) -> rusqlite::Result<StatsApiRow> {
    Ok(StatsApiRow {
        period: row.get(0)?,
        address: row.get(1)?,
        asset: row.get(2)?,
        amount_in: row.get(3)?,
        amount_out: row.get(4)?,
        usd_amount_in: row.get(5)?,
        usd_amount_out: row.get(6)?,
        triggers_count: row.get(7)?,
        bounced_count: row.get(8)?,
        num_users: row.get(9)?,
        decimals: None,
    })
}

impl Database {
    /// Stats for one agent address over a period range.
    pub fn address_stats(
        &self,
        timeframe: Timeframe,
        address: &str,
        asset: &AssetFilter,
        from: i64,
        to: i64,
    ) -> Result<Vec<StatsApiRow>> {
        let mut sql = format!(
            "SELECT {col} AS period, address, asset, amount_in, amount_out,
                usd_amount_in, usd_amount_out, triggers_count, bounced_count, num_users
             FROM {table}
             WHERE address = ?1 AND {col} BETWEEN ?2 AND ?3",
            col = timeframe.period_column(),
            table = timeframe.table(),
        );
        if asset.is_some() {
            sql.push_str(" AND asset IS ?4");
        }
        sql.push_str(" ORDER BY period ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = match asset {
            Some(a) => stmt
                .query_map(params![address, from, to, a], map_stats_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![address, from, to], map_stats_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Hourly balance snapshots for one agent address.
    pub fn address_tvl(
        &self,
        address: &str,
        asset: &AssetFilter,
        from: i64,
        to: i64,
    ) -> Result<Vec<BalanceApiRow>> {
        let mut sql = String::from(
            "SELECT hour AS period, address, asset, balance, usd_balance
             FROM agent_balances_hourly
             WHERE address = ?1 AND hour BETWEEN ?2 AND ?3",
        );
        if asset.is_some() {
            sql.push_str(" AND asset IS ?4");
        }
        sql.push_str(" ORDER BY period ASC");

        let map = |row: &Row| -> rusqlite::Result<BalanceApiRow> {
            Ok(BalanceApiRow {
                period: row.get(0)?,
                address: row.get(1)?,
                asset: row.get(2)?,
                balance: row.get(3)?,
                usd_balance: row.get(4)?,
                decimals: None,
            })
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = match asset {
            Some(a) => stmt
                .query_map(params![address, from, to, a], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![address, from, to], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Total TVL per hour over a range. Raw balances are only summed when a
    /// single asset is selected; across assets only the USD total is
    /// meaningful.
    pub fn total_tvl(&self, asset: &AssetFilter, from: i64, to: i64) -> Result<Vec<BalanceApiRow>> {
        let sql = if asset.is_some() {
            "SELECT hour AS period, SUM(balance) AS balance, SUM(usd_balance) AS usd_balance
             FROM agent_balances_hourly
             WHERE hour BETWEEN ?1 AND ?2 AND asset IS ?3
             GROUP BY period ORDER BY period ASC"
        } else {
            "SELECT hour AS period, NULL AS balance, SUM(usd_balance) AS usd_balance
             FROM agent_balances_hourly
             WHERE hour BETWEEN ?1 AND ?2
             GROUP BY period ORDER BY period ASC"
        };

        let map = |row: &Row| -> rusqlite::Result<BalanceApiRow> {
            Ok(BalanceApiRow {
                period: row.get(0)?,
                address: None,
                asset: None,
                balance: row.get(1)?,
                usd_balance: row.get(2)?,
                decimals: None,
            })
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = match asset {
            Some(a) => stmt
                .query_map(params![from, to, a], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![from, to], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Summed activity columns per period over a range.
    pub fn total_activity(
        &self,
        timeframe: Timeframe,
        asset: &AssetFilter,
        from: i64,
        to: i64,
    ) -> Result<Vec<StatsApiRow>> {
        let amount_cols = if asset.is_some() {
            "SUM(amount_in) AS amount_in, SUM(amount_out) AS amount_out"
        } else {
            "NULL AS amount_in, NULL AS amount_out"
        };
        let mut sql = format!(
            "SELECT {col} AS period, NULL AS address, NULL AS asset, {amount_cols},
                SUM(usd_amount_in) AS usd_amount_in, SUM(usd_amount_out) AS usd_amount_out,
                SUM(triggers_count) AS triggers_count, SUM(bounced_count) AS bounced_count,
                SUM(num_users) AS num_users
             FROM {table}
             WHERE {col} BETWEEN ?1 AND ?2",
            col = timeframe.period_column(),
            table = timeframe.table(),
        );
        if asset.is_some() {
            sql.push_str(" AND asset IS ?3");
        }
        sql.push_str(" GROUP BY period ORDER BY period ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = match asset {
            Some(a) => stmt
                .query_map(params![from, to, a], map_stats_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![from, to], map_stats_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Agents ranked by TVL at one snapshot hour.
    pub fn top_agents_by_tvl(&self, asset: &AssetFilter, hour: i64) -> Result<Vec<BalanceApiRow>> {
        let conn = self.conn()?;
        let rows = match asset {
            Some(a) => {
                let mut stmt = conn.prepare(
                    "SELECT hour AS period, address, asset, balance, usd_balance
                     FROM agent_balances_hourly
                     WHERE hour = ?1 AND asset IS ?2
                     ORDER BY usd_balance DESC",
                )?;
                let mapped = stmt.query_map(params![hour, a], |row| {
                    Ok(BalanceApiRow {
                        period: row.get(0)?,
                        address: row.get(1)?,
                        asset: row.get(2)?,
                        balance: row.get(3)?,
                        usd_balance: row.get(4)?,
                        decimals: None,
                    })
                })?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT hour AS period, address, SUM(usd_balance) AS usd_balance
                     FROM agent_balances_hourly
                     WHERE hour = ?1
                     GROUP BY address
                     ORDER BY usd_balance DESC",
                )?;
                let mapped = stmt.query_map(params![hour], |row| {
                    Ok(BalanceApiRow {
                        period: row.get(0)?,
                        address: row.get(1)?,
                        asset: None,
                        balance: None,
                        usd_balance: row.get(2)?,
                        decimals: None,
                    })
                })?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    /// Agents ranked by one stats metric over a period range.
    pub fn top_agents_by_metric(
        &self,
        timeframe: Timeframe,
        metric: TopMetric,
        asset: &AssetFilter,
        from: i64,
        to: i64,
        limit: i64,
    ) -> Result<Vec<TopAgentRow>> {
        let amount_cols = if asset.is_some() {
            "SUM(amount_in) AS amount_in, SUM(amount_out) AS amount_out"
        } else {
            "NULL AS amount_in, NULL AS amount_out"
        };
        let asset_clause = if asset.is_some() { "AND asset IS ?3" } else { "" };
        let limit_param = if asset.is_some() { "?4" } else { "?3" };
        let sql = format!(
            "SELECT address, {amount_cols},
                SUM(usd_amount_in) AS usd_amount_in, SUM(usd_amount_out) AS usd_amount_out,
                SUM(triggers_count) AS triggers_count, SUM(bounced_count) AS bounced_count,
                SUM(num_users) AS num_users
             FROM {table}
             WHERE {col} BETWEEN ?1 AND ?2 {asset_clause}
             GROUP BY address ORDER BY {metric} DESC LIMIT {limit_param}",
            table = timeframe.table(),
            col = timeframe.period_column(),
            metric = metric.column(),
        );

        let map = |row: &Row| -> rusqlite::Result<TopAgentRow> {
            Ok(TopAgentRow {
                address: row.get(0)?,
                amount_in: row.get(1)?,
                amount_out: row.get(2)?,
                usd_amount_in: row.get(3)?,
                usd_amount_out: row.get(4)?,
                triggers_count: row.get(5)?,
                bounced_count: row.get(6)?,
                num_users: row.get(7)?,
                decimals: None,
            })
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = match asset {
            Some(a) => stmt
                .query_map(params![from, to, a, limit], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![from, to, limit], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Assets ranked by total USD balance at one snapshot hour.
    pub fn top_assets_by_tvl(&self, hour: i64, limit: i64) -> Result<Vec<TopAssetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT hour AS period, asset, SUM(balance) AS total_balance,
                SUM(usd_balance) AS total_usd_balance
             FROM agent_balances_hourly
             WHERE hour = ?1
             GROUP BY asset
             ORDER BY total_usd_balance DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![hour, limit], |row| {
            Ok(TopAssetRow {
                period: row.get(0)?,
                asset: row.get(1)?,
                total_balance: row.get(2)?,
                total_usd_balance: row.get(3)?,
                total_amount_in: None,
                total_usd_amount_in: None,
                decimals: None,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Assets ranked by hourly USD inflow volume.
    pub fn top_assets_by_volume(&self, hour: i64, limit: i64) -> Result<Vec<TopAssetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT hour AS period, asset, SUM(amount_in) AS total_amount_in,
                SUM(usd_amount_in) AS total_usd_amount_in
             FROM agent_stats_hourly
             WHERE hour = ?1
             GROUP BY asset
             ORDER BY total_usd_amount_in DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![hour, limit], |row| {
            Ok(TopAssetRow {
                period: row.get(0)?,
                asset: row.get(1)?,
                total_balance: None,
                total_usd_balance: None,
                total_amount_in: row.get(2)?,
                total_usd_amount_in: row.get(3)?,
                decimals: None,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}
