use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Aggregation timeframe. Each timeframe has its own output table and its own
/// watermark key, so hourly and daily passes never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    Hourly,
    Daily,
}

impl Timeframe {
    /// Period length in minutes.
    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::Hourly => 60,
            Timeframe::Daily => 60 * 24,
        }
    }

    /// Period length in seconds.
    pub fn period_secs(self) -> i64 {
        self.minutes() * 60
    }

    /// Output table for this timeframe.
    pub fn table(self) -> &'static str {
        match self {
            Timeframe::Hourly => "agent_stats_hourly",
            Timeframe::Daily => "agent_stats_daily",
        }
    }

    /// Name of the period column in the output table.
    pub fn period_column(self) -> &'static str {
        match self {
            Timeframe::Hourly => "hour",
            Timeframe::Daily => "day",
        }
    }

    /// Watermark key in the aggregation_state table.
    pub fn watermark_key(self) -> &'static str {
        match self {
            Timeframe::Hourly => "last_response_id_60",
            Timeframe::Daily => "last_response_id_1440",
        }
    }

    /// Parse an API timeframe parameter. Anything other than "daily" selects
    /// the hourly table.
    pub fn from_request(s: Option<&str>) -> Self {
        if s == Some("daily") {
            Timeframe::Daily
        } else {
            Timeframe::Hourly
        }
    }
}

/// One row of a grouped flow query (inflow or outflow side).
#[derive(Debug, Clone)]
pub struct FlowRow {
    /// Highest response id contributing to this group.
    pub last_response_id: i64,
    /// Period index: unit timestamp / 60 / period minutes.
    pub period: i64,
    pub address: String,
    /// None = base currency.
    pub asset: Option<String>,
    /// Summed output amount in minor units.
    pub amount: i64,
    pub triggers_count: i64,
    pub bounced_count: i64,
    pub num_users: i64,
}

/// A merged (period, address, asset) bucket with both flow directions.
/// Exists only in memory during one aggregation pass.
#[derive(Debug, Clone)]
pub struct PeriodBucket {
    pub period: i64,
    pub address: String,
    pub asset: Option<String>,
    pub last_response_id: i64,
    pub amount_in: i64,
    pub amount_out: i64,
    pub triggers_count: i64,
    pub bounced_count: i64,
    pub num_users: i64,
}

impl PeriodBucket {
    /// Build a bucket from an inflow row; amount_out stays 0 until an
    /// outflow row with the same key is merged in.
    pub fn from_inflow(row: FlowRow) -> Self {
        Self {
            period: row.period,
            address: row.address,
            asset: row.asset,
            last_response_id: row.last_response_id,
            amount_in: row.amount,
            amount_out: 0,
            triggers_count: row.triggers_count,
            bounced_count: row.bounced_count,
            num_users: row.num_users,
        }
    }

    /// Build a bucket from an outflow row that had no matching inflow key.
    pub fn from_outflow(row: FlowRow) -> Self {
        Self {
            period: row.period,
            address: row.address,
            asset: row.asset,
            last_response_id: row.last_response_id,
            amount_in: 0,
            amount_out: row.amount,
            triggers_count: row.triggers_count,
            bounced_count: row.bounced_count,
            num_users: row.num_users,
        }
    }
}

/// One stats row ready for insertion into an output table. USD values are
/// None when no exchange rate is known for the asset.
#[derive(Debug, Clone)]
pub struct StatsInsert {
    pub address: String,
    pub asset: Option<String>,
    pub amount_in: i64,
    pub amount_out: i64,
    pub usd_amount_in: Option<f64>,
    pub usd_amount_out: Option<f64>,
    pub triggers_count: i64,
    pub bounced_count: i64,
    pub num_users: i64,
}

/// One live balance row read from the ledger.
#[derive(Debug, Clone)]
pub struct BalanceRow {
    pub address: String,
    /// Raw asset column; the base currency is stored as the sentinel "base".
    pub asset: String,
    pub balance: i64,
}

/// Asset registry info used for the self-mint exclusion.
#[derive(Debug, Clone)]
pub struct AssetInfo {
    /// None or 0 = no fixed cap (re-issuable by its definer).
    pub cap: Option<i64>,
    pub definer_address: String,
}

/// Cached display metadata for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadataEntry {
    pub name: String,
    pub decimals: i32,
}

/// Ranking metric accepted by the top-N endpoints. Parsing rejects anything
/// else at the API boundary, which also keeps the column name out of reach
/// of user input when it is spliced into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopMetric {
    UsdAmountIn,
    UsdAmountOut,
    TriggersCount,
    NumUsers,
}

impl TopMetric {
    pub fn column(self) -> &'static str {
        match self {
            TopMetric::UsdAmountIn => "usd_amount_in",
            TopMetric::UsdAmountOut => "usd_amount_out",
            TopMetric::TriggersCount => "triggers_count",
            TopMetric::NumUsers => "num_users",
        }
    }
}

impl FromStr for TopMetric {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "usd_amount_in" => Ok(TopMetric::UsdAmountIn),
            "usd_amount_out" => Ok(TopMetric::UsdAmountOut),
            "triggers_count" => Ok(TopMetric::TriggersCount),
            "num_users" => Ok(TopMetric::NumUsers),
            _ => Err(()),
        }
    }
}
