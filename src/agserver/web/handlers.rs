use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use crate::agcommon::assets::AssetCache;
use crate::agcommon::db::{AssetFilter, BalanceApiRow, StatsApiRow, TopAgentRow, TopAssetRow};
use crate::agcommon::models::{Timeframe, TopMetric};
use crate::agcommon::{AppError, Database};

/// Decimal places of the base currency, attached to enriched rows.
const BASE_DECIMALS: i32 = 9;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub assets: Arc<AssetCache>,
}

/// API-level error: client errors carry their own status, everything else
/// surfaces as a 500 without leaking into the aggregation core.
pub enum ApiError {
    NotFound(String),
    Internal(AppError),
}

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(e) => {
                error!("API query failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
            }
        }
    }
}

/// Serde collapses an explicit `null` into a missing field for plain
/// `Option<Option<T>>`; this keeps the two distinct so the tri-state below
/// survives deserialization.
fn tristate<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// The asset parameter is tri-state: absent = all assets, null = base
/// currency, string = one asset (by id or display name).
fn asset_filter(state: &AppState, raw: &Option<Option<String>>) -> AssetFilter {
    raw.as_ref()
        .map(|inner| inner.as_ref().map(|s| state.assets.resolve_id(s)))
}

fn decimals_for(assets: &AssetCache, asset: Option<&str>) -> Option<i32> {
    match asset {
        None => Some(BASE_DECIMALS),
        Some(a) => assets.get(a).map(|m| m.decimals),
    }
}

/// Attach decimals and swap asset ids for display names. The request-level
/// filter supplies the asset when the rows themselves carry no asset column.
fn enrich_stats(rows: &mut [StatsApiRow], assets: &AssetCache, filter: &AssetFilter) {
    for row in rows.iter_mut() {
        let effective = row
            .asset
            .clone()
            .or_else(|| filter.clone().flatten());
        match filter {
            None if row.asset.is_none() && effective.is_none() => {}
            _ => row.decimals = decimals_for(assets, effective.as_deref()),
        }
        if let Some(id) = row.asset.take() {
            row.asset = Some(assets.display_name(&id));
        }
    }
}

fn enrich_balances(rows: &mut [BalanceApiRow], assets: &AssetCache, filter: &AssetFilter) {
    for row in rows.iter_mut() {
        let effective = row
            .asset
            .clone()
            .or_else(|| filter.clone().flatten());
        match filter {
            None if row.asset.is_none() && effective.is_none() => {}
            _ => row.decimals = decimals_for(assets, effective.as_deref()),
        }
        if let Some(id) = row.asset.take() {
            row.asset = Some(assets.display_name(&id));
        }
    }
}

fn enrich_top_assets(rows: &mut [TopAssetRow], assets: &AssetCache) {
    for row in rows.iter_mut() {
        row.decimals = decimals_for(assets, row.asset.as_deref());
        if let Some(id) = row.asset.take() {
            row.asset = Some(assets.display_name(&id));
        }
    }
}

fn last_period(timeframe: Timeframe) -> i64 {
    chrono::Utc::now().timestamp() / timeframe.period_secs() - 1
}

const DEFAULT_TOP_LIMIT: i64 = 50;

// ----------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------

#[derive(Deserialize)]
pub struct AddressStatsRequest {
    pub address: String,
    #[serde(default, deserialize_with = "tristate")]
    pub asset: Option<Option<String>>,
    #[serde(default)]
    pub timeframe: Option<String>,
    pub from: i64,
    pub to: i64,
}

#[derive(Deserialize)]
pub struct AddressTvlRequest {
    pub address: String,
    #[serde(default, deserialize_with = "tristate")]
    pub asset: Option<Option<String>>,
    pub from: i64,
    pub to: i64,
}

#[derive(Deserialize)]
pub struct TotalRequest {
    #[serde(default, deserialize_with = "tristate")]
    pub asset: Option<Option<String>>,
    #[serde(default)]
    pub timeframe: Option<String>,
    pub from: i64,
    pub to: i64,
}

#[derive(Deserialize)]
pub struct TopAgentsTvlRequest {
    #[serde(default, deserialize_with = "tristate")]
    pub asset: Option<Option<String>>,
    #[serde(default)]
    pub period: Option<i64>,
}

#[derive(Deserialize)]
pub struct TopAgentsRequest {
    #[serde(default, deserialize_with = "tristate")]
    pub asset: Option<Option<String>>,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct TopAssetsRequest {
    #[serde(default)]
    pub period: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

/// POST /api/v1/address — stats for one agent address.
pub async fn address_stats(
    State(state): State<AppState>,
    Json(req): Json<AddressStatsRequest>,
) -> Result<Json<Vec<StatsApiRow>>, ApiError> {
    let timeframe = Timeframe::from_request(req.timeframe.as_deref());
    let filter = asset_filter(&state, &req.asset);
    let mut rows = state
        .db
        .address_stats(timeframe, &req.address, &filter, req.from, req.to)?;
    enrich_stats(&mut rows, &state.assets, &filter);
    Ok(Json(rows))
}

/// POST /api/v1/address/tvl — TVL over time for one agent address.
pub async fn address_tvl(
    State(state): State<AppState>,
    Json(req): Json<AddressTvlRequest>,
) -> Result<Json<Vec<BalanceApiRow>>, ApiError> {
    let filter = asset_filter(&state, &req.asset);
    let mut rows = state.db.address_tvl(&req.address, &filter, req.from, req.to)?;
    enrich_balances(&mut rows, &state.assets, &filter);
    Ok(Json(rows))
}

/// POST /api/v1/total/tvl — total TVL over time.
pub async fn total_tvl(
    State(state): State<AppState>,
    Json(req): Json<TotalRequest>,
) -> Result<Json<Vec<BalanceApiRow>>, ApiError> {
    let filter = asset_filter(&state, &req.asset);
    let mut rows = state.db.total_tvl(&filter, req.from, req.to)?;
    enrich_balances(&mut rows, &state.assets, &filter);
    Ok(Json(rows))
}

/// POST /api/v1/total/activity — total activity per period.
pub async fn total_activity(
    State(state): State<AppState>,
    Json(req): Json<TotalRequest>,
) -> Result<Json<Vec<StatsApiRow>>, ApiError> {
    let timeframe = Timeframe::from_request(req.timeframe.as_deref());
    let filter = asset_filter(&state, &req.asset);
    let mut rows = state.db.total_activity(timeframe, &filter, req.from, req.to)?;
    enrich_stats(&mut rows, &state.assets, &filter);
    Ok(Json(rows))
}

/// POST /api/v1/top/agent/tvl — agents ranked by TVL at one hour.
pub async fn top_agents_tvl(
    State(state): State<AppState>,
    Json(req): Json<TopAgentsTvlRequest>,
) -> Result<Json<Vec<BalanceApiRow>>, ApiError> {
    let filter = asset_filter(&state, &req.asset);
    let hour = req.period.unwrap_or_else(|| last_period(Timeframe::Hourly));
    let mut rows = state.db.top_agents_by_tvl(&filter, hour)?;
    enrich_balances(&mut rows, &state.assets, &filter);
    Ok(Json(rows))
}

/// POST /api/v1/top/agent/:metric — agents ranked by a stats column.
/// Unknown metrics are rejected here, before any query runs.
pub async fn top_agents_by_metric(
    State(state): State<AppState>,
    Path(metric): Path<String>,
    Json(req): Json<TopAgentsRequest>,
) -> Result<Json<Vec<TopAgentRow>>, ApiError> {
    let metric: TopMetric = metric
        .parse()
        .map_err(|_| ApiError::NotFound(format!("unknown top metric: {}", metric)))?;
    let timeframe = Timeframe::from_request(req.timeframe.as_deref());
    let filter = asset_filter(&state, &req.asset);
    let from = req.from.unwrap_or_else(|| last_period(timeframe));
    let to = req.to.unwrap_or_else(|| last_period(timeframe));
    let limit = req.limit.unwrap_or(DEFAULT_TOP_LIMIT);

    let mut rows = state
        .db
        .top_agents_by_metric(timeframe, metric, &filter, from, to, limit)?;
    if filter.is_some() {
        let asset = filter.clone().flatten();
        let decimals = decimals_for(&state.assets, asset.as_deref());
        for row in rows.iter_mut() {
            row.decimals = decimals;
        }
    }
    Ok(Json(rows))
}

/// POST /api/v1/top/asset/tvl — assets ranked by TVL at one hour.
pub async fn top_assets_tvl(
    State(state): State<AppState>,
    Json(req): Json<TopAssetsRequest>,
) -> Result<Json<Vec<TopAssetRow>>, ApiError> {
    let hour = req.period.unwrap_or_else(|| last_period(Timeframe::Hourly));
    let limit = req.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    let mut rows = state.db.top_assets_by_tvl(hour, limit)?;
    enrich_top_assets(&mut rows, &state.assets);
    Ok(Json(rows))
}

/// POST /api/v1/top/asset/amount_in — assets ranked by hourly inflow volume.
pub async fn top_assets_volume(
    State(state): State<AppState>,
    Json(req): Json<TopAssetsRequest>,
) -> Result<Json<Vec<TopAssetRow>>, ApiError> {
    let hour = req.period.unwrap_or_else(|| last_period(Timeframe::Hourly));
    let limit = req.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    let mut rows = state.db.top_assets_by_volume(hour, limit)?;
    enrich_top_assets(&mut rows, &state.assets);
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn asset_parameter_is_tristate() {
        let absent: AddressStatsRequest =
            serde_json::from_value(json!({"address": "A", "from": 1, "to": 2})).unwrap();
        assert_eq!(absent.asset, None);

        let base: AddressStatsRequest =
            serde_json::from_value(json!({"address": "A", "asset": null, "from": 1, "to": 2}))
                .unwrap();
        assert_eq!(base.asset, Some(None));

        let named: AddressStatsRequest = serde_json::from_value(
            json!({"address": "A", "asset": "tok", "from": 1, "to": 2}),
        )
        .unwrap();
        assert_eq!(named.asset, Some(Some("tok".to_string())));
    }
}
