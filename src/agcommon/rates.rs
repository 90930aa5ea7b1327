//! Exchange rates and USD conversion.
//!
//! Rates arrive from an external feed as a `"<ASSET>_USD"` -> rate mapping.
//! Conversion always reads the last known value; there is no staleness bound.

use crate::agcommon::assets::AssetCache;
use crate::agcommon::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Shared rate mapping, written by the feed poller and read at conversion time.
pub type ExchangeRates = Arc<RwLock<HashMap<String, f64>>>;

/// Rate key for the ledger's native unit (nullable asset in the data model).
pub const BASE_RATE_KEY: &str = "BASE_USD";

/// Decimal places of the base currency.
const BASE_DECIMALS: i32 = 9;

pub fn new_exchange_rates() -> ExchangeRates {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Convert a raw minor-unit amount to USD.
///
/// Returns `None` when no rate is known for the asset. The result is rounded
/// to two fractional digits so stored values compare reproducibly.
pub fn usd_amount(
    rates: &HashMap<String, f64>,
    cache: &AssetCache,
    asset: Option<&str>,
    amount: i64,
) -> Option<f64> {
    let rate = match asset {
        Some(asset) => {
            let mut rate = *rates.get(&format!("{}_USD", asset))?;
            if let Some(meta) = cache.get(asset) {
                if meta.decimals > 0 {
                    rate /= 10f64.powi(meta.decimals);
                }
            }
            rate
        }
        None => rates.get(BASE_RATE_KEY)? / 10f64.powi(BASE_DECIMALS),
    };
    Some((amount as f64 * rate * 100.0).round() / 100.0)
}

/// Spawn the rate feed poller: a GET of `url` every `refresh_secs` seconds,
/// expecting a JSON object mapping rate keys to floats. A failed poll keeps
/// the previous mapping and waits for the next tick.
pub fn spawn_rate_feed(rates: ExchangeRates, url: String, refresh_secs: u64) {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut interval = tokio::time::interval(Duration::from_secs(refresh_secs));
        loop {
            interval.tick().await;
            match fetch_rates(&client, &url).await {
                Ok(fresh) => {
                    let count = fresh.len();
                    *rates.write().unwrap() = fresh;
                    debug!("exchange rates refreshed, {} entries", count);
                }
                Err(e) => {
                    warn!("exchange rate feed unavailable: {}", e);
                }
            }
        }
    });
}

async fn fetch_rates(client: &reqwest::Client, url: &str) -> Result<HashMap<String, f64>> {
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agcommon::models::AssetMetadataEntry;

    fn cache_with(asset: &str, decimals: i32) -> AssetCache {
        let cache = AssetCache::new();
        cache.merge(HashMap::from([(
            asset.to_string(),
            AssetMetadataEntry {
                name: asset.to_uppercase(),
                decimals,
            },
        )]));
        cache
    }

    #[test]
    fn base_currency_scales_by_nine_decimals() {
        let rates = HashMap::from([(BASE_RATE_KEY.to_string(), 20.0)]);
        let cache = AssetCache::new();
        // 1e9 minor units = 1 whole unit = 20 USD
        assert_eq!(usd_amount(&rates, &cache, None, 1_000_000_000), Some(20.0));
        assert_eq!(usd_amount(&rates, &cache, None, 500_000_000), Some(10.0));
    }

    #[test]
    fn named_asset_scales_by_cached_decimals() {
        let rates = HashMap::from([("tok_USD".to_string(), 2.5)]);
        let cache = cache_with("tok", 4);
        // 10_000 minor units = 1 whole token = 2.50 USD
        assert_eq!(usd_amount(&rates, &cache, Some("tok"), 10_000), Some(2.5));
    }

    #[test]
    fn zero_decimal_asset_uses_raw_rate() {
        let rates = HashMap::from([("tok_USD".to_string(), 0.5)]);
        let cache = cache_with("tok", 0);
        assert_eq!(usd_amount(&rates, &cache, Some("tok"), 7), Some(3.5));
    }

    #[test]
    fn missing_rate_yields_none() {
        let rates = HashMap::new();
        let cache = AssetCache::new();
        assert_eq!(usd_amount(&rates, &cache, None, 1_000_000_000), None);
        assert_eq!(usd_amount(&rates, &cache, Some("tok"), 100), None);
    }

    #[test]
    fn result_is_rounded_to_cents() {
        let rates = HashMap::from([("tok_USD".to_string(), 0.333333)]);
        let cache = cache_with("tok", 0);
        assert_eq!(usd_amount(&rates, &cache, Some("tok"), 10), Some(3.33));
    }
}
