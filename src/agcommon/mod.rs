// Shared foundation: error type, config, models, database, asset metadata
// and exchange rates.
pub mod assets;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod rates;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::AppConfig;
pub use db::Database;
pub use error::{AppError, Result};
pub use models::Timeframe;
