// Ledger-event aggregation service: incremental period aggregation over a
// ledger database, hourly balance snapshots and a read-only query API.
pub mod agcommon;
pub mod agserver;
pub mod agstats;

pub use agcommon::{AppConfig, AppError, Database, Result, Timeframe};
