// Read-only query API over the aggregated stats tables.
pub mod web;

pub use web::{start_web_server, AppState};
