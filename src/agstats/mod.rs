// Aggregation core: the period aggregator, the hourly balance snapshotter
// and the periodic task scheduler.
pub mod aggregator;
pub mod scheduler;
pub mod snapshot;

pub use aggregator::PeriodAggregator;
pub use snapshot::BalanceSnapshotter;
