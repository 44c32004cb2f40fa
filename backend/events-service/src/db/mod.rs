pub mod ch_client;
pub mod dedup_store;

pub use ch_client::{AnalyticsWriter, BuiltQuery, ClickHouseClient, QueryParam, EVENTS_TABLE};
pub use dedup_store::{DedupStore, DedupTransaction, PgDedupStore};
