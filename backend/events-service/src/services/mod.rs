pub mod cleanup;
pub mod importer;
pub mod jobs;
pub mod outbox;
pub mod processor;
pub mod queries;
pub mod rate_limit;

pub use cleanup::{CleanupJob, CleanupReport};
pub use importer::{BatchImporter, FingerprintStrategy, ImportReport};
pub use jobs::{CleanupHandler, ProcessEventsHandler, ProcessEventsPayload, CLEANUP_HOT_EVENTS, PROCESS_EVENTS};
pub use outbox::AnalyticsOutboxSink;
pub use processor::{EventProcessor, ProcessReport};
pub use queries::{DateRange, QueryEngine, Segment};
pub use rate_limit::{CounterStore, MemoryCounterStore, RateDecision, RateLimiter, RedisCounterStore};
