use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    /// Settled jobs by kind and outcome (completed, retried, dead)
    pub static ref JOBS_SETTLED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "task_queue_jobs_total",
        "Jobs settled by workers",
        &["kind", "outcome"]
    )
    .unwrap();
}

pub fn record(kind: &str, outcome: &str) {
    JOBS_SETTLED_TOTAL.with_label_values(&[kind, outcome]).inc();
}
