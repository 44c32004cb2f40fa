use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub delivered: IntCounter,
    pub dead: IntCounter,
}

impl OutboxMetrics {
    /// Build and register the relay gauges, labelled by `service`.
    ///
    /// Registration failures (e.g. a second relay in the same process) are
    /// logged; the metrics still work, they just aren't exported twice.
    pub fn new(service: &str) -> Result<Self, prometheus::Error> {
        let registry = prometheus::default_registry();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("service", service.to_string())
        };

        let pending = IntGauge::with_opts(opts(
            "analytics_outbox_pending",
            "Number of analytical writes waiting in the outbox",
        ))?;
        let oldest_pending_age_seconds = IntGauge::with_opts(opts(
            "analytics_outbox_oldest_pending_age_seconds",
            "Age in seconds of the oldest pending outbox entry",
        ))?;
        let delivered = IntCounter::with_opts(opts(
            "analytics_outbox_delivered_total",
            "Outbox entries written to the analytical store by the relay",
        ))?;
        let dead = IntCounter::with_opts(opts(
            "analytics_outbox_dead_total",
            "Outbox entries parked after exhausting delivery attempts",
        ))?;

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(delivered.clone()),
            Box::new(dead.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Ok(Self {
            pending,
            oldest_pending_age_seconds,
            delivered,
            dead,
        })
    }
}
