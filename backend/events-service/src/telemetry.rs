use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,events_service=debug";

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// `log_format` is `json` (default) or `pretty`.
pub fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    }
}
