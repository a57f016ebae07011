//! Logging initialization.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Dependencies that are chatty at the service's own level.
const QUIET_TARGETS: &[&str] = &["sqlx::query=warn", "hyper=warn", "reqwest=warn"];

/// Filter for `logging.level`, with noisy dependencies capped at `warn`
/// unless the level already names them.
pub fn build_filter(level: &str) -> String {
    let mut directives = vec![level.trim().to_string()];
    for quiet in QUIET_TARGETS {
        let target = quiet.split('=').next().unwrap_or(quiet);
        if !level.contains(target) {
            directives.push((*quiet).to_string());
        }
    }
    directives.retain(|d| !d.is_empty());
    directives.join(",")
}

/// Installs the global subscriber. `RUST_LOG` wins over `logging.level`.
///
/// Returns an error if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(build_filter(&config.level)));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        // Span close events carry request latency for the log pipeline.
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true);
        subscriber.with(json_layer).try_init()
    } else {
        subscriber
            .with(fmt::layer().compact().with_target(false))
            .try_init()
    }
}
