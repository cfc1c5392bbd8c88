use tracing_subscriber::EnvFilter;

/// Initializes the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default `darwin=info` directive.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("darwin=info")),
        )
        .init();
}
