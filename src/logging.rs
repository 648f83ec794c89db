use tracing_subscriber::EnvFilter;

/// Initialises tracing output. `RUST_LOG` wins; otherwise everything at
/// `info` and up.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
