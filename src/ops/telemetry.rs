use tracing_subscriber::filter::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level; calling twice is harmless (tests share a process).
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
