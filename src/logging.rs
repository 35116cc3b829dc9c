use tracing_subscriber::EnvFilter;

/// Install the process-wide `tracing` subscriber. Honors `RUST_LOG`,
/// defaulting to `info` so the accountant's summary line and the
/// per-session auth/end lines are visible out of the box without the
/// teacher's hand-rolled ANSI color helpers or log-rate throttling.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
