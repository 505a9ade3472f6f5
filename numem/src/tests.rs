#![cfg(test)]

mod race;

pub(crate) fn tracing_init() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Picks `true` with probability `p`.
pub(crate) fn prob(p: f64) -> bool {
    fastrand::f64() < p
}
