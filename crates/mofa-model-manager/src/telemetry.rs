//! Tracing setup for binaries and tests embedding the model manager

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered at `level`.
///
/// `RUST_LOG` wins over `level` when set. Calling this more than once is
/// harmless; only the first subscriber is installed.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_does_not_panic() {
        init_tracing("debug");
        init_tracing("not a [valid filter");
        tracing::debug!("still logging");
    }
}
