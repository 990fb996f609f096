//! Tracing initialisation shared by binaries and integration tests.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,sieve=debug";

/// Initialize the global tracing subscriber.
///
/// Honours `RUST_LOG`; falls back to [`DEFAULT_FILTER`]. Calling this more
/// than once is harmless: later calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
        tracing::debug!("tracing initialised");
    }
}
