pub mod mock_hub;

use tracing_subscriber::EnvFilter;

/// Route library logs through the test harness so failing tests show them.
/// `RUST_LOG` overrides the default `hubwire=debug` filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hubwire=debug")),
        )
        .with_test_writer()
        .try_init();
}
