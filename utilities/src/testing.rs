//! Helpers for tests across the workspace.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Install a plain-text tracing subscriber writing to the test harness.
/// Safe to call from every test; only the first call installs.
pub fn init_test_logger() {
	INIT_LOGGER.call_once(|| {
		tracing_subscriber::fmt()
			.with_env_filter(
				tracing_subscriber::EnvFilter::try_from_default_env()
					.unwrap_or_else(|_| "debug".into()),
			)
			.with_test_writer()
			.init();
	});
}
