use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
	/// Filter directive in `tracing_subscriber::EnvFilter` syntax.
	pub filter: String,
	pub json: bool,
}

impl Default for LoggingSettings {
	fn default() -> Self {
		Self { filter: "info".to_string(), json: false }
	}
}

/// Install the global subscriber. Call once, before any task is spawned.
pub fn init(settings: &LoggingSettings) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| settings.filter.clone().into());
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	if settings.json {
		builder.json().init();
	} else {
		builder.init();
	}
}
