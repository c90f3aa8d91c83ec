use clap::Args;
use tracing_subscriber::EnvFilter;

/// Logging configuration shared by every binary that embeds the engine.
///
/// Flatten this into your `clap::Parser` and call [`Log::init`] before
/// doing anything else, mirroring how `moq-native::Log` is used by
/// `hang-cli`.
#[derive(Args, Clone, Debug)]
pub struct Log {
	/// Log level, e.g. "info", "debug", "hls_core=trace,warn".
	#[arg(long, env = "RUST_LOG", default_value = "info")]
	pub level: String,

	/// Emit logs as JSON instead of human-readable text.
	#[arg(long)]
	pub json: bool,
}

impl Default for Log {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			json: false,
		}
	}
}

impl Log {
	/// Initialize the global `tracing` subscriber.
	///
	/// Safe to call more than once; subsequent calls are no-ops.
	pub fn init(&self) {
		let filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));

		let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

		let result = if self.json {
			subscriber.json().try_init()
		} else {
			subscriber.try_init()
		};

		if let Err(err) = result {
			tracing::debug!(%err, "tracing subscriber already initialized");
		}
	}
}
