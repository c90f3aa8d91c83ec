/// The error kinds produced by the playback engine.
///
/// This mirrors the seven error kinds from the engine's error-handling
/// design: master/media playlist parsing, media decode, local disk
/// access, empty tracks, and the transport layer. Nothing in this crate
/// panics or aborts on a recoverable failure; every failure becomes one
/// of these variants.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
	/// The master playlist was missing `#EXTM3U` or had no usable variants.
	#[error("failed to parse master playlist: {0}")]
	ParseMaster(String),

	/// A media playlist was missing a required tag (target-duration,
	/// version, media-sequence, or the init-segment map).
	#[error("failed to parse media playlist: {0}")]
	ParsePlaylist(String),

	/// The demux/decode adapter could not produce samples from a segment.
	#[error("failed to decode media: {0}")]
	DecodeMedia(String),

	/// The on-disk fragment cache could not be read or written.
	#[error("local file access failed: {0}")]
	LocalFilesAccess(String),

	/// A decoded fragment had no video samples.
	#[error("fragment produced no video samples")]
	EmptyVideo,

	/// A decoded fragment had no audio samples.
	#[error("fragment produced no audio samples")]
	EmptyAudio,

	/// A byte-range fetch failed at the transport layer.
	#[error("network error: {0}")]
	Network(String),

	/// A rational-clock arithmetic operation overflowed.
	#[error("time overflow")]
	TimeOverflow,

	/// A seek or quality-change target did not resolve to any fragment.
	#[error("no fragment covers the requested position")]
	NoFragment,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<url::ParseError> for Error {
	fn from(err: url::ParseError) -> Self {
		Error::Network(format!("invalid url: {err}"))
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::LocalFilesAccess(err.to_string())
	}
}

#[cfg(feature = "reqwest-fetcher")]
impl From<reqwest::Error> for Error {
	fn from(err: reqwest::Error) -> Self {
		Error::Network(err.to_string())
	}
}
