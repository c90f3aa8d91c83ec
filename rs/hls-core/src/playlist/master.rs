use url::Url;

use crate::error::{Error, Result};

use super::resolve_uri;

/// A single encoding of the content at a specific bitrate and resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
	pub bandwidth: u64,
	pub width: u32,
	pub height: u32,
	pub media_playlist_url: Url,
}

/// A parsed HLS master playlist.
///
/// [`MasterPlaylist::parse`] is the only way to build one. `variants` may
/// still be narrowed afterward (the facade drops variants whose media
/// playlist fails to load before handing this to [`crate::session::HlsSession`]),
/// but `id`/`version` never change once parsed.
#[derive(Debug, Clone)]
pub struct MasterPlaylist {
	/// A stable, non-cryptographic hash of the source URL and the
	/// resulting variant set, used to key the on-disk fragment cache.
	pub id: u64,
	pub version: u32,
	/// Variants ordered by descending bandwidth, as required by the ABR
	/// controller's scan order.
	pub variants: Vec<Variant>,
}

impl MasterPlaylist {
	/// Parse master playlist text, resolving variant URIs against `base_url`.
	///
	/// Variants missing `BANDWIDTH` or `RESOLUTION` are skipped rather
	/// than causing the whole parse to fail. The playlist fails to parse
	/// only if `#EXTM3U` is absent or zero usable variants remain.
	pub fn parse(text: &[u8], base_url: &Url) -> Result<Self> {
		let (_, parsed) =
			m3u8_rs::parse_master_playlist(text).map_err(|err| Error::ParseMaster(format!("{err}")))?;

		let mut variants = Vec::new();
		for stream in &parsed.variants {
			let Some(resolution) = stream.resolution else {
				continue;
			};
			// `BANDWIDTH` is a required attribute of `#EXT-X-STREAM-INF` in
			// the m3u8-rs model (it does not parse without one), so we only
			// need to additionally require a resolution here.
			let media_playlist_url = match resolve_uri(base_url, &stream.uri) {
				Ok(url) => url,
				Err(_) => continue,
			};

			variants.push(Variant {
				bandwidth: stream.bandwidth,
				width: resolution.width as u32,
				height: resolution.height as u32,
				media_playlist_url,
			});
		}

		if variants.is_empty() {
			return Err(Error::ParseMaster("no variants with bandwidth and resolution".into()));
		}

		variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

		let version = parsed.version.unwrap_or(1) as u32;
		let id = stable_hash(base_url.as_str(), &variants);

		Ok(Self { id, version, variants })
	}
}

fn stable_hash(source_url: &str, variants: &[Variant]) -> u64 {
	// FNV-1a: deterministic across processes and Rust versions, unlike
	// `std::collections::hash_map::DefaultHasher` which makes no such
	// promise. We only need stability for cache-directory naming within
	// a single process lifetime, but determinism is cheap and simpler to
	// reason about than relying on an unspecified hasher.
	const FNV_OFFSET: u64 = 0xcbf29ce484222325;
	const FNV_PRIME: u64 = 0x100000001b3;

	let mut hash = FNV_OFFSET;
	let mut feed = |bytes: &[u8]| {
		for &byte in bytes {
			hash ^= byte as u64;
			hash = hash.wrapping_mul(FNV_PRIME);
		}
	};

	feed(source_url.as_bytes());
	for variant in variants {
		feed(&variant.bandwidth.to_le_bytes());
		feed(&variant.width.to_le_bytes());
		feed(&variant.height.to_le_bytes());
		feed(variant.media_playlist_url.as_str().as_bytes());
	}

	hash
}
