use url::Url;

use crate::error::{Error, Result};
use crate::time::RationalTime;

use super::{resolve_uri, ByteRange};

/// A single addressable media fragment within a media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
	pub sequence: u64,
	pub duration: RationalTime,
	pub byte_range: ByteRange,
	pub url: Url,
}

/// The `#EXT-X-MAP` init segment shared by every fragment in a playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegment {
	pub url: Url,
	pub byte_range: ByteRange,
}

/// A parsed HLS media playlist: one rendition's fragment list.
///
/// VOD only, per the engine's scope: every fragment is assumed byte-range
/// addressed into a single CMAF file sharing `init_segment`, and the
/// playlist is assumed complete (no live reloading).
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
	pub target_duration: u32,
	pub version: u32,
	pub media_sequence: u64,
	pub init_segment: InitSegment,
	pub fragments: Vec<Fragment>,
}

impl MediaPlaylist {
	/// Parse media playlist text, resolving the init segment and every
	/// fragment URI against `base_url`.
	///
	/// Requires `#EXT-X-TARGETDURATION`, `#EXT-X-VERSION`,
	/// `#EXT-X-MEDIA-SEQUENCE`, and an `#EXT-X-MAP` carrying a `BYTERANGE`
	/// on at least one segment; without any of these, the playlist can't
	/// drive byte-range fragment loading and the parse fails. `m3u8-rs`
	/// defaults `target_duration`/`media_sequence` to `0` rather than
	/// exposing their absence, so presence is checked against the raw
	/// text instead of the parsed struct.
	/// A segment missing a `#EXT-X-BYTERANGE` is silently dropped instead
	/// of failing the whole playlist, since a malformed single fragment
	/// shouldn't take down an otherwise playable rendition.
	pub fn parse(text: &[u8], base_url: &Url) -> Result<Self> {
		let text_str = std::str::from_utf8(text).map_err(|err| Error::ParsePlaylist(format!("invalid utf-8: {err}")))?;
		if !text_str.contains("#EXT-X-TARGETDURATION") {
			return Err(Error::ParsePlaylist("missing EXT-X-TARGETDURATION".into()));
		}
		if !text_str.contains("#EXT-X-MEDIA-SEQUENCE") {
			return Err(Error::ParsePlaylist("missing EXT-X-MEDIA-SEQUENCE".into()));
		}

		let (_, parsed) =
			m3u8_rs::parse_media_playlist(text).map_err(|err| Error::ParsePlaylist(format!("{err}")))?;

		let version = parsed.version.ok_or_else(|| Error::ParsePlaylist("missing EXT-X-VERSION".into()))?;

		let init_segment = parsed
			.segments
			.iter()
			.find_map(|segment| segment.map.as_ref())
			.ok_or_else(|| Error::ParsePlaylist("missing EXT-X-MAP".into()))
			.and_then(|map| resolve_init_segment(map, base_url))?;

		let mut fragments = Vec::new();
		let mut sequence = parsed.media_sequence;
		for segment in &parsed.segments {
			let Some(range) = segment.byte_range.as_ref() else {
				sequence += 1;
				continue;
			};
			let Ok(url) = resolve_uri(base_url, &segment.uri) else {
				sequence += 1;
				continue;
			};

			fragments.push(Fragment {
				sequence,
				duration: RationalTime::from_secs_f64(segment.duration as f64),
				byte_range: ByteRange::new(range.offset.unwrap_or(0), range.length),
				url,
			});
			sequence += 1;
		}

		Ok(Self {
			target_duration: parsed.target_duration.round() as u32,
			version: version as u32,
			media_sequence: parsed.media_sequence,
			init_segment,
			fragments,
		})
	}

	/// Total playable duration, the sum of every fragment's duration.
	pub fn total_duration(&self) -> RationalTime {
		self.fragments
			.iter()
			.fold(RationalTime::ZERO, |acc, fragment| acc + fragment.duration)
	}

	/// The fragment covering `position`, by cumulative duration.
	pub fn fragment_at(&self, position: RationalTime) -> Option<&Fragment> {
		let mut cursor = RationalTime::ZERO;
		for fragment in &self.fragments {
			let end = cursor + fragment.duration;
			if position < end {
				return Some(fragment);
			}
			cursor = end;
		}
		None
	}
}

fn resolve_init_segment(map: &m3u8_rs::Map, base_url: &Url) -> Result<InitSegment> {
	let url = resolve_uri(base_url, &map.uri)
		.map_err(|err| Error::ParsePlaylist(format!("failed to resolve EXT-X-MAP uri: {err}")))?;
	let range = map
		.byte_range
		.as_ref()
		.ok_or_else(|| Error::ParsePlaylist("EXT-X-MAP missing BYTERANGE".into()))?;

	Ok(InitSegment {
		url,
		byte_range: ByteRange::new(range.offset.unwrap_or(0), range.length),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:7\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-MAP:URI=\"part0.mp4\",BYTERANGE=\"800@0\"\n\
#EXTINF:6.0,\n\
#EXT-X-BYTERANGE:500000@800\n\
part0.mp4\n\
#EXTINF:6.0,\n\
#EXT-X-BYTERANGE:480000@500800\n\
part0.mp4\n\
#EXT-X-ENDLIST\n";

	fn base() -> Url {
		Url::parse("http://127.0.0.1:8080/session/hls_level_720.m3u8").unwrap()
	}

	#[test]
	fn parses_fragments_and_init_segment() {
		let playlist = MediaPlaylist::parse(MEDIA.as_bytes(), &base()).unwrap();
		assert_eq!(playlist.target_duration, 6);
		assert_eq!(playlist.version, 7);
		assert_eq!(playlist.fragments.len(), 2);
		assert_eq!(playlist.init_segment.byte_range, ByteRange::new(0, 800));
		assert_eq!(playlist.fragments[0].byte_range, ByteRange::new(800, 500_000));
		assert_eq!(playlist.fragments[1].sequence, 1);
		assert_eq!(
			playlist.fragments[0].url.as_str(),
			"http://127.0.0.1:8080/session/part0.mp4"
		);
	}

	#[test]
	fn rejects_playlist_missing_target_duration() {
		let text = "#EXTM3U\n\
#EXT-X-VERSION:7\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-MAP:URI=\"part0.mp4\",BYTERANGE=\"800@0\"\n\
#EXTINF:6.0,\n\
#EXT-X-BYTERANGE:500000@800\n\
part0.mp4\n";
		assert!(MediaPlaylist::parse(text.as_bytes(), &base()).is_err());
	}

	#[test]
	fn rejects_playlist_missing_media_sequence() {
		let text = "#EXTM3U\n\
#EXT-X-VERSION:7\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MAP:URI=\"part0.mp4\",BYTERANGE=\"800@0\"\n\
#EXTINF:6.0,\n\
#EXT-X-BYTERANGE:500000@800\n\
part0.mp4\n";
		assert!(MediaPlaylist::parse(text.as_bytes(), &base()).is_err());
	}

	#[test]
	fn rejects_playlist_missing_version() {
		let text = "#EXTM3U\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-MAP:URI=\"part0.mp4\",BYTERANGE=\"800@0\"\n\
#EXTINF:6.0,\n\
#EXT-X-BYTERANGE:500000@800\n\
part0.mp4\n";
		assert!(MediaPlaylist::parse(text.as_bytes(), &base()).is_err());
	}

	#[test]
	fn drops_fragment_missing_byte_range() {
		let text = "#EXTM3U\n\
#EXT-X-VERSION:7\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-MAP:URI=\"part0.mp4\",BYTERANGE=\"800@0\"\n\
#EXTINF:6.0,\n\
part0.mp4\n\
#EXTINF:6.0,\n\
#EXT-X-BYTERANGE:480000@500800\n\
part0.mp4\n";
		let playlist = MediaPlaylist::parse(text.as_bytes(), &base()).unwrap();
		assert_eq!(playlist.fragments.len(), 1);
		assert_eq!(playlist.fragments[0].byte_range, ByteRange::new(500_800, 480_000));
	}

	#[test]
	fn rejects_playlist_missing_map_byterange() {
		let text = "#EXTM3U\n\
#EXT-X-VERSION:7\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-MAP:URI=\"part0.mp4\"\n\
#EXTINF:6.0,\n\
#EXT-X-BYTERANGE:500000@800\n\
part0.mp4\n";
		assert!(MediaPlaylist::parse(text.as_bytes(), &base()).is_err());
	}

	#[test]
	fn fragment_at_finds_covering_fragment() {
		let playlist = MediaPlaylist::parse(MEDIA.as_bytes(), &base()).unwrap();
		let fragment = playlist.fragment_at(RationalTime::from_secs_f64(7.0)).unwrap();
		assert_eq!(fragment.sequence, 1);
		assert!(playlist.fragment_at(RationalTime::from_secs_f64(20.0)).is_none());
	}
}
