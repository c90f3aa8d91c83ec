//! The demux/decode adapter contract (C4).
//!
//! The engine treats the bridge into a real decoder pipeline as an external
//! contract, so the signature here is deliberately narrow: local bytes in,
//! translated samples out. [`Mp4Demuxer`] is a reference implementation of
//! that contract for CMAF fragments (`moov` + `moof`/`mdat`), grounded on
//! the box-walking loop in `hang::import::fmp4::Fmp4::decode`.

use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use bytes::Bytes;
use mp4_atom::{Any, DecodeMaybe, Mdat, Moof, Moov};

use crate::error::{Error, Result};
use crate::playlist::Fragment;
use crate::time::RationalTime;

/// One translated access unit from a decoded fragment.
#[derive(Debug, Clone)]
pub struct Sample {
	pub timestamp: RationalTime,
	pub keyframe: bool,
	pub payload: Bytes,
}

/// The video and audio sample sequences produced by decoding one fragment.
#[derive(Debug, Clone)]
pub struct DecodedFragment {
	pub video: Vec<Sample>,
	pub audio: Vec<Sample>,
	/// The fragment's duration per the video track's translated length,
	/// which may differ slightly from the playlist's `#EXTINF` value.
	pub duration: RationalTime,
}

/// Converts a local CMAF file into translated video/audio sample sequences.
pub trait Demuxer: Send + Sync {
	fn decode<'a>(
		&'a self,
		data: Bytes,
		basetime: RationalTime,
		fragment: &'a Fragment,
	) -> Pin<Box<dyn Future<Output = Result<DecodedFragment>> + Send + 'a>>;
}

/// Reference [`Demuxer`] built on `mp4-atom`.
///
/// Decodes a single `moov` (init segment bytes prepended to the fragment
/// bytes by the loader) followed by one or more `moof`/`mdat` pairs.
#[derive(Default)]
pub struct Mp4Demuxer;

impl Demuxer for Mp4Demuxer {
	fn decode<'a>(
		&'a self,
		data: Bytes,
		basetime: RationalTime,
		fragment: &'a Fragment,
	) -> Pin<Box<dyn Future<Output = Result<DecodedFragment>> + Send + 'a>> {
		Box::pin(async move {
			decode_fragment(data, basetime, fragment).map_err(|err| match err.to_string().as_str() {
				"fragment produced no video samples" => Error::EmptyVideo,
				"fragment produced no audio samples" => Error::EmptyAudio,
				message => Error::DecodeMedia(message.to_string()),
			})
		})
	}
}

fn decode_fragment(data: Bytes, basetime: RationalTime, fragment: &Fragment) -> anyhow::Result<DecodedFragment> {
	let mut cursor = std::io::Cursor::new(data.as_ref());

	let mut moov: Option<Moov> = None;
	let mut video = Vec::new();
	let mut audio = Vec::new();
	let mut video_track_ids: Vec<u32> = Vec::new();
	let mut pending_moof: Option<Moof> = None;
	let mut moof_size = 0usize;
	let mut position = 0usize;

	while let Some(atom) = Any::decode_maybe(&mut cursor).context("failed to decode MP4 atom")? {
		let size = cursor.position() as usize - position;
		position = cursor.position() as usize;

		match atom {
			Any::Moov(parsed) => {
				video_track_ids = parsed
					.trak
					.iter()
					.filter(|trak| trak.mdia.hdlr.handler.as_ref() == b"vide")
					.map(|trak| trak.tkhd.track_id)
					.collect();
				moov = Some(parsed);
			}
			Any::Moof(moof) => {
				if pending_moof.is_some() {
					anyhow::bail!("duplicate moof box");
				}
				moof_size = size;
				pending_moof = Some(moof);
			}
			Any::Mdat(mdat) => {
				let moov = moov.as_ref().context("fragment missing init segment (moov)")?;
				let moof = pending_moof.take().context("mdat without preceding moof")?;
				// `size` is the whole encoded mdat box (header + payload); the
				// header is whatever's left once the payload length is removed.
				let header_size = size - mdat.data.len();
				extract_samples(moov, &moof, mdat, &video_track_ids, moof_size, header_size, &mut video, &mut audio)?;
			}
			_ => {}
		}
	}

	if video.is_empty() {
		anyhow::bail!("fragment produced no video samples");
	}
	if audio.is_empty() {
		anyhow::bail!("fragment produced no audio samples");
	}

	translate_and_align(basetime, fragment, &mut video, &mut audio)
}

fn extract_samples(
	moov: &Moov,
	moof: &Moof,
	mdat: Mdat,
	video_track_ids: &[u32],
	moof_size: usize,
	header_size: usize,
	video: &mut Vec<Sample>,
	audio: &mut Vec<Sample>,
) -> anyhow::Result<()> {
	let mdat = Bytes::from(mdat.data);

	for traf in &moof.traf {
		let track_id = traf.tfhd.track_id;
		let trak = moov
			.trak
			.iter()
			.find(|trak| trak.tkhd.track_id == track_id)
			.context("moof references unknown track")?;
		let trex = moov
			.mvex
			.as_ref()
			.and_then(|mvex| mvex.trex.iter().find(|trex| trex.track_id == track_id));

		let default_duration = trex.map(|trex| trex.default_sample_duration).unwrap_or_default();
		let default_size = trex.map(|trex| trex.default_sample_size).unwrap_or_default();
		let default_flags = trex.map(|trex| trex.default_sample_flags).unwrap_or_default();

		let tfdt = traf.tfdt.as_ref().context("traf missing tfdt box")?;
		let mut dts = tfdt.base_media_decode_time;
		let timescale = trak.mdia.mdhd.timescale as u64;
		let is_video = video_track_ids.contains(&track_id);

		let base_offset = traf.tfhd.base_data_offset.unwrap_or_default() as usize;
		let mut offset = base_offset;

		for trun in &traf.trun {
			if let Some(data_offset) = trun.data_offset {
				// Per ISO/IEC 14496-12, `trun.data_offset` is relative to the
				// start of this fragment's moof box, not to the start of
				// `mdat`'s payload. Back it out by the moof box's own size
				// and the mdat box's header size to land inside `mdat.data`.
				let data_offset: usize = data_offset.try_into().context("negative trun data offset")?;
				if data_offset < moof_size {
					anyhow::bail!("trun data offset points inside the moof box");
				}
				offset = base_offset + data_offset - moof_size - header_size;
			}

			for entry in &trun.entries {
				let flags = entry.flags.unwrap_or(traf.tfhd.default_sample_flags.unwrap_or(default_flags));
				let duration = entry
					.duration
					.unwrap_or(traf.tfhd.default_sample_duration.unwrap_or(default_duration));
				let size = entry
					.size
					.unwrap_or(traf.tfhd.default_sample_size.unwrap_or(default_size)) as usize;

				let pts = (dts as i64 + entry.cts.unwrap_or_default() as i64) as u64;
				let timestamp = RationalTime::from_scale(pts, timescale)?;

				if offset + size > mdat.len() {
					anyhow::bail!("sample extends past mdat bounds");
				}
				let payload = mdat.slice(offset..offset + size);

				// https://chromium.googlesource.com/chromium/src/media/+/master/formats/mp4/track_run_iterator.cc#177
				let keyframe = if is_video {
					let sample_depends_on_no_other = (flags >> 24) & 0x3 == 0x2;
					let non_sync = (flags >> 16) & 0x1 == 0x1;
					sample_depends_on_no_other && !non_sync
				} else {
					true
				};

				let sample = Sample { timestamp, keyframe, payload };
				if is_video {
					video.push(sample);
				} else {
					audio.push(sample);
				}

				dts += duration as u64;
				offset += size;
			}
		}
	}

	Ok(())
}

/// Offset every sample by `basetime`, then time-scale the audio track so
/// its last sample lands exactly at the (offset) video track's end time.
fn translate_and_align(
	basetime: RationalTime,
	fragment: &Fragment,
	video: &mut [Sample],
	audio: &mut [Sample],
) -> anyhow::Result<DecodedFragment> {
	let video_start = video.first().map(|s| s.timestamp).unwrap_or(RationalTime::ZERO);
	let video_end = video.last().map(|s| s.timestamp).unwrap_or(RationalTime::ZERO);
	let video_span = video_end.checked_sub(video_start).unwrap_or(RationalTime::ZERO);
	let duration = if video_span.ticks() > 0 { video_span } else { fragment.duration };

	for sample in video.iter_mut() {
		sample.timestamp = (sample.timestamp.checked_sub(video_start).unwrap_or(RationalTime::ZERO)) + basetime;
	}

	let audio_start = audio.first().map(|s| s.timestamp).unwrap_or(RationalTime::ZERO);
	let audio_span = audio.last().map(|s| s.timestamp).unwrap_or(RationalTime::ZERO).saturating_sub(audio_start);

	// Scale factor mapping the audio track's own span onto the video
	// track's translated span, so encoder drift between the two tracks
	// doesn't accumulate across fragment boundaries.
	let scale = if audio_span.ticks() > 0 {
		duration.ticks() as f64 / audio_span.ticks() as f64
	} else {
		1.0
	};

	for sample in audio.iter_mut() {
		let relative = sample.timestamp.saturating_sub(audio_start);
		let scaled_ticks = (relative.ticks() as f64 * scale).round() as u64;
		sample.timestamp = RationalTime::from_ticks(scaled_ticks) + basetime;
	}

	Ok(DecodedFragment {
		video: video.to_vec(),
		audio: audio.to_vec(),
		duration,
	})
}
