//! HLS session driver (C6): the 100 ms tick loop, seek, and quality changes.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::abr::AbrController;
use crate::demux::{DecodedFragment, Demuxer};
use crate::error::{Error, Result};
use crate::fetch::ByteRangeFetcher;
use crate::loader::{BufferingEpoch, FragmentLoader};
use crate::playlist::{MasterPlaylist, MediaPlaylist};
use crate::time::RationalTime;

/// A fragment's position on the session's shared presentation timeline.
#[derive(Debug, Clone, Copy)]
pub struct TimeFragment {
	pub index: usize,
	pub timestamp: RationalTime,
	pub duration: RationalTime,
}

/// Output callbacks the session drives; implemented by the player facade.
pub trait SessionOutput: Send + Sync {
	/// The renderer's current clock position and live playback rate.
	fn current_time_and_rate(&self) -> (RationalTime, f64);
	fn on_new_fragment(&self, fragment_index: usize, basetime: RationalTime, decoded: DecodedFragment);
	fn on_error_loading_fragment(&self, err: Error);
}

/// Drives fragment loading for one playback session.
///
/// All mutating methods (`tick`, `seek`, `set_quality`) are meant to be
/// invoked serially from a single owning task, which is what gives the
/// loading pipeline its ordering guarantees: no two loads for the same
/// session are ever outstanding at once.
pub struct HlsSession {
	master: MasterPlaylist,
	time_fragments: Vec<TimeFragment>,
	media_playlists: Vec<MediaPlaylist>,
	loaders: Vec<FragmentLoader>,
	cache: Arc<crate::cache::FragmentCache>,
	abr: AbrController,
	buffering: BufferingEpoch,
	started: bool,
	skip_scheduled: bool,
	current_fragment_index: usize,
	loading_progress: RationalTime,
	selected_quality_height: Option<u32>,
}

impl HlsSession {
	pub fn new(
		master: MasterPlaylist,
		media_playlists: Vec<MediaPlaylist>,
		fetcher: Arc<dyn ByteRangeFetcher>,
		demuxer: Arc<dyn Demuxer>,
		cache: Arc<crate::cache::FragmentCache>,
	) -> Result<Self> {
		if media_playlists.len() != master.variants.len() {
			return Err(Error::ParsePlaylist(
				"number of media playlists must match the number of variants".into(),
			));
		}
		let Some(primary) = media_playlists.first() else {
			return Err(Error::ParsePlaylist("master playlist has no variants".into()));
		};
		if primary.fragments.is_empty() {
			return Err(Error::NoFragment);
		}

		let mut time_fragments = Vec::with_capacity(primary.fragments.len());
		let mut cursor = RationalTime::ZERO;
		for (index, fragment) in primary.fragments.iter().enumerate() {
			time_fragments.push(TimeFragment { index, timestamp: cursor, duration: fragment.duration });
			cursor = cursor + fragment.duration;
		}

		let loaders = master
			.variants
			.iter()
			.zip(&media_playlists)
			.map(|(variant, playlist)| {
				FragmentLoader::new(
					variant.clone(),
					playlist.init_segment.clone(),
					fetcher.clone(),
					demuxer.clone(),
					cache.clone(),
				)
			})
			.collect();

		Ok(Self {
			master,
			time_fragments,
			media_playlists,
			loaders,
			cache,
			abr: AbrController::new(),
			buffering: BufferingEpoch::new(),
			started: false,
			skip_scheduled: false,
			current_fragment_index: 0,
			loading_progress: RationalTime::ZERO,
			selected_quality_height: None,
		})
	}

	pub fn start(&mut self) {
		self.started = true;
	}

	/// Evict this session's on-disk fragment cache. Called when the session
	/// is torn down: replaced by a newly loaded master, or on facade drop.
	pub async fn finish(&self) {
		if let Err(err) = self.cache.finish().await {
			warn!(%err, "failed to evict session cache");
		}
	}

	pub fn master(&self) -> &MasterPlaylist {
		&self.master
	}

	pub fn loading_progress(&self) -> RationalTime {
		self.loading_progress
	}

	/// The session's total playable duration (the last fragment's end).
	pub fn finish_time(&self) -> RationalTime {
		self.time_fragments
			.last()
			.map(|tf| tf.timestamp + tf.duration)
			.unwrap_or(RationalTime::ZERO)
	}

	/// Drive one 100 ms tick: ask the ABR controller whether to load the
	/// current fragment, and if so, do it. No-op while a previous tick's
	/// load is still outstanding, or once every fragment has been loaded.
	pub async fn tick(&mut self, output: &dyn SessionOutput) {
		if !self.started || self.skip_scheduled || self.current_fragment_index >= self.time_fragments.len() {
			return;
		}

		let (player_time, rate) = output.current_time_and_rate();
		let fragment_index = self.current_fragment_index;

		let Some(variant) = self.abr.choose(
			&self.master.variants,
			fragment_index as u64,
			player_time,
			self.loading_progress,
			rate,
			self.selected_quality_height,
		) else {
			// Buffer is full; the caller should not fetch further ahead.
			return;
		};

		let Some(variant_index) = self.master.variants.iter().position(|v| v.bandwidth == variant.bandwidth) else {
			return;
		};
		let Some(fragment) = self.media_playlists[variant_index].fragments.get(fragment_index).cloned() else {
			return;
		};

		self.skip_scheduled = true;
		let snapshot = self.buffering.current();
		let basetime = self.time_fragments[fragment_index].timestamp;

		let result = self.loaders[variant_index].load(&fragment, basetime, &self.buffering, snapshot).await;

		// The after-disposal hook: regardless of outcome, let the next tick through.
		self.skip_scheduled = false;

		if self.buffering.current() != snapshot {
			debug!(fragment_index, "dropping stale fragment load after seek/quality change");
			return;
		}

		match result {
			Ok(None) => {}
			Ok(Some(loaded)) => {
				self.loading_progress = basetime + loaded.decoded.duration;
				self.current_fragment_index += 1;
				self.abr.loaded(&variant, fragment_index as u64, loaded.bytes, loaded.load_seconds, loaded.is_cached);
				output.on_new_fragment(fragment_index, basetime, loaded.decoded);
			}
			Err(err) => {
				warn!(fragment_index, %err, "failed to load fragment");
				output.on_error_loading_fragment(err);
			}
		}
	}

	/// Seek to `t`, invalidating every in-flight load.
	pub fn seek(&mut self, t: RationalTime) {
		self.current_fragment_index = self.find_fragment_index(t);
		self.loading_progress = t;
		self.buffering.bump();
		self.skip_scheduled = false;
	}

	/// Pin (or clear) the selected quality, then reseek to `current_time` to
	/// force re-selection and flush already-buffered lower-quality samples.
	pub fn set_quality(&mut self, height: Option<u32>, current_time: RationalTime) {
		self.selected_quality_height = height;
		self.seek(current_time);
	}

	fn find_fragment_index(&self, t: RationalTime) -> usize {
		for tf in &self.time_fragments {
			if t < tf.timestamp + tf.duration {
				return tf.index;
			}
		}
		self.time_fragments.len().saturating_sub(1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::FragmentCache;
	use crate::fetch::testing::MemoryFetcher;
	use crate::playlist::{ByteRange, Fragment, InitSegment, Variant};
	use std::sync::Mutex;
	use url::Url;

	struct NoopDemuxer;

	impl Demuxer for NoopDemuxer {
		fn decode<'a>(
			&'a self,
			data: bytes::Bytes,
			basetime: RationalTime,
			fragment: &'a Fragment,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<DecodedFragment>> + Send + 'a>> {
			Box::pin(async move {
				Ok(DecodedFragment {
					video: vec![crate::demux::Sample { timestamp: basetime, keyframe: true, payload: data.clone() }],
					audio: vec![crate::demux::Sample { timestamp: basetime, keyframe: true, payload: data }],
					duration: fragment.duration,
				})
			})
		}
	}

	#[derive(Default)]
	struct RecordingOutput {
		time: Mutex<RationalTime>,
		rate: Mutex<f64>,
		fragments: Mutex<Vec<usize>>,
	}

	impl SessionOutput for RecordingOutput {
		fn current_time_and_rate(&self) -> (RationalTime, f64) {
			(*self.time.lock().unwrap(), *self.rate.lock().unwrap())
		}
		fn on_new_fragment(&self, fragment_index: usize, _basetime: RationalTime, _decoded: DecodedFragment) {
			self.fragments.lock().unwrap().push(fragment_index);
		}
		fn on_error_loading_fragment(&self, _err: Error) {}
	}

	fn variant(bandwidth: u64, height: u32) -> Variant {
		Variant {
			bandwidth,
			width: height * 16 / 9,
			height,
			media_playlist_url: Url::parse(&format!("http://127.0.0.1/level{height}.m3u8")).unwrap(),
		}
	}

	fn media_playlist(height: u32, fetcher: &MemoryFetcher) -> MediaPlaylist {
		let init_url = Url::parse(&format!("http://127.0.0.1/init{height}.mp4")).unwrap();
		fetcher.insert(&init_url, &b"INIT"[..]);

		let mut fragments = Vec::new();
		for seq in 0..3 {
			let frag_url = Url::parse(&format!("http://127.0.0.1/part{height}_{seq}.mp4")).unwrap();
			fetcher.insert(&frag_url, vec![0u8; 100]);
			fragments.push(Fragment {
				sequence: seq,
				duration: RationalTime::from_secs_f64(6.0),
				byte_range: ByteRange::new(0, 100),
				url: frag_url,
			});
		}

		MediaPlaylist {
			target_duration: 6,
			version: 7,
			media_sequence: 0,
			init_segment: InitSegment { url: init_url, byte_range: ByteRange::new(0, 4) },
			fragments,
		}
	}

	async fn build_session(fetcher: Arc<MemoryFetcher>) -> HlsSession {
		let master = MasterPlaylist {
			id: 1,
			version: 3,
			variants: vec![variant(1_500_000, 720), variant(400_000, 360)],
		};
		let playlists = vec![media_playlist(720, &fetcher), media_playlist(360, &fetcher)];

		let dir = tempfile::tempdir().unwrap();
		let root = FragmentCache::wipe_root(dir.path()).await.unwrap();
		let cache = Arc::new(FragmentCache::new(root, master.id).await.unwrap());

		HlsSession::new(master, playlists, fetcher, Arc::new(NoopDemuxer), cache).unwrap()
	}

	#[tokio::test]
	async fn ticks_load_fragments_in_order() {
		let fetcher = Arc::new(MemoryFetcher::default());
		let mut session = build_session(fetcher).await;
		session.start();

		let output = RecordingOutput::default();
		for _ in 0..3 {
			session.tick(&output).await;
		}

		assert_eq!(*output.fragments.lock().unwrap(), vec![0, 1, 2]);
		assert_eq!(session.loading_progress(), RationalTime::from_secs_f64(18.0));
	}

	#[tokio::test]
	async fn finish_evicts_the_session_cache_directory() {
		let fetcher = Arc::new(MemoryFetcher::default());
		let master = MasterPlaylist { id: 1, version: 3, variants: vec![variant(1_500_000, 720)] };
		let playlists = vec![media_playlist(720, &fetcher)];

		let dir = tempfile::tempdir().unwrap();
		let root = FragmentCache::wipe_root(dir.path()).await.unwrap();
		let cache = Arc::new(FragmentCache::new(root, master.id).await.unwrap());
		let master_dir = dir.path().join("hls").join(format!("master{}", master.id));
		assert!(master_dir.exists());

		let session = HlsSession::new(master, playlists, fetcher, Arc::new(NoopDemuxer), cache).unwrap();
		session.finish().await;
		assert!(!master_dir.exists());
	}

	#[tokio::test]
	async fn seek_invalidates_in_flight_epoch_and_resets_progress() {
		let fetcher = Arc::new(MemoryFetcher::default());
		let mut session = build_session(fetcher).await;
		session.start();

		let output = RecordingOutput::default();
		session.tick(&output).await;
		assert_eq!(session.current_fragment_index, 1);

		session.seek(RationalTime::ZERO);
		assert_eq!(session.current_fragment_index, 0);
		assert_eq!(session.loading_progress(), RationalTime::ZERO);
	}

	#[tokio::test]
	async fn set_quality_reseeks_to_current_time() {
		let fetcher = Arc::new(MemoryFetcher::default());
		let mut session = build_session(fetcher).await;
		session.start();

		let output = RecordingOutput::default();
		session.tick(&output).await;

		session.set_quality(Some(360), RationalTime::from_secs_f64(6.0));
		assert_eq!(session.selected_quality_height, Some(360));
		assert_eq!(session.current_fragment_index, 1);
	}

	#[test]
	fn find_fragment_index_clamps_to_last_fragment_past_end() {
		let fetcher = Arc::new(MemoryFetcher::default());
		let master = MasterPlaylist { id: 1, version: 3, variants: vec![variant(1_500_000, 720)] };
		let playlists = vec![media_playlist(720, &fetcher)];
		let session = build_session_sync(master, playlists, fetcher);
		assert_eq!(session.find_fragment_index(RationalTime::from_secs_f64(1000.0)), 2);
	}

	fn build_session_sync(master: MasterPlaylist, playlists: Vec<MediaPlaylist>, fetcher: Arc<MemoryFetcher>) -> HlsSession {
		let dir = tempfile::tempdir().unwrap();
		let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
		rt.block_on(async {
			let root = FragmentCache::wipe_root(dir.path()).await.unwrap();
			let cache = Arc::new(FragmentCache::new(root, master.id).await.unwrap());
			HlsSession::new(master, playlists, fetcher, Arc::new(NoopDemuxer), cache).unwrap()
		})
	}
}
