//! Player facade (C8): the single external entry point embedding
//! applications talk to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, warn};
use url::Url;

use crate::cache::FragmentCache;
use crate::demux::{DecodedFragment, Demuxer};
use crate::error::Error;
use crate::fetch::ByteRangeFetcher;
use crate::playlist::{MasterPlaylist, MediaPlaylist};
use crate::renderer::{AudioRenderer, BuffersRenderer, VideoLayer};
use crate::session::{HlsSession, SessionOutput};
use crate::time::RationalTime;

const SESSION_TICK: Duration = Duration::from_millis(100);
const DISPLAY_TICK: Duration = Duration::from_millis(16);
/// Below this margin to end-of-stream or loaded data, the facade treats
/// playback as finished or starved respectively.
const EPSILON: Duration = Duration::from_millis(50);
const MASTER_LOAD_RETRY: Duration = Duration::from_secs(1);

/// The facade's observable playback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayState {
	Paused,
	Playing,
	Finished,
}

/// An aggregate status snapshot, refreshed on every 60 Hz tick.
///
/// `serde`-derived so an embedding application can forward it across an
/// IPC/FFI boundary (e.g. to the messaging app's UI process) without this
/// crate needing to know anything about that transport.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
	pub play_state: PlayState,
	pub current_time: RationalTime,
	pub buffering: bool,
	pub buffered_seconds: RationalTime,
	pub base_rate: f64,
	pub seek_id: u64,
}

/// The engine's `[0, buffered)` loaded range paired with the session's total
/// duration, refreshed on every 60 Hz tick. Kept distinct from
/// [`StatusSnapshot`] so an embedder's buffering-bar UI can subscribe to
/// just the numbers it needs without decoding the whole status record.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BufferingStatus {
	/// The loaded range's end; the range itself always starts at zero since
	/// this engine never discards already-buffered data ahead of playback.
	pub buffered: RationalTime,
	/// The session's total playable duration, `RationalTime::ZERO` before a
	/// master playlist has finished loading.
	pub total_duration: RationalTime,
}

enum Command {
	Play,
	Pause,
	TogglePlayPause,
	Seek(RationalTime),
	SetBaseRate(f64),
	SetVolume(f32),
	SetSoundEnabled(bool),
	SetVideoQuality(Option<u32>),
	AttachSession(Box<HlsSession>),
}

/// Wraps the renderer (C7) and, once a master playlist has loaded, a
/// session (C6). All entry points are meant to be called from a single
/// embedding-application thread; in debug builds a thread-id mismatch
/// on a later call panics rather than silently racing.
pub struct PlayerFacade {
	owner: std::thread::ThreadId,
	commands: mpsc::UnboundedSender<Command>,
	status_rx: watch::Receiver<StatusSnapshot>,
	buffering_status_rx: watch::Receiver<BufferingStatus>,
	completed_tx: broadcast::Sender<()>,
	seek_id: Arc<AtomicU64>,
	fetcher: Arc<dyn ByteRangeFetcher>,
	demuxer: Arc<dyn Demuxer>,
	cache_root: std::path::PathBuf,
}

struct Output {
	renderer: Arc<BuffersRenderer>,
	base_rate: Mutex<f64>,
}

impl SessionOutput for Output {
	fn current_time_and_rate(&self) -> (RationalTime, f64) {
		(self.renderer.clock(), *self.base_rate.lock().unwrap())
	}

	fn on_new_fragment(&self, _fragment_index: usize, _basetime: RationalTime, decoded: DecodedFragment) {
		self.renderer.schedule(decoded);
	}

	fn on_error_loading_fragment(&self, err: Error) {
		warn!(%err, "fragment load failed");
	}
}

struct Actor {
	renderer: Arc<BuffersRenderer>,
	output: Arc<Output>,
	session: Option<Box<HlsSession>>,
	play_state: PlayState,
	seek_id: Arc<AtomicU64>,
	volume: f32,
	sound_enabled: bool,
}

impl PlayerFacade {
	/// Construct a facade over caller-supplied decoder layers, using the
	/// default `reqwest`-backed fetcher and the reference `Mp4Demuxer`.
	#[cfg(feature = "reqwest-fetcher")]
	pub fn new(video_layer: Arc<dyn VideoLayer>, audio_renderer: Arc<dyn AudioRenderer>, cache_root: std::path::PathBuf) -> Self {
		let client = reqwest::Client::builder()
			.user_agent(concat!("hls-core/", env!("CARGO_PKG_VERSION")))
			.build()
			.expect("failed to build default HTTP client");
		Self::with_fetcher(
			video_layer,
			audio_renderer,
			Arc::new(crate::fetch::ReqwestFetcher::new(client)),
			Arc::new(crate::demux::Mp4Demuxer),
			cache_root,
		)
	}

	pub fn with_fetcher(
		video_layer: Arc<dyn VideoLayer>,
		audio_renderer: Arc<dyn AudioRenderer>,
		fetcher: Arc<dyn ByteRangeFetcher>,
		demuxer: Arc<dyn Demuxer>,
		cache_root: std::path::PathBuf,
	) -> Self {
		let renderer = Arc::new(BuffersRenderer::new(video_layer, audio_renderer));
		let output = Arc::new(Output { renderer: renderer.clone(), base_rate: Mutex::new(1.0) });
		let seek_id = Arc::new(AtomicU64::new(0));

		let (status_tx, status_rx) = watch::channel(StatusSnapshot {
			play_state: PlayState::Paused,
			current_time: RationalTime::ZERO,
			buffering: false,
			buffered_seconds: RationalTime::ZERO,
			base_rate: 1.0,
			seek_id: 0,
		});
		let (buffering_status_tx, buffering_status_rx) = watch::channel(BufferingStatus::default());
		let (completed_tx, _) = broadcast::channel(1);
		let (command_tx, command_rx) = mpsc::unbounded_channel();

		let actor = Actor {
			renderer,
			output,
			session: None,
			play_state: PlayState::Paused,
			seek_id: seek_id.clone(),
			volume: 1.0,
			sound_enabled: true,
		};

		tokio::spawn(actor.run(command_rx, status_tx, buffering_status_tx, completed_tx.clone()));

		Self {
			owner: std::thread::current().id(),
			commands: command_tx,
			status_rx,
			buffering_status_rx,
			completed_tx,
			seek_id,
			fetcher,
			demuxer,
			cache_root,
		}
	}

	fn assert_owner_thread(&self) {
		debug_assert_eq!(
			std::thread::current().id(),
			self.owner,
			"PlayerFacade entry point called from a foreign thread"
		);
	}

	/// Load a master playlist and, on success, start a session. Retries
	/// every second on failure; treated as self-healing and never surfaced
	/// to the caller as an error.
	pub fn load(&self, master_url: Url) {
		self.assert_owner_thread();
		let commands = self.commands.clone();
		let fetcher = self.fetcher.clone();
		let demuxer = self.demuxer.clone();
		let cache_root = self.cache_root.clone();

		tokio::spawn(async move {
			loop {
				match load_session(&master_url, &fetcher, &demuxer, &cache_root).await {
					Ok(session) => {
						let _ = commands.send(Command::AttachSession(Box::new(session)));
						return;
					}
					Err(err) => {
						error!(%err, url = %master_url, "failed to load master playlist, retrying in 1s");
						tokio::time::sleep(MASTER_LOAD_RETRY).await;
					}
				}
			}
		});
	}

	pub fn play(&self) {
		self.assert_owner_thread();
		let _ = self.commands.send(Command::Play);
	}

	pub fn pause(&self) {
		self.assert_owner_thread();
		let _ = self.commands.send(Command::Pause);
	}

	pub fn toggle_play_pause(&self) {
		self.assert_owner_thread();
		let _ = self.commands.send(Command::TogglePlayPause);
	}

	pub fn seek(&self, t: RationalTime) -> u64 {
		self.assert_owner_thread();
		let id = self.seek_id.fetch_add(1, Ordering::Relaxed) + 1;
		let _ = self.commands.send(Command::Seek(t));
		id
	}

	pub fn set_base_rate(&self, rate: f64) {
		self.assert_owner_thread();
		let _ = self.commands.send(Command::SetBaseRate(rate));
	}

	pub fn set_volume(&self, volume: f32) {
		self.assert_owner_thread();
		let _ = self.commands.send(Command::SetVolume(volume));
	}

	pub fn set_sound_enabled(&self, enabled: bool) {
		self.assert_owner_thread();
		let _ = self.commands.send(Command::SetSoundEnabled(enabled));
	}

	pub fn set_video_quality(&self, height: Option<u32>) {
		self.assert_owner_thread();
		let _ = self.commands.send(Command::SetVideoQuality(height));
	}

	/// The aggregate status snapshot stream, refreshed on every 60 Hz tick.
	pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
		self.status_rx.clone()
	}

	/// The `[0, buffered)` loaded-range stream, refreshed on every 60 Hz tick.
	pub fn buffering_status(&self) -> watch::Receiver<BufferingStatus> {
		self.buffering_status_rx.clone()
	}

	/// Subscribe to end-of-stream notifications. Dropping the receiver is
	/// the `removePlaybackCompleted` half of an add/remove subscription pair.
	pub fn on_playback_completed(&self) -> broadcast::Receiver<()> {
		self.completed_tx.subscribe()
	}
}

async fn load_session(
	master_url: &Url,
	fetcher: &Arc<dyn ByteRangeFetcher>,
	demuxer: &Arc<dyn Demuxer>,
	cache_root: &std::path::Path,
) -> crate::error::Result<HlsSession> {
	let master_bytes = fetcher.fetch(master_url).await?;
	let mut master = MasterPlaylist::parse(&master_bytes, master_url)?;

	// A variant whose media playlist fails to fetch or parse is dropped
	// rather than failing the whole master load; the session proceeds
	// with whatever variants remain and only fails if none do.
	let mut variants = Vec::with_capacity(master.variants.len());
	let mut media_playlists = Vec::with_capacity(master.variants.len());
	for variant in master.variants.drain(..) {
		let playlist = match fetcher.fetch(&variant.media_playlist_url).await {
			Ok(bytes) => MediaPlaylist::parse(&bytes, &variant.media_playlist_url),
			Err(err) => Err(err),
		};
		match playlist {
			Ok(playlist) => {
				variants.push(variant);
				media_playlists.push(playlist);
			}
			Err(err) => warn!(%err, height = variant.height, url = %variant.media_playlist_url, "dropping variant, failed to load media playlist"),
		}
	}
	master.variants = variants;

	if master.variants.is_empty() {
		return Err(Error::ParsePlaylist("no variant's media playlist could be loaded".into()));
	}

	let cache = Arc::new(FragmentCache::new(cache_root.to_path_buf(), master.id).await?);
	let mut session = HlsSession::new(master, media_playlists, fetcher.clone(), demuxer.clone(), cache)?;
	session.start();
	Ok(session)
}

impl Actor {
	async fn run(
		mut self,
		mut commands: mpsc::UnboundedReceiver<Command>,
		status_tx: watch::Sender<StatusSnapshot>,
		buffering_status_tx: watch::Sender<BufferingStatus>,
		completed_tx: broadcast::Sender<()>,
	) {
		let mut session_timer = tokio::time::interval(SESSION_TICK);
		let mut display_timer = tokio::time::interval(DISPLAY_TICK);

		loop {
			tokio::select! {
				maybe_cmd = commands.recv() => {
					match maybe_cmd {
						Some(cmd) => self.handle_command(cmd),
						None => break,
					}
				}
				_ = session_timer.tick() => {
					if let Some(session) = self.session.as_mut() {
						session.tick(self.output.as_ref()).await;
					}
				}
				_ = display_timer.tick() => {
					self.renderer.display_link_trigger();
					self.on_display_tick(&status_tx, &buffering_status_tx, &completed_tx);
				}
			}
		}

		if let Some(session) = self.session.take() {
			session.finish().await;
		}
	}

	fn handle_command(&mut self, cmd: Command) {
		match cmd {
			Command::Play => {
				if self.play_state == PlayState::Finished {
					if let Some(session) = self.session.as_mut() {
						session.seek(RationalTime::ZERO);
					}
					self.renderer.seek(RationalTime::ZERO);
				}
				self.renderer.play();
				self.play_state = PlayState::Playing;
			}
			Command::Pause => {
				self.renderer.pause();
				if self.play_state == PlayState::Playing {
					self.play_state = PlayState::Paused;
				}
			}
			Command::TogglePlayPause => {
				if self.play_state == PlayState::Playing {
					self.handle_command(Command::Pause);
				} else {
					self.handle_command(Command::Play);
				}
			}
			Command::Seek(t) => {
				if let Some(session) = self.session.as_mut() {
					session.seek(t);
				}
				self.renderer.seek(t);
			}
			Command::SetBaseRate(rate) => {
				*self.output.base_rate.lock().unwrap() = rate;
				self.renderer.set_base_rate(rate);
			}
			Command::SetVolume(volume) => {
				self.volume = volume.clamp(0.0, 1.0);
			}
			Command::SetSoundEnabled(enabled) => {
				self.sound_enabled = enabled;
			}
			Command::SetVideoQuality(height) => {
				if let Some(session) = self.session.as_mut() {
					session.set_quality(height, self.renderer.clock());
				}
				self.renderer.flush();
			}
			Command::AttachSession(session) => {
				if let Some(previous) = self.session.replace(session) {
					tokio::spawn(async move { previous.finish().await });
				}
			}
		}
	}

	fn on_display_tick(
		&mut self,
		status_tx: &watch::Sender<StatusSnapshot>,
		buffering_status_tx: &watch::Sender<BufferingStatus>,
		completed_tx: &broadcast::Sender<()>,
	) {
		let clock = self.renderer.clock();
		let mut buffered_seconds = RationalTime::ZERO;
		let mut finish_time = RationalTime::ZERO;

		if let Some(session) = self.session.as_ref() {
			buffered_seconds = session.loading_progress();
			finish_time = session.finish_time();
			if self.play_state == PlayState::Playing && finish_time.saturating_sub(clock) < RationalTime::from_secs_f64(EPSILON.as_secs_f64()) {
				self.renderer.pause();
				self.play_state = PlayState::Finished;
				let _ = completed_tx.send(());
			}

			let margin = buffered_seconds.saturating_sub(clock);
			let starved = margin < RationalTime::from_secs_f64(EPSILON.as_secs_f64());

			if self.play_state == PlayState::Playing {
				if starved && self.renderer.is_running() {
					self.renderer.pause();
				} else if !starved && !self.renderer.is_running() {
					self.renderer.play();
				}
			}
		}

		// Published every tick regardless of whether a session has attached
		// yet, so play()/pause() called immediately after construction are
		// observable on the status stream without waiting on a master load.
		let status = StatusSnapshot {
			play_state: self.play_state,
			current_time: clock,
			buffering: self.play_state == PlayState::Playing && !self.renderer.is_running(),
			buffered_seconds,
			base_rate: *self.output.base_rate.lock().unwrap(),
			seek_id: self.seek_id.load(Ordering::Relaxed),
		};
		let _ = status_tx.send(status);

		let _ = buffering_status_tx.send(BufferingStatus { buffered: buffered_seconds, total_duration: finish_time });
	}
}
