//! Buffers renderer (C7): ring-buffered video/audio queues and the
//! synchronizer that drives their shared playback clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::demux::{DecodedFragment, Sample};
use crate::time::RationalTime;

const VIDEO_RING_SEED: usize = 2000;
const AUDIO_RING_SEED: usize = 500;

/// A FIFO queue that doubles its capacity hint when it fills up.
///
/// There's no hard capacity limit enforced (the renderer is expected to
/// drain faster than fragments arrive); this only tracks a capacity hint
/// for callers that want to reason about memory pressure.
struct RingBuffer {
	samples: VecDeque<Sample>,
	capacity_hint: usize,
}

impl RingBuffer {
	fn new(seed: usize) -> Self {
		Self { samples: VecDeque::new(), capacity_hint: seed }
	}

	fn push_all(&mut self, samples: impl IntoIterator<Item = Sample>) {
		for sample in samples {
			if self.samples.len() >= self.capacity_hint {
				self.capacity_hint *= 2;
			}
			self.samples.push_back(sample);
		}
	}

	fn pop_front(&mut self) -> Option<Sample> {
		self.samples.pop_front()
	}

	fn front(&self) -> Option<&Sample> {
		self.samples.front()
	}

	fn clear(&mut self) {
		self.samples.clear();
	}
}

/// The decoder-facing surface the renderer drains into. Modeled as a
/// trait since the actual video decode/display pipeline lives outside
/// this crate's scope.
pub trait VideoLayer: Send + Sync {
	fn is_ready_for_more(&self) -> bool;
	fn enqueue(&self, sample: Sample);
	fn flush(&self);
}

/// The audio-facing surface the renderer drains into.
pub trait AudioRenderer: Send + Sync {
	fn is_ready_for_more(&self) -> bool;
	fn enqueue(&self, sample: Sample);
	fn flush(&self);
}

/// Drives the shared presentation clock video and audio play out against.
///
/// `set_rate` captures the wall-clock instant of the change so
/// `current_time` can be computed without a periodic driver; `seek` is the
/// atomic "set rate to 0 at time t" operation seeking needs.
pub struct Synchronizer {
	base: Mutex<(RationalTime, Instant)>,
	rate: AtomicU64,
}

impl Synchronizer {
	pub fn new() -> Self {
		Self { base: Mutex::new((RationalTime::ZERO, Instant::now())), rate: AtomicU64::new(0f64.to_bits()) }
	}

	pub fn rate(&self) -> f64 {
		f64::from_bits(self.rate.load(Ordering::Relaxed))
	}

	pub fn current_time(&self) -> RationalTime {
		let (base_time, base_instant) = *self.base.lock().unwrap();
		let rate = self.rate();
		if rate == 0.0 {
			return base_time;
		}
		let elapsed = base_instant.elapsed().as_secs_f64() * rate;
		RationalTime::from_secs_f64((base_time.as_secs_f64() + elapsed).max(0.0))
	}

	pub fn set_rate(&self, rate: f64) {
		let now = self.current_time();
		*self.base.lock().unwrap() = (now, Instant::now());
		self.rate.store(rate.to_bits(), Ordering::Relaxed);
	}

	/// Atomically set the rate to 0 at time `t`.
	pub fn seek(&self, t: RationalTime) {
		*self.base.lock().unwrap() = (t, Instant::now());
		self.rate.store(0f64.to_bits(), Ordering::Relaxed);
	}
}

impl Default for Synchronizer {
	fn default() -> Self {
		Self::new()
	}
}

/// Owns the ring buffers, synchronizer, and decoder-facing layers for one
/// session's playback.
pub struct BuffersRenderer {
	video_layer: std::sync::Arc<dyn VideoLayer>,
	audio_renderer: std::sync::Arc<dyn AudioRenderer>,
	synchronizer: Synchronizer,
	video_ring: Mutex<RingBuffer>,
	audio_ring: Mutex<RingBuffer>,
	base_rate: Mutex<f64>,
	enqueue_in_progress: AtomicBool,
	running: AtomicBool,
}

impl BuffersRenderer {
	pub fn new(video_layer: std::sync::Arc<dyn VideoLayer>, audio_renderer: std::sync::Arc<dyn AudioRenderer>) -> Self {
		Self {
			video_layer,
			audio_renderer,
			synchronizer: Synchronizer::new(),
			video_ring: Mutex::new(RingBuffer::new(VIDEO_RING_SEED)),
			audio_ring: Mutex::new(RingBuffer::new(AUDIO_RING_SEED)),
			base_rate: Mutex::new(1.0),
			enqueue_in_progress: AtomicBool::new(false),
			running: AtomicBool::new(false),
		}
	}

	pub fn clock(&self) -> RationalTime {
		self.synchronizer.current_time()
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Relaxed)
	}

	/// Enqueue a decoded fragment, truncating each track to the last
	/// key-frame at or before the synchronizer's current clock so playback
	/// can resume cleanly after a seek or quality change.
	pub fn schedule(&self, fragment: DecodedFragment) {
		let clock = self.clock();

		let video_cut = cut_index(&fragment.video, clock);
		self.video_ring.lock().unwrap().push_all(fragment.video.into_iter().skip(video_cut));

		let audio_cut = cut_index(&fragment.audio, clock);
		self.audio_ring.lock().unwrap().push_all(fragment.audio.into_iter().skip(audio_cut));
	}

	/// Called on the ~60 Hz display cadence: drain both rings into the
	/// decoder-facing layers while they're ready for more.
	pub fn display_link_trigger(&self) {
		if self.enqueue_in_progress.swap(true, Ordering::AcqRel) {
			return;
		}

		if self.running.load(Ordering::Relaxed) {
			let clock = self.clock();
			let stalled = !self.video_layer.is_ready_for_more()
				&& self.video_ring.lock().unwrap().front().is_some_and(|s| s.timestamp < clock);
			if stalled {
				self.video_layer.flush();
			}

			while self.video_layer.is_ready_for_more() {
				let next = self.video_ring.lock().unwrap().pop_front();
				match next {
					Some(sample) => self.video_layer.enqueue(sample),
					None => break,
				}
			}

			while self.audio_renderer.is_ready_for_more() {
				let next = self.audio_ring.lock().unwrap().pop_front();
				match next {
					Some(sample) => self.audio_renderer.enqueue(sample),
					None => break,
				}
			}
		}

		self.enqueue_in_progress.store(false, Ordering::Release);
	}

	pub fn play(&self) {
		let rate = *self.base_rate.lock().unwrap();
		self.synchronizer.set_rate(rate);
		self.running.store(true, Ordering::Relaxed);
	}

	pub fn pause(&self) {
		self.synchronizer.set_rate(0.0);
		self.running.store(false, Ordering::Relaxed);
	}

	pub fn set_base_rate(&self, rate: f64) {
		*self.base_rate.lock().unwrap() = rate;
		if self.running.load(Ordering::Relaxed) {
			self.synchronizer.set_rate(rate);
		}
	}

	/// Seek to `t`: stop the clock there and flush everything downstream.
	pub fn seek(&self, t: RationalTime) {
		self.synchronizer.seek(t);
		self.running.store(false, Ordering::Relaxed);
		self.flush();
	}

	/// Flush the layers and rings without moving the clock (quality change).
	pub fn flush(&self) {
		self.video_layer.flush();
		self.audio_renderer.flush();
		self.video_ring.lock().unwrap().clear();
		self.audio_ring.lock().unwrap().clear();
	}
}

/// The largest index `cut` such that `samples[cut]` is at/before `clock`
/// and is a key sample; `0` if every sample is ahead of the clock.
fn cut_index(samples: &[Sample], clock: RationalTime) -> usize {
	samples
		.iter()
		.enumerate()
		.rev()
		.find(|(_, sample)| sample.timestamp <= clock && sample.keyframe)
		.map(|(index, _)| index)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use std::sync::Arc;

	#[derive(Default)]
	struct RecordingLayer {
		ready: std::sync::atomic::AtomicBool,
		enqueued: Mutex<Vec<RationalTime>>,
		flushes: Mutex<u32>,
	}

	impl RecordingLayer {
		fn new(ready: bool) -> Self {
			Self { ready: std::sync::atomic::AtomicBool::new(ready), ..Default::default() }
		}
	}

	impl VideoLayer for RecordingLayer {
		fn is_ready_for_more(&self) -> bool {
			self.ready.load(Ordering::Relaxed)
		}
		fn enqueue(&self, sample: Sample) {
			self.enqueued.lock().unwrap().push(sample.timestamp);
			self.ready.store(false, Ordering::Relaxed);
		}
		fn flush(&self) {
			*self.flushes.lock().unwrap() += 1;
		}
	}

	impl AudioRenderer for RecordingLayer {
		fn is_ready_for_more(&self) -> bool {
			self.ready.load(Ordering::Relaxed)
		}
		fn enqueue(&self, sample: Sample) {
			self.enqueued.lock().unwrap().push(sample.timestamp);
			self.ready.store(false, Ordering::Relaxed);
		}
		fn flush(&self) {
			*self.flushes.lock().unwrap() += 1;
		}
	}

	fn sample(secs: f64, keyframe: bool) -> Sample {
		Sample { timestamp: RationalTime::from_secs_f64(secs), keyframe, payload: Bytes::new() }
	}

	#[test]
	fn cut_index_finds_last_keyframe_at_or_before_clock() {
		let samples = vec![sample(0.0, true), sample(1.0, false), sample(2.0, true), sample(3.0, false)];
		assert_eq!(cut_index(&samples, RationalTime::from_secs_f64(2.5)), 2);
		assert_eq!(cut_index(&samples, RationalTime::from_secs_f64(0.5)), 0);
	}

	#[test]
	fn schedule_truncates_to_keyframe_at_clock() {
		let video_layer = Arc::new(RecordingLayer::new(true));
		let audio_renderer = Arc::new(RecordingLayer::new(true));
		let renderer = BuffersRenderer::new(video_layer.clone(), audio_renderer.clone());

		// Resume at clock = 2.0, as after a seek or quality switch, so the
		// fragment's earlier samples are stale relative to playback.
		renderer.seek(RationalTime::from_secs_f64(2.0));

		let fragment = DecodedFragment {
			video: vec![sample(0.0, true), sample(1.0, false), sample(2.0, true)],
			audio: vec![sample(0.0, true), sample(1.0, true)],
			duration: RationalTime::from_secs_f64(2.0),
		};
		renderer.schedule(fragment);

		renderer.play();
		renderer.display_link_trigger();

		// Only the keyframe at the clock (index 2) survives the video cut;
		// audio has no sample exactly at 2.0, so the last keyframe at or
		// before it (index 1) survives instead.
		assert_eq!(video_layer.enqueued.lock().unwrap().as_slice(), [RationalTime::from_secs_f64(2.0)]);
		assert_eq!(audio_renderer.enqueued.lock().unwrap().as_slice(), [RationalTime::from_secs_f64(1.0)]);
	}

	#[test]
	fn synchronizer_seek_stops_clock_at_target() {
		let sync = Synchronizer::new();
		sync.set_rate(1.0);
		sync.seek(RationalTime::from_secs_f64(42.0));
		assert_eq!(sync.current_time(), RationalTime::from_secs_f64(42.0));
		assert_eq!(sync.rate(), 0.0);
	}

	#[test]
	fn play_pause_toggle_running_and_rate() {
		let video_layer = Arc::new(RecordingLayer::new(true));
		let audio_renderer = Arc::new(RecordingLayer::new(true));
		let renderer = BuffersRenderer::new(video_layer, audio_renderer);

		renderer.set_base_rate(1.0);
		renderer.play();
		assert!(renderer.is_running());
		renderer.pause();
		assert!(!renderer.is_running());
	}
}
