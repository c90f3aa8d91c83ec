//! Adaptive bitrate quality selection (C5).
//!
//! Tracks a single exponentially-weighted throughput estimate and a memory
//! of which variant each fragment index was last loaded at, so a seek back
//! into already-downloaded territory doesn't needlessly re-fetch a lower
//! quality than what's already on screen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::playlist::Variant;
use crate::time::RationalTime;

/// How long the loader is allowed to stay ahead of playback before the
/// controller tells the caller to stop pulling fragments.
pub const BUFFERING_DURATION: RationalTime = RationalTime::from_ticks(30 * crate::time::TIMESCALE);
/// Below this much buffer, the controller favors any variant it can afford
/// even at a steep ratio penalty ("urgent": about to stall).
pub const URGENT_DURATION: RationalTime = RationalTime::from_ticks(5 * crate::time::TIMESCALE);
/// Above this much buffer, the controller can afford to be picky.
pub const NOT_URGENT_DURATION: RationalTime = RationalTime::from_ticks(15 * crate::time::TIMESCALE);

/// Safety margin applied to the throughput estimate in the common case.
pub const BITRATE_RATIO: f64 = 1.3;
/// Safety margin when buffer is critically low: take almost anything affordable.
pub const URGENT_RATIO: f64 = 2.0;
/// Safety margin when buffer is comfortably full: be conservative.
pub const NOT_URGENT_RATIO: f64 = 1.1;
/// EWMA smoothing factor when the instantaneous rate exceeds the estimate.
pub const UPGRADE_SPEED: f64 = 0.1;
/// EWMA smoothing factor when the instantaneous rate is below the estimate.
pub const DOWNGRADE_SPEED: f64 = 0.3;

const DEFAULT_ESTIMATE_BPS: f64 = 1_000_000.0;

/// Process-wide seed for a new controller's estimate, so a new session
/// started right after another doesn't re-learn the network from scratch.
static LAST_BITRATE_ESTIMATE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
struct LoadedVariant {
	height: u32,
	bandwidth: u64,
}

/// Per-session adaptive bitrate controller.
pub struct AbrController {
	estimate_bps: f64,
	loaded: HashMap<u64, LoadedVariant>,
}

impl AbrController {
	pub fn new() -> Self {
		let seed = f64::from_bits(LAST_BITRATE_ESTIMATE.load(Ordering::Relaxed));
		let estimate_bps = if seed > 0.0 { seed } else { DEFAULT_ESTIMATE_BPS };
		Self { estimate_bps, loaded: HashMap::new() }
	}

	/// The current smoothed throughput estimate, in bits per second.
	pub fn estimate_bps(&self) -> f64 {
		self.estimate_bps
	}

	/// Select the variant to fetch for `fragment_index`, or `None` if the
	/// loader is far enough ahead of playback that it should pause pulling.
	pub fn choose(
		&self,
		variants: &[Variant],
		fragment_index: u64,
		player_time: RationalTime,
		loading_progress: RationalTime,
		playback_rate: f64,
		pinned_height: Option<u32>,
	) -> Option<Variant> {
		if let Some(height) = pinned_height {
			if let Some(variant) = variants.iter().find(|v| v.height == height) {
				return Some(variant.clone());
			}
		}

		let buffer_left = loading_progress.saturating_sub(player_time);
		if buffer_left >= BUFFERING_DURATION {
			return None;
		}

		let urgent = buffer_left < URGENT_DURATION;
		let ratio = if urgent {
			URGENT_RATIO
		} else if buffer_left > NOT_URGENT_DURATION {
			NOT_URGENT_RATIO
		} else {
			BITRATE_RATIO
		};

		let mut chosen = scan(variants, self.estimate_bps, ratio, playback_rate);

		if let Some(loaded) = self.loaded.get(&fragment_index) {
			let chosen_height = chosen.as_ref().map(|v| v.height).unwrap_or(0);
			if urgent || loaded.height > chosen_height {
				if let Some(variant) = variants
					.iter()
					.find(|v| v.height == loaded.height && v.bandwidth == loaded.bandwidth)
				{
					chosen = Some(variant.clone());
				}
			}
		}

		chosen
	}

	/// Record a fragment's decode-ready variant, updating the throughput
	/// estimate from a non-cached load's observed rate.
	///
	/// The never-downgrade-memory rule means a seek back over a fragment
	/// that was once loaded at 1080p won't later report it as 480p just
	/// because the controller re-selected a lower quality for a fresh
	/// neighbor fragment.
	pub fn loaded(&mut self, variant: &Variant, fragment_index: u64, fragment_bytes: u64, load_seconds: f64, is_cached: bool) {
		let entry = self.loaded.entry(fragment_index).or_insert(LoadedVariant { height: 0, bandwidth: 0 });
		if variant.height >= entry.height {
			*entry = LoadedVariant { height: variant.height, bandwidth: variant.bandwidth };
		}

		if is_cached {
			return;
		}

		// Guard against a near-zero elapsed time producing an unbounded
		// instantaneous rate (e.g. a fragment served entirely from an OS
		// page cache); such a sample carries no useful signal.
		if load_seconds < 0.001 {
			return;
		}

		let instantaneous = (fragment_bytes as f64 * 8.0) / load_seconds;
		let alpha = if instantaneous > self.estimate_bps { UPGRADE_SPEED } else { DOWNGRADE_SPEED };
		self.estimate_bps = alpha * instantaneous + (1.0 - alpha) * self.estimate_bps;
	}

	/// The height the controller would pick with no pinned quality and no
	/// already-downloaded override; purely informational (e.g. for a UI
	/// "auto" indicator).
	pub fn auto_quality(
		&self,
		variants: &[Variant],
		player_time: RationalTime,
		loading_progress: RationalTime,
		playback_rate: f64,
	) -> Option<u32> {
		let buffer_left = loading_progress.saturating_sub(player_time);
		let ratio = if buffer_left < URGENT_DURATION {
			URGENT_RATIO
		} else if buffer_left > NOT_URGENT_DURATION {
			NOT_URGENT_RATIO
		} else {
			BITRATE_RATIO
		};

		scan(variants, self.estimate_bps, ratio, playback_rate).map(|v| v.height)
	}
}

impl Default for AbrController {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for AbrController {
	fn drop(&mut self) {
		LAST_BITRATE_ESTIMATE.store(self.estimate_bps.to_bits(), Ordering::Relaxed);
	}
}

/// Scan `variants` (descending bandwidth) for the first one the estimate
/// can sustain at `ratio`, falling back to the lowest-bandwidth variant.
fn scan(variants: &[Variant], estimate_bps: f64, ratio: f64, playback_rate: f64) -> Option<Variant> {
	let rate = playback_rate.max(f64::EPSILON);
	variants
		.iter()
		.find(|variant| estimate_bps / (variant.bandwidth as f64 * ratio * rate) > 1.0)
		.or_else(|| variants.last())
		.cloned()
}

#[cfg(test)]
mod tests {
	use super::*;
	use url::Url;

	fn variant(bandwidth: u64, height: u32) -> Variant {
		Variant {
			bandwidth,
			width: height * 16 / 9,
			height,
			media_playlist_url: Url::parse("http://127.0.0.1/a.m3u8").unwrap(),
		}
	}

	fn variants() -> Vec<Variant> {
		vec![variant(3_000_000, 1080), variant(1_500_000, 720), variant(400_000, 360)]
	}

	#[test]
	fn pauses_pulling_once_buffer_is_full() {
		let abr = AbrController { estimate_bps: 5_000_000.0, loaded: HashMap::new() };
		let chosen = abr.choose(
			&variants(),
			0,
			RationalTime::ZERO,
			RationalTime::from_secs_f64(30.0),
			1.0,
			None,
		);
		assert!(chosen.is_none());
	}

	#[test]
	fn picks_highest_affordable_variant() {
		let abr = AbrController { estimate_bps: 5_000_000.0, loaded: HashMap::new() };
		let chosen = abr
			.choose(&variants(), 0, RationalTime::ZERO, RationalTime::from_secs_f64(10.0), 1.0, None)
			.unwrap();
		assert_eq!(chosen.height, 1080);
	}

	#[test]
	fn falls_back_to_lowest_when_nothing_qualifies() {
		let abr = AbrController { estimate_bps: 10_000.0, loaded: HashMap::new() };
		let chosen = abr
			.choose(&variants(), 0, RationalTime::ZERO, RationalTime::from_secs_f64(10.0), 1.0, None)
			.unwrap();
		assert_eq!(chosen.height, 360);
	}

	#[test]
	fn pinned_quality_overrides_estimate() {
		let abr = AbrController { estimate_bps: 10_000.0, loaded: HashMap::new() };
		let chosen = abr
			.choose(&variants(), 0, RationalTime::ZERO, RationalTime::from_secs_f64(10.0), 1.0, Some(1080))
			.unwrap();
		assert_eq!(chosen.height, 1080);
	}

	#[test]
	fn never_downgrades_loaded_memory() {
		let mut abr = AbrController { estimate_bps: 5_000_000.0, loaded: HashMap::new() };
		abr.loaded(&variant(3_000_000, 1080), 5, 1_000_000, 1.0, false);
		abr.loaded(&variant(400_000, 360), 5, 50_000, 1.0, false);
		assert_eq!(abr.loaded.get(&5).unwrap().height, 1080);
	}

	#[test]
	fn already_loaded_override_wins_when_urgent() {
		let mut abr = AbrController { estimate_bps: 10_000.0, loaded: HashMap::new() };
		abr.loaded(&variant(1_500_000, 720), 3, 1_000_000, 1.0, false);
		let chosen = abr
			.choose(&variants(), 3, RationalTime::ZERO, RationalTime::from_secs_f64(1.0), 1.0, None)
			.unwrap();
		assert_eq!(chosen.height, 720);
	}

	#[test]
	fn estimate_update_uses_asymmetric_smoothing() {
		let mut abr = AbrController { estimate_bps: 1_000_000.0, loaded: HashMap::new() };
		abr.loaded(&variant(1_500_000, 720), 0, 250_000, 1.0, false); // 2 Mbps instantaneous, upgrade
		assert!((abr.estimate_bps - (0.1 * 2_000_000.0 + 0.9 * 1_000_000.0)).abs() < 1.0);
	}

	#[test]
	fn cached_loads_skip_estimate_update() {
		let mut abr = AbrController { estimate_bps: 1_000_000.0, loaded: HashMap::new() };
		abr.loaded(&variant(1_500_000, 720), 0, 250_000, 1.0, true);
		assert_eq!(abr.estimate_bps, 1_000_000.0);
	}
}
