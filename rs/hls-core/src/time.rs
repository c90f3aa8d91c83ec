//! A rational presentation-time clock.
//!
//! A rational time domain with a fine timescale (>= 10,000 ticks/s) so
//! that fragment boundaries line up exactly regardless of fractional
//! `#EXTINF` durations. This mirrors
//! `moq_lite::Timescale<const SCALE: u64>`: a fixed-point duration typed
//! by its tick rate, so two clocks at different scales can't be added
//! without an explicit (checked) conversion.

use crate::error::{Error, Result};

/// Ticks per second for every [`RationalTime`] value in this crate.
///
/// 90 kHz is the timescale MPEG/HLS tooling (and `mp4-atom` track
/// headers) typically report for video, and comfortably clears the
/// 10,000 ticks/s floor above.
pub const TIMESCALE: u64 = 90_000;

/// A presentation timestamp or duration, in units of `1 / TIMESCALE` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct RationalTime(u64);

impl RationalTime {
	pub const ZERO: Self = Self(0);

	pub const fn from_ticks(ticks: u64) -> Self {
		Self(ticks)
	}

	pub const fn ticks(self) -> u64 {
		self.0
	}

	/// Convert a fractional seconds value (e.g. an `#EXTINF` duration) to ticks.
	///
	/// Rounds to the nearest tick; sub-tick rounding error across an
	/// entire VOD playlist is bounded by `fragment_count / TIMESCALE`
	/// seconds, far below any observable drift.
	pub fn from_secs_f64(seconds: f64) -> Self {
		debug_assert!(seconds.is_finite() && seconds >= 0.0);
		Self((seconds * TIMESCALE as f64).round() as u64)
	}

	pub fn as_secs_f64(self) -> f64 {
		self.0 as f64 / TIMESCALE as f64
	}

	/// Convert from a value expressed at some other timescale (e.g. a
	/// track's `mvhd`/`mdhd` timescale from the init segment).
	pub fn from_scale(value: u64, scale: u64) -> Result<Self> {
		if scale == 0 {
			return Err(Error::TimeOverflow);
		}
		let scaled = (value as u128) * (TIMESCALE as u128) / (scale as u128);
		u64::try_from(scaled).map(Self).map_err(|_| Error::TimeOverflow)
	}

	pub fn checked_add(self, rhs: Self) -> Result<Self> {
		self.0.checked_add(rhs.0).map(Self).ok_or(Error::TimeOverflow)
	}

	pub fn checked_sub(self, rhs: Self) -> Result<Self> {
		self.0.checked_sub(rhs.0).map(Self).ok_or(Error::TimeOverflow)
	}

	/// Saturating subtraction, used where a negative margin should read as
	/// "zero buffer left" rather than an error (e.g. buffer occupancy
	/// computations in the ABR controller).
	pub fn saturating_sub(self, rhs: Self) -> Self {
		Self(self.0.saturating_sub(rhs.0))
	}
}

impl std::ops::Add for RationalTime {
	type Output = Self;
	fn add(self, rhs: Self) -> Self {
		self.checked_add(rhs).expect("rational time overflow")
	}
}

impl std::ops::Sub for RationalTime {
	type Output = Self;
	fn sub(self, rhs: Self) -> Self {
		self.checked_sub(rhs).expect("rational time underflow")
	}
}

impl std::fmt::Display for RationalTime {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:.3}s", self.as_secs_f64())
	}
}
