//! Core of an adaptive-bitrate HLS playback engine.
//!
//! Ingests an HLS master playlist, maintains several media-variant
//! playlists at differing bitrates, downloads byte-range fragments, demuxes
//! them into elementary audio/video sample sequences, feeds those samples
//! into a synchronized audio/video renderer, and continuously selects the
//! variant best matching estimated network throughput and current buffer
//! occupancy.
//!
//! The crate is organized around the same component split the design is
//! specified in:
//!
//! - [`playlist`] — master/media M3U8 parsing (C1)
//! - [`cache`] — on-disk scratch for decoded-ready fragments (C2)
//! - [`loader`] — byte-range fetch + cache + demux hand-off (C3)
//! - [`demux`] — the demux/decode adapter contract, plus a reference
//!   `mp4-atom`-based implementation (C4)
//! - [`abr`] — throughput estimation and variant selection (C5)
//! - [`session`] — the fragment-loading driver loop, seek, and quality
//!   changes (C6)
//! - [`renderer`] — the dual video/audio ring-buffered scheduler (C7)
//! - [`facade`] — the public play/pause/seek/quality API (C8)
//!
//! [`time`] and [`fetch`] and [`error`] are the shared primitives those
//! components are built from: a rational presentation clock, the
//! byte-range fetcher trait modeling the outer network stack, and the
//! crate-wide error type.

pub mod abr;
pub mod cache;
pub mod demux;
pub mod error;
pub mod facade;
pub mod fetch;
pub mod loader;
pub mod playlist;
pub mod renderer;
pub mod session;
pub mod time;

pub use error::{Error, Result};
