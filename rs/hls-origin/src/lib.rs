//! The local HLS origin (C9): an HTTP/1.1 server on loopback that serves a
//! synthesized master playlist, rewritten media playlists, and byte-range
//! segment responses for sessions registered with it.
//!
//! The rest of the workspace only ever consumes this component as an
//! external contract reached by URL; this crate makes that contract
//! concrete so the engine is runnable end-to-end without an embedding
//! application's real storage backend.

mod origin;
mod provider;

pub use origin::{router, OriginState, VariantSource};
pub use provider::{MemorySegmentProvider, SegmentProvider};
