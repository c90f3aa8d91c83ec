//! The byte-range-served resources a registered session exposes.
//!
//! [`SegmentProvider`] is the origin's half of the engine's `ByteRangeFetcher`
//! contract (`hls_core::fetch::ByteRangeFetcher`): given a file id, hand back
//! a slice of its bytes. [`MemorySegmentProvider`] is a reference
//! implementation good enough to serve a demo session or drive the
//! in-process integration tests; a real embedder would back this with its
//! own authenticated storage.

use std::collections::HashMap;

use bytes::Bytes;

/// Serves byte ranges of named resources (segment files) for one session.
pub trait SegmentProvider: Send + Sync {
	/// The total length of `file_id`, or `None` if it doesn't exist.
	fn len(&self, file_id: &str) -> Option<u64>;

	/// The bytes in `[start, end]` (inclusive) of `file_id`, clamped to the
	/// resource's actual length. `None` if the resource doesn't exist.
	fn fetch_range(&self, file_id: &str, start: u64, end_inclusive: u64) -> Option<Bytes>;
}

/// An in-memory [`SegmentProvider`], keyed by file id.
#[derive(Default)]
pub struct MemorySegmentProvider {
	files: HashMap<String, Bytes>,
}

impl MemorySegmentProvider {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, file_id: impl Into<String>, data: impl Into<Bytes>) {
		self.files.insert(file_id.into(), data.into());
	}
}

impl SegmentProvider for MemorySegmentProvider {
	fn len(&self, file_id: &str) -> Option<u64> {
		self.files.get(file_id).map(|data| data.len() as u64)
	}

	fn fetch_range(&self, file_id: &str, start: u64, end_inclusive: u64) -> Option<Bytes> {
		let data = self.files.get(file_id)?;
		let len = data.len() as u64;
		if start >= len {
			return None;
		}
		let end = (end_inclusive + 1).min(len);
		Some(data.slice(start as usize..end as usize))
	}
}
