//! Fragment loader (C3): cache-check, byte-range fetch, demux hand-off.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::cache::FragmentCache;
use crate::demux::{DecodedFragment, Demuxer};
use crate::error::Result;
use crate::fetch::ByteRangeFetcher;
use crate::playlist::{Fragment, InitSegment, Variant};
use crate::time::RationalTime;

/// A softly-cancellable generation counter shared by a session and the
/// loaders it drives. Bumping it invalidates every in-flight load without
/// actually cancelling the underlying task: loaders re-check it after each
/// await point and silently drop stale results.
#[derive(Clone)]
pub struct BufferingEpoch(Arc<std::sync::Mutex<Uuid>>);

impl BufferingEpoch {
	pub fn new() -> Self {
		Self(Arc::new(std::sync::Mutex::new(Uuid::new_v4())))
	}

	pub fn current(&self) -> Uuid {
		*self.0.lock().unwrap()
	}

	/// Generate and install a new id, returning it.
	pub fn bump(&self) -> Uuid {
		let mut guard = self.0.lock().unwrap();
		*guard = Uuid::new_v4();
		*guard
	}
}

impl Default for BufferingEpoch {
	fn default() -> Self {
		Self::new()
	}
}

/// A fragment successfully decoded and ready for the renderer.
pub struct LoadedFragment {
	pub decoded: DecodedFragment,
	pub is_cached: bool,
	pub bytes: u64,
	pub load_seconds: f64,
}

/// Loads and decodes fragments for a single variant.
pub struct FragmentLoader {
	variant: Variant,
	init_segment: InitSegment,
	fetcher: Arc<dyn ByteRangeFetcher>,
	demuxer: Arc<dyn Demuxer>,
	cache: Arc<FragmentCache>,
	init_bytes: OnceCell<Bytes>,
}

impl FragmentLoader {
	pub fn new(
		variant: Variant,
		init_segment: InitSegment,
		fetcher: Arc<dyn ByteRangeFetcher>,
		demuxer: Arc<dyn Demuxer>,
		cache: Arc<FragmentCache>,
	) -> Self {
		Self {
			variant,
			init_segment,
			fetcher,
			demuxer,
			cache,
			init_bytes: OnceCell::new(),
		}
	}

	pub fn variant(&self) -> &Variant {
		&self.variant
	}

	/// Load `fragment`, aborting silently (returning `Ok(None)`) if
	/// `epoch` no longer matches `snapshot` after any suspension point.
	pub async fn load(
		&self,
		fragment: &Fragment,
		basetime: RationalTime,
		epoch: &BufferingEpoch,
		snapshot: Uuid,
	) -> Result<Option<LoadedFragment>> {
		macro_rules! still_current {
			() => {
				if epoch.current() != snapshot {
					return Ok(None);
				}
			};
		}

		if let Some(url) = self.cache.get(self.variant.bandwidth, fragment.sequence).await? {
			still_current!();
			let path = url
				.to_file_path()
				.map_err(|_| crate::error::Error::LocalFilesAccess(format!("not a file url: {url}")))?;
			let data = tokio::fs::read(&path).await?;
			still_current!();
			let decoded = self.demuxer.decode(Bytes::from(data.clone()), basetime, fragment).await?;
			still_current!();
			return Ok(Some(LoadedFragment {
				decoded,
				is_cached: true,
				bytes: data.len() as u64,
				load_seconds: 0.0,
			}));
		}

		let started = Instant::now();

		let init_bytes = self
			.init_bytes
			.get_or_try_init(|| async { self.fetcher.fetch_range(&self.init_segment.url, self.init_segment.byte_range).await })
			.await?;
		still_current!();

		let fragment_bytes = self.fetcher.fetch_range(&fragment.url, fragment.byte_range).await?;
		still_current!();

		let mut combined = BytesMut::with_capacity(init_bytes.len() + fragment_bytes.len());
		combined.extend_from_slice(init_bytes);
		combined.extend_from_slice(&fragment_bytes);
		let combined = combined.freeze();

		self.cache
			.save(self.variant.bandwidth, fragment.sequence, &combined)
			.await?;
		still_current!();

		let load_seconds = started.elapsed().as_secs_f64();
		let decoded = self.demuxer.decode(combined.clone(), basetime, fragment).await?;
		still_current!();

		Ok(Some(LoadedFragment {
			decoded,
			is_cached: false,
			bytes: combined.len() as u64,
			load_seconds,
		}))
	}
}
