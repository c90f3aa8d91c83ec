//! On-disk scratch cache for decoded-ready fragments.
//!
//! A fragment is cached once as `init ⧺ segment` under a path keyed by
//! master/variant/fragment identity, so the loader ([`crate::loader`]) can
//! hand the demuxer a local file URL instead of re-downloading on retry.

use std::path::PathBuf;

use tokio::fs;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Per-session on-disk scratch space for one master playlist's fragments.
///
/// The directory layout is `<root>/master<id>/quality<bandwidth>/frag<seq>.mp4`.
/// Atomicity is not required: a concurrent save of the same key overwrites
/// with content-identical bytes, so a racing writer is benign.
pub struct FragmentCache {
	root: PathBuf,
	master_dir: PathBuf,
	bytes_written: std::sync::atomic::AtomicU64,
	fragments_written: std::sync::atomic::AtomicU64,
}

/// Disk footprint counters, exposed for observability logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
	pub bytes_written: u64,
	pub fragments_written: u64,
}

impl FragmentCache {
	/// Wipe the `hls` parent directory of any stale sessions (process-start
	/// only; callers should invoke this once before constructing any
	/// session-scoped cache) and recreate it.
	pub async fn wipe_root(tmp_dir: &std::path::Path) -> Result<PathBuf> {
		let root = tmp_dir.join("hls");
		if root.exists() {
			fs::remove_dir_all(&root).await?;
		}
		fs::create_dir_all(&root).await?;
		Ok(root)
	}

	/// Create the per-master scratch directory, wiping any prior contents
	/// for this master id first.
	pub async fn new(root: PathBuf, master_id: u64) -> Result<Self> {
		let master_dir = root.join(format!("master{master_id}"));
		if master_dir.exists() {
			fs::remove_dir_all(&master_dir).await?;
		}
		fs::create_dir_all(&master_dir).await?;

		Ok(Self {
			root,
			master_dir,
			bytes_written: std::sync::atomic::AtomicU64::new(0),
			fragments_written: std::sync::atomic::AtomicU64::new(0),
		})
	}

	fn fragment_path(&self, bandwidth: u64, fragment_sequence: u64) -> PathBuf {
		self.master_dir
			.join(format!("quality{bandwidth}"))
			.join(format!("frag{fragment_sequence}.mp4"))
	}

	/// Return the cached fragment's URL if present on disk.
	pub async fn get(&self, bandwidth: u64, fragment_sequence: u64) -> Result<Option<Url>> {
		let path = self.fragment_path(bandwidth, fragment_sequence);
		if !fs::try_exists(&path).await? {
			return Ok(None);
		}
		Ok(Some(path_to_url(&path)?))
	}

	/// Persist `data` at the fragment's cache path and return its URL.
	pub async fn save(&self, bandwidth: u64, fragment_sequence: u64, data: &[u8]) -> Result<Url> {
		let path = self.fragment_path(bandwidth, fragment_sequence);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await?;
		}
		fs::write(&path, data).await?;

		self.bytes_written
			.fetch_add(data.len() as u64, std::sync::atomic::Ordering::Relaxed);
		self.fragments_written
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		debug!(bandwidth, fragment_sequence, bytes = data.len(), "cached fragment");

		path_to_url(&path)
	}

	pub fn stats(&self) -> CacheStats {
		CacheStats {
			bytes_written: self.bytes_written.load(std::sync::atomic::Ordering::Relaxed),
			fragments_written: self.fragments_written.load(std::sync::atomic::Ordering::Relaxed),
		}
	}

	/// Delete this session's master directory. Called on session finish;
	/// the parent `hls` root is left for the next session to reuse. Takes
	/// `&self` rather than consuming it since the cache is shared (via
	/// `Arc`) between the session and each variant's loader.
	pub async fn finish(&self) -> Result<()> {
		if self.master_dir.exists() {
			fs::remove_dir_all(&self.master_dir).await?;
		}
		debug!(master_dir = %self.master_dir.display(), "evicted session cache");
		Ok(())
	}

	pub fn root(&self) -> &std::path::Path {
		&self.root
	}
}

fn path_to_url(path: &std::path::Path) -> Result<Url> {
	Url::from_file_path(path).map_err(|_| Error::LocalFilesAccess(format!("not an absolute path: {}", path.display())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn save_then_get_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let root = FragmentCache::wipe_root(dir.path()).await.unwrap();
		let cache = FragmentCache::new(root, 42).await.unwrap();

		assert!(cache.get(1_500_000, 0).await.unwrap().is_none());

		let url = cache.save(1_500_000, 0, b"fake-fragment-bytes").await.unwrap();
		let fetched = cache.get(1_500_000, 0).await.unwrap().unwrap();
		assert_eq!(url, fetched);

		let stats = cache.stats();
		assert_eq!(stats.fragments_written, 1);
		assert_eq!(stats.bytes_written, "fake-fragment-bytes".len() as u64);
	}

	#[tokio::test]
	async fn new_wipes_stale_master_directory() {
		let dir = tempfile::tempdir().unwrap();
		let root = FragmentCache::wipe_root(dir.path()).await.unwrap();
		let cache = FragmentCache::new(root.clone(), 7).await.unwrap();
		cache.save(100, 0, b"stale").await.unwrap();
		drop(cache);

		let cache = FragmentCache::new(root, 7).await.unwrap();
		assert!(cache.get(100, 0).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn finish_removes_master_directory() {
		let dir = tempfile::tempdir().unwrap();
		let root = FragmentCache::wipe_root(dir.path()).await.unwrap();
		let cache = FragmentCache::new(root, 9).await.unwrap();
		cache.save(100, 0, b"data").await.unwrap();
		cache.finish().await.unwrap();
		assert!(!cache.master_dir.exists());
	}
}
