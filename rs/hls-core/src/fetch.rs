//! The byte-range HTTP contract the fragment loader depends on.
//!
//! Modeled as a trait (not a concrete client) so the engine doesn't force
//! a particular HTTP stack on the embedding application, mirroring how
//! `hang::hls::HlsFetcher` decouples playlist ingest from transport.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use url::Url;

use crate::error::Result;
use crate::playlist::ByteRange;

/// Fetches whole resources and byte ranges over HTTP (or any transport
/// that can honor a `Range` header semantics).
pub trait ByteRangeFetcher: Send + Sync {
	/// Fetch an entire resource.
	fn fetch(&self, url: &Url) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>>;

	/// Fetch `range` of `url`, equivalent to an HTTP `Range: bytes=...` request.
	fn fetch_range(&self, url: &Url, range: ByteRange) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>>;
}

/// `reqwest`-backed [`ByteRangeFetcher`], suitable for the origin binary
/// and for running the engine end-to-end outside its embedding application.
#[cfg(feature = "reqwest-fetcher")]
pub struct ReqwestFetcher {
	client: reqwest::Client,
}

#[cfg(feature = "reqwest-fetcher")]
impl ReqwestFetcher {
	pub fn new(client: reqwest::Client) -> Self {
		Self { client }
	}
}

#[cfg(feature = "reqwest-fetcher")]
impl ByteRangeFetcher for ReqwestFetcher {
	fn fetch(&self, url: &Url) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
		let client = self.client.clone();
		let url = url.clone();

		Box::pin(async move {
			let response = client.get(url.clone()).send().await?;
			let response = response.error_for_status()?;
			Ok(response.bytes().await?)
		})
	}

	fn fetch_range(&self, url: &Url, range: ByteRange) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
		let client = self.client.clone();
		let url = url.clone();

		Box::pin(async move {
			let response = client
				.get(url.clone())
				.header(reqwest::header::RANGE, range.to_http_range())
				.send()
				.await?;
			let response = response.error_for_status()?;
			Ok(response.bytes().await?)
		})
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use std::collections::HashMap;
	use std::sync::Mutex;

	use super::*;

	/// An in-memory fetcher keyed by URL, for loader/session tests that
	/// shouldn't depend on a live HTTP server.
	#[derive(Default)]
	pub struct MemoryFetcher {
		resources: Mutex<HashMap<String, Bytes>>,
	}

	impl MemoryFetcher {
		pub fn insert(&self, url: &Url, data: impl Into<Bytes>) {
			self.resources.lock().unwrap().insert(url.to_string(), data.into());
		}
	}

	impl ByteRangeFetcher for MemoryFetcher {
		fn fetch(&self, url: &Url) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
			let data = self.resources.lock().unwrap().get(url.as_str()).cloned();
			Box::pin(async move { data.ok_or_else(|| crate::error::Error::Network(format!("no resource: {url}"))) })
		}

		fn fetch_range(
			&self,
			url: &Url,
			range: ByteRange,
		) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
			let data = self.resources.lock().unwrap().get(url.as_str()).cloned();
			Box::pin(async move {
				let data = data.ok_or_else(|| crate::error::Error::Network(format!("no resource: {url}")))?;
				let start = range.start as usize;
				let end = (range.end() as usize).min(data.len());
				Ok(data.slice(start.min(end)..end))
			})
		}
	}
}
