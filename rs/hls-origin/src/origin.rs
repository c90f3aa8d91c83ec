//! The local fragment-segment HTTP origin (C9).
//!
//! The playback engine consumes fragments by URL; this binary is the thing
//! that hands it those URLs. It holds no relationship to `hls-core` beyond
//! the wire contract: a session is "registered" here with its variant
//! ladder and a [`SegmentProvider`], and the three routes below are exactly
//! what a conformant origin for this engine must serve.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, instrument};

use crate::provider::SegmentProvider;

const PLAYLIST_MIME: &str = "application/vnd.apple.mpegurl";
const SEGMENT_MIME: &str = "video/mp4";

/// One variant's bandwidth/resolution and stored media-playlist text, as
/// registered by the embedding application that drives this origin.
#[derive(Clone)]
pub struct VariantSource {
	pub bandwidth: u64,
	pub width: u32,
	pub height: u32,
	pub media_playlist: String,
}

struct Session {
	variants: Vec<VariantSource>,
	provider: Arc<dyn SegmentProvider>,
}

/// Shared registry of active sessions, cloned into every request handler.
///
/// No long-lived state survives a process restart: registrations live
/// only in this process's memory, and nothing here is persisted to disk.
#[derive(Clone, Default)]
pub struct OriginState {
	sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl OriginState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register (or replace) a session's variant ladder and segment provider.
	pub async fn register(&self, session_id: impl Into<String>, variants: Vec<VariantSource>, provider: Arc<dyn SegmentProvider>) {
		self.sessions
			.write()
			.await
			.insert(session_id.into(), Arc::new(Session { variants, provider }));
	}

	/// Drop a session's registration.
	pub async fn unregister(&self, session_id: &str) {
		self.sessions.write().await.remove(session_id);
	}
}

pub fn router(state: OriginState) -> Router {
	Router::new()
		.route("/{session_id}/master.m3u8", get(get_master))
		.route("/{session_id}/{resource}", get(get_resource))
		.layer(CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]))
		.with_state(state)
}

#[instrument(skip(state))]
async fn get_master(State(state): State<OriginState>, Path(session_id): Path<String>) -> Response {
	let sessions = state.sessions.read().await;
	let Some(session) = sessions.get(&session_id) else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let body = synthesize_master(&session.variants);
	([(header::CONTENT_TYPE, PLAYLIST_MIME)], body).into_response()
}

/// Dispatches the catch-all `/{session_id}/{resource}` route between media
/// playlists (`hls_level_<height>.m3u8`) and segment files (`partfile<id>.mp4`),
/// since axum's router can't mix a literal affix with a captured parameter
/// within one path segment.
#[instrument(skip(state, headers))]
async fn get_resource(
	State(state): State<OriginState>,
	Path((session_id, resource)): Path<(String, String)>,
	headers: HeaderMap,
) -> Response {
	let sessions = state.sessions.read().await;
	let Some(session) = sessions.get(&session_id) else {
		return StatusCode::NOT_FOUND.into_response();
	};

	if let Some(height) = parse_level_name(&resource) {
		return media_playlist_response(session, height);
	}

	if let Some(file_id) = parse_segment_name(&resource) {
		return segment_response(session, file_id, &headers);
	}

	StatusCode::NOT_FOUND.into_response()
}

fn parse_level_name(resource: &str) -> Option<u32> {
	resource.strip_prefix("hls_level_")?.strip_suffix(".m3u8")?.parse().ok()
}

fn parse_segment_name(resource: &str) -> Option<&str> {
	resource.strip_prefix("partfile")?.strip_suffix(".mp4")
}

fn media_playlist_response(session: &Session, height: u32) -> Response {
	let Some(variant) = session.variants.iter().find(|v| v.height == height) else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let body = rewrite_partfile_tokens(&variant.media_playlist);
	([(header::CONTENT_TYPE, PLAYLIST_MIME)], body).into_response()
}

fn segment_response(session: &Session, file_id: &str, headers: &HeaderMap) -> Response {
	let Some(total) = session.provider.len(file_id) else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let requested_range = headers
		.get(header::RANGE)
		.and_then(|value| value.to_str().ok())
		.and_then(parse_range_header);

	let (start, end, partial) = match requested_range {
		Some((start, end)) => {
			let end = end.unwrap_or_else(|| total.saturating_sub(1));
			if total == 0 || start >= total || end < start {
				let headers = [(header::CONTENT_RANGE, format!("bytes */{total}"))];
				return (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response();
			}
			(start, end.min(total - 1), true)
		}
		None => (0, total.saturating_sub(1), false),
	};

	let Some(data) = session.provider.fetch_range(file_id, start, end) else {
		return StatusCode::NOT_FOUND.into_response();
	};

	debug!(file_id, start, end, total, "served segment range");

	let status = if partial { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
	let response_headers = [
		(header::CONTENT_TYPE, SEGMENT_MIME.to_string()),
		(header::ACCEPT_RANGES, "bytes".to_string()),
		(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
	];

	(status, response_headers, data).into_response()
}

/// Parse an HTTP `Range: bytes=start-end` header (the only form this
/// engine's loader ever sends: a fully-specified start and end).
fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
	let spec = value.strip_prefix("bytes=")?;
	let (start, end) = spec.split_once('-')?;
	let start: u64 = start.trim().parse().ok()?;
	let end = end.trim();
	if end.is_empty() {
		Some((start, None))
	} else {
		Some((start, Some(end.parse().ok()?)))
	}
}

/// Synthesize `#EXTM3U` + one `#EXT-X-STREAM-INF` per variant.
fn synthesize_master(variants: &[VariantSource]) -> String {
	let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
	for variant in variants {
		out.push_str(&format!(
			"#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n",
			variant.bandwidth, variant.width, variant.height
		));
		out.push_str(&format!("hls_level_{}.m3u8\n", variant.height));
	}
	out
}

/// Rewrite every `partfile:<id>` placeholder token in a registered media
/// playlist to the concrete `partfile<id>.mp4` segment path this origin
/// actually serves.
fn rewrite_partfile_tokens(text: &str) -> String {
	const TOKEN: &str = "partfile:";
	let mut out = String::with_capacity(text.len());
	let mut rest = text;
	while let Some(pos) = rest.find(TOKEN) {
		out.push_str(&rest[..pos]);
		let after = &rest[pos + TOKEN.len()..];
		let id_len = after.find(|c: char| !c.is_ascii_alphanumeric()).unwrap_or(after.len());
		let (id, tail) = after.split_at(id_len);
		out.push_str("partfile");
		out.push_str(id);
		out.push_str(".mp4");
		rest = tail;
	}
	out.push_str(rest);
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::provider::MemorySegmentProvider;
	use http_body_util::BodyExt;
	use tower::ServiceExt;

	fn variant(bandwidth: u64, width: u32, height: u32, playlist: &str) -> VariantSource {
		VariantSource { bandwidth, width, height, media_playlist: playlist.to_string() }
	}

	async fn registered_state() -> OriginState {
		let state = OriginState::new();
		let mut provider = MemorySegmentProvider::new();
		provider.insert("42", vec![7u8; 1000]);

		let playlist = "#EXTM3U\n#EXT-X-MAP:URI=\"partfile:42\"\n#EXTINF:6.0,\npartfile:42\n";
		state
			.register(
				"abc",
				vec![variant(1_500_000, 1280, 720, playlist), variant(400_000, 640, 360, playlist)],
				Arc::new(provider),
			)
			.await;
		state
	}

	#[tokio::test]
	async fn serves_synthesized_master_playlist() {
		let app = router(registered_state().await);
		let request = axum::http::Request::builder().uri("/abc/master.m3u8").body(axum::body::Body::empty()).unwrap();
		let response = app.oneshot(request).await.unwrap();

		assert_eq!(response.status(), StatusCode::OK);
		let body = response.into_body().collect().await.unwrap().to_bytes();
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert!(text.starts_with("#EXTM3U\n"));
		assert!(text.contains("BANDWIDTH=1500000,RESOLUTION=1280x720"));
		assert!(text.contains("hls_level_720.m3u8"));
	}

	#[tokio::test]
	async fn rewrites_partfile_tokens_in_media_playlist() {
		let app = router(registered_state().await);
		let request = axum::http::Request::builder()
			.uri("/abc/hls_level_720.m3u8")
			.body(axum::body::Body::empty())
			.unwrap();
		let response = app.oneshot(request).await.unwrap();

		assert_eq!(response.status(), StatusCode::OK);
		let body = response.into_body().collect().await.unwrap().to_bytes();
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert!(text.contains("URI=\"partfile42.mp4\""));
		assert!(text.contains("\npartfile42.mp4\n"));
	}

	#[tokio::test]
	async fn unknown_variant_height_is_404() {
		let app = router(registered_state().await);
		let request = axum::http::Request::builder()
			.uri("/abc/hls_level_1080.m3u8")
			.body(axum::body::Body::empty())
			.unwrap();
		let response = app.oneshot(request).await.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn serves_partial_content_for_range_request() {
		let app = router(registered_state().await);
		let request = axum::http::Request::builder()
			.uri("/abc/partfile42.mp4")
			.header(header::RANGE, "bytes=10-19")
			.body(axum::body::Body::empty())
			.unwrap();
		let response = app.oneshot(request).await.unwrap();

		assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
		assert_eq!(
			response.headers().get(header::CONTENT_RANGE).unwrap(),
			"bytes 10-19/1000"
		);
		let body = response.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(body.len(), 10);
	}

	#[tokio::test]
	async fn unsatisfiable_range_is_416() {
		let app = router(registered_state().await);
		let request = axum::http::Request::builder()
			.uri("/abc/partfile42.mp4")
			.header(header::RANGE, "bytes=5000-6000")
			.body(axum::body::Body::empty())
			.unwrap();
		let response = app.oneshot(request).await.unwrap();
		assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
	}

	#[tokio::test]
	async fn unknown_session_is_404() {
		let app = router(registered_state().await);
		let request = axum::http::Request::builder().uri("/nope/master.m3u8").body(axum::body::Body::empty()).unwrap();
		let response = app.oneshot(request).await.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[test]
	fn rewrite_handles_multiple_tokens() {
		let text = "a partfile:1 b partfile:22 c";
		assert_eq!(rewrite_partfile_tokens(text), "a partfile1.mp4 b partfile22.mp4 c");
	}

	#[test]
	fn range_header_parses_open_ended_form() {
		assert_eq!(parse_range_header("bytes=10-"), Some((10, None)));
		assert_eq!(parse_range_header("bytes=10-19"), Some((10, Some(19))));
		assert_eq!(parse_range_header("not-a-range"), None);
	}
}
