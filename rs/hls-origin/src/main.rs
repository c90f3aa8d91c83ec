//! Local HLS origin binary.
//!
//! Serves whatever is registered with an [`OriginState`] over HTTP. For
//! local development and the workspace's own end-to-end testing this loads
//! a single demo session off disk at startup; a real embedding application
//! would instead drive `hls_origin::OriginState` directly from its own
//! process without going through this binary at all.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hls_origin::{MemorySegmentProvider, OriginState, VariantSource};

/// Directory layout this binary expects when `--content` is given: one
/// subdirectory per variant, named `<width>x<height>_<bandwidth>` (e.g.
/// `1280x720_1500000`), each containing a `playlist.m3u8` (may reference
/// `partfile:<id>` tokens) and the segment files those tokens resolve to,
/// named `<id>.mp4`.
#[derive(Parser)]
struct Cli {
	#[command(flatten)]
	log: hls_native::Log,

	/// Address to listen on.
	#[arg(long, default_value = "127.0.0.1:4433")]
	bind: SocketAddr,

	/// A directory laid out as described above, registered as session id
	/// "demo". If omitted the origin starts with no sessions registered.
	#[arg(long)]
	content: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let state = OriginState::new();

	if let Some(content) = cli.content.as_ref() {
		let (variants, provider) = load_demo_session(content).context("failed to load --content directory")?;
		state.register("demo", variants, Arc::new(provider)).await;
		tracing::info!(dir = %content.display(), "registered demo session");
	}

	let listen = tokio::net::lookup_host(cli.bind)
		.await
		.context("invalid listen address")?
		.next()
		.context("invalid listen address")?;

	tracing::info!(%listen, "hls-origin listening");

	let app = hls_origin::router(state);
	axum_server::bind(listen).serve(app.into_make_service()).await?;

	Ok(())
}

fn load_demo_session(root: &Path) -> anyhow::Result<(Vec<VariantSource>, MemorySegmentProvider)> {
	let mut variants = Vec::new();
	let mut provider = MemorySegmentProvider::new();

	let mut entries: Vec<_> = std::fs::read_dir(root)
		.with_context(|| format!("reading {}", root.display()))?
		.collect::<Result<_, _>>()?;
	entries.sort_by_key(|entry| entry.file_name());

	for entry in entries {
		let path = entry.path();
		if !path.is_dir() {
			continue;
		}
		let name = entry.file_name();
		let name = name.to_string_lossy();
		let Some((resolution, bandwidth)) = name.split_once('_') else {
			continue;
		};
		let Some((width, height)) = resolution.split_once('x') else {
			continue;
		};
		let width: u32 = width.parse().with_context(|| format!("bad variant directory name {name}"))?;
		let height: u32 = height.parse().with_context(|| format!("bad variant directory name {name}"))?;
		let bandwidth: u64 = bandwidth.parse().with_context(|| format!("bad variant directory name {name}"))?;

		let playlist = std::fs::read_to_string(path.join("playlist.m3u8")).with_context(|| format!("reading playlist in {name}"))?;

		for segment in std::fs::read_dir(&path)? {
			let segment = segment?.path();
			if segment.extension().and_then(|ext| ext.to_str()) != Some("mp4") {
				continue;
			}
			let file_id = segment.file_stem().unwrap().to_string_lossy().into_owned();
			let data = std::fs::read(&segment).with_context(|| format!("reading segment {}", segment.display()))?;
			provider.insert(file_id, data);
		}

		variants.push(VariantSource { bandwidth, width, height, media_playlist: playlist });
	}

	Ok((variants, provider))
}
