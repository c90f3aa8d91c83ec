use std::time::Duration;

/// Build the default HTTP client used to talk to a byte-range origin.
///
/// The `User-Agent` lets origins tell these fetches apart from browser
/// traffic in their logs. The 30s timeout is not derived from anything
/// upstream; it's just long enough to tolerate a slow origin without
/// letting a single request hang the fetch loop indefinitely.
pub fn default_http_client() -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent(concat!("hls-core/", env!("CARGO_PKG_VERSION")))
		.timeout(Duration::from_secs(30))
		.build()
		.map_err(anyhow::Error::from)
}
