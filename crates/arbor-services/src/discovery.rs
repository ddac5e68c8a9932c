//! Client for the HTTP peer directory.
//!
//! The directory lists peer names at `GET /peers/` and each peer's socket
//! addresses at `GET /peers/{name}/addresses`. Both bodies are plain text,
//! one entry per line.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Directory endpoint with a configured HTTP client.
#[derive(Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    base: String,
}

impl HttpDirectory {
    pub fn new(endpoint: &str, timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Names of all registered peers.
    pub async fn peers(&self) -> Result<Vec<String>> {
        let text = self.get_text(&format!("{}/peers/", self.base)).await?;
        Ok(parse_names(&text))
    }

    /// Socket addresses registered for `name`.
    pub async fn addresses(&self, name: &str) -> Result<Vec<SocketAddr>> {
        if name.is_empty() || name.contains('/') {
            bail!("invalid peer name {name:?}");
        }
        let text = self
            .get_text(&format!("{}/peers/{}/addresses", self.base, name))
            .await?;
        Ok(parse_addresses(&text))
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("{url} returned {status}");
        }
        resp.text()
            .await
            .with_context(|| format!("failed to read body from {url}"))
    }
}

/// One name per non-blank line.
pub fn parse_names(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// One socket address per non-blank line. Lines that do not parse are
/// skipped.
pub fn parse_addresses(text: &str) -> Vec<SocketAddr> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| match l.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!(line = l, error = %e, "skipping bad address");
                None
            }
        })
        .collect()
}
