//! Read-only client for a hosted dotfile service
//!
//! Talks to the `GET /{owner}/{alias}` and `GET /{owner}/{alias}/commits`
//! routes of `dotfile-server`; output goes through the same formatters as the
//! local commands.

use crate::commands::{write_log, write_tracking};
use anyhow::{anyhow, bail, Context, Result};
use chrono::FixedOffset;
use dotfile_core::TrackingData;
use reqwest::{Response, Url};
use std::io::Write;
use std::time::Duration;

/// HTTP client for one hosted service
pub struct RemoteClient {
    base_url: Url,
    http: reqwest::Client,
}

impl RemoteClient {
    /// Create a client targeting `base_url` (e.g. `http://server:8080`)
    pub fn new(base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url)
            .with_context(|| format!("Invalid remote URL {:?}", base_url))?;
        if url.cannot_be_a_base() {
            bail!("Remote URL {:?} cannot hold a path", base_url);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { base_url: url, http })
    }

    /// Base URL with `segments` appended, each one percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("{} cannot be a base URL", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<Response> {
        tracing::debug!("GET {}", url);
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            // The service reports failures as {"error": "..."}
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or(body);
            return Err(anyhow!("GET {} failed ({}): {}", url.path(), status, message));
        }
        Ok(resp)
    }

    /// GET /{owner}/{alias}: raw content of the current revision
    pub async fn content(&self, owner: &str, alias: &str) -> Result<Vec<u8>> {
        let resp = self.get(self.url(&[owner, alias])?).await?;
        let body = resp.bytes().await.context("Failed to read file content")?;
        Ok(body.to_vec())
    }

    /// GET /{owner}/{alias}/commits
    pub async fn tracking_data(&self, owner: &str, alias: &str) -> Result<TrackingData> {
        let resp = self.get(self.url(&[owner, alias, "commits"])?).await?;
        resp.json().await.context("Failed to parse tracking data")
    }
}

/// `show --remote`: current content, or the tracking data with `data`
pub async fn show(
    client: &RemoteClient,
    owner: &str,
    alias: &str,
    data: bool,
    out: &mut dyn Write,
) -> Result<()> {
    if data {
        let tracking = client.tracking_data(owner, alias).await?;
        write_tracking(&tracking, out)
    } else {
        let content = client.content(owner, alias).await?;
        out.write_all(&content)?;
        Ok(())
    }
}

/// `log --remote`
pub async fn log(
    client: &RemoteClient,
    owner: &str,
    alias: &str,
    offset: &FixedOffset,
    out: &mut dyn Write,
) -> Result<()> {
    let tracking = client.tracking_data(owner, alias).await?;
    write_log(&tracking, offset, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotfile_core::{scoped, Backend, Fingerprint, SqliteBackend};
    use dotfile_server::{Config, Service};
    use std::sync::Arc;
    use tempfile::TempDir;

    const CONTENT: &str = "Testing content. Stored as a blob.";
    const UPDATED: &str = "Testing content. Stored as a blob.\n New content!\n";

    /// Serve a database holding genericusername/testalias with two commits
    async fn hosted(tmp: &TempDir) -> String {
        let database = tmp.path().join("dotfilehub.db");
        let backend = SqliteBackend::open(&database).unwrap();
        backend.register_owner("genericusername").unwrap();
        let handle = backend.track("genericusername", "testalias").unwrap();
        scoped(handle, |file| {
            file.initialize("~/dotfile/test-file.txt", CONTENT.as_bytes())?;
            file.commit(UPDATED.as_bytes(), "test commit")
        })
        .unwrap();

        let config = Config {
            database,
            ..Config::default()
        };
        let service = Arc::new(Service::with_backend(backend, config).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(dotfile_server::serve(listener, service));
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_remote_show() {
        let tmp = TempDir::new().unwrap();
        let client = RemoteClient::new(&hosted(&tmp).await).unwrap();

        let mut out = Vec::new();
        show(&client, "genericusername", "testalias", false, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), UPDATED);

        let mut out = Vec::new();
        show(&client, "genericusername", "testalias", true, &mut out).await.unwrap();
        let data: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(data["path"], "~/dotfile/test-file.txt");
        assert_eq!(data["revision"], Fingerprint::of(UPDATED.as_bytes()).to_hex());
        assert_eq!(data["commits"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_log_marks_current() {
        let tmp = TempDir::new().unwrap();
        let client = RemoteClient::new(&hosted(&tmp).await).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();

        let mut out = Vec::new();
        log(&client, "genericusername", "testalias", &utc, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(&format!("* {}", Fingerprint::of(UPDATED.as_bytes()))));
        assert!(lines[0].ends_with("test commit"));
        assert!(lines[1].starts_with("  "));
    }

    #[tokio::test]
    async fn test_remote_errors_carry_status() {
        let tmp = TempDir::new().unwrap();
        let client = RemoteClient::new(&hosted(&tmp).await).unwrap();

        let err = client.content("genericusername", "nottracked").await.unwrap_err();
        assert!(err.to_string().contains("404"), "{}", err);
        let err = client.tracking_data("nobody", "testalias").await.unwrap_err();
        assert!(err.to_string().contains("404"), "{}", err);
    }

    #[test]
    fn test_url_segments_are_encoded() {
        let client = RemoteClient::new("http://localhost:8080/").unwrap();
        let url = client.url(&["alice", "nvim init", "commits"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/alice/nvim%20init/commits");
        assert!(RemoteClient::new("not a url").is_err());
        assert!(RemoteClient::new("mailto:alice@example.com").is_err());
    }
}
