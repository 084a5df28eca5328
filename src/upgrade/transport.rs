use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_RELEASES_API_URL: &str = "https://api.github.com/repos/XTLS/Xray-core/releases";
pub const DEFAULT_DOWNLOAD_BASE_URL: &str = "https://github.com/XTLS/Xray-core/releases/download";

// Partial deserialization of the release listing.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub tag_name: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with {status}")]
    Status { url: String, status: StatusCode },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Unavailable(String),
}

/// Where published releases come from.
pub trait ReleaseTransport: Send + Sync {
    fn list_releases(&self) -> impl Future<Output = Result<Vec<Release>, TransportError>> + Send;

    fn fetch_archive(
        &self,
        version: &str,
        file_name: &str,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpReleaseTransport {
    client: Client,
    releases_api_url: String,
    download_base_url: String,
}

impl HttpReleaseTransport {
    pub fn new(
        releases_api_url: impl Into<String>,
        download_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("hostpulse/", env!("CARGO_PKG_VERSION"))),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self {
            client,
            releases_api_url: releases_api_url.into(),
            download_base_url: download_base_url.into(),
        })
    }

    pub fn archive_url(&self, version: &str, file_name: &str) -> String {
        format!(
            "{}/{version}/{file_name}",
            self.download_base_url.trim_end_matches('/')
        )
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| request_error(url, source))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(response)
    }
}

impl ReleaseTransport for HttpReleaseTransport {
    async fn list_releases(&self) -> Result<Vec<Release>, TransportError> {
        let url = self.releases_api_url.as_str();
        self.get(url)
            .await?
            .json::<Vec<Release>>()
            .await
            .map_err(|source| request_error(url, source))
    }

    async fn fetch_archive(&self, version: &str, file_name: &str) -> Result<Vec<u8>, TransportError> {
        let url = self.archive_url(version, file_name);
        let body = self
            .get(&url)
            .await?
            .bytes()
            .await
            .map_err(|source| request_error(&url, source))?;
        Ok(body.to_vec())
    }
}

fn request_error(url: &str, source: reqwest::Error) -> TransportError {
    TransportError::Request {
        url: url.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_url_joins_version_and_file() {
        let transport = HttpReleaseTransport::new(
            DEFAULT_RELEASES_API_URL,
            "https://example.invalid/releases/download/",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            transport.archive_url("v1.8.4", "Xray-linux-64.zip"),
            "https://example.invalid/releases/download/v1.8.4/Xray-linux-64.zip"
        );
    }

    #[test]
    fn release_listing_ignores_extra_fields() {
        let body = r#"[
            {"tag_name": "v1.8.4", "name": "Xray-core v1.8.4", "prerelease": false},
            {"tag_name": "v1.8.3", "assets": []}
        ]"#;
        let releases: Vec<Release> = serde_json::from_str(body).unwrap();
        let tags: Vec<_> = releases.into_iter().map(|r| r.tag_name).collect();
        assert_eq!(tags, vec!["v1.8.4", "v1.8.3"]);
    }
}
