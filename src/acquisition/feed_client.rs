//! Feed Client: authenticated HTTP GET of the location feed
//!
//! One request per call. Retry and backoff belong to the delivery worker.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{error, info};

/// Feed fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level failure: DNS, refused connection, timeout, broken body.
    #[error("Feed request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The feed answered with something other than 200.
    #[error("Feed {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
}

impl FetchError {
    /// HTTP status for `HttpStatus` failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Transport { .. } => None,
        }
    }
}

/// HTTP client for one location feed.
#[derive(Clone)]
pub struct FeedClient {
    http: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl FeedClient {
    /// Create a feed client whose requests are bounded by `timeout`.
    pub fn new(
        url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Fetch the raw feed document.
    ///
    /// Only status 200 is success. Credentials go out as HTTP basic auth on every request.
    pub async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: self.url.clone(),
            source,
        };

        let resp = self
            .http
            .get(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| {
                error!(url = %self.url, error = %e, "Feed request failed");
                transport(e)
            })?;

        let status = resp.status();
        if status != StatusCode::OK {
            error!(url = %self.url, status = status.as_u16(), "Error fetching KML feed");
            return Err(FetchError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(transport)?;
        info!(url = %self.url, size_bytes = body.len(), "KML feed fetched");
        Ok(body.to_vec())
    }

    /// Feed URL for logging
    pub fn url(&self) -> &str {
        &self.url
    }
}
