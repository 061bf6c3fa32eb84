//! Feed source abstraction for the delivery worker.
//!
//! The worker only needs "give me the current feed document". Production uses
//! the HTTP [`FeedClient`]; tests substitute scripted sources.

use async_trait::async_trait;

use crate::acquisition::{FeedClient, FetchError};

/// Trait abstracting where feed documents come from.
///
/// One call is one request. Implementations must not retry internally;
/// the worker owns retry and backoff.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// Fetch the raw feed document.
    async fn fetch(&self) -> Result<Vec<u8>, FetchError>;

    /// Human-readable name for logging (e.g. the feed URL).
    fn source_name(&self) -> &str;
}

#[async_trait]
impl FeedSource for FeedClient {
    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        FeedClient::fetch(self).await
    }

    fn source_name(&self) -> &str {
        self.url()
    }
}
