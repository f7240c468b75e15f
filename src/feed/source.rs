use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use super::parser::{parse_feed, FetchedFeed};
use crate::util::{validate_feed_url, FeedUrlError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const USER_AGENT: &str = concat!("feedmailer/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while fetching and parsing a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The feed location is not a usable http(s) URL
    #[error("Invalid feed location: {0}")]
    InvalidUrl(#[from] FeedUrlError),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Document could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Turns a feed location into parsed entries.
///
/// One call is one attempt; retrying is left to whoever runs the next
/// refresh.
pub trait FeedSource {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<FetchedFeed, FetchError>> + Send;
}

/// [`FeedSource`] over HTTP(S) using `reqwest`.
#[derive(Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
}

impl HttpFeedSource {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let url = validate_feed_url(url)?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.get(url.clone()).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, MAX_FEED_SIZE).await?;
        let parsed = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        if parsed.skipped > 0 {
            tracing::warn!(
                feed = %url,
                skipped = parsed.skipped,
                "Entries without a link skipped"
            );
        }
        tracing::debug!(feed = %url, entries = parsed.articles.len(), "Feed fetched");

        Ok(parsed)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
