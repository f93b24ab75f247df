use futures::stream::{self, StreamExt};
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::article::Article;
use super::parser::{parse_feed, ParseError};
use crate::config::Config;
use crate::util::{validate_feed_url, UrlValidationError};

/// Maximum redirect hops followed for one feed request.
const MAX_REDIRECTS: usize = 3;

/// Errors that can occur while fetching one feed.
///
/// Every variant except [`FetchError::InvalidUrl`] and [`FetchError::Parse`]
/// is a transport-side failure. None of them is fatal: callers log or
/// display the error and keep whatever articles they already had.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The feed address is malformed (or blocked by policy); no request was made.
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// Network-level error (DNS, connection, TLS, timeout, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Body was not a well-formed RSS/RDF document
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

impl FetchError {
    /// Whether the failure happened on the transport side rather than in the
    /// address or the document.
    pub fn is_network(&self) -> bool {
        !matches!(self, FetchError::InvalidUrl(_) | FetchError::Parse(_))
    }
}

/// Outcome of one fetch inside [`Fetcher::fetch_many`].
#[derive(Debug)]
pub struct FetchResult {
    pub feed_id: Uuid,
    /// The url that was actually requested.
    pub url: String,
    pub result: Result<Vec<Article>, FetchError>,
}

/// Create a custom redirect policy with loop detection and limited hops.
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// HTTP side of a feed fetch: one GET, then the body goes to the parser.
///
/// There is no retry and no response cache; every call goes to the network.
/// Cloning is cheap (the inner `reqwest::Client` is reference counted).
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_feed_bytes: usize,
    max_concurrent: usize,
    block_private_networks: bool,
}

impl Fetcher {
    /// Builds a fetcher with its own HTTP client configured from `config`.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .redirect(create_redirect_policy())
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30));
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        Ok(Self::with_client(builder.build()?, config))
    }

    /// Uses an existing client; limits and policy still come from `config`.
    pub fn with_client(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            max_feed_bytes: config.max_feed_bytes,
            max_concurrent: config.max_concurrent_fetches.max(1),
            block_private_networks: config.block_private_networks,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Fetches `url` and parses the body into articles.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] - before any I/O, for a malformed address
    /// - [`FetchError::Network`] - connection, DNS, TLS or timeout failure
    /// - [`FetchError::HttpStatus`] - non-2xx response
    /// - [`FetchError::ResponseTooLarge`] / [`FetchError::IncompleteResponse`] - body problems
    /// - [`FetchError::Parse`] - the body is not a well-formed feed
    pub async fn fetch(&self, url: &str) -> Result<Vec<Article>, FetchError> {
        let target = validate_feed_url(url, self.block_private_networks)?;

        let response = self.client.get(target).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, self.max_feed_bytes).await?;
        let articles = parse_feed(&bytes)?;

        tracing::debug!(url = %url, articles = articles.len(), bytes = bytes.len(), "Fetched feed");
        Ok(articles)
    }

    /// Fetches several feeds concurrently, at most `max_concurrent` at a time.
    ///
    /// Results are returned in completion order, not input order.
    pub async fn fetch_many(&self, targets: Vec<(Uuid, String)>) -> Vec<FetchResult> {
        stream::iter(targets)
            .map(|(feed_id, url)| async move {
                let result = self.fetch(&url).await;
                FetchResult {
                    feed_id,
                    url,
                    result,
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
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

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><title>Test</title><category>Tech</category></item>
    <item><title>Second</title></item>
</channel></rss>"#;

    fn fetcher() -> Fetcher {
        Fetcher::new(&Config::default()).unwrap()
    }

    async fn serve(body: &str) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&mock_server)
            .await;
        mock_server
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = serve(VALID_RSS).await;
        let articles = fetcher()
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(&*articles[0].title, "Test");
    }

    #[tokio::test]
    async fn test_fetch_empty_feed() {
        let server = serve(r#"<rss version="2.0"><channel></channel></rss>"#).await;
        let articles = fetcher()
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert!(articles.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)), "got {err:?}");
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(503)));
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let server = serve("<rss><channel><item><title>half").await;
        let err = fetcher()
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)), "got {err:?}");
        assert!(!err.is_network());
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_io() {
        let err = fetcher().fetch("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));

        let err = fetcher().fetch("ftp://example.com/feed").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_private_network_blocked_by_policy() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&mock_server)
            .await;

        let config = Config {
            block_private_networks: true,
            ..Config::default()
        };
        let fetcher = Fetcher::new(&config).unwrap();
        let err = fetcher
            .fetch(&format!("{}/feed", mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Bind then drop a listener to get a port with nothing behind it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = fetcher()
            .fetch(&format!("http://127.0.0.1:{port}/feed"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let server = serve(VALID_RSS).await;
        let config = Config {
            max_feed_bytes: 16,
            ..Config::default()
        };
        let err = Fetcher::new(&config)
            .unwrap()
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_fetch_many_returns_every_feed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&mock_server)
            .await;

        let ok_id = Uuid::new_v4();
        let gone_id = Uuid::new_v4();
        let mut results = fetcher()
            .fetch_many(vec![
                (ok_id, format!("{}/ok", mock_server.uri())),
                (gone_id, format!("{}/gone", mock_server.uri())),
            ])
            .await;
        results.sort_by_key(|r| r.feed_id != ok_id);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].result.as_ref().unwrap().len(), 2);
        assert!(matches!(results[1].result, Err(FetchError::HttpStatus(410))));
    }
}
