//! HTTP transport backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{AssetRequest, AssetResponse, FetchError, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// HTTP transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport whose requests fail after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client, sharing its connection pool
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: AssetRequest) -> Result<AssetResponse, FetchError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone())
                .send()
                .await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(FetchError::RateLimited);
                }
                warn!(url = %request.url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            debug!(url = %request.url, status = %status, bytes = body.len(), "Response received");

            return Ok(AssetResponse::network(status, headers, body));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::Instant;
    use url::Url;

    /// Local HTTP server answering with `statuses` in order, repeating the last.
    /// Returns the asset URL and the number of requests served.
    async fn responder(statuses: Vec<u16>) -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/a.js", listener.local_addr().unwrap())).unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&served);

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }

                let i = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses[i.min(statuses.len() - 1)];
                let reply = format!(
                    "HTTP/1.1 {} Scripted\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                    status
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (url, served)
    }

    fn transport() -> HttpTransport {
        HttpTransport::with_client(Client::builder().no_proxy().build().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_request_retried_with_backoff() {
        let (url, served) = responder(vec![429, 429, 200]).await;
        let started = Instant::now();

        let response = transport().send(AssetRequest::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "ok".as_bytes());
        assert_eq!(served.load(Ordering::SeqCst), 3);
        // 1s then 2s
        assert!(started.elapsed() >= Duration::from_millis(3 * INITIAL_BACKOFF_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_gives_up_after_max_retries() {
        let (url, served) = responder(vec![429]).await;
        let started = Instant::now();

        let err = transport().send(AssetRequest::get(url)).await.unwrap_err();

        assert!(matches!(err, FetchError::RateLimited));
        assert_eq!(served.load(Ordering::SeqCst), MAX_RATE_LIMIT_RETRIES as usize + 1);
        // 1s + 2s + 4s
        assert!(started.elapsed() >= Duration::from_millis(7 * INITIAL_BACKOFF_MS));
    }

    #[tokio::test]
    async fn test_error_status_returned_as_response() {
        let (url, _served) = responder(vec![404]).await;

        let response = transport().send(AssetRequest::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.is_success());
    }
}
