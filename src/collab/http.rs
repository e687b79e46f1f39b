//! [`PageSource`] over real HTTP with `reqwest`.

use super::PageSource;
use crate::error::Book2PdfError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("book2pdf/", env!("CARGO_PKG_VERSION"));

/// Plain GET client. Each call carries its own timeout; retries are left to
/// the queue that redelivers failed work.
#[derive(Clone)]
pub struct HttpPageSource {
    client: Client,
}

impl HttpPageSource {
    pub fn new() -> Result<Self, Book2PdfError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Book2PdfError::Internal(format!("HTTP client init failed: {e}")))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, Book2PdfError> {
        debug!(url, "GET");
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest(url, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Book2PdfError::FetchFailed {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        Ok(response)
    }
}

fn map_reqwest(url: &str, timeout: Duration, e: reqwest::Error) -> Book2PdfError {
    if e.is_timeout() {
        Book2PdfError::FetchTimeout {
            url: url.to_string(),
            secs: timeout.as_secs(),
        }
    } else {
        Book2PdfError::FetchFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, Book2PdfError> {
        self.get(url, timeout)
            .await?
            .text()
            .await
            .map_err(|e| map_reqwest(url, timeout, e))
    }

    async fn fetch_bytes(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, Book2PdfError> {
        let bytes = self
            .get(url, timeout)
            .await?
            .bytes()
            .await
            .map_err(|e| map_reqwest(url, timeout, e))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_is_a_fetch_error() {
        let source = HttpPageSource::new().unwrap();
        // Port 9 on localhost is the discard service; nothing listens there in CI.
        let err = source
            .fetch_text("http://127.0.0.1:9/viewer", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Book2PdfError::FetchFailed { .. } | Book2PdfError::FetchTimeout { .. }
        ));
    }
}
