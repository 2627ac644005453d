use std::{sync::Arc, time::Duration};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest_cookie_store::CookieStoreMutex;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct HttpClient {
    pub client: ClientWithMiddleware,
    pub cookies: Arc<CookieStoreMutex>,
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),
    #[error("upstream returned status {0}")]
    BadStatus(reqwest::StatusCode),
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout: Duration) -> reqwest::Result<HttpClient> {
        let cookies = Arc::new(CookieStoreMutex::default());
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("Mozilla/5.0")),
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, text/html, */*"),
        );

        let client = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(HttpClient { client, cookies })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(DownloadError::BadStatus(resp.status()));
        }
        resp.text().await.map_err(|e| e.into())
    }
}

/// Serializes request dispatch across episode resolutions so the aggregate
/// request rate stays under the upstream throttling ceiling, even when
/// episodes are resolved concurrently.
pub struct RateGovernor {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGovernor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Waits until at least `interval` has passed since the previous
    /// `pace` call returned, then claims the slot.
    pub async fn pace(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let due = prev + self.interval;
            let now = Instant::now();
            if due > now {
                tokio::time::sleep(due - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "KiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "MiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "GiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "TiB";
    }

    format!("{:.2} {}", bytes, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn governor_spaces_consecutive_claims() {
        let gov = RateGovernor::new(Duration::from_millis(50));
        let start = Instant::now();
        gov.pace().await;
        gov.pace().await;
        gov.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }
}
