//! Artifact fetching
//!
//! Downloads plugin artifacts over HTTP(S) with a per-attempt timeout and
//! exponential backoff. Client errors (4xx) end the attempt immediately;
//! timeouts, transport failures and 5xx responses are retried until the
//! policy runs out.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::core::config::LoaderConfig;
use crate::core::error::{ErrorContext, FetchError, FetchErrorKind, Result};

/// Timeout and retry budget for one fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Bound on a single attempt, body included
    pub timeout: Duration,
    /// Additional attempts after the first
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl FetchPolicy {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.fetch_timeout_secs),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based), jitter included
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let base = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
        let jitter_ceiling = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ceiling > 0 {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

/// Source of artifact bytes
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str, policy: &FetchPolicy) -> std::result::Result<Bytes, FetchError>;
}

/// Fetcher backed by `reqwest`
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("source-runtime/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn attempt(&self, url: &Url, timeout: Duration) -> std::result::Result<Bytes, FetchError> {
        let request = async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| classify(url, e))?;

            let status = response.status();
            if !status.is_success() {
                let reason = status.canonical_reason().unwrap_or("unexpected status");
                return Err(FetchError::new(url.as_str(), FetchErrorKind::HttpStatus, reason)
                    .with_status(status.as_u16()));
            }

            response.bytes().await.map_err(|e| classify(url, e))
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::new(
                url.as_str(),
                FetchErrorKind::Timeout,
                format!("no complete response within {:?}", timeout),
            )),
        }
    }
}

fn classify(url: &Url, err: reqwest::Error) -> FetchError {
    let kind = if err.is_timeout() {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::Network
    };
    let mut fetch_err = FetchError::new(url.as_str(), kind, err.to_string());
    if let Some(status) = err.status() {
        fetch_err = fetch_err.with_status(status.as_u16());
    }
    fetch_err
}

/// Parse `raw` as an absolute HTTP(S) URL
pub fn parse_artifact_url(raw: &str) -> std::result::Result<Url, FetchError> {
    let url = Url::parse(raw)
        .map_err(|e| FetchError::new(raw, FetchErrorKind::InvalidUrl, e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::new(
            raw,
            FetchErrorKind::InvalidUrl,
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    Ok(url)
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, policy: &FetchPolicy) -> std::result::Result<Bytes, FetchError> {
        let parsed = parse_artifact_url(url)?;
        let mut last_status = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(url = %url, attempt, "Fetching artifact");

            match self.attempt(&parsed, policy.timeout).await {
                Ok(bytes) => {
                    debug!(url = %url, attempt, size = bytes.len(), "Artifact fetched");
                    return Ok(bytes);
                }
                Err(mut err) => {
                    if err.status.is_some() {
                        last_status = err.status;
                    } else {
                        err.status = last_status;
                    }
                    let err = err.with_attempts(attempt);

                    let retryable = match err.kind {
                        // A 5xx seen earlier must not make a later timeout look terminal
                        FetchErrorKind::HttpStatus => err.is_retryable(),
                        FetchErrorKind::Timeout | FetchErrorKind::Network => true,
                        FetchErrorKind::InvalidUrl => false,
                    };

                    if !retryable || attempt > policy.max_retries {
                        warn!(url = %url, attempt, error = %err, "Fetch failed");
                        return Err(err);
                    }

                    let delay = policy.backoff(attempt);
                    debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying fetch");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Whether `bytes` look like an HTML document rather than script text
///
/// Script never opens with markup, so any leading tag, comment or
/// declaration (`<html`, `<meta`, `<!--`, `<?xml`...) counts.
pub fn looks_like_html(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());

    match &bytes[start..] {
        [b'<', next, ..] => next.is_ascii_alphabetic() || matches!(next, b'!' | b'?'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::serve;
    use axum::{extract::State, http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_millis(500),
            max_retries,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[derive(Clone, Default)]
    struct Hits {
        flaky: Arc<AtomicUsize>,
        missing: Arc<AtomicUsize>,
        broken: Arc<AtomicUsize>,
    }

    async fn flaky(State(hits): State<Hits>) -> (StatusCode, &'static str) {
        if hits.flaky.fetch_add(1, Ordering::SeqCst) < 2 {
            (StatusCode::SERVICE_UNAVAILABLE, "try later")
        } else {
            (StatusCode::OK, "class A extends BaseSource {}")
        }
    }

    async fn missing(State(hits): State<Hits>) -> (StatusCode, &'static str) {
        hits.missing.fetch_add(1, Ordering::SeqCst);
        (StatusCode::NOT_FOUND, "nope")
    }

    async fn broken(State(hits): State<Hits>) -> (StatusCode, &'static str) {
        hits.broken.fetch_add(1, Ordering::SeqCst);
        (StatusCode::BAD_GATEWAY, "upstream down")
    }

    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(3)).await;
        "too late"
    }

    async fn start() -> (String, Hits) {
        let hits = Hits::default();
        let app = Router::new()
            .route("/ok.js", get(|| async { "module.exports = 1;" }))
            .route("/flaky.js", get(flaky))
            .route("/missing.js", get(missing))
            .route("/broken.js", get(broken))
            .route("/slow.js", get(slow))
            .with_state(hits.clone());
        let addr = serve(app).await;
        (format!("http://{}", addr), hits)
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let (base, _) = start().await;
        let fetcher = HttpFetcher::new().unwrap();
        let bytes = fetcher.fetch(&format!("{}/ok.js", base), &fast_policy(0)).await.unwrap();
        assert_eq!(&bytes[..], b"module.exports = 1;");
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let (base, hits) = start().await;
        let fetcher = HttpFetcher::new().unwrap();
        let bytes = fetcher.fetch(&format!("{}/flaky.js", base), &fast_policy(3)).await.unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(hits.flaky.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let (base, hits) = start().await;
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .fetch(&format!("{}/missing.js", base), &fast_policy(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::HttpStatus);
        assert_eq!(err.status, Some(404));
        assert_eq!(err.attempts, 1);
        assert_eq!(hits.missing.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_status() {
        let (base, hits) = start().await;
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .fetch(&format!("{}/broken.js", base), &fast_policy(2))
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(502));
        assert_eq!(err.attempts, 3);
        assert_eq!(hits.broken.load(Ordering::SeqCst), 3);
        assert!(err.url.ends_with("/broken.js"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (base, _) = start().await;
        let fetcher = HttpFetcher::new().unwrap();
        let policy = FetchPolicy {
            timeout: Duration::from_millis(100),
            ..fast_policy(1)
        };
        let err = fetcher.fetch(&format!("{}/slow.js", base), &policy).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Timeout);
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn test_invalid_url_makes_no_attempt() {
        let fetcher = HttpFetcher::new().unwrap();
        for url in ["not a url", "ftp://files.example/a.js", "/relative/a.js"] {
            let err = fetcher.fetch(url, &fast_policy(3)).await.unwrap_err();
            assert_eq!(err.kind, FetchErrorKind::InvalidUrl);
            assert_eq!(err.attempts, 0);
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = FetchPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let capped = policy.backoff(30);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1250));
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html(b"<!DOCTYPE html><html></html>"));
        assert!(looks_like_html(b"\xEF\xBB\xBF\n  <html lang=\"en\">"));
        assert!(looks_like_html(b"<HEAD><title>404</title>"));
        assert!(looks_like_html(b"\r\n<body>Not found</body>"));
        assert!(looks_like_html(b"<!-- cdn error page -->\n<html>"));
        assert!(looks_like_html(b"<meta http-equiv=\"refresh\" content=\"0\">"));
        assert!(looks_like_html(b"  <title>Moved</title>"));
        assert!(looks_like_html(b"<?xml version=\"1.0\"?><html/>"));
        assert!(!looks_like_html(b"< 3 ? a : b"));
        assert!(!looks_like_html(b"class A extends BaseSource {}"));
        assert!(!looks_like_html(b"// <html> in a comment\nmodule.exports = 1;"));
        assert!(!looks_like_html(b""));
    }
}
