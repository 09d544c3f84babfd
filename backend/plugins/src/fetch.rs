//! Script retrieval: HTTP(S) and local `file://` sources, with bounded retry.

use std::time::Duration;

use async_trait::async_trait;
use modhost_config::FetchConfig;
use modhost_config::defaults::{
    DEFAULT_FETCH_MAX_RETRIES, DEFAULT_FETCH_RETRY_DELAY_MS, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_USER_AGENT,
};
use modhost_core::{FetchError, LoadError, ScriptFetcher};
use modhost_logging::redact_url;
use tracing::{debug, warn};

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).user_agent(user_agent).build()?;
        Ok(Self { client })
    }

    pub fn from_config(config: &FetchConfig) -> anyhow::Result<Self> {
        Self::new(
            Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS)),
            config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
        )
    }
}

#[async_trait]
impl ScriptFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| FetchError::Io { path: path.to_string(), reason: e.to_string() });
        }

        let network = |e: reqwest::Error| FetchError::Network { url: redact_url(url), reason: e.to_string() };
        let response = self.client.get(url).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: redact_url(url), status: status.as_u16() });
        }
        response.text().await.map_err(network)
    }
}

/// How often and how patiently a URL is fetched before it is given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_FETCH_MAX_RETRIES,
            delay: Duration::from_millis(DEFAULT_FETCH_RETRY_DELAY_MS),
        }
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries.unwrap_or(DEFAULT_FETCH_MAX_RETRIES),
            delay: Duration::from_millis(config.retry_delay_ms.unwrap_or(DEFAULT_FETCH_RETRY_DELAY_MS)),
        }
    }
}

/// Fetch `url`, retrying with a fixed delay. Returns the body and the
/// number of attempts made.
pub async fn fetch_with_retry(
    fetcher: &dyn ScriptFetcher,
    url: &str,
    policy: RetryPolicy,
) -> Result<(String, u32), LoadError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetcher.fetch(url).await {
            Ok(body) => {
                debug!(url = %redact_url(url), attempt, bytes = body.len(), "Fetched");
                return Ok((body, attempt));
            }
            Err(e) if attempt <= policy.max_retries => {
                warn!(url = %redact_url(url), attempt, error = %e, "Fetch failed; retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                return Err(LoadError::Fetch { url: redact_url(url), attempts: attempt, source: e });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory fetcher that fails each URL a configured number of times.
    #[derive(Default)]
    pub(crate) struct MapFetcher {
        pub bodies: Mutex<HashMap<String, String>>,
        pub failures: Mutex<HashMap<String, u32>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        pub(crate) fn with(self, url: &str, body: &str) -> Self {
            self.bodies.lock().unwrap().insert(url.into(), body.into());
            self
        }

        pub(crate) fn failing(self, url: &str, times: u32) -> Self {
            self.failures.lock().unwrap().insert(url.into(), times);
            self
        }

        pub(crate) fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl ScriptFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            tokio::task::yield_now().await;
            if let Some(left) = self.failures.lock().unwrap().get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Status { url: url.into(), status: 503 });
                }
            }
            self.bodies
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::Status { url: url.into(), status: 404 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let fetcher = MapFetcher::default().with("https://m.dev/a.lua", "a").failing("https://m.dev/a.lua", 2);
        let (body, attempts) = fetch_with_retry(&fetcher, "https://m.dev/a.lua", RetryPolicy::default()).await.unwrap();
        assert_eq!(body, "a");
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let fetcher = MapFetcher::default();
        let policy = RetryPolicy { max_retries: 2, delay: Duration::from_millis(10) };
        let err = fetch_with_retry(&fetcher, "https://m.dev/missing.lua", policy).await.unwrap_err();
        match err {
            LoadError::Fetch { attempts, source: FetchError::Status { status, .. }, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, 404);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fetcher.calls_for("https://m.dev/missing.lua"), 3);
    }

    #[tokio::test]
    async fn reads_file_urls() {
        let dir = std::env::temp_dir().join(format!("modhost-fetch-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("hello.lua");
        tokio::fs::write(&path, "return 1").await.unwrap();

        let fetcher = HttpFetcher::new(Duration::from_secs(1), "modhost-test").unwrap();
        let body = fetcher.fetch(&format!("file://{}", path.display())).await.unwrap();
        assert_eq!(body, "return 1");

        let missing = fetcher.fetch("file:///definitely/not/here.lua").await.unwrap_err();
        assert!(matches!(missing, FetchError::Io { .. }));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
