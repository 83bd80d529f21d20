//! Bypass-capable fetching: direct, then rotated proxies, then archive mirrors.

use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::archive::ArchiveRegistry;
use crate::bypass::{self, PaywallPolicy};
use crate::error::{FetchError, Result};
use crate::normalize::ContentKind;
use crate::proxy::ProxyPool;
use crate::result::{BatchItem, FetchOrigin, FetchResult};
use crate::search::{self, SearchProvider};

/// A fetchable resource: an absolute URL or a search query.
#[derive(Debug, Clone)]
pub enum Resource {
    Url(String),
    Query { query: String, limit: usize },
}

impl Resource {
    /// Anything that doesn't look like an http(s) URL is a search query.
    pub fn parse(raw: &str, limit: usize) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Resource::Url(raw.to_string())
        } else {
            Resource::Query {
                query: raw.to_string(),
                limit,
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Resource::Url(url) => url,
            Resource::Query { query, .. } => query,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Timeout for each individual attempt.
    pub attempt_timeout: Duration,
    /// Budget for the whole escalation ladder of one resource.
    pub overall_timeout: Duration,
    /// Truncation cap for a payload window.
    pub max_bytes: usize,
    /// Byte offset into the payload, for paging through truncated content.
    pub offset: usize,
    /// Window length; defaults to `max_bytes`.
    pub length: Option<usize>,
    /// Worker bound for batch fetches.
    pub batch_concurrency: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(45),
            max_bytes: 1_000_000,
            offset: 0,
            length: None,
            batch_concurrency: 10,
        }
    }
}

pub struct Fetcher {
    client: Client,
    proxies: Arc<ProxyPool>,
    archives: ArchiveRegistry,
    paywall: PaywallPolicy,
    search: Option<Arc<dyn SearchProvider>>,
    options: FetchOptions,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Self::with_options(FetchOptions::default())
    }

    pub fn with_options(options: FetchOptions) -> Self {
        let connect_timeout = (options.attempt_timeout / 2).max(Duration::from_secs(1));
        let client = Client::builder()
            .timeout(options.attempt_timeout)
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            proxies: Arc::new(ProxyPool::new()),
            archives: ArchiveRegistry::default(),
            paywall: PaywallPolicy::default(),
            search: None,
            options,
        }
    }

    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.proxies = pool;
        self
    }

    pub fn with_archives(mut self, archives: ArchiveRegistry) -> Self {
        self.archives = archives;
        self
    }

    pub fn with_paywall_policy(mut self, policy: PaywallPolicy) -> Self {
        self.paywall = policy;
        self
    }

    pub fn with_search_provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(provider);
        self
    }

    pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    pub async fn fetch(&self, resource: &Resource) -> Result<FetchResult> {
        match resource {
            Resource::Url(url) => self.fetch_url(url).await,
            Resource::Query { query, limit } => self.fetch_query(query, *limit).await,
        }
    }

    /// Fetches every resource concurrently under the configured worker bound;
    /// per-item failures are reported in place, never as a batch failure.
    pub async fn fetch_batch(&self, resources: Vec<Resource>) -> Vec<BatchItem> {
        let limit = self.options.batch_concurrency.max(1);
        let mut items: Vec<(usize, BatchItem)> =
            futures::stream::iter(resources.into_iter().enumerate())
                .map(|(idx, resource)| async move {
                    let name = resource.as_str().to_string();
                    let item = match self.fetch(&resource).await {
                        Ok(result) => BatchItem::ok(name, result),
                        Err(e) => {
                            warn!("Batch fetch failed for {name}: {e}");
                            BatchItem::failed(name, e.to_string())
                        }
                    };
                    (idx, item)
                })
                .buffer_unordered(limit)
                .collect()
                .await;
        items.sort_by_key(|(idx, _)| *idx);
        items.into_iter().map(|(_, item)| item).collect()
    }

    async fn fetch_query(&self, query: &str, limit: usize) -> Result<FetchResult> {
        let provider = self.search.as_ref().ok_or(FetchError::NoSearchProvider)?;
        let hits = provider.search(query, limit).await?;
        debug!("Search for '{query}' returned {} hits", hits.len());
        Ok(FetchResult::new(
            query.to_string(),
            200,
            search::format_hits(query, &hits),
            Some("text/plain".to_string()),
            FetchOrigin::Direct,
        ))
    }

    /// Resolves one URL through the escalation ladder under the overall budget.
    pub async fn fetch_url(&self, url: &str) -> Result<FetchResult> {
        Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        match tokio::time::timeout(self.options.overall_timeout, self.escalate(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Connection(format!(
                "fetch budget of {:?} exceeded for {url}",
                self.options.overall_timeout
            ))),
        }
    }

    async fn escalate(&self, url: &str) -> Result<FetchResult> {
        debug!("Fetching {url}");

        let direct_failure = match self.attempt(&self.client, url, FetchOrigin::Direct).await {
            Ok(result) if !self.blocked(&result) => return Ok(result),
            Ok(result) => {
                debug!("Direct fetch of {url} blocked (status {})", result.status_code);
                None
            }
            Err(e) => {
                debug!("Direct fetch of {url} failed: {e}");
                Some(e)
            }
        };

        let mut tried = HashSet::new();
        while let Some(proxy) = self.proxies.select_excluding(&tried).await {
            tried.insert(proxy.clone());
            match self.attempt_via_proxy(&proxy, url).await {
                Ok(result) if !self.blocked(&result) => {
                    self.proxies.mark_success(&proxy).await;
                    info!("Fetched {url} via proxy {proxy}");
                    return Ok(result);
                }
                Ok(result) => {
                    debug!("Proxy {proxy} blocked for {url} (status {})", result.status_code);
                    self.proxies.mark_failure(&proxy).await;
                }
                Err(e) => {
                    debug!("Proxy {proxy} failed for {url}: {e}");
                    self.proxies.mark_failure(&proxy).await;
                }
            }
        }

        for mirror in self.archives.candidates(url) {
            match self.attempt(&self.client, &mirror, FetchOrigin::Archive).await {
                Ok(mut result)
                    if result.status_code == 200 && !self.paywall.detect(&result.content) =>
                {
                    // Report the resource the caller asked for, not the mirror
                    result.url = url.to_string();
                    info!("Fetched {url} via archive mirror");
                    return Ok(result);
                }
                Ok(result) => {
                    debug!("Archive mirror for {url} unusable (status {})", result.status_code)
                }
                Err(e) => debug!("Archive mirror failed for {url}: {e}"),
            }
        }

        // With no bypass rungs to climb, report the direct failure as-is
        if let Some(e) = direct_failure
            && tried.is_empty()
            && self.archives.is_empty()
        {
            return Err(e);
        }
        Err(FetchError::BypassExhausted(url.to_string()))
    }

    fn blocked(&self, result: &FetchResult) -> bool {
        bypass::is_blocked_status(result.status_code)
            || (result.status_code == 200 && self.paywall.detect(&result.content))
    }

    async fn attempt_via_proxy(&self, proxy: &str, url: &str) -> Result<FetchResult> {
        let client = Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{proxy}"))?)
            .timeout(self.options.attempt_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        self.attempt(&client, url, FetchOrigin::Proxy).await
    }

    async fn attempt(&self, client: &Client, url: &str, origin: FetchOrigin) -> Result<FetchResult> {
        let response = client
            .get(url)
            .header(USER_AGENT, bypass::rotate_user_agent())
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response.bytes().await?;

        Ok(self.build_result(url, status_code, content_type, &bytes, origin))
    }

    /// Applies the offset/length window and the truncation cap.
    fn build_result(
        &self,
        url: &str,
        status_code: u16,
        content_type: Option<String>,
        bytes: &[u8],
        origin: FetchOrigin,
    ) -> FetchResult {
        let total = bytes.len();
        let start = self.options.offset.min(total);
        let window_len = self
            .options
            .length
            .unwrap_or(self.options.max_bytes)
            .min(self.options.max_bytes);
        let end = start.saturating_add(window_len).min(total);
        let window = &bytes[start..end];

        let kind = ContentKind::detect(content_type.as_deref(), bytes);
        let content = String::from_utf8_lossy(window).into_owned();
        let (raw, content_error) = match kind {
            ContentKind::Image => (Some(window.to_vec()), None),
            ContentKind::Other if std::str::from_utf8(window).is_err() => (
                Some(window.to_vec()),
                Some("unsupported binary content; raw bytes passed through".to_string()),
            ),
            _ => (None, None),
        };

        let mut result = FetchResult::new(url.to_string(), status_code, content, content_type, origin);
        result.truncated = end < total;
        result.remaining_bytes = total - end;
        result.content_error = content_error;
        result.raw = raw;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchHit;
    use async_trait::async_trait;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_options() -> FetchOptions {
        FetchOptions {
            attempt_timeout: Duration::from_secs(5),
            overall_timeout: Duration::from_secs(10),
            ..FetchOptions::default()
        }
    }

    fn no_bypass_fetcher() -> Fetcher {
        Fetcher::with_options(quick_options()).with_archives(ArchiveRegistry::empty())
    }

    #[tokio::test]
    async fn test_direct_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>hello</body></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = no_bypass_fetcher();
        let result = fetcher.fetch_url(&format!("{}/page", server.uri())).await.unwrap();

        assert_eq!(result.status_code, 200);
        assert_eq!(result.fetched_via, FetchOrigin::Direct);
        assert!(result.content.contains("hello"));
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_blocked_fetch_falls_back_to_archive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>the archived story</body></html>"),
            )
            .mount(&server)
            .await;

        let archives = ArchiveRegistry::new(vec![format!("{}/mirror?u=", server.uri())]);
        let fetcher = Fetcher::with_options(quick_options()).with_archives(archives);

        let url = format!("{}/story", server.uri());
        let result = fetcher.fetch_url(&url).await.unwrap();

        assert_eq!(result.fetched_via, FetchOrigin::Archive);
        assert_eq!(result.status_code, 200);
        assert_eq!(result.url, url);
        assert!(result.content.contains("the archived story"));
    }

    #[tokio::test]
    async fn test_paywalled_200_triggers_bypass() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>Subscribe to continue reading</body></html>"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>full article text</body></html>"),
            )
            .mount(&server)
            .await;

        let archives = ArchiveRegistry::new(vec![format!("{}/mirror?u=", server.uri())]);
        let fetcher = Fetcher::with_options(quick_options()).with_archives(archives);

        let result = fetcher
            .fetch_url(&format!("{}/article", server.uri()))
            .await
            .unwrap();

        assert_eq!(result.fetched_via, FetchOrigin::Archive);
        assert!(result.content.contains("full article text"));
    }

    #[tokio::test]
    async fn test_proxy_bypass_tags_origin() {
        let blocked = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&blocked)
            .await;

        // A permissive mock standing in for an HTTP forward proxy.
        let proxy = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>via proxy</body></html>"),
            )
            .mount(&proxy)
            .await;

        let proxy_addr = proxy.uri().trim_start_matches("http://").to_string();
        let pool = Arc::new(ProxyPool::with_proxies(vec![proxy_addr]));
        let fetcher = Fetcher::with_options(quick_options())
            .with_archives(ArchiveRegistry::empty())
            .with_proxy_pool(pool);

        let result = fetcher
            .fetch_url(&format!("{}/blocked", blocked.uri()))
            .await
            .unwrap();

        assert_eq!(result.fetched_via, FetchOrigin::Proxy);
        assert!(result.content.contains("via proxy"));
    }

    #[tokio::test]
    async fn test_bypass_exhausted_when_everything_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = no_bypass_fetcher();
        let err = fetcher
            .fetch_url(&format!("{}/locked", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BypassExhausted(_)));
    }

    #[tokio::test]
    async fn test_truncation_reports_remaining_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("a".repeat(100)),
            )
            .mount(&server)
            .await;

        let options = FetchOptions {
            max_bytes: 40,
            ..quick_options()
        };
        let fetcher = Fetcher::with_options(options).with_archives(ArchiveRegistry::empty());
        let result = fetcher.fetch_url(&format!("{}/big", server.uri())).await.unwrap();

        assert!(result.truncated);
        assert_eq!(result.content.len(), 40);
        assert_eq!(result.remaining_bytes, 60);
    }

    #[tokio::test]
    async fn test_offset_and_length_page_through_content() {
        let body: String = (0..10).map(|d| d.to_string().repeat(10)).collect();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let options = FetchOptions {
            offset: 40,
            length: Some(20),
            ..quick_options()
        };
        let fetcher = Fetcher::with_options(options).with_archives(ArchiveRegistry::empty());
        let result = fetcher.fetch_url(&format!("{}/big", server.uri())).await.unwrap();

        assert_eq!(result.content, "4".repeat(10) + &"5".repeat(10));
        assert!(result.truncated);
        assert_eq!(result.remaining_bytes, 40);
    }

    #[tokio::test]
    async fn test_overall_budget_yields_connection_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let options = FetchOptions {
            attempt_timeout: Duration::from_secs(5),
            overall_timeout: Duration::from_millis(300),
            ..FetchOptions::default()
        };
        let fetcher = Fetcher::with_options(options).with_archives(ArchiveRegistry::empty());
        let err = fetcher
            .fetch_url(&format!("{}/slow", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Connection(_)));
    }

    #[tokio::test]
    async fn test_batch_reports_per_item_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>fine</body></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = no_bypass_fetcher();
        let items = fetcher
            .fetch_batch(vec![
                Resource::Url(format!("{}/ok", server.uri())),
                Resource::Url("http://127.0.0.1:9/refused".to_string()),
            ])
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].success());
        assert!(!items[1].success());
        assert!(items[1].error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let fetcher = no_bypass_fetcher();
        let err = fetcher.fetch_url("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    struct StubSearch;

    #[async_trait]
    impl SearchProvider for StubSearch {
        async fn search(&self, _query: &str, limit: usize) -> crate::error::Result<Vec<SearchHit>> {
            Ok((0..limit.min(2))
                .map(|i| SearchHit {
                    title: format!("Hit {i}"),
                    link: format!("http://results.example/{i}"),
                    snippet: "snippet".to_string(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_query_resource_uses_search_provider() {
        let fetcher = no_bypass_fetcher().with_search_provider(Arc::new(StubSearch));
        let result = fetcher
            .fetch(&Resource::parse("rust web crawler", 5))
            .await
            .unwrap();
        assert!(result.content.contains("1. Hit 0"));
        assert!(result.content.contains("http://results.example/1"));
    }

    #[tokio::test]
    async fn test_query_without_provider_fails() {
        let fetcher = no_bypass_fetcher();
        let err = fetcher
            .fetch(&Resource::Query {
                query: "anything".to_string(),
                limit: 3,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoSearchProvider));
    }

    #[test]
    fn test_resource_parse() {
        assert!(matches!(
            Resource::parse("https://example.com", 5),
            Resource::Url(_)
        ));
        assert!(matches!(
            Resource::parse("latest rust release", 5),
            Resource::Query { .. }
        ));
    }
}
