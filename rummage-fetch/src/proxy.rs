//! Rotating proxy pool with failure benching and source-driven refresh.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// External supplier of candidate proxy endpoints ("host:port" strings).
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn fetch_proxies(&self, limit: usize) -> Result<Vec<String>>;
}

/// Failures before an entry is benched.
const MAX_FAILURES: u32 = 3;
/// How long a benched entry sits out.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);
/// How many proxies to request on refresh.
pub const DEFAULT_REFRESH_LIMIT: usize = 20;

#[derive(Debug, Clone)]
struct ProxyEntry {
    addr: String,
    failures: u32,
    benched_until: Option<Instant>,
}

impl ProxyEntry {
    fn new(addr: String) -> Self {
        Self {
            addr,
            failures: 0,
            benched_until: None,
        }
    }

    fn available(&self, now: Instant) -> bool {
        match self.benched_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

pub struct ProxyPool {
    entries: Mutex<Vec<ProxyEntry>>,
    source: Option<Arc<dyn ProxySource>>,
    max_failures: u32,
    cooldown: Duration,
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyPool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            source: None,
            max_failures: MAX_FAILURES,
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    pub fn with_proxies(addrs: Vec<String>) -> Self {
        let pool = Self::new();
        {
            let mut entries = pool.entries.try_lock().expect("fresh pool lock");
            *entries = addrs.into_iter().map(ProxyEntry::new).collect();
        }
        pool
    }

    pub fn with_source(mut self, source: Arc<dyn ProxySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Picks a random proxy that is not benched and not in `tried`.
    pub async fn select_excluding(&self, tried: &HashSet<String>) -> Option<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let candidates: Vec<&ProxyEntry> = entries
            .iter()
            .filter(|e| e.available(now) && !tried.contains(&e.addr))
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|e| e.addr.clone())
    }

    pub async fn select(&self) -> Option<String> {
        self.select_excluding(&HashSet::new()).await
    }

    pub async fn mark_success(&self, addr: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.addr == addr) {
            entry.failures = 0;
            entry.benched_until = None;
        }
    }

    /// Records a failure; an entry crossing the threshold is benched for the
    /// cool-down window.
    pub async fn mark_failure(&self, addr: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.addr == addr) {
            entry.failures += 1;
            if entry.failures >= self.max_failures {
                entry.failures = 0;
                entry.benched_until = Some(Instant::now() + self.cooldown);
                warn!(
                    "Proxy {} benched for {:?} after repeated failures",
                    addr, self.cooldown
                );
            }
        }
    }

    /// Pulls a fresh list from the configured source. A failed or empty
    /// refresh keeps the last-known pool in place.
    pub async fn refresh(&self) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(self.len().await);
        };
        match source.fetch_proxies(DEFAULT_REFRESH_LIMIT).await {
            Ok(addrs) if !addrs.is_empty() => {
                let mut entries = self.entries.lock().await;
                *entries = addrs.into_iter().map(ProxyEntry::new).collect();
                info!("Proxy pool refreshed with {} entries", entries.len());
                Ok(entries.len())
            }
            Ok(_) => {
                let kept = self.len().await;
                warn!("Proxy refresh returned no entries, keeping {} known", kept);
                Ok(kept)
            }
            Err(e) => {
                warn!("Proxy refresh failed ({e}), keeping last-known pool");
                Err(e)
            }
        }
    }

    /// Spawns the optional periodic refresh task. Refresh failures are logged
    /// and isolated; they never reach a fetch in progress.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = pool.refresh().await {
                    debug!("Background proxy refresh failed: {e}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;

    struct StaticSource(Vec<String>);

    #[async_trait]
    impl ProxySource for StaticSource {
        async fn fetch_proxies(&self, _limit: usize) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ProxySource for FailingSource {
        async fn fetch_proxies(&self, _limit: usize) -> Result<Vec<String>> {
            Err(FetchError::Connection("source unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_select_from_pool() {
        let pool = ProxyPool::with_proxies(vec!["10.0.0.1:8080".to_string()]);
        assert_eq!(pool.select().await, Some("10.0.0.1:8080".to_string()));
    }

    #[tokio::test]
    async fn test_empty_pool_selects_nothing() {
        let pool = ProxyPool::new();
        assert_eq!(pool.select().await, None);
    }

    #[tokio::test]
    async fn test_select_excluding_tried() {
        let pool = ProxyPool::with_proxies(vec![
            "10.0.0.1:8080".to_string(),
            "10.0.0.2:8080".to_string(),
        ]);
        let mut tried = HashSet::new();
        tried.insert("10.0.0.1:8080".to_string());
        assert_eq!(
            pool.select_excluding(&tried).await,
            Some("10.0.0.2:8080".to_string())
        );
        tried.insert("10.0.0.2:8080".to_string());
        assert_eq!(pool.select_excluding(&tried).await, None);
    }

    #[tokio::test]
    async fn test_benched_proxy_excluded_until_cooldown() {
        let pool = ProxyPool::with_proxies(vec!["10.0.0.1:8080".to_string()])
            .with_max_failures(2)
            .with_cooldown(Duration::from_millis(50));

        pool.mark_failure("10.0.0.1:8080").await;
        assert!(pool.select().await.is_some());

        pool.mark_failure("10.0.0.1:8080").await;
        assert_eq!(pool.select().await, None);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(pool.select().await.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let pool = ProxyPool::with_proxies(vec!["10.0.0.1:8080".to_string()]).with_max_failures(2);
        pool.mark_failure("10.0.0.1:8080").await;
        pool.mark_success("10.0.0.1:8080").await;
        pool.mark_failure("10.0.0.1:8080").await;
        assert!(pool.select().await.is_some());
    }

    #[tokio::test]
    async fn test_refresh_replaces_entries() {
        let pool = ProxyPool::with_proxies(vec!["10.0.0.1:8080".to_string()])
            .with_source(Arc::new(StaticSource(vec![
                "10.1.0.1:3128".to_string(),
                "10.1.0.2:3128".to_string(),
            ])));
        assert_eq!(pool.refresh().await.unwrap(), 2);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_known_pool() {
        let pool = ProxyPool::with_proxies(vec!["10.0.0.1:8080".to_string()])
            .with_source(Arc::new(FailingSource));
        assert!(pool.refresh().await.is_err());
        assert_eq!(pool.len().await, 1);
        assert!(pool.select().await.is_some());
    }

    #[tokio::test]
    async fn test_empty_refresh_keeps_last_known_pool() {
        let pool = ProxyPool::with_proxies(vec!["10.0.0.1:8080".to_string()])
            .with_source(Arc::new(StaticSource(Vec::new())));
        assert_eq!(pool.refresh().await.unwrap(), 1);
        assert_eq!(pool.len().await, 1);
    }
}
