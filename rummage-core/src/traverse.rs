//! Budget-bounded breadth-first link traversal.

use regex::{Regex, RegexBuilder};
use rummage_fetch::{FetchError, Fetcher, Normalizer, Page};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::robots::RobotsRules;

#[derive(Error, Debug)]
pub enum TraverseError {
    #[error("invalid traversal configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

pub type Result<T> = std::result::Result<T, TraverseError>;

/// Immutable per-call traversal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub max_depth: usize,
    pub max_pages: usize,
    pub same_domain_only: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub delay_between_requests: f64,
    pub max_content_per_page: usize,
    pub respect_robots_txt: bool,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_pages: 10,
            same_domain_only: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            delay_between_requests: 1.0,
            max_content_per_page: 3000,
            respect_robots_txt: true,
        }
    }
}

impl TraversalConfig {
    /// Validated synchronously before a traversal does any work.
    pub fn validate(&self) -> Result<()> {
        if self.max_pages < 1 {
            return Err(TraverseError::Config("max_pages must be at least 1".to_string()));
        }
        if !self.delay_between_requests.is_finite() || self.delay_between_requests < 0.0 {
            return Err(TraverseError::Config(
                "delay_between_requests must be a non-negative number".to_string(),
            ));
        }
        for pattern in self.include_patterns.iter().chain(&self.exclude_patterns) {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| TraverseError::Config(format!("bad pattern '{pattern}': {e}")))?;
        }
        Ok(())
    }

    /// Topic research: shallow, article-focused crawl.
    pub fn research() -> Self {
        Self {
            max_depth: 2,
            max_pages: 5,
            exclude_patterns: string_vec(&[
                r"/tag/",
                r"/category/",
                r"/archive/",
                r"/search/",
                r"\.pdf$",
                r"\.doc$",
                r"/login",
                r"/register",
            ]),
            ..Self::default()
        }
    }

    /// Documentation walk: deeper, restricted to doc-shaped paths.
    pub fn documentation() -> Self {
        Self {
            max_depth: 3,
            max_pages: 15,
            include_patterns: string_vec(&[
                r"/docs?/",
                r"/documentation/",
                r"/guide/",
                r"/tutorial/",
                r"/api/",
                r"/reference/",
                r"/manual/",
            ]),
            exclude_patterns: string_vec(&[r"/forum/", r"/blog/", r"/news/", r"/download/"]),
            ..Self::default()
        }
    }

    /// Site mapping: broad sweep of page structure.
    pub fn mapping() -> Self {
        Self {
            max_depth: 2,
            max_pages: 20,
            exclude_patterns: string_vec(&[
                r"\.pdf$",
                r"\.doc$",
                r"\.zip$",
                r"/search\?",
                r"/login",
                r"/register",
                r"/cart",
                r"/checkout",
            ]),
            ..Self::default()
        }
    }
}

fn string_vec(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|s| s.to_string()).collect()
}

/// One page that could not be fetched; never aborts the traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFailure {
    pub url: String,
    pub depth: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalResult {
    pub start_url: String,
    pub pages_fetched: usize,
    pub total_attempts: usize,
    pub unique_links_found: usize,
    pub max_depth_reached: usize,
    pub pages: Vec<Page>,
    pub failures: Vec<PageFailure>,
    pub summary: String,
}

/// Canonical visited-set key: lowercase host, no fragment, trailing path
/// slash trimmed (except root); the query string is kept, so URLs differing
/// only in query are distinct pages.
pub fn normalize_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let mut url = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }
    Some(url.to_string())
}

struct LinkFilters {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl LinkFilters {
    fn compile(config: &TraversalConfig) -> Result<Self> {
        let build = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| TraverseError::Config(format!("bad pattern '{p}': {e}")))
                })
                .collect()
        };
        Ok(Self {
            include: build(&config.include_patterns)?,
            exclude: build(&config.exclude_patterns)?,
        })
    }
}

pub struct Traverser {
    fetcher: Arc<Fetcher>,
    normalizer: Normalizer,
    robots_client: reqwest::Client,
    config: TraversalConfig,
}

impl Traverser {
    pub fn new(fetcher: Arc<Fetcher>, config: TraversalConfig) -> Self {
        let robots_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            fetcher,
            normalizer: Normalizer::new(),
            robots_client,
            config,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &TraversalConfig {
        &self.config
    }

    /// Breadth-first traversal from `start_url` under the configured budgets.
    /// Both exhausting the frontier and hitting the page budget are ordinary
    /// success.
    pub async fn traverse(&self, start_url: &str) -> Result<TraversalResult> {
        self.config.validate()?;
        let filters = LinkFilters::compile(&self.config)?;

        let start = Url::parse(start_url)
            .map_err(|e| TraverseError::Config(format!("invalid start URL {start_url}: {e}")))?;
        let start_host = start
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| TraverseError::Config(format!("start URL {start_url} has no host")))?;
        let normalized_start = normalize_url(start_url, None)
            .ok_or_else(|| TraverseError::Config(format!("start URL {start_url} not http(s)")))?;

        info!(
            "Starting traversal of {start_url} (max_depth {}, max_pages {})",
            self.config.max_depth, self.config.max_pages
        );

        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut robots_cache: HashMap<String, RobotsRules> = HashMap::new();
        let mut pages: Vec<Page> = Vec::new();
        let mut failures: Vec<PageFailure> = Vec::new();
        let mut all_links: HashSet<String> = HashSet::new();
        let mut total_attempts = 0usize;
        let mut max_depth_reached = 0usize;
        let mut fetched_any = false;

        visited.insert(normalized_start);
        frontier.push_back((start_url.to_string(), 0));

        let delay = Duration::from_secs_f64(self.config.delay_between_requests);

        while let Some((url, depth)) = frontier.pop_front() {
            if depth > self.config.max_depth {
                continue;
            }
            if pages.len() == self.config.max_pages {
                debug!(
                    "Page budget reached, abandoning {} frontier entries",
                    frontier.len() + 1
                );
                break;
            }

            if self.config.respect_robots_txt
                && let Ok(parsed) = Url::parse(&url)
            {
                let rules = self.robots_for(&mut robots_cache, &parsed).await;
                if !rules.is_allowed(parsed.path()) {
                    debug!("robots.txt disallows {url}, skipping");
                    continue;
                }
            }

            if fetched_any && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fetched_any = true;

            total_attempts += 1;
            let fetch = match self.fetcher.fetch_url(&url).await {
                Ok(fetch) => fetch,
                Err(e) => {
                    warn!("Fetch failed for {url}: {e}");
                    failures.push(PageFailure {
                        url,
                        depth,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if !(200..=299).contains(&fetch.status_code) {
                debug!("Skipping {url}: HTTP status {}", fetch.status_code);
                failures.push(PageFailure {
                    url,
                    depth,
                    error: format!("HTTP status {}", fetch.status_code),
                });
                continue;
            }

            let mut page = self.normalizer.normalize(&fetch, depth).await;
            cap_content(&mut page.content, self.config.max_content_per_page);

            max_depth_reached = max_depth_reached.max(depth);
            for link in &page.links {
                all_links.insert(link.clone());
            }

            if depth < self.config.max_depth {
                for link in &page.links {
                    let Some(normalized) = normalize_url(link, None) else {
                        continue;
                    };
                    if visited.contains(&normalized) {
                        continue;
                    }
                    if !self.should_follow(link, &start_host, &filters) {
                        continue;
                    }
                    visited.insert(normalized);
                    frontier.push_back((link.clone(), depth + 1));
                }
            }

            debug!(
                "Fetched page {}/{}: {} (depth {depth})",
                pages.len() + 1,
                self.config.max_pages,
                page.url
            );
            pages.push(page);
        }

        let summary = format!("Traversed {} pages starting from {start_url}", pages.len());
        info!("{summary} ({total_attempts} attempts, {} links)", all_links.len());

        Ok(TraversalResult {
            start_url: start_url.to_string(),
            pages_fetched: pages.len(),
            total_attempts,
            unique_links_found: all_links.len(),
            max_depth_reached,
            pages,
            failures,
            summary,
        })
    }

    fn should_follow(&self, link: &str, start_host: &str, filters: &LinkFilters) -> bool {
        let Ok(parsed) = Url::parse(link) else {
            return false;
        };
        if self.config.same_domain_only && parsed.host_str() != Some(start_host) {
            return false;
        }
        if !filters.include.is_empty() && !filters.include.iter().any(|re| re.is_match(link)) {
            return false;
        }
        if filters.exclude.iter().any(|re| re.is_match(link)) {
            return false;
        }
        true
    }

    /// Robots rules are fetched once per origin and cached for the call.
    async fn robots_for(
        &self,
        cache: &mut HashMap<String, RobotsRules>,
        url: &Url,
    ) -> RobotsRules {
        let origin = url.origin().ascii_serialization();
        if let Some(rules) = cache.get(&origin) {
            return rules.clone();
        }
        let rules = self.fetch_robots(&origin).await;
        cache.insert(origin, rules.clone());
        rules
    }

    async fn fetch_robots(&self, origin: &str) -> RobotsRules {
        let robots_url = format!("{origin}/robots.txt");
        match self.robots_client.get(&robots_url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => RobotsRules::parse(&body),
                Err(_) => RobotsRules::allow_all(),
            },
            _ => RobotsRules::allow_all(),
        }
    }
}

/// Truncates on a char boundary and marks the cut.
fn cap_content(content: &mut String, max_len: usize) {
    if content.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content.truncate(cut);
    content.push_str("...[truncated]");
}
