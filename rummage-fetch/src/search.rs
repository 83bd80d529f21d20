//! Search provider seam; backs query resources and traversal seeding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

/// External search engine: a query and a result limit in, ranked hits out.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// Renders hits as the numbered text block returned for query resources.
pub fn format_hits(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results found for: {query}");
    }
    let mut out = format!("Search results for '{query}':\n\n");
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, hit.title));
        out.push_str(&format!("   URL: {}\n", hit.link));
        out.push_str(&format!("   {}\n\n", hit.snippet));
    }
    out
}
