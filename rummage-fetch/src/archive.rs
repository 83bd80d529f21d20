//! Archive mirror registry, the last rung of the bypass ladder.

/// Mirror prefixes tried in priority order; the target URL is appended.
pub const DEFAULT_ARCHIVE_PREFIXES: &[&str] = &[
    "https://archive.is/?url=",
    "https://12ft.io/proxy?q=",
    "https://webcache.googleusercontent.com/search?q=cache:",
];

#[derive(Debug, Clone)]
pub struct ArchiveRegistry {
    prefixes: Vec<String>,
}

impl Default for ArchiveRegistry {
    fn default() -> Self {
        Self::new(
            DEFAULT_ARCHIVE_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl ArchiveRegistry {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn empty() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Fallback URLs for a target, in priority order.
    pub fn candidates(&self, url: &str) -> Vec<String> {
        self.prefixes.iter().map(|p| format!("{p}{url}")).collect()
    }
}
