//! User-agent rotation and paywall detection policy.

use rand::seq::SliceRandom;

/// Browser user-agents rotated across fetch attempts.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
];

/// Default paywall signature substrings, matched case-insensitively.
pub const DEFAULT_PAYWALL_INDICATORS: &[&str] = &[
    "paywall",
    "sign in to read",
    "become a member",
    "login to continue",
    "subscribe to continue",
    "subscriber only",
    "premium article",
    "registration required",
];

pub fn rotate_user_agent() -> &'static str {
    DEFAULT_USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(DEFAULT_USER_AGENTS[0])
}

/// Statuses that trigger the bypass ladder.
pub fn is_blocked_status(status: u16) -> bool {
    matches!(status, 403 | 429)
}

/// Swappable paywall-signature policy. Indicators are plain substrings,
/// lowercased once at construction.
#[derive(Debug, Clone)]
pub struct PaywallPolicy {
    indicators: Vec<String>,
}

impl Default for PaywallPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_PAYWALL_INDICATORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl PaywallPolicy {
    pub fn new(indicators: Vec<String>) -> Self {
        Self {
            indicators: indicators.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// A policy that never flags content as paywalled.
    pub fn disabled() -> Self {
        Self {
            indicators: Vec::new(),
        }
    }

    pub fn detect(&self, content: &str) -> bool {
        if self.indicators.is_empty() {
            return false;
        }
        let lower = content.to_lowercase();
        self.indicators.iter().any(|ind| lower.contains(ind))
    }
}
