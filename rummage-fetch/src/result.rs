use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which rung of the escalation ladder produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchOrigin {
    Direct,
    Proxy,
    Archive,
}

impl FetchOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOrigin::Direct => "direct",
            FetchOrigin::Proxy => "proxy",
            FetchOrigin::Archive => "archive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    pub status_code: u16,
    pub content: String,
    pub content_type: Option<String>,
    pub fetched_via: FetchOrigin,
    pub truncated: bool,
    /// Bytes left beyond the returned window; page through them with
    /// the offset/length fetch options.
    pub remaining_bytes: usize,
    pub content_error: Option<String>,
    /// Original payload bytes, kept only when the body was not valid text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchResult {
    pub fn new(
        url: String,
        status_code: u16,
        content: String,
        content_type: Option<String>,
        fetched_via: FetchOrigin,
    ) -> Self {
        Self {
            url,
            status_code,
            content,
            content_type,
            fetched_via,
            truncated: false,
            remaining_bytes: 0,
            content_error: None,
            raw: None,
            fetched_at: Utc::now(),
        }
    }
}

/// Per-item outcome of a batch fetch; one item's failure never fails the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub resource: String,
    pub result: Option<FetchResult>,
    pub error: Option<String>,
}

impl BatchItem {
    pub fn ok(resource: String, result: FetchResult) -> Self {
        Self {
            resource,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(resource: String, error: String) -> Self {
        Self {
            resource,
            result: None,
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.result.is_some()
    }
}
