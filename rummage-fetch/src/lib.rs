pub mod archive;
pub mod bypass;
pub mod error;
pub mod fetcher;
pub mod normalize;
pub mod proxy;
pub mod result;
pub mod search;

pub use archive::ArchiveRegistry;
pub use bypass::PaywallPolicy;
pub use error::FetchError;
pub use fetcher::{FetchOptions, Fetcher, Resource};
pub use normalize::{ContentKind, Normalizer, OcrEngine, Page};
pub use proxy::{ProxyPool, ProxySource};
pub use result::{BatchItem, FetchOrigin, FetchResult};
pub use search::{SearchHit, SearchProvider};
