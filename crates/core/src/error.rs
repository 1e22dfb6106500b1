use thiserror::Error;

/// Typed failure returned by a single fetch attempt. Never raised as a panic —
/// the frontier and validator match on this to decide retry/record behavior.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Option<std::time::Duration>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("gave up after exhausting retries")]
    Giveup,
}

/// Errors surfaced by the hierarchical store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(uuid::Uuid),

    #[error("source not found for {0}")]
    SourceNotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Top-level error for the engine. Only `Invariant` and `Store` variants
/// escalate a run to `Failed` — fetch/validate failures are absorbed and
/// materialized as typed fields on persisted records instead (see §7).
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
