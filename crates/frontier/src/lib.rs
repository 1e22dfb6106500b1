pub mod adaptive;
pub mod frontier;

pub use adaptive::{AdaptiveBatch, RollingErrorRate};
pub use frontier::{CrawlJob, Frontier, UrlState};
