pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, CrawlConfig, LinkToggles};
pub use error::{CrawlError, FetchError, StoreError};
pub use types::*;
