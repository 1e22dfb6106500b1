pub mod http;

pub use crawlsite_core::FetchError;
pub use http::{Fetch, FetchOutcome, HttpFetcher};
