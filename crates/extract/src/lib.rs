pub mod classify;
pub mod links;

pub use classify::{classify, ClassifiedPage};
pub use links::{canonicalize_url, extract, ExtractedLink};
