pub mod codec;
pub mod store;

pub use store::{RunBundle, Store};
