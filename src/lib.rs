pub mod driver;

pub use driver::{RunDriver, RunHandle, RunOutcome, RunStatus};
