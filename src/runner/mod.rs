pub mod pipeline;
pub mod placeholders;
pub mod requirements;

pub use pipeline::{RunOutcome, RunRequest, RunState, Runner};
