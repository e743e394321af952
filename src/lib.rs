pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod util;
pub mod worktree;

pub use error::{Error, Result};
