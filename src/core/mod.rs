//! Core domain models shared by every orchestration stage.

pub mod complexity;
pub mod task;

pub use complexity::Complexity;
pub use task::{SourceRef, Task};
