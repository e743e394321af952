//! Isolated git worktrees for task execution.
//!
//! Every managed directory lives under one root and is named with
//! [`WORKTREE_PREFIX`], which is how crash leftovers are recognised later:
//!
//! - pooled: `foreman-worktree-pool-<repo>-<index>`
//! - ephemeral: `foreman-worktree-<sanitized-branch-or-task>-<nanos>`

pub mod pool;
pub mod sweep;

use chrono::Utc;

use crate::util::sanitize_name;

pub use pool::{PooledWorktree, WorktreeHandle, WorktreePool};
pub use sweep::{sweep_orphans, SweepReport};

pub const WORKTREE_PREFIX: &str = "foreman-worktree-";
pub const POOL_PREFIX: &str = "foreman-worktree-pool-";

/// Attempts for `git worktree add` when git reports a metadata race.
pub const MAX_CREATE_ATTEMPTS: u32 = 3;

pub fn pool_dir_name(repo_name: &str, index: usize) -> String {
    format!("{}{}-{}", POOL_PREFIX, sanitize_name(repo_name), index)
}

pub fn ephemeral_dir_name(label: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}{}-{}", WORKTREE_PREFIX, sanitize_name(label), nanos)
}

/// Git's concurrent worktree creation can trip over `.git/worktrees/*`
/// metadata; those failures mention `commondir` or `gitdir` and are worth
/// retrying.
pub fn is_transient_race(output: &str) -> bool {
    output.contains("commondir") || output.contains("gitdir")
}
