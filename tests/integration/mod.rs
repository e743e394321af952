//! Integration test suite for foreman.
//!
//! These tests drive the public API against real git repositories created
//! in temporary directories. Agents, trackers and the judgment service are
//! mocked, so no network access or agent binary is needed.
//!
//! # Test Categories
//!
//! - `worktree_pool`: pooling, overflow, validation, stale cleanup, sweeps
//! - `epic_flow`: planning through sub-issue execution in a leased worktree
//! - `task_flow`: classification, decomposition and rate-limit retry

mod fixtures;

mod epic_flow;
mod task_flow;
mod worktree_pool;
