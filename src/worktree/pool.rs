//! Worktree pool.
//!
//! Two locks, never held together across a git call:
//!
//! - `state` (std mutex) guards bookkeeping: the active map and the slot
//!   arena. It is only held for in-memory updates.
//! - `create_lock` (tokio mutex) serializes structural mutations (`worktree
//!   add`, pool recreation, shutdown). Git races on `.git/worktrees/*` when
//!   several worktrees are added at once.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::WorktreeConfig;
use crate::git::{parse_worktree_list, same_path, CommandOutput, GitOps};
use crate::util::{blocking, sanitize_name};
use crate::worktree::{
    ephemeral_dir_name, is_transient_race, pool_dir_name, MAX_CREATE_ATTEMPTS, POOL_PREFIX,
    WORKTREE_PREFIX,
};
use crate::{flog, flog_debug, flog_warn, Error, Result};

/// One pre-created worktree.
#[derive(Debug, Clone)]
pub struct PooledWorktree {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub in_use: bool,
}

#[derive(Debug, Clone)]
enum Lease {
    /// Slot index in the arena.
    Pooled(usize),
    /// Created for one task; the branch, if any, is deleted on release.
    Ephemeral { branch: Option<String> },
}

/// Shares the handle's `released` flag so bulk cleanup and the handle
/// never both run the release effect.
#[derive(Debug, Clone)]
struct ActiveEntry {
    path: PathBuf,
    lease: Lease,
    released: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    active: HashMap<String, ActiveEntry>,
    /// Fixed-index arena. `None` is a slot whose recreation failed.
    slots: Vec<Option<PooledWorktree>>,
}

struct Inner {
    git: GitOps,
    root: PathBuf,
    pool_size: usize,
    remote: String,
    default_branch: String,
    base_ref: String,
    state: Mutex<Bookkeeping>,
    create_lock: tokio::sync::Mutex<()>,
}

/// Hands out isolated worktrees, reusing pre-warmed ones when available.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct WorktreePool {
    inner: Arc<Inner>,
}

/// A leased worktree. Call [`release`](Self::release) when done; dropping
/// an unreleased handle schedules the release on the current runtime.
pub struct WorktreeHandle {
    path: PathBuf,
    task_id: String,
    lease: Lease,
    released: Arc<AtomicBool>,
    pool: WorktreePool,
}

impl std::fmt::Debug for WorktreeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeHandle")
            .field("path", &self.path)
            .field("task_id", &self.task_id)
            .field("lease", &self.lease)
            .finish()
    }
}

impl WorktreeHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.lease, Lease::Pooled(_))
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Return the worktree. Only the first call has any effect; failures are
    /// logged, never returned.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            flog_debug!("WorktreeHandle::release: {} already released", self.task_id);
            return;
        }
        self.pool.finish(&self.task_id, &self.path, &self.lease).await;
    }
}

impl Drop for WorktreeHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let pool = self.pool.clone();
                let task_id = self.task_id.clone();
                let path = self.path.clone();
                let lease = self.lease.clone();
                rt.spawn(async move { pool.finish(&task_id, &path, &lease).await });
            }
            Err(_) => flog_warn!(
                "Worktree {} dropped outside a runtime; left for the startup sweep",
                self.path.display()
            ),
        }
    }
}

/// Run `attempt` up to [`MAX_CREATE_ATTEMPTS`] times, backing off 10ms per
/// attempt while the output looks like a metadata race. Other failures
/// return immediately.
async fn retry_on_race<F, Fut>(path: &Path, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CommandOutput>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let out = attempt().await?;
        if out.success {
            return Ok(());
        }
        if tries < MAX_CREATE_ATTEMPTS && is_transient_race(&out.output) {
            flog_debug!(
                "worktree add race on attempt {}, retrying: {}",
                tries,
                out.output.trim()
            );
            tokio::time::sleep(Duration::from_millis(10 * u64::from(tries))).await;
            continue;
        }
        return Err(Error::WorktreeCreate {
            path: path.to_path_buf(),
            attempts: tries,
            output: out.output.trim().to_string(),
        });
    }
}

fn lock(state: &Mutex<Bookkeeping>) -> MutexGuard<'_, Bookkeeping> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => flog_warn!("Failed to remove {}: {}", path.display(), e),
    }
}

impl WorktreePool {
    pub fn new(repo: &Path, config: &WorktreeConfig) -> Result<Self> {
        let git = GitOps::new(repo)?.with_timeout(config.command_timeout());
        let root = config.effective_root();
        std::fs::create_dir_all(&root)?;
        flog_debug!(
            "WorktreePool::new repo={} root={} pool_size={}",
            git.repo_path().display(),
            root.display(),
            config.pool_size
        );
        Ok(Self {
            inner: Arc::new(Inner {
                git,
                root,
                pool_size: config.pool_size,
                remote: config.remote.clone(),
                default_branch: config.default_branch.clone(),
                base_ref: config.effective_base_ref(),
                state: Mutex::new(Bookkeeping::default()),
                create_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn git(&self) -> &GitOps {
        &self.inner.git
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Configured pool size.
    pub fn capacity(&self) -> usize {
        self.inner.pool_size
    }

    /// Live pooled slots (at most [`capacity`](Self::capacity)).
    pub fn pooled_count(&self) -> usize {
        lock(&self.inner.state).slots.iter().flatten().count()
    }

    pub fn available(&self) -> usize {
        lock(&self.inner.state)
            .slots
            .iter()
            .flatten()
            .filter(|s| !s.in_use)
            .count()
    }

    pub fn in_use(&self) -> usize {
        lock(&self.inner.state)
            .slots
            .iter()
            .flatten()
            .filter(|s| s.in_use)
            .count()
    }

    /// Leased worktrees, pooled and ephemeral.
    pub fn active_count(&self) -> usize {
        lock(&self.inner.state).active.len()
    }

    pub fn slots(&self) -> Vec<PooledWorktree> {
        lock(&self.inner.state).slots.iter().flatten().cloned().collect()
    }

    fn pool_path(&self, index: usize) -> PathBuf {
        self.inner
            .root
            .join(pool_dir_name(&self.inner.git.repo_name(), index))
    }

    /// Pre-create pooled worktrees up to capacity. Individual failures are
    /// logged and skipped, leaving the pool smaller.
    pub async fn warm_pool(&self, cancel: &CancellationToken) -> Result<usize> {
        if self.inner.pool_size == 0 {
            return Ok(0);
        }
        let _guard = self.inner.create_lock.lock().await;

        let missing: Vec<usize> = {
            let mut state = lock(&self.inner.state);
            if state.slots.len() < self.inner.pool_size {
                state.slots.resize(self.inner.pool_size, None);
            }
            (0..self.inner.pool_size)
                .filter(|&i| state.slots[i].is_none())
                .collect()
        };
        flog!(
            "Warming worktree pool: {} of {} slots to create",
            missing.len(),
            self.inner.pool_size
        );

        for index in missing {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.create_pooled(index, cancel).await {
                Ok(slot) => lock(&self.inner.state).slots[index] = Some(slot),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => flog_warn!("Failed to create pooled worktree {}: {}", index, e),
            }
        }

        let created = self.pooled_count();
        flog!("Worktree pool warmed: {}/{}", created, self.inner.pool_size);
        Ok(created)
    }

    /// Create the pooled worktree for `index`. Caller holds `create_lock`.
    async fn create_pooled(&self, index: usize, cancel: &CancellationToken) -> Result<PooledWorktree> {
        let path = self.pool_path(index);
        remove_dir(&path).await;
        self.prune().await;

        let fetch = self
            .inner
            .git
            .run(&["fetch", &self.inner.remote, &self.inner.default_branch], cancel)
            .await?;
        if !fetch.success {
            flog_debug!("fetch before pool create failed: {}", fetch.output.trim());
        }

        let p = path_str(&path);
        self.add_worktree(&path, &["worktree", "add", "--detach", &p, &self.inner.base_ref], cancel)
            .await?;
        Ok(PooledWorktree {
            path,
            created_at: Utc::now(),
            in_use: false,
        })
    }

    /// `git worktree add` with retry on metadata races.
    async fn add_worktree(&self, path: &Path, args: &[&str], cancel: &CancellationToken) -> Result<()> {
        let git = &self.inner.git;
        retry_on_race(path, move || git.run(args, cancel)).await
    }

    /// Lease a worktree with `branch` checked out from `base` (the pool's base
    /// ref when `None`). Uses a free pooled slot if there is one, otherwise
    /// creates an ephemeral worktree.
    pub async fn acquire(
        &self,
        task_id: &str,
        branch: &str,
        base: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WorktreeHandle> {
        let base_ref = base.unwrap_or(&self.inner.base_ref).to_string();

        let claimed = {
            let mut state = lock(&self.inner.state);
            state
                .slots
                .iter_mut()
                .enumerate()
                .find_map(|(i, slot)| match slot {
                    Some(s) if !s.in_use => {
                        s.in_use = true;
                        Some((i, s.path.clone()))
                    }
                    _ => None,
                })
        };

        if let Some((index, path)) = claimed {
            flog!("Acquired pooled worktree {} for {} ({})", index, task_id, branch);
            match self.prepare_slot(&path, branch, &base_ref, cancel).await {
                Ok(()) => return Ok(self.register(task_id, path, Lease::Pooled(index))),
                Err(e) => {
                    self.mark_free(index);
                    if matches!(e, Error::Cancelled) {
                        return Err(e);
                    }
                    flog_warn!(
                        "Failed to prepare pooled worktree {}, falling back to ephemeral: {}",
                        path.display(),
                        e
                    );
                }
            }
        } else {
            flog_debug!("No free pooled worktree for {}, creating ephemeral", task_id);
        }

        self.create_ephemeral(task_id, branch, &base_ref, cancel).await
    }

    /// Reset a pooled slot onto a fresh branch from `base_ref`.
    async fn prepare_slot(
        &self,
        path: &Path,
        branch: &str,
        base_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let git = &self.inner.git;
        let fetch = git
            .run_in(path, &["fetch", &self.inner.remote, &self.inner.default_branch], cancel)
            .await?;
        if !fetch.success {
            flog_debug!("fetch in pooled worktree failed: {}", fetch.output.trim());
        }
        git.run_checked(path, &["clean", "-fd"], cancel).await?;
        git.run_checked(path, &["reset", "--hard", base_ref], cancel).await?;
        git.run_checked(path, &["checkout", "-B", branch, base_ref], cancel)
            .await?;
        Ok(())
    }

    /// Create a worktree on `branch` (force-created or reset from `base_ref`)
    /// outside the pool.
    pub async fn create_ephemeral(
        &self,
        task_id: &str,
        branch: &str,
        base_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<WorktreeHandle> {
        let _guard = self.inner.create_lock.lock().await;

        let fetch = self
            .inner
            .git
            .run(&["fetch", &self.inner.remote, &self.inner.default_branch], cancel)
            .await?;
        if !fetch.success {
            flog_warn!(
                "Failed to fetch {}/{} before worktree creation: {}",
                self.inner.remote,
                self.inner.default_branch,
                fetch.output.trim()
            );
        }

        self.cleanup_stale_for_branch(branch, cancel).await?;

        let path = self.inner.root.join(ephemeral_dir_name(branch));
        let p = path_str(&path);
        self.add_worktree(&path, &["worktree", "add", "-B", branch, &p, base_ref], cancel)
            .await?;

        flog!("Created ephemeral worktree {} for {}", path.display(), task_id);
        Ok(self.register(
            task_id,
            path,
            Lease::Ephemeral {
                branch: Some(branch.to_string()),
            },
        ))
    }

    /// Ephemeral worktree in detached HEAD state at the repository's HEAD.
    pub async fn create_detached(&self, task_id: &str, cancel: &CancellationToken) -> Result<WorktreeHandle> {
        let _guard = self.inner.create_lock.lock().await;
        let path = self.inner.root.join(ephemeral_dir_name(task_id));
        let p = path_str(&path);
        self.add_worktree(&path, &["worktree", "add", "--detach", &p, "HEAD"], cancel)
            .await?;
        Ok(self.register(task_id, path, Lease::Ephemeral { branch: None }))
    }

    /// Record the lease as active and hand it out.
    fn register(&self, task_id: &str, path: PathBuf, lease: Lease) -> WorktreeHandle {
        let released = Arc::new(AtomicBool::new(false));
        lock(&self.inner.state).active.insert(
            task_id.to_string(),
            ActiveEntry {
                path: path.clone(),
                lease: lease.clone(),
                released: Arc::clone(&released),
            },
        );
        WorktreeHandle {
            path,
            task_id: task_id.to_string(),
            lease,
            released,
            pool: self.clone(),
        }
    }

    fn mark_free(&self, index: usize) {
        if let Some(Some(slot)) = lock(&self.inner.state).slots.get_mut(index) {
            slot.in_use = false;
        }
    }

    fn active_paths(&self) -> Vec<PathBuf> {
        lock(&self.inner.state)
            .active
            .values()
            .map(|e| e.path.clone())
            .collect()
    }

    async fn prune(&self) {
        let git = self.inner.git.clone();
        if let Err(e) = blocking(move || git.prune_worktrees()).await {
            flog_warn!("worktree prune failed: {}", e);
        }
    }

    async fn force_remove(&self, path: &Path, cancel: &CancellationToken) {
        let p = path_str(path);
        match self
            .inner
            .git
            .run(&["worktree", "remove", "--force", &p], cancel)
            .await
        {
            Ok(out) if !out.success => {
                flog_debug!("worktree remove {}: {}", p, out.output.trim())
            }
            Err(e) => flog_debug!("worktree remove {}: {}", p, e),
            Ok(_) => {}
        }
        remove_dir(path).await;
    }

    /// Clear leftovers of a crashed run that still hold `branch`. Caller
    /// holds `create_lock`.
    async fn cleanup_stale_for_branch(&self, branch: &str, cancel: &CancellationToken) -> Result<()> {
        let git = &self.inner.git;
        git.run(&["worktree", "prune", "-v"], cancel).await?;

        let active = self.active_paths();
        let is_active = |p: &Path| active.iter().any(|a| same_path(a, p));
        let branch_safe = sanitize_name(branch);

        let leftovers: Vec<PathBuf> = match std::fs::read_dir(&self.inner.root) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    name.starts_with(WORKTREE_PREFIX)
                        && !name.starts_with(POOL_PREFIX)
                        && name.contains(&branch_safe)
                })
                .map(|entry| entry.path())
                .filter(|path| path.is_dir() && !is_active(path))
                .collect(),
            Err(e) => {
                flog_debug!("read_dir {}: {}", self.inner.root.display(), e);
                Vec::new()
            }
        };
        for path in leftovers {
            flog!("Removing stale worktree directory {}", path.display());
            self.force_remove(&path, cancel).await;
        }

        let listing = git.run(&["worktree", "list", "--porcelain"], cancel).await?;
        if listing.success {
            let stale = parse_worktree_list(&listing.output)
                .into_iter()
                .find(|wt| wt.branch.as_deref() == Some(branch));
            if let Some(wt) = stale {
                if !same_path(&wt.path, git.repo_path()) && !is_active(&wt.path) {
                    flog!("Removing stale worktree {} holding {}", wt.path.display(), branch);
                    self.force_remove(&wt.path, cancel).await;
                }
            }
        }

        let ops = git.clone();
        let base = self.inner.default_branch.clone();
        let name = branch.to_string();
        let deleted = blocking(move || {
            if !ops.branch_exists(&name)? {
                return Ok(false);
            }
            if ops.commits_ahead(&base, &name)? == 0 {
                ops.delete_branch(&name)?;
                return Ok(true);
            }
            Ok(false)
        })
        .await;
        match deleted {
            Ok(true) => flog_debug!("Deleted stale branch {} (no commits ahead)", branch),
            Ok(false) => {}
            Err(e) => flog_debug!("Stale branch check for {}: {}", branch, e),
        }

        self.prune().await;
        Ok(())
    }

    /// Release path shared by [`WorktreeHandle::release`] and drop.
    async fn finish(&self, task_id: &str, path: &Path, lease: &Lease) {
        lock(&self.inner.state).active.remove(task_id);
        // Release must complete even when the caller's work was cancelled.
        let cancel = CancellationToken::new();
        match lease {
            Lease::Pooled(index) => self.release_slot(*index, path, &cancel).await,
            Lease::Ephemeral { branch } => {
                self.force_remove(path, &cancel).await;
                self.prune().await;
                if let Some(branch) = branch {
                    let git = self.inner.git.clone();
                    let name = branch.clone();
                    if let Err(e) = blocking(move || git.delete_branch(&name)).await {
                        flog_warn!("Failed to delete branch {}: {}", branch, e);
                    }
                }
                flog_debug!("Released ephemeral worktree {}", path.display());
            }
        }
    }

    async fn validate_slot(&self, path: &Path) -> bool {
        if !path.is_dir() || !path.join(".git").exists() {
            return false;
        }
        let git = self.inner.git.clone();
        let p = path.to_path_buf();
        blocking(move || Ok(git.is_linked_worktree(&p)))
            .await
            .unwrap_or(false)
    }

    fn slot_tracked(&self, index: usize) -> bool {
        lock(&self.inner.state).slots.get(index).is_some()
    }

    /// Remove a pooled worktree whose slot no longer exists because the pool
    /// was closed while it was leased.
    async fn discard_untracked(&self, index: usize, path: &Path, cancel: &CancellationToken) {
        flog_debug!(
            "Pooled worktree {} released after close, removing {}",
            index,
            path.display()
        );
        self.force_remove(path, cancel).await;
        self.prune().await;
    }

    async fn release_slot(&self, index: usize, path: &Path, cancel: &CancellationToken) {
        if !self.slot_tracked(index) {
            self.discard_untracked(index, path, cancel).await;
            return;
        }
        if self.validate_slot(path).await {
            // Detach so the task branch is free for other worktrees.
            if let Err(e) = self
                .inner
                .git
                .run_checked(path, &["checkout", "--detach"], cancel)
                .await
            {
                flog_debug!("detach on release of {}: {}", path.display(), e);
            }
            self.mark_free(index);
            flog_debug!("Released pooled worktree {}", index);
            return;
        }

        flog_warn!(
            "Released worktree {} failed validation, recreating",
            path.display()
        );
        let _guard = self.inner.create_lock.lock().await;
        // `close` may have drained the pool while we waited for the lock.
        if !self.slot_tracked(index) {
            self.discard_untracked(index, path, cancel).await;
            return;
        }
        remove_dir(path).await;
        self.prune().await;
        let replacement = match self.create_pooled(index, cancel).await {
            Ok(slot) => Some(slot),
            Err(e) => {
                flog_warn!("Failed to recreate pooled worktree {}: {}", index, e);
                None
            }
        };
        if let Some(slot) = lock(&self.inner.state).slots.get_mut(index) {
            *slot = replacement;
        }
    }

    /// Release every ephemeral worktree still leased, deleting its branch.
    /// Their handles become no-ops. Pooled slots are left to
    /// [`close`](Self::close).
    pub async fn cleanup_all(&self) -> usize {
        let ephemeral: Vec<(String, ActiveEntry)> = lock(&self.inner.state)
            .active
            .iter()
            .filter(|(_, e)| matches!(e.lease, Lease::Ephemeral { .. }))
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        let mut cleaned = 0;
        for (task_id, entry) in &ephemeral {
            if entry.released.swap(true, Ordering::SeqCst) {
                continue;
            }
            self.finish(task_id, &entry.path, &entry.lease).await;
            cleaned += 1;
        }
        cleaned
    }

    /// Drain the pool, removing every pooled worktree.
    pub async fn close(&self) {
        let _guard = self.inner.create_lock.lock().await;
        let slots: Vec<PooledWorktree> = {
            let mut state = lock(&self.inner.state);
            std::mem::take(&mut state.slots).into_iter().flatten().collect()
        };
        if slots.is_empty() {
            return;
        }
        flog!("Draining worktree pool: {} worktrees", slots.len());
        let cancel = CancellationToken::new();
        for slot in &slots {
            self.force_remove(&slot.path, &cancel).await;
        }
        self.prune().await;
        flog!("Worktree pool drained");
    }
}
