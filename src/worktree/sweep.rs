//! Startup sweep for worktrees orphaned by a crashed run.

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::git::GitOps;
use crate::worktree::WORKTREE_PREFIX;
use crate::{flog, flog_debug, flog_warn, Result};

/// What a sweep did.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    /// Managed directories that still belong to a live worktree.
    pub kept: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl SweepReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Why a managed directory counts as orphaned, if it does.
fn orphan_reason(dir: &Path, admin_dirs: &[PathBuf]) -> Option<&'static str> {
    let git_file = dir.join(".git");
    if !git_file.exists() {
        return Some("no .git");
    }
    let content = std::fs::read_to_string(&git_file).ok()?;
    let gitdir = PathBuf::from(content.trim().strip_prefix("gitdir: ")?.trim());
    if !admin_dirs.iter().any(|admin| gitdir.starts_with(admin)) {
        // Another repository's worktree.
        return None;
    }
    if !gitdir.exists() {
        return Some("metadata gone");
    }
    None
}

/// Remove managed worktree directories under `root` that no longer belong
/// to a live worktree of `git`'s repository, then prune git's metadata.
///
/// A directory is orphaned when it has no `.git` file, or its `.git` file
/// points into this repository's `.git/worktrees` at metadata that no
/// longer exists.
pub async fn sweep_orphans(git: &GitOps, root: &Path, cancel: &CancellationToken) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    let admin = git.worktrees_admin_dir()?;
    let mut admin_dirs = vec![admin.clone()];
    if let Ok(canonical) = admin.canonicalize() {
        admin_dirs.push(canonical);
    }

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };
    let candidates: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(WORKTREE_PREFIX))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();

    for dir in candidates {
        match orphan_reason(&dir, &admin_dirs) {
            Some(reason) => {
                flog_debug!("Orphaned worktree {} ({})", dir.display(), reason);
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => report.removed.push(dir),
                    Err(e) => {
                        flog_warn!("Failed to remove orphan {}: {}", dir.display(), e);
                        report.failed.push((dir, e.to_string()));
                    }
                }
            }
            None => report.kept.push(dir),
        }
    }

    let out = git.run(&["worktree", "prune", "-v"], cancel).await?;
    if !out.success {
        flog_warn!("worktree prune failed: {}", out.output.trim());
    }

    if report.removed_count() > 0 {
        flog!(
            "Swept {} orphaned worktree directories under {}",
            report.removed_count(),
            root.display()
        );
    }
    Ok(report)
}
