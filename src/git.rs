use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::{BranchType, ErrorCode, Repository};
use tokio_util::sync::CancellationToken;

use crate::util::{combined_output, run_command};
use crate::{flog_debug, flog_trace, flog_warn, Error, Result};

/// Default deadline for a single git invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit status plus stdout and stderr of one git invocation, concatenated.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name, `None` for detached or bare entries.
    pub branch: Option<String>,
}

/// Git access for one repository.
///
/// Structural mutations (worktree add/remove, fetch, checkout) go through the
/// `git` binary so they behave exactly like the user's own git. Read-only
/// queries and metadata pruning use libgit2 and must be called from a
/// blocking context (see [`crate::util::blocking`]).
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
    timeout: Duration,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        flog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self {
            repo_path: root,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Repository name, used to keep pooled worktree paths distinct per repo.
    pub fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Run git in the repository root.
    pub async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<CommandOutput> {
        self.run_in(&self.repo_path, args, cancel).await
    }

    /// Run git in `dir`, racing the command against the deadline and `cancel`.
    ///
    /// A non-zero exit is not an error here; inspect [`CommandOutput::success`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` or `Error::Timeout` when the command is cut
    /// short (the child is killed on drop), or `Error::Io` if git cannot spawn.
    pub async fn run_in(
        &self,
        dir: &Path,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        flog_trace!("git {} (in {})", args.join(" "), dir.display());
        let output = run_command("git", args, dir, self.timeout, cancel).await?;
        Ok(CommandOutput {
            success: output.status.success(),
            output: combined_output(&output),
        })
    }

    /// Like [`run_in`](Self::run_in) but turns a non-zero exit into
    /// `Error::GitCommand` carrying the combined output.
    pub async fn run_checked(
        &self,
        dir: &Path,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let out = self.run_in(dir, args, cancel).await?;
        if !out.success {
            return Err(Error::GitCommand {
                command: args.join(" "),
                output: out.output.trim().to_string(),
            });
        }
        Ok(out.output)
    }

    /// Prune administrative entries for worktrees whose directory is gone.
    /// Returns how many entries were pruned.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let names = repo.worktrees()?;
        let mut pruned = 0;
        for name in names.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            if wt.is_prunable(None).unwrap_or(false) {
                match wt.prune(None) {
                    Ok(()) => pruned += 1,
                    Err(e) => flog_warn!("Worktree prune failed for '{}': {}", name, e),
                }
            }
        }
        flog_debug!("prune_worktrees: pruned {}", pruned);
        Ok(pruned)
    }

    /// True when `path` is a worktree of this repository whose status can
    /// still be read.
    pub fn is_linked_worktree(&self, path: &Path) -> bool {
        let check = || -> Result<bool> {
            let main = self.repo()?;
            let wt = Repository::open(path)?;
            if !same_path(wt.commondir(), main.commondir()) {
                return Ok(false);
            }
            wt.statuses(None)?;
            Ok(true)
        };
        match check() {
            Ok(linked) => linked,
            Err(e) => {
                flog_debug!("is_linked_worktree {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Number of commits reachable from `branch` but not from `base`.
    pub fn commits_ahead(&self, base: &str, branch: &str) -> Result<usize> {
        let repo = self.repo()?;
        let base_oid = repo.revparse_single(base)?.peel_to_commit()?.id();
        let branch_oid = repo.revparse_single(branch)?.peel_to_commit()?.id();
        let (ahead, _behind) = repo.graph_ahead_behind(branch_oid, base_oid)?;
        Ok(ahead)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        found
    }

    /// Delete a local branch. A missing branch or a failed delete is logged,
    /// not returned.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        flog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => {
                if let Err(e) = b.delete() {
                    flog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                flog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => flog_warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }

    /// Full SHA of HEAD in the given working copy.
    pub fn head_commit(path: &Path) -> Result<String> {
        let repo = Repository::open(path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// `<repo>/.git/worktrees`, where linked worktree metadata lives.
    pub fn worktrees_admin_dir(&self) -> Result<PathBuf> {
        Ok(self.repo()?.commondir().join("worktrees"))
    }
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path.trim()),
                branch: None,
            });
        } else if let Some(branch) = line.trim().strip_prefix("branch ") {
            if let Some(entry) = current.as_mut() {
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                entry.branch = Some(short.to_string());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

pub(crate) fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
