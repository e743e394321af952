//! Worktree pool behaviour against a real repository.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use foreman::worktree::{sweep_orphans, WorktreeHandle};

use crate::fixtures::{current_branch, git, TestRepo};

// ============ Pool capacity tests ============

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overflow_beyond_pool_is_ephemeral() {
    let repo = TestRepo::new();
    let pool = repo.pool(2);
    let cancel = CancellationToken::new();
    assert_eq!(pool.warm_pool(&cancel).await.unwrap(), 2);
    assert_eq!(pool.available(), 2);

    let results = futures::future::join_all((0..3).map(|i| {
        let pool = pool.clone();
        let cancel = cancel.clone();
        async move {
            pool.acquire(&format!("T-{}", i), &format!("foreman/T-{}", i), None, &cancel)
                .await
        }
    }))
    .await;
    let handles: Vec<WorktreeHandle> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(handles.iter().filter(|h| h.is_pooled()).count(), 2);
    assert_eq!(pool.available(), 0);
    assert_eq!(pool.in_use(), 2);
    assert_eq!(pool.active_count(), 3);

    let paths: HashSet<PathBuf> = handles.iter().map(|h| h.path().to_path_buf()).collect();
    assert_eq!(paths.len(), 3, "every lease gets its own directory");
    for h in &handles {
        let expected = format!("foreman/{}", h.task_id());
        assert_eq!(current_branch(h.path()), expected);
    }

    let ephemeral = handles.iter().find(|h| !h.is_pooled()).unwrap();
    let ephemeral_path = ephemeral.path().to_path_buf();
    let ephemeral_branch = format!("foreman/{}", ephemeral.task_id());

    for h in &handles {
        h.release().await;
    }
    assert_eq!(pool.available(), 2);
    assert_eq!(pool.active_count(), 0);
    assert!(!ephemeral_path.exists());
    assert!(!repo.branch_exists(&ephemeral_branch));
    assert_eq!(repo.managed_dirs().len(), 2);

    pool.close().await;
    assert!(repo.managed_dirs().is_empty());
    assert_eq!(repo.worktree_paths().len(), 1);
}

#[tokio::test]
async fn test_released_slot_is_reset_for_next_task() {
    let repo = TestRepo::new();
    let pool = repo.pool(1);
    let cancel = CancellationToken::new();
    pool.warm_pool(&cancel).await.unwrap();

    let first = pool.acquire("T-1", "foreman/a", None, &cancel).await.unwrap();
    let slot_path = first.path().to_path_buf();
    std::fs::write(slot_path.join("scratch.txt"), "leftover").unwrap();
    first.release().await;
    first.release().await;
    // Releasing detaches, so the branch is free again.
    assert_eq!(current_branch(&slot_path), "");

    let second = pool.acquire("T-2", "foreman/a", None, &cancel).await.unwrap();
    assert!(second.is_pooled());
    assert_eq!(second.path(), slot_path);
    assert_eq!(current_branch(second.path()), "foreman/a");
    assert!(!second.path().join("scratch.txt").exists());

    second.release().await;
    pool.close().await;
}

#[tokio::test]
async fn test_broken_slot_is_recreated_on_release() {
    let repo = TestRepo::new();
    let pool = repo.pool(1);
    let cancel = CancellationToken::new();
    pool.warm_pool(&cancel).await.unwrap();

    let handle = pool.acquire("T-1", "foreman/broken", None, &cancel).await.unwrap();
    let slot_path = handle.path().to_path_buf();
    std::fs::remove_dir_all(&slot_path).unwrap();

    handle.release().await;

    assert_eq!(pool.pooled_count(), 1);
    assert_eq!(pool.available(), 1);
    let slots = pool.slots();
    assert_eq!(slots[0].path, slot_path);
    assert!(slot_path.join(".git").exists());

    pool.close().await;
}

#[tokio::test]
async fn test_cleanup_all_only_touches_ephemeral_leases() {
    let repo = TestRepo::new();
    let pool = repo.pool(1);
    let cancel = CancellationToken::new();
    pool.warm_pool(&cancel).await.unwrap();

    let pooled = pool.acquire("T-1", "foreman/one", None, &cancel).await.unwrap();
    let ephemeral = pool.acquire("T-2", "foreman/two", None, &cancel).await.unwrap();
    assert!(pooled.is_pooled());
    assert!(!ephemeral.is_pooled());

    assert_eq!(pool.cleanup_all().await, 1);
    assert!(!ephemeral.path().exists());
    assert!(!repo.branch_exists("foreman/two"));
    assert!(ephemeral.is_released());
    assert!(pooled.path().exists());
    assert!(!pooled.is_released());
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.cleanup_all().await, 0);

    // The handle's own release must not run the cleanup a second time.
    git(&repo.path, &["branch", "foreman/two", "main"]);
    ephemeral.release().await;
    assert!(repo.branch_exists("foreman/two"));

    pooled.release().await;
    assert_eq!(pool.available(), 1);
    pool.close().await;
}

#[tokio::test]
async fn test_release_after_close_leaves_nothing_behind() {
    let repo = TestRepo::new();
    let pool = repo.pool(1);
    let cancel = CancellationToken::new();
    pool.warm_pool(&cancel).await.unwrap();

    let handle = pool.acquire("T-1", "foreman/late", None, &cancel).await.unwrap();
    assert!(handle.is_pooled());

    pool.close().await;
    assert!(repo.managed_dirs().is_empty());

    handle.release().await;
    assert!(repo.managed_dirs().is_empty());
    assert_eq!(pool.pooled_count(), 0);
    assert_eq!(pool.active_count(), 0);
    assert_eq!(repo.worktree_paths().len(), 1, "only the main checkout remains");
}

// ============ Stale state tests ============

#[tokio::test]
async fn test_stale_worktree_holding_branch_is_cleared() {
    let repo = TestRepo::new();
    let stale = repo.root().join("foreman-worktree-foreman-stale-1");
    git(
        &repo.path,
        &["worktree", "add", "-b", "foreman/stale", stale.to_str().unwrap(), "main"],
    );
    assert!(stale.exists());

    let pool = repo.pool(0);
    let handle = pool
        .acquire("T-9", "foreman/stale", None, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!stale.exists());
    assert_ne!(handle.path(), stale);
    assert_eq!(current_branch(handle.path()), "foreman/stale");

    handle.release().await;
    assert!(!repo.branch_exists("foreman/stale"));
}

#[tokio::test]
async fn test_sweep_removes_only_orphans() {
    let repo = TestRepo::new();
    let root = repo.root().to_path_buf();
    let cancel = CancellationToken::new();

    // No .git at all.
    let junk = root.join("foreman-worktree-junk-1");
    std::fs::create_dir_all(&junk).unwrap();

    // Metadata deleted out from under a real worktree.
    let dead = root.join("foreman-worktree-dead-2");
    git(&repo.path, &["worktree", "add", "--detach", dead.to_str().unwrap(), "main"]);
    std::fs::remove_dir_all(repo.path.join(".git/worktrees/foreman-worktree-dead-2")).unwrap();

    // Unmanaged directory.
    let other = root.join("someone-else");
    std::fs::create_dir_all(&other).unwrap();

    let pool = repo.pool(0);
    let live = pool.create_detached("live", &cancel).await.unwrap();

    let report = sweep_orphans(&repo.git_ops().unwrap(), &root, &cancel).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.removed_count(), 2);
    assert!(report.removed.contains(&junk));
    assert!(report.removed.contains(&dead));
    assert_eq!(report.kept, vec![live.path().to_path_buf()]);
    assert!(!junk.exists());
    assert!(!dead.exists());
    assert!(other.exists());
    assert!(live.path().exists());

    live.release().await;
    assert!(repo.managed_dirs().is_empty());
}
