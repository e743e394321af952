//! End-to-end epic runs: plan, scope check, sub-issues, sequential
//! execution, all inside a worktree leased from a real pool.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use foreman::config::EpicConfig;
use foreman::core::Task;
use foreman::orchestration::{EpicOrchestrator, EpicOutcome, PlanningOutputParser, SubIssueObserver, SubIssuePr};
use foreman::Error;

use crate::fixtures::{git, CommittingExecutor, MockTracker, ScriptedBackend, TestRepo, TrackerCall};

const MULTI_AREA_PLAN: &str = "Here is the plan:

1. **Add schema migration** - Create the users table and its indexes
2. **Build user API** - Add CRUD handlers in src/api/users.rs
3. **Add signup form** - Create web/forms/signup.tsx wired to the API
";

const SINGLE_AREA_PLAN: &str = "1. Parse flags - edit src/cli/flags.rs
2. Render output - edit src/cli/output.rs
";

#[derive(Default)]
struct PrLog {
    prs: Mutex<Vec<SubIssuePr>>,
}

impl SubIssueObserver for PrLog {
    fn on_pr_created(&self, pr: &SubIssuePr) {
        self.prs.lock().unwrap().push(pr.clone());
    }
}

struct Harness {
    backend: Arc<ScriptedBackend>,
    tracker: Arc<MockTracker>,
    executor: Arc<CommittingExecutor>,
    prs: Arc<PrLog>,
    orchestrator: EpicOrchestrator,
}

fn harness(plan: &str, executor: CommittingExecutor) -> Harness {
    let backend = Arc::new(ScriptedBackend::new(plan));
    let tracker = Arc::new(MockTracker::default());
    let executor = Arc::new(executor);
    let prs = Arc::new(PrLog::default());
    let orchestrator = EpicOrchestrator::new(
        backend.clone(),
        PlanningOutputParser::new(None),
        tracker.clone(),
        executor.clone(),
        EpicConfig::default(),
    )
    .with_observer(prs.clone());
    Harness {
        backend,
        tracker,
        executor,
        prs,
        orchestrator,
    }
}

fn epic() -> Task {
    Task::new("GH-1", "Epic: user accounts", "Users can sign up and manage their profile")
}

// ============ Multi-area epic tests ============

#[tokio::test]
async fn test_epic_runs_sub_issues_in_order() {
    let repo = TestRepo::new();
    let pool = repo.pool(1);
    let cancel = CancellationToken::new();
    pool.warm_pool(&cancel).await.unwrap();
    let slot_path = pool.slots()[0].path.clone();

    let h = harness(MULTI_AREA_PLAN, CommittingExecutor::default());
    let outcome = h.orchestrator.run_epic(&epic(), &pool, &cancel).await.unwrap();

    let issues = match outcome {
        EpicOutcome::Completed { plan, issues } => {
            assert_eq!(plan.subtasks.len(), 3);
            issues
        }
        other => panic!("expected sub-issue execution, got {:?}", other),
    };
    let ids: Vec<_> = issues.iter().map(|i| i.identifier.as_str()).collect();
    assert_eq!(ids, ["GH-201", "GH-202", "GH-203"]);

    // Planning ran read-only inside the leased worktree.
    let requests = h.backend.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].read_only);
    assert_eq!(requests[0].working_dir, slot_path);

    let executed = h.executor.executed.lock().unwrap().clone();
    let titles: Vec<_> = executed.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, ["Add schema migration", "Build user API", "Add signup form"]);
    assert!(executed.iter().all(|t| t.create_pr));

    // Each sub-issue built on the previous one.
    for id in &ids {
        assert!(repo.branch_exists(&format!("foreman/{}", id)));
    }
    assert_eq!(git(&repo.path, &["rev-list", "--count", "main..foreman/GH-203"]), "3");

    let creates: Vec<_> = h
        .tracker
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            TrackerCall::Create { labels, .. } => Some(labels),
            _ => None,
        })
        .collect();
    assert_eq!(creates.len(), 3);
    assert!(creates.iter().all(|l| l == &["foreman".to_string()]));
    assert_eq!(h.tracker.closed(), ["GH-201", "GH-202", "GH-203", "GH-1"]);

    let prs = h.prs.prs.lock().unwrap().clone();
    let numbers: Vec<_> = prs.iter().map(|p| p.pr_number).collect();
    assert_eq!(numbers, [201, 202, 203]);
    assert!(prs.iter().all(|p| p.commit_sha.is_some()));

    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.available(), 1);
    pool.close().await;
}

#[tokio::test]
async fn test_epic_stops_at_first_failed_sub_issue() {
    let repo = TestRepo::new();
    let pool = repo.pool(1);
    let cancel = CancellationToken::new();
    pool.warm_pool(&cancel).await.unwrap();

    let h = harness(
        MULTI_AREA_PLAN,
        CommittingExecutor {
            fail_title: Some("Build user API".to_string()),
            ..Default::default()
        },
    );
    let err = h.orchestrator.run_epic(&epic(), &pool, &cancel).await.unwrap_err();

    match err {
        Error::SubtaskFailed { index, total, title, error } => {
            assert_eq!((index, total), (2, 3));
            assert_eq!(title, "Build user API");
            assert_eq!(error, "agent gave up");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(h.executor.executed.lock().unwrap().len(), 2);
    assert_eq!(h.tracker.closed(), ["GH-201"]);
    assert!(h.tracker.calls().contains(&TrackerCall::Comment {
        issue: "GH-1".to_string(),
        body: "Failed on 2/3: Build user API - Error: agent gave up".to_string(),
    }));

    // The worktree goes back to the pool on failure too.
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.available(), 1);
    pool.close().await;
}

// ============ Consolidation tests ============

#[tokio::test]
async fn test_single_area_plan_runs_as_one_task() {
    let repo = TestRepo::new();
    let pool = repo.pool(0);
    let cancel = CancellationToken::new();

    let h = harness(SINGLE_AREA_PLAN, CommittingExecutor::default());
    let outcome = h.orchestrator.run_epic(&epic(), &pool, &cancel).await.unwrap();

    match outcome {
        EpicOutcome::Consolidated { plan, result } => {
            assert_eq!(plan.subtasks.len(), 2);
            assert!(result.success);
        }
        other => panic!("expected consolidated execution, got {:?}", other),
    }
    assert_eq!(h.tracker.created(), 0);

    let executed = h.executor.executed.lock().unwrap().clone();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].id, "GH-1");
    assert!(executed[0]
        .description
        .starts_with("Users can sign up and manage their profile\n\n## Planned Steps (execute all in sequence)"));
    assert!(executed[0].description.contains("2. **Render output** — edit src/cli/output.rs"));

    // Ephemeral lease: directory and branch are gone afterwards.
    assert_eq!(pool.active_count(), 0);
    assert!(repo.managed_dirs().is_empty());
    assert!(!repo.branch_exists("foreman/GH-1"));
}

#[tokio::test]
async fn test_unparseable_plan_fails_and_releases() {
    let repo = TestRepo::new();
    let pool = repo.pool(1);
    let cancel = CancellationToken::new();
    pool.warm_pool(&cancel).await.unwrap();

    let h = harness("I could not come up with a plan for this.", CommittingExecutor::default());
    let err = h.orchestrator.run_epic(&epic(), &pool, &cancel).await.unwrap_err();

    assert!(matches!(err, Error::PlanParse(_)));
    assert_eq!(h.tracker.created(), 0);
    assert!(h.executor.executed.lock().unwrap().is_empty());
    assert_eq!(pool.available(), 1);
    pool.close().await;
}
