//! Epic orchestration: plan, create sub-issues, execute them one by one,
//! close out.
//!
//! Sub-issues run sequentially on purpose: parallel branches touching the
//! same files conflict on merge. Execution is fail-fast; work already
//! landed by earlier sub-issues is not rolled back.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::EpicConfig;
use crate::core::Task;
use crate::orchestration::backend::{AgentRequest, CodingAgentBackend, ExecutionResult, TaskExecutor};
use crate::orchestration::plan::{CreatedIssue, EpicPlan, PlannedSubtask};
use crate::orchestration::plan_parser::PlanningOutputParser;
use crate::orchestration::scope::ScopeGuard;
use crate::orchestration::tracker::{parse_issue_number, parse_pr_number, IssueTracker};
use crate::util::truncate_title;
use crate::worktree::WorktreePool;
use crate::{flog, flog_debug, flog_warn, Error, Result};

/// Where an epic run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpicPhase {
    Planning,
    SubIssueCreation,
    SequentialExecution { index: usize, total: usize },
    Completion,
    Failed,
}

impl fmt::Display for EpicPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpicPhase::Planning => write!(f, "planning"),
            EpicPhase::SubIssueCreation => write!(f, "creating sub-issues"),
            EpicPhase::SequentialExecution { index, total } => {
                write!(f, "executing {}/{}", index, total)
            }
            EpicPhase::Completion => write!(f, "completing"),
            EpicPhase::Failed => write!(f, "failed"),
        }
    }
}

/// A pull request opened by a sub-issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubIssuePr {
    pub pr_number: u64,
    pub pr_url: String,
    pub issue_number: Option<u64>,
    pub commit_sha: Option<String>,
    pub branch: String,
}

/// Notified whenever a sub-issue produces a pull request.
pub trait SubIssueObserver: Send + Sync {
    fn on_pr_created(&self, pr: &SubIssuePr);
}

/// How an epic run ended.
#[derive(Debug)]
pub enum EpicOutcome {
    /// Plan confined to one code area: executed as a single task.
    Consolidated {
        plan: EpicPlan,
        result: ExecutionResult,
    },
    /// Every sub-issue completed.
    Completed {
        plan: EpicPlan,
        issues: Vec<CreatedIssue>,
    },
}

/// Planning prompt for an epic.
pub fn build_planning_prompt(task: &Task) -> String {
    let mut sb = String::new();
    sb.push_str("You are a software architect planning an implementation.\n\n");
    sb.push_str("Break down this epic task into 3-5 sequential subtasks that can each be completed independently.\n");
    sb.push_str("Each subtask should be a concrete, implementable unit of work.\n\n");

    sb.push_str("## Avoid Single-Package Splits\n\n");
    sb.push_str("If all the work lives in one package or directory, do NOT split it into separate subtasks.\n");
    sb.push_str("Return a SINGLE subtask with the full scope instead. Split only when subtasks touch\n");
    sb.push_str("different packages or directories.\n\n");

    sb.push_str("## Task to Plan\n\n");
    sb.push_str(&format!("**Title:** {}\n\n", task.title));
    if !task.description.is_empty() {
        sb.push_str(&format!("**Description:**\n{}\n\n", task.description));
    }

    sb.push_str("## Output Format\n\n");
    sb.push_str("List each subtask with a number, title, and description:\n\n");
    sb.push_str("1. **Subtask title** - Description of what needs to be done\n");
    sb.push_str("2. **Next subtask** - Its description\n");
    sb.push_str("...\n\n");

    sb.push_str("Focus on:\n");
    sb.push_str("- Clear boundaries between subtasks\n");
    sb.push_str("- Logical ordering (dependencies flow naturally)\n");
    sb.push_str("- Each subtask should be testable\n");
    sb.push_str("- Setup and infrastructure subtasks first\n");
    sb
}

/// Fold a plan back into one description for single-unit execution.
pub fn consolidate_plan(original: &str, subtasks: &[PlannedSubtask]) -> String {
    let mut sb = String::from(original);
    sb.push_str("\n\n## Planned Steps (execute all in sequence)\n\n");
    for st in subtasks {
        sb.push_str(&format!("{}. **{}**", st.order, st.title));
        if !st.description.is_empty() {
            sb.push_str(" — ");
            sb.push_str(&st.description);
        }
        sb.push('\n');
    }
    sb
}

/// Drives one epic from planning to completion.
pub struct EpicOrchestrator {
    backend: Arc<dyn CodingAgentBackend>,
    parser: PlanningOutputParser,
    tracker: Arc<dyn IssueTracker>,
    executor: Arc<dyn TaskExecutor>,
    scope: ScopeGuard,
    config: EpicConfig,
    observer: Option<Arc<dyn SubIssueObserver>>,
}

impl EpicOrchestrator {
    pub fn new(
        backend: Arc<dyn CodingAgentBackend>,
        parser: PlanningOutputParser,
        tracker: Arc<dyn IssueTracker>,
        executor: Arc<dyn TaskExecutor>,
        config: EpicConfig,
    ) -> Self {
        Self {
            backend,
            parser,
            tracker,
            executor,
            scope: ScopeGuard,
            config,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SubIssueObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn enter(&self, task: &Task, phase: EpicPhase) {
        flog!("Epic {}: {}", task.id, phase);
    }

    /// Ask the backend for a plan (read-only) in `working_dir` and parse it.
    pub async fn plan_epic(&self, task: &Task, working_dir: &Path, cancel: &CancellationToken) -> Result<EpicPlan> {
        self.enter(task, EpicPhase::Planning);
        let request = AgentRequest {
            prompt: build_planning_prompt(task),
            working_dir: working_dir.to_path_buf(),
            read_only: true,
        };
        let outcome = self.backend.run(&request, cancel).await?;
        if !outcome.success {
            return Err(Error::Backend(format!(
                "planning failed: {}",
                outcome.error.unwrap_or_default()
            )));
        }
        if outcome.output.trim().is_empty() {
            return Err(Error::Backend("planning returned empty output".to_string()));
        }

        let subtasks = self.parser.parse(&outcome.output, cancel).await?;
        let plan = EpicPlan::new(task.clone(), subtasks, outcome.output);
        for warning in plan.dependency_warnings() {
            flog_warn!("Epic {} plan: {}", task.id, warning);
        }
        flog!("Epic {} planned into {} subtasks", task.id, plan.subtasks.len());
        Ok(plan)
    }

    /// `true` when the plan should run as one task instead of sub-issues.
    pub fn should_consolidate(&self, plan: &EpicPlan) -> bool {
        plan.subtasks.len() < 2 || self.scope.is_single_scope(&plan.parent.description, &plan.subtasks)
    }

    fn issue_body(&self, plan: &EpicPlan, subtask: &PlannedSubtask, created: &HashMap<u32, String>) -> String {
        let mut body = format!("Parent: {}\n\n{}", plan.parent.id, subtask.description);
        let deps: Vec<String> = subtask
            .depends_on
            .iter()
            .filter_map(|order| created.get(order))
            .map(|id| format!("Depends on: `{}`", id))
            .collect();
        if !deps.is_empty() {
            body.push_str("\n\n");
            body.push_str(&deps.join("\n"));
        }
        body
    }

    /// Create one tracker issue per planned subtask, in plan order.
    pub async fn create_sub_issues(
        &self,
        plan: &EpicPlan,
        project: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<CreatedIssue>> {
        if plan.subtasks.is_empty() {
            return Err(Error::Validation("plan has no subtasks to create issues from".to_string()));
        }
        self.enter(&plan.parent, EpicPhase::SubIssueCreation);

        let labels = vec![self.config.issue_label.clone()];
        let mut by_order: HashMap<u32, String> = HashMap::new();
        let mut created = Vec::with_capacity(plan.subtasks.len());

        for subtask in &plan.subtasks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let title = truncate_title(&subtask.title, self.config.title_limit);
            let body = self.issue_body(plan, subtask, &by_order);
            let url = self
                .tracker
                .create_issue(project, &title, &body, &labels, cancel)
                .await
                .map_err(|e| match e {
                    Error::Cancelled => Error::Cancelled,
                    other => Error::Tracker(format!(
                        "failed to create issue for subtask {} ({} created): {}",
                        subtask.order,
                        created.len(),
                        other
                    )),
                })?;
            let number = parse_issue_number(&url);
            let identifier = number.map_or_else(|| url.clone(), |n| format!("GH-{}", n));
            flog!("Created sub-issue {} for subtask {}", identifier, subtask.order);
            by_order.insert(subtask.order, identifier.clone());
            created.push(CreatedIssue {
                identifier,
                number,
                url,
                subtask: subtask.clone(),
            });
        }
        Ok(created)
    }

    async fn comment(&self, project: &Path, issue: &str, body: &str, cancel: &CancellationToken) {
        if let Err(e) = self.tracker.comment(project, issue, body, cancel).await {
            flog_warn!("Failed to comment on {}: {}", issue, e);
        }
    }

    async fn close(&self, project: &Path, issue: &str, body: &str, cancel: &CancellationToken) {
        if let Err(e) = self.tracker.close(project, issue, body, cancel).await {
            flog_warn!("Failed to close {}: {}", issue, e);
        }
    }

    fn child_task(&self, parent: &Task, issue: &CreatedIssue, working_dir: &Path) -> Task {
        let mut child = Task::new(
            issue.identifier.clone(),
            issue.subtask.title.clone(),
            issue.subtask.description.clone(),
        )
        .with_project(working_dir)
        .with_branch(format!("{}{}", self.config.branch_prefix, issue.identifier))
        .with_create_pr(true);
        child.base_branch = parent.base_branch.clone();
        child
    }

    /// Execute sub-issues in order inside `working_dir`, reporting progress
    /// on the parent. Stops at the first failure.
    pub async fn execute_sub_issues(
        &self,
        parent: &Task,
        issues: &[CreatedIssue],
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if issues.is_empty() {
            return Err(Error::Validation("no sub-issues to execute".to_string()));
        }
        let total = issues.len();
        let parent_ref = parent.tracker_ref();

        self.comment(
            working_dir,
            &parent_ref,
            &format!("Starting sequential execution of {} sub-issues", total),
            cancel,
        )
        .await;

        for (i, issue) in issues.iter().enumerate() {
            if cancel.is_cancelled() {
                flog_warn!("Epic {} cancelled before sub-issue {}/{}", parent.id, i + 1, total);
                return Err(Error::Cancelled);
            }
            self.enter(parent, EpicPhase::SequentialExecution { index: i + 1, total });

            let progress = match issue.number {
                Some(n) => format!(
                    "Progress: {}/{} - Starting: **{}** (#{})",
                    i, total, issue.subtask.title, n
                ),
                None => format!("Progress: {}/{} - Starting: **{}**", i, total, issue.subtask.title),
            };
            self.comment(working_dir, &parent_ref, &progress, cancel).await;

            let child = self.child_task(parent, issue, working_dir);
            let failure = match self.executor.execute(&child, working_dir, cancel).await {
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => Some(e.to_string()),
                Ok(result) if !result.success => {
                    Some(result.error.unwrap_or_else(|| "execution failed".to_string()))
                }
                Ok(result) => {
                    self.record_success(parent, issue, &child, &result, working_dir, cancel)
                        .await;
                    None
                }
            };

            if let Some(error) = failure {
                self.enter(parent, EpicPhase::Failed);
                self.comment(
                    working_dir,
                    &parent_ref,
                    &format!(
                        "Failed on {}/{}: {} - Error: {}",
                        i + 1,
                        total,
                        issue.subtask.title,
                        error
                    ),
                    cancel,
                )
                .await;
                return Err(Error::SubtaskFailed {
                    index: i + 1,
                    total,
                    title: issue.subtask.title.clone(),
                    error,
                });
            }
        }

        self.complete(parent, total, working_dir, cancel).await;
        Ok(())
    }

    async fn record_success(
        &self,
        parent: &Task,
        issue: &CreatedIssue,
        child: &Task,
        result: &ExecutionResult,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) {
        if let Some(url) = &result.pr_url {
            match (parse_pr_number(url), &self.observer) {
                (Some(pr_number), Some(observer)) => observer.on_pr_created(&SubIssuePr {
                    pr_number,
                    pr_url: url.clone(),
                    issue_number: issue.number,
                    commit_sha: result.commit_sha.clone(),
                    branch: child.branch.clone(),
                }),
                (None, _) => flog_warn!("No PR number in sub-issue PR URL {}", url),
                (Some(_), None) => {}
            }
        }

        let comment = match &result.pr_url {
            Some(url) => format!("Completed as part of {}\nPR: {}", parent.id, url),
            None => format!("Completed as part of {}", parent.id),
        };
        self.close(working_dir, &issue.identifier, &comment, cancel).await;
        flog_debug!("Sub-issue {} completed", issue.identifier);
    }

    async fn complete(&self, parent: &Task, total: usize, working_dir: &Path, cancel: &CancellationToken) {
        self.enter(parent, EpicPhase::Completion);
        let parent_ref = parent.tracker_ref();
        self.comment(
            working_dir,
            &parent_ref,
            &format!(
                "Completed: {}/{} sub-issues done\n\nAll sub-tasks executed successfully.",
                total, total
            ),
            cancel,
        )
        .await;
        self.close(
            working_dir,
            &parent_ref,
            "All sub-issues completed successfully.",
            cancel,
        )
        .await;
        flog!("Epic {} completed: {} sub-issues", parent.id, total);
    }

    /// Full run: lease a worktree, plan, then either execute the consolidated
    /// plan or create and execute sub-issues. The worktree is released on
    /// every path.
    pub async fn run_epic(&self, task: &Task, pool: &WorktreePool, cancel: &CancellationToken) -> Result<EpicOutcome> {
        let branch = if task.branch.is_empty() {
            format!("{}{}", self.config.branch_prefix, task.id)
        } else {
            task.branch.clone()
        };
        let base = (!task.base_branch.is_empty()).then_some(task.base_branch.as_str());
        let handle = pool.acquire(&task.id, &branch, base, cancel).await?;
        let result = self.run_in(task, handle.path(), cancel).await;
        handle.release().await;
        result
    }

    async fn run_in(&self, task: &Task, working_dir: &Path, cancel: &CancellationToken) -> Result<EpicOutcome> {
        let plan = self.plan_epic(task, working_dir, cancel).await?;

        if self.should_consolidate(&plan) {
            flog!(
                "Epic {}: single-scope plan, executing {} steps as one task",
                task.id,
                plan.subtasks.len()
            );
            let mut single = task.clone().with_project(working_dir);
            single.description = consolidate_plan(&task.description, &plan.subtasks);
            single.branch = String::new();
            let result = self.executor.execute(&single, working_dir, cancel).await?;
            return Ok(EpicOutcome::Consolidated { plan, result });
        }

        let issues = self.create_sub_issues(&plan, working_dir, cancel).await?;
        self.execute_sub_issues(task, &issues, working_dir, cancel).await?;
        Ok(EpicOutcome::Completed { plan, issues })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::backend::AgentOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct PlanBackend {
        output: String,
    }

    #[async_trait]
    impl CodingAgentBackend for PlanBackend {
        fn name(&self) -> &'static str {
            "plan"
        }

        async fn run(&self, request: &AgentRequest, _cancel: &CancellationToken) -> Result<AgentOutcome> {
            assert!(request.read_only);
            Ok(AgentOutcome::succeeded(self.output.clone()))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create { title: String, body: String },
        Comment { issue: String, body: String },
        Close { issue: String, body: String },
    }

    #[derive(Default)]
    struct RecordingTracker {
        calls: Mutex<Vec<Call>>,
        next: Mutex<u64>,
    }

    impl RecordingTracker {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IssueTracker for RecordingTracker {
        async fn create_issue(
            &self,
            _project: &Path,
            title: &str,
            body: &str,
            _labels: &[String],
            _cancel: &CancellationToken,
        ) -> Result<String> {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            self.calls.lock().unwrap().push(Call::Create {
                title: title.to_string(),
                body: body.to_string(),
            });
            Ok(format!("https://github.com/acme/app/issues/{}", 100 + *next))
        }

        async fn comment(&self, _p: &Path, issue: &str, body: &str, _c: &CancellationToken) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Comment {
                issue: issue.to_string(),
                body: body.to_string(),
            });
            Ok(())
        }

        async fn close(&self, _p: &Path, issue: &str, body: &str, _c: &CancellationToken) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Close {
                issue: issue.to_string(),
                body: body.to_string(),
            });
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedExecutor {
        fail_title: Option<String>,
        cancel_after_first: Option<CancellationToken>,
        seen: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, task: &Task, _dir: &Path, _cancel: &CancellationToken) -> Result<ExecutionResult> {
            self.seen.lock().unwrap().push(task.clone());
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            if self.fail_title.as_deref() == Some(task.title.as_str()) {
                return Ok(ExecutionResult {
                    success: false,
                    error: Some("tests failed".to_string()),
                    ..Default::default()
                });
            }
            let n = task.id.trim_start_matches("GH-");
            Ok(ExecutionResult {
                success: true,
                pr_url: Some(format!("https://github.com/acme/app/pull/{}", n)),
                commit_sha: Some("abc123".to_string()),
                ..Default::default()
            })
        }
    }

    #[derive(Default)]
    struct PrRecorder {
        prs: Mutex<Vec<SubIssuePr>>,
    }

    impl SubIssueObserver for PrRecorder {
        fn on_pr_created(&self, pr: &SubIssuePr) {
            self.prs.lock().unwrap().push(pr.clone());
        }
    }

    const PLAN: &str = "1. **Add migration** - Schema changes\n2. **Build API** - REST endpoints\n3. **Add frontend** - React forms";

    fn orchestrator(
        plan: &str,
        tracker: Arc<RecordingTracker>,
        executor: Arc<ScriptedExecutor>,
    ) -> EpicOrchestrator {
        EpicOrchestrator::new(
            Arc::new(PlanBackend {
                output: plan.to_string(),
            }),
            PlanningOutputParser::new(None),
            tracker,
            executor,
            EpicConfig::default(),
        )
    }

    fn parent() -> Task {
        Task::new("GH-1", "Epic: user management", "Full user CRUD")
    }

    fn issues_for(titles: &[&str]) -> Vec<CreatedIssue> {
        titles
            .iter()
            .enumerate()
            .map(|(i, t)| CreatedIssue {
                identifier: format!("GH-{}", 10 + i),
                number: Some(10 + i as u64),
                url: format!("https://github.com/acme/app/issues/{}", 10 + i),
                subtask: PlannedSubtask::new(i as u32 + 1, *t, ""),
            })
            .collect()
    }

    // ============ Prompt tests ============

    #[test]
    fn test_planning_prompt_contents() {
        let prompt = build_planning_prompt(&parent());
        assert!(prompt.contains("**Title:** Epic: user management"));
        assert!(prompt.contains("Full user CRUD"));
        assert!(prompt.contains("Avoid Single-Package Splits"));
        assert!(prompt.contains("1. **Subtask title** - Description"));
    }

    #[test]
    fn test_consolidate_plan() {
        let steps = vec![
            PlannedSubtask::new(1, "Parse flags", "cli"),
            PlannedSubtask::new(2, "Wire output", ""),
        ];
        let text = consolidate_plan("Original", &steps);
        assert!(text.starts_with("Original\n\n## Planned Steps (execute all in sequence)"));
        assert!(text.contains("1. **Parse flags** — cli\n"));
        assert!(text.contains("2. **Wire output**\n"));
    }

    // ============ Planning tests ============

    #[tokio::test]
    async fn test_plan_epic_parses_backend_output() {
        let orch = orchestrator(PLAN, Arc::default(), Arc::default());
        let plan = orch
            .plan_epic(&parent(), Path::new("."), &CancellationToken::new())
            .await
            .unwrap();
        let titles: Vec<_> = plan.subtasks.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, ["Add migration", "Build API", "Add frontend"]);
        assert_eq!(plan.raw_output, PLAN);
        assert!(!orch.should_consolidate(&plan));
    }

    #[tokio::test]
    async fn test_plan_epic_unparseable_output_fails() {
        let orch = orchestrator("I need more information.", Arc::default(), Arc::default());
        let err = orch
            .plan_epic(&parent(), Path::new("."), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlanParse(_)));
    }

    #[tokio::test]
    async fn test_single_directory_plan_consolidates() {
        let plan = "1. Flags - edit cmd/app/flags.go\n2. Output - edit cmd/app/output.go";
        let orch = orchestrator(plan, Arc::default(), Arc::default());
        let plan = orch
            .plan_epic(&parent(), Path::new("."), &CancellationToken::new())
            .await
            .unwrap();
        assert!(orch.should_consolidate(&plan));
    }

    // ============ Sub-issue creation tests ============

    #[tokio::test]
    async fn test_create_sub_issues_bodies_and_dependencies() {
        let tracker = Arc::new(RecordingTracker::default());
        let orch = orchestrator(PLAN, Arc::clone(&tracker), Arc::default());
        let mut steps = vec![
            PlannedSubtask::new(1, "x".repeat(120), "schema"),
            PlannedSubtask::new(2, "Build API", "endpoints"),
        ];
        steps[1].depends_on = vec![1, 7];
        let plan = EpicPlan::new(parent(), steps, "");

        let issues = orch
            .create_sub_issues(&plan, Path::new("."), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(issues[0].identifier, "GH-101");
        assert_eq!(issues[1].number, Some(102));
        let calls = tracker.calls();
        match &calls[0] {
            Call::Create { title, body } => {
                assert_eq!(title.chars().count(), 80);
                assert_eq!(body, "Parent: GH-1\n\nschema");
            }
            other => panic!("unexpected call {:?}", other),
        }
        match &calls[1] {
            Call::Create { body, .. } => {
                assert_eq!(body, "Parent: GH-1\n\nendpoints\n\nDepends on: `GH-101`");
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_sub_issues_empty_plan() {
        let orch = orchestrator(PLAN, Arc::default(), Arc::default());
        let plan = EpicPlan::new(parent(), Vec::new(), "");
        assert!(orch
            .create_sub_issues(&plan, Path::new("."), &CancellationToken::new())
            .await
            .is_err());
    }

    // ============ Execution tests ============

    #[tokio::test]
    async fn test_execute_sub_issues_success_path() {
        let tracker = Arc::new(RecordingTracker::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let observer = Arc::new(PrRecorder::default());
        let orch = orchestrator(PLAN, Arc::clone(&tracker), Arc::clone(&executor))
            .with_observer(Arc::clone(&observer) as Arc<dyn SubIssueObserver>);
        let issues = issues_for(&["A", "B"]);

        orch.execute_sub_issues(&parent(), &issues, Path::new("/work"), &CancellationToken::new())
            .await
            .unwrap();

        let seen = executor.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].id, "GH-10");
        assert_eq!(seen[0].branch, "foreman/GH-10");
        assert!(seen[0].create_pr);
        assert_eq!(seen[0].project_path, Path::new("/work"));

        let prs = observer.prs.lock().unwrap().clone();
        assert_eq!(prs.len(), 2);
        assert_eq!(prs[1].pr_number, 11);
        assert_eq!(prs[1].issue_number, Some(11));
        assert_eq!(prs[1].branch, "foreman/GH-11");

        let calls = tracker.calls();
        assert_eq!(
            calls.first(),
            Some(&Call::Comment {
                issue: "GH-1".to_string(),
                body: "Starting sequential execution of 2 sub-issues".to_string()
            })
        );
        assert!(calls.contains(&Call::Comment {
            issue: "GH-1".to_string(),
            body: "Progress: 1/2 - Starting: **B** (#11)".to_string()
        }));
        assert!(calls.contains(&Call::Close {
            issue: "GH-10".to_string(),
            body: "Completed as part of GH-1\nPR: https://github.com/acme/app/pull/10".to_string()
        }));
        assert_eq!(
            calls.last(),
            Some(&Call::Close {
                issue: "GH-1".to_string(),
                body: "All sub-issues completed successfully.".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_execute_sub_issues_fails_fast() {
        let tracker = Arc::new(RecordingTracker::default());
        let executor = Arc::new(ScriptedExecutor {
            fail_title: Some("B".to_string()),
            ..Default::default()
        });
        let orch = orchestrator(PLAN, Arc::clone(&tracker), Arc::clone(&executor));
        let issues = issues_for(&["A", "B", "C"]);

        let err = orch
            .execute_sub_issues(&parent(), &issues, Path::new("."), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::SubtaskFailed { index, total, title, error } => {
                assert_eq!((index, total), (2, 3));
                assert_eq!(title, "B");
                assert_eq!(error, "tests failed");
            }
            other => panic!("unexpected error {}", other),
        }
        assert_eq!(executor.seen.lock().unwrap().len(), 2);

        let calls = tracker.calls();
        assert!(calls.contains(&Call::Comment {
            issue: "GH-1".to_string(),
            body: "Failed on 2/3: B - Error: tests failed".to_string()
        }));
        assert!(!calls.iter().any(|c| matches!(c, Call::Close { issue, .. } if issue == "GH-1")));
    }

    #[tokio::test]
    async fn test_cancellation_checked_between_sub_issues() {
        let cancel = CancellationToken::new();
        let executor = Arc::new(ScriptedExecutor {
            cancel_after_first: Some(cancel.clone()),
            ..Default::default()
        });
        let orch = orchestrator(PLAN, Arc::default(), Arc::clone(&executor));
        let issues = issues_for(&["A", "B"]);

        let err = orch
            .execute_sub_issues(&parent(), &issues, Path::new("."), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        // The in-flight sub-issue finished; the next one never started.
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }
}
