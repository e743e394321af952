//! Orchestration layer for foreman.
//!
//! Classification decides how a task runs; decomposition and epic planning
//! split it; the backend and executor run the pieces; the retry scheduler
//! brings rate-limited work back once the limit resets.

pub mod backend;
pub mod complexity;
pub mod decompose;
pub mod epic;
pub mod judgment;
pub mod plan;
pub mod plan_parser;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod scope;
pub mod tracker;

pub use backend::{
    AgentOutcome, AgentRequest, BackendExecutor, ClaudeBackend, CodingAgentBackend, ExecutionResult, TaskExecutor,
};
pub use complexity::{detect_complexity, ComplexityClassifier, SignalMetrics};
pub use decompose::{DecomposeResult, SplitStrategy, TaskDecomposer};
pub use epic::{EpicOrchestrator, EpicOutcome, EpicPhase, SubIssueObserver, SubIssuePr};
pub use judgment::{AnthropicJudge, JudgmentService};
pub use plan::{CreatedIssue, DependencyWarning, EpicPlan, PlannedSubtask};
pub use plan_parser::{PlanningOutputParser, RegexExtractor, StructuredExtractor, SubtaskExtractor};
pub use queue::{PendingRetry, TaskQueue, MAX_RETRY_ATTEMPTS};
pub use ratelimit::{is_rate_limit_error, parse_rate_limit_error, RateLimitInfo};
pub use retry::{RetryHandler, RetryScheduler, SchedulerStatus};
pub use scope::ScopeGuard;
pub use tracker::{GhTracker, IssueTracker};
