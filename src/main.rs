use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use foreman::config::Config;
use foreman::core::Task;
use foreman::git::GitOps;
use foreman::orchestration::complexity::extract_signal_metrics;
use foreman::orchestration::{
    parse_rate_limit_error, AnthropicJudge, BackendExecutor, ClaudeBackend, ComplexityClassifier, EpicOrchestrator,
    EpicOutcome, GhTracker, JudgmentService, PlanningOutputParser, ScopeGuard, SubIssueObserver, SubIssuePr,
    TaskDecomposer,
};
use foreman::worktree::{sweep_orphans, WorktreePool};
use foreman::{flog, flog_warn, Error, Result};

/// Foreman - plans, splits and runs coding-agent work in isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1       Enable debug logging (alternative to --debug)\n    ANTHROPIC_API_KEY     Enables LLM classification and structured plan parsing")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Task given on the command line.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct TaskArgs {
    /// Task title
    #[arg(long)]
    pub title: String,

    /// Task description
    #[arg(long, conflicts_with = "file")]
    pub description: Option<String>,

    /// Read the description from a file ("-" for stdin)
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Task identifier (generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Task label, repeatable
    #[arg(long = "label")]
    pub labels: Vec<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Classify a task's complexity
    Classify {
        #[command(flatten)]
        task: TaskArgs,

        /// Skip the judgment service even when an API key is set
        #[arg(long)]
        heuristic: bool,
    },

    /// Split a task into subtasks from its description's structure
    Decompose {
        #[command(flatten)]
        task: TaskArgs,
    },

    /// Parse planner output into ordered subtasks
    ParsePlan {
        /// File with planner output (stdin when omitted)
        file: Option<PathBuf>,

        /// Regex extraction only
        #[arg(long)]
        heuristic: bool,
    },

    /// Extract the reset time from a rate-limit error message
    Ratelimit {
        /// The error message
        message: String,
    },

    /// Remove worktree directories orphaned by a crashed run
    Sweep {
        /// Repository (current directory when omitted)
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Plan an epic and execute it as sequential sub-issues
    Epic {
        #[command(flatten)]
        task: TaskArgs,

        /// Repository (current directory when omitted)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Print the plan and the consolidation decision without executing
        #[arg(long)]
        plan_only: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    foreman::log::init(cli.debug);
    if foreman::log::is_debug() {
        flog!("Foreman starting (debug mode enabled)");
    }

    let config = Config::load()?;

    match cli.command {
        Command::Classify { task, heuristic } => run_classify(&config, task, heuristic),
        Command::Decompose { task } => run_decompose(&config, task),
        Command::ParsePlan { file, heuristic } => run_parse_plan(&config, file, heuristic),
        Command::Ratelimit { message } => run_ratelimit(&message),
        Command::Sweep { repo } => run_sweep(&config, repo),
        Command::Epic { task, repo, plan_only } => run_epic(&config, task, repo, plan_only),
    }
}

fn read_input(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        Ok(std::fs::read_to_string(file)?)
    }
}

fn build_task(args: TaskArgs) -> Result<Task> {
    let description = match (&args.description, &args.file) {
        (Some(d), _) => d.clone(),
        (None, Some(file)) => read_input(file)?,
        (None, None) => String::new(),
    };
    let id = args
        .id
        .unwrap_or_else(|| format!("TASK-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    Ok(Task::new(id, args.title, description).with_labels(args.labels))
}

fn repo_path(repo: Option<PathBuf>) -> Result<PathBuf> {
    let path = match repo {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    // Validate it is a repository before doing anything else.
    GitOps::new(&path)?;
    Ok(path)
}

/// Judgment service from the environment; `None` when disabled or unset.
fn judge(config: &Config, disabled: bool) -> Result<Option<Arc<dyn JudgmentService>>> {
    if disabled {
        return Ok(None);
    }
    Ok(AnthropicJudge::from_env(&config.judgment)?.map(|j| Arc::new(j) as Arc<dyn JudgmentService>))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flog_warn!("Interrupted, cancelling");
            eprintln!("\nInterrupted, cancelling...");
            token.cancel();
        }
    });
}

fn run_classify(config: &Config, args: TaskArgs, heuristic: bool) -> Result<()> {
    let task = build_task(args)?;
    let rt = tokio::runtime::Runtime::new()?;

    let complexity = rt.block_on(async {
        let classifier = ComplexityClassifier::new(judge(config, heuristic)?, &config.classifier);
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());
        Ok::<_, Error>(classifier.classify(&task, &cancel).await)
    })?;

    let metrics = extract_signal_metrics(&task.description);
    let json = serde_json::json!({
        "id": task.id,
        "complexity": complexity,
        "checkboxes": metrics.checkbox_count,
        "phases": metrics.phase_count,
        "words": metrics.word_count,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn run_decompose(config: &Config, args: TaskArgs) -> Result<()> {
    let task = build_task(args)?;
    let result = TaskDecomposer::new(config.decompose.clone()).decompose(&task);

    println!("Decomposed: {}", result.decomposed);
    println!("Reason:     {}", result.reason);
    if let Some(strategy) = result.strategy {
        println!("Strategy:   {:?}", strategy);
    }
    if result.decomposed {
        println!();
        for sub in &result.subtasks {
            println!("  {}  {}", sub.id, sub.title);
        }
    }
    Ok(())
}

fn run_parse_plan(config: &Config, file: Option<PathBuf>, heuristic: bool) -> Result<()> {
    let output = read_input(file.as_deref().unwrap_or(Path::new("-")))?;
    let rt = tokio::runtime::Runtime::new()?;

    let subtasks = rt.block_on(async {
        let parser = PlanningOutputParser::new(judge(config, heuristic)?);
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());
        parser.parse(&output, &cancel).await
    })?;

    let single_scope = ScopeGuard.is_single_scope("", &subtasks);
    let json = serde_json::json!({
        "single_scope": single_scope,
        "subtasks": subtasks,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn run_ratelimit(message: &str) -> Result<()> {
    match parse_rate_limit_error(message) {
        Some(info) => {
            println!("Resets at: {}", info.reset_time.to_rfc3339());
            println!("Timezone:  {}", info.timezone);
            println!("In:        {}", info.human_readable_reset());
            Ok(())
        }
        None => Err(Error::Validation("no rate-limit reset time found in message".to_string())),
    }
}

fn run_sweep(config: &Config, repo: Option<PathBuf>) -> Result<()> {
    let repo = repo_path(repo)?;
    let git = GitOps::new(&repo)?.with_timeout(config.worktree.command_timeout());
    let root = config.worktree.effective_root();
    let rt = tokio::runtime::Runtime::new()?;

    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());
        sweep_orphans(&git, &root, &cancel).await
    })?;

    println!("Swept {}", root.display());
    println!("  Removed: {}", report.removed_count());
    println!("  Kept:    {}", report.kept.len());
    for (path, error) in &report.failed {
        println!("  Failed:  {} ({})", path.display(), error);
    }
    Ok(())
}

/// Prints each sub-issue pull request as it is opened.
struct PrintObserver;

impl SubIssueObserver for PrintObserver {
    fn on_pr_created(&self, pr: &SubIssuePr) {
        match pr.issue_number {
            Some(issue) => println!("  PR #{} for issue #{}: {}", pr.pr_number, issue, pr.pr_url),
            None => println!("  PR #{}: {}", pr.pr_number, pr.pr_url),
        }
    }
}

fn run_epic(config: &Config, args: TaskArgs, repo: Option<PathBuf>, plan_only: bool) -> Result<()> {
    let repo = repo_path(repo)?;
    let task = build_task(args)?.with_project(&repo);
    flog!("Epic command: id={} repo={} plan_only={}", task.id, repo.display(), plan_only);
    config.ensure_dirs()?;

    let timeout = config.worktree.command_timeout();
    let claude = ClaudeBackend::new(config.effective_command())?;
    let tracker = Arc::new(GhTracker::new(timeout)?);
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());

        let orchestrator = EpicOrchestrator::new(
            Arc::new(claude.clone()),
            PlanningOutputParser::new(judge(config, false)?),
            tracker,
            Arc::new(BackendExecutor::new(claude)),
            config.epic.clone(),
        )
        .with_observer(Arc::new(PrintObserver));

        if plan_only {
            let plan = orchestrator.plan_epic(&task, &repo, &cancel).await?;
            let json = serde_json::json!({
                "id": task.id,
                "consolidate": orchestrator.should_consolidate(&plan),
                "warnings": plan.dependency_warnings().iter().map(|w| w.to_string()).collect::<Vec<_>>(),
                "subtasks": plan.subtasks,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
            return Ok(());
        }

        let pool = WorktreePool::new(&repo, &config.worktree)?;
        let swept = sweep_orphans(pool.git(), pool.root(), &cancel).await?;
        if swept.removed_count() > 0 {
            flog!("Removed {} orphaned worktrees before warming", swept.removed_count());
        }
        pool.warm_pool(&cancel).await?;
        println!("Running epic {}: {}", task.id, task.title);

        let outcome = orchestrator.run_epic(&task, &pool, &cancel).await;
        let removed = pool.cleanup_all().await;
        if removed > 0 {
            flog_warn!("Removed {} ephemeral worktrees left at shutdown", removed);
        }
        pool.close().await;

        match outcome? {
            EpicOutcome::Consolidated { plan, result } => {
                println!();
                println!("Executed {} planned steps as a single task", plan.subtasks.len());
                println!("  Success: {}", result.success);
                if let Some(url) = &result.pr_url {
                    println!("  PR:      {}", url);
                }
                if let Some(error) = &result.error {
                    println!("  Error:   {}", error);
                }
            }
            EpicOutcome::Completed { issues, .. } => {
                println!();
                println!("Completed {} sub-issues:", issues.len());
                for issue in &issues {
                    println!("  {}  {}", issue.identifier, issue.subtask.title);
                }
            }
        }
        Ok(())
    })
}
