//! Classification into decomposition, and rate-limited work coming back
//! through the retry scheduler.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use foreman::config::{ClassifierConfig, DecomposeConfig, JudgmentConfig, SchedulerConfig};
use foreman::core::{Complexity, Task};
use foreman::orchestration::{
    detect_complexity, AgentOutcome, AnthropicJudge, ComplexityClassifier, JudgmentService, PendingRetry,
    RetryHandler, RetryScheduler, SplitStrategy, TaskDecomposer, TaskQueue,
};

const BILLING_DESCRIPTION: &str = "We need to rework how billing is handled across the product.

1. Move invoice generation out of the request path into a background job with retries
2. Store every payment attempt with its provider response so support can audit failures
3. Send customers an email receipt once a payment settles, including the invoice PDF
4. Add an admin page listing failed payments with a button to retry them manually
";

fn judge_for(server: &MockServer) -> Arc<dyn JudgmentService> {
    let config = JudgmentConfig {
        base_url: server.uri(),
        ..Default::default()
    };
    Arc::new(AnthropicJudge::new("test-key", &config).unwrap())
}

// ============ Classification tests ============

#[tokio::test]
async fn test_judged_epic_is_decomposed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content": [{
                "type": "text",
                "text": "```json\n{\"complexity\": \"EPIC\", \"reason\": \"four independent areas\"}\n```"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let classifier = ComplexityClassifier::new(Some(judge_for(&server)), &ClassifierConfig::default());
    let task = Task::new("GH-7", "Rework billing", BILLING_DESCRIPTION).with_create_pr(true);
    let cancel = CancellationToken::new();

    let level = classifier.classify(&task, &cancel).await;
    assert_eq!(level, Complexity::Epic);
    // Second call is served from the cache; the mock expects one request.
    assert_eq!(classifier.classify(&task, &cancel).await, Complexity::Epic);
    assert_eq!(classifier.cached_len(), 1);

    let result = TaskDecomposer::new(DecomposeConfig::default()).decompose_with(&task, level);
    assert!(result.decomposed, "{}", result.reason);
    assert_eq!(result.strategy, Some(SplitStrategy::NumberedSteps));
    let ids: Vec<_> = result.subtasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["GH-7-1", "GH-7-2", "GH-7-3", "GH-7-4"]);
    assert!(result.subtasks[0].title.starts_with("Move invoice generation"));
    assert!(result.subtasks[3].create_pr);
    assert!(!result.subtasks[0].create_pr);
}

#[tokio::test]
async fn test_judgment_outage_falls_back_to_heuristic() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let classifier = ComplexityClassifier::new(Some(judge_for(&server)), &ClassifierConfig::default());
    let task = Task::new("GH-8", "Rework billing", BILLING_DESCRIPTION);

    let level = classifier.classify(&task, &CancellationToken::new()).await;
    assert_eq!(level, detect_complexity(&task));
}

// ============ Rate-limit retry tests ============

#[derive(Default)]
struct Redispatcher {
    retried: Mutex<Vec<(String, u32)>>,
}

#[async_trait]
impl RetryHandler for Redispatcher {
    async fn on_retry(&self, entry: &PendingRetry, _cancel: &CancellationToken) -> foreman::Result<()> {
        self.retried
            .lock()
            .unwrap()
            .push((entry.task.id.clone(), entry.attempts));
        Ok(())
    }

    async fn on_expired(&self, _entry: &PendingRetry) {}
}

#[tokio::test]
async fn test_rate_limited_run_is_retried_after_reset() {
    let outcome = AgentOutcome::failed("You've hit your limit · resets 6am (UTC)");
    assert!(!outcome.success);
    let info = outcome.rate_limit.clone().expect("reset time parsed");
    assert!(info.reset_time > Utc::now());
    assert_eq!(info.timezone, "UTC");

    let queue = Arc::new(TaskQueue::new());
    let handler = Arc::new(Redispatcher::default());
    let config = SchedulerConfig {
        check_interval_secs: 1,
        retry_buffer_secs: 0,
    };
    let scheduler = RetryScheduler::new(&config, queue.clone(), handler.clone());
    let cancel = CancellationToken::new();
    let task = Arc::new(Task::new("GH-3", "Add caching", "Cache the product list"));

    assert_eq!(scheduler.queue_task(task.clone(), &info), info.reset_time);
    scheduler.process_now(&cancel).await;
    assert!(handler.retried.lock().unwrap().is_empty(), "not due before the reset");
    assert_eq!(scheduler.status().pending_count, 1);

    // The limit has reset.
    queue.add(task, Utc::now() - chrono::Duration::seconds(1), "reset passed");
    scheduler.process_now(&cancel).await;

    assert_eq!(*handler.retried.lock().unwrap(), vec![("GH-3".to_string(), 2)]);
    assert!(queue.is_empty());
    assert!(scheduler.status().next_retry.is_none());
}
