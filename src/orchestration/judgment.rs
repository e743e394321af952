//! Network judgment service used for complexity classification and
//! structured plan extraction.
//!
//! Every caller treats the service as fallible: a transport error, a
//! non-success status, or an unusable reply sends the caller down its local
//! fallback path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::JudgmentConfig;
use crate::{flog_debug, Error, Result};

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A model that answers one system + user prompt with text.
#[async_trait]
pub trait JudgmentService: Send + Sync {
    /// # Errors
    ///
    /// Any transport failure, non-success status, empty reply, or
    /// cancellation.
    async fn judge(&self, system: &str, user: &str, cancel: &CancellationToken) -> Result<String>;
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Judgment service backed by the Anthropic messages API.
#[derive(Debug, Clone)]
pub struct AnthropicJudge {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicJudge {
    pub fn new(api_key: impl Into<String>, config: &JudgmentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
        })
    }

    /// Build from `ANTHROPIC_API_KEY`; `Ok(None)` when the key is unset so
    /// callers run heuristics only.
    pub fn from_env(config: &JudgmentConfig) -> Result<Option<Self>> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(Self::new(key.trim(), config)?)),
            _ => Ok(None),
        }
    }

    async fn send(&self, system: &str, user: &str) -> Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages: [Message {
                role: "user",
                content: user,
            }],
        };
        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Judgment(format!("status {}: {}", status, text.trim())));
        }

        let parsed: MessagesResponse = resp.json().await?;
        let text = parsed
            .content
            .into_iter()
            .next()
            .map(|b| b.text)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(Error::Judgment("empty response".to_string()));
        }
        flog_debug!("judgment reply: {} chars", text.len());
        Ok(text)
    }
}

#[async_trait]
impl JudgmentService for AnthropicJudge {
    async fn judge(&self, system: &str, user: &str, cancel: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.send(system, user) => res,
        }
    }
}

/// Strip a surrounding markdown code fence (```json ... ```), if present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Truncate judgment input to `max_chars`, marking the cut.
pub fn truncate_input(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n...[truncated]");
    out
}
