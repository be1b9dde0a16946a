use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CaptureConfig;
use crate::types::{Action, DOM_SNAPSHOT_MAX_CHARS, HistoryEntry, Perception, parse_http_url};

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent that documents how to do things in web applications. The user is already logged in. You control a real Chrome browser by issuing ONE step at a time as JSON.

Available actions:
- {"action":"navigate","url":"https://..."}
- {"action":"click","target":"e4"}
- {"action":"type","target":"e7","text":"teammate@example.com"}
- {"action":"wait","condition":{"kind":"idle"}}
- {"action":"wait","condition":{"kind":"text","text":"Invitation sent"}}
- {"action":"wait","condition":{"kind":"duration","ms":1000}}
- {"action":"finish","reason":"The invite dialog now shows the teammate"}
- {"action":"fail","reason":"The app has no such feature"}

Rules:
1. Return ONLY a single JSON object per response. No markdown, no explanation.
2. Targets are the [eN] element ids from the current page listing; never invent ids.
3. If the page is blank, start with navigate to the application's base URL (domain only).
4. Prefer the shortest path a human would take. Do not explore unrelated pages.
5. Stop before irreversible final submissions (sending invites, payments, deletions) once the user can see how to complete them, and finish.
6. If a step failed, try a different element or approach. Use fail only when the task is impossible."#;

const URL_FINDER_PROMPT: &str = r#"You are a web URL finder assistant. Identify the base URL (domain only) of the web application where the user's workflow should begin. Assume the user is already logged in, so never return a login, signup or marketing page.

Return ONLY a valid JSON object, best candidate first:
{"urls": ["https://app.example.com"]}

If no application can be identified, return {"urls": []}."#;

/// Everything the policy may look at when choosing the next action.
pub struct DecisionContext<'a> {
    pub task: &'a str,
    pub history: &'a [HistoryEntry],
    pub perception: &'a Perception,
    pub screenshot: Option<&'a [u8]>,
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("no decision within {0:?}")]
    Timeout(Duration),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("unparseable action: {0}")]
    Unparseable(String),
    #[error("{0}")]
    Fatal(String),
}

impl PolicyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PolicyError::Transport(_) | PolicyError::Timeout(_) | PolicyError::Unparseable(_) => true,
            PolicyError::Api { status, .. } => *status == 429 || *status >= 500,
            PolicyError::Fatal(_) => false,
        }
    }
}

impl From<reqwest::Error> for PolicyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PolicyError::Transport(format!("timeout: {err}"))
        } else {
            PolicyError::Transport(err.to_string())
        }
    }
}

/// Chooses the next action: click/type/navigate/wait, or finish/fail.
#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Action, PolicyError>;

    /// Candidate base URLs to open before the first decision, best first.
    /// Only asked when the session does not remember a landing page.
    async fn start_urls(&self, _task: &str) -> Result<Vec<String>, PolicyError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            max_retries: config.policy_max_retries,
            base_delay: config.policy_retry_base,
            timeout: config.policy_timeout,
        }
    }

    /// base * 2^attempt, plus up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(10)));
        let jitter = exp.mul_f64(rand::random::<f64>() * 0.25);
        exp + jitter
    }
}

/// Ask the policy, bounding each call by a timeout and retrying transient
/// failures with exponential backoff.
pub async fn decide_with_retry(
    policy: &dyn DecisionPolicy,
    ctx: &DecisionContext<'_>,
    retry: RetryPolicy,
) -> Result<Action, PolicyError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(retry.timeout, policy.decide(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(PolicyError::Timeout(retry.timeout)),
        };
        match result {
            Ok(action) => return Ok(action),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.backoff(attempt);
                warn!(attempt = attempt + 1, "decision failed ({}), retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Extract an [`Action`] from raw model output, tolerating markdown fences and
/// prose around the JSON object.
pub fn parse_action(content: &str) -> Result<Action, PolicyError> {
    parse_json_object(content)
}

#[derive(Deserialize)]
struct StartUrls {
    #[serde(default)]
    urls: Vec<String>,
}

/// Read `{"urls": [...]}`, keeping only absolute http(s) URLs in order.
pub fn parse_start_urls(content: &str) -> Result<Vec<String>, PolicyError> {
    let found: StartUrls = parse_json_object(content)?;
    Ok(found
        .urls
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| parse_http_url(u).is_some())
        .collect())
}

fn parse_json_object<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, PolicyError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(value) = serde_json::from_str::<T>(cleaned) {
        return Ok(value);
    }
    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str::<T>(&cleaned[start..=end])
            .map_err(|e| PolicyError::Unparseable(format!("{e}: {cleaned}"))),
        _ => Err(PolicyError::Unparseable(cleaned.to_string())),
    }
}

/// Policy backed by an OpenAI-compatible chat completion endpoint.
pub struct LlmPolicy {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    url_finder_model: String,
    vision: bool,
}

impl LlmPolicy {
    pub fn new(config: &CaptureConfig) -> Result<Self, PolicyError> {
        let api_key = config
            .model_api_key
            .clone()
            .ok_or_else(|| PolicyError::Fatal("OPENAI_API_KEY not set in environment".into()))?;
        let client = Client::builder()
            .timeout(config.policy_timeout)
            .build()
            .map_err(|e| PolicyError::Fatal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.model_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model_name.clone(),
            url_finder_model: config.url_finder_model.clone(),
            vision: config.model_vision,
        })
    }

    fn messages(&self, ctx: &DecisionContext<'_>) -> Vec<Value> {
        let mut messages = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];

        let mut text = format!("Task: {}\n\n", ctx.task);
        if ctx.history.is_empty() {
            text.push_str("No steps taken yet.\n");
        } else {
            text.push_str("Steps so far:\n");
            for (i, entry) in ctx.history.iter().enumerate() {
                let action = serde_json::to_string(&entry.action).unwrap_or_default();
                let status = if entry.succeeded { "ok" } else { "FAILED" };
                text.push_str(&format!("{}. {} -> {} {}\n", i + 1, action, status, entry.note));
            }
        }
        text.push_str("\nCurrent page:\n");
        text.push_str(&ctx.perception.render(DOM_SNAPSHOT_MAX_CHARS));
        text.push_str("\nWhat is your next step?");

        let content = match ctx.screenshot.filter(|_| self.vision) {
            Some(png) => json!([
                { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{}", STANDARD.encode(png)) } },
                { "type": "text", "text": text },
            ]),
            None => json!(text),
        };
        messages.push(json!({ "role": "user", "content": content }));
        messages
    }

    /// POST one chat completion and return the assistant's text.
    async fn complete(&self, request: Value) -> Result<String, PolicyError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;
        if status != StatusCode::OK {
            let message = body["error"]["message"].as_str().unwrap_or("Unknown API error").to_string();
            return Err(PolicyError::Api { status: status.as_u16(), message });
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| PolicyError::Unparseable(format!("no content in response: {body}")))
    }
}

#[async_trait]
impl DecisionPolicy for LlmPolicy {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Action, PolicyError> {
        let content = self
            .complete(json!({
                "model": self.model,
                "messages": self.messages(ctx),
                "temperature": 0.2,
            }))
            .await?;
        debug!("model says: {}", content);
        parse_action(&content)
    }

    async fn start_urls(&self, task: &str) -> Result<Vec<String>, PolicyError> {
        // Search models reject sampling parameters.
        let content = self
            .complete(json!({
                "model": self.url_finder_model,
                "messages": [
                    { "role": "system", "content": URL_FINDER_PROMPT },
                    { "role": "user", "content": format!("Task: {task}") },
                ],
            }))
            .await?;
        debug!("url finder says: {}", content);
        parse_start_urls(&content)
    }
}

/// Replays a fixed list of actions, then finishes. Useful for demos and for
/// driving the navigator deterministically.
pub struct ScriptedPolicy {
    actions: Mutex<VecDeque<Action>>,
    start_urls: Vec<String>,
}

impl ScriptedPolicy {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            actions: Mutex::new(actions.into_iter().collect()),
            start_urls: Vec::new(),
        }
    }

    pub fn with_start_urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.start_urls = urls.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl DecisionPolicy for ScriptedPolicy {
    async fn decide(&self, _ctx: &DecisionContext<'_>) -> Result<Action, PolicyError> {
        Ok(self.actions.lock().pop_front().unwrap_or(Action::Finish {
            reason: "script exhausted".to_string(),
        }))
    }

    async fn start_urls(&self, _task: &str) -> Result<Vec<String>, PolicyError> {
        Ok(self.start_urls.clone())
    }
}
