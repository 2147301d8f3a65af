//! Generic submit-and-poll adapter over an external generation provider.
//!
//! Providers differ in paths, auth headers, status vocabularies, and
//! response shapes, but they all follow the same queue protocol: POST a
//! job, poll a status endpoint, fetch a result. A [`ProviderGateway`] is
//! that protocol with the differences pushed into [`ProviderConfig`].
//!
//! Retry policy inspects results rather than unwinding: transient HTTP
//! statuses (429/502/503/504) and transport errors are retried with
//! exponential backoff plus jitter, honoring `Retry-After`; a provider
//! saying FAILED is final.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{Backoff, Jitter, MAX_DELAY};
use crate::error::GatewayError;
use crate::time::{Clock, Sleeper};

/// Normalized provider job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    InProgress,
    Succeeded,
    Failed,
}

/// What a submit call produced: a task to poll, or (for providers that
/// answer synchronously) the finished response body.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Queued { task_id: String },
    Completed { body: Value },
}

/// Everything that varies between providers.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Short name used in logs and metric labels, e.g. `tryon`.
    pub name: String,
    pub base_url: String,
    pub submit_path: String,
    /// `{task_id}` is substituted.
    pub status_path: String,
    /// `{task_id}` is substituted. May equal `status_path` for providers
    /// whose status record carries the result.
    pub result_path: String,
    /// Header name and full value, e.g. `("Authorization", "Key …")`.
    pub auth_header: (String, String),
    /// Key paths probed, in order, for the task id in the submit response.
    pub task_id_keys: Vec<String>,
    /// Key paths probed for the raw status string in a poll response.
    pub status_keys: Vec<String>,
    /// Provider status vocabulary → normalized state. Compared
    /// case-insensitively; unknown strings mean still-in-progress.
    pub status_map: Vec<(String, PollState)>,
    /// Key paths probed for the output URL before the recursive fallback.
    pub result_keys: Vec<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Total budget for one poll_until_complete call.
    pub poll_deadline: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub jitter: Jitter,
}

impl ProviderConfig {
    /// Defaults shared by every provider; the caller fills in the
    /// endpoint-specific parts.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            submit_path: String::new(),
            status_path: String::new(),
            result_path: String::new(),
            auth_header: ("Authorization".to_string(), String::new()),
            task_id_keys: vec!["request_id".to_string(), "task_id".to_string()],
            status_keys: vec!["status".to_string()],
            status_map: vec![
                ("COMPLETED".to_string(), PollState::Succeeded),
                ("SUCCESS".to_string(), PollState::Succeeded),
                ("FAILED".to_string(), PollState::Failed),
                ("ERROR".to_string(), PollState::Failed),
            ],
            result_keys: Vec::new(),
            poll_interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(60),
            poll_deadline: Duration::from_secs(300),
            max_retries: 5,
            backoff: Backoff::exponential(Duration::from_secs(2)),
            jitter: Jitter::uniform(Duration::from_secs(1)),
        }
    }
}

pub struct ProviderGateway {
    config: ProviderConfig,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl ProviderGateway {
    pub fn new(
        config: ProviderConfig,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { config, http, clock, sleeper }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn url(&self, path_template: &str, task_id: &str) -> String {
        let path = path_template.replace("{task_id}", task_id);
        format!("{}{}", self.config.base_url, path)
    }

    /// One-shot POST to the submit path, returning the raw response body.
    /// The synchronous validation lane uses this directly.
    pub async fn invoke(&self, payload: &Value) -> Result<Value, GatewayError> {
        let url = self.url(&self.config.submit_path, "");
        self.request_with_retry(|| {
            self.http
                .post(&url)
                .header(&self.config.auth_header.0, &self.config.auth_header.1)
                .timeout(self.config.request_timeout)
                .json(payload)
        })
        .await
    }

    /// Submit a generation request. Returns the provider task id, or the
    /// completed body for providers that answer synchronously.
    pub async fn submit(&self, payload: &Value) -> Result<SubmitOutcome, GatewayError> {
        let body = self.invoke(payload).await?;

        for key in &self.config.task_id_keys {
            if let Some(task_id) = lookup_path(&body, key).and_then(Value::as_str) {
                if !task_id.is_empty() {
                    tracing::info!(provider = %self.config.name, task_id, "submitted provider job");
                    return Ok(SubmitOutcome::Queued { task_id: task_id.to_string() });
                }
            }
        }
        // Some providers skip the queue and answer with the result.
        if self.extract_output_url(&body).is_some() {
            tracing::info!(provider = %self.config.name, "provider answered synchronously");
            return Ok(SubmitOutcome::Completed { body });
        }
        Err(GatewayError::MissingTaskId)
    }

    /// Poll until the provider reports a terminal state, then fetch and
    /// return the output URL. Bounded by the configured deadline.
    pub async fn poll_until_complete(&self, task_id: &str) -> Result<String, GatewayError> {
        let started = self.clock.now();
        let status_url = self.url(&self.config.status_path, task_id);

        loop {
            let elapsed = self.clock.now() - started;
            if elapsed >= self.config.poll_deadline.as_secs_f64() {
                tracing::warn!(provider = %self.config.name, task_id, "poll deadline exceeded");
                return Err(GatewayError::Timeout { elapsed_secs: elapsed });
            }
            self.sleeper.sleep(self.config.poll_interval).await;

            let body = self
                .request_with_retry(|| {
                    self.http
                        .get(&status_url)
                        .header(&self.config.auth_header.0, &self.config.auth_header.1)
                        .timeout(self.config.request_timeout)
                })
                .await?;

            match self.classify(&body) {
                PollState::InProgress => {
                    tracing::debug!(provider = %self.config.name, task_id, "still in progress");
                }
                PollState::Failed => {
                    let message = extract_error_message(&body);
                    return Err(GatewayError::Failed(message));
                }
                PollState::Succeeded => {
                    return self.fetch_result(task_id, &body).await;
                }
            }
        }
    }

    /// Submit then wait for completion, handling synchronous responses.
    pub async fn run(&self, payload: &Value) -> Result<String, GatewayError> {
        match self.submit(payload).await? {
            SubmitOutcome::Completed { body } => {
                self.extract_output_url(&body).ok_or(GatewayError::MissingOutput)
            }
            SubmitOutcome::Queued { task_id } => self.poll_until_complete(&task_id).await,
        }
    }

    async fn fetch_result(&self, task_id: &str, status_body: &Value) -> Result<String, GatewayError> {
        // Status and result may live on the same endpoint; don't refetch
        // if the status body already carries the output.
        if self.config.result_path == self.config.status_path {
            return self.extract_output_url(status_body).ok_or(GatewayError::MissingOutput);
        }
        let result_url = self.url(&self.config.result_path, task_id);
        let body = self
            .request_with_retry(|| {
                self.http
                    .get(&result_url)
                    .header(&self.config.auth_header.0, &self.config.auth_header.1)
                    .timeout(self.config.request_timeout)
            })
            .await?;
        self.extract_output_url(&body).ok_or(GatewayError::MissingOutput)
    }

    /// One logical HTTP call: retried on transient statuses and transport
    /// errors, `Retry-After` honored, exponential backoff + jitter
    /// otherwise.
    async fn request_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Value, GatewayError> {
        let max_retries = self.config.max_retries;
        let mut last_transport_error = String::new();

        for attempt in 0..=max_retries {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|err| GatewayError::Transport(format!("invalid json: {err}")));
                    }
                    let retry_after = parse_retry_after(&response);
                    let message = response.text().await.unwrap_or_default();
                    if GatewayError::retryable_status(status.as_u16()) && attempt < max_retries {
                        let delay = retry_after
                            .unwrap_or_else(|| self.config.jitter.apply(self.config.backoff.delay(attempt)))
                            .min(MAX_DELAY);
                        tracing::warn!(
                            provider = %self.config.name,
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            delay_secs = delay.as_secs_f64(),
                            "transient provider status, retrying"
                        );
                        self.sleeper.sleep(delay).await;
                        continue;
                    }
                    return Err(GatewayError::Status {
                        status: status.as_u16(),
                        message: crate::error::truncate_message(&message, 500),
                    });
                }
                Err(err) => {
                    last_transport_error = err.to_string();
                    if attempt < max_retries {
                        let delay = self.config.jitter.apply(self.config.backoff.delay(attempt));
                        tracing::warn!(
                            provider = %self.config.name,
                            attempt = attempt + 1,
                            error = %last_transport_error,
                            "transport error, retrying"
                        );
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
        }
        Err(GatewayError::RetryExhausted {
            attempts: max_retries + 1,
            last: last_transport_error,
        })
    }

    fn classify(&self, body: &Value) -> PollState {
        let raw = self
            .config
            .status_keys
            .iter()
            .find_map(|key| lookup_path(body, key).and_then(Value::as_str))
            .unwrap_or("");
        for (vocab, state) in &self.config.status_map {
            if raw.eq_ignore_ascii_case(vocab) {
                return state.clone();
            }
        }
        PollState::InProgress
    }

    /// Probe the configured key paths, then fall back to a recursive scan
    /// for the first URL-shaped string. Tolerates provider response-shape
    /// drift.
    pub fn extract_output_url(&self, body: &Value) -> Option<String> {
        for key in &self.config.result_keys {
            if let Some(url) = lookup_path(body, key).and_then(Value::as_str) {
                if !url.is_empty() {
                    return Some(url.to_string());
                }
            }
        }
        find_output_url(body)
    }
}

/// Walk a dot-separated key path; arrays are stepped through their first
/// element, matching the `works[0].resource` shapes providers return.
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if let Value::Array(items) = current {
            current = items.first()?;
        }
        current = current.as_object()?.get(segment)?;
    }
    if let Value::Array(items) = current {
        current = items.first()?;
    }
    Some(current)
}

fn looks_like_output_url(candidate: &str) -> bool {
    if !candidate.starts_with("http") {
        return false;
    }
    const EXTENSIONS: [&str; 8] =
        [".png", ".jpg", ".jpeg", ".webp", ".gif", ".mp4", ".mov", ".webm"];
    let lower = candidate.to_ascii_lowercase();
    EXTENSIONS.iter().any(|extension| lower.contains(extension))
}

/// Depth-first scan for the first string that looks like a media URL.
fn find_output_url(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if looks_like_output_url(text) => Some(text.clone()),
        Value::Object(map) => map.values().find_map(find_output_url),
        Value::Array(items) => items.iter().find_map(find_output_url),
        _ => None,
    }
}

fn extract_error_message(body: &Value) -> String {
    for key in ["error", "message", "data.message", "data.error", "detail"] {
        if let Some(message) = lookup_path(body, key).and_then(Value::as_str) {
            if !message.is_empty() {
                return message.to_string();
            }
        }
    }
    "unknown provider error".to_string()
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
