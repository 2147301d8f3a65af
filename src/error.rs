//! Error types for each service boundary.
//!
//! Every boundary gets its own enum so callers can match on what actually
//! went wrong; string payloads keep the queue and store errors cheap to
//! clone into job metadata.

use thiserror::Error;

/// Errors from the queue/metadata backend (redis or in-memory).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend I/O failed (connection, protocol, transaction abort).
    #[error("backend i/o: {0}")]
    Backend(String),
    /// A stored record could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Errors from task queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The job id is tracked in a list but its metadata hash is gone.
    #[error("job {0} has no metadata")]
    MissingMeta(String),
    #[error("job {0} is not in the dead-letter list")]
    NotDead(String),
}

/// Errors surfaced by a provider gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Non-success HTTP status from the provider.
    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider reported a semantic failure. Not retried: these are
    /// almost always input-fatal.
    #[error("provider reported failure: {0}")]
    Failed(String),
    #[error("no task id in submit response")]
    MissingTaskId,
    #[error("completed response contained no output url")]
    MissingOutput,
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },
    #[error("timed out after {elapsed_secs:.0}s waiting for completion")]
    Timeout { elapsed_secs: f64 },
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }

    pub fn is_provider_failure(&self) -> bool {
        matches!(self, GatewayError::Failed(_))
    }

    /// Status codes worth retrying: rate limiting and transient upstream
    /// unavailability.
    pub fn retryable_status(status: u16) -> bool {
        matches!(status, 429 | 502 | 503 | 504)
    }
}

/// Errors from the external job-row store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("store returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("job row {0} not found")]
    NotFound(String),
}

impl From<reqwest::Error> for JobStoreError {
    fn from(err: reqwest::Error) -> Self {
        JobStoreError::Transport(err.to_string())
    }
}

/// Errors raised while driving a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage}: {message}")]
    Stage { stage: &'static str, message: String },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error("job payload: {0}")]
    Payload(String),
}

impl PipelineError {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Stage { stage, message: message.into() }
    }
}

/// Startup configuration errors. These are fatal: the binary exits 1.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Truncate a message to at most `max` bytes on a char boundary. Error
/// strings written into job rows and queue metadata are bounded so one
/// enormous provider response cannot bloat storage.
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut end = max;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
