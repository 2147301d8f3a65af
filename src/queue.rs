//! Reliable FIFO task queue over a [`QueueBackend`].
//!
//! The layout follows the classic reliable-queue pattern:
//!
//! 1. enqueue → hash write + `LPUSH taskqueue:jobs` in one transaction
//! 2. dequeue → atomic tail-to-head move into `taskqueue:processing`
//! 3. ack → remove from processing
//! 4. nack → requeue at the head, or `taskqueue:dead_letter` after
//!    `MAX_RETRIES` failures
//!
//! A job id lives in exactly one of the three lists at any moment; a crash
//! between dequeue and ack leaves it in processing, where
//! [`TaskQueue::recover_stale`] finds it later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{truncate_message, QueueError, StoreError};
use crate::store::QueueBackend;
use crate::time::Clock;

pub const QUEUE_KEY: &str = "taskqueue:jobs";
pub const PROCESSING_KEY: &str = "taskqueue:processing";
pub const DEAD_LETTER_KEY: &str = "taskqueue:dead_letter";
pub const META_PREFIX: &str = "taskqueue:meta:";

/// Metadata auto-expires two hours after enqueue.
pub const META_TTL: Duration = Duration::from_secs(7200);
/// Failures before a job is dead-lettered.
pub const MAX_RETRIES: u32 = 3;
/// In-flight age beyond which a job is presumed abandoned.
pub const STALE_TIMEOUT_SECS: f64 = 600.0;
/// Errors persisted into queue metadata are bounded.
const MAX_META_ERROR: usize = 500;

/// What kind of work a job carries. Unknown strings survive round-trips
/// so old queue entries never fail to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    VideoGenerate,
    FashionGenerate,
    TryOn,
    Extend,
    Upscale,
    Other(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::VideoGenerate => "video_generate",
            TaskKind::FashionGenerate => "fashion_generate",
            TaskKind::TryOn => "try_on",
            TaskKind::Extend => "extend",
            TaskKind::Upscale => "upscale",
            TaskKind::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "video_generate" => TaskKind::VideoGenerate,
            "fashion_generate" => TaskKind::FashionGenerate,
            "try_on" => TaskKind::TryOn,
            "extend" => TaskKind::Extend,
            "upscale" => TaskKind::Upscale,
            other => TaskKind::Other(other.to_string()),
        }
    }

    /// Mean processing duration in seconds, used for wait estimates.
    pub fn mean_duration_secs(&self) -> u64 {
        match self {
            TaskKind::FashionGenerate => 180,
            TaskKind::TryOn => 60,
            TaskKind::Upscale => 60,
            TaskKind::VideoGenerate | TaskKind::Extend | TaskKind::Other(_) => 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "dead_letter" => Some(JobStatus::DeadLetter),
            _ => None,
        }
    }
}

/// Per-job metadata, stored as a string hash so it round-trips the backend
/// losslessly.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMeta {
    pub user_id: String,
    pub job_id: String,
    pub kind: TaskKind,
    pub payload: String,
    pub enqueued_at: f64,
    pub status: JobStatus,
    pub retries: u32,
    pub processing_started_at: Option<f64>,
    pub last_error: Option<String>,
}

impl JobMeta {
    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("user_id".to_string(), self.user_id.clone()),
            ("job_id".to_string(), self.job_id.clone()),
            ("task_kind".to_string(), self.kind.as_str().to_string()),
            ("payload".to_string(), self.payload.clone()),
            ("enqueued_at".to_string(), self.enqueued_at.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("retries".to_string(), self.retries.to_string()),
        ];
        if let Some(at) = self.processing_started_at {
            fields.push(("processing_started_at".to_string(), at.to_string()));
        }
        if let Some(error) = &self.last_error {
            fields.push(("last_error".to_string(), error.clone()));
        }
        fields
    }

    fn from_fields(map: &HashMap<String, String>) -> Result<Self, StoreError> {
        let get = |field: &str| {
            map.get(field)
                .cloned()
                .ok_or_else(|| StoreError::Malformed(format!("missing field {field}")))
        };
        Ok(JobMeta {
            user_id: get("user_id")?,
            job_id: get("job_id")?,
            kind: TaskKind::parse(&get("task_kind")?),
            payload: get("payload")?,
            enqueued_at: get("enqueued_at")?
                .parse()
                .map_err(|_| StoreError::Malformed("enqueued_at is not a number".into()))?,
            status: JobStatus::parse(&get("status")?).unwrap_or(JobStatus::Queued),
            retries: map.get("retries").and_then(|raw| raw.parse().ok()).unwrap_or(0),
            processing_started_at: map
                .get("processing_started_at")
                .and_then(|raw| raw.parse().ok()),
            last_error: map.get("last_error").cloned(),
        })
    }
}

fn meta_key(job_id: &str) -> String {
    format!("{META_PREFIX}{job_id}")
}

/// The queue itself. Cheap to clone; all state lives in the backend.
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn QueueBackend>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Add a job to the queue. Returns its 1-based position.
    pub async fn enqueue(
        &self,
        user_id: &str,
        job_id: &str,
        kind: TaskKind,
        payload: &serde_json::Value,
    ) -> Result<usize, QueueError> {
        let meta = JobMeta {
            user_id: user_id.to_string(),
            job_id: job_id.to_string(),
            kind: kind.clone(),
            payload: payload.to_string(),
            enqueued_at: self.clock.now(),
            status: JobStatus::Queued,
            retries: 0,
            processing_started_at: None,
            last_error: None,
        };
        let position = self
            .backend
            .enqueue(&meta_key(job_id), &meta.to_fields(), META_TTL, QUEUE_KEY, job_id)
            .await?;
        tracing::info!(job_id, user_id, kind = kind.as_str(), position, "enqueued job");
        Ok(position)
    }

    /// Atomically move one job into processing. Returns its id, or `None`
    /// on timeout. The move itself can never lose the job: it is in the
    /// pending list or the processing list at every instant.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let Some(job_id) = self
            .backend
            .move_tail_to_head(QUEUE_KEY, PROCESSING_KEY, timeout)
            .await?
        else {
            return Ok(None);
        };
        self.backend
            .hash_set(&meta_key(&job_id), "processing_started_at", &self.clock.now().to_string())
            .await?;
        tracing::info!(%job_id, "dequeued job into processing");
        Ok(Some(job_id))
    }

    /// Acknowledge success: remove from processing, mark completed.
    pub async fn ack(&self, job_id: &str) -> Result<(), QueueError> {
        self.backend.list_remove(PROCESSING_KEY, job_id).await?;
        self.update_status(job_id, JobStatus::Completed).await?;
        tracing::info!(job_id, "acked job");
        Ok(())
    }

    /// Negative-acknowledge a failure. Requeues at the head (retried work
    /// is served before new work) until `MAX_RETRIES`, then dead-letters.
    /// The metadata update, processing removal, and push run in one
    /// backend transaction.
    pub async fn nack(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let key = meta_key(job_id);
        let map = self.backend.hash_get_all(&key).await?;
        let retries = map.get("retries").and_then(|raw| raw.parse::<u32>().ok()).unwrap_or(0) + 1;

        let mut fields = vec![("retries".to_string(), retries.to_string())];
        if !error.is_empty() {
            fields.push(("last_error".to_string(), truncate_message(error, MAX_META_ERROR)));
        }
        if retries < MAX_RETRIES {
            fields.push(("status".to_string(), JobStatus::Queued.as_str().to_string()));
            self.backend
                .nack_move(&key, &fields, PROCESSING_KEY, job_id, QUEUE_KEY)
                .await?;
            tracing::warn!(job_id, retries, max = MAX_RETRIES, "nacked job, requeued");
        } else {
            fields.push(("status".to_string(), JobStatus::DeadLetter.as_str().to_string()));
            self.backend
                .nack_move(&key, &fields, PROCESSING_KEY, job_id, DEAD_LETTER_KEY)
                .await?;
            tracing::error!(job_id, retries, error, "job moved to dead-letter");
        }
        Ok(())
    }

    /// Scan processing for jobs abandoned by a crashed worker. Orphans
    /// (no metadata) are dropped; stale jobs are requeued. Returns the
    /// number requeued. Run on startup and periodically.
    pub async fn recover_stale(&self) -> Result<usize, QueueError> {
        let in_flight = self.backend.list_range(PROCESSING_KEY).await?;
        let now = self.clock.now();
        let mut recovered = 0;

        for job_id in in_flight {
            let map = self.backend.hash_get_all(&meta_key(&job_id)).await?;
            if map.is_empty() {
                self.backend.list_remove(PROCESSING_KEY, &job_id).await?;
                tracing::warn!(%job_id, "removed orphaned job from processing (no metadata)");
                continue;
            }
            let started_at: f64 = map
                .get("processing_started_at")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0.0);
            if started_at > 0.0 && now - started_at > STALE_TIMEOUT_SECS {
                self.backend.list_remove(PROCESSING_KEY, &job_id).await?;
                self.backend.list_push_head(QUEUE_KEY, &job_id).await?;
                self.update_status(&job_id, JobStatus::Queued).await?;
                recovered += 1;
                tracing::warn!(
                    %job_id,
                    in_flight_secs = (now - started_at) as u64,
                    "recovered stale job"
                );
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "recovered stale jobs from processing");
        }
        Ok(recovered)
    }

    /// 1-based position in the pending queue, counted from the dequeue
    /// end. `None` if the job is not pending.
    pub async fn position(&self, job_id: &str) -> Result<Option<usize>, QueueError> {
        let pending = self.backend.list_range(QUEUE_KEY).await?;
        Ok(pending
            .iter()
            .position(|id| id == job_id)
            .map(|index| pending.len() - index))
    }

    /// Rough seconds until this job starts, from its position and the
    /// per-kind mean durations.
    pub async fn estimate_wait(&self, job_id: &str) -> Result<u64, QueueError> {
        let Some(position) = self.position(job_id).await? else {
            return Ok(0);
        };
        let per_task = match self.get_meta(job_id).await? {
            Some(meta) => meta.kind.mean_duration_secs(),
            None => TaskKind::Other(String::new()).mean_duration_secs(),
        };
        Ok((position as u64 - 1) * per_task)
    }

    pub async fn pending_len(&self) -> Result<usize, QueueError> {
        Ok(self.backend.list_len(QUEUE_KEY).await?)
    }

    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        Ok(self.backend.list_len(PROCESSING_KEY).await?)
    }

    /// Most recent dead-letter job ids.
    pub async fn list_dead(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        let mut dead = self.backend.list_range(DEAD_LETTER_KEY).await?;
        dead.truncate(limit);
        Ok(dead)
    }

    /// Manually resurrect a dead-letter job: reset its retry count and
    /// requeue it.
    pub async fn retry_dead(&self, job_id: &str) -> Result<bool, QueueError> {
        if !self.backend.key_exists(&meta_key(job_id)).await? {
            return Ok(false);
        }
        if self.backend.list_remove(DEAD_LETTER_KEY, job_id).await? == 0 {
            return Err(QueueError::NotDead(job_id.to_string()));
        }
        self.backend.hash_set(&meta_key(job_id), "retries", "0").await?;
        self.backend.list_push_head(QUEUE_KEY, job_id).await?;
        self.update_status(job_id, JobStatus::Queued).await?;
        tracing::info!(job_id, "retried dead-letter job");
        Ok(true)
    }

    pub async fn get_meta(&self, job_id: &str) -> Result<Option<JobMeta>, QueueError> {
        let map = self.backend.hash_get_all(&meta_key(job_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobMeta::from_fields(&map)?))
    }

    pub async fn update_status(&self, job_id: &str, status: JobStatus) -> Result<(), QueueError> {
        self.backend.hash_set(&meta_key(job_id), "status", status.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_round_trips_including_unknowns() {
        for kind in [
            TaskKind::VideoGenerate,
            TaskKind::FashionGenerate,
            TaskKind::TryOn,
            TaskKind::Extend,
            TaskKind::Upscale,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()), kind);
        }
        let unknown = TaskKind::parse("holographic_knit");
        assert_eq!(unknown, TaskKind::Other("holographic_knit".to_string()));
        assert_eq!(unknown.as_str(), "holographic_knit");
    }

    #[test]
    fn job_meta_round_trips_through_fields() {
        let meta = JobMeta {
            user_id: "u1".into(),
            job_id: "j1".into(),
            kind: TaskKind::FashionGenerate,
            payload: r#"{"prompt":"runway"}"#.into(),
            enqueued_at: 1_700_000_000.25,
            status: JobStatus::Queued,
            retries: 2,
            processing_started_at: Some(1_700_000_100.5),
            last_error: Some("gateway timeout".into()),
        };
        let fields: HashMap<String, String> = meta.to_fields().into_iter().collect();
        let parsed = JobMeta::from_fields(&fields).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn job_meta_tolerates_missing_optionals() {
        let mut map = HashMap::new();
        map.insert("user_id".to_string(), "u1".to_string());
        map.insert("job_id".to_string(), "j1".to_string());
        map.insert("task_kind".to_string(), "try_on".to_string());
        map.insert("payload".to_string(), "{}".to_string());
        map.insert("enqueued_at".to_string(), "1000.0".to_string());
        map.insert("status".to_string(), "queued".to_string());
        let parsed = JobMeta::from_fields(&map).unwrap();
        assert_eq!(parsed.retries, 0);
        assert!(parsed.processing_started_at.is_none());
        assert!(parsed.last_error.is_none());
    }

    #[test]
    fn job_meta_rejects_missing_required_field() {
        let map = HashMap::new();
        assert!(JobMeta::from_fields(&map).is_err());
    }

    #[test]
    fn mean_durations_differ_by_kind() {
        assert_eq!(TaskKind::FashionGenerate.mean_duration_secs(), 180);
        assert_eq!(TaskKind::TryOn.mean_duration_secs(), 60);
        assert_eq!(TaskKind::parse("whatever").mean_duration_secs(), 90);
    }
}
