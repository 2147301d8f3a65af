//! Projection of job lifecycle onto the external relational store.
//!
//! The durable, client-visible job history lives in an external store
//! (PostgREST conventions); the queue's metadata is ephemeral. This module
//! is a thin write-through: `mark` patches the row, `get` reads it back,
//! and two specialized reads fetch a user's identity reference images for
//! the fashion pipeline.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::JobStoreError;

/// One job row. `fields` carries everything beyond id/status (output URL,
/// error message, stage, progress, provenance) so schema drift on the
/// store side never breaks parsing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobRow {
    pub id: String,
    pub status: String,
    pub fields: Map<String, Value>,
}

impl JobRow {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// A cleaned reference image for one pose angle.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleReference {
    pub angle: String,
    pub url: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Patch the job row: set `status` and merge `fields` (a JSON object).
    async fn mark(&self, job_id: &str, status: &str, fields: Value) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: &str) -> Result<JobRow, JobStoreError>;

    /// The user's cleaned per-angle reference images.
    async fn angle_references(&self, user_id: &str) -> Result<Vec<AngleReference>, JobStoreError>;

    /// The user's face close-up URLs, best first.
    async fn face_references(&self, user_id: &str) -> Result<Vec<String>, JobStoreError>;
}

// ── PostgREST implementation ─────────────────────────────────────────────

pub struct RestJobStore {
    base_url: String,
    service_key: String,
    http: reqwest::Client,
}

impl RestJobStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>, http: reqwest::Client) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, service_key: service_key.into(), http }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn select(&self, path_and_query: &str) -> Result<Vec<Value>, JobStoreError> {
        let url = format!("{}{path_and_query}", self.base_url);
        let response = self.request(self.http.get(&url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(JobStoreError::Status { status: status.as_u16(), message });
        }
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|err| JobStoreError::Transport(format!("invalid json: {err}")))?;
        Ok(rows)
    }
}

#[async_trait]
impl JobStore for RestJobStore {
    async fn mark(&self, job_id: &str, status: &str, fields: Value) -> Result<(), JobStoreError> {
        let mut body = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("metadata".to_string(), other);
                map
            }
        };
        body.insert("status".to_string(), Value::String(status.to_string()));

        let url = format!("{}/rest/v1/jobs?id=eq.{job_id}", self.base_url);
        let response = self
            .request(self.http.patch(&url))
            .header("Prefer", "return=minimal")
            .json(&Value::Object(body))
            .send()
            .await?;
        let http_status = response.status();
        if !http_status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(JobStoreError::Status { status: http_status.as_u16(), message });
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<JobRow, JobStoreError> {
        let rows = self.select(&format!("/rest/v1/jobs?id=eq.{job_id}&select=*")).await?;
        let Some(Value::Object(mut row)) = rows.into_iter().next() else {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        };
        let id = row.remove("id").and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
        let status =
            row.remove("status").and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
        Ok(JobRow { id, status, fields: row })
    }

    async fn angle_references(&self, user_id: &str) -> Result<Vec<AngleReference>, JobStoreError> {
        let rows = self
            .select(&format!(
                "/rest/v1/identity_assets?user_id=eq.{user_id}&kind=eq.reference_angle&select=angle,url"
            ))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(AngleReference {
                    angle: row.get("angle")?.as_str()?.to_string(),
                    url: row.get("url")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn face_references(&self, user_id: &str) -> Result<Vec<String>, JobStoreError> {
        let rows = self
            .select(&format!(
                "/rest/v1/identity_assets?user_id=eq.{user_id}&kind=eq.face_closeup&select=url"
            ))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("url").and_then(Value::as_str).map(String::from))
            .collect())
    }
}

// ── In-memory implementation ─────────────────────────────────────────────

/// Mutex-guarded map, for tests and redis-less local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    rows: HashMap<String, JobRow>,
    angle_refs: HashMap<String, Vec<AngleReference>>,
    face_refs: HashMap<String, Vec<String>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_angle_references(&self, user_id: &str, refs: Vec<AngleReference>) {
        self.lock().angle_refs.insert(user_id.to_string(), refs);
    }

    pub fn set_face_references(&self, user_id: &str, refs: Vec<String>) {
        self.lock().face_refs.insert(user_id.to_string(), refs);
    }

    /// Every status the row has passed through, oldest first.
    pub fn status_history(&self, job_id: &str) -> Vec<String> {
        self.lock()
            .rows
            .get(job_id)
            .and_then(|row| row.fields.get("status_history"))
            .and_then(Value::as_array)
            .map(|statuses| {
                statuses.iter().filter_map(Value::as_str).map(String::from).collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn mark(&self, job_id: &str, status: &str, fields: Value) -> Result<(), JobStoreError> {
        let mut inner = self.lock();
        let row = inner.rows.entry(job_id.to_string()).or_insert_with(|| JobRow {
            id: job_id.to_string(),
            ..JobRow::default()
        });
        row.status = status.to_string();
        if let Value::Object(map) = fields {
            for (key, value) in map {
                row.fields.insert(key, value);
            }
        }
        // Track the status trail so tests can assert on transitions.
        let history = row
            .fields
            .entry("status_history".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(statuses) = history {
            statuses.push(Value::String(status.to_string()));
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<JobRow, JobStoreError> {
        self.lock()
            .rows
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))
    }

    async fn angle_references(&self, user_id: &str) -> Result<Vec<AngleReference>, JobStoreError> {
        Ok(self.lock().angle_refs.get(user_id).cloned().unwrap_or_default())
    }

    async fn face_references(&self, user_id: &str) -> Result<Vec<String>, JobStoreError> {
        Ok(self.lock().face_refs.get(user_id).cloned().unwrap_or_default())
    }
}
