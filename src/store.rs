//! Queue storage backends.
//!
//! The task queue is written against [`QueueBackend`], a thin trait over
//! the handful of primitives it needs: a transactional hash-write-plus-push
//! for enqueue, an atomic tail-to-head move for dequeue, list bookkeeping,
//! and per-job metadata hashes. [`RedisBackend`] is the production
//! implementation; [`MemoryBackend`] holds equivalent state under one mutex
//! and backs the test suite and redis-less local runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::StoreError;

/// Primitives the task queue is built on.
///
/// The move in [`move_tail_to_head`](QueueBackend::move_tail_to_head) is the
/// reliability lynchpin: the element is never in limbo, it is in exactly one
/// of the two lists at every point in time.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Transactionally write `fields` into the hash at `meta_key` with a
    /// TTL and push `id` onto the head of `list`. Returns the list length
    /// after the push (the job's 1-based queue position).
    async fn enqueue(
        &self,
        meta_key: &str,
        fields: &[(String, String)],
        ttl: Duration,
        list: &str,
        id: &str,
    ) -> Result<usize, StoreError>;

    /// Atomically move one element from the tail of `src` to the head of
    /// `dst`, blocking up to `timeout`. Returns the moved element, or
    /// `None` on timeout.
    async fn move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    async fn list_push_head(&self, list: &str, id: &str) -> Result<(), StoreError>;

    /// Remove the first occurrence of `id` from `list`. Returns how many
    /// were removed (0 or 1).
    async fn list_remove(&self, list: &str, id: &str) -> Result<usize, StoreError>;

    /// Full contents of `list`, head first.
    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, list: &str) -> Result<usize, StoreError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// All fields of the hash at `key`; empty map if the key is gone.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn key_exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomic negative-ack: write `fields` into the metadata hash, remove
    /// `id` from `processing`, and push it onto the head of `target`
    /// (requeue or dead-letter) in one transaction.
    async fn nack_move(
        &self,
        meta_key: &str,
        fields: &[(String, String)],
        processing: &str,
        id: &str,
        target: &str,
    ) -> Result<(), StoreError>;
}

// ── Redis ────────────────────────────────────────────────────────────────

/// Redis-backed implementation over a reconnecting [`ConnectionManager`].
///
/// [`ConnectionManager`]: redis::aio::ConnectionManager
#[derive(Clone)]
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect and probe the server with a `PING`. Failure here is how the
    /// service decides to run in fallback mode.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let mut manager = redis::aio::ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<()>(&mut manager).await?;
        Ok(Self { manager })
    }

    /// A handle to the underlying connection for collaborators that speak
    /// redis directly (the rate limiter's sorted sets).
    pub fn manager(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn enqueue(
        &self,
        meta_key: &str,
        fields: &[(String, String)],
        ttl: Duration,
        list: &str,
        id: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(meta_key, fields).ignore();
        pipe.expire(meta_key, ttl.as_secs() as i64).ignore();
        pipe.lpush(list, id);
        let (len,): (usize,) = pipe.query_async(&mut conn).await?;
        Ok(len)
    }

    async fn move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(src)
            .arg(dst)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn list_push_head(&self, list: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("LPUSH").arg(list).arg(id).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn list_remove(&self, list: &str, id: &str) -> Result<usize, StoreError> {
        let mut conn = self.manager.clone();
        let removed: usize = redis::cmd("LREM")
            .arg(list)
            .arg(1)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.manager.clone();
        let len: usize = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    async fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn nack_move(
        &self,
        meta_key: &str,
        fields: &[(String, String)],
        processing: &str,
        id: &str,
        target: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(meta_key, fields).ignore();
        pipe.cmd("LREM").arg(processing).arg(1).arg(id).ignore();
        pipe.lpush(target, id).ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Mutex-guarded maps and deques with the same contract as redis.
///
/// TTLs are accepted and ignored: the process lifetime bounds this state
/// anyway.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
    pushed: Arc<Notify>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_move(&self, src: &str, dst: &str) -> Option<String> {
        let mut inner = self.lock();
        let moved = inner.lists.get_mut(src)?.pop_back()?;
        inner.lists.entry(dst.to_string()).or_default().push_front(moved.clone());
        Some(moved)
    }

    /// Test hook: drop a metadata hash to simulate TTL expiry.
    pub fn expire_hash(&self, key: &str) {
        self.lock().hashes.remove(key);
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(
        &self,
        meta_key: &str,
        fields: &[(String, String)],
        _ttl: Duration,
        list: &str,
        id: &str,
    ) -> Result<usize, StoreError> {
        let len = {
            let mut inner = self.lock();
            let hash = inner.hashes.entry(meta_key.to_string()).or_default();
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            let entries = inner.lists.entry(list.to_string()).or_default();
            entries.push_front(id.to_string());
            entries.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a concurrent push
            // between the check and the wait still wakes us.
            let notified = self.pushed.notified();
            if let Some(moved) = self.try_move(src, dst) {
                return Ok(Some(moved));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.try_move(src, dst));
            }
        }
    }

    async fn list_push_head(&self, list: &str, id: &str) -> Result<(), StoreError> {
        self.lock().lists.entry(list.to_string()).or_default().push_front(id.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn list_remove(&self, list: &str, id: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let Some(entries) = inner.lists.get_mut(list) else {
            return Ok(0);
        };
        match entries.iter().position(|entry| entry == id) {
            Some(index) => {
                entries.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get(list)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.lock().lists.get(list).map(VecDeque::len).unwrap_or(0))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().hashes.contains_key(key))
    }

    async fn nack_move(
        &self,
        meta_key: &str,
        fields: &[(String, String)],
        processing: &str,
        id: &str,
        target: &str,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let hash = inner.hashes.entry(meta_key.to_string()).or_default();
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            if let Some(entries) = inner.lists.get_mut(processing) {
                if let Some(index) = entries.iter().position(|entry| entry == id) {
                    entries.remove(index);
                }
            }
            inner.lists.entry(target.to_string()).or_default().push_front(id.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

}
