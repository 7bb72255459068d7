//! Work queue and lock service on Valkey (Redis-compatible).
//!
//! Three key spaces:
//! - one persistent list holding the FIFO of idea-process jobs,
//! - per-discussion reclustering lock keys (`SET NX EX`, TTL-bounded),
//! - per-discussion deferred-idea lists populated while a lock is held.
//!
//! This layer does not retry: transient store errors surface to callers.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, warn};

use crate::config::ValkeyConfig;
use crate::models::{Idea, WorkItem};

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Append an idea-process job to the work queue.
    async fn enqueue(&self, idea_id: &str, discussion_id: &str) -> Result<()>;

    /// Pop up to `max` items in FIFO order. Blocks up to `poll_timeout`
    /// for the first item, then drains whatever else is immediately there.
    async fn dequeue_batch(&self, max: usize, poll_timeout: Duration) -> Result<Vec<WorkItem>>;

    /// Try to take the per-discussion reclustering lock. Non-blocking;
    /// returns false when another holder exists.
    async fn acquire_lock(&self, discussion_id: &str, ttl: Duration) -> Result<bool>;

    async fn release_lock(&self, discussion_id: &str) -> Result<()>;

    async fn lock_held(&self, discussion_id: &str) -> Result<bool>;

    /// Park an idea while the discussion's lock is held.
    async fn defer(&self, discussion_id: &str, idea: &Idea) -> Result<()>;

    /// Atomically pop all deferred ideas for a discussion, oldest first.
    async fn drain_deferred(&self, discussion_id: &str) -> Result<Vec<Idea>>;

    /// Discussions with deferred ideas but no live lock — leftovers of a
    /// crashed drain that should be pushed back through the online engine.
    async fn orphaned_deferred(&self) -> Result<Vec<String>>;

    /// Put a TTL on any lock key that lost its expiry. Returns the number
    /// of keys repaired.
    async fn repair_lock_ttls(&self, ttl: Duration) -> Result<usize>;
}

#[derive(Clone)]
pub struct ValkeyQueue {
    conn: ConnectionManager,
    config: ValkeyConfig,
}

impl ValkeyQueue {
    /// Connect to Valkey and verify connectivity with a PING.
    pub async fn connect(config: ValkeyConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .with_context(|| format!("Failed to create Valkey client for URL: {}", config.url))?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Valkey")?;

        let mut ping_conn = conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut ping_conn)
            .await
            .context("Valkey PING failed — is the server reachable?")?;
        debug!("Valkey connected (PING → {pong})");

        Ok(Self { conn, config })
    }

    fn lock_key(&self, discussion_id: &str) -> String {
        format!("{}{}", self.config.lock_key_prefix, discussion_id)
    }

    fn deferred_key(&self, discussion_id: &str) -> String {
        format!("{}{}", self.config.deferred_key_prefix, discussion_id)
    }

    /// SCAN all keys matching `pattern`, batched to avoid the O(N) KEYS command.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .context("Valkey SCAN failed")?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl QueueService for ValkeyQueue {
    async fn enqueue(&self, idea_id: &str, discussion_id: &str) -> Result<()> {
        let item = WorkItem {
            idea_id: idea_id.to_string(),
            discussion_id: discussion_id.to_string(),
            enqueued_at: Utc::now(),
        };
        let payload = serde_json::to_string(&item).context("Failed to serialize work item")?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.config.work_queue_key, payload)
            .await
            .context("Failed to enqueue work item")?;
        Ok(())
    }

    async fn dequeue_batch(&self, max: usize, poll_timeout: Duration) -> Result<Vec<WorkItem>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut raw: Vec<String> = Vec::new();

        // Block briefly for the first item so idle polling stays cheap and
        // shutdown stays prompt.
        let first: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.config.work_queue_key)
            .arg(poll_timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .context("Failed to poll work queue")?;

        match first {
            Some((_, payload)) => raw.push(payload),
            None => return Ok(Vec::new()),
        }

        // Drain the rest of the batch without blocking.
        if max > 1 {
            let rest: Option<Vec<String>> = redis::cmd("RPOP")
                .arg(&self.config.work_queue_key)
                .arg(max - 1)
                .query_async(&mut conn)
                .await
                .context("Failed to drain work queue batch")?;
            raw.extend(rest.unwrap_or_default());
        }

        let mut items = Vec::with_capacity(raw.len());
        for payload in raw {
            match serde_json::from_str::<WorkItem>(&payload) {
                Ok(item) => items.push(item),
                Err(e) => warn!(error = %e, "Dropping malformed work item"),
            }
        }
        Ok(items)
    }

    async fn acquire_lock(&self, discussion_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(discussion_id))
            .arg("in_progress")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("Failed to acquire reclustering lock")?;
        Ok(acquired.is_some())
    }

    async fn release_lock(&self, discussion_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.lock_key(discussion_id))
            .await
            .context("Failed to release reclustering lock")?;
        Ok(())
    }

    async fn lock_held(&self, discussion_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let held: bool = conn
            .exists(self.lock_key(discussion_id))
            .await
            .context("Failed to check reclustering lock")?;
        Ok(held)
    }

    async fn defer(&self, discussion_id: &str, idea: &Idea) -> Result<()> {
        let payload = serde_json::to_string(idea).context("Failed to serialize deferred idea")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(self.deferred_key(discussion_id), payload)
            .await
            .context("Failed to defer idea")?;
        Ok(())
    }

    async fn drain_deferred(&self, discussion_id: &str) -> Result<Vec<Idea>> {
        let key = self.deferred_key(discussion_id);
        let mut conn = self.conn.clone();

        // LRANGE + DEL in one atomic transaction so concurrent defers either
        // land in this drain or in the next one, never in neither.
        let (raw, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await
            .context("Failed to drain deferred queue")?;

        // LPUSH stores newest first; reverse back to submission order.
        let mut ideas = Vec::with_capacity(raw.len());
        for payload in raw.into_iter().rev() {
            match serde_json::from_str::<Idea>(&payload) {
                Ok(idea) => ideas.push(idea),
                Err(e) => warn!(error = %e, "Dropping malformed deferred idea"),
            }
        }
        Ok(ideas)
    }

    async fn orphaned_deferred(&self) -> Result<Vec<String>> {
        let pattern = format!("{}*", self.config.deferred_key_prefix);
        let keys = self.scan_keys(&pattern).await?;

        let mut orphaned = Vec::new();
        for key in keys {
            let discussion_id = match key.strip_prefix(&self.config.deferred_key_prefix) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => continue,
            };
            if !self.lock_held(&discussion_id).await? {
                orphaned.push(discussion_id);
            }
        }
        Ok(orphaned)
    }

    async fn repair_lock_ttls(&self, ttl: Duration) -> Result<usize> {
        let pattern = format!("{}*", self.config.lock_key_prefix);
        let keys = self.scan_keys(&pattern).await?;

        let mut conn = self.conn.clone();
        let mut repaired = 0usize;
        for key in keys {
            let remaining: i64 = conn
                .ttl(&key)
                .await
                .context("Failed to read lock TTL")?;
            if remaining == -1 {
                let _: () = conn
                    .expire(&key, ttl.as_secs().max(1) as i64)
                    .await
                    .context("Failed to set lock TTL")?;
                warn!(key, "Repaired reclustering lock without TTL");
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}
