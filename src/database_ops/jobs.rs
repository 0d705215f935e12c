use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::Row;
use tracing::debug;

use crate::database_ops::db::Db;

pub const STEAM_SYNC_KIND: &str = "steam.sync";
pub const IGDB_GAME_KIND: &str = "igdb.game";
pub const ARTWORK_KIND: &str = "steamgriddb.artwork";

/// Payload of one chain step: sync `link_id`, then continue from `next_link_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStepPayload {
    pub link_id: i64,
    #[serde(default)]
    pub next_link_id: Option<i64>,
    /// Set on retry once the link's outcome is recorded: only the next step is dispatched.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dispatch_only: bool,
}

impl ChainStepPayload {
    pub fn new(link_id: i64, next_link_id: Option<i64>) -> Self {
        Self {
            link_id,
            next_link_id,
            dispatch_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameJobPayload {
    pub game_id: i64,
}

pub fn chain_dedupe_key(link_id: i64) -> String {
    format!("{STEAM_SYNC_KIND}:{link_id}")
}

pub fn game_dedupe_key(kind: &str, game_id: i64) -> String {
    format!("{kind}:{game_id}")
}

/// Outbound dispatch primitive. Both methods return `false` when an identical job is
/// already queued or running, which keeps at most one step per link in flight.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue_chain_step(&self, link_id: i64, next_link_id: Option<i64>) -> Result<bool>;

    async fn enqueue_game_job(&self, kind: &str, game_id: i64) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub kind: String,
    pub payload: Value,
    pub attempts: i32,
}

/// `sync_jobs`-backed queue.
#[derive(Clone)]
pub struct PgJobQueue {
    db: Db,
}

impl PgJobQueue {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    // Finished rows with the same key are recycled; active ones are left alone.
    async fn enqueue(&self, kind: &str, dedupe_key: &str, payload: Value) -> Result<bool> {
        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO sync_jobs(kind, dedupe_key, payload) VALUES ($1, $2, $3) \
             ON CONFLICT (dedupe_key) DO UPDATE SET \
                payload = EXCLUDED.payload, status = 'queued', attempts = 0, \
                scheduled_at = now(), finished_at = NULL, last_error = NULL, updated_at = now() \
             WHERE sync_jobs.status IN ('done', 'failed') \
             RETURNING id",
        )
        .bind(kind)
        .bind(dedupe_key)
        .bind(&payload)
        .fetch_optional(&self.db.pool)
        .await?;
        debug!(kind, dedupe_key, queued = inserted.is_some(), "enqueue");
        Ok(inserted.is_some())
    }

    pub async fn claim_next(
        &self,
        worker_id: &str,
        kinds: Option<&[String]>,
    ) -> Result<Option<JobRow>> {
        let mut tx = self.db.pool.begin().await?;
        let rec = sqlx::query(
            "SELECT id, kind, payload, attempts FROM sync_jobs \
             WHERE status = 'queued' AND scheduled_at <= now() \
               AND ($1::text[] IS NULL OR kind = ANY($1)) \
             ORDER BY priority ASC, scheduled_at ASC, id ASC \
             FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .bind(kinds)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = rec else {
            tx.rollback().await?;
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        sqlx::query(
            "UPDATE sync_jobs \
             SET status = 'running', locked_at = now(), locked_by = $2, attempts = attempts + 1, \
                 started_at = COALESCE(started_at, now()), updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(JobRow {
            id,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get::<i32, _>("attempts")? + 1,
        }))
    }

    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'done', finished_at = now(), updated_at = now(), \
             last_error = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Requeue with `attempts * 60s` backoff until `max_attempts`, then park as failed.
    pub async fn fail(&self, id: i64, err: &str) -> Result<()> {
        self.requeue_with_backoff(id, err, false).await
    }

    /// `fail` for a chain step whose link outcome is already recorded: the retry only
    /// dispatches the next step.
    pub async fn fail_dispatch_only(&self, id: i64, err: &str) -> Result<()> {
        self.requeue_with_backoff(id, err, true).await
    }

    async fn requeue_with_backoff(&self, id: i64, err: &str, dispatch_only: bool) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs \
             SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END, \
                 finished_at = CASE WHEN attempts >= max_attempts THEN now() ELSE NULL END, \
                 scheduled_at = CASE WHEN attempts < max_attempts \
                     THEN now() + make_interval(secs => (attempts * 60)) ELSE scheduled_at END, \
                 payload = CASE WHEN $3 \
                     THEN payload || jsonb_build_object('dispatch_only', true) ELSE payload END, \
                 last_error = $2, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(err)
        .bind(dispatch_only)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Park as failed without another attempt.
    pub async fn close_failed(&self, id: i64, err: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', finished_at = now(), last_error = $2, \
             updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(err)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Counts of rows per status for one kind.
    pub async fn status_counts(&self, kind: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM sync_jobs WHERE kind = $1 \
             GROUP BY status ORDER BY status",
        )
        .bind(kind)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    /// Put rows stuck in `running` (crashed worker) back in the queue.
    pub async fn requeue_stale_running(&self, older_than_secs: i64) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE sync_jobs SET status = 'queued', locked_at = NULL, locked_by = NULL, \
             updated_at = now() \
             WHERE status = 'running' \
               AND locked_at < now() - make_interval(secs => $1::double precision)",
        )
        .bind(older_than_secs as f64)
        .execute(&self.db.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue_chain_step(&self, link_id: i64, next_link_id: Option<i64>) -> Result<bool> {
        let payload = serde_json::to_value(ChainStepPayload::new(link_id, next_link_id))?;
        self.enqueue(STEAM_SYNC_KIND, &chain_dedupe_key(link_id), payload)
            .await
    }

    async fn enqueue_game_job(&self, kind: &str, game_id: i64) -> Result<bool> {
        if kind != IGDB_GAME_KIND && kind != ARTWORK_KIND {
            return Err(anyhow!("unsupported game job kind: {kind}"));
        }
        self.enqueue(kind, &game_dedupe_key(kind, game_id), json!({ "game_id": game_id }))
            .await
    }
}

/// In-process queue used by tests and the `gc sync-one --inline` drain.
pub mod mock {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct QueuedJob {
        pub kind: String,
        pub dedupe_key: String,
        pub payload: Value,
    }

    #[derive(Default)]
    struct Inner {
        pending: VecDeque<QueuedJob>,
        keys: HashSet<String>,
        history: Vec<QueuedJob>,
    }

    #[derive(Default)]
    pub struct MemoryJobQueue {
        inner: Mutex<Inner>,
    }

    impl MemoryJobQueue {
        pub fn new() -> Self {
            Self::default()
        }

        fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|p| p.into_inner())
        }

        fn push(&self, job: QueuedJob) -> bool {
            let mut inner = self.inner();
            if !inner.keys.insert(job.dedupe_key.clone()) {
                return false;
            }
            inner.history.push(job.clone());
            inner.pending.push_back(job);
            true
        }

        /// Take the oldest pending job; its dedupe key is released.
        pub fn pop(&self) -> Option<QueuedJob> {
            let mut inner = self.inner();
            let job = inner.pending.pop_front()?;
            inner.keys.remove(&job.dedupe_key);
            Some(job)
        }

        pub fn len(&self) -> usize {
            self.inner().pending.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Every job ever accepted, in order.
        pub fn history(&self) -> Vec<QueuedJob> {
            self.inner().history.clone()
        }

        /// Chain steps ever accepted, as `(link_id, next_link_id)`.
        pub fn dispatched_steps(&self) -> Vec<(i64, Option<i64>)> {
            self.history()
                .into_iter()
                .filter(|j| j.kind == STEAM_SYNC_KIND)
                .filter_map(|j| serde_json::from_value::<ChainStepPayload>(j.payload).ok())
                .map(|p| (p.link_id, p.next_link_id))
                .collect()
        }
    }

    #[async_trait]
    impl JobQueue for MemoryJobQueue {
        async fn enqueue_chain_step(
            &self,
            link_id: i64,
            next_link_id: Option<i64>,
        ) -> Result<bool> {
            Ok(self.push(QueuedJob {
                kind: STEAM_SYNC_KIND.to_string(),
                dedupe_key: chain_dedupe_key(link_id),
                payload: serde_json::to_value(ChainStepPayload::new(link_id, next_link_id))?,
            }))
        }

        async fn enqueue_game_job(&self, kind: &str, game_id: i64) -> Result<bool> {
            Ok(self.push(QueuedJob {
                kind: kind.to_string(),
                dedupe_key: game_dedupe_key(kind, game_id),
                payload: json!({ "game_id": game_id }),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MemoryJobQueue;
    use super::*;

    #[tokio::test]
    async fn duplicate_chain_step_is_not_queued_twice() {
        let q = MemoryJobQueue::new();
        assert!(q.enqueue_chain_step(4, Some(9)).await.unwrap());
        assert!(!q.enqueue_chain_step(4, Some(12)).await.unwrap());
        assert_eq!(q.len(), 1);

        let job = q.pop().unwrap();
        let payload: ChainStepPayload = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload, ChainStepPayload::new(4, Some(9)));
        // Once taken, the same link can be dispatched again.
        assert!(q.enqueue_chain_step(4, None).await.unwrap());
        assert_eq!(q.dispatched_steps(), vec![(4, Some(9)), (4, None)]);
    }

    #[test]
    fn chain_payload_tolerates_missing_next() {
        let p: ChainStepPayload = serde_json::from_value(json!({"link_id": 7})).unwrap();
        assert_eq!(p.next_link_id, None);
        assert!(!p.dispatch_only);
    }

    #[test]
    fn dispatch_only_flag_is_omitted_unless_set() {
        let fresh = serde_json::to_value(ChainStepPayload::new(7, Some(8))).unwrap();
        assert_eq!(fresh, json!({"link_id": 7, "next_link_id": 8}));

        let retried: ChainStepPayload =
            serde_json::from_value(json!({"link_id": 7, "next_link_id": 8, "dispatch_only": true}))
                .unwrap();
        assert!(retried.dispatch_only);
    }
}
