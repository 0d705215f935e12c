//! One chain step syncs a single Steam link, records the outcome on the link, and
//! dispatches the step for the link that follows it.
//!
//! A step never stops the chain: missing rows, upstream errors, timeouts, panics
//! inside the fetch and failed writes are all recorded and the walk continues.
//! The chain ends when there is no next id or the next row has vanished.
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::database_ops::jobs::JobQueue;
use crate::database_ops::models::{LinkWithGame, SyncStatus, SyncStatusUpdate, STEAM_SOURCE_ID};
use crate::database_ops::staleness;
use crate::database_ops::steam::SteamDataClient;
use crate::database_ops::store::SyncStore;
use crate::util::clock::Clock;
use crate::util::env as env_util;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("game_external_sources.id={link_id} not found")]
    NotFound { link_id: i64 },
    #[error("steam data fetch failed for link {link_id}: {message}")]
    UpstreamFetch { link_id: i64, message: String },
    #[error("steam data fetch for link {link_id} timed out after {secs}s")]
    Timeout { link_id: i64, secs: u64 },
    #[error("persisting sync result for link {link_id} failed: {message}")]
    Persistence { link_id: i64, message: String },
}

#[derive(Debug, Clone)]
pub struct SyncChainConfig {
    pub source_id: i64,
    pub fetch_timeout: std::time::Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub recheck_staleness: bool,
}

impl Default for SyncChainConfig {
    fn default() -> Self {
        Self {
            source_id: STEAM_SOURCE_ID,
            fetch_timeout: std::time::Duration::from_secs(30),
            retry_base: Duration::minutes(15),
            retry_max: Duration::hours(24),
            recheck_staleness: true,
        }
    }
}

impl SyncChainConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            source_id: env_util::env_parse("STEAM_SOURCE_ID", d.source_id),
            fetch_timeout: std::time::Duration::from_secs(env_util::env_parse(
                "SYNC_FETCH_TIMEOUT_SECS",
                30u64,
            )),
            retry_base: Duration::seconds(env_util::env_parse("SYNC_RETRY_BASE_SECS", 900i64)),
            retry_max: Duration::seconds(env_util::env_parse("SYNC_RETRY_MAX_SECS", 86_400i64)),
            recheck_staleness: env_util::env_flag("SYNC_RECHECK_STALENESS", d.recheck_staleness),
        }
    }

    /// Exponential backoff: `base * 2^(retry_count - 1)`, capped at `retry_max`.
    pub fn retry_delay(&self, retry_count: i32) -> Duration {
        let exp = retry_count.saturating_sub(1).clamp(0, 20) as u32;
        let secs = self
            .retry_base
            .num_seconds()
            .max(1)
            .saturating_mul(1i64 << exp);
        Duration::seconds(secs).min(self.retry_max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Synced,
    /// Still fresh at execution time; nothing fetched.
    Skipped,
    Missing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub link_id: i64,
    pub outcome: StepOutcome,
    /// `(link_id, next_link_id)` of the step dispatched after this one.
    pub dispatched: Option<(i64, Option<i64>)>,
}

pub struct SyncChain {
    store: Arc<dyn SyncStore>,
    steam: Arc<dyn SteamDataClient>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    cfg: SyncChainConfig,
}

impl SyncChain {
    pub fn new(
        store: Arc<dyn SyncStore>,
        steam: Arc<dyn SteamDataClient>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        cfg: SyncChainConfig,
    ) -> Self {
        Self {
            store,
            steam,
            queue,
            clock,
            cfg,
        }
    }

    pub fn config(&self) -> &SyncChainConfig {
        &self.cfg
    }

    /// Process `link_id`, then hand the sequence on. Only a failure to dispatch the
    /// next step is returned as an error; the link's outcome is recorded by then.
    #[instrument(skip(self), fields(source_id = self.cfg.source_id))]
    pub async fn run_step(&self, link_id: i64, next_link_id: Option<i64>) -> Result<StepReport> {
        let outcome = self.sync_link(link_id).await;
        let dispatched = self.advance(link_id, next_link_id).await?;
        Ok(StepReport {
            link_id,
            outcome,
            dispatched,
        })
    }

    /// First half of a step: sync one link and record the outcome on it. Never fails;
    /// every error ends up in the returned outcome.
    pub async fn sync_link(&self, link_id: i64) -> StepOutcome {
        match self.process(link_id).await {
            Ok(outcome) => outcome,
            Err(SyncError::NotFound { link_id }) => {
                warn!(link_id, "link not found; advancing chain");
                StepOutcome::Missing
            }
            Err(err) => {
                error!(link_id, error = %err, "chain step failed");
                StepOutcome::Failed(err.to_string())
            }
        }
    }

    /// Failure hook for a step whose sync phase died (panic, runner deadline):
    /// mark the link failed and still advance.
    pub async fn on_job_failed(
        &self,
        link_id: i64,
        next_link_id: Option<i64>,
        message: &str,
    ) -> Result<Option<(i64, Option<i64>)>> {
        match self.store.find_link(link_id).await {
            Ok(Some(row)) => {
                let now = self.clock.now();
                if let Err(err) = self.record_failure(&row, now, message).await {
                    error!(link_id, error = %err, "could not record job failure");
                }
            }
            Ok(None) => warn!(link_id, "failed job refers to a missing link"),
            Err(err) => error!(link_id, error = %err, "link lookup failed in failure hook"),
        }
        self.advance(link_id, next_link_id).await
    }

    async fn process(&self, link_id: i64) -> Result<StepOutcome, SyncError> {
        let row = self
            .store
            .find_link(link_id)
            .await
            .map_err(|e| SyncError::Persistence {
                link_id,
                message: format!("{e:#}"),
            })?
            .ok_or(SyncError::NotFound { link_id })?;
        let now = self.clock.now();

        if self.cfg.recheck_staleness {
            let verdict = staleness::evaluate(&row.game, &row.link, now);
            if !verdict.stale {
                let reason = verdict.reason.as_str();
                debug!(link_id, reason, "link still fresh; skipping fetch");
                return Ok(StepOutcome::Skipped);
            }
        }

        match self.fetch_and_store(&row, now).await {
            Ok(()) => {
                info!(link_id, game_id = row.game.id, "steam data synced");
                Ok(StepOutcome::Synced)
            }
            Err(err) => {
                error!(link_id, game_id = row.game.id, error = %err, "steam sync failed");
                self.record_failure(&row, now, &err.to_string()).await?;
                Ok(StepOutcome::Failed(err.to_string()))
            }
        }
    }

    async fn fetch_and_store(
        &self,
        row: &LinkWithGame,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let link_id = row.link.id;
        let uid = row.link.external_uid.as_str();
        let fetch = AssertUnwindSafe(self.steam.fetch_game_details(uid)).catch_unwind();
        let app = match tokio::time::timeout(self.cfg.fetch_timeout, fetch).await {
            Err(_) => {
                return Err(SyncError::Timeout {
                    link_id,
                    secs: self.cfg.fetch_timeout.as_secs(),
                })
            }
            Ok(Err(_panic)) => {
                return Err(SyncError::UpstreamFetch {
                    link_id,
                    message: "steam client panicked".into(),
                })
            }
            Ok(Ok(Err(e))) => {
                return Err(SyncError::UpstreamFetch {
                    link_id,
                    message: format!("{e:#}"),
                })
            }
            Ok(Ok(Ok(None))) => {
                return Err(SyncError::UpstreamFetch {
                    link_id,
                    message: format!("no Steam record for app {uid}"),
                })
            }
            Ok(Ok(Ok(Some(app)))) => app,
        };

        let steam_app_id = uid.trim().parse::<i64>().unwrap_or(app.appid);
        let persistence = |e: anyhow::Error| SyncError::Persistence {
            link_id,
            message: format!("{e:#}"),
        };
        self.store
            .upsert_steam_game_data(row.game.id, steam_app_id, &app.to_fields())
            .await
            .map_err(persistence)?;
        // Success clears the retry bookkeeping.
        self.store
            .update_sync_status(
                link_id,
                &SyncStatusUpdate {
                    status: SyncStatus::Synced,
                    last_synced_at: Some(now),
                    retry_count: 0,
                    next_retry_at: None,
                },
            )
            .await
            .map_err(persistence)
    }

    async fn record_failure(
        &self,
        row: &LinkWithGame,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<(), SyncError> {
        let link_id = row.link.id;
        let retry_count = row.link.retry_count.saturating_add(1);
        let next_retry_at = now + self.cfg.retry_delay(retry_count);
        self.store
            .update_sync_status(
                link_id,
                &SyncStatusUpdate {
                    status: SyncStatus::Failed,
                    last_synced_at: None,
                    retry_count,
                    next_retry_at: Some(next_retry_at),
                },
            )
            .await
            .map_err(|e| SyncError::Persistence {
                link_id,
                message: format!("{e:#}"),
            })?;
        warn!(link_id, retry_count, %next_retry_at, error = message, "link marked failed");
        Ok(())
    }

    /// Second half of a step: dispatch `(next, following)`. Safe to repeat; the queue
    /// drops a step whose link already has one in flight.
    pub async fn advance(
        &self,
        link_id: i64,
        next_link_id: Option<i64>,
    ) -> Result<Option<(i64, Option<i64>)>> {
        let Some(next) = next_link_id else {
            debug!(link_id, "end of chain");
            return Ok(None);
        };
        // Ids must strictly increase along a chain; anything else could loop forever.
        if next <= link_id {
            warn!(link_id, next_link_id = next, "non-increasing next id; terminating chain");
            return Ok(None);
        }
        let Some(next_row) = self.store.find_link(next).await? else {
            info!(link_id, next_link_id = next, "next link vanished; chain terminated");
            return Ok(None);
        };
        let following = self
            .store
            .find_next_link_id(next_row.link.external_game_source_id, next)
            .await?
            .filter(|id| *id > next);
        let queued = self.queue.enqueue_chain_step(next, following).await?;
        if !queued {
            info!(next_link_id = next, "step for next link already in flight");
        }
        Ok(Some((next, following)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::jobs::mock::MemoryJobQueue;
    use crate::database_ops::jobs::ChainStepPayload;
    use crate::database_ops::steam::SteamSpyApp;
    use crate::database_ops::store::mock::{game, steam_link, MockSyncStore};
    use crate::util::clock::FixedClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use indexmap::IndexMap;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Script {
        Ok(i64),
        Missing,
        Error,
        Hang,
        Panic,
    }

    #[derive(Default)]
    struct ScriptedSteam {
        scripts: Mutex<HashMap<String, Script>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedSteam {
        fn with(self, uid: &str, script: Script) -> Self {
            self.scripts.lock().unwrap().insert(uid.into(), script);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SteamDataClient for ScriptedSteam {
        async fn fetch_game_details(&self, external_uid: &str) -> Result<Option<SteamSpyApp>> {
            self.calls.lock().unwrap().push(external_uid.to_string());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(external_uid)
                .cloned()
                .unwrap_or(Script::Ok(1));
            match script {
                Script::Ok(ccu) => Ok(Some(SteamSpyApp {
                    appid: external_uid.parse().unwrap(),
                    name: Some(format!("App {external_uid}")),
                    owners: Some("20,000 .. 50,000".into()),
                    average_forever: Some(120),
                    ccu: Some(ccu),
                    price: Some(1999),
                    tags: IndexMap::from([("Indie".to_string(), 40)]),
                })),
                Script::Missing => Ok(None),
                Script::Error => Err(anyhow::anyhow!("SteamSpy returned 500")),
                Script::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(None)
                }
                Script::Panic => panic!("decoder blew up"),
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    struct Harness {
        store: Arc<MockSyncStore>,
        steam: Arc<ScriptedSteam>,
        queue: Arc<MemoryJobQueue>,
        chain: SyncChain,
    }

    fn harness(store: MockSyncStore, steam: ScriptedSteam, cfg: SyncChainConfig) -> Harness {
        let store = Arc::new(store);
        let steam = Arc::new(steam);
        let queue = Arc::new(MemoryJobQueue::new());
        let chain = SyncChain::new(
            store.clone(),
            steam.clone(),
            queue.clone(),
            Arc::new(FixedClock::new(now())),
            cfg,
        );
        Harness {
            store,
            steam,
            queue,
            chain,
        }
    }

    fn seeded_store() -> MockSyncStore {
        let store = MockSyncStore::new();
        for id in 1..=3 {
            store.insert_game(game(id, 0, Some(now() - Duration::days(400))));
            store.insert_link(steam_link(id * 10, id, &format!("{}", 100 + id), None));
        }
        store
    }

    #[tokio::test]
    async fn successful_step_syncs_and_dispatches_following_pair() {
        let h = harness(seeded_store(), ScriptedSteam::default(), SyncChainConfig::default());
        let report = h.chain.run_step(10, Some(20)).await.unwrap();

        assert_eq!(report.outcome, StepOutcome::Synced);
        assert_eq!(report.dispatched, Some((20, Some(30))));
        assert_eq!(h.queue.dispatched_steps(), vec![(20, Some(30))]);

        let link = h.store.link(10).unwrap();
        assert_eq!(link.sync_status, SyncStatus::Synced);
        assert_eq!(link.last_synced_at, Some(now()));
        let rows = h.store.steam_data_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].steam_app_id, 101);
        assert_eq!(rows[0].price, Some(1999));
    }

    #[tokio::test]
    async fn second_successful_sync_updates_the_same_row() {
        let cfg = SyncChainConfig {
            recheck_staleness: false,
            ..Default::default()
        };
        let steam = ScriptedSteam::default().with("101", Script::Ok(5));
        let h = harness(seeded_store(), steam, cfg);
        h.chain.run_step(10, None).await.unwrap();

        h.steam.scripts.lock().unwrap().insert("101".into(), Script::Ok(777));
        h.chain.run_step(10, None).await.unwrap();

        let rows = h.store.steam_data_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ccu, 777);
    }

    #[tokio::test]
    async fn missing_link_still_advances() {
        let store = seeded_store();
        store.remove_link(10);
        let h = harness(store, ScriptedSteam::default(), SyncChainConfig::default());

        let report = h.chain.run_step(10, Some(20)).await.unwrap();
        assert_eq!(report.outcome, StepOutcome::Missing);
        assert_eq!(h.queue.dispatched_steps(), vec![(20, Some(30))]);
        assert!(h.steam.calls().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_records_retry_and_advances() {
        let store = seeded_store();
        store.insert_link(GameExternalSourceExt::failed(steam_link(10, 1, "101", None), 2));
        let steam = ScriptedSteam::default().with("101", Script::Error);
        let h = harness(store, steam, SyncChainConfig::default());

        let report = h.chain.run_step(10, Some(20)).await.unwrap();
        assert!(matches!(report.outcome, StepOutcome::Failed(_)));

        let link = h.store.link(10).unwrap();
        assert_eq!(link.sync_status, SyncStatus::Failed);
        assert_eq!(link.retry_count, 3);
        let next_retry = link.next_retry_at.unwrap();
        assert!(next_retry > now());
        assert_eq!(next_retry, now() + Duration::minutes(60));
        assert_eq!(h.queue.dispatched_steps(), vec![(20, Some(30))]);
    }

    #[tokio::test]
    async fn unknown_app_counts_as_failure() {
        let steam = ScriptedSteam::default().with("101", Script::Missing);
        let h = harness(seeded_store(), steam, SyncChainConfig::default());
        let report = h.chain.run_step(10, None).await.unwrap();
        assert!(
            matches!(report.outcome, StepOutcome::Failed(ref m) if m.contains("no Steam record"))
        );
        assert_eq!(h.store.link(10).unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_treated_as_failure() {
        let steam = ScriptedSteam::default().with("101", Script::Hang);
        let cfg = SyncChainConfig {
            fetch_timeout: std::time::Duration::from_secs(5),
            ..Default::default()
        };
        let h = harness(seeded_store(), steam, cfg);
        let report = h.chain.run_step(10, Some(20)).await.unwrap();
        assert!(matches!(report.outcome, StepOutcome::Failed(ref m) if m.contains("timed out")));
        assert_eq!(h.store.link(10).unwrap().sync_status, SyncStatus::Failed);
        assert_eq!(report.dispatched, Some((20, Some(30))));
    }

    #[tokio::test]
    async fn panicking_client_is_caught_at_the_step_boundary() {
        let steam = ScriptedSteam::default().with("101", Script::Panic);
        let h = harness(seeded_store(), steam, SyncChainConfig::default());
        let report = h.chain.run_step(10, Some(20)).await.unwrap();
        assert!(matches!(report.outcome, StepOutcome::Failed(_)));
        assert_eq!(h.store.link(10).unwrap().sync_status, SyncStatus::Failed);
        assert_eq!(h.queue.dispatched_steps(), vec![(20, Some(30))]);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_stop_the_chain() {
        let store = seeded_store();
        store.set_fail_writes(true);
        let h = harness(store, ScriptedSteam::default(), SyncChainConfig::default());
        let report = h.chain.run_step(10, Some(20)).await.unwrap();
        assert!(matches!(report.outcome, StepOutcome::Failed(ref m) if m.contains("persisting")));
        assert_eq!(h.queue.dispatched_steps(), vec![(20, Some(30))]);
    }

    #[tokio::test]
    async fn success_after_failures_resets_retry_bookkeeping() {
        let store = seeded_store();
        store.insert_link(GameExternalSourceExt::failed(steam_link(10, 1, "101", None), 4));
        let h = harness(store, ScriptedSteam::default(), SyncChainConfig::default());
        h.chain.run_step(10, None).await.unwrap();
        let link = h.store.link(10).unwrap();
        assert_eq!(link.sync_status, SyncStatus::Synced);
        assert_eq!(link.retry_count, 0);
        assert_eq!(link.next_retry_at, None);
    }

    #[tokio::test]
    async fn fresh_link_is_skipped_but_chain_advances() {
        let store = seeded_store();
        store.insert_link(steam_link(10, 1, "101", Some(now() - Duration::days(1))));
        let h = harness(store, ScriptedSteam::default(), SyncChainConfig::default());
        let report = h.chain.run_step(10, Some(20)).await.unwrap();
        assert_eq!(report.outcome, StepOutcome::Skipped);
        assert!(h.steam.calls().is_empty());
        assert_eq!(report.dispatched, Some((20, Some(30))));
    }

    #[tokio::test]
    async fn vanished_next_link_terminates_silently() {
        let store = seeded_store();
        store.remove_link(20);
        let h = harness(store, ScriptedSteam::default(), SyncChainConfig::default());
        let report = h.chain.run_step(10, Some(20)).await.unwrap();
        assert_eq!(report.outcome, StepOutcome::Synced);
        assert_eq!(report.dispatched, None);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn non_increasing_next_id_is_refused() {
        let h = harness(seeded_store(), ScriptedSteam::default(), SyncChainConfig::default());
        let report = h.chain.run_step(20, Some(10)).await.unwrap();
        assert_eq!(report.dispatched, None);
        let report = h.chain.run_step(30, Some(30)).await.unwrap();
        assert_eq!(report.dispatched, None);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn failure_hook_marks_failed_and_advances() {
        let h = harness(seeded_store(), ScriptedSteam::default(), SyncChainConfig::default());
        let dispatched = h
            .chain
            .on_job_failed(10, Some(20), "worker crashed")
            .await
            .unwrap();
        assert_eq!(dispatched, Some((20, Some(30))));
        let link = h.store.link(10).unwrap();
        assert_eq!(link.sync_status, SyncStatus::Failed);
        assert_eq!(link.retry_count, 1);
    }

    #[tokio::test]
    async fn sync_link_records_without_dispatching_and_advance_repeats_safely() {
        let h = harness(seeded_store(), ScriptedSteam::default(), SyncChainConfig::default());
        assert_eq!(h.chain.sync_link(10).await, StepOutcome::Synced);
        assert!(h.queue.is_empty());

        assert_eq!(h.chain.advance(10, Some(20)).await.unwrap(), Some((20, Some(30))));
        assert_eq!(h.chain.advance(10, Some(20)).await.unwrap(), Some((20, Some(30))));
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.store.link(10).unwrap().sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn draining_the_queue_walks_the_whole_source() {
        let h = harness(seeded_store(), ScriptedSteam::default(), SyncChainConfig::default());
        h.chain.run_step(10, Some(20)).await.unwrap();
        while let Some(job) = h.queue.pop() {
            let p: ChainStepPayload = serde_json::from_value(job.payload).unwrap();
            h.chain.run_step(p.link_id, p.next_link_id).await.unwrap();
        }
        for id in [10, 20, 30] {
            assert_eq!(h.store.link(id).unwrap().sync_status, SyncStatus::Synced);
        }
        assert_eq!(h.steam.calls(), vec!["101", "102", "103"]);
        assert_eq!(h.store.steam_data_rows().len(), 3);
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let cfg = SyncChainConfig::default();
        assert_eq!(cfg.retry_delay(1), Duration::minutes(15));
        assert_eq!(cfg.retry_delay(2), Duration::minutes(30));
        assert_eq!(cfg.retry_delay(3), Duration::minutes(60));
        assert_eq!(cfg.retry_delay(12), Duration::hours(24));
        assert_eq!(cfg.retry_delay(i32::MAX), Duration::hours(24));
    }

    trait GameExternalSourceExt {
        fn failed(self, retry_count: i32) -> Self;
    }

    impl GameExternalSourceExt for crate::database_ops::models::GameExternalSource {
        fn failed(mut self, retry_count: i32) -> Self {
            self.sync_status = SyncStatus::Failed;
            self.retry_count = retry_count;
            self.next_retry_at = Some(now() - Duration::hours(1));
            self
        }
    }
}
