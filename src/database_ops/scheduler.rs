//! Batch selector and the scheduled trigger that seeds sync chains.
//!
//! The selector pages a source's links in id order, keeps the stale ones and
//! seeds a chain with the first two. The chain then walks the rest of the source
//! on its own.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::database_ops::jobs::JobQueue;
use crate::database_ops::models::{LinkWithGame, SyncStatus, STEAM_SOURCE_ID};
use crate::database_ops::staleness::{self, StalenessReason};
use crate::database_ops::store::SyncStore;
use crate::util::clock::Clock;
use crate::util::env as env_util;

const PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub source_id: i64,
    /// Upper bound on links returned by one selection.
    pub limit: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            source_id: STEAM_SOURCE_ID,
            limit: 500,
        }
    }
}

impl SelectorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            source_id: env_util::env_parse("STEAM_SOURCE_ID", d.source_id),
            limit: env_util::env_parse("SYNC_SELECT_LIMIT", d.limit).max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleLink {
    pub link_id: i64,
    pub game_id: i64,
    pub reason: StalenessReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedOutcome {
    pub selected: usize,
    /// `(first, second)` handed to the chain, if anything was stale.
    pub seeded: Option<(i64, Option<i64>)>,
    /// False when a step for `first` was already queued or running.
    pub queued: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StaleReport {
    pub scanned: usize,
    pub stale: usize,
    pub fresh: usize,
    /// Failed links still inside their retry window.
    pub waiting_retry: usize,
    pub by_reason: BTreeMap<&'static str, usize>,
}

enum Classification {
    Stale(StalenessReason),
    Fresh,
    WaitingRetry,
}

fn classify(row: &LinkWithGame, now: DateTime<Utc>) -> Classification {
    if row.link.sync_status == SyncStatus::Failed
        && row.link.next_retry_at.is_some_and(|at| at > now)
    {
        return Classification::WaitingRetry;
    }
    let verdict = staleness::evaluate(&row.game, &row.link, now);
    if verdict.stale {
        Classification::Stale(verdict.reason)
    } else {
        Classification::Fresh
    }
}

pub struct BatchSelector {
    store: Arc<dyn SyncStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    cfg: SelectorConfig,
}

impl BatchSelector {
    pub fn new(
        store: Arc<dyn SyncStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        cfg: SelectorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            cfg,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.cfg
    }

    /// Stale links of the source in ascending id order, at most `limit`.
    pub async fn select_stale_links(&self) -> Result<Vec<StaleLink>> {
        let now = self.clock.now();
        let mut out = Vec::new();
        let mut after_id = 0i64;
        'pages: loop {
            let page = self
                .store
                .list_links(self.cfg.source_id, after_id, PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else { break };
            after_id = last.link.id;
            for row in &page {
                if let Classification::Stale(reason) = classify(row, now) {
                    out.push(StaleLink {
                        link_id: row.link.id,
                        game_id: row.game.id,
                        reason,
                    });
                    if out.len() >= self.cfg.limit {
                        break 'pages;
                    }
                }
            }
            if (page.len() as i64) < PAGE_SIZE {
                break;
            }
        }
        debug!(source_id = self.cfg.source_id, selected = out.len(), "stale selection");
        Ok(out)
    }

    /// Select stale links and submit the first chain step `(first, second)`.
    pub async fn seed_chain(&self) -> Result<SeedOutcome> {
        let selected = self.select_stale_links().await?;
        let Some(first) = selected.first() else {
            info!(source_id = self.cfg.source_id, "no stale links; nothing to seed");
            return Ok(SeedOutcome {
                selected: 0,
                seeded: None,
                queued: false,
            });
        };
        let second = selected.get(1).map(|s| s.link_id);
        let queued = self.queue.enqueue_chain_step(first.link_id, second).await?;
        info!(
            source_id = self.cfg.source_id,
            selected = selected.len(),
            link_id = first.link_id,
            next_link_id = ?second,
            queued,
            "sync chain seeded"
        );
        Ok(SeedOutcome {
            selected: selected.len(),
            seeded: Some((first.link_id, second)),
            queued,
        })
    }

    /// Classify every link of the source without dispatching anything.
    pub async fn stale_report(&self) -> Result<StaleReport> {
        let now = self.clock.now();
        let mut report = StaleReport::default();
        let mut after_id = 0i64;
        loop {
            let page = self
                .store
                .list_links(self.cfg.source_id, after_id, PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else { break };
            after_id = last.link.id;
            for row in &page {
                report.scanned += 1;
                match classify(row, now) {
                    Classification::Stale(reason) => {
                        report.stale += 1;
                        *report.by_reason.entry(reason.as_str()).or_default() += 1;
                    }
                    Classification::Fresh => report.fresh += 1,
                    Classification::WaitingRetry => report.waiting_retry += 1,
                }
            }
            if (page.len() as i64) < PAGE_SIZE {
                break;
            }
        }
        Ok(report)
    }
}

/// Runs the selector on a fixed interval. A tick that fires while the previous
/// run is still going is skipped.
pub struct SyncScheduler {
    selector: Arc<BatchSelector>,
    every: Duration,
    running: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(selector: Arc<BatchSelector>, every: Duration) -> Self {
        Self {
            selector,
            every,
            running: Mutex::new(()),
        }
    }

    pub fn from_env(selector: Arc<BatchSelector>) -> Self {
        let secs = env_util::env_parse("SYNC_SCHEDULE_INTERVAL_SECS", 3600u64).max(1);
        Self::new(selector, Duration::from_secs(secs))
    }

    /// `Ok(None)` when another run holds the guard.
    pub async fn run_once(&self) -> Result<Option<SeedOutcome>> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("previous scheduled run still active; skipping tick");
            return Ok(None);
        };
        self.selector.seed_chain().await.map(Some)
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(every_secs = self.every.as_secs(), "sync scheduler started");
        loop {
            ticker.tick().await;
            let this = self.clone();
            // Spawned so a slow run does not hold up the ticker; the guard skips overlaps.
            tokio::spawn(async move {
                if let Err(e) = this.run_once().await {
                    error!(error = %e, "scheduled sync run failed");
                }
            });
        }
    }
}
