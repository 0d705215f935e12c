//! `sync_jobs` worker: claims jobs, routes them by kind, records outcomes.
use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    task::JoinSet,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::database_ops::igdb::{self, IgdbApi};
use crate::database_ops::jobs::{
    ChainStepPayload, GameJobPayload, JobRow, PgJobQueue, ARTWORK_KIND, IGDB_GAME_KIND,
    STEAM_SYNC_KIND,
};
use crate::database_ops::steamgriddb::{self, ArtworkApi};
use crate::database_ops::store::SyncStore;
use crate::database_ops::sync_chain::SyncChain;
use crate::util::env as env_util;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub kinds: Option<Vec<String>>,
    /// Hard deadline for one job, on top of the chain's own fetch timeout.
    pub job_timeout: Duration,
    /// Rows left `running` longer than this are requeued at startup.
    pub stale_running_secs: i64,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            worker_id: env_util::env_opt("WORKER_ID")
                .unwrap_or_else(|| format!("pid-{}", std::process::id())),
            concurrency: env_util::env_parse("WORKER_CONCURRENCY", 1usize).max(1),
            poll_interval: Duration::from_secs(env_util::env_parse("WORKER_POLL_INTERVAL_SECS", 2)),
            error_backoff: Duration::from_secs(env_util::env_parse("WORKER_ERROR_BACKOFF_SECS", 5)),
            kinds: env_util::env_list("JOB_KINDS").filter(|k| !k.is_empty()),
            job_timeout: Duration::from_secs(env_util::env_parse("WORKER_JOB_TIMEOUT_SECS", 300)),
            stale_running_secs: env_util::env_parse("WORKER_STALE_RUNNING_SECS", 900),
        }
    }
}

/// What happened to a job, from the queue's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    Done,
    /// Failure already accounted for (link marked failed, chain advanced); do not retry.
    Closed(String),
    /// Retry with attempt backoff.
    Retry(String),
    /// The link's outcome is recorded but the next step was not dispatched; the retry
    /// only dispatches.
    RetryDispatch(String),
}

/// Routes a job kind to its handler. IGDB and SteamGridDB are optional so a worker
/// can run with only Steam credentials.
pub struct JobHandler {
    store: Arc<dyn SyncStore>,
    chain: Arc<SyncChain>,
    igdb: Option<Arc<dyn IgdbApi>>,
    artwork: Option<Arc<dyn ArtworkApi>>,
    job_timeout: Duration,
}

impl JobHandler {
    pub fn new(store: Arc<dyn SyncStore>, chain: Arc<SyncChain>, job_timeout: Duration) -> Self {
        Self {
            store,
            chain,
            igdb: None,
            artwork: None,
            job_timeout,
        }
    }

    pub fn with_igdb(mut self, igdb: Arc<dyn IgdbApi>) -> Self {
        self.igdb = Some(igdb);
        self
    }

    pub fn with_artwork(mut self, artwork: Arc<dyn ArtworkApi>) -> Self {
        self.artwork = Some(artwork);
        self
    }

    async fn dispatch(&self, kind: &str, payload: &Value) -> Result<()> {
        match kind {
            IGDB_GAME_KIND => {
                let p: GameJobPayload = serde_json::from_value(payload.clone())?;
                let api = self
                    .igdb
                    .as_deref()
                    .ok_or_else(|| anyhow!("IGDB client not configured"))?;
                igdb::refresh_game(self.store.as_ref(), api, p.game_id).await?;
                Ok(())
            }
            ARTWORK_KIND => {
                let p: GameJobPayload = serde_json::from_value(payload.clone())?;
                let api = self
                    .artwork
                    .as_deref()
                    .ok_or_else(|| anyhow!("SteamGridDB client not configured"))?;
                steamgriddb::refresh_artwork(self.store.as_ref(), api, p.game_id).await?;
                Ok(())
            }
            other => Err(anyhow!("unknown job kind: {other}")),
        }
    }

    /// Run `fut` under the job deadline with panics caught.
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let run = AssertUnwindSafe(fut).catch_unwind();
        match tokio::time::timeout(self.job_timeout, run).await {
            Err(_) => Err(anyhow!("job exceeded {}s deadline", self.job_timeout.as_secs())),
            Ok(Err(_)) => Err(anyhow!("job handler panicked")),
            Ok(Ok(res)) => res,
        }
    }

    /// Run one job under a deadline with panics caught.
    pub async fn handle(&self, kind: &str, payload: &Value) -> JobDisposition {
        if kind == STEAM_SYNC_KIND {
            return self.handle_chain_step(payload).await;
        }
        match self.guarded(self.dispatch(kind, payload)).await {
            Ok(()) => JobDisposition::Done,
            Err(err) => JobDisposition::Retry(format!("{err:#}")),
        }
    }

    /// A chain step runs in two phases so a failed dispatch never touches the outcome
    /// already recorded on the link. Only a sync phase that died (deadline, panic) goes
    /// through the chain's failure hook.
    async fn handle_chain_step(&self, payload: &Value) -> JobDisposition {
        let p: ChainStepPayload = match serde_json::from_value(payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobDisposition::Closed(format!("invalid chain step payload: {e}")),
        };

        if !p.dispatch_only {
            let sync = async { Ok::<_, anyhow::Error>(self.chain.sync_link(p.link_id).await) };
            match self.guarded(sync).await {
                Ok(outcome) => debug!(link_id = p.link_id, ?outcome, "chain link processed"),
                Err(err) => return self.fail_chain_step(&p, format!("{err:#}")).await,
            }
        }

        match self.guarded(self.chain.advance(p.link_id, p.next_link_id)).await {
            Ok(_) => JobDisposition::Done,
            Err(err) => {
                error!(link_id = p.link_id, error = %err, "could not dispatch next chain step");
                JobDisposition::RetryDispatch(format!("{err:#}"))
            }
        }
    }

    async fn fail_chain_step(&self, p: &ChainStepPayload, err: String) -> JobDisposition {
        match self
            .chain
            .on_job_failed(p.link_id, p.next_link_id, &err)
            .await
        {
            Ok(_) => JobDisposition::Closed(err),
            // The failure is on the link; only the dispatch is left to retry.
            Err(hook_err) => {
                error!(link_id = p.link_id, error = %hook_err, "chain failure hook failed");
                JobDisposition::RetryDispatch(format!("{err}; failure hook: {hook_err:#}"))
            }
        }
    }
}

async fn settle(queue: &PgJobQueue, job: &JobRow, disposition: JobDisposition) {
    let res = match &disposition {
        JobDisposition::Done => {
            info!(job_id = job.id, kind = %job.kind, "job completed");
            queue.complete(job.id).await
        }
        JobDisposition::Closed(err) => {
            warn!(job_id = job.id, kind = %job.kind, error = %err, "job failed; chain advanced");
            queue.close_failed(job.id, err).await
        }
        JobDisposition::Retry(err) => {
            let attempts = job.attempts;
            error!(job_id = job.id, kind = %job.kind, attempts, error = %err, "job failed");
            queue.fail(job.id, err).await
        }
        JobDisposition::RetryDispatch(err) => {
            let attempts = job.attempts;
            error!(job_id = job.id, attempts, error = %err, "chain dispatch failed; will retry");
            queue.fail_dispatch_only(job.id, err).await
        }
    };
    if let Err(db_err) = res {
        error!(job_id = job.id, error = %db_err, "failed to record job outcome");
    }
}

/// Poll-and-claim loop; never returns under normal operation.
pub async fn run_worker(
    queue: PgJobQueue,
    handler: Arc<JobHandler>,
    cfg: WorkerConfig,
) -> Result<()> {
    let requeued = queue.requeue_stale_running(cfg.stale_running_secs).await?;
    if requeued > 0 {
        warn!(requeued, "requeued jobs left running by a previous worker");
    }
    info!(
        worker_id = %cfg.worker_id,
        concurrency = cfg.concurrency,
        poll_secs = cfg.poll_interval.as_secs(),
        kinds = ?cfg.kinds,
        "sync worker started"
    );

    let queue = Arc::new(queue);
    let mut set: JoinSet<()> = JoinSet::new();
    let mut ticker = interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        while set.len() < cfg.concurrency {
            match queue.claim_next(&cfg.worker_id, cfg.kinds.as_deref()).await {
                Ok(Some(job)) => {
                    let queue = queue.clone();
                    let handler = handler.clone();
                    set.spawn(async move {
                        let attempts = job.attempts;
                        info!(job_id = job.id, kind = %job.kind, attempts, "processing job");
                        let disposition = handler.handle(&job.kind, &job.payload).await;
                        settle(&queue, &job, disposition).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "error claiming job; backing off");
                    tokio::time::sleep(cfg.error_backoff).await;
                    break;
                }
            }
        }

        tokio::select! {
            Some(res) = set.join_next(), if !set.is_empty() => {
                if let Err(join_err) = res {
                    error!(error = %join_err, "worker task panicked");
                }
            }
            _ = ticker.tick() => {
                if set.is_empty() {
                    debug!(worker_id = %cfg.worker_id, "idle tick");
                }
            }
        }
    }
}
