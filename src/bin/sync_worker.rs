// Long-running worker draining `sync_jobs`: Steam chain steps, IGDB refreshes,
// SteamGridDB artwork refreshes.

use anyhow::Result;
use gameshelf_sync::database_ops::db::Db;
use gameshelf_sync::database_ops::igdb::IgdbClient;
use gameshelf_sync::database_ops::jobs::PgJobQueue;
use gameshelf_sync::database_ops::steam::SteamSpyClient;
use gameshelf_sync::database_ops::steamgriddb::SteamGridDbClient;
use gameshelf_sync::database_ops::store::PgSyncStore;
use gameshelf_sync::database_ops::sync_chain::{SyncChain, SyncChainConfig};
use gameshelf_sync::database_ops::worker::{run_worker, JobHandler, WorkerConfig};
use gameshelf_sync::util::clock::SystemClock;
use gameshelf_sync::util::env as env_util;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_util::bootstrap_cli("sync_worker");
    gameshelf_sync::tracing::init_tracing("info,sqlx=warn")?;

    env_util::preflight_check(
        "sync_worker",
        &[],
        &[
            "DATABASE_URL",
            "WORKER_ID",
            "WORKER_CONCURRENCY",
            "JOB_KINDS",
            "STEAMSPY_BASE_URL",
            "STEAMGRIDDB_API_KEY",
            "TWITCH_CLIENT_ID",
            "TWITCH_CLIENT_SECRET",
        ],
    )?;

    let cfg = WorkerConfig::from_env();
    let database_url = env_util::db_url()?;
    let default_conns = ((cfg.concurrency as u32) * 4).max(5);
    let max_connections = env_util::env_parse("DB_MAX_CONNS", default_conns);
    let db = Db::connect(&database_url, max_connections).await?;

    let store = Arc::new(PgSyncStore::new(db.clone()));
    let queue = PgJobQueue::new(db.clone());
    let chain = Arc::new(SyncChain::new(
        store.clone(),
        Arc::new(SteamSpyClient::from_env()?),
        Arc::new(queue.clone()),
        Arc::new(SystemClock),
        SyncChainConfig::from_env(),
    ));

    let mut handler = JobHandler::new(store, chain, cfg.job_timeout);
    match IgdbClient::from_env() {
        Ok(client) => handler = handler.with_igdb(Arc::new(client)),
        Err(e) => warn!(error = %e, "IGDB jobs disabled"),
    }
    match SteamGridDbClient::from_env() {
        Ok(client) => handler = handler.with_artwork(Arc::new(client)),
        Err(e) => warn!(error = %e, "SteamGridDB jobs disabled"),
    }

    info!(worker_id = %cfg.worker_id, "starting sync worker");
    tokio::select! {
        res = run_worker(queue, Arc::new(handler), cfg) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested; in-flight jobs will be requeued on next start");
            Ok(())
        }
    }
}
