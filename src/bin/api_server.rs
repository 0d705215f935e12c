// HTTP control API for the Laravel front end.

use anyhow::Result;
use gameshelf_sync::api::{ApiServer, AppState};
use gameshelf_sync::database_ops::db::Db;
use gameshelf_sync::database_ops::jobs::PgJobQueue;
use gameshelf_sync::database_ops::scheduler::{BatchSelector, SelectorConfig};
use gameshelf_sync::database_ops::store::PgSyncStore;
use gameshelf_sync::util::clock::SystemClock;
use gameshelf_sync::util::env as env_util;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<()> {
    env_util::bootstrap_cli("api_server");
    gameshelf_sync::tracing::init_tracing("info,sqlx=warn,actix_web=info")?;

    env_util::preflight_check(
        "api_server",
        &["API_SECRET"],
        &["API_HOST", "API_PORT", "API_SECRET", "ALLOWED_ORIGINS", "DATABASE_URL"],
    )?;
    let server = ApiServer::from_env()?;

    let database_url = env_util::db_url()?;
    let max_connections: u32 = env_util::env_parse("DB_MAX_CONNS", 10u32);
    let db = Db::connect_no_migrate(&database_url, max_connections).await?;
    tracing::info!("database connected");

    let store = Arc::new(PgSyncStore::new(db.clone()));
    let selector = Arc::new(BatchSelector::new(
        store.clone(),
        Arc::new(PgJobQueue::new(db.clone())),
        Arc::new(SystemClock),
        SelectorConfig::from_env(),
    ));

    server.run(AppState::new(store, selector, Some(db))).await
}
