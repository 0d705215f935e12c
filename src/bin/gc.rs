use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use gameshelf_sync::database_ops::db::{self, Db};
use gameshelf_sync::database_ops::igdb::{self, IgdbClient};
use gameshelf_sync::database_ops::jobs::{
    mock::MemoryJobQueue, ChainStepPayload, JobQueue, PgJobQueue, ARTWORK_KIND, IGDB_GAME_KIND,
    STEAM_SYNC_KIND,
};
use gameshelf_sync::database_ops::scheduler::{BatchSelector, SelectorConfig, SyncScheduler};
use gameshelf_sync::database_ops::steam::SteamSpyClient;
use gameshelf_sync::database_ops::steamgriddb::{self, SteamGridDbClient};
use gameshelf_sync::database_ops::store::{PgSyncStore, SyncStore};
use gameshelf_sync::database_ops::sync_chain::{SyncChain, SyncChainConfig};
use gameshelf_sync::util::clock::SystemClock;
use gameshelf_sync::util::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gc", version, about = "Game shelf sync admin CLI")]
struct Cli {
    /// Optional override for the database URL
    #[arg(long, global = true)]
    db_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Select stale Steam links and seed a sync chain with the first two
    SyncStale {
        /// Print the selection without enqueueing
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run or enqueue one chain step
    SyncOne {
        link_id: i64,
        /// Next link in the chain (defaults to the following id in the source)
        #[arg(long)]
        next: Option<i64>,
        /// Process in this process and keep draining the chain instead of enqueueing
        #[arg(long, default_value_t = false)]
        inline: bool,
        /// Stop an inline drain after this many steps
        #[arg(long, default_value_t = 1)]
        max_steps: usize,
    },
    /// Count stale links per staleness rule without dispatching anything
    StaleReport {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run the selector every SYNC_SCHEDULE_INTERVAL_SECS
    Schedule {
        /// Run a single tick and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Refresh name, release date and cover of a game from IGDB
    IgdbRefresh {
        game_id: i64,
        /// Enqueue an `igdb.game` job instead of running now
        #[arg(long, default_value_t = false)]
        enqueue: bool,
    },
    /// Refresh hero/logo ids of a game from SteamGridDB
    ArtworkRefresh {
        game_id: i64,
        /// Enqueue a `steamgriddb.artwork` job instead of running now
        #[arg(long, default_value_t = false)]
        enqueue: bool,
    },
    /// Link sync status counts and job queue counts
    Status,
    /// Apply numbered SQL files from a migrations directory
    Migrate {
        #[arg(long, default_value = "./migrations")]
        dir: PathBuf,
    },
}

async fn connect(db_url: Option<String>) -> Result<Db> {
    let url = match db_url {
        Some(url) => url,
        None => env::db_url()?,
    };
    info!(url = %env::redact_postgres_url(&url), "connecting");
    Db::connect_no_migrate(&url, env::env_parse("DB_MAX_CONNS", 10u32)).await
}

fn selector(db: &Db) -> BatchSelector {
    BatchSelector::new(
        Arc::new(PgSyncStore::new(db.clone())),
        Arc::new(PgJobQueue::new(db.clone())),
        Arc::new(SystemClock),
        SelectorConfig::from_env(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    env::bootstrap_cli("gc");
    let _ = gameshelf_sync::tracing::init_tracing("info,sqlx=warn");

    if std::env::var_os("GC_LIST_SUBCOMMANDS").is_some() {
        let names: Vec<String> = Cli::command()
            .get_subcommands()
            .map(|cmd| cmd.get_name().to_string())
            .collect();
        eprintln!("available subcommands: {names:?}");
        return Ok(());
    }

    let cli = Cli::parse();
    let db = connect(cli.db_url).await?;

    match cli.command {
        Commands::SyncStale { dry_run } => {
            let selector = selector(&db);
            if dry_run {
                let selected = selector.select_stale_links().await?;
                for link in selected.iter().take(25) {
                    println!("{}\tgame={}\t{}", link.link_id, link.game_id, link.reason.as_str());
                }
                println!("{} stale link(s) selected (dry run)", selected.len());
            } else {
                let outcome = selector.seed_chain().await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
        }
        Commands::SyncOne {
            link_id,
            next,
            inline,
            max_steps,
        } => {
            let store: Arc<dyn SyncStore> = Arc::new(PgSyncStore::new(db.clone()));
            let cfg = SyncChainConfig::from_env();
            let next = match next {
                Some(n) => Some(n),
                None => store.find_next_link_id(cfg.source_id, link_id).await?,
            };
            if !inline {
                let queued = PgJobQueue::new(db.clone())
                    .enqueue_chain_step(link_id, next)
                    .await?;
                println!("enqueued={queued} link_id={link_id} next_link_id={next:?}");
                return Ok(());
            }
            let queue = Arc::new(MemoryJobQueue::new());
            let chain = SyncChain::new(
                store,
                Arc::new(SteamSpyClient::from_env()?),
                queue.clone(),
                Arc::new(SystemClock),
                cfg,
            );
            let mut step = Some(ChainStepPayload::new(link_id, next));
            let mut done = 0usize;
            while let Some(p) = step.take() {
                let report = chain.run_step(p.link_id, p.next_link_id).await?;
                println!("{}\t{:?}", report.link_id, report.outcome);
                done += 1;
                if done >= max_steps.max(1) {
                    break;
                }
                step = queue
                    .pop()
                    .map(|job| serde_json::from_value(job.payload))
                    .transpose()?;
            }
            if let Some(job) = queue.pop() {
                let pending: ChainStepPayload = serde_json::from_value(job.payload)?;
                println!(
                    "stopped after {done} step(s); resume with: gc sync-one {} --next {:?}",
                    pending.link_id, pending.next_link_id
                );
            }
        }
        Commands::StaleReport { json } => {
            let report = selector(&db).stale_report().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "scanned={} stale={} fresh={} waiting_retry={}",
                    report.scanned, report.stale, report.fresh, report.waiting_retry
                );
                for (reason, count) in &report.by_reason {
                    println!("  {reason:<24}{count}");
                }
            }
        }
        Commands::Schedule { once } => {
            let scheduler = Arc::new(SyncScheduler::from_env(Arc::new(selector(&db))));
            if once {
                let outcome = scheduler.run_once().await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                tokio::select! {
                    _ = scheduler.start() => {}
                    _ = tokio::signal::ctrl_c() => info!("schedule: interrupted"),
                }
            }
        }
        Commands::IgdbRefresh { game_id, enqueue } => {
            if enqueue {
                let queued = PgJobQueue::new(db.clone())
                    .enqueue_game_job(IGDB_GAME_KIND, game_id)
                    .await?;
                println!("enqueued={queued} kind={IGDB_GAME_KIND} game_id={game_id}");
            } else {
                let store = PgSyncStore::new(db.clone());
                let client = IgdbClient::from_env()?;
                let outcome = igdb::refresh_game(&store, &client, game_id).await?;
                println!("game {game_id}: {outcome:?}");
            }
        }
        Commands::ArtworkRefresh { game_id, enqueue } => {
            if enqueue {
                let queued = PgJobQueue::new(db.clone())
                    .enqueue_game_job(ARTWORK_KIND, game_id)
                    .await?;
                println!("enqueued={queued} kind={ARTWORK_KIND} game_id={game_id}");
            } else {
                let store = PgSyncStore::new(db.clone());
                let client = SteamGridDbClient::from_env()
                    .context("SteamGridDB client needs STEAMGRIDDB_API_KEY")?;
                let update = steamgriddb::refresh_artwork(&store, &client, game_id).await?;
                println!(
                    "game {game_id}: hero={:?} logo={:?}",
                    update.hero_image_id, update.logo_image_id
                );
            }
        }
        Commands::Status => {
            let source_id = SelectorConfig::from_env().source_id;
            let counts = PgSyncStore::new(db.clone()).status_counts(source_id).await?;
            println!(
                "links (source {source_id}): pending={} synced={} failed={}",
                counts.pending, counts.synced, counts.failed
            );
            let queue = PgJobQueue::new(db.clone());
            for kind in [STEAM_SYNC_KIND, IGDB_GAME_KIND, ARTWORK_KIND] {
                let rows = queue.status_counts(kind).await?;
                let rendered: Vec<String> = rows.iter().map(|(s, n)| format!("{s}={n}")).collect();
                println!("jobs {kind}: {}", rendered.join(" "));
            }
        }
        Commands::Migrate { dir } => {
            if !dir.is_dir() {
                bail!("migrations directory not found: {}", dir.display());
            }
            let files = db::migration_files(&dir)?;
            info!(count = files.len(), dir = %dir.display(), "applying migrations");
            db::run_migrations(&db.pool, &dir).await?;
            println!("migrations applied from {}", dir.display());
        }
    }

    Ok(())
}
