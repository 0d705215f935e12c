use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::database_ops::db::Db;
use crate::database_ops::models::{
    ExternalGameSource, Game, GameArtworkUpdate, GameExternalSource, GameMetadataUpdate,
    LinkWithGame, SteamGameData, SteamGameFields, SyncStatus, SyncStatusCounts, SyncStatusUpdate,
};

/// Persistence surface used by the sync chain, the batch selector and the API.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Link by id with its game and source definition eager-loaded.
    async fn find_link(&self, link_id: i64) -> Result<Option<LinkWithGame>>;

    /// Smallest link id greater than `after_id` within one external source.
    async fn find_next_link_id(&self, source_id: i64, after_id: i64) -> Result<Option<i64>>;

    /// One page of a source's links ordered by id, starting after `after_id`.
    async fn list_links(
        &self,
        source_id: i64,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<LinkWithGame>>;

    /// Insert or update in place the single Steam snapshot row of a game.
    async fn upsert_steam_game_data(
        &self,
        game_id: i64,
        steam_app_id: i64,
        fields: &SteamGameFields,
    ) -> Result<SteamGameData>;

    async fn update_sync_status(&self, link_id: i64, update: &SyncStatusUpdate) -> Result<()>;

    async fn find_game(&self, game_id: i64) -> Result<Option<Game>>;

    async fn steam_game_data_for_game(&self, game_id: i64) -> Result<Option<SteamGameData>>;

    async fn update_game_metadata(&self, game_id: i64, update: &GameMetadataUpdate) -> Result<()>;

    async fn update_game_artwork(&self, game_id: i64, update: &GameArtworkUpdate) -> Result<()>;

    async fn status_counts(&self, source_id: i64) -> Result<SyncStatusCounts>;

    /// The game's link uid for one source (e.g. its Steam app id).
    async fn external_uid_for_game(&self, game_id: i64, source_id: i64) -> Result<Option<String>>;
}

pub struct PgSyncStore {
    db: Db,
}

impl PgSyncStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

const LINK_SELECT: &str = "SELECT l.id, l.game_id, l.external_game_source_id, l.external_uid, \
        l.sync_status, l.last_synced_at, l.retry_count, l.next_retry_at, \
        g.igdb_id, g.name, g.first_release_date, g.update_priority, \
        g.cover_image_id, g.hero_image_id, g.logo_image_id, \
        s.igdb_category, s.name AS source_name \
     FROM game_external_sources l \
     JOIN games g ON g.id = l.game_id \
     JOIN external_game_sources s ON s.id = l.external_game_source_id";

const GAME_COLUMNS: &str = "id, igdb_id, name, first_release_date, update_priority, \
     cover_image_id, hero_image_id, logo_image_id";

const STEAM_DATA_COLUMNS: &str =
    "id, game_id, steam_app_id, owners, average_forever, ccu, price, tags, updated_at";

fn link_from_row(row: &PgRow) -> Result<LinkWithGame> {
    let status: String = row.try_get("sync_status")?;
    let link = GameExternalSource {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        external_game_source_id: row.try_get("external_game_source_id")?,
        external_uid: row.try_get("external_uid")?,
        sync_status: status.parse()?,
        last_synced_at: row.try_get("last_synced_at")?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
    };
    let game = Game {
        id: link.game_id,
        igdb_id: row.try_get("igdb_id")?,
        name: row.try_get("name")?,
        first_release_date: row.try_get("first_release_date")?,
        update_priority: row.try_get("update_priority")?,
        cover_image_id: row.try_get("cover_image_id")?,
        hero_image_id: row.try_get("hero_image_id")?,
        logo_image_id: row.try_get("logo_image_id")?,
    };
    let source = ExternalGameSource {
        id: link.external_game_source_id,
        igdb_category: row.try_get("igdb_category")?,
        name: row.try_get("source_name")?,
    };
    Ok(LinkWithGame { link, game, source })
}

fn steam_data_from_row(row: &PgRow) -> Result<SteamGameData> {
    let tags: sqlx::types::Json<IndexMap<String, i64>> = row.try_get("tags")?;
    Ok(SteamGameData {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        steam_app_id: row.try_get("steam_app_id")?,
        owners: row.try_get("owners")?,
        average_forever: row.try_get("average_forever")?,
        ccu: row.try_get("ccu")?,
        price: row.try_get("price")?,
        tags: tags.0,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn find_link(&self, link_id: i64) -> Result<Option<LinkWithGame>> {
        let row = sqlx::query(&format!("{LINK_SELECT} WHERE l.id = $1"))
            .bind(link_id)
            .fetch_optional(&self.db.pool)
            .await
            .with_context(|| format!("loading game_external_sources.id={link_id}"))?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn find_next_link_id(&self, source_id: i64, after_id: i64) -> Result<Option<i64>> {
        let next = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM game_external_sources \
             WHERE external_game_source_id = $1 AND id > $2 \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(source_id)
        .bind(after_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(next)
    }

    async fn list_links(
        &self,
        source_id: i64,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<LinkWithGame>> {
        let rows = sqlx::query(&format!(
            "{LINK_SELECT} WHERE l.external_game_source_id = $1 AND l.id > $2 \
             ORDER BY l.id ASC LIMIT $3"
        ))
        .bind(source_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(link_from_row).collect()
    }

    async fn upsert_steam_game_data(
        &self,
        game_id: i64,
        steam_app_id: i64,
        fields: &SteamGameFields,
    ) -> Result<SteamGameData> {
        let row = sqlx::query(&format!(
            "INSERT INTO steam_game_data \
                (game_id, steam_app_id, owners, average_forever, ccu, price, tags) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (game_id) DO UPDATE SET \
                steam_app_id = EXCLUDED.steam_app_id, \
                owners = EXCLUDED.owners, \
                average_forever = EXCLUDED.average_forever, \
                ccu = EXCLUDED.ccu, \
                price = EXCLUDED.price, \
                tags = EXCLUDED.tags, \
                updated_at = now() \
             RETURNING {STEAM_DATA_COLUMNS}"
        ))
        .bind(game_id)
        .bind(steam_app_id)
        .bind(&fields.owners)
        .bind(fields.average_forever)
        .bind(fields.ccu)
        .bind(fields.price)
        .bind(sqlx::types::Json(fields.tags.clone()))
        .fetch_one(&self.db.pool)
        .await
        .with_context(|| format!("upserting steam_game_data for game_id={game_id}"))?;
        steam_data_from_row(&row)
    }

    async fn update_sync_status(&self, link_id: i64, update: &SyncStatusUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE game_external_sources \
             SET sync_status = $2, \
                 last_synced_at = COALESCE($3, last_synced_at), \
                 retry_count = $4, \
                 next_retry_at = $5, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(link_id)
        .bind(update.status.as_str())
        .bind(update.last_synced_at)
        .bind(update.retry_count)
        .bind(update.next_retry_at)
        .execute(&self.db.pool)
        .await
        .with_context(|| format!("updating sync status of link {link_id}"))?;
        Ok(())
    }

    async fn find_game(&self, game_id: i64) -> Result<Option<Game>> {
        let game = sqlx::query_as::<_, Game>(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE id = $1"
        ))
        .bind(game_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(game)
    }

    async fn steam_game_data_for_game(&self, game_id: i64) -> Result<Option<SteamGameData>> {
        let row = sqlx::query(&format!(
            "SELECT {STEAM_DATA_COLUMNS} FROM steam_game_data WHERE game_id = $1"
        ))
        .bind(game_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(steam_data_from_row).transpose()
    }

    async fn update_game_metadata(&self, game_id: i64, update: &GameMetadataUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE games SET \
                name = COALESCE($2, name), \
                first_release_date = COALESCE($3, first_release_date), \
                cover_image_id = COALESCE($4, cover_image_id), \
                updated_at = now() \
             WHERE id = $1",
        )
        .bind(game_id)
        .bind(&update.name)
        .bind(update.first_release_date)
        .bind(&update.cover_image_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn update_game_artwork(&self, game_id: i64, update: &GameArtworkUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE games SET \
                hero_image_id = COALESCE($2, hero_image_id), \
                logo_image_id = COALESCE($3, logo_image_id), \
                updated_at = now() \
             WHERE id = $1",
        )
        .bind(game_id)
        .bind(&update.hero_image_id)
        .bind(&update.logo_image_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn status_counts(&self, source_id: i64) -> Result<SyncStatusCounts> {
        let rows = sqlx::query(
            "SELECT sync_status, COUNT(*) AS n FROM game_external_sources \
             WHERE external_game_source_id = $1 GROUP BY sync_status",
        )
        .bind(source_id)
        .fetch_all(&self.db.pool)
        .await?;
        let mut counts = SyncStatusCounts::default();
        for row in rows {
            let status: String = row.try_get("sync_status")?;
            let n: i64 = row.try_get("n")?;
            match status.parse::<SyncStatus>()? {
                SyncStatus::Pending => counts.pending = n,
                SyncStatus::Synced => counts.synced = n,
                SyncStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    async fn external_uid_for_game(&self, game_id: i64, source_id: i64) -> Result<Option<String>> {
        let uid = sqlx::query_scalar::<_, String>(
            "SELECT external_uid FROM game_external_sources \
             WHERE game_id = $1 AND external_game_source_id = $2 \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(game_id)
        .bind(source_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(uid)
    }
}

/// In-memory store for unit tests.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        games: BTreeMap<i64, Game>,
        sources: BTreeMap<i64, ExternalGameSource>,
        links: BTreeMap<i64, GameExternalSource>,
        steam_data: BTreeMap<i64, SteamGameData>,
        next_steam_data_id: i64,
    }

    #[derive(Default)]
    pub struct MockSyncStore {
        state: Mutex<State>,
        fail_writes: Mutex<bool>,
    }

    impl MockSyncStore {
        pub fn new() -> Self {
            let store = Self::default();
            store.insert_source(ExternalGameSource {
                id: crate::database_ops::models::STEAM_SOURCE_ID,
                igdb_category: 1,
                name: "Steam".into(),
            });
            store
        }

        fn state(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|p| p.into_inner())
        }

        pub fn insert_source(&self, source: ExternalGameSource) {
            self.state().sources.insert(source.id, source);
        }

        pub fn insert_game(&self, game: Game) {
            self.state().games.insert(game.id, game);
        }

        pub fn insert_link(&self, link: GameExternalSource) {
            self.state().links.insert(link.id, link);
        }

        pub fn remove_link(&self, link_id: i64) {
            self.state().links.remove(&link_id);
        }

        pub fn link(&self, link_id: i64) -> Option<GameExternalSource> {
            self.state().links.get(&link_id).cloned()
        }

        pub fn game(&self, game_id: i64) -> Option<Game> {
            self.state().games.get(&game_id).cloned()
        }

        pub fn steam_data_rows(&self) -> Vec<SteamGameData> {
            self.state().steam_data.values().cloned().collect()
        }

        /// Make every write fail, to exercise persistence-failure paths.
        pub fn set_fail_writes(&self, fail: bool) {
            *self.fail_writes.lock().unwrap_or_else(|p| p.into_inner()) = fail;
        }

        fn check_writable(&self) -> Result<()> {
            if *self.fail_writes.lock().unwrap_or_else(|p| p.into_inner()) {
                anyhow::bail!("mock store is read-only");
            }
            Ok(())
        }

        fn joined(state: &State, link: &GameExternalSource) -> Option<LinkWithGame> {
            Some(LinkWithGame {
                link: link.clone(),
                game: state.games.get(&link.game_id)?.clone(),
                source: state.sources.get(&link.external_game_source_id)?.clone(),
            })
        }
    }

    #[async_trait]
    impl SyncStore for MockSyncStore {
        async fn find_link(&self, link_id: i64) -> Result<Option<LinkWithGame>> {
            let state = self.state();
            Ok(state
                .links
                .get(&link_id)
                .and_then(|l| Self::joined(&state, l)))
        }

        async fn find_next_link_id(&self, source_id: i64, after_id: i64) -> Result<Option<i64>> {
            Ok(self
                .state()
                .links
                .range(after_id + 1..)
                .find(|(_, l)| l.external_game_source_id == source_id)
                .map(|(id, _)| *id))
        }

        async fn list_links(
            &self,
            source_id: i64,
            after_id: i64,
            limit: i64,
        ) -> Result<Vec<LinkWithGame>> {
            let state = self.state();
            Ok(state
                .links
                .range(after_id + 1..)
                .map(|(_, l)| l)
                .filter(|l| l.external_game_source_id == source_id)
                .filter_map(|l| Self::joined(&state, l))
                .take(limit.max(0) as usize)
                .collect())
        }

        async fn upsert_steam_game_data(
            &self,
            game_id: i64,
            steam_app_id: i64,
            fields: &SteamGameFields,
        ) -> Result<SteamGameData> {
            self.check_writable()?;
            let mut state = self.state();
            let id = match state.steam_data.get(&game_id) {
                Some(existing) => existing.id,
                None => {
                    state.next_steam_data_id += 1;
                    state.next_steam_data_id
                }
            };
            let row = SteamGameData {
                id,
                game_id,
                steam_app_id,
                owners: fields.owners.clone(),
                average_forever: fields.average_forever,
                ccu: fields.ccu,
                price: fields.price,
                tags: fields.tags.clone(),
                updated_at: Utc::now(),
            };
            state.steam_data.insert(game_id, row.clone());
            Ok(row)
        }

        async fn update_sync_status(&self, link_id: i64, update: &SyncStatusUpdate) -> Result<()> {
            self.check_writable()?;
            let mut state = self.state();
            if let Some(link) = state.links.get_mut(&link_id) {
                link.sync_status = update.status;
                if update.last_synced_at.is_some() {
                    link.last_synced_at = update.last_synced_at;
                }
                link.retry_count = update.retry_count;
                link.next_retry_at = update.next_retry_at;
            }
            Ok(())
        }

        async fn find_game(&self, game_id: i64) -> Result<Option<Game>> {
            Ok(self.game(game_id))
        }

        async fn steam_game_data_for_game(&self, game_id: i64) -> Result<Option<SteamGameData>> {
            Ok(self.state().steam_data.get(&game_id).cloned())
        }

        async fn update_game_metadata(
            &self,
            game_id: i64,
            update: &GameMetadataUpdate,
        ) -> Result<()> {
            self.check_writable()?;
            if let Some(game) = self.state().games.get_mut(&game_id) {
                if let Some(name) = &update.name {
                    game.name = name.clone();
                }
                if update.first_release_date.is_some() {
                    game.first_release_date = update.first_release_date;
                }
                if update.cover_image_id.is_some() {
                    game.cover_image_id = update.cover_image_id.clone();
                }
            }
            Ok(())
        }

        async fn update_game_artwork(
            &self,
            game_id: i64,
            update: &GameArtworkUpdate,
        ) -> Result<()> {
            self.check_writable()?;
            if let Some(game) = self.state().games.get_mut(&game_id) {
                if update.hero_image_id.is_some() {
                    game.hero_image_id = update.hero_image_id.clone();
                }
                if update.logo_image_id.is_some() {
                    game.logo_image_id = update.logo_image_id.clone();
                }
            }
            Ok(())
        }

        async fn status_counts(&self, source_id: i64) -> Result<SyncStatusCounts> {
            let mut counts = SyncStatusCounts::default();
            for link in self
                .state()
                .links
                .values()
                .filter(|l| l.external_game_source_id == source_id)
            {
                match link.sync_status {
                    SyncStatus::Pending => counts.pending += 1,
                    SyncStatus::Synced => counts.synced += 1,
                    SyncStatus::Failed => counts.failed += 1,
                }
            }
            Ok(counts)
        }

        async fn external_uid_for_game(
            &self,
            game_id: i64,
            source_id: i64,
        ) -> Result<Option<String>> {
            Ok(self
                .state()
                .links
                .values()
                .find(|l| l.game_id == game_id && l.external_game_source_id == source_id)
                .map(|l| l.external_uid.clone()))
        }
    }

    /// Shorthand fixtures for tests.
    pub fn game(id: i64, update_priority: i32, first_release_date: Option<DateTime<Utc>>) -> Game {
        Game {
            id,
            igdb_id: Some(1000 + id),
            name: format!("Game {id}"),
            first_release_date,
            update_priority,
            cover_image_id: None,
            hero_image_id: None,
            logo_image_id: None,
        }
    }

    pub fn steam_link(
        id: i64,
        game_id: i64,
        app_id: &str,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> GameExternalSource {
        GameExternalSource {
            id,
            game_id,
            external_game_source_id: crate::database_ops::models::STEAM_SOURCE_ID,
            external_uid: app_id.to_string(),
            sync_status: if last_synced_at.is_some() {
                SyncStatus::Synced
            } else {
                SyncStatus::Pending
            },
            last_synced_at,
            retry_count: 0,
            next_retry_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[tokio::test]
    async fn next_link_id_stays_within_source_and_ascends() {
        let store = MockSyncStore::new();
        store.insert_source(ExternalGameSource {
            id: 2,
            igdb_category: 5,
            name: "GOG".into(),
        });
        store.insert_game(game(1, 0, None));
        store.insert_link(steam_link(3, 1, "10", None));
        store.insert_link(GameExternalSource {
            external_game_source_id: 2,
            ..steam_link(5, 1, "gog-1", None)
        });
        store.insert_link(steam_link(8, 1, "20", None));

        assert_eq!(store.find_next_link_id(1, 3).await.unwrap(), Some(8));
        assert_eq!(store.find_next_link_id(1, 8).await.unwrap(), None);
        assert_eq!(store.find_next_link_id(2, 0).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_game() {
        let store = MockSyncStore::new();
        store.insert_game(game(1, 0, None));
        let first = SteamGameFields {
            ccu: 10,
            ..Default::default()
        };
        let second = SteamGameFields {
            ccu: 99,
            owners: Some("0 .. 20,000".into()),
            ..Default::default()
        };
        let a = store.upsert_steam_game_data(1, 570, &first).await.unwrap();
        let b = store.upsert_steam_game_data(1, 570, &second).await.unwrap();
        assert_eq!(a.id, b.id);
        let rows = store.steam_data_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ccu, 99);
        assert_eq!(rows[0].owners_bounds(), Some((0, 20_000)));
    }
}
