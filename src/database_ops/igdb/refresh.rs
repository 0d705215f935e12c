use anyhow::{anyhow, Result};
use tracing::{info, warn};

use super::client::IgdbApi;
use crate::database_ops::store::SyncStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    /// Game has no IGDB id.
    Unlinked,
    /// IGDB returned nothing for the id.
    NotFound,
}

/// Pull name, release date and cover id for one game from IGDB and write them back.
/// Fields IGDB leaves empty keep their stored values.
pub async fn refresh_game(
    store: &dyn SyncStore,
    igdb: &dyn IgdbApi,
    game_id: i64,
) -> Result<RefreshOutcome> {
    let game = store
        .find_game(game_id)
        .await?
        .ok_or_else(|| anyhow!("games.id={game_id} not found"))?;
    let Some(igdb_id) = game.igdb_id else {
        warn!(game_id, "game has no igdb_id; skipping refresh");
        return Ok(RefreshOutcome::Unlinked);
    };
    let Some(remote) = igdb.fetch_game(igdb_id).await? else {
        warn!(game_id, igdb_id, "IGDB has no record for game");
        return Ok(RefreshOutcome::NotFound);
    };
    store.update_game_metadata(game_id, &remote.to_update()).await?;
    info!(game_id, igdb_id, "game metadata refreshed from IGDB");
    Ok(RefreshOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::igdb::client::{IgdbCover, IgdbGame};
    use crate::database_ops::store::mock::{game, MockSyncStore};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct OneGame(Option<IgdbGame>);

    #[async_trait]
    impl IgdbApi for OneGame {
        async fn fetch_game(&self, _igdb_id: i64) -> Result<Option<IgdbGame>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn refresh_overwrites_metadata_but_keeps_missing_fields() {
        let store = MockSyncStore::new();
        let released = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store.insert_game(game(5, 0, Some(released)));
        let api = OneGame(Some(IgdbGame {
            id: 1005,
            name: Some("Renamed".into()),
            first_release_date: None,
            cover: Some(IgdbCover {
                image_id: Some("co9abc".into()),
            }),
        }));

        let outcome = refresh_game(&store, &api, 5).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Updated);
        let g = store.game(5).unwrap();
        assert_eq!(g.name, "Renamed");
        assert_eq!(g.first_release_date, Some(released));
        assert_eq!(g.cover_image_id.as_deref(), Some("co9abc"));
    }

    #[tokio::test]
    async fn unlinked_and_unknown_games_are_reported() {
        let store = MockSyncStore::new();
        let mut g = game(6, 0, None);
        g.igdb_id = None;
        store.insert_game(g);
        store.insert_game(game(7, 0, None));

        assert_eq!(
            refresh_game(&store, &OneGame(None), 6).await.unwrap(),
            RefreshOutcome::Unlinked
        );
        assert_eq!(
            refresh_game(&store, &OneGame(None), 7).await.unwrap(),
            RefreshOutcome::NotFound
        );
        assert!(refresh_game(&store, &OneGame(None), 99).await.is_err());
    }
}
