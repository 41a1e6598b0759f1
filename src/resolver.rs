use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{ClubId, ClubProfile, Repository};

/// Resolve a club to its internal id, creating it on first sight.
///
/// Lookup never touches attributes. Creation is an optimistic insert: if a
/// concurrent caller wins the race on the natural key, the insert reports a
/// conflict and the winner's row is read back.
pub async fn resolve_club<R>(repo: &mut R, club: &ClubProfile) -> Result<ClubId, StoreError>
where
    R: Repository + ?Sized,
{
    if let Some(id) = repo.find_club(&club.natural_key).await? {
        return Ok(id);
    }

    if let Some(id) = repo.insert_club(club).await? {
        info!(
            "Created club {} ({}) [id: {}]",
            club.display_name, club.natural_key, id
        );
        return Ok(id);
    }

    debug!("Lost insert race for club {}; re-reading", club.natural_key);
    repo.find_club(&club.natural_key).await?.ok_or_else(|| {
        StoreError::Query(format!(
            "club {} conflicted on insert but cannot be found",
            club.natural_key
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FixtureRecord, MemoryStore, RatingRecord};
    use async_trait::async_trait;

    fn profile(name: &str) -> ClubProfile {
        ClubProfile::from_feed(name, "X", 1).unwrap()
    }

    /// Hides clubs from the first lookup, as if another writer inserted
    /// between our lookup and our insert.
    struct StaleFirstLookup {
        inner: MemoryStore,
        lookups: usize,
    }

    #[async_trait]
    impl Repository for StaleFirstLookup {
        async fn find_club(&mut self, natural_key: &str) -> Result<Option<ClubId>, StoreError> {
            self.lookups += 1;
            if self.lookups == 1 {
                return Ok(None);
            }
            self.inner.find_club(natural_key).await
        }

        async fn insert_club(&mut self, club: &ClubProfile) -> Result<Option<ClubId>, StoreError> {
            self.inner.insert_club(club).await
        }

        async fn update_club(&mut self, id: ClubId, club: &ClubProfile) -> Result<(), StoreError> {
            self.inner.update_club(id, club).await
        }

        async fn upsert_rating(&mut self, rating: &RatingRecord) -> Result<(), StoreError> {
            self.inner.upsert_rating(rating).await
        }

        async fn upsert_fixture(&mut self, fixture: &FixtureRecord) -> Result<(), StoreError> {
            self.inner.upsert_fixture(fixture).await
        }
    }

    #[tokio::test]
    async fn repeated_resolution_reuses_the_club() {
        let mut store = MemoryStore::new();
        let first = resolve_club(&mut store, &profile("Alpha")).await.unwrap();
        let second = resolve_club(&mut store, &profile("Alpha")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.clubs().await.len(), 1);
    }

    #[tokio::test]
    async fn lookup_does_not_update_attributes() {
        let mut store = MemoryStore::new();
        resolve_club(&mut store, &profile("Alpha")).await.unwrap();
        let renamed = ClubProfile::from_feed("Alpha", "Y", 2).unwrap();
        resolve_club(&mut store, &renamed).await.unwrap();

        let club = store.club("alpha").await.unwrap();
        assert_eq!(club.country, "X");
        assert_eq!(club.level, 1);
    }

    #[tokio::test]
    async fn lost_insert_race_rereads_the_winner() {
        let mut winner = MemoryStore::new();
        let existing = resolve_club(&mut winner, &profile("Alpha")).await.unwrap();

        let mut racing = StaleFirstLookup {
            inner: winner.clone(),
            lookups: 0,
        };
        let resolved = resolve_club(&mut racing, &profile("Alpha")).await.unwrap();

        assert_eq!(resolved, existing);
        assert_eq!(racing.lookups, 2);
        assert_eq!(winner.clubs().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolution_creates_one_club() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let mut store = store.clone();
            handles.push(tokio::spawn(async move {
                resolve_club(&mut store, &profile("Alpha")).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(store.clubs().await.len(), 1);
    }
}
