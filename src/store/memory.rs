//! In-process store with the same keys and constraints as the Postgres schema.
//!
//! A transaction takes the store lock for its whole lifetime and works on a
//! private copy of the state; commit swaps the copy in, rollback (or drop)
//! discards it.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    Club, ClubId, ClubProfile, FixtureRecord, RatingRecord, Repository, Store, StoreTransaction,
};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    clubs: HashMap<ClubId, Club>,
    club_keys: HashMap<String, ClubId>,
    ratings: HashMap<(ClubId, NaiveDate), RatingRecord>,
    fixtures: HashMap<(ClubId, ClubId, NaiveDate), FixtureRecord>,
}

impl MemoryState {
    fn find_club(&self, natural_key: &str) -> Option<ClubId> {
        self.club_keys.get(natural_key).copied()
    }

    fn insert_club(&mut self, club: &ClubProfile) -> Option<ClubId> {
        if self.club_keys.contains_key(&club.natural_key) {
            return None;
        }
        let id = Uuid::new_v4();
        self.club_keys.insert(club.natural_key.clone(), id);
        self.clubs.insert(
            id,
            Club {
                id,
                natural_key: club.natural_key.clone(),
                display_name: club.display_name.clone(),
                country: club.country.clone(),
                level: club.level,
            },
        );
        Some(id)
    }

    fn update_club(&mut self, id: ClubId, club: &ClubProfile) -> Result<(), StoreError> {
        let stored = self
            .clubs
            .get_mut(&id)
            .ok_or_else(|| StoreError::Query(format!("club {} does not exist", id)))?;
        stored.display_name = club.display_name.clone();
        stored.country = club.country.clone();
        stored.level = club.level;
        Ok(())
    }

    fn require_club(&self, id: ClubId) -> Result<(), StoreError> {
        if self.clubs.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::Query(format!(
                "foreign key violation: club {} does not exist",
                id
            )))
        }
    }

    fn upsert_rating(&mut self, rating: &RatingRecord) -> Result<(), StoreError> {
        self.require_club(rating.club_id)?;
        self.ratings
            .insert((rating.club_id, rating.rating_date), rating.clone());
        Ok(())
    }

    fn upsert_fixture(&mut self, fixture: &FixtureRecord) -> Result<(), StoreError> {
        self.require_club(fixture.home_club_id)?;
        self.require_club(fixture.away_club_id)?;
        self.fixtures.insert(
            (
                fixture.home_club_id,
                fixture.away_club_id,
                fixture.match_date,
            ),
            fixture.clone(),
        );
        Ok(())
    }
}

/// Failures to inject into fixture writes.
#[derive(Debug, Default)]
struct FixtureFaults {
    fail: AtomicBool,
    conflicts: AtomicUsize,
}

impl FixtureFaults {
    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Query("injected fixture write failure".to_string()));
        }
        let conflicted = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(StoreError::Conflict("injected deadlock".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FixtureFaults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent fixture write fail, as a broken statement would.
    pub fn fail_fixture_writes(&self, fail: bool) {
        self.faults.fail.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` fixture writes fail with a lock conflict.
    pub fn conflict_fixture_writes(&self, count: usize) {
        self.faults.conflicts.store(count, Ordering::SeqCst);
    }

    /// All clubs, ordered by natural key.
    pub async fn clubs(&self) -> Vec<Club> {
        let state = self.state.lock().await;
        let mut clubs: Vec<Club> = state.clubs.values().cloned().collect();
        clubs.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        clubs
    }

    pub async fn club(&self, natural_key: &str) -> Option<Club> {
        let state = self.state.lock().await;
        state
            .find_club(natural_key)
            .and_then(|id| state.clubs.get(&id).cloned())
    }

    /// All rating records, ordered by date then club.
    pub async fn ratings(&self) -> Vec<RatingRecord> {
        let state = self.state.lock().await;
        let mut ratings: Vec<RatingRecord> = state.ratings.values().cloned().collect();
        ratings.sort_by_key(|r| (r.rating_date, r.club_id));
        ratings
    }

    /// All fixture records, ordered by date then home and away club.
    pub async fn fixtures(&self) -> Vec<FixtureRecord> {
        let state = self.state.lock().await;
        let mut fixtures: Vec<FixtureRecord> = state.fixtures.values().cloned().collect();
        fixtures.sort_by_key(|f| (f.match_date, f.home_club_id, f.away_club_id));
        fixtures
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn find_club(&mut self, natural_key: &str) -> Result<Option<ClubId>, StoreError> {
        Ok(self.state.lock().await.find_club(natural_key))
    }

    async fn insert_club(&mut self, club: &ClubProfile) -> Result<Option<ClubId>, StoreError> {
        Ok(self.state.lock().await.insert_club(club))
    }

    async fn update_club(&mut self, id: ClubId, club: &ClubProfile) -> Result<(), StoreError> {
        self.state.lock().await.update_club(id, club)
    }

    async fn upsert_rating(&mut self, rating: &RatingRecord) -> Result<(), StoreError> {
        self.state.lock().await.upsert_rating(rating)
    }

    async fn upsert_fixture(&mut self, fixture: &FixtureRecord) -> Result<(), StoreError> {
        self.faults.check()?;
        self.state.lock().await.upsert_fixture(fixture)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            staged,
            faults: self.faults.clone(),
        }))
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    faults: Arc<FixtureFaults>,
}

#[async_trait]
impl Repository for MemoryTransaction {
    async fn find_club(&mut self, natural_key: &str) -> Result<Option<ClubId>, StoreError> {
        Ok(self.staged.find_club(natural_key))
    }

    async fn insert_club(&mut self, club: &ClubProfile) -> Result<Option<ClubId>, StoreError> {
        Ok(self.staged.insert_club(club))
    }

    async fn update_club(&mut self, id: ClubId, club: &ClubProfile) -> Result<(), StoreError> {
        self.staged.update_club(id, club)
    }

    async fn upsert_rating(&mut self, rating: &RatingRecord) -> Result<(), StoreError> {
        self.staged.upsert_rating(rating)
    }

    async fn upsert_fixture(&mut self, fixture: &FixtureRecord) -> Result<(), StoreError> {
        self.faults.check()?;
        self.staged.upsert_fixture(fixture)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::run_in_transaction;

    fn profile(name: &str) -> ClubProfile {
        ClubProfile::from_feed(name, "X", 1).unwrap()
    }

    fn rating(club_id: ClubId, elo: f64) -> RatingRecord {
        RatingRecord {
            club_id,
            rating_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            rank: Some(1),
            country: "X".to_string(),
            level: 1,
            elo,
        }
    }

    #[tokio::test]
    async fn natural_key_is_unique() {
        let mut store = MemoryStore::new();
        let first = store.insert_club(&profile("Alpha")).await.unwrap();
        let second = store.insert_club(&profile("Alpha")).await.unwrap();
        assert!(first.is_some());
        assert_eq!(second, None);
        assert_eq!(store.clubs().await.len(), 1);
    }

    #[tokio::test]
    async fn ratings_require_an_existing_club() {
        let mut store = MemoryStore::new();
        let err = store.upsert_rating(&rating(Uuid::new_v4(), 1500.0)).await;
        assert!(matches!(err, Err(StoreError::Query(_))));
        assert!(store.ratings().await.is_empty());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = MemoryStore::new();
        let id: ClubId = run_in_transaction(&store, |tx| {
            Box::pin(async move {
                let id = tx.insert_club(&profile("Alpha")).await?.unwrap_or_default();
                tx.upsert_rating(&rating(id, 1800.0)).await?;
                Ok::<_, StoreError>(id)
            })
        })
        .await
        .unwrap();

        assert_eq!(store.club("alpha").await.map(|c| c.id), Some(id));
        assert_eq!(store.ratings().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_transaction_leaves_nothing_behind() {
        let store = MemoryStore::new();
        let result: Result<(), StoreError> = run_in_transaction(&store, |tx| {
            Box::pin(async move {
                tx.insert_club(&profile("Alpha")).await?;
                Err(StoreError::Query("boom".to_string()))
            })
        })
        .await;

        assert!(result.is_err());
        assert!(store.clubs().await.is_empty());
    }

    #[tokio::test]
    async fn injected_conflicts_run_out() {
        let mut store = MemoryStore::new();
        let id = store.insert_club(&profile("Alpha")).await.unwrap().unwrap_or_default();
        let record = FixtureRecord {
            home_club_id: id,
            away_club_id: id,
            match_date: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
            country: "X".to_string(),
            competition: "League".to_string(),
            home_level: 1,
            away_level: 1,
            home_elo: 1500.0,
            away_elo: 1500.0,
            prob_home: None,
            prob_draw: None,
            prob_away: None,
        };

        store.conflict_fixture_writes(1);
        let first = store.upsert_fixture(&record).await;
        assert!(matches!(first, Err(StoreError::Conflict(_))));
        assert!(store.upsert_fixture(&record).await.is_ok());
        assert_eq!(store.fixtures().await.len(), 1);
    }
}
