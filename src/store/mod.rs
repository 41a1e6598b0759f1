//! Relational store seams.
//!
//! `Repository` is the set of statements the importers issue. It is
//! implemented both by the store itself (each statement commits on its own)
//! and by a `StoreTransaction` (statements commit or roll back together).
//! Callers pick the scope by which handle they pass.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Durable internal identifier of a club.
pub type ClubId = Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Descriptive attributes of a club as last reported by the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClubProfile {
    pub natural_key: String,
    pub display_name: String,
    pub country: String,
    pub level: i32,
}

impl ClubProfile {
    /// Profile for a feed club name. `None` when the name has no usable key.
    pub fn from_feed(name: &str, country: &str, level: i32) -> Option<Self> {
        let natural_key = natural_key(name);
        if natural_key.is_empty() {
            return None;
        }
        Some(Self {
            natural_key,
            display_name: name.trim().to_string(),
            country: country.trim().to_string(),
            level,
        })
    }
}

/// A stored club.
#[derive(Debug, Clone, PartialEq)]
pub struct Club {
    pub id: ClubId,
    pub natural_key: String,
    pub display_name: String,
    pub country: String,
    pub level: i32,
}

/// One club's rating on one date. Keyed by (club_id, rating_date).
#[derive(Debug, Clone, PartialEq)]
pub struct RatingRecord {
    pub club_id: ClubId,
    pub rating_date: NaiveDate,
    pub rank: Option<i32>,
    pub country: String,
    pub level: i32,
    pub elo: f64,
}

/// One predicted match. Keyed by (home_club_id, away_club_id, match_date).
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureRecord {
    pub home_club_id: ClubId,
    pub away_club_id: ClubId,
    pub match_date: NaiveDate,
    pub country: String,
    pub competition: String,
    pub home_level: i32,
    pub away_level: i32,
    pub home_elo: f64,
    pub away_elo: f64,
    pub prob_home: Option<f64>,
    pub prob_draw: Option<f64>,
    pub prob_away: Option<f64>,
}

#[async_trait]
pub trait Repository: Send {
    async fn find_club(&mut self, natural_key: &str) -> Result<Option<ClubId>, StoreError>;

    /// Insert a new club. Returns `None` when the natural key already exists.
    async fn insert_club(&mut self, club: &ClubProfile) -> Result<Option<ClubId>, StoreError>;

    /// Refresh display name, country and level of an existing club.
    async fn update_club(&mut self, id: ClubId, club: &ClubProfile) -> Result<(), StoreError>;

    async fn upsert_rating(&mut self, rating: &RatingRecord) -> Result<(), StoreError>;

    async fn upsert_fixture(&mut self, fixture: &FixtureRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreTransaction: Repository {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// A store handle. Cloning yields another handle onto the same store.
#[async_trait]
pub trait Store: Repository + Clone + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Run `work` inside one transaction: commit when it returns `Ok`, roll back
/// when it returns `Err`.
pub async fn run_in_transaction<S, T, E, F>(store: &S, work: F) -> Result<T, E>
where
    S: Store,
    E: From<StoreError>,
    F: for<'t> FnOnce(&'t mut dyn StoreTransaction) -> BoxFuture<'t, Result<T, E>>,
{
    let mut tx = store.begin().await?;
    let handle: &mut dyn StoreTransaction = &mut *tx;
    let outcome = work(handle).await;
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

/// Natural key for a feed club name.
///
/// Drops parenthetical suffixes, then keeps only lowercased alphanumerics so
/// spacing and punctuation variants of one name map to one key.
pub fn natural_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut paren_depth: u32 = 0;

    for ch in name.chars() {
        match ch {
            '(' => paren_depth += 1,
            ')' => paren_depth = paren_depth.saturating_sub(1),
            _ if paren_depth > 0 => {}
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            _ => {}
        }
    }

    out
}
