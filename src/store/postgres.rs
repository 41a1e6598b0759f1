//! Postgres-backed store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgConnection, PgPool, Transaction};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ClubId, ClubProfile, FixtureRecord, RatingRecord, Repository, Store, StoreTransaction};
use crate::error::StoreError;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with exponential backoff and bring the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = Self::connect_db_with_retry(url, max_connections, 5).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations applied");
        Ok(Self { pool })
    }

    async fn connect_db_with_retry(
        url: &str,
        max_connections: u32,
        max_retries: u32,
    ) -> Result<PgPool> {
        let mut attempt = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
            {
                Ok(pool) => {
                    info!("Connected to PostgreSQL");
                    return Ok(pool);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(anyhow!(
                            "Failed to connect to database after {} attempts: {}",
                            max_retries,
                            e
                        ));
                    }
                    warn!(
                        "Database connection attempt {} failed: {}. Retrying...",
                        attempt, e
                    );
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }
}

const FIND_CLUB: &str = "SELECT id FROM clubs WHERE natural_key = $1";

// ON CONFLICT DO NOTHING keeps a lost race from aborting an enclosing
// transaction; the caller re-reads instead.
const INSERT_CLUB: &str = r#"
    INSERT INTO clubs (id, natural_key, display_name, country, level)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (natural_key) DO NOTHING
    RETURNING id
"#;

const UPDATE_CLUB: &str = r#"
    UPDATE clubs
    SET display_name = $2, country = $3, level = $4, updated_at = now()
    WHERE id = $1
      AND (display_name, country, level) IS DISTINCT FROM ($2, $3, $4)
"#;

const UPSERT_RATING: &str = r#"
    INSERT INTO club_ratings (club_id, rating_date, rank, country, level, elo)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (club_id, rating_date) DO UPDATE SET
        rank = EXCLUDED.rank,
        country = EXCLUDED.country,
        level = EXCLUDED.level,
        elo = EXCLUDED.elo,
        updated_at = now()
"#;

const UPSERT_FIXTURE: &str = r#"
    INSERT INTO fixtures (
        id, home_club_id, away_club_id, match_date, country, competition,
        home_level, away_level, home_elo, away_elo,
        prob_home, prob_draw, prob_away
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (home_club_id, away_club_id, match_date) DO UPDATE SET
        country = EXCLUDED.country,
        competition = EXCLUDED.competition,
        home_level = EXCLUDED.home_level,
        away_level = EXCLUDED.away_level,
        home_elo = EXCLUDED.home_elo,
        away_elo = EXCLUDED.away_elo,
        prob_home = EXCLUDED.prob_home,
        prob_draw = EXCLUDED.prob_draw,
        prob_away = EXCLUDED.prob_away,
        updated_at = now()
"#;

async fn find_club(conn: &mut PgConnection, natural_key: &str) -> Result<Option<ClubId>, StoreError> {
    let row: Option<(Uuid,)> = sqlx::query_as(FIND_CLUB)
        .bind(natural_key)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(|(id,)| id))
}

async fn insert_club(conn: &mut PgConnection, club: &ClubProfile) -> Result<Option<ClubId>, StoreError> {
    let inserted: Option<(Uuid,)> = sqlx::query_as(INSERT_CLUB)
        .bind(Uuid::new_v4())
        .bind(&club.natural_key)
        .bind(&club.display_name)
        .bind(&club.country)
        .bind(club.level)
        .fetch_optional(conn)
        .await?;
    Ok(inserted.map(|(id,)| id))
}

async fn update_club(conn: &mut PgConnection, id: ClubId, club: &ClubProfile) -> Result<(), StoreError> {
    sqlx::query(UPDATE_CLUB)
        .bind(id)
        .bind(&club.display_name)
        .bind(&club.country)
        .bind(club.level)
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_rating(conn: &mut PgConnection, rating: &RatingRecord) -> Result<(), StoreError> {
    sqlx::query(UPSERT_RATING)
        .bind(rating.club_id)
        .bind(rating.rating_date)
        .bind(rating.rank)
        .bind(&rating.country)
        .bind(rating.level)
        .bind(rating.elo)
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_fixture(conn: &mut PgConnection, fixture: &FixtureRecord) -> Result<(), StoreError> {
    sqlx::query(UPSERT_FIXTURE)
        .bind(Uuid::new_v4())
        .bind(fixture.home_club_id)
        .bind(fixture.away_club_id)
        .bind(fixture.match_date)
        .bind(&fixture.country)
        .bind(&fixture.competition)
        .bind(fixture.home_level)
        .bind(fixture.away_level)
        .bind(fixture.home_elo)
        .bind(fixture.away_elo)
        .bind(fixture.prob_home)
        .bind(fixture.prob_draw)
        .bind(fixture.prob_away)
        .execute(conn)
        .await?;
    Ok(())
}

// Outside a transaction every statement runs on its own pooled connection and
// commits immediately.
#[async_trait]
impl Repository for PgStore {
    async fn find_club(&mut self, natural_key: &str) -> Result<Option<ClubId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        find_club(&mut conn, natural_key).await
    }

    async fn insert_club(&mut self, club: &ClubProfile) -> Result<Option<ClubId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_club(&mut conn, club).await
    }

    async fn update_club(&mut self, id: ClubId, club: &ClubProfile) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_club(&mut conn, id, club).await
    }

    async fn upsert_rating(&mut self, rating: &RatingRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_rating(&mut conn, rating).await
    }

    async fn upsert_fixture(&mut self, fixture: &FixtureRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_fixture(&mut conn, fixture).await
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Repository for PgTransaction {
    async fn find_club(&mut self, natural_key: &str) -> Result<Option<ClubId>, StoreError> {
        find_club(&mut self.tx, natural_key).await
    }

    async fn insert_club(&mut self, club: &ClubProfile) -> Result<Option<ClubId>, StoreError> {
        insert_club(&mut self.tx, club).await
    }

    async fn update_club(&mut self, id: ClubId, club: &ClubProfile) -> Result<(), StoreError> {
        update_club(&mut self.tx, id, club).await
    }

    async fn upsert_rating(&mut self, rating: &RatingRecord) -> Result<(), StoreError> {
        upsert_rating(&mut self.tx, rating).await
    }

    async fn upsert_fixture(&mut self, fixture: &FixtureRecord) -> Result<(), StoreError> {
        upsert_fixture(&mut self.tx, fixture).await
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
