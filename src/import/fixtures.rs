use chrono::NaiveDate;
use std::time::Duration;
use tracing::{info, warn};

use super::{run_rows, ImportStats};
use crate::error::{ImportError, RowError, StoreError};
use crate::feed::{FixtureRow, ParsedRows};
use crate::resolver::resolve_club;
use crate::store::{
    natural_key, run_in_transaction, ClubId, ClubProfile, FixtureRecord, Store, StoreTransaction,
};

/// Attempts per fixture transaction when the store reports a lock conflict.
const MAX_TRANSACTION_ATTEMPTS: u32 = 3;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

/// A fixture row that passed validation and is ready to write.
#[derive(Debug, Clone)]
struct PreparedFixture {
    home: ClubProfile,
    away: ClubProfile,
    match_date: NaiveDate,
    competition: String,
    home_elo: f64,
    away_elo: f64,
    prob_home: Option<f64>,
    prob_draw: Option<f64>,
    prob_away: Option<f64>,
}

impl PreparedFixture {
    fn from_row(row: &FixtureRow) -> Result<Self, RowError> {
        for (label, value) in [("home rating", row.home_elo), ("away rating", row.away_elo)] {
            if !value.is_finite() {
                return Err(RowError::Invalid(format!("{} {} is not finite", label, value)));
            }
        }
        for (label, value) in [
            ("home win probability", row.prob_home),
            ("draw probability", row.prob_draw),
            ("away win probability", row.prob_away),
        ] {
            if let Some(p) = value.filter(|p| !p.is_finite()) {
                return Err(RowError::Invalid(format!("{} {} is not finite", label, p)));
            }
        }

        let profile = |name: &str, level: i32| {
            ClubProfile::from_feed(name, &row.country, level)
                .ok_or_else(|| RowError::Invalid(format!("club name '{}' has no usable key", name)))
        };

        Ok(Self {
            home: profile(&row.home, row.home_level)?,
            away: profile(&row.away, row.away_level)?,
            match_date: row.date,
            competition: row.competition.trim().to_string(),
            home_elo: row.home_elo,
            away_elo: row.away_elo,
            prob_home: row.prob_home,
            prob_draw: row.prob_draw,
            prob_away: row.prob_away,
        })
    }

    /// Resolve and refresh both clubs, always locking the lower natural key
    /// first so two transactions over the same pair cannot deadlock.
    async fn resolve_clubs(
        &self,
        tx: &mut dyn StoreTransaction,
    ) -> Result<(ClubId, ClubId), StoreError> {
        let home_first = self.home.natural_key <= self.away.natural_key;
        let (first, second) = if home_first {
            (&self.home, &self.away)
        } else {
            (&self.away, &self.home)
        };

        let first_id = resolve_club(&mut *tx, first).await?;
        let second_id = resolve_club(&mut *tx, second).await?;
        tx.update_club(first_id, first).await?;
        if second_id != first_id {
            tx.update_club(second_id, second).await?;
        }

        Ok(if home_first {
            (first_id, second_id)
        } else {
            (second_id, first_id)
        })
    }

    fn record(&self, home_club_id: ClubId, away_club_id: ClubId) -> FixtureRecord {
        FixtureRecord {
            home_club_id,
            away_club_id,
            match_date: self.match_date,
            country: self.home.country.clone(),
            competition: self.competition.clone(),
            home_level: self.home.level,
            away_level: self.away.level,
            home_elo: self.home_elo,
            away_elo: self.away_elo,
            prob_home: self.prob_home,
            prob_draw: self.prob_draw,
            prob_away: self.prob_away,
        }
    }
}

/// Upsert one fixture per (home, away, date).
///
/// Both club resolutions, their attribute refreshes and the fixture write for
/// one row share a transaction: either all of them land or none do. Rows for
/// the same fixture are written in feed order.
pub async fn import_fixtures<S: Store>(
    store: &S,
    rows: ParsedRows<FixtureRow>,
    concurrency: usize,
) -> Result<ImportStats, ImportError> {
    let rejected = rows.rejected.len();
    let fixture_of = |row: &FixtureRow| {
        Some((natural_key(&row.home), natural_key(&row.away), row.date))
    };
    let mut stats = run_rows(rows.rows, concurrency, fixture_of, |row| {
        let store = store.clone();
        async move {
            let result = import_fixture(&store, &row).await;
            if let Err(e) = &result {
                warn!(
                    "Failed to import fixture {} vs {} on {}: {}",
                    row.home, row.away, row.date, e
                );
            }
            result
        }
    })
    .await?;
    stats.errors += rejected;

    info!(
        "Fixtures imported: {} ok, {} errors",
        stats.success, stats.errors
    );
    Ok(stats)
}

async fn import_fixture<S: Store>(store: &S, row: &FixtureRow) -> Result<(), RowError> {
    let fixture = PreparedFixture::from_row(row)?;

    let mut attempt = 1;
    loop {
        let prepared = fixture.clone();
        let result = run_in_transaction(store, move |tx| {
            Box::pin(async move {
                let (home_id, away_id) = prepared.resolve_clubs(&mut *tx).await?;
                tx.upsert_fixture(&prepared.record(home_id, away_id)).await?;
                Ok::<(), RowError>(())
            })
        })
        .await;

        match result {
            Err(RowError::Store(err)) if err.is_conflict() && attempt < MAX_TRANSACTION_ATTEMPTS => {
                warn!(
                    "Fixture {} vs {} on {} hit a conflict (attempt {}): {}. Retrying...",
                    row.home, row.away, row.date, attempt, err
                );
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
