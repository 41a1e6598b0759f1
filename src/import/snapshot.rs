use chrono::NaiveDate;
use tracing::{info, warn};

use super::{run_rows, ImportStats};
use crate::error::{ImportError, RowError};
use crate::feed::{ParsedRows, RatingRow};
use crate::resolver::resolve_club;
use crate::store::{natural_key, ClubProfile, RatingRecord, Repository, Store};

/// Upsert one rating per club for `date`.
///
/// Each row commits on its own; no transaction spans rows. Rows naming the
/// same club are written in feed order, so the last one wins. Rows the feed
/// client already rejected count as errors.
pub async fn import_snapshot<S: Store>(
    store: &S,
    rows: ParsedRows<RatingRow>,
    date: NaiveDate,
    concurrency: usize,
) -> Result<ImportStats, ImportError> {
    let rejected = rows.rejected.len();
    let club_of = |row: &RatingRow| Some(natural_key(&row.club));
    let mut stats = run_rows(rows.rows, concurrency, club_of, |row| {
        let mut store = store.clone();
        async move {
            let result = import_rating(&mut store, &row, date).await;
            if let Err(e) = &result {
                warn!(
                    "Failed to import rating for {} on {}: {}",
                    row.club, date, e
                );
            }
            result
        }
    })
    .await?;
    stats.errors += rejected;

    info!(
        "Snapshot {} imported: {} ok, {} errors",
        date, stats.success, stats.errors
    );
    Ok(stats)
}

/// Upsert every rating interval of one club's history, keyed by the interval
/// start date.
pub async fn import_history<S: Store>(
    store: &S,
    club: &str,
    rows: ParsedRows<RatingRow>,
    concurrency: usize,
) -> Result<ImportStats, ImportError> {
    let rejected = rows.rejected.len();
    let interval_of = |row: &RatingRow| row.from.map(|from| (natural_key(&row.club), from));
    let mut stats = run_rows(rows.rows, concurrency, interval_of, |row| {
        let mut store = store.clone();
        async move {
            let result = match row.from {
                Some(date) => import_rating(&mut store, &row, date).await,
                None => Err(RowError::Invalid("history row has no From date".to_string())),
            };
            if let Err(e) = &result {
                warn!(
                    "Failed to import history row for {} from {:?}: {}",
                    row.club, row.from, e
                );
            }
            result
        }
    })
    .await?;
    stats.errors += rejected;

    info!(
        "History for {} imported: {} ok, {} errors",
        club, stats.success, stats.errors
    );
    Ok(stats)
}

async fn import_rating<R>(repo: &mut R, row: &RatingRow, date: NaiveDate) -> Result<(), RowError>
where
    R: Repository + ?Sized,
{
    if !row.elo.is_finite() {
        return Err(RowError::Invalid(format!("rating {} is not finite", row.elo)));
    }
    let profile = ClubProfile::from_feed(&row.club, &row.country, row.level)
        .ok_or_else(|| RowError::Invalid(format!("club name '{}' has no usable key", row.club)))?;

    let club_id = resolve_club(repo, &profile).await?;
    repo.update_club(club_id, &profile).await?;
    repo.upsert_rating(&RatingRecord {
        club_id,
        rating_date: date,
        rank: row.rank,
        country: profile.country.clone(),
        level: row.level,
        elo: row.elo,
    })
    .await?;
    Ok(())
}
