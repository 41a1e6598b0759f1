use chrono::{NaiveDate, Utc};

use crate::error::ImportError;
use crate::feed::{FeedClient, FixtureWindow};
use crate::import::{self, ImportStats};
use crate::store::Store;

/// Entry points the CLI and the HTTP triggers call. Every call is a complete
/// fetch-then-import run and is safe to repeat.
pub struct Pipeline<S: Store> {
    feed: FeedClient,
    store: S,
    concurrency: usize,
}

impl<S: Store> Pipeline<S> {
    pub fn new(feed: FeedClient, store: S, concurrency: usize) -> Self {
        Self {
            feed,
            store,
            concurrency: concurrency.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Import the ratings snapshot for `date`, or for today when `None`.
    pub async fn import_snapshot(&self, date: Option<NaiveDate>) -> Result<ImportStats, ImportError> {
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        let rows = self.feed.fetch_snapshot(date).await?;
        import::import_snapshot(&self.store, rows, date, self.concurrency).await
    }

    /// Import fixtures for `date`, or every upcoming fixture when `None`.
    pub async fn import_fixtures(&self, date: Option<NaiveDate>) -> Result<ImportStats, ImportError> {
        let window = date.map(FixtureWindow::On).unwrap_or(FixtureWindow::Upcoming);
        self.import_fixture_window(window).await
    }

    pub async fn import_fixture_window(&self, window: FixtureWindow) -> Result<ImportStats, ImportError> {
        let rows = self.feed.fetch_fixtures(window).await?;
        import::import_fixtures(&self.store, rows, self.concurrency).await
    }

    /// Import the full rating history of one club, by its feed identifier.
    pub async fn import_history(&self, club: &str) -> Result<ImportStats, ImportError> {
        let rows = self.feed.fetch_history(club).await?;
        import::import_history(&self.store, club, rows, self.concurrency).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::feed::RetryPolicy;
    use crate::store::MemoryStore;
    use crate::testutil::{spawn_http, FIXTURES_CSV, SNAPSHOT_CSV};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;

    async fn pipeline(router: Router) -> Pipeline<MemoryStore> {
        let base = spawn_http(router).await;
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
        };
        let feed = FeedClient::new(&base, 6000, Duration::from_secs(5), retry).unwrap();
        Pipeline::new(feed, MemoryStore::new(), 4)
    }

    fn feed_router() -> Router {
        Router::new()
            .route("/2024-01-01", get(|| async { SNAPSHOT_CSV }))
            .route("/Fixtures", get(|| async { FIXTURES_CSV }))
            .route("/Fixtures/2024-03-02", get(|| async { FIXTURES_CSV }))
            .route(
                "/Alpha",
                get(|| async {
                    "Rank,Club,Country,Level,Elo,From,To\n\
                     None,Alpha,X,1,1500,2020-01-01,2020-01-09\n\
                     None,Alpha,X,1,1510,2020-01-10,2020-01-19\n"
                }),
            )
    }

    #[tokio::test]
    async fn snapshot_run_is_repeatable() {
        let pipeline = pipeline(feed_router()).await;
        let day = NaiveDate::from_ymd_opt(2024, 1, 1);

        let first = pipeline.import_snapshot(day).await.unwrap();
        let ratings = pipeline.store().ratings().await;
        let second = pipeline.import_snapshot(day).await.unwrap();

        assert_eq!(first, ImportStats { success: 2, errors: 0 });
        assert_eq!(second, first);
        assert_eq!(pipeline.store().ratings().await, ratings);
        assert_eq!(pipeline.store().clubs().await.len(), 2);
    }

    #[tokio::test]
    async fn fixtures_for_a_date_and_upcoming() {
        let pipeline = pipeline(feed_router()).await;

        let dated = pipeline
            .import_fixtures(NaiveDate::from_ymd_opt(2024, 3, 2))
            .await
            .unwrap();
        let upcoming = pipeline.import_fixtures(None).await.unwrap();

        assert_eq!(dated.success, 2);
        assert_eq!(upcoming.success, 2);
        assert_eq!(pipeline.store().fixtures().await.len(), 2);
    }

    #[tokio::test]
    async fn history_run_imports_every_interval() {
        let pipeline = pipeline(feed_router()).await;
        let stats = pipeline.import_history("Alpha").await.unwrap();

        assert_eq!(stats, ImportStats { success: 2, errors: 0 });
        assert_eq!(pipeline.store().ratings().await.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_feed_is_fatal_and_writes_nothing() {
        let router = Router::new().route(
            "/2024-01-01",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
        let pipeline = pipeline(router).await;

        let err = pipeline
            .import_snapshot(NaiveDate::from_ymd_opt(2024, 1, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Feed(FeedError::Unavailable { .. })));
        assert!(pipeline.store().clubs().await.is_empty());
    }
}
