//! Remote ratings feed client.
//!
//! Three request shapes share one fetch path: rate limit, GET, classify the
//! failure, back off and retry when the failure is transient.

pub mod parse;

use chrono::NaiveDate;
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::FeedError;
pub use parse::{FixtureRow, ParsedRows, RatingRow, RowRejection};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How many times a transient failure is retried, and how long to wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempts` failures.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(2u32.pow(exp))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Which fixtures to ask the feed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureWindow {
    Upcoming,
    On(NaiveDate),
    Between(NaiveDate, NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRequest {
    Snapshot(NaiveDate),
    History(String),
    Fixtures(FixtureWindow),
}

impl FeedRequest {
    /// Path below the feed base URL, validated before anything goes on the wire.
    pub fn path(&self) -> Result<String, FeedError> {
        match self {
            FeedRequest::Snapshot(date) => Ok(date.format("%Y-%m-%d").to_string()),
            FeedRequest::History(club) => {
                if club.is_empty() || !club.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(FeedError::InvalidRequest(format!(
                        "club identifier '{}' is not alphanumeric",
                        club
                    )));
                }
                Ok(club.clone())
            }
            FeedRequest::Fixtures(FixtureWindow::Upcoming) => Ok("Fixtures".to_string()),
            FeedRequest::Fixtures(FixtureWindow::On(date)) => {
                Ok(format!("Fixtures/{}", date.format("%Y-%m-%d")))
            }
            FeedRequest::Fixtures(FixtureWindow::Between(from, to)) => {
                if from > to {
                    return Err(FeedError::InvalidRequest(format!(
                        "fixture range starts after it ends ({} > {})",
                        from, to
                    )));
                }
                Ok(format!(
                    "Fixtures/{}/{}",
                    from.format("%Y-%m-%d"),
                    to.format("%Y-%m-%d")
                ))
            }
        }
    }
}

/// Outcome of a single HTTP attempt that did not produce a body.
enum AttemptError {
    Transient(String),
    Fatal(String),
}

pub struct FeedClient {
    base_url: String,
    http_client: reqwest::Client,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    retry: RetryPolicy,
}

impl FeedClient {
    pub fn new(
        base_url: &str,
        requests_per_minute: u32,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, FeedError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| FeedError::InvalidRequest(format!("failed to create HTTP client: {}", e)))?;

        let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            rate_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            retry,
        })
    }

    /// Full ratings snapshot for one date.
    pub async fn fetch_snapshot(&self, date: NaiveDate) -> Result<ParsedRows<RatingRow>, FeedError> {
        let body = self.fetch_body(&FeedRequest::Snapshot(date)).await?;
        let parsed = parse::parse_ratings(&body)?;
        info!(
            "Fetched snapshot for {}: {} rows ({} rejected)",
            date,
            parsed.rows.len(),
            parsed.rejected.len()
        );
        Ok(parsed)
    }

    /// Every rating interval the feed holds for one club.
    pub async fn fetch_history(&self, club: &str) -> Result<ParsedRows<RatingRow>, FeedError> {
        let body = self
            .fetch_body(&FeedRequest::History(club.to_string()))
            .await?;
        let parsed = parse::parse_ratings(&body)?;
        info!(
            "Fetched history for {}: {} rows ({} rejected)",
            club,
            parsed.rows.len(),
            parsed.rejected.len()
        );
        Ok(parsed)
    }

    pub async fn fetch_fixtures(
        &self,
        window: FixtureWindow,
    ) -> Result<ParsedRows<FixtureRow>, FeedError> {
        let body = self.fetch_body(&FeedRequest::Fixtures(window)).await?;
        let parsed = parse::parse_fixtures(&body)?;
        info!(
            "Fetched fixtures ({:?}): {} rows ({} rejected)",
            window,
            parsed.rows.len(),
            parsed.rejected.len()
        );
        Ok(parsed)
    }

    async fn fetch_body(&self, request: &FeedRequest) -> Result<String, FeedError> {
        let url = format!("{}/{}", self.base_url, request.path()?);
        let mut attempt = 0;

        loop {
            self.rate_limiter.until_ready().await;
            attempt += 1;

            match self.try_fetch(&url).await {
                Ok(body) => return Ok(body),
                Err(AttemptError::Fatal(reason)) => {
                    return Err(FeedError::Unavailable {
                        url,
                        attempts: attempt,
                        reason,
                    });
                }
                Err(AttemptError::Transient(reason)) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(FeedError::Unavailable {
                            url,
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Feed request {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        url, attempt, self.retry.max_attempts, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<String, AttemptError> {
        let response = self.http_client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                AttemptError::Transient(e.to_string())
            } else {
                AttemptError::Fatal(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .text()
                .await
                .map_err(|e| AttemptError::Transient(format!("failed to read body: {}", e)));
        }

        let reason = format!("HTTP {}", status);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(AttemptError::Transient(reason))
        } else {
            Err(AttemptError::Fatal(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_http, SNAPSHOT_CSV};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
        }
    }

    fn client(base_url: &str, max_attempts: u32) -> FeedClient {
        FeedClient::new(base_url, 6000, Duration::from_secs(5), fast_retry(max_attempts)).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Server that fails with `status` for the first `failures` calls.
    fn flaky_router(failures: u32, status: AxumStatus, hits: Arc<AtomicU32>) -> Router {
        Router::new().route(
            "/2024-01-01",
            get(move || {
                let hits = hits.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        (status, String::new())
                    } else {
                        (AxumStatus::OK, SNAPSHOT_CSV.to_string())
                    }
                }
            }),
        )
    }

    #[test]
    fn request_paths() {
        let d = date(2024, 1, 1);
        assert_eq!(FeedRequest::Snapshot(d).path().unwrap(), "2024-01-01");
        assert_eq!(
            FeedRequest::History("ManCity".to_string()).path().unwrap(),
            "ManCity"
        );
        assert_eq!(
            FeedRequest::Fixtures(FixtureWindow::Upcoming).path().unwrap(),
            "Fixtures"
        );
        assert_eq!(
            FeedRequest::Fixtures(FixtureWindow::Between(d, date(2024, 1, 7)))
                .path()
                .unwrap(),
            "Fixtures/2024-01-01/2024-01-07"
        );
    }

    #[test]
    fn invalid_requests_are_refused() {
        assert!(matches!(
            FeedRequest::History("../admin".to_string()).path(),
            Err(FeedError::InvalidRequest(_))
        ));
        assert!(matches!(
            FeedRequest::History(String::new()).path(),
            Err(FeedError::InvalidRequest(_))
        ));
        assert!(matches!(
            FeedRequest::Fixtures(FixtureWindow::Between(date(2024, 2, 1), date(2024, 1, 1)))
                .path(),
            Err(FeedError::InvalidRequest(_))
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(12), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = spawn_http(flaky_router(2, AxumStatus::SERVICE_UNAVAILABLE, hits.clone())).await;

        let parsed = assert_ok!(client(&base, 4).fetch_snapshot(date(2024, 1, 1)).await);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = spawn_http(flaky_router(100, AxumStatus::BAD_GATEWAY, hits.clone())).await;

        let err = client(&base, 3)
            .fetch_snapshot(date(2024, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Unavailable { attempts: 3, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = spawn_http(flaky_router(100, AxumStatus::NOT_FOUND, hits.clone())).await;

        let err = client(&base, 4)
            .fetch_snapshot(date(2024, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Unavailable { attempts: 1, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/Fixtures",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { "not,a,fixture,table\n1,2,3,4\n" }
            }),
        );
        let base = spawn_http(router).await;

        let err = client(&base, 4)
            .fetch_fixtures(FixtureWindow::Upcoming)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_feed_is_unavailable() {
        // Nothing listens on the discard port.
        let err = client("http://127.0.0.1:9", 2)
            .fetch_history("Alpha")
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Unavailable { attempts: 2, .. }));
    }
}
