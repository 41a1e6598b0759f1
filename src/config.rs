use anyhow::{anyhow, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::feed::RetryPolicy;

pub const DEFAULT_FEED_BASE_URL: &str = "http://api.clubelo.com";

/// Configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub feed_base_url: String,
    pub feed_requests_per_minute: u32,
    pub feed_timeout_seconds: u64,
    pub feed_max_attempts: u32,
    pub feed_backoff_ms: u64,
    pub import_concurrency: usize,
    pub http_port: u16,
    /// Shared secret for the HTTP trigger routes. Triggers are refused when unset.
    pub import_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Secrets/config:
        // - Docker Compose: read from /run/secrets/*
        // - Container Apps: read from env vars (no /run/secrets mount)
        let database_url = match lookup("DATABASE_URL") {
            Some(v) if !v.trim().is_empty() => v,
            Some(_) => return Err(anyhow!("DATABASE_URL is set but empty")),
            None => {
                let db_user = lookup("DB_USER").unwrap_or_else(|| "ratings".to_string());
                let db_name = lookup("DB_NAME").unwrap_or_else(|| "ratings".to_string());
                let db_host = lookup("DB_HOST").unwrap_or_else(|| "postgres".to_string());
                let db_port = lookup("DB_PORT").unwrap_or_else(|| "5432".to_string());
                let db_password = read_secret_file("/run/secrets/db_password", "db_password")?;
                format!(
                    "postgresql://{}:{}@{}:{}/{}",
                    db_user, db_password, db_host, db_port, db_name
                )
            }
        };

        let import_token = match lookup("IMPORT_TOKEN") {
            Some(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
            Some(_) => return Err(anyhow!("IMPORT_TOKEN is set but empty")),
            None => read_secret_file("/run/secrets/import_token", "import_token").ok(),
        };

        let import_concurrency: usize = parse_var(&lookup, "IMPORT_CONCURRENCY", 4)?;
        if import_concurrency == 0 {
            return Err(anyhow!("IMPORT_CONCURRENCY must be at least 1"));
        }

        Ok(Self {
            database_url,
            feed_base_url: lookup("FEED_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FEED_BASE_URL.to_string()),
            feed_requests_per_minute: parse_var(&lookup, "FEED_REQUESTS_PER_MINUTE", 30)?,
            feed_timeout_seconds: parse_var(&lookup, "FEED_TIMEOUT_SECONDS", 30)?,
            feed_max_attempts: parse_var(&lookup, "FEED_MAX_ATTEMPTS", 4)?,
            feed_backoff_ms: parse_var(&lookup, "FEED_BACKOFF_MS", 500)?,
            import_concurrency,
            http_port: parse_var(&lookup, "HTTP_PORT", 8084)?,
            import_token,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.feed_max_attempts.max(1),
            base_delay: Duration::from_millis(self.feed_backoff_ms),
        }
    }

    /// Connections for the store pool: one per import worker plus headroom.
    pub fn pool_size(&self) -> Result<u32> {
        let workers = u32::try_from(self.import_concurrency)
            .context("IMPORT_CONCURRENCY is too large for a connection pool")?;
        Ok(workers.saturating_add(2))
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        _ => Ok(default),
    }
}

/// Read a secret from Docker secret file
fn read_secret_file(file_path: &str, secret_name: &str) -> Result<String> {
    std::fs::read_to_string(file_path)
        .map(|s| s.trim().to_string())
        .context(format!(
            "Secret file not found at {} ({}). Set the matching env var or mount the secret.",
            file_path, secret_name
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config =
            Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://x/y")])).unwrap();
        assert_eq!(config.feed_base_url, DEFAULT_FEED_BASE_URL);
        assert_eq!(config.import_concurrency, 4);
        assert_eq!(config.http_port, 8084);
        assert_eq!(config.retry_policy().max_attempts, 4);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("FEED_BASE_URL", "http://127.0.0.1:9000"),
            ("IMPORT_CONCURRENCY", "8"),
            ("IMPORT_TOKEN", " s3cret "),
        ]))
        .unwrap();
        assert_eq!(config.feed_base_url, "http://127.0.0.1:9000");
        assert_eq!(config.import_concurrency, 8);
        assert_eq!(config.import_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("HTTP_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("HTTP_PORT"));

        assert!(Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x/y"),
            ("IMPORT_CONCURRENCY", "0"),
        ]))
        .is_err());
    }

    #[test]
    fn pool_size_leaves_headroom_and_never_wraps() {
        let mut config =
            Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://x/y")])).unwrap();
        assert_eq!(config.pool_size().unwrap(), 6);

        config.import_concurrency = u32::MAX as usize;
        assert_eq!(config.pool_size().unwrap(), u32::MAX);

        if let Some(too_large) = (u32::MAX as usize).checked_add(1) {
            config.import_concurrency = too_large;
            assert!(config.pool_size().is_err());
        }
    }

    #[test]
    fn empty_database_url_is_an_error() {
        assert!(Config::from_lookup(lookup_from(&[("DATABASE_URL", "  ")])).is_err());
    }
}
