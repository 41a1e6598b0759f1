//! Decoder for the feed's comma-delimited tables.
//!
//! Columns are located by header name (case-insensitive) so the feed can
//! reorder or add columns without breaking ingestion. A record that fails to
//! decode is rejected on its own; only a body with no usable header fails the
//! whole fetch.

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

use crate::error::FeedError;

/// One club's line in a ratings snapshot or history.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RatingRow {
    #[serde(deserialize_with = "optional")]
    pub rank: Option<i32>,
    #[serde(deserialize_with = "required")]
    pub club: String,
    #[serde(deserialize_with = "required")]
    pub country: String,
    #[serde(deserialize_with = "required")]
    pub level: i32,
    #[serde(deserialize_with = "finite")]
    pub elo: f64,
    /// Start of the interval a history row covers. Absent in snapshots.
    #[serde(default, deserialize_with = "optional")]
    pub from: Option<NaiveDate>,
}

/// One predicted match.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FixtureRow {
    #[serde(deserialize_with = "required")]
    pub date: NaiveDate,
    #[serde(deserialize_with = "required")]
    pub country: String,
    #[serde(deserialize_with = "required")]
    pub competition: String,
    #[serde(deserialize_with = "required")]
    pub home: String,
    #[serde(deserialize_with = "required")]
    pub away: String,
    #[serde(rename = "homelevel", deserialize_with = "required")]
    pub home_level: i32,
    #[serde(rename = "awaylevel", deserialize_with = "required")]
    pub away_level: i32,
    #[serde(rename = "homeelo", deserialize_with = "finite")]
    pub home_elo: f64,
    #[serde(rename = "awayelo", deserialize_with = "finite")]
    pub away_elo: f64,
    #[serde(rename = "homewin", default, deserialize_with = "optional_finite")]
    pub prob_home: Option<f64>,
    #[serde(rename = "draw", default, deserialize_with = "optional_finite")]
    pub prob_draw: Option<f64>,
    #[serde(rename = "awaywin", default, deserialize_with = "optional_finite")]
    pub prob_away: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowRejection {
    /// 1-based line number in the response body.
    pub line: usize,
    pub reason: String,
}

/// Decoded rows plus the rows that could not be decoded.
#[derive(Debug, Clone)]
pub struct ParsedRows<T> {
    pub rows: Vec<T>,
    pub rejected: Vec<RowRejection>,
}

impl<T> Default for ParsedRows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> From<Vec<T>> for ParsedRows<T> {
    fn from(rows: Vec<T>) -> Self {
        Self {
            rows,
            rejected: Vec::new(),
        }
    }
}

const RATING_COLUMNS: &[&str] = &["rank", "club", "country", "level", "elo"];

const FIXTURE_COLUMNS: &[&str] = &[
    "date",
    "country",
    "competition",
    "home",
    "away",
    "homelevel",
    "awaylevel",
    "homeelo",
    "awayelo",
    "homewin",
    "draw",
    "awaywin",
];

pub fn parse_ratings(body: &str) -> Result<ParsedRows<RatingRow>, FeedError> {
    decode(body, RATING_COLUMNS)
}

pub fn parse_fixtures(body: &str) -> Result<ParsedRows<FixtureRow>, FeedError> {
    decode(body, FIXTURE_COLUMNS)
}

fn decode<T: DeserializeOwned>(body: &str, required: &[&str]) -> Result<ParsedRows<T>, FeedError> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());

    let headers: StringRecord = reader
        .headers()
        .map_err(|e| FeedError::Malformed(format!("unreadable header row: {}", e)))?
        .iter()
        .map(str::to_lowercase)
        .collect();

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| !headers.iter().any(|h| h == *name))
        .collect();
    if !missing.is_empty() {
        return Err(FeedError::Malformed(format!(
            "header '{}' is missing column(s): {}",
            headers.iter().collect::<Vec<_>>().join(","),
            missing.join(", ")
        )));
    }

    let mut parsed = ParsedRows::default();
    for record in reader.records() {
        let (line, result) = match record {
            Ok(record) => (line_of(record.position()), decode_record(&record, &headers)),
            Err(e) => (line_of(e.position()), Err(e.to_string())),
        };

        match result {
            Ok(value) => parsed.rows.push(value),
            Err(reason) => {
                warn!("Rejected feed line {}: {}", line, reason);
                parsed.rejected.push(RowRejection { line, reason });
            }
        }
    }
    Ok(parsed)
}

fn decode_record<T: DeserializeOwned>(record: &StringRecord, headers: &StringRecord) -> Result<T, String> {
    if record.len() != headers.len() {
        return Err(format!(
            "expected {} fields, found {}",
            headers.len(),
            record.len()
        ));
    }
    record.deserialize(Some(headers)).map_err(|e| e.to_string())
}

fn line_of(position: Option<&csv::Position>) -> usize {
    position.map_or(0, |p| p.line() as usize)
}

// Field decoders. The feed writes absent values as an empty field or "None".

fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let raw = String::deserialize(d)?;
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        Ok(Some(raw.to_string()))
    }
}

fn optional<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    present(d)?
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| D::Error::custom(format!("'{}': {}", v, e)))
        })
        .transpose()
}

fn required<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    optional(d)?.ok_or_else(|| D::Error::custom("value is empty"))
}

fn finite<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let value: f64 = required(d)?;
    check_finite(value).map_err(D::Error::custom)
}

fn optional_finite<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value: Option<f64> = optional(d)?;
    value
        .map(|v| check_finite(v).map_err(D::Error::custom))
        .transpose()
}

fn check_finite(value: f64) -> Result<f64, String> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("{} is not finite", value))
    }
}
