//! Club ratings ingestion.
//!
//! Fetches rating snapshots, club histories and fixture predictions from the
//! remote feed and reconciles them into Postgres with idempotent upserts.

pub mod config;
pub mod error;
pub mod feed;
pub mod import;
pub mod pipeline;
pub mod resolver;
pub mod server;
pub mod store;

#[cfg(test)]
mod testutil;

pub use error::{FeedError, ImportError, RowError, StoreError};
pub use import::ImportStats;
pub use pipeline::Pipeline;
