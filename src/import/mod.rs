//! Importers: turn parsed feed rows into store writes.
//!
//! A row that fails is logged and counted; the only failure that stops a
//! batch is the store becoming unreachable. Rows that target the same stored
//! record run one after another in feed order, so the last one in the feed
//! wins on every run.

pub mod fixtures;
pub mod snapshot;

use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::task::JoinSet;
use tracing::error;

use crate::error::{ImportError, RowError};

pub use fixtures::import_fixtures;
pub use snapshot::{import_history, import_snapshot};

/// Outcome counts for one import batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub success: usize,
    pub errors: usize,
}

impl ImportStats {
    fn record(&mut self, outcome: Result<(), RowError>) -> Result<(), ImportError> {
        match outcome {
            Ok(()) => self.success += 1,
            Err(RowError::Store(err)) if err.is_unavailable() => return Err(err.into()),
            Err(_) => self.errors += 1,
        }
        Ok(())
    }

    fn record_all(&mut self, outcomes: Vec<Result<(), RowError>>) -> Result<(), ImportError> {
        outcomes.into_iter().try_for_each(|outcome| self.record(outcome))
    }
}

/// Run `work` over `rows` with at most `concurrency` tasks in flight.
///
/// Rows with the same `key_of` value share one task and run in their original
/// order. Rows without a key run alone. Dropping the join set on a fatal
/// outcome aborts the tasks still running.
pub(crate) async fn run_rows<T, K, KeyFn, F, Fut>(
    rows: Vec<T>,
    concurrency: usize,
    key_of: KeyFn,
    mut work: F,
) -> Result<ImportStats, ImportError>
where
    T: Send + 'static,
    K: Eq + Hash,
    KeyFn: Fn(&T) -> Option<K>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), RowError>> + Send + 'static,
{
    let limit = concurrency.max(1);
    let mut stats = ImportStats::default();
    let mut tasks = JoinSet::new();

    for group in group_by_key(rows, key_of) {
        if tasks.len() >= limit {
            if let Some(joined) = tasks.join_next().await {
                stats.record_all(flatten(joined))?;
            }
        }
        let pending: Vec<Fut> = group.into_iter().map(&mut work).collect();
        tasks.spawn(async move {
            let mut outcomes = Vec::with_capacity(pending.len());
            for row in pending {
                outcomes.push(row.await);
            }
            outcomes
        });
    }

    while let Some(joined) = tasks.join_next().await {
        stats.record_all(flatten(joined))?;
    }

    Ok(stats)
}

fn group_by_key<T, K, KeyFn>(rows: Vec<T>, key_of: KeyFn) -> Vec<Vec<T>>
where
    K: Eq + Hash,
    KeyFn: Fn(&T) -> Option<K>,
{
    let mut groups: Vec<Vec<T>> = Vec::new();
    let mut slots: HashMap<K, usize> = HashMap::new();

    for row in rows {
        match key_of(&row) {
            Some(key) => match slots.entry(key) {
                Entry::Occupied(slot) => groups[*slot.get()].push(row),
                Entry::Vacant(slot) => {
                    slot.insert(groups.len());
                    groups.push(vec![row]);
                }
            },
            None => groups.push(vec![row]),
        }
    }

    groups
}

type Joined = Result<Vec<Result<(), RowError>>, tokio::task::JoinError>;

// A panicked task counts as one failed row.
fn flatten(joined: Joined) -> Vec<Result<(), RowError>> {
    joined.unwrap_or_else(|e| {
        error!("Import worker panicked: {}", e);
        vec![Err(RowError::Invalid(format!("worker failed: {}", e)))]
    })
}
