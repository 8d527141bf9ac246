pub mod file;

pub use file::FileStore;

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::models::{Review, Target};

/// Trait for review persistence backends
pub trait ReviewStore: Send + Sync {
    /// Snapshot of identifiers already ingested for the target
    fn seen_set(&self, target: &Target) -> HashSet<String>;

    /// Append reviews to the target's log, merge `new_ids` into its seen list
    /// and record the poll time. Called with empty slices for no-op polls.
    fn append_reviews(&self, target: &Target, reviews: &[Review], new_ids: &[String]) -> Result<()>;

    /// Reviews submitted at or after `now - horizon`, newest first
    fn read_recent_at(&self, target: &Target, horizon: Duration, now: DateTime<Utc>) -> Result<Vec<Review>>;

    /// Time of the last recorded poll, if any
    fn last_poll(&self, target: &Target) -> Option<DateTime<Utc>>;

    fn read_recent(&self, target: &Target, horizon: Duration) -> Result<Vec<Review>> {
        self.read_recent_at(target, horizon, Utc::now())
    }
}
