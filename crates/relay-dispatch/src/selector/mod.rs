//! Candidate selection: given a filtered list of credentials, pick the next
//! usable one respecting priority buckets, round-robin cursors, and
//! cooldowns.

mod fill_first;
mod priority;
mod round_robin;

pub use fill_first::FillFirstSelector;
pub use priority::PrioritySelector;
pub use round_robin::RoundRobinSelector;

use std::time::SystemTime;

use crate::credential::CredentialRecord;
use crate::errors::SelectError;

/// Whether a round-robin-family selector rotates per (provider, model) or
/// shares one cursor per model across all providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    ProviderBased,
    KeyBased,
}

/// Given (provider-filter, model, candidates), return the next usable
/// credential or a classified error.
pub trait Selector: Send + Sync {
    fn select(
        &self,
        providers: &[String],
        model: Option<&str>,
        candidates: &[CredentialRecord],
        now: SystemTime,
    ) -> Result<CredentialRecord, SelectError>;
}

/// Stable-sorts by ID so rotation is deterministic across calls with the
/// same candidate set (the round-robin and fill-first selectors both start
/// from this).
pub(crate) fn stable_sorted(candidates: &[CredentialRecord]) -> Vec<&CredentialRecord> {
    let mut sorted: Vec<&CredentialRecord> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted
}

/// Buckets candidates by their integer "priority" attribute, highest first.
pub(crate) fn priority_buckets<'a>(
    candidates: &[&'a CredentialRecord],
) -> Vec<(i64, Vec<&'a CredentialRecord>)> {
    use std::collections::BTreeMap;
    let mut buckets: BTreeMap<i64, Vec<&CredentialRecord>> = BTreeMap::new();
    for candidate in candidates {
        buckets.entry(candidate.priority()).or_default().push(candidate);
    }
    buckets.into_iter().rev().collect()
}
