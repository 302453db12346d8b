use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::credential::CredentialRecord;
use crate::errors::{DispatchError, ErrorCode, ModelCooldownError, SelectError};

use super::{CursorMode, Selector, priority_buckets, stable_sorted};

type CursorKey = (String, String, i64);

/// Default selector: rotates fairly within the highest usable priority
/// bucket. The `providers` slice passed to `select` determines cursor scope
/// in [`CursorMode::ProviderBased`] mode — callers that already narrowed to
/// one provider (the priority selector's inner delegate) get a cursor per
/// provider; the conductor's cross-provider call (empty filter) shares one
/// cursor per model, same as [`CursorMode::KeyBased`].
pub struct RoundRobinSelector {
    mode: CursorMode,
    cursors: Mutex<HashMap<CursorKey, usize>>,
}

impl RoundRobinSelector {
    pub fn new(mode: CursorMode) -> Self {
        Self {
            mode,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn cursor_key(&self, providers: &[String], model: Option<&str>, priority: i64) -> CursorKey {
        let provider_part = match self.mode {
            CursorMode::ProviderBased => providers.join(","),
            CursorMode::KeyBased => String::new(),
        };
        (provider_part, model.unwrap_or("").to_string(), priority)
    }

    fn next_index(&self, key: CursorKey, len: usize) -> usize {
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors.entry(key).or_insert(0);
        let idx = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        idx
    }
}

impl Selector for RoundRobinSelector {
    fn select(
        &self,
        providers: &[String],
        model: Option<&str>,
        candidates: &[CredentialRecord],
        now: SystemTime,
    ) -> Result<CredentialRecord, SelectError> {
        if candidates.is_empty() {
            return Err(DispatchError::auth_not_found("no auth candidates").into());
        }

        let sorted = stable_sorted(candidates);
        let buckets = priority_buckets(&sorted);

        let mut soonest_cooldown: Option<std::time::Duration> = None;

        for (priority, bucket) in buckets {
            let mut usable = Vec::new();
            for candidate in bucket {
                let availability = candidate.availability(model, now);
                if availability.is_available() {
                    usable.push(candidate);
                } else if let Some(reset_in) = availability.reset_in(now) {
                    soonest_cooldown = Some(soonest_cooldown.map_or(reset_in, |m: std::time::Duration| m.min(reset_in)));
                }
            }

            if usable.is_empty() {
                continue;
            }

            let key = self.cursor_key(providers, model, priority);
            let idx = self.next_index(key, usable.len());
            return Ok(usable[idx].clone());
        }

        if let Some(reset_in) = soonest_cooldown {
            return Err(ModelCooldownError {
                model: model.unwrap_or_default().to_string(),
                provider: providers.first().cloned(),
                reset_in,
            }
            .into());
        }

        Err(DispatchError::new(ErrorCode::AuthUnavailable, "no usable credential").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn cred(id: &str, priority: i64) -> CredentialRecord {
        let mut record = CredentialRecord::new(id.to_string(), "anthropic", Value::Null, SystemTime::now());
        if priority != 0 {
            record.attributes.set("priority", priority.to_string());
        }
        record
    }

    #[test]
    fn rotates_fairly_within_top_bucket() {
        let selector = RoundRobinSelector::new(CursorMode::ProviderBased);
        let candidates = vec![cred("a", 0), cred("b", 0), cred("c", 0)];
        let now = SystemTime::now();

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..30 {
            let picked = selector.select(&[], Some("m1"), &candidates, now).unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }
        for count in counts.values() {
            assert!((*count as i64 - 10).abs() <= 1);
        }
    }

    #[test]
    fn higher_priority_bucket_always_wins_when_usable() {
        let selector = RoundRobinSelector::new(CursorMode::ProviderBased);
        let candidates = vec![cred("low", 0), cred("high", 10)];
        let now = SystemTime::now();
        for _ in 0..5 {
            let picked = selector.select(&[], Some("m1"), &candidates, now).unwrap();
            assert_eq!(picked.id, "high");
        }
    }

    #[test]
    fn falls_back_to_lower_bucket_when_top_blocked() {
        let selector = RoundRobinSelector::new(CursorMode::ProviderBased);
        let now = SystemTime::now();
        let mut high = cred("high", 10);
        high.model_state_mut("m1", now).unavailable = true;
        high.model_state_mut("m1", now).next_retry_after = Some(now + std::time::Duration::from_secs(1800));
        let candidates = vec![high, cred("low", 0)];

        let picked = selector.select(&[], Some("m1"), &candidates, now).unwrap();
        assert_eq!(picked.id, "low");
    }

    #[test]
    fn empty_candidates_is_auth_not_found() {
        let selector = RoundRobinSelector::new(CursorMode::ProviderBased);
        let err = selector.select(&[], Some("m1"), &[], SystemTime::now()).unwrap_err();
        assert!(matches!(err, SelectError::Dispatch(e) if e.code == ErrorCode::AuthNotFound));
    }
}
