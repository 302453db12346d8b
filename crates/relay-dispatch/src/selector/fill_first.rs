use std::time::SystemTime;

use crate::credential::CredentialRecord;
use crate::errors::{DispatchError, ErrorCode, ModelCooldownError, SelectError};

use super::{CursorMode, Selector, priority_buckets, stable_sorted};
use super::round_robin::RoundRobinSelector;

/// Always returns the lowest-ID usable candidate in the top bucket
/// (deterministic, no cursor) unless configured in key-based mode, where it
/// delegates to round-robin rotation for back-compat with deployments that
/// need key-level rotation even in "fill first" setups.
pub struct FillFirstSelector {
    mode: CursorMode,
    key_based_fallback: RoundRobinSelector,
}

impl FillFirstSelector {
    pub fn new(mode: CursorMode) -> Self {
        Self {
            mode,
            key_based_fallback: RoundRobinSelector::new(CursorMode::KeyBased),
        }
    }
}

impl Selector for FillFirstSelector {
    fn select(
        &self,
        providers: &[String],
        model: Option<&str>,
        candidates: &[CredentialRecord],
        now: SystemTime,
    ) -> Result<CredentialRecord, SelectError> {
        if self.mode == CursorMode::KeyBased {
            return self.key_based_fallback.select(providers, model, candidates, now);
        }

        if candidates.is_empty() {
            return Err(DispatchError::auth_not_found("no auth candidates").into());
        }

        let sorted = stable_sorted(candidates);
        let buckets = priority_buckets(&sorted);
        let mut soonest_cooldown: Option<std::time::Duration> = None;

        for (_priority, bucket) in buckets {
            for candidate in &bucket {
                let availability = candidate.availability(model, now);
                if availability.is_available() {
                    return Ok((*candidate).clone());
                } else if let Some(reset_in) = availability.reset_in(now) {
                    soonest_cooldown = Some(soonest_cooldown.map_or(reset_in, |m: std::time::Duration| m.min(reset_in)));
                }
            }
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

    fn cred(id: &str) -> CredentialRecord {
        CredentialRecord::new(id.to_string(), "anthropic", Value::Null, SystemTime::now())
    }

    #[test]
    fn always_returns_lowest_id_in_top_bucket() {
        let selector = FillFirstSelector::new(CursorMode::ProviderBased);
        let candidates = vec![cred("z"), cred("a"), cred("m")];
        let now = SystemTime::now();
        for _ in 0..3 {
            let picked = selector.select(&[], Some("m1"), &candidates, now).unwrap();
            assert_eq!(picked.id, "a");
        }
    }
}
