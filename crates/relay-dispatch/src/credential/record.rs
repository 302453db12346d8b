use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use relay_common::{Attributes, CredentialId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse health of a credential or one of its per-model substates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Active,
    Error,
    Disabled,
}

/// Why a (credential, model) pair is currently blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailableReason {
    Quota,
    Unauthorized,
    PaymentRequired,
    NotFound,
    ServerError,
    GenericError,
    Disabled,
}

impl UnavailableReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            UnavailableReason::Quota => "quota",
            UnavailableReason::Unauthorized => "unauthorized",
            UnavailableReason::PaymentRequired => "payment_required",
            UnavailableReason::NotFound => "not_found",
            UnavailableReason::ServerError => "server_error",
            UnavailableReason::GenericError => "generic_error",
            UnavailableReason::Disabled => "disabled",
        }
    }
}

/// Classified outcome of the most recent failed attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastError {
    pub code: Option<String>,
    pub message: Option<String>,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

/// Rate-limit substate. `backoff_level` only ever grows via consecutive 429s
/// and resets to zero on the next success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quota {
    pub exceeded: bool,
    pub reason: Option<String>,
    pub next_recover_at: Option<SystemTime>,
    pub backoff_level: u32,
}

/// Per-model substate: everything needed to decide whether a (credential,
/// model) pair is usable right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    pub unavailable: bool,
    pub next_retry_after: Option<SystemTime>,
    pub status: Status,
    pub quota: Quota,
    pub last_error: LastError,
    pub status_message: Option<String>,
    pub updated_at: SystemTime,
}

impl ModelState {
    fn fresh(now: SystemTime) -> Self {
        Self {
            unavailable: false,
            next_retry_after: None,
            status: Status::Active,
            quota: Quota::default(),
            last_error: LastError::default(),
            status_message: None,
            updated_at: now,
        }
    }

    /// `NextRetryAfter` in the past is lazily treated as cleared.
    fn is_blocked(&self, now: SystemTime) -> bool {
        self.unavailable && self.next_retry_after.is_some_and(|t| t > now)
    }
}

/// One registered upstream credential: identity, opaque payload, and the
/// mutable health state the conductor mutates under its lock.
///
/// Returned to callers as a deep clone; only the conductor ever mutates the
/// live copy (see the conductor's `MarkResult` state machine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub provider: String,
    pub label: Option<String>,
    pub payload: Value,
    pub metadata: HashMap<String, String>,
    pub attributes: Attributes,
    pub file_hint: Option<String>,

    pub status: Status,
    pub disabled: bool,
    pub unavailable: bool,
    pub next_retry_after: Option<SystemTime>,
    pub quota: Quota,
    pub last_error: LastError,
    pub last_refreshed_at: Option<SystemTime>,
    pub next_refresh_after: Option<SystemTime>,
    pub model_states: HashMap<String, ModelState>,

    /// Stable identifier assigned on first registration; preserved across
    /// updates that don't explicitly set it.
    pub index: u64,
}

impl CredentialRecord {
    pub fn new(id: CredentialId, provider: impl Into<String>, payload: Value, now: SystemTime) -> Self {
        Self {
            id,
            provider: provider.into().to_lowercase(),
            label: None,
            payload,
            metadata: HashMap::new(),
            attributes: Attributes::new(),
            file_hint: None,
            status: Status::Active,
            disabled: false,
            unavailable: false,
            next_retry_after: None,
            quota: Quota::default(),
            last_error: LastError::default(),
            last_refreshed_at: None,
            next_refresh_after: None,
            model_states: HashMap::new(),
            index: 0,
        }
    }

    pub fn is_runtime_only(&self) -> bool {
        self.attributes.is_runtime_only()
    }

    pub fn priority(&self) -> i64 {
        self.attributes.priority()
    }

    /// Availability decision for (record, model, now).
    pub fn availability(&self, model: Option<&str>, now: SystemTime) -> Availability {
        if self.disabled || self.status == Status::Disabled {
            return Availability::Unavailable {
                reason: UnavailableReason::Disabled,
                next_retry_after: None,
            };
        }

        if let Some(model) = model
            && let Some(state) = self.model_states.get(model)
        {
            if state.is_blocked(now) {
                return Availability::Unavailable {
                    reason: reason_from_status_message(state.status_message.as_deref()),
                    next_retry_after: state.next_retry_after,
                };
            }
            return Availability::Available;
        }

        if self.unavailable && self.next_retry_after.is_some_and(|t| t > now) {
            return Availability::Unavailable {
                reason: reason_from_status_message(self.last_error.code.as_deref()),
                next_retry_after: self.next_retry_after,
            };
        }

        Availability::Available
    }

    /// Recomputes the aggregated `unavailable`/`next_retry_after`/quota
    /// fields from the per-model map.
    pub fn recompute_aggregate(&mut self) {
        let mut min_retry: Option<SystemTime> = None;
        let mut all_unavailable = !self.model_states.is_empty();
        let mut any_quota_exceeded = false;

        for state in self.model_states.values() {
            match state.next_retry_after {
                Some(t) if state.unavailable => {
                    min_retry = Some(min_retry.map_or(t, |m| m.min(t)));
                }
                _ => all_unavailable = false,
            }
            any_quota_exceeded |= state.quota.exceeded;
        }

        self.unavailable = all_unavailable && min_retry.is_some();
        self.next_retry_after = if self.unavailable { min_retry } else { None };
        self.quota.exceeded = any_quota_exceeded;

        if !self.model_states.values().any(|s| s.last_error.code.is_some()) {
            self.last_error = LastError::default();
            self.status = Status::Active;
        }
    }

    pub fn model_state_mut(&mut self, model: &str, now: SystemTime) -> &mut ModelState {
        self.model_states
            .entry(model.to_string())
            .or_insert_with(|| ModelState::fresh(now))
    }

    /// The subset a [`crate::store::CredentialStore`] should persist:
    /// registration identity plus the operator-set `disabled` switch, with
    /// every runtime-only field reset to its fresh default. Cooldowns,
    /// quota, last error, and per-model state live only in the transient
    /// cache, never in the store.
    pub fn identity_snapshot(&self) -> CredentialRecord {
        CredentialRecord {
            id: self.id.clone(),
            provider: self.provider.clone(),
            label: self.label.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            attributes: self.attributes.clone(),
            file_hint: self.file_hint.clone(),
            status: Status::Active,
            disabled: self.disabled,
            unavailable: false,
            next_retry_after: None,
            quota: Quota::default(),
            last_error: LastError::default(),
            last_refreshed_at: None,
            next_refresh_after: None,
            model_states: HashMap::new(),
            index: self.index,
        }
    }
}

/// The subset of [`CredentialRecord`] that the transient state cache
/// persists separately from the credential's own store:
/// cooldowns, quota, last error, and per-model substates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransientState {
    pub status: Option<Status>,
    pub disabled: bool,
    pub unavailable: bool,
    pub next_retry_after: Option<SystemTime>,
    pub quota: Quota,
    pub last_error: LastError,
    pub last_refreshed_at: Option<SystemTime>,
    pub next_refresh_after: Option<SystemTime>,
    pub model_states: HashMap<String, ModelState>,
}

impl CredentialRecord {
    pub fn transient_snapshot(&self) -> TransientState {
        TransientState {
            status: Some(self.status),
            disabled: self.disabled,
            unavailable: self.unavailable,
            next_retry_after: self.next_retry_after,
            quota: self.quota.clone(),
            last_error: self.last_error.clone(),
            last_refreshed_at: self.last_refreshed_at,
            next_refresh_after: self.next_refresh_after,
            model_states: self.model_states.clone(),
        }
    }

    pub fn apply_transient(&mut self, snapshot: TransientState) {
        self.status = snapshot.status.unwrap_or(Status::Active);
        self.disabled = snapshot.disabled;
        self.unavailable = snapshot.unavailable;
        self.next_retry_after = snapshot.next_retry_after;
        self.quota = snapshot.quota;
        self.last_error = snapshot.last_error;
        self.last_refreshed_at = snapshot.last_refreshed_at;
        self.next_refresh_after = snapshot.next_refresh_after;
        self.model_states = snapshot.model_states;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Available,
    Unavailable {
        reason: UnavailableReason,
        next_retry_after: Option<SystemTime>,
    },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    pub fn reset_in(&self, now: SystemTime) -> Option<Duration> {
        match self {
            Availability::Unavailable {
                next_retry_after: Some(t),
                ..
            } => t.duration_since(now).ok(),
            _ => None,
        }
    }
}

fn reason_from_status_message(tag: Option<&str>) -> UnavailableReason {
    match tag {
        Some("quota") => UnavailableReason::Quota,
        Some("unauthorized") => UnavailableReason::Unauthorized,
        Some("payment_required") => UnavailableReason::PaymentRequired,
        Some("not_found") => UnavailableReason::NotFound,
        Some("server_error") => UnavailableReason::ServerError,
        _ => UnavailableReason::GenericError,
    }
}

/// HTTP-status → (cooldown, reason tag) table from the error-handling design.
pub fn cooldown_for_status(status: u16, retry_after: Option<Duration>, backoff_level: u32, quota_cooldown_disabled: bool) -> (Duration, UnavailableReason, Option<u32>) {
    match status {
        401 => (Duration::from_secs(2 * 3600), UnavailableReason::Unauthorized, None),
        402 | 403 => (Duration::from_secs(2 * 3600), UnavailableReason::PaymentRequired, None),
        404 => (Duration::from_secs(12 * 3600), UnavailableReason::NotFound, None),
        429 => {
            if quota_cooldown_disabled {
                (Duration::from_secs(0), UnavailableReason::Quota, Some(backoff_level))
            } else if let Some(retry_after) = retry_after {
                (retry_after, UnavailableReason::Quota, Some(backoff_level))
            } else {
                let next_level = backoff_level + 1;
                let secs = 1u64.checked_shl(backoff_level).unwrap_or(u64::MAX);
                let capped = Duration::from_secs(secs.min(30 * 60));
                (capped, UnavailableReason::Quota, Some(next_level))
            }
        }
        408 | 500 | 502 | 503 | 504 => (Duration::from_secs(2 * 3600), UnavailableReason::ServerError, None),
        _ => (Duration::from_secs(2 * 3600), UnavailableReason::GenericError, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_429_backoff_matches_s2() {
        let (d0, _, lvl0) = cooldown_for_status(429, None, 0, false);
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(lvl0, Some(1));

        let (d1, _, lvl1) = cooldown_for_status(429, None, 1, false);
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(lvl1, Some(2));

        let (d2, _, lvl2) = cooldown_for_status(429, None, 2, false);
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(lvl2, Some(3));
    }

    #[test]
    fn backoff_caps_at_thirty_minutes() {
        let (d, _, _) = cooldown_for_status(429, None, 20, false);
        assert_eq!(d, Duration::from_secs(30 * 60));
    }

    #[test]
    fn retry_after_overrides_exponential_schedule() {
        let (d, _, _) = cooldown_for_status(429, Some(Duration::from_secs(5)), 3, false);
        assert_eq!(d, Duration::from_secs(5));
    }

    #[test]
    fn disabled_record_is_never_available() {
        let now = SystemTime::now();
        let mut record = CredentialRecord::new("c1".into(), "anthropic", Value::Null, now);
        record.disabled = true;
        assert!(!record.availability(Some("m1"), now).is_available());
    }

    #[test]
    fn expired_model_cooldown_is_lazily_available() {
        let now = SystemTime::now();
        let mut record = CredentialRecord::new("c1".into(), "anthropic", Value::Null, now);
        let state = record.model_state_mut("m1", now);
        state.unavailable = true;
        state.next_retry_after = Some(now - Duration::from_secs(1));
        assert!(record.availability(Some("m1"), now).is_available());
    }
}
