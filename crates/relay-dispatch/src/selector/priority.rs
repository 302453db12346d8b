use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::credential::CredentialRecord;
use crate::errors::{DispatchError, ErrorCode, ModelCooldownError, SelectError};

use super::Selector;

/// Orders providers before delegating to an inner selector within each.
///
/// Configured with either a global provider order or a per-model
/// provider-preference map (model-specific wins). With no list configured
/// for the requested model, delegates entirely to the inner selector.
pub struct PrioritySelector {
    inner: Box<dyn Selector>,
    global_order: Vec<String>,
    per_model_order: HashMap<String, Vec<String>>,
}

impl PrioritySelector {
    pub fn new(inner: Box<dyn Selector>) -> Self {
        Self {
            inner,
            global_order: Vec::new(),
            per_model_order: HashMap::new(),
        }
    }

    pub fn with_global_order(mut self, order: Vec<String>) -> Self {
        self.global_order = order;
        self
    }

    pub fn with_model_order(mut self, model: impl Into<String>, order: Vec<String>) -> Self {
        self.per_model_order.insert(model.into(), order);
        self
    }

    fn order_for(&self, model: Option<&str>) -> Option<&[String]> {
        if let Some(model) = model
            && let Some(order) = self.per_model_order.get(model)
        {
            return Some(order);
        }
        if self.global_order.is_empty() {
            None
        } else {
            Some(&self.global_order)
        }
    }
}

impl Selector for PrioritySelector {
    fn select(
        &self,
        providers: &[String],
        model: Option<&str>,
        candidates: &[CredentialRecord],
        now: SystemTime,
    ) -> Result<CredentialRecord, SelectError> {
        let Some(order) = self.order_for(model) else {
            return self.inner.select(providers, model, candidates, now);
        };

        let mut soonest_cooldown: Option<Duration> = None;
        let mut saw_any_candidate = false;

        for provider in order {
            let scoped: Vec<CredentialRecord> = candidates
                .iter()
                .filter(|c| &c.provider == provider)
                .cloned()
                .collect();
            if scoped.is_empty() {
                continue;
            }
            saw_any_candidate = true;

            match self.inner.select(std::slice::from_ref(provider), model, &scoped, now) {
                Ok(picked) => return Ok(picked),
                Err(SelectError::Cooldown(ModelCooldownError { reset_in, .. })) => {
                    soonest_cooldown = Some(soonest_cooldown.map_or(reset_in, |m| m.min(reset_in)));
                }
                Err(SelectError::Dispatch(_)) => continue,
            }
        }

        if let Some(reset_in) = soonest_cooldown {
            return Err(ModelCooldownError {
                model: model.unwrap_or_default().to_string(),
                provider: None,
                reset_in,
            }
            .into());
        }

        if !saw_any_candidate {
            return Err(DispatchError::auth_not_found("no auth candidates").into());
        }

        Err(DispatchError::new(ErrorCode::AuthNotFound, "no provider in priority order had usable candidates").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{CursorMode, RoundRobinSelector};
    use serde_json::Value;

    fn cred(id: &str, provider: &str) -> CredentialRecord {
        CredentialRecord::new(id.to_string(), provider, Value::Null, SystemTime::now())
    }

    #[test]
    fn tries_providers_in_configured_order() {
        let selector = PrioritySelector::new(Box::new(RoundRobinSelector::new(CursorMode::ProviderBased)))
            .with_global_order(vec!["b".to_string(), "a".to_string()]);
        let candidates = vec![cred("a1", "a"), cred("b1", "b")];
        let picked = selector.select(&[], Some("m1"), &candidates, SystemTime::now()).unwrap();
        assert_eq!(picked.provider, "b");
    }

    #[test]
    fn falls_through_to_next_provider_on_cooldown() {
        let selector = PrioritySelector::new(Box::new(RoundRobinSelector::new(CursorMode::ProviderBased)))
            .with_global_order(vec!["a".to_string(), "b".to_string()]);
        let now = SystemTime::now();
        let mut blocked = cred("a1", "a");
        blocked.model_state_mut("m1", now).unavailable = true;
        blocked.model_state_mut("m1", now).next_retry_after = Some(now + Duration::from_secs(600));
        let candidates = vec![blocked, cred("b1", "b")];

        let picked = selector.select(&[], Some("m1"), &candidates, now).unwrap();
        assert_eq!(picked.provider, "b");
    }
}
