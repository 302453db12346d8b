use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;

/// `model → fallback model` plus an ordered fallback chain, both replaced
/// atomically and deep-copied on write (see the fallback-model lookup).
#[derive(Debug, Clone, Default)]
pub struct FallbackConfig {
    pub direct: HashMap<String, String>,
    pub chain: Vec<String>,
}

impl FallbackConfig {
    /// Checks the direct map first, then the successor in the ordered
    /// chain; returns `None` if nothing applies.
    pub fn fallback_for(&self, model: &str) -> Option<String> {
        if let Some(direct) = self.direct.get(model) {
            return Some(direct.clone());
        }
        let position = self.chain.iter().position(|m| m == model)?;
        self.chain.get(position + 1).cloned()
    }
}

/// Retry/backoff knobs the conductor reads on every attempt; stored as
/// atomics so the hot path never takes a lock to read them.
pub struct DispatchConfig {
    request_retry: AtomicU64,
    max_retry_interval_nanos: AtomicU64,
    quota_cooldown_disabled: AtomicBool,
    fallback: ArcSwap<FallbackConfig>,
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self {
            request_retry: AtomicU64::new(0),
            max_retry_interval_nanos: AtomicU64::new(Duration::from_secs(30).as_nanos() as u64),
            quota_cooldown_disabled: AtomicBool::new(false),
            fallback: ArcSwap::from_pointee(FallbackConfig::default()),
        }
    }

    pub fn set_retry_config(&self, retries: u32, max_retry_interval: Duration) {
        self.request_retry.store(retries as u64, Ordering::SeqCst);
        self.max_retry_interval_nanos
            .store(max_retry_interval.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn retry_budget(&self) -> u64 {
        self.request_retry.load(Ordering::SeqCst) + 1
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_nanos(self.max_retry_interval_nanos.load(Ordering::SeqCst))
    }

    pub fn set_quota_cooldown_disabled(&self, disabled: bool) {
        self.quota_cooldown_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn quota_cooldown_disabled(&self) -> bool {
        self.quota_cooldown_disabled.load(Ordering::SeqCst)
    }

    pub fn set_fallback_config(&self, config: FallbackConfig) {
        self.fallback.store(std::sync::Arc::new(config));
    }

    pub fn fallback(&self) -> arc_swap::Guard<std::sync::Arc<FallbackConfig>> {
        self.fallback.load()
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_chain_walks_to_successor() {
        let config = FallbackConfig {
            direct: HashMap::new(),
            chain: vec!["opus".into(), "sonnet".into(), "glm-4.7".into()],
        };
        assert_eq!(config.fallback_for("opus"), Some("sonnet".to_string()));
        assert_eq!(config.fallback_for("glm-4.7"), None);
    }

    #[test]
    fn direct_map_wins_over_chain() {
        let config = FallbackConfig {
            direct: HashMap::from([("opus".to_string(), "haiku".to_string())]),
            chain: vec!["opus".into(), "sonnet".into()],
        };
        assert_eq!(config.fallback_for("opus"), Some("haiku".to_string()));
    }

    #[test]
    fn retry_config_round_trips() {
        let config = DispatchConfig::new();
        config.set_retry_config(3, Duration::from_secs(5));
        assert_eq!(config.retry_budget(), 4);
        assert_eq!(config.max_retry_interval(), Duration::from_secs(5));
    }
}
