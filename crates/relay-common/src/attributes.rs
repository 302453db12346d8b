use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_flexible_duration;

/// Loosely-typed string attributes carried on a credential record.
///
/// Kept as a plain string map (rather than a richer typed struct) because
/// the set of recognized keys is provider- and deployment-specific; the
/// core only reaches for a handful of well-known keys (`priority`,
/// `auth_kind`, `refresh_interval`, `runtime_only`, `prefix`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(HashMap<String, String>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Integer "priority" attribute, defaulting to 0 when absent or unparsable.
    pub fn priority(&self) -> i64 {
        self.get("priority")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    }

    pub fn auth_kind(&self) -> Option<&str> {
        self.get("auth_kind")
    }

    pub fn is_runtime_only(&self) -> bool {
        self.get("runtime_only").is_some_and(|v| v == "true")
    }

    pub fn prefix(&self) -> Option<&str> {
        self.get("prefix")
    }

    /// Positive `refresh_interval` override, accepting bare seconds or a
    /// suffixed duration string (see [`parse_flexible_duration`]).
    pub fn refresh_interval(&self) -> Option<Duration> {
        let raw = self.get("refresh_interval")?;
        let duration = parse_flexible_duration(raw)?;
        if duration.is_zero() {
            None
        } else {
            Some(duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_defaults_to_zero() {
        let attrs = Attributes::new();
        assert_eq!(attrs.priority(), 0);
    }

    #[test]
    fn priority_parses_set_value() {
        let mut attrs = Attributes::new();
        attrs.set("priority", "10");
        assert_eq!(attrs.priority(), 10);
    }

    #[test]
    fn refresh_interval_rejects_zero() {
        let mut attrs = Attributes::new();
        attrs.set("refresh_interval", "0");
        assert_eq!(attrs.refresh_interval(), None);
    }
}
