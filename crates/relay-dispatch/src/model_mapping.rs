use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Reserved metadata key the conductor stamps with the original client
/// alias whenever it substitutes an upstream model name, so downstream
/// consumers can still resolve the alias's own metadata.
pub const ORIGINAL_MODEL_METADATA_KEY: &str = "original-model";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MappingKey {
    channel: String,
    alias: String,
}

struct MappingEntry {
    upstreams: Vec<String>,
    cursor: AtomicUsize,
}

/// Per-channel alias → ordered upstream-name list, with a round-robin
/// cursor per (channel, alias). Replaceable atomically as a whole via
/// [`ModelMappingTable::replace`].
pub struct ModelMappingTable {
    entries: RwLock<Arc<HashMap<MappingKey, MappingEntry>>>,
}

impl ModelMappingTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Installs a brand-new table, compiled from `channel → [(upstream, alias)]`
    /// pairs into the internal `(channel, alias) → [upstream...]` index; cursors
    /// reset to zero for every entry.
    pub fn replace(&self, mappings: HashMap<String, Vec<(String, String)>>) {
        let mut compiled: HashMap<MappingKey, MappingEntry> = HashMap::new();
        for (channel, pairs) in mappings {
            let channel = channel.to_lowercase();
            for (upstream, alias) in pairs {
                let key = MappingKey {
                    channel: channel.clone(),
                    alias: alias.to_lowercase(),
                };
                compiled
                    .entry(key)
                    .or_insert_with(|| MappingEntry {
                        upstreams: Vec::new(),
                        cursor: AtomicUsize::new(0),
                    })
                    .upstreams
                    .push(upstream);
            }
        }
        *self.entries.write().unwrap() = Arc::new(compiled);
    }

    /// Resolves (channel, alias) to the next upstream name, advancing the
    /// cursor when there is more than one candidate. Returns `None` when
    /// there is no mapping, or the single mapped name equals the alias
    /// case-insensitively (no mapping applied).
    pub fn resolve(&self, channel: &str, alias: &str) -> Option<String> {
        let entries = self.entries.read().unwrap().clone();
        let key = MappingKey {
            channel: channel.to_lowercase(),
            alias: alias.to_lowercase(),
        };
        let entry = entries.get(&key)?;

        if entry.upstreams.len() == 1 {
            let only = &entry.upstreams[0];
            return if only.eq_ignore_ascii_case(alias) {
                None
            } else {
                Some(only.clone())
            };
        }

        let idx = entry.cursor.fetch_add(1, Ordering::SeqCst) % entry.upstreams.len();
        Some(entry.upstreams[idx].clone())
    }

    /// Read-only: the upstream names to try after `selected_upstream` fails,
    /// in wrap-around order starting just after it, excluding it. Never
    /// mutates the cursor.
    pub fn remaining_after(&self, channel: &str, alias: &str, selected_upstream: &str) -> Vec<String> {
        let entries = self.entries.read().unwrap().clone();
        let key = MappingKey {
            channel: channel.to_lowercase(),
            alias: alias.to_lowercase(),
        };
        let Some(entry) = entries.get(&key) else {
            return Vec::new();
        };
        if entry.upstreams.len() <= 1 {
            return Vec::new();
        }
        let Some(selected_idx) = entry.upstreams.iter().position(|u| u == selected_upstream) else {
            return Vec::new();
        };
        let len = entry.upstreams.len();
        (1..len)
            .map(|offset| entry.upstreams[(selected_idx + offset) % len].clone())
            .collect()
    }
}

impl Default for ModelMappingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives the model-mapping channel from a credential's provider and
/// optional `auth_kind` attribute; API-key credentials (no OAuth auth kind)
/// have no channel and therefore no mapping.
pub fn channel_for(provider: &str, auth_kind: Option<&str>) -> Option<String> {
    let auth_kind = auth_kind?;
    if auth_kind.eq_ignore_ascii_case("api_key") {
        return None;
    }
    Some(format!("{}:{}", provider.to_lowercase(), auth_kind.to_lowercase()))
}
