//! Usage tracking
//!
//! Maps each loaded model to the playgrounds whose active chain depends on
//! it. A model with no entry has no dependents and may be unloaded.

use crate::store::DocumentStore;
use modelplay_common::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::debug;

/// model_id → playground ids
pub type UsageMap = BTreeMap<String, BTreeSet<String>>;

/// Persisted reference set per model
#[derive(Debug)]
pub struct UsageTracker {
    doc: DocumentStore<UsageMap>,
}

impl UsageTracker {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        Ok(Self {
            doc: DocumentStore::open(path)?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            doc: DocumentStore::in_memory(),
        }
    }

    /// Record that `playground_id` depends on `model_id`. Idempotent.
    pub fn attach(&self, model_id: &str, playground_id: &str) -> Result<()> {
        self.doc.update(|map| {
            map.entry(model_id.to_string())
                .or_default()
                .insert(playground_id.to_string());
            Ok(())
        })?;
        debug!("Attached playground {} to {}", playground_id, model_id);
        Ok(())
    }

    /// Drop the dependency and return the remaining dependents. The entry is
    /// removed entirely once empty. Idempotent.
    pub fn detach(&self, model_id: &str, playground_id: &str) -> Result<BTreeSet<String>> {
        let remaining = self.doc.update(|map| {
            let remaining = match map.get_mut(model_id) {
                Some(set) => {
                    set.remove(playground_id);
                    set.clone()
                }
                None => BTreeSet::new(),
            };
            if remaining.is_empty() {
                map.remove(model_id);
            }
            Ok(remaining)
        })?;
        debug!(
            "Detached playground {} from {} ({} dependents left)",
            playground_id,
            model_id,
            remaining.len()
        );
        Ok(remaining)
    }

    /// Current dependents of `model_id`
    pub fn dependents(&self, model_id: &str) -> BTreeSet<String> {
        self.doc
            .read(|map| map.get(model_id).cloned())
            .unwrap_or_default()
    }

    /// The full map
    pub fn snapshot(&self) -> UsageMap {
        self.doc.snapshot()
    }

    /// Remove every playground for which `keep` returns false, dropping
    /// entries that become empty.
    pub fn retain_playgrounds(&self, keep: impl Fn(&str) -> bool) -> Result<()> {
        self.doc.update(|map| {
            for set in map.values_mut() {
                set.retain(|playground_id| keep(playground_id));
            }
            map.retain(|_, set| !set.is_empty());
            Ok(())
        })
    }
}
