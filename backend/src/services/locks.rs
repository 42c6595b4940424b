//! Per-variant exclusivity within one process
//!
//! The registry lives in memory, so it only serializes runs inside a single
//! engine instance. Deployments run one instance per database.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use shared::VariantKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of one async mutex per stock variant.
///
/// Cloning shares the registry. Runs for different variants never wait on
/// each other; runs for the same variant are serialized.
#[derive(Clone, Default)]
pub struct VariantLocks {
    slots: Arc<StdMutex<HashMap<VariantKey, Arc<Mutex<()>>>>>,
}

/// Held exclusivity over one or more variants, released on drop
pub struct VariantGuard {
    keys: Vec<VariantKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl VariantGuard {
    pub fn keys(&self) -> &[VariantKey] {
        &self.keys
    }

    pub fn covers(&self, key: &VariantKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

impl VariantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &VariantKey) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to one variant
    pub async fn acquire(&self, key: &VariantKey) -> VariantGuard {
        let guard = self.slot(key).lock_owned().await;
        VariantGuard {
            keys: vec![key.clone()],
            _guards: vec![guard],
        }
    }

    /// Wait for exclusive access to several variants.
    ///
    /// Keys are deduplicated and locked in ascending order, so two callers
    /// with overlapping sets cannot deadlock.
    pub async fn acquire_many<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a VariantKey>,
    ) -> VariantGuard {
        let sorted: BTreeSet<&VariantKey> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in &sorted {
            guards.push(self.slot(key).lock_owned().await);
        }
        VariantGuard {
            keys: sorted.into_iter().cloned().collect(),
            _guards: guards,
        }
    }
}
