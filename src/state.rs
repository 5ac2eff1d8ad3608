//! Keyed per-instrument state with one writer per key
//!
//! Every instrument gets its own slot behind an async mutex. Holding the
//! slot's guard for a whole evaluation serializes evaluations of that
//! instrument while other instruments proceed in parallel. The outer map
//! lock is only taken to find or create a slot.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// One instrument's state slot
pub type Slot<T> = Arc<Mutex<Option<T>>>;

#[derive(Debug)]
pub struct StateStore<T> {
    slots: RwLock<HashMap<String, Slot<T>>>,
}

impl<T> Default for StateStore<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + 'static> StateStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `key`, created empty on first use
    pub async fn slot(&self, key: &str) -> Slot<T> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// Lock `key` for exclusive read-modify-write
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<Option<T>> {
        self.slot(key).await.lock_owned().await
    }

    /// Copy of the current value, waiting for any writer to finish
    pub async fn get(&self, key: &str) -> Option<T> {
        let slot = self.slots.read().await.get(key).cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Clear the value for `key`. Returns whether there was one.
    pub async fn reset(&self, key: &str) -> bool {
        let Some(slot) = self.slots.read().await.get(key).cloned() else {
            return false;
        };
        let mut guard = slot.lock().await;
        guard.take().is_some()
    }

    /// Keys that currently hold a value
    pub async fn keys(&self) -> Vec<String> {
        let slots: Vec<(String, Slot<T>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut keys = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            if slot.lock().await.is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }
}
