//! Trust scores and the reflex plan cache.
//!
//! Trust is a count of successful completions per (intent, focused window)
//! pair, persisted in `intent_history`. Once a pair crosses the threshold
//! its serialised plan is cached and served as a reflex for the intent.
//! Counts update only on successful completion, never on mere approval.

#![deny(unsafe_code)]

use kernel_core::action::REFLEX_TRUST_THRESHOLD;
use std::collections::HashMap;
use std::sync::RwLock;
use store::{Store, StoreError};
use tracing::debug;

/// A cached plan plus the trust score that earned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflex {
    /// Serialised action list.
    pub plan: String,
    /// Success count of the backing (intent, focus) row.
    pub trust_score: u64,
}

/// Read-side interface handed to the policy validator; breaks the cycle
/// between validation (reads trust) and dispatch (writes trust).
pub trait TrustReader: Send + Sync {
    /// Success count for the pair, 0 when unseen.
    fn trust_for(&self, intent: &str, focused_window: &str) -> u64;
}

/// Trust ledger with a read-through in-memory cache.
#[derive(Debug)]
pub struct TrustStore {
    store: Store,
    cache: RwLock<HashMap<(String, String), u64>>,
}

impl TrustStore {
    /// Ledger over an open database.
    pub fn new(store: Store) -> Self {
        Self { store, cache: RwLock::new(HashMap::new()) }
    }

    /// Record one successful completion: bump the count, touch the
    /// execution time and overwrite the cached plan (which may be empty).
    pub fn record_success(
        &self,
        intent: &str,
        focused_window: &str,
        plan: &str,
    ) -> Result<u64, StoreError> {
        let count = self.store.record_success(intent, focused_window, plan)?;
        let mut cache = self.cache.write().expect("trust cache lock poisoned");
        cache.insert((intent.to_string(), focused_window.to_string()), count);
        debug!(intent, focused_window, count, "trust recorded");
        Ok(count)
    }

    /// Success count for the pair; cache first, ledger on miss.
    pub fn get_trust(&self, intent: &str, focused_window: &str) -> Result<u64, StoreError> {
        let key = (intent.to_string(), focused_window.to_string());
        if let Some(count) = self.cache.read().expect("trust cache lock poisoned").get(&key) {
            return Ok(*count);
        }
        let count = self.store.trust_count(intent, focused_window)?;
        if count > 0 {
            self.cache.write().expect("trust cache lock poisoned").insert(key, count);
        }
        Ok(count)
    }

    /// Reflex for `intent`: the most recently executed pair whose count
    /// exceeds the threshold and whose plan is non-empty.
    pub fn get_reflex(&self, intent: &str) -> Result<Option<Reflex>, StoreError> {
        let hit = self.store.reflex_for_intent(intent, REFLEX_TRUST_THRESHOLD)?;
        Ok(hit.and_then(|row| {
            row.cached_plan.map(|plan| Reflex { plan, trust_score: row.success_count })
        }))
    }

    /// Clear the cached plan for every row matching `intent`. Counts are
    /// kept; only the reflex goes away.
    pub fn invalidate_reflex(&self, intent: &str) -> Result<(), StoreError> {
        let cleared = self.store.invalidate_reflex(intent)?;
        debug!(intent, cleared, "reflex invalidated");
        Ok(())
    }
}

impl TrustReader for TrustStore {
    fn trust_for(&self, intent: &str, focused_window: &str) -> u64 {
        self.get_trust(intent, focused_window).unwrap_or(0)
    }
}
