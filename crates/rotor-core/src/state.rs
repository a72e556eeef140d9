//! Per-provider active-model tracking with LRU metadata (spec §4.2).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rotor_kernel::ProviderId;
use std::collections::HashMap;

/// One record per `(provider, name)` ever observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    pub name: String,
    pub provider: ProviderId,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub memory_usage: u64,
    pub request_count: u64,
    pub error_count: u64,
}

impl ModelMetadata {
    fn new(provider: ProviderId, name: String, now: DateTime<Utc>) -> Self {
        Self {
            name,
            provider,
            loaded_at: now,
            last_used_at: now,
            memory_usage: 0,
            request_count: 0,
            error_count: 0,
        }
    }
}

/// Authoritative, in-process record of active models and their metadata.
///
/// Backed by [`DashMap`], so mutations go through `&self` methods and
/// readers observe the state as of the most recently completed write
/// (spec §4.2, §5).
pub struct StateTracker {
    // key: (provider, name)
    metadata: DashMap<(ProviderId, String), ModelMetadata>,
    active: DashMap<ProviderId, String>,
    initialized: std::sync::atomic::AtomicBool,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            metadata: DashMap::new(),
            active: DashMap::new(),
            initialized: std::sync::atomic::AtomicBool::new(true),
        }
    }

    fn require_initialized(&self) {
        assert!(
            self.initialized.load(std::sync::atomic::Ordering::Acquire),
            "StateTracker used after reset() without re-initialisation"
        );
    }

    /// Upserts metadata, bumps `last_used_at`/`request_count`, and makes
    /// `name` the active model for `provider`. Any previous active entry
    /// for that provider is replaced; its metadata is kept (spec §4.2).
    pub fn set_active(&self, provider: ProviderId, name: &str) {
        self.require_initialized();
        let now = Utc::now();
        let key = (provider.clone(), name.to_string());
        self.metadata
            .entry(key)
            .and_modify(|m| {
                m.last_used_at = now;
                m.request_count += 1;
            })
            .or_insert_with(|| {
                let mut m = ModelMetadata::new(provider.clone(), name.to_string(), now);
                m.request_count = 1;
                m
            });
        self.active.insert(provider, name.to_string());
    }

    /// Records a provider's best-effort byte estimate for a load, feeding
    /// `MemoryStats.model_bytes` (spec §3, §4.3). Called after a successful
    /// `load()`, separately from `set_active`, since not every active-model
    /// transition has a fresh size to report.
    pub fn record_load_size(&self, provider: &ProviderId, name: &str, memory_usage: u64) {
        self.require_initialized();
        if let Some(mut entry) = self.metadata.get_mut(&(provider.clone(), name.to_string())) {
            entry.memory_usage = memory_usage;
        }
    }

    pub fn get_active(&self, provider: &ProviderId) -> Option<String> {
        self.require_initialized();
        self.active.get(provider).map(|v| v.clone())
    }

    pub fn get_metadata(&self, provider: &ProviderId, name: &str) -> Option<ModelMetadata> {
        self.require_initialized();
        self.metadata
            .get(&(provider.clone(), name.to_string()))
            .map(|v| v.clone())
    }

    pub fn get_all_metadata(&self, provider: &ProviderId) -> Vec<ModelMetadata> {
        self.require_initialized();
        self.metadata
            .iter()
            .filter(|entry| &entry.value().provider == provider)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All tracked metadata, regardless of provider. Used for cross-provider
    /// LRU selection by the memory monitor.
    pub fn all_metadata(&self) -> Vec<ModelMetadata> {
        self.require_initialized();
        self.metadata.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn is_loaded(&self, provider: &ProviderId, name: &str) -> bool {
        self.require_initialized();
        self.metadata.contains_key(&(provider.clone(), name.to_string()))
    }

    /// Drops metadata and, if currently active, the active entry too.
    /// Returns whether a record was present.
    pub fn remove(&self, provider: &ProviderId, name: &str) -> bool {
        self.require_initialized();
        let present = self
            .metadata
            .remove(&(provider.clone(), name.to_string()))
            .is_some();
        if present && self.active.get(provider).is_some_and(|v| v.as_str() == name) {
            self.active.remove(provider);
        }
        present
    }

    /// Name with minimum `last_used_at`, among all known models optionally
    /// filtered to one provider. `None` if there are none to choose from.
    pub fn lru(&self, provider: Option<&ProviderId>) -> Option<(ProviderId, String)> {
        self.require_initialized();
        self.metadata
            .iter()
            .filter(|entry| provider.is_none_or(|p| &entry.value().provider == p))
            .min_by_key(|entry| entry.value().last_used_at)
            .map(|entry| (entry.value().provider.clone(), entry.value().name.clone()))
    }

    /// Wipes everything; any subsequent read panics until `new()`/`reset()`
    /// brings the tracker back (spec §4.2 invariant: "after reset, any read
    /// must fail").
    pub fn reset(&self) {
        self.metadata.clear();
        self.active.clear();
        self.initialized
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Ask each registered provider for its resident models; create or
    /// refresh metadata for each, and recover the active entry heuristically
    /// when exactly one model is resident for a provider (spec §4.2).
    pub fn sync_from(&self, provider: &ProviderId, resident: &[String]) {
        self.require_initialized();
        let now = Utc::now();
        for name in resident {
            self.metadata
                .entry((provider.clone(), name.clone()))
                .and_modify(|m| m.last_used_at = now)
                .or_insert_with(|| ModelMetadata::new(provider.clone(), name.clone(), now));
        }
        if resident.len() == 1 {
            self.active.insert(provider.clone(), resident[0].clone());
        }
    }

    /// Current size of the active map, used for the
    /// `sum_p |ActiveMap(p)| <= maxConcurrentModels` invariant (spec §8-1).
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_snapshot(&self) -> HashMap<ProviderId, String> {
        self.active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderId {
        ProviderId::new("daemon")
    }

    #[test]
    fn set_active_creates_metadata_and_active_entry() {
        let tracker = StateTracker::new();
        tracker.set_active(provider(), "mistral:7b");
        assert_eq!(tracker.get_active(&provider()), Some("mistral:7b".to_string()));
        let meta = tracker.get_metadata(&provider(), "mistral:7b").unwrap();
        assert_eq!(meta.request_count, 1);
        assert!(meta.last_used_at >= meta.loaded_at);
    }

    #[test]
    fn set_active_replaces_but_keeps_old_metadata() {
        let tracker = StateTracker::new();
        tracker.set_active(provider(), "a");
        tracker.set_active(provider(), "b");
        assert_eq!(tracker.get_active(&provider()), Some("b".to_string()));
        assert!(tracker.is_loaded(&provider(), "a"));
    }

    #[test]
    fn remove_clears_metadata_and_active_entry() {
        let tracker = StateTracker::new();
        tracker.set_active(provider(), "a");
        assert!(tracker.remove(&provider(), "a"));
        assert!(!tracker.is_loaded(&provider(), "a"));
        assert_eq!(tracker.get_active(&provider()), None);
    }

    #[test]
    fn remove_of_unknown_model_returns_false() {
        let tracker = StateTracker::new();
        assert!(!tracker.remove(&provider(), "nope"));
    }

    #[test]
    fn lru_picks_globally_oldest() {
        let tracker = StateTracker::new();
        tracker.set_active(provider(), "a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.set_active(provider(), "b");
        let (_, name) = tracker.lru(None).unwrap();
        assert_eq!(name, "a");
    }

    #[test]
    #[should_panic(expected = "used after reset")]
    fn reads_after_reset_panic() {
        let tracker = StateTracker::new();
        tracker.set_active(provider(), "a");
        tracker.initialized.store(false, std::sync::atomic::Ordering::Release);
        tracker.get_active(&provider());
    }

    #[test]
    fn reset_then_reuse_works() {
        let tracker = StateTracker::new();
        tracker.set_active(provider(), "a");
        tracker.reset();
        assert_eq!(tracker.get_active(&provider()), None);
        tracker.set_active(provider(), "b");
        assert_eq!(tracker.get_active(&provider()), Some("b".to_string()));
    }

    #[test]
    fn sync_from_single_resident_recovers_active() {
        let tracker = StateTracker::new();
        tracker.sync_from(&provider(), &["solo".to_string()]);
        assert_eq!(tracker.get_active(&provider()), Some("solo".to_string()));
    }

    #[test]
    fn sync_from_multiple_resident_does_not_guess_active() {
        let tracker = StateTracker::new();
        tracker.sync_from(&provider(), &["a".to_string(), "b".to_string()]);
        assert_eq!(tracker.get_active(&provider()), None);
        assert!(tracker.is_loaded(&provider(), "a"));
        assert!(tracker.is_loaded(&provider(), "b"));
    }
}
