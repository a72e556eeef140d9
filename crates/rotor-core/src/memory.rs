//! Host memory sampling and eviction decisions (spec §4.3).
//!
//! `MemoryMonitor` never talks to a provider directly — it only decides
//! *that* a model should be evicted and *which* one, then hands the name to
//! whatever callbacks are registered (spec §9: breaking the
//! provider<->monitor cycle with an observer).

use crate::config::Thresholds;
use crate::state::StateTracker;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rotor_kernel::ProviderId;
use std::sync::Arc;
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub model_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCheck {
    Ok,
    Warn,
    CleanupNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

type CleanupCallback = Box<dyn Fn(&ProviderId, &str) + Send + Sync>;

/// Samples host memory via `sysinfo` and decides when to evict.
///
/// Holds a reference to the [`StateTracker`] to compute `model_bytes` and
/// to pick the globally-LRU tracked model for eviction; it never mutates
/// the tracker itself except via [`MemoryMonitor::trigger_cleanup`]'s own
/// `remove` call, matching spec §4.3.
pub struct MemoryMonitor {
    thresholds: Thresholds,
    tracker: Arc<StateTracker>,
    baseline: Mutex<MemoryStats>,
    callbacks: Mutex<Vec<CleanupCallback>>,
}

impl MemoryMonitor {
    pub fn new(thresholds: Thresholds, tracker: Arc<StateTracker>) -> Self {
        let baseline = Self::sample(&tracker);
        Self {
            thresholds,
            tracker,
            baseline: Mutex::new(baseline),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn sample(tracker: &StateTracker) -> MemoryStats {
        let mut sys = System::new();
        sys.refresh_memory();
        let total_bytes = sys.total_memory();
        let free_bytes = sys.free_memory();
        let used_bytes = total_bytes.saturating_sub(free_bytes);
        let available_bytes = total_bytes.saturating_sub(used_bytes);
        let model_bytes: u64 = tracker.all_metadata().iter().map(|m| m.memory_usage).sum();

        MemoryStats {
            total_bytes,
            used_bytes,
            available_bytes,
            model_bytes: model_bytes.min(used_bytes),
            timestamp: Utc::now(),
        }
    }

    pub fn snapshot(&self) -> MemoryStats {
        Self::sample(&self.tracker)
    }

    fn percent_used(stats: &MemoryStats) -> u8 {
        if stats.total_bytes == 0 {
            return 0;
        }
        ((stats.used_bytes as f64 / stats.total_bytes as f64) * 100.0).round() as u8
    }

    pub fn check(&self) -> MemoryCheck {
        let stats = self.snapshot();
        let pct = Self::percent_used(&stats);
        if pct >= self.thresholds.cleanup || pct >= self.thresholds.critical {
            MemoryCheck::CleanupNeeded
        } else if pct >= self.thresholds.warning {
            MemoryCheck::Warn
        } else {
            MemoryCheck::Ok
        }
    }

    /// If [`MemoryMonitor::check`] reports cleanup-needed, evicts the
    /// globally LRU tracked model and notifies every registered callback
    /// best-effort. Returns whether an eviction happened.
    pub fn trigger_cleanup(&self) -> bool {
        if self.check() != MemoryCheck::CleanupNeeded {
            return false;
        }
        let Some((provider, name)) = self.tracker.lru(None) else {
            return false;
        };
        self.tracker.remove(&provider, &name);
        for cb in self.callbacks.lock().iter() {
            cb(&provider, &name);
        }
        true
    }

    pub fn trend(&self) -> Trend {
        let baseline = *self.baseline.lock();
        let current = self.snapshot();
        if baseline.used_bytes == 0 {
            return Trend::Stable;
        }
        let delta = current.used_bytes as f64 - baseline.used_bytes as f64;
        let ratio = delta / baseline.used_bytes as f64;
        if ratio > 0.10 {
            Trend::Increasing
        } else if ratio < -0.10 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }

    pub fn reset_baseline(&self) {
        *self.baseline.lock() = self.snapshot();
    }

    /// Register a callback invoked with the evicted model's name on every
    /// eviction. Callbacks are best-effort: one panicking/erroring does not
    /// prevent the others from running (the glue registrar, not this
    /// monitor, is where "unload the provider" lives).
    pub fn register_cleanup_callback(
        &self,
        cb: impl Fn(&ProviderId, &str) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().push(Box::new(cb));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            warning: 1,
            critical: 2,
            cleanup: 3,
        }
    }

    #[test]
    fn check_reports_cleanup_needed_when_over_threshold() {
        let tracker = Arc::new(StateTracker::new());
        let monitor = MemoryMonitor::new(thresholds(), tracker);
        // Real host memory usage is virtually guaranteed to exceed 3%.
        assert_eq!(monitor.check(), MemoryCheck::CleanupNeeded);
    }

    #[test]
    fn trigger_cleanup_evicts_global_lru() {
        let tracker = Arc::new(StateTracker::new());
        tracker.set_active(ProviderId::new("p"), "old");
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.set_active(ProviderId::new("p"), "new");

        let monitor = MemoryMonitor::new(thresholds(), tracker.clone());
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        monitor.register_cleanup_callback(move |_p, name| {
            evicted2.lock().push(name.to_string());
        });

        assert!(monitor.trigger_cleanup());
        assert_eq!(*evicted.lock(), vec!["old".to_string()]);
        assert!(!tracker.is_loaded(&ProviderId::new("p"), "old"));
        assert!(tracker.is_loaded(&ProviderId::new("p"), "new"));
    }

    #[test]
    fn trigger_cleanup_no_models_tracked_is_noop() {
        let tracker = Arc::new(StateTracker::new());
        let monitor = MemoryMonitor::new(thresholds(), tracker);
        assert!(!monitor.trigger_cleanup());
    }

    #[test]
    fn trigger_cleanup_calls_all_callbacks_even_if_one_is_noisy() {
        let tracker = Arc::new(StateTracker::new());
        tracker.set_active(ProviderId::new("p"), "only");
        let monitor = MemoryMonitor::new(thresholds(), tracker);
        let hits = Arc::new(Mutex::new(0));
        let hits2 = hits.clone();
        monitor.register_cleanup_callback(|_p, _name| {
            // first callback does nothing observable
        });
        monitor.register_cleanup_callback(move |_p, _name| {
            *hits2.lock() += 1;
        });
        monitor.trigger_cleanup();
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn ok_thresholds_report_ok() {
        let tracker = Arc::new(StateTracker::new());
        let monitor = MemoryMonitor::new(
            Thresholds {
                warning: 99,
                critical: 100,
                cleanup: 100,
            },
            tracker,
        );
        assert_eq!(monitor.check(), MemoryCheck::Ok);
    }
}
