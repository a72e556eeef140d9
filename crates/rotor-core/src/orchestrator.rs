//! Ensures a requested model becomes active under the rotation policy,
//! coordinating Queue, StateTracker, MemoryMonitor and Router (spec §4.6).

use crate::config::{Config, RotationPolicy};
use crate::memory::{MemoryMonitor, MemoryStats};
use crate::queue::{EnqueueError, Priority, Queue, QueueStatus};
use crate::router::Router;
use crate::state::StateTracker;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rotor_kernel::ProviderId;
pub use rotor_kernel::RotationErrorCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const HISTORY_CAP: usize = 200;
const FAILED_CAP: usize = 50;

/// Each error carries `code`, `message`, `modelName`, `operation` and a
/// timestamp (spec §4.6 failure taxonomy).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message} (model={model_name}, op={operation})")]
pub struct RotationError {
    pub code: RotationErrorCode,
    pub message: String,
    pub model_name: String,
    pub operation: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl RotationError {
    fn new(
        code: RotationErrorCode,
        message: impl Into<String>,
        model_name: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            model_name: model_name.into(),
            operation,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RotationAction {
    NoChange,
    Queued,
    Rotated,
    Forced,
    EmergencyCleanup,
    NoCleanupNeeded,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RotationOutcome {
    pub success: bool,
    pub provider: String,
    pub model: String,
    pub action: RotationAction,
    pub duration_ms: u64,
    pub memory_before: Option<MemoryStatsSnapshot>,
    pub memory_after: Option<MemoryStatsSnapshot>,
    pub error: Option<String>,
}

/// Serde-friendly mirror of [`MemoryStats`], kept separate so the
/// orchestrator's public outcome type doesn't couple to memory.rs's
/// internal representation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryStatsSnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub model_bytes: u64,
}

impl From<MemoryStats> for MemoryStatsSnapshot {
    fn from(s: MemoryStats) -> Self {
        Self {
            total_bytes: s.total_bytes,
            used_bytes: s.used_bytes,
            available_bytes: s.available_bytes,
            model_bytes: s.model_bytes,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HistoryEntry {
    pub provider: String,
    pub model: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: u64,
    pub is_forced: bool,
    pub memory_before: MemoryStatsSnapshot,
    pub memory_after: MemoryStatsSnapshot,
    pub status: &'static str,
}

#[derive(Debug, Clone)]
pub struct OrchestratorStatus {
    pub is_rotating: bool,
    pub current: Option<String>,
    pub active: std::collections::HashMap<ProviderId, String>,
    pub queue: QueueStatus,
    pub memory: MemoryStats,
    pub last_history_entry: Option<HistoryEntry>,
    pub failed_count: usize,
}

/// Everything a rotation attempt needs, shared (via `Arc<Inner>`) between
/// the `Orchestrator` handle and the spawned queue-drain task so both paths
/// run the exact same `perform_rotation` logic instead of duplicating it.
struct Inner {
    config: Config,
    queue: Arc<Queue>,
    tracker: Arc<StateTracker>,
    memory: Arc<MemoryMonitor>,
    router: Arc<Router>,
    /// Serialises rotation attempts: a second caller (another `force_rotation`,
    /// or a queue drain racing a force) waits for this lock rather than
    /// failing outright, per spec §4.6's "concurrent forces are serialised
    /// too" invariant.
    rotation_lock: tokio::sync::Mutex<()>,
    is_rotating: AtomicBool,
    current: Mutex<Option<(String, String)>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    failed: Mutex<VecDeque<RotationError>>,
}

impl Inner {
    fn rotation_policy(&self) -> &RotationPolicy {
        self.config.get_rotation()
    }

    /// Drain one request end-to-end (spec §4.6 "Drain one request"). Used by
    /// both the queue drain loop and `force_rotation`.
    async fn perform_rotation(&self, provider: String, name: String, is_forced: bool) -> Result<RotationOutcome, RotationError> {
        let _permit = self.rotation_lock.lock().await;
        self.is_rotating.store(true, Ordering::Release);
        struct Guard<'a>(&'a AtomicBool);
        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _guard = Guard(&self.is_rotating);

        let start = Utc::now();
        *self.current.lock() = Some((provider.clone(), name.clone()));
        let memory_before = self.memory.snapshot();
        let provider_id = ProviderId::new(provider.clone());

        let Some(provider_handle) = self.router.provider_for(&provider_id) else {
            *self.current.lock() = None;
            let err = RotationError::new(RotationErrorCode::ModelNotFound, "no such provider", &name, "performRotation");
            self.record_failure(&provider, &name, start, memory_before, is_forced, err.clone());
            return Err(err);
        };

        if let Some(current_active) = self.tracker.get_active(&provider_id)
            && current_active != name {
                if let Err(e) = provider_handle.unload(&current_active).await {
                    tracing::warn!(provider = %provider, model = %current_active, error = %e, "unload failed, continuing");
                }
                self.tracker.remove(&provider_id, &current_active);
            }

        let policy = self.rotation_policy();
        let mut last_err = None;
        let mut loaded = false;
        for attempt in 0..policy.retry_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(policy.retry_delay_ms * u64::from(attempt))).await;
            }
            match tokio::time::timeout(self.config.rotation_timeout(), provider_handle.load(&name)).await {
                Ok(Ok(mem)) => {
                    self.tracker.set_active(provider_id.clone(), &name);
                    self.tracker.record_load_size(&provider_id, &name, mem);
                    loaded = true;
                    break;
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some("operation timed out".to_string()),
            }
        }

        *self.current.lock() = None;
        let end = Utc::now();
        let duration_ms = (end - start).num_milliseconds().max(0) as u64;
        let memory_after = self.memory.snapshot();

        if loaded {
            self.push_history(HistoryEntry {
                provider: provider.clone(),
                model: name.clone(),
                start,
                end,
                duration_ms,
                is_forced,
                memory_before: memory_before.into(),
                memory_after: memory_after.into(),
                status: "success",
            });
            Ok(RotationOutcome {
                success: true,
                provider,
                model: name,
                action: if is_forced { RotationAction::Forced } else { RotationAction::Rotated },
                duration_ms,
                memory_before: Some(memory_before.into()),
                memory_after: Some(memory_after.into()),
                error: None,
            })
        } else {
            let err = RotationError::new(
                RotationErrorCode::ModelLoadFailed,
                last_err.unwrap_or_else(|| "load failed".to_string()),
                &name,
                "performRotation",
            );
            self.push_history(HistoryEntry {
                provider: provider.clone(),
                model: name.clone(),
                start,
                end,
                duration_ms,
                is_forced,
                memory_before: memory_before.into(),
                memory_after: memory_after.into(),
                status: "failed",
            });
            self.push_failed(err.clone());
            Err(err)
        }
    }

    fn record_failure(
        &self,
        provider: &str,
        name: &str,
        start: DateTime<Utc>,
        memory_before: MemoryStats,
        is_forced: bool,
        err: RotationError,
    ) {
        let end = Utc::now();
        self.push_history(HistoryEntry {
            provider: provider.to_string(),
            model: name.to_string(),
            start,
            end,
            duration_ms: (end - start).num_milliseconds().max(0) as u64,
            is_forced,
            memory_before: memory_before.into(),
            memory_after: self.memory.snapshot().into(),
            status: "failed",
        });
        self.push_failed(err);
    }

    fn push_history(&self, entry: HistoryEntry) {
        let mut guard = self.history.lock();
        guard.push_back(entry);
        while guard.len() > HISTORY_CAP {
            guard.pop_front();
        }
    }

    fn push_failed(&self, err: RotationError) {
        let mut guard = self.failed.lock();
        guard.push_back(err);
        while guard.len() > FAILED_CAP {
            guard.pop_front();
        }
    }

    /// One drain pass over the queue, sharing `perform_rotation` with
    /// `force_rotation`. Used by both the one-shot drain spawned from
    /// `request_rotation` and the periodic auto-process loop.
    async fn drain_queue(self: Arc<Self>) {
        let queue = self.queue.clone();
        queue
            .process(|req| {
                let inner = self.clone();
                async move {
                    let _ = inner.perform_rotation(req.provider, req.model_name, false).await;
                }
            })
            .await;
    }
}

/// Public face of the rotation core: ties together [`Queue`], [`StateTracker`],
/// [`MemoryMonitor`] and [`Router`] behind the operation surface of spec §4.6.
///
/// `is_rotating` is the single in-flight-rotation guard — every entry point
/// that drives a provider transition (`performRotation`, `forceRotation`,
/// `emergencyCleanup`) takes it, so providers never see overlapping
/// load/unload calls (spec §5).
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Config, tracker: Arc<StateTracker>, memory: Arc<MemoryMonitor>, router: Arc<Router>) -> Self {
        let max_size = config.get_queue().max_size;
        Self {
            inner: Arc::new(Inner {
                config,
                queue: Arc::new(Queue::new(max_size)),
                tracker,
                memory,
                router,
                rotation_lock: tokio::sync::Mutex::new(()),
                is_rotating: AtomicBool::new(false),
                current: Mutex::new(None),
                history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
                failed: Mutex::new(VecDeque::with_capacity(FAILED_CAP)),
            }),
        }
    }

    fn validate_inputs(provider: &str, name: &str, source: &str) -> Result<(), RotationError> {
        if provider.trim().is_empty() || name.trim().is_empty() || source.trim().is_empty() {
            return Err(RotationError::new(
                RotationErrorCode::InvalidInput,
                "provider, model name and source must be non-empty",
                name,
                "requestRotation",
            ));
        }
        Ok(())
    }

    /// Steps 1-6 of spec §4.6's `requestRotation`.
    pub async fn request_rotation(
        &self,
        provider: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
        priority: Priority,
    ) -> Result<RotationOutcome, RotationError> {
        let provider = provider.into();
        let name = name.into();
        let source = source.into();
        Self::validate_inputs(&provider, &name, &source)?;

        let provider_id = ProviderId::new(provider.clone());

        if self.inner.tracker.get_active(&provider_id).as_deref() == Some(name.as_str()) {
            self.inner.tracker.set_active(provider_id, &name);
            return Ok(RotationOutcome {
                success: true,
                provider,
                model: name,
                action: RotationAction::NoChange,
                duration_ms: 0,
                memory_before: None,
                memory_after: None,
                error: None,
            });
        }

        let provider_handle = self.inner.router.provider_for(&provider_id).ok_or_else(|| {
            RotationError::new(RotationErrorCode::ModelNotFound, "no such provider", &name, "requestRotation")
        })?;
        let exists = provider_handle
            .exists(&name)
            .await
            .map_err(|e| RotationError::new(RotationErrorCode::ModelNotFound, e.to_string(), &name, "requestRotation"))?;
        if !exists {
            return Err(RotationError::new(RotationErrorCode::ModelNotFound, "model does not exist", &name, "requestRotation"));
        }

        match self.inner.queue.enqueue(provider.clone(), name.clone(), priority, source) {
            Ok(_) => {}
            Err(EnqueueError::QueueFull) => {
                return Err(RotationError::new(RotationErrorCode::QueueFull, "queue is full", &name, "requestRotation"));
            }
            Err(EnqueueError::InvalidInput) => {
                return Err(RotationError::new(RotationErrorCode::InvalidInput, "invalid enqueue input", &name, "requestRotation"));
            }
        }

        if !self.inner.queue.is_processing() {
            self.start_draining();
        }

        Ok(RotationOutcome {
            success: true,
            provider,
            model: name,
            action: RotationAction::Queued,
            duration_ms: 0,
            memory_before: None,
            memory_after: None,
            error: None,
        })
    }

    /// Spawn a single drain pass over the queue. The queue's own
    /// single-processor guard prevents two drains from running concurrently.
    fn start_draining(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drain_queue().await;
        });
    }

    /// Toggle periodic draining (spec §4.4): spawns a loop that ticks every
    /// `queue.processing_interval_ms` and runs a drain pass while auto-process
    /// is enabled, stopping as soon as [`Orchestrator::stop_auto_process`] (or
    /// `emergency_cleanup`) flips the flag back off.
    pub fn start_auto_process(&self) {
        self.inner.queue.start_auto_process();
        let queue = self.inner.queue.clone();
        let inner = self.inner.clone();
        let interval_ms = self.inner.config.get_queue().processing_interval_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if !queue.auto_process_enabled() {
                    break;
                }
                inner.clone().drain_queue().await;
            }
        });
    }

    pub fn stop_auto_process(&self) {
        self.inner.queue.stop_auto_process();
    }

    /// Bypasses the queue and runs even if a queue drain is in progress; the
    /// shared `is_rotating` guard still serialises it against another
    /// in-flight attempt (spec §4.6).
    pub async fn force_rotation(
        &self,
        provider: impl Into<String>,
        name: impl Into<String>,
        _source: impl Into<String>,
    ) -> Result<RotationOutcome, RotationError> {
        let provider = provider.into();
        let name = name.into();
        Self::validate_inputs(&provider, &name, "force")?;
        self.inner.perform_rotation(provider, name, true).await
    }

    /// Clears the queue, unloads every active model, returns an outcome
    /// (spec §4.6).
    pub async fn emergency_cleanup(&self) -> RotationOutcome {
        self.inner.queue.stop_auto_process();
        self.inner.queue.clear();

        let active = self.inner.tracker.active_snapshot();
        let mut any_failed = false;
        for (provider_id, name) in &active {
            if let Some(provider_handle) = self.inner.router.provider_for(provider_id)
                && let Err(e) = provider_handle.unload(name).await {
                    tracing::warn!(provider = %provider_id, model = %name, error = %e, "unload failed during emergency cleanup");
                    any_failed = true;
                }
            self.inner.tracker.remove(provider_id, name);
        }

        RotationOutcome {
            success: !any_failed,
            provider: String::new(),
            model: String::new(),
            action: RotationAction::EmergencyCleanup,
            duration_ms: 0,
            memory_before: None,
            memory_after: Some(self.inner.memory.snapshot().into()),
            error: if any_failed {
                Some("one or more providers failed to unload".to_string())
            } else {
                None
            },
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            is_rotating: self.inner.is_rotating.load(Ordering::Acquire),
            current: self.inner.current.lock().clone().map(|(p, n)| format!("{p}:{n}")),
            active: self.inner.tracker.active_snapshot(),
            queue: self.inner.queue.status(),
            memory: self.inner.memory.snapshot(),
            last_history_entry: self.inner.history.lock().back().cloned(),
            failed_count: self.inner.failed.lock().len(),
        }
    }

    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.inner.history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn failed(&self) -> Vec<RotationError> {
        self.inner.failed.lock().iter().cloned().collect()
    }

    pub fn validate_config(&self) -> crate::config::ValidationReport {
        self.inner.config.validate_report()
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.inner.queue
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.inner.tracker
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.inner.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use async_trait::async_trait;
    use rotor_kernel::{
        CancelToken, ChatMessage, ChunkStream, GenerateOptions, ModelInfo, ModelProvider, ProviderError,
        ProviderHealth, ProviderResult,
    };

    struct FlakyProvider {
        name: &'static str,
        models: Vec<&'static str>,
        fail_loads: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn prefix(&self) -> &str {
            self.name
        }
        async fn initialize(&self) -> ProviderResult<()> {
            Ok(())
        }
        async fn shutdown(&self) -> ProviderResult<()> {
            Ok(())
        }
        async fn health_check(&self) -> ProviderResult<ProviderHealth> {
            Ok(ProviderHealth::Healthy)
        }
        async fn list_models(&self) -> ProviderResult<Vec<ModelInfo>> {
            Ok(self
                .models
                .iter()
                .map(|m| ModelInfo {
                    name: m.to_string(),
                    capabilities: vec![],
                    metadata: Default::default(),
                })
                .collect())
        }
        async fn exists(&self, name: &str) -> ProviderResult<bool> {
            Ok(self.models.contains(&name))
        }
        async fn load(&self, _name: &str) -> ProviderResult<u64> {
            if self.fail_loads.load(Ordering::Relaxed) > 0 {
                self.fail_loads.fetch_sub(1, Ordering::Relaxed);
                return Err(ProviderError::LoadFailed("simulated".into()));
            }
            Ok(1024)
        }
        async fn unload(&self, _name: &str) -> ProviderResult<()> {
            Ok(())
        }
        async fn generate(
            &self,
            _name: &str,
            _prompt: &str,
            _history: &[ChatMessage],
            _opts: &GenerateOptions,
        ) -> ProviderResult<String> {
            Ok("ok".into())
        }
        async fn stream(
            &self,
            _name: &str,
            _prompt: &str,
            _history: &[ChatMessage],
            _opts: &GenerateOptions,
            _cancel: Option<CancelToken>,
        ) -> ProviderResult<ChunkStream> {
            Ok(Box::pin(futures::stream::iter(vec![])))
        }
    }

    async fn build(provider_models: Vec<&'static str>, fail_loads: u32) -> Orchestrator {
        let tracker = Arc::new(StateTracker::new());
        let memory = Arc::new(MemoryMonitor::new(
            Thresholds {
                warning: 99,
                critical: 100,
                cleanup: 100,
            },
            tracker.clone(),
        ));
        let router = Arc::new(Router::new());
        router
            .register(Arc::new(FlakyProvider {
                name: "ollama",
                models: provider_models,
                fail_loads: std::sync::atomic::AtomicU32::new(fail_loads),
            }))
            .await
            .unwrap();
        Orchestrator::new(Config::load(), tracker, memory, router)
    }

    #[tokio::test]
    async fn already_active_returns_no_change() {
        let orch = build(vec!["mistral:7b"], 0).await;
        orch.inner.tracker.set_active(ProviderId::new("ollama"), "mistral:7b");
        let outcome = orch
            .request_rotation("ollama", "mistral:7b", "test", Priority::Normal)
            .await
            .unwrap();
        assert_eq!(outcome.action, RotationAction::NoChange);
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let orch = build(vec!["a"], 0).await;
        let err = orch
            .request_rotation("ollama", "nope", "test", Priority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err.code, RotationErrorCode::ModelNotFound);
    }

    #[tokio::test]
    async fn simple_rotation_queues_and_drains() {
        let orch = build(vec!["B"], 0).await;
        let outcome = orch
            .request_rotation("ollama", "B", "test", Priority::Normal)
            .await
            .unwrap();
        assert_eq!(outcome.action, RotationAction::Queued);

        for _ in 0..50 {
            if orch.tracker().get_active(&ProviderId::new("ollama")).as_deref() == Some("B") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(orch.tracker().get_active(&ProviderId::new("ollama")), Some("B".to_string()));
    }

    #[tokio::test]
    async fn force_rotation_bypasses_queue() {
        let orch = build(vec!["C"], 0).await;
        let outcome = orch.force_rotation("ollama", "C", "admin").await.unwrap();
        assert_eq!(outcome.action, RotationAction::Forced);
        assert_eq!(orch.tracker().get_active(&ProviderId::new("ollama")), Some("C".to_string()));
    }

    #[tokio::test]
    async fn successful_load_records_provider_byte_estimate() {
        let orch = build(vec!["C"], 0).await;
        orch.force_rotation("ollama", "C", "admin").await.unwrap();
        let meta = orch.tracker().get_metadata(&ProviderId::new("ollama"), "C").unwrap();
        assert_eq!(meta.memory_usage, 1024);
    }

    #[tokio::test]
    async fn concurrent_force_rotations_serialise_instead_of_erroring() {
        let orch = Arc::new(build(vec!["X", "Y"], 0).await);
        let (o1, o2) = (orch.clone(), orch.clone());
        let (r1, r2) = tokio::join!(
            o1.force_rotation("ollama", "X", "a"),
            o2.force_rotation("ollama", "Y", "b"),
        );
        assert!(r1.is_ok(), "{r1:?}");
        assert!(r2.is_ok(), "{r2:?}");
    }

    #[tokio::test]
    async fn auto_process_drains_queue_without_a_manual_trigger() {
        let orch = build(vec!["G"], 0).await;
        orch.inner.queue.enqueue("ollama", "G", Priority::Normal, "s").unwrap();
        orch.start_auto_process();

        for _ in 0..300 {
            if orch.tracker().get_active(&ProviderId::new("ollama")).as_deref() == Some("G") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(orch.tracker().get_active(&ProviderId::new("ollama")), Some("G".to_string()));
        orch.stop_auto_process();
    }

    #[tokio::test]
    async fn failed_load_is_recorded_in_failed_ring() {
        let orch = build(vec!["D"], 10).await;
        let err = orch.force_rotation("ollama", "D", "admin").await.unwrap_err();
        assert_eq!(err.code, RotationErrorCode::ModelLoadFailed);
        assert_eq!(orch.failed().len(), 1);
    }

    #[tokio::test]
    async fn emergency_cleanup_clears_queue_and_active_models() {
        let orch = build(vec!["E"], 0).await;
        orch.inner.tracker.set_active(ProviderId::new("ollama"), "E");
        orch.inner.queue.enqueue("ollama", "F", Priority::Low, "s").unwrap();
        let outcome = orch.emergency_cleanup().await;
        assert_eq!(outcome.action, RotationAction::EmergencyCleanup);
        assert!(outcome.success);
        assert!(orch.queue().is_empty());
        assert_eq!(orch.tracker().get_active(&ProviderId::new("ollama")), None);
    }

    #[test]
    fn rotation_error_code_matches_spec_tags() {
        assert_eq!(RotationErrorCode::QueueFull.as_str(), "QUEUE_FULL");
        assert_eq!(RotationErrorCode::ModelLoadFailed.as_str(), "MODEL_LOAD_FAILED");
    }
}
