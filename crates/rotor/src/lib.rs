//! Multi-provider language-model dispatcher: wires [`rotor_core`]'s
//! Config/StateTracker/MemoryMonitor/Router/Orchestrator together with
//! any `rotor_kernel::ModelProvider` backend behind the consumer-facing
//! operation surface (spec §6).

use rotor_core::{
    Config, HistoryEntry, MemoryMonitor, Orchestrator, OrchestratorStatus, Priority,
    RotationError, RotationOutcome, Router, StateTracker, ValidationReport,
};
use rotor_kernel::{CancelToken, ChatMessage, ChunkStream, GenerateOptions, ModelInfo, ModelProvider, ProviderId};
use std::sync::Arc;

/// Facade over the whole rotation system: one `Rotor` per process, built
/// from [`Config::load`] and a set of registered providers.
pub struct Rotor {
    tracker: Arc<StateTracker>,
    memory: Arc<MemoryMonitor>,
    router: Arc<Router>,
    orchestrator: Orchestrator,
}

impl Rotor {
    /// Build a `Rotor` from `config`. Providers must be registered
    /// separately via [`Rotor::register_provider`] before
    /// `request_rotation`/`generate` can resolve anything.
    ///
    /// Wires the memory monitor's eviction callback to unload the evicted
    /// model through whichever provider owns it — the observer pattern that
    /// keeps `MemoryMonitor` from depending on `Router` directly (spec §9).
    pub fn new(config: Config) -> Self {
        let tracker = Arc::new(StateTracker::new());
        let memory = Arc::new(MemoryMonitor::new(config.get_thresholds(), tracker.clone()));
        let router = Arc::new(Router::new());

        let router_for_callback = router.clone();
        memory.register_cleanup_callback(move |provider_id, name| {
            let router = router_for_callback.clone();
            let provider_id = provider_id.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                if let Some(provider) = router.provider_for(&provider_id)
                    && let Err(e) = provider.unload(&name).await {
                        tracing::warn!(provider = %provider_id, model = %name, error = %e, "eviction unload failed");
                    }
            });
        });

        let orchestrator = Orchestrator::new(config, tracker.clone(), memory.clone(), router.clone());
        Self {
            tracker,
            memory,
            router,
            orchestrator,
        }
    }

    pub async fn register_provider(&self, provider: Arc<dyn ModelProvider>) {
        provider.initialize().await.ok();
        self.router.register(provider).await.ok();
    }

    /// Rebuild tracked state from every registered provider's resident
    /// model list (spec §6: "restarts rebuild state via `syncFromProviders`").
    pub async fn sync_from_providers(&self) {
        for provider_id in self.router.registered_provider_ids() {
            if let Some(provider) = self.router.provider_for(&provider_id)
                && let Ok(models) = provider.list_models().await {
                    let resident: Vec<String> = models.into_iter().map(|m| m.name).collect();
                    self.tracker.sync_from(&provider_id, &resident);
                }
        }
    }

    pub async fn request_rotation(
        &self,
        provider: impl Into<String>,
        model: impl Into<String>,
        source: impl Into<String>,
        priority: Priority,
    ) -> Result<RotationOutcome, RotationError> {
        self.orchestrator.request_rotation(provider, model, source, priority).await
    }

    pub async fn force_rotation(
        &self,
        provider: impl Into<String>,
        model: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<RotationOutcome, RotationError> {
        self.orchestrator.force_rotation(provider, model, source).await
    }

    pub fn status(&self) -> OrchestratorStatus {
        self.orchestrator.status()
    }

    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.orchestrator.history(limit)
    }

    pub fn failed(&self) -> Vec<RotationError> {
        self.orchestrator.failed()
    }

    pub async fn emergency_cleanup(&self) -> RotationOutcome {
        self.orchestrator.emergency_cleanup().await
    }

    /// Toggle periodic queue draining (spec §4.4).
    pub fn start_auto_process(&self) {
        self.orchestrator.start_auto_process();
    }

    pub fn stop_auto_process(&self) {
        self.orchestrator.stop_auto_process();
    }

    pub fn validate_config(&self) -> ValidationReport {
        self.orchestrator.validate_config()
    }

    /// Generate against whichever model is currently active for `model`'s
    /// resolved provider. Does not itself ensure activation — callers are
    /// expected to have already obtained a `rotated`/`no_change` outcome
    /// (spec §5 backpressure policy).
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> Result<String, rotor_core::RouterError> {
        self.router.generate(model, prompt, history, opts).await
    }

    pub async fn stream(
        &self,
        model: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
        cancel: Option<CancelToken>,
    ) -> Result<ChunkStream, rotor_core::RouterError> {
        self.router.stream(model, prompt, history, opts, cancel).await
    }

    pub async fn list_all_models(&self) -> Vec<(ProviderId, ModelInfo)> {
        self.router.list_all().await
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.memory
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

/// Initialize `tracing` from `RUST_LOG`, defaulting to `info` when unset.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_providers::MockProvider;

    #[tokio::test]
    async fn register_and_generate_end_to_end() {
        let rotor = Rotor::new(Config::load());
        rotor
            .register_provider(Arc::new(MockProvider::new("mock", vec!["m".to_string()])))
            .await;

        let outcome = rotor
            .request_rotation("mock", "m", "test", Priority::Normal)
            .await
            .unwrap();
        assert_eq!(outcome.action, rotor_core::RotationAction::Queued);

        for _ in 0..50 {
            if rotor.tracker().get_active(&ProviderId::new("mock")).as_deref() == Some("m") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let out = rotor
            .generate("mock:m", "hello", &[], &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "mock response to: hello");
    }

    #[tokio::test]
    async fn list_all_models_reports_registered_providers() {
        let rotor = Rotor::new(Config::load());
        rotor
            .register_provider(Arc::new(MockProvider::new("mock", vec!["a".to_string(), "b".to_string()])))
            .await;
        let all = rotor.list_all_models().await;
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn validate_config_reports_no_errors_by_default() {
        let rotor = Rotor::new(Config::load());
        let report = rotor.validate_config();
        assert!(report.is_valid);
    }
}
