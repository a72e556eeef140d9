//! Resolves a model identifier to a provider and forwards calls (spec §4.5).

use parking_lot::RwLock;
use rotor_kernel::{
    CancelToken, ChatMessage, ChunkStream, GenerateOptions, ModelInfo, ModelProvider,
    ProviderError, ProviderId,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    #[error("no provider for model {0:?}")]
    NoProvider(String),
    #[error("provider {provider_name} error: {cause}")]
    ProviderError {
        provider_name: String,
        cause: ProviderError,
    },
    #[error("provider {0} is missing a required capability and cannot be registered")]
    IncompleteProvider(String),
    #[error("no provider registered under name {0:?}")]
    UnknownProvider(String),
}

pub type RouterResult<T> = Result<T, RouterError>;

struct Registered {
    provider: Arc<dyn ModelProvider>,
    /// Cache of the provider's own model list, refreshed by
    /// `refresh_mappings`/`register`, used for prefix resolution (step 2).
    known_models: Vec<String>,
}

/// Registry of providers; resolves a model identifier to a provider and
/// forwards generation/streaming calls.
///
/// The Router is a transparent pipe: it does not interpret provider
/// internals beyond the [`ModelProvider`] contract, and for streaming it
/// forwards chunks in order and stops yielding on cancellation (spec §4.5,
/// §5).
pub struct Router {
    providers: RwLock<HashMap<ProviderId, Registered>>,
    explicit: RwLock<HashMap<String, ProviderId>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            explicit: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider. Triggers a model-list refresh immediately so
    /// prefix resolution works right away.
    pub async fn register(&self, provider: Arc<dyn ModelProvider>) -> RouterResult<()> {
        let id = ProviderId::new(provider.name().to_string());
        let known_models = match provider.list_models().await {
            Ok(models) => models.into_iter().map(|m| m.name).collect(),
            Err(_) => Vec::new(),
        };
        self.providers.write().insert(
            id,
            Registered {
                provider,
                known_models,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        let id = ProviderId::new(name.to_string());
        self.providers.write().remove(&id);
        self.explicit.write().retain(|_, p| p.as_str() != name);
    }

    pub fn set_explicit(&self, model_name: impl Into<String>, provider: impl Into<ProviderId>) {
        self.explicit.write().insert(model_name.into(), provider.into());
    }

    pub fn remove_explicit(&self, model_name: &str) {
        self.explicit.write().remove(model_name);
    }

    /// Resolution algorithm (spec §4.5):
    /// 1. explicit map
    /// 2. `prefix:name` where `prefix` names a registered provider and that
    ///    provider's last known list contains `name`
    /// 3. none
    pub fn resolve(&self, model: &str) -> Option<ProviderId> {
        if let Some(p) = self.explicit.read().get(model) {
            return Some(p.clone());
        }
        if let Some((prefix, rest)) = model.split_once(':') {
            let providers = self.providers.read();
            if let Some(reg) = providers.get(&ProviderId::new(prefix.to_string()))
                && reg.known_models.iter().any(|m| m == rest) {
                    return Some(ProviderId::new(prefix.to_string()));
                }
        }
        None
    }

    fn get(&self, id: &ProviderId) -> Option<Arc<dyn ModelProvider>> {
        self.providers.read().get(id).map(|r| r.provider.clone())
    }

    pub fn provider_for(&self, id: &ProviderId) -> Option<Arc<dyn ModelProvider>> {
        self.get(id)
    }

    fn wrap_err(provider_name: &str, err: ProviderError) -> RouterError {
        RouterError::ProviderError {
            provider_name: provider_name.to_string(),
            cause: err,
        }
    }

    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> RouterResult<String> {
        let provider_id = self.resolve(model).ok_or_else(|| RouterError::NoProvider(model.to_string()))?;
        let provider = self.get(&provider_id).ok_or_else(|| RouterError::NoProvider(model.to_string()))?;
        let bare_name = bare_model_name(model, provider_id.as_str());
        provider
            .generate(bare_name, prompt, history, opts)
            .await
            .map_err(|e| Self::wrap_err(provider.name(), e))
    }

    pub async fn stream(
        &self,
        model: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
        cancel: Option<CancelToken>,
    ) -> RouterResult<ChunkStream> {
        let provider_id = self.resolve(model).ok_or_else(|| RouterError::NoProvider(model.to_string()))?;
        let provider = self.get(&provider_id).ok_or_else(|| RouterError::NoProvider(model.to_string()))?;
        let bare_name = bare_model_name(model, provider_id.as_str());
        provider
            .stream(bare_name, prompt, history, opts, cancel)
            .await
            .map_err(|e| Self::wrap_err(provider.name(), e))
    }

    /// Union of every provider's `list_models()`, each annotated with its
    /// provider id. Best-effort: a failing provider is logged and skipped,
    /// not fatal to the whole call (spec §4.5).
    pub async fn list_all(&self) -> Vec<(ProviderId, ModelInfo)> {
        let snapshot: Vec<(ProviderId, Arc<dyn ModelProvider>)> = self
            .providers
            .read()
            .iter()
            .map(|(id, reg)| (id.clone(), reg.provider.clone()))
            .collect();

        let mut out = Vec::new();
        for (id, provider) in snapshot {
            match provider.list_models().await {
                Ok(models) => out.extend(models.into_iter().map(|m| (id.clone(), m))),
                Err(err) => {
                    tracing::warn!(provider = %id, error = %err, "list_models failed, skipping");
                }
            }
        }
        out
    }

    /// Re-run `list_models()` on every registered provider, refreshing the
    /// prefix-resolution cache.
    pub async fn refresh_mappings(&self) {
        let snapshot: Vec<(ProviderId, Arc<dyn ModelProvider>)> = self
            .providers
            .read()
            .iter()
            .map(|(id, reg)| (id.clone(), reg.provider.clone()))
            .collect();

        for (id, provider) in snapshot {
            if let Ok(models) = provider.list_models().await
                && let Some(reg) = self.providers.write().get_mut(&id) {
                    reg.known_models = models.into_iter().map(|m| m.name).collect();
                }
        }
    }

    pub fn registered_provider_ids(&self) -> Vec<ProviderId> {
        self.providers.read().keys().cloned().collect()
    }
}

/// Strip a `prefix:` that matches a registered provider id so the bare
/// model name reaches the provider, while an already-unprefixed name (or
/// one that came from the explicit map) passes through untouched.
fn bare_model_name<'a>(model: &'a str, provider_id: &str) -> &'a str {
    model
        .split_once(':')
        .filter(|(prefix, _)| *prefix == provider_id)
        .map(|(_, rest)| rest)
        .unwrap_or(model)
}
