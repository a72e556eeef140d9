//! A deterministic in-memory provider for exercising rotor-core without a
//! real daemon or hardware-detected backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use rotor_kernel::{
    CancelToken, ChatMessage, ChunkStream, GenerateOptions, ModelInfo, ModelProvider,
    ProviderError, ProviderHealth, ProviderResult, StreamChunk,
};
use std::collections::HashSet;

/// Tracks loaded models in a `HashSet` and echoes the prompt back on
/// `generate`; fails `generate`/`stream` for a model that isn't loaded.
pub struct MockProvider {
    name: String,
    known_models: Vec<String>,
    loaded: Mutex<HashSet<String>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, known_models: Vec<String>) -> Self {
        Self {
            name: name.into(),
            known_models,
            loaded: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.name
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
            .known_models
            .iter()
            .map(|name| ModelInfo {
                name: name.clone(),
                capabilities: vec!["generate".to_string()],
                metadata: Default::default(),
            })
            .collect())
    }

    async fn exists(&self, name: &str) -> ProviderResult<bool> {
        Ok(self.known_models.iter().any(|m| m == name))
    }

    async fn load(&self, name: &str) -> ProviderResult<u64> {
        if !self.known_models.iter().any(|m| m == name) {
            return Err(ProviderError::ModelNotFound(name.to_string()));
        }
        self.loaded.lock().insert(name.to_string());
        Ok(0)
    }

    async fn unload(&self, name: &str) -> ProviderResult<()> {
        self.loaded.lock().remove(name);
        Ok(())
    }

    async fn generate(
        &self,
        name: &str,
        prompt: &str,
        _history: &[ChatMessage],
        _opts: &GenerateOptions,
    ) -> ProviderResult<String> {
        if !self.loaded.lock().contains(name) {
            return Err(ProviderError::GenerationFailed(format!("{name} is not loaded")));
        }
        Ok(format!("mock response to: {prompt}"))
    }

    async fn stream(
        &self,
        name: &str,
        prompt: &str,
        _history: &[ChatMessage],
        _opts: &GenerateOptions,
        _cancel: Option<CancelToken>,
    ) -> ProviderResult<ChunkStream> {
        if !self.loaded.lock().contains(name) {
            return Err(ProviderError::GenerationFailed(format!("{name} is not loaded")));
        }
        let chunks = vec![
            Ok(StreamChunk {
                text: format!("mock response to: {prompt}"),
                done: false,
            }),
            Ok(StreamChunk {
                text: String::new(),
                done: true,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_fails_until_loaded() {
        let p = MockProvider::new("mock", vec!["m".to_string()]);
        assert!(p.generate("m", "hi", &[], &GenerateOptions::default()).await.is_err());
        p.load("m").await.unwrap();
        let out = p.generate("m", "hi", &[], &GenerateOptions::default()).await.unwrap();
        assert_eq!(out, "mock response to: hi");
    }

    #[tokio::test]
    async fn load_unknown_model_fails() {
        let p = MockProvider::new("mock", vec![]);
        assert!(p.load("nope").await.is_err());
    }
}
