//! The provider capability contract (spec §4.5).
//!
//! A provider is any back-end capable of loading/unloading named models and
//! running generation against whichever one is currently resident. The
//! [`Router`](crate) and [`Orchestrator`] never inspect a provider's
//! internals — they only call through this trait.

use crate::error::ProviderResult;
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A single turn in the conversation history passed to `generate`/`stream`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Generation parameters common across providers. Providers that don't
/// support a given knob ignore it rather than erroring.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// One chunk of a streaming generation response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub text: String,
    pub done: bool,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderResult<StreamChunk>> + Send>>;

/// Cooperative cancellation signal for a streaming call (spec §5).
///
/// Cloning shares the same underlying flag; cancelling from any clone stops
/// the Router from yielding further chunks, and is forwarded to the
/// provider if it checks the token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Description of one model as reported by a provider's `list_models`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

/// Last-known health of a provider, mirrored into status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ProviderHealth {
    Healthy,
    Degraded(String),
    Unhealthy(String),
    #[default]
    Unknown,
}

/// The capability set every back-end must expose (spec §4.5).
///
/// Implementers are free to realize this however they want — in-process
/// inference, RPC to a local daemon, etc. — the Router does not care.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Short stable name, e.g. `"daemon"`.
    fn name(&self) -> &str;

    /// Prefix used for `prefix:name` model-string detection (spec §3).
    fn prefix(&self) -> &str;

    async fn initialize(&self) -> ProviderResult<()>;

    async fn shutdown(&self) -> ProviderResult<()>;

    async fn health_check(&self) -> ProviderResult<ProviderHealth>;

    /// All models currently known to this provider (resident or not).
    async fn list_models(&self) -> ProviderResult<Vec<ModelInfo>>;

    async fn exists(&self, name: &str) -> ProviderResult<bool>;

    /// Load `name` into memory. Idempotent: a no-op if already loaded.
    async fn load(&self, name: &str) -> ProviderResult<u64>;

    /// Unload `name`. Idempotent and may be a no-op for providers that have
    /// no real "unload" verb (spec §9 design note) — correct and intentional.
    async fn unload(&self, name: &str) -> ProviderResult<()>;

    async fn generate(
        &self,
        name: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> ProviderResult<String>;

    /// Stream a generation. `cancel`, if provided, is checked cooperatively;
    /// providers that can't cancel mid-flight still honor it between chunks.
    async fn stream(
        &self,
        name: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
        cancel: Option<CancelToken>,
    ) -> ProviderResult<ChunkStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_shares_state_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn default_provider_health_is_unknown() {
        assert_eq!(ProviderHealth::default(), ProviderHealth::Unknown);
    }
}
