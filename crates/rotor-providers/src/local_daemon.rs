//! HTTP-backed provider that proxies to a local model daemon (e.g. Ollama).
//!
//! Transparent by design: request/response bodies are passed through
//! untouched wherever the daemon's own JSON shape is sufficient, matching
//! the forward-compatible proxy style of an OpenAI-compatible gateway
//! backend.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use rotor_kernel::{
    CancelToken, ChatMessage, ChunkStream, GenerateOptions, ModelInfo, ModelProvider,
    ProviderError, ProviderHealth, ProviderResult, StreamChunk,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// Proxies rotation-core calls to a local HTTP inference daemon speaking an
/// Ollama-style REST API (`/api/tags`, `/api/generate`).
///
/// Unload has no real verb on this class of daemon (spec §9 design note):
/// [`LocalDaemonProvider::unload`] is an intentional idempotent no-op.
pub struct LocalDaemonProvider {
    name: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl LocalDaemonProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build reqwest client");
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ModelProvider for LocalDaemonProvider {
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

    #[instrument(skip(self), fields(provider = %self.name))]
    async fn health_check(&self) -> ProviderResult<ProviderHealth> {
        match self.client.get(self.url("/api/tags")).send().await {
            Ok(resp) if resp.status().is_success() => Ok(ProviderHealth::Healthy),
            Ok(resp) => Ok(ProviderHealth::Degraded(format!("status {}", resp.status()))),
            Err(e) => Ok(ProviderHealth::Unhealthy(e.to_string())),
        }
    }

    async fn list_models(&self) -> ProviderResult<Vec<ModelInfo>> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let parsed: TagsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::GenerationFailed(format!("malformed tags response: {e}")))?;
        Ok(parsed
            .models
            .into_iter()
            .map(|m| {
                let mut metadata = HashMap::new();
                metadata.insert("size".to_string(), serde_json::json!(m.size));
                ModelInfo {
                    name: m.name,
                    capabilities: vec!["generate".to_string(), "stream".to_string()],
                    metadata,
                }
            })
            .collect())
    }

    async fn exists(&self, name: &str) -> ProviderResult<bool> {
        Ok(self.list_models().await?.iter().any(|m| m.name == name))
    }

    /// Ollama loads a model lazily on first `/api/generate` call; we issue a
    /// minimal empty-prompt request to force residency and report `0` for
    /// the memory estimate since the daemon doesn't expose one up front.
    #[instrument(skip(self), fields(provider = %self.name, model = %name))]
    async fn load(&self, name: &str) -> ProviderResult<u64> {
        debug!("priming model residency");
        let body = serde_json::json!({ "model": name, "prompt": "", "stream": false });
        self.client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::LoadFailed(e.to_string()))?;
        Ok(0)
    }

    /// Ollama has no unload verb; this is an idempotent no-op by design.
    async fn unload(&self, _name: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn generate(
        &self,
        name: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> ProviderResult<String> {
        let full_prompt = render_prompt(prompt, history);
        let body = serde_json::json!({
            "model": name,
            "prompt": full_prompt,
            "stream": false,
            "options": {
                "temperature": opts.temperature,
                "num_predict": opts.max_tokens,
                "top_p": opts.top_p,
            },
        });
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::GenerationFailed(e.to_string()))?;
        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::GenerationFailed(format!("malformed generate response: {e}")))?;
        Ok(parsed.response)
    }

    async fn stream(
        &self,
        name: &str,
        prompt: &str,
        history: &[ChatMessage],
        opts: &GenerateOptions,
        cancel: Option<CancelToken>,
    ) -> ProviderResult<ChunkStream> {
        let full_prompt = render_prompt(prompt, history);
        let body = serde_json::json!({
            "model": name,
            "prompt": full_prompt,
            "stream": true,
            "options": {
                "temperature": opts.temperature,
                "num_predict": opts.max_tokens,
                "top_p": opts.top_p,
            },
        });
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::GenerationFailed(e.to_string()))?;

        let byte_stream = resp.bytes_stream();
        let chunks = byte_stream.flat_map(move |chunk_result| {
            let cancelled = cancel.as_ref().is_some_and(CancelToken::is_cancelled);
            let items: Vec<ProviderResult<StreamChunk>> = match chunk_result {
                _ if cancelled => vec![],
                Ok(bytes) => bytes
                    .split(|b| *b == b'\n')
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| serde_json::from_slice::<NdjsonChunk>(line).ok())
                    .map(|c| {
                        Ok(StreamChunk {
                            text: c.response,
                            done: c.done,
                        })
                    })
                    .collect(),
                Err(e) => vec![Err(ProviderError::GenerationFailed(e.to_string()))],
            };
            futures::stream::iter(items)
        });
        Ok(Box::pin(chunks))
    }
}

#[derive(Debug, Deserialize)]
struct NdjsonChunk {
    response: String,
    #[serde(default)]
    done: bool,
}

fn render_prompt(prompt: &str, history: &[ChatMessage]) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::new();
    for msg in history {
        out.push_str(&msg.role);
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push('\n');
    }
    out.push_str("user: ");
    out.push_str(prompt);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prompt_with_empty_history_passes_through() {
        assert_eq!(render_prompt("hi", &[]), "hi");
    }

    #[test]
    fn render_prompt_prefixes_conversation_turns() {
        let history = vec![ChatMessage {
            role: "assistant".to_string(),
            content: "hello".to_string(),
        }];
        let rendered = render_prompt("hi", &history);
        assert!(rendered.contains("assistant: hello"));
        assert!(rendered.ends_with("user: hi"));
    }

    #[test]
    fn provider_name_and_prefix_match_constructor_arg() {
        let p = LocalDaemonProvider::new("ollama", "http://localhost:11434");
        assert_eq!(p.name(), "ollama");
        assert_eq!(p.prefix(), "ollama");
    }
}
