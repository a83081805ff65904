//! External model collaborators: LLM completion and embedding clients.
//!
//! Transports are out of scope; the pipeline only sees these traits. The
//! registry is built once per run and injected into every phase executor;
//! there is no global client table.

pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

/// A chat-completion transport. Implementations must classify provider
/// failures into the [`LlmError`] taxonomy; the retry layer keys off it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, LlmError>;
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingBatch {
    pub embeddings: Vec<Vec<f32>>,
    pub cost: Option<f64>,
    pub total_tokens: Option<u64>,
}

/// A batch embedding transport producing fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    fn model_id(&self) -> &str;

    /// Local embedders run on this machine; callers may batch more
    /// aggressively against them.
    fn is_local(&self) -> bool {
        false
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<EmbeddingBatch, LlmError>;

    async fn embed_one(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, LlmError> {
        let texts = [text.to_string()];
        let batch = self.embed(&texts, cancel).await?;
        batch
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("empty embedding batch".into()))
    }
}

/// Per-run registry of model clients, owned by the orchestrator and
/// injected into each phase executor.
pub struct ClientRegistry {
    generators: HashMap<String, Arc<dyn LlmClient>>,
    judges: HashMap<String, Arc<dyn LlmClient>>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl ClientRegistry {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            generators: HashMap::new(),
            judges: HashMap::new(),
            embedder,
        }
    }

    pub fn register_generator(&mut self, client: Arc<dyn LlmClient>) {
        self.generators.insert(client.model_id().to_string(), client);
    }

    pub fn register_judge(&mut self, client: Arc<dyn LlmClient>) {
        self.judges.insert(client.model_id().to_string(), client);
    }

    pub fn generator(&self, model_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.generators.get(model_id).cloned()
    }

    pub fn judge(&self, model_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.judges.get(model_id).cloned()
    }

    pub fn judge_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.judges.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingClient> {
        self.embedder.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[tokio::test]
    async fn test_mock_llm_counts_calls() {
        let llm = MockLlm::fixed("m1", "hello");
        let cancel = CancellationToken::new();
        let req = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        llm.complete(req.clone(), &cancel).await.unwrap();
        llm.complete(req, &cancel).await.unwrap();
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_embed_one_defaults_to_batch() {
        let embedder = MockEmbedder::new(8);
        embedder.pin("target", vec![1.0; 8]);
        let cancel = CancellationToken::new();
        let v = embedder.embed_one("target", &cancel).await.unwrap();
        assert_eq!(v, vec![1.0; 8]);
    }

    #[test]
    fn test_registry_lookup() {
        let embedder = MockEmbedder::new(4);
        let mut registry = ClientRegistry::new(embedder);
        registry.register_generator(MockLlm::fixed("gen-1", "s"));
        registry.register_judge(MockLlm::fixed("judge-1", "s"));

        assert!(registry.generator("gen-1").is_some());
        assert!(registry.generator("judge-1").is_none());
        assert!(registry.judge("judge-1").is_some());
        assert_eq!(registry.judge_ids(), vec!["judge-1".to_string()]);
    }
}
