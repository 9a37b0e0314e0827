// crates/contextcache/src/embeddings/mod.rs
// Embedding provider module (spec 4.1).
//
// Contract: `embed(text, model, dims) -> vector<float, dims>`, L2-normalized.
// Remote backends (openai/ollama) fall back to the local deterministic
// backend on ANY failure — timeout, non-2xx, malformed JSON, wrong length —
// rather than surfacing an error to the caller. `Upstream` is deliberately
// not part of `ContextCacheError` (spec 4.1, 7).

mod local;
mod ollama;
mod openai;

pub use local::{embed_local, l2_normalize, resize_to_dims};

use crate::config::EmbeddingConfig;
use crate::config::env::EmbeddingProviderKind;
use ollama::OllamaBackend;
use openai::OpenAiBackend;
use tracing::warn;

/// Pluggable embedding provider selected at construction time. Runtime
/// dispatch is a small sum type rather than dynamic dispatch (spec 9:
/// "collapse to a single interface ... runtime polymorphism only through a
/// small set of sum-typed variants").
pub enum EmbeddingProvider {
    OpenAi {
        backend: OpenAiBackend,
        model: String,
        dims: usize,
    },
    Ollama {
        backend: OllamaBackend,
        model: String,
        dims: usize,
    },
    Local {
        model: String,
        dims: usize,
    },
}

impl EmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        match config.provider {
            EmbeddingProviderKind::OpenAi => {
                let Some(api_key) = config.openai_api_key.clone() else {
                    warn!("EMBEDDING_PROVIDER=openai but no API key configured; using local backend");
                    return EmbeddingProvider::Local {
                        model: "local-fallback".to_string(),
                        dims: config.dims,
                    };
                };
                EmbeddingProvider::OpenAi {
                    backend: OpenAiBackend::new(
                        api_key,
                        config.openai_model.clone(),
                        config.http_timeout_seconds,
                    ),
                    model: config.openai_model.clone(),
                    dims: config.dims,
                }
            }
            EmbeddingProviderKind::Ollama => EmbeddingProvider::Ollama {
                backend: OllamaBackend::new(
                    config.ollama_base_url.clone(),
                    config.ollama_model.clone(),
                    config.http_timeout_seconds,
                ),
                model: config.ollama_model.clone(),
                dims: config.dims,
            },
            EmbeddingProviderKind::Local => EmbeddingProvider::Local {
                model: "local-fallback".to_string(),
                dims: config.dims,
            },
        }
    }

    pub fn dims(&self) -> usize {
        match self {
            EmbeddingProvider::OpenAi { dims, .. } => *dims,
            EmbeddingProvider::Ollama { dims, .. } => *dims,
            EmbeddingProvider::Local { dims, .. } => *dims,
        }
    }

    fn model_name(&self) -> &str {
        match self {
            EmbeddingProvider::OpenAi { model, .. } => model,
            EmbeddingProvider::Ollama { model, .. } => model,
            EmbeddingProvider::Local { model, .. } => model,
        }
    }

    /// Embed `text`, L2-normalized, exactly `self.dims()` entries long. Empty
    /// or whitespace-only input always yields a zero vector, even on a
    /// remote backend, since the local fallback handles that case uniformly.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        if text.trim().is_empty() {
            return vec![0.0; self.dims()];
        }

        let dims = self.dims();
        let model = self.model_name().to_string();

        let remote_result = match self {
            EmbeddingProvider::OpenAi { backend, .. } => Some(backend.embed_raw(text, dims).await),
            EmbeddingProvider::Ollama { backend, .. } => Some(backend.embed_raw(text, dims).await),
            EmbeddingProvider::Local { .. } => None,
        };

        match remote_result {
            Some(Ok(mut vec)) => {
                vec = resize_to_dims(vec, dims);
                l2_normalize(&mut vec);
                vec
            }
            Some(Err(err)) => {
                warn!(error = %err, "embedding provider call failed; falling back to local deterministic backend");
                embed_local(text, &model, dims)
            }
            None => embed_local(text, &model, dims),
        }
    }
}
