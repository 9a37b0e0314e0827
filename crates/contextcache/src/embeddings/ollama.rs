// crates/contextcache/src/embeddings/ollama.rs
// Ollama embeddings remote backend (spec 4.1).

use serde::Deserialize;
use std::time::Duration;

pub struct OllamaBackend {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaBackend {
    pub fn new(base_url: String, model: String, timeout_seconds: u64) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            model,
            http_client,
        }
    }

    pub async fn embed_raw(&self, text: &str, dims: usize) -> anyhow::Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self.http_client.post(url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama embeddings API error {status}: {text}");
        }

        let parsed: OllamaEmbeddingResponse = response.json().await?;
        if parsed.embedding.len() != dims {
            anyhow::bail!(
                "Ollama embedding length {} did not match configured dims {}",
                parsed.embedding.len(),
                dims
            );
        }

        Ok(parsed.embedding)
    }
}
