// crates/contextcache/src/embeddings/openai.rs
// OpenAI embeddings remote backend (spec 4.1).

use serde::Deserialize;
use std::time::Duration;

const API_URL: &str = "https://api.openai.com/v1/embeddings";

pub struct OpenAiBackend {
    api_key: String,
    model: String,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbeddingResponseRow {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingResponseRow>,
}

impl OpenAiBackend {
    pub fn new(api_key: String, model: String, timeout_seconds: u64) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key,
            model,
            http_client,
        }
    }

    /// POST the request; any failure (timeout, non-2xx, malformed JSON, wrong
    /// length) is surfaced to the caller, which falls back to the local
    /// deterministic backend rather than failing the embed() call (spec 4.1).
    pub async fn embed_raw(&self, text: &str, dims: usize) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .http_client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI embeddings API error {status}: {text}");
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let row = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("OpenAI embeddings response had no rows"))?;

        if row.embedding.len() != dims {
            anyhow::bail!(
                "OpenAI embedding length {} did not match configured dims {}",
                row.embedding.len(),
                dims
            );
        }

        Ok(row.embedding)
    }
}
