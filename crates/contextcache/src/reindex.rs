// crates/contextcache/src/reindex.rs
// Background reindex worker (spec 4.10 step 7): "Post-commit, enqueue an
// asynchronous reindex memory task whose only job is to recompute the
// embedding when the worker toggle is on (idempotent; updates in place).
// When the worker is off, the inline computation already done is
// authoritative." The write pipeline (db::write_memory) always computes the
// embedding inline; this worker exists for the case where an operator wants
// a separate, retryable recompute path (e.g. after rotating
// EMBEDDING_PROVIDER) without touching every row synchronously.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::db::store;
use crate::db::DatabasePool;
use crate::embeddings::EmbeddingProvider;
use crate::sfc::{hilbert_index, SfcParams};

const QUEUE_CAPACITY: usize = 1024;

/// Handle to the reindex worker. Cheap to clone; `enqueue` is a no-op when
/// the worker was never spawned (`REINDEX_WORKER_ENABLED=false`, the
/// default).
#[derive(Clone)]
pub struct ReindexHandle {
    sender: Option<mpsc::Sender<i64>>,
}

impl ReindexHandle {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Spawns the worker loop and returns a handle to it.
    pub fn spawn(pool: Arc<DatabasePool>, embeddings: Arc<EmbeddingProvider>, sfc_params: SfcParams) -> Self {
        let (sender, mut receiver) = mpsc::channel::<i64>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(memory_id) = receiver.recv().await {
                if let Err(err) = reindex_one(&pool, &embeddings, sfc_params, memory_id).await {
                    tracing::warn!(memory_id, error = %err, "reindex task failed; leaving existing embedding in place");
                }
            }
        });
        Self { sender: Some(sender) }
    }

    /// Best-effort enqueue (spec 4.10 step 7: never blocks the write
    /// response). Drops the task with a warning if the queue is full or the
    /// worker was never spawned.
    pub fn enqueue(&self, memory_id: i64) {
        let Some(sender) = &self.sender else { return };
        if sender.try_send(memory_id).is_err() {
            tracing::warn!(memory_id, "reindex queue full or closed, dropping task");
        }
    }
}

async fn reindex_one(
    pool: &DatabasePool,
    embeddings: &EmbeddingProvider,
    sfc_params: SfcParams,
    memory_id: i64,
) -> anyhow::Result<()> {
    let Some(memory) = pool.interact(move |conn| Ok(store::get_memory_by_id(conn, memory_id)?)).await? else {
        return Ok(());
    };

    let embed_input = match &memory.title {
        Some(title) if !title.is_empty() => format!("{title}\n{}", memory.content),
        _ => memory.content.clone(),
    };
    let embedding = embeddings.embed(&embed_input).await;
    let hilbert = hilbert_index(&embedding, sfc_params);

    pool.interact(move |conn| {
        store::update_memory_embedding(conn, memory_id, &embedding, hilbert)?;
        Ok(())
    })
    .await
}
