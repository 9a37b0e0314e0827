// crates/contextcache/src/db/mod.rs
// Persistence layer: pooled SQLite connections (`pool`), schema/migrations
// (`schema`), and row-level operations (`store`), plus the Write Pipeline
// (spec 4.10) that ties hashing, embedding, and Hilbert indexing together
// atomically around a single `store::create_memory` call.

pub mod pool;
pub mod schema;
pub mod store;

use std::collections::BTreeMap;

use chrono::Utc;
use contextcache_types::{InboxStatus, Memory, MemoryEdits, MemorySource, MemoryType};

use crate::embeddings::EmbeddingProvider;
use crate::error::ContextCacheError;
use crate::hash::{canonicalize, content_hash};
use crate::sfc::{hilbert_index, SfcParams};

pub use pool::DatabasePool;

/// Extends pool construction with the embedding-dimension-aware `vec0`
/// mirror table, deferred from `schema::initialize_schema` until the
/// configured dims are known (see schema.rs module comment).
pub async fn ensure_vec_mirror(pool: &DatabasePool, dims: usize) -> anyhow::Result<()> {
    pool.interact(move |conn| {
        schema::ensure_vec_mirror_with_dims(conn, dims)?;
        Ok(())
    })
    .await
}

/// Input to the Write Pipeline (spec 4.10): validated fields ready for
/// hashing + embedding + persistence.
pub struct MemoryDraft {
    pub project_id: i64,
    pub created_by_user_id: i64,
    pub memory_type: MemoryType,
    pub source: MemorySource,
    pub title: Option<String>,
    pub content: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Runs spec 4.10 steps 2-5: canonicalize + hash (dedup short-circuit),
/// embed, compute the Hilbert index, persist atomically. Usage-counter
/// increment and reindex enqueue (steps 6-7) are the caller's
/// responsibility once the write is known to have succeeded, since they
/// touch the gate/dispatcher rather than the store itself.
pub async fn write_memory(
    pool: &DatabasePool,
    embeddings: &EmbeddingProvider,
    sfc_params: SfcParams,
    draft: MemoryDraft,
) -> Result<(Memory, bool), ContextCacheError> {
    let canonical = canonicalize(&draft.content);
    let hash = content_hash(&canonical);

    // Dedup short-circuit: skip the embedding call entirely if the content
    // already exists for this project (spec 4.10 step 2).
    if let Some(existing) = pool
        .run({
            let project_id = draft.project_id;
            let hash = hash.clone();
            move |conn| {
                conn.query_row(
                    "SELECT id FROM memories WHERE project_id = ?1 AND content_hash = ?2",
                    rusqlite::params![project_id, hash],
                    |row| row.get::<_, i64>(0),
                )
                .optional_into()
            }
        })
        .await?
    {
        let memory = pool
            .run(move |conn| store::get_memory_by_id(conn, existing))
            .await?
            .ok_or_else(|| ContextCacheError::Internal("dedup lookup found id but row vanished".into()))?;
        return Ok((memory, false));
    }

    let embed_input = match &draft.title {
        Some(t) if !t.is_empty() => format!("{t}\n{}", draft.content),
        _ => draft.content.clone(),
    };
    let embedding = embeddings.embed(&embed_input).await;
    let hilbert = hilbert_index(&embedding, sfc_params);

    let fields = store::NewMemory {
        project_id: draft.project_id,
        created_by_user_id: draft.created_by_user_id,
        memory_type: draft.memory_type,
        source: draft.source,
        title: draft.title,
        content: draft.content,
        metadata: draft.metadata,
        content_hash: hash,
        embedding: Some(embedding),
        hilbert_index: Some(hilbert),
    };

    pool.run_with_retry(move |conn| store::create_memory(conn, fields)).await
}

/// Promotes an inbox item into a memory, applying optional edits (spec 4.10
/// "Inbox promotion"), then marks the inbox item approved.
pub async fn approve_inbox_item(
    pool: &DatabasePool,
    embeddings: &EmbeddingProvider,
    sfc_params: SfcParams,
    inbox_id: i64,
    created_by_user_id: i64,
    edits: Option<MemoryEdits>,
) -> Result<Memory, ContextCacheError> {
    let item = pool
        .run(move |conn| store::get_inbox_item(conn, inbox_id))
        .await?
        .ok_or_else(|| ContextCacheError::NotFound(format!("inbox item {inbox_id}")))?;

    if item.status != InboxStatus::Pending {
        return Err(ContextCacheError::Conflict {
            existing_id: item.promoted_memory_id.unwrap_or(item.id),
        });
    }

    let memory_type = edits
        .as_ref()
        .and_then(|e| e.memory_type)
        .unwrap_or(item.suggested_type);
    let title = edits
        .as_ref()
        .and_then(|e| e.title.clone())
        .or(item.suggested_title.clone());
    let content = edits
        .and_then(|e| e.content)
        .unwrap_or(item.suggested_content.clone());

    let draft = MemoryDraft {
        project_id: item.project_id,
        created_by_user_id,
        memory_type,
        source: MemorySource::Ingestion,
        title,
        content,
        metadata: BTreeMap::new(),
    };

    let (memory, _is_new) = write_memory(pool, embeddings, sfc_params, draft).await?;

    let memory_id = memory.id;
    pool.run(move |conn| store::mark_inbox_item_approved(conn, inbox_id, memory_id))
        .await?;

    Ok(memory)
}

pub async fn reject_inbox_item(pool: &DatabasePool, inbox_id: i64) -> Result<(), ContextCacheError> {
    let item = pool
        .run(move |conn| store::get_inbox_item(conn, inbox_id))
        .await?
        .ok_or_else(|| ContextCacheError::NotFound(format!("inbox item {inbox_id}")))?;
    if item.status != InboxStatus::Pending {
        return Err(ContextCacheError::Conflict { existing_id: item.id });
    }
    pool.run(move |conn| store::mark_inbox_item_rejected(conn, inbox_id)).await
}

/// Small adapter so `rusqlite::Error::QueryReturnedNoRows` reads as `None`
/// without pulling `OptionalExtension` into every call site above.
trait OptionalInto<T> {
    fn optional_into(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalInto<T> for rusqlite::Result<T> {
    fn optional_into(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Records the completion of a write for usage accounting (spec 4.10 step
/// 6): increments both the durable `usage_counters` row and the gate's
/// in-process quota ledger stays separate (see DESIGN.md).
pub async fn record_memory_write_usage(pool: &DatabasePool, user_id: i64) -> anyhow::Result<()> {
    let day = Utc::now().date_naive();
    pool.interact(move |conn| {
        store::increment_usage_counter(conn, user_id, day, "memories_created")?;
        Ok(())
    })
    .await
}

pub async fn record_recall_usage(pool: &DatabasePool, user_id: i64) -> anyhow::Result<()> {
    let day = Utc::now().date_naive();
    pool.interact(move |conn| {
        store::increment_usage_counter(conn, user_id, day, "recall_queries")?;
        Ok(())
    })
    .await
}

pub async fn record_project_creation_usage(pool: &DatabasePool, user_id: i64) -> anyhow::Result<()> {
    let day = Utc::now().date_naive();
    pool.interact(move |conn| {
        store::increment_usage_counter(conn, user_id, day, "projects_created")?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingProvider;

    async fn seeded_pool() -> DatabasePool {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            conn.execute("INSERT INTO organizations (name) VALUES ('acme')", [])?;
            conn.execute("INSERT INTO users (org_id, email) VALUES (1, 'a@acme.test')", [])?;
            conn.execute(
                "INSERT INTO projects (org_id, name, created_by_user_id) VALUES (1, 'proj', 1)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        pool
    }

    fn test_provider() -> EmbeddingProvider {
        EmbeddingProvider::Local {
            model: "local-fallback".into(),
            dims: 16,
        }
    }

    #[tokio::test]
    async fn write_memory_dedups_across_calls() {
        let pool = seeded_pool().await;
        let provider = test_provider();
        let draft = || MemoryDraft {
            project_id: 1,
            created_by_user_id: 1,
            memory_type: MemoryType::Note,
            source: MemorySource::Manual,
            title: None,
            content: "remember this".into(),
            metadata: BTreeMap::new(),
        };
        let (m1, is_new1) = write_memory(&pool, &provider, SfcParams::default(), draft()).await.unwrap();
        let (m2, is_new2) = write_memory(&pool, &provider, SfcParams::default(), draft()).await.unwrap();
        assert!(is_new1);
        assert!(!is_new2);
        assert_eq!(m1.id, m2.id);
        assert!(m1.has_embedding);
    }

    #[tokio::test]
    async fn approve_inbox_item_promotes_with_edits() {
        let pool = seeded_pool().await;
        let provider = test_provider();
        let item = pool
            .interact(|conn| {
                Ok(store::create_inbox_item(
                    conn,
                    1,
                    None,
                    MemoryType::Todo,
                    Some("draft title".into()),
                    "draft content".into(),
                    0.9,
                )?)
            })
            .await
            .unwrap();

        let edits = MemoryEdits {
            memory_type: Some(MemoryType::Decision),
            title: Some("final title".into()),
            content: None,
        };
        let memory = approve_inbox_item(&pool, &provider, SfcParams::default(), item.id, 1, Some(edits))
            .await
            .unwrap();
        assert_eq!(memory.memory_type, MemoryType::Decision);
        assert_eq!(memory.title.as_deref(), Some("final title"));
        assert_eq!(memory.content, "draft content");

        let refetched = pool.interact(move |conn| Ok(store::get_inbox_item(conn, item.id)?)).await.unwrap().unwrap();
        assert_eq!(refetched.status, InboxStatus::Approved);
        assert_eq!(refetched.promoted_memory_id, Some(memory.id));
    }

    #[tokio::test]
    async fn reject_inbox_item_marks_rejected() {
        let pool = seeded_pool().await;
        let item = pool
            .interact(|conn| {
                Ok(store::create_inbox_item(conn, 1, None, MemoryType::Note, None, "content".into(), 0.5)?)
            })
            .await
            .unwrap();
        reject_inbox_item(&pool, item.id).await.unwrap();
        let refetched = pool.interact(move |conn| Ok(store::get_inbox_item(conn, item.id)?)).await.unwrap().unwrap();
        assert_eq!(refetched.status, InboxStatus::Rejected);
    }
}
