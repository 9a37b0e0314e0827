// crates/contextcache/src/db/store.rs
// Synchronous SQL operations run inside `DatabasePool::interact`/`run`
// closures (spec 4.4 "Memory Store", plus Inbox/RawCapture/RecallLog/
// RecallTiming/UsageCounter persistence named in §3/§6).

use chrono::{DateTime, NaiveDate, Utc};
use contextcache_types::{InboxItem, InboxStatus, Memory, MemorySource, MemoryType};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

use crate::error::ContextCacheError;

fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_memory(row: &Row) -> rusqlite::Result<Memory> {
    let memory_type_str: String = row.get("memory_type")?;
    let source_str: String = row.get("source")?;
    let metadata_json: String = row.get("metadata")?;
    let embedding: Option<Vec<u8>> = row.get("embedding_vector")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Memory {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        created_by_user_id: row.get("created_by_user_id")?,
        memory_type: MemoryType::parse(&memory_type_str).unwrap_or(MemoryType::Note),
        source: MemorySource::parse(&source_str).unwrap_or(MemorySource::Manual),
        title: row.get("title")?,
        content: row.get("content")?,
        metadata: serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&metadata_json).unwrap_or_default(),
        content_hash: row.get("content_hash")?,
        has_embedding: embedding.is_some(),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Fields needed to insert a new memory row; hash/embedding/hilbert are
/// already computed by the write pipeline before this is called (spec 4.10
/// steps 2-4 happen upstream of the store).
pub struct NewMemory {
    pub project_id: i64,
    pub created_by_user_id: i64,
    pub memory_type: MemoryType,
    pub source: MemorySource,
    pub title: Option<String>,
    pub content: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
    pub hilbert_index: Option<i64>,
}

/// `create_memory`: on `(project_id, content_hash)` collision, returns the
/// existing row unchanged and `is_new=false` (spec 4.4, 4.10 step 2).
pub fn create_memory(conn: &Connection, fields: NewMemory) -> Result<(Memory, bool), ContextCacheError> {
    if let Some(existing) = find_by_content_hash(conn, fields.project_id, &fields.content_hash)? {
        return Ok((existing, false));
    }

    let now = format_timestamp(Utc::now());
    let metadata_json = serde_json::to_string(&fields.metadata)?;
    let embedding_bytes = fields.embedding.as_deref().map(encode_vector);

    let result = conn.execute(
        "INSERT INTO memories
            (project_id, created_by_user_id, memory_type, source, title, content, metadata,
             content_hash, embedding_vector, hilbert_index, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            fields.project_id,
            fields.created_by_user_id,
            fields.memory_type.as_str(),
            fields.source.as_str(),
            fields.title,
            fields.content,
            metadata_json,
            fields.content_hash,
            embedding_bytes,
            fields.hilbert_index,
            now,
        ],
    );

    match result {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            let memory = get_memory_by_id(conn, id)?
                .ok_or_else(|| ContextCacheError::Internal("memory vanished immediately after insert".into()))?;
            Ok((memory, true))
        }
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ffi::ErrorCode::ConstraintViolation => {
            // Lost a race against a concurrent insert of the same content; the
            // row now exists, return it (spec 4.4 dedup semantics).
            let existing = find_by_content_hash(conn, fields.project_id, &fields.content_hash)?
                .ok_or_else(|| ContextCacheError::Internal("constraint violation but no existing row found".into()))?;
            Ok((existing, false))
        }
        Err(e) => Err(e.into()),
    }
}

fn find_by_content_hash(conn: &Connection, project_id: i64, content_hash: &str) -> rusqlite::Result<Option<Memory>> {
    conn.query_row(
        "SELECT * FROM memories WHERE project_id = ?1 AND content_hash = ?2",
        params![project_id, content_hash],
        row_to_memory,
    )
    .optional()
}

pub fn get_memory_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Memory>> {
    conn.query_row("SELECT * FROM memories WHERE id = ?1", params![id], row_to_memory)
        .optional()
}

/// Preserves the order of `ids` in the output, per spec 4.4.
pub fn get_memories_by_ids(conn: &Connection, ids: &[i64]) -> rusqlite::Result<Vec<Memory>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 1)).collect();
    let sql = format!("SELECT * FROM memories WHERE id IN ({})", placeholders.join(","));
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    let by_id: std::collections::HashMap<i64, Memory> = stmt
        .query_map(params.as_slice(), row_to_memory)?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|m| (m.id, m))
        .collect();
    Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
}

/// `lexical_candidates`: FTS5 `bm25()` is negative-is-better; negate it so a
/// higher returned score means a stronger match, ready for the ranker's
/// normalize-by-max step (spec 4.7 step 2).
pub fn lexical_candidates(
    conn: &Connection,
    project_id: i64,
    query: &str,
    limit: usize,
) -> rusqlite::Result<Vec<(i64, f64, DateTime<Utc>)>> {
    let sanitized = sanitize_fts_query(query);
    if sanitized.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT m.id, -bm25(memories_fts, 5.0, 1.0) AS score, m.created_at
         FROM memories_fts
         JOIN memories m ON m.id = memories_fts.rowid
         WHERE memories_fts MATCH ?1 AND m.project_id = ?2
         ORDER BY score DESC, m.created_at DESC, m.id DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![sanitized, project_id, limit as i64], |row| {
        let id: i64 = row.get(0)?;
        let score: f64 = row.get(1)?;
        let created_at: String = row.get(2)?;
        Ok((id, score, parse_timestamp(&created_at)))
    })?;
    rows.collect()
}

/// FTS5 MATCH syntax treats most punctuation as operators; quote each token
/// so arbitrary user query text can't break the query or inject FTS5
/// directives.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|tok| format!("\"{}\"", tok.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// `vector_candidates`: ascending cosine distance (score = 1 - distance),
/// rows with `score < min_score` excluded, Hilbert-window prefilter applied
/// first when `hilbert_window` is given (spec 4.4, 4.6).
pub fn vector_candidates(
    conn: &Connection,
    project_id: i64,
    query_vec: &[f32],
    limit: usize,
    min_score: f64,
    hilbert_window: Option<(i64, i64)>,
) -> rusqlite::Result<Vec<(i64, f64, DateTime<Utc>)>> {
    let mut sql = "SELECT id, embedding_vector, created_at FROM memories
                    WHERE project_id = ?1 AND embedding_vector IS NOT NULL"
        .to_string();
    if hilbert_window.is_some() {
        sql.push_str(" AND hilbert_index BETWEEN ?2 AND ?3");
    }

    let mut stmt = conn.prepare(&sql)?;
    let candidates: Vec<(i64, Vec<u8>, String)> = if let Some((lo, hi)) = hilbert_window {
        stmt.query_map(params![project_id, lo, hi], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![project_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut scored: Vec<(i64, f64, DateTime<Utc>)> = candidates
        .into_iter()
        .map(|(id, blob, created_at)| {
            let vec = decode_vector(&blob);
            let score = 1.0 - cosine_distance(query_vec, &vec);
            (id, score, parse_timestamp(&created_at))
        })
        .filter(|(_, score, _)| *score >= min_score)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Most recent memories by `(created_at desc, id desc)` (spec 4.4, 4.9 step 2).
pub fn recency_fallback(conn: &Connection, project_id: i64, limit: usize) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM memories WHERE project_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![project_id, limit as i64], row_to_memory)?;
    rows.collect()
}

/// `GET /projects/{id}/memories`: latest first, paginated (spec 6 "List memories").
pub fn list_memories(conn: &Connection, project_id: i64, limit: usize, offset: usize) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM memories WHERE project_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(params![project_id, limit as i64, offset as i64], row_to_memory)?;
    rows.collect()
}

/// Updates the embedding + Hilbert index in place (spec 4.10 step 7, the
/// idempotent reindex task). Leaves every other column untouched.
pub fn update_memory_embedding(conn: &Connection, id: i64, embedding: &[f32], hilbert_index: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE memories SET embedding_vector = ?2, hilbert_index = ?3, updated_at = ?4 WHERE id = ?1",
        params![id, encode_vector(embedding), hilbert_index, format_timestamp(Utc::now())],
    )?;
    Ok(())
}

/// Count of embedded memories whose Hilbert index falls in `[lo, hi]`, used
/// by the adaptive Hilbert-window widening loop (spec 4.6).
pub fn count_in_hilbert_window(conn: &Connection, project_id: i64, lo: i64, hi: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories
         WHERE project_id = ?1 AND embedding_vector IS NOT NULL AND hilbert_index BETWEEN ?2 AND ?3",
        params![project_id, lo, hi],
        |row| row.get(0),
    )
}

/// Adaptive Hilbert-window widening (spec 4.6): start at radius `radius0`
/// around `center`, multiply by `widen_mult` until the candidate pool holds
/// at least `min_rows` or `max_radius` is reached, whichever comes first.
/// Runs entirely inside one connection borrow so the widening loop costs no
/// extra round trips to the pool.
pub fn resolve_hilbert_window(
    conn: &Connection,
    project_id: i64,
    center: i64,
    radius0: i64,
    widen_mult: f64,
    min_rows: usize,
    max_radius: i64,
) -> rusqlite::Result<(i64, i64)> {
    let mut radius = radius0.max(1);
    loop {
        let lo = center.saturating_sub(radius);
        let hi = center.saturating_add(radius);
        let count = count_in_hilbert_window(conn, project_id, lo, hi)?;
        if count as usize >= min_rows || radius >= max_radius {
            return Ok((lo, hi));
        }
        let widened = ((radius as f64) * widen_mult).round() as i64;
        radius = widened.max(radius + 1).min(max_radius);
    }
}

/// The project's owning org, used by request handlers for the cross-tenant
/// check (spec 6, 7 "Auth": 403 on cross-tenant access).
pub fn get_project_org_id(conn: &Connection, project_id: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT org_id FROM projects WHERE id = ?1", params![project_id], |row| row.get(0))
        .optional()
}

/// Candidates for CAG warming (spec 4.8 "Warming"): most recently modified,
/// highest-type-priority memories with a computed embedding, across the
/// whole process (the cache is process-local, not project-scoped).
pub fn warm_candidates(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<(Memory, Vec<f32>)>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM memories WHERE embedding_vector IS NOT NULL ORDER BY created_at DESC LIMIT ?1",
    )?;
    let pool_size = (limit * 4).max(limit);
    let rows: Vec<(Memory, Vec<u8>)> = stmt
        .query_map(params![pool_size as i64], |row| {
            let memory = row_to_memory(row)?;
            let blob: Vec<u8> = row.get("embedding_vector")?;
            Ok((memory, blob))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut decoded: Vec<(Memory, Vec<f32>)> = rows.into_iter().map(|(m, b)| (m, decode_vector(&b))).collect();
    decoded.sort_by_key(|(m, _)| std::cmp::Reverse(m.memory_type.priority()));
    decoded.truncate(limit);
    Ok(decoded)
}

// ---------------------------------------------------------------------
// Inbox (spec §3 InboxItem, §6 "Inbox")
// ---------------------------------------------------------------------

fn row_to_inbox_item(row: &Row) -> rusqlite::Result<InboxItem> {
    let suggested_type: String = row.get("suggested_type")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(InboxItem {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        raw_capture_id: row.get("raw_capture_id")?,
        promoted_memory_id: row.get("promoted_memory_id")?,
        suggested_type: MemoryType::parse(&suggested_type).unwrap_or(MemoryType::Note),
        suggested_title: row.get("suggested_title")?,
        suggested_content: row.get("suggested_content")?,
        confidence_score: row.get("confidence_score")?,
        status: match status.as_str() {
            "approved" => InboxStatus::Approved,
            "rejected" => InboxStatus::Rejected,
            _ => InboxStatus::Pending,
        },
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

pub fn create_inbox_item(
    conn: &Connection,
    project_id: i64,
    raw_capture_id: Option<i64>,
    suggested_type: MemoryType,
    suggested_title: Option<String>,
    suggested_content: String,
    confidence_score: f64,
) -> rusqlite::Result<InboxItem> {
    let now = format_timestamp(Utc::now());
    conn.execute(
        "INSERT INTO inbox_items
            (project_id, raw_capture_id, suggested_type, suggested_title, suggested_content,
             confidence_score, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
        params![
            project_id,
            raw_capture_id,
            suggested_type.as_str(),
            suggested_title,
            suggested_content,
            confidence_score,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row("SELECT * FROM inbox_items WHERE id = ?1", params![id], row_to_inbox_item)
}

pub fn get_inbox_item(conn: &Connection, id: i64) -> rusqlite::Result<Option<InboxItem>> {
    conn.query_row("SELECT * FROM inbox_items WHERE id = ?1", params![id], row_to_inbox_item)
        .optional()
}

pub fn list_inbox_items(
    conn: &Connection,
    project_id: i64,
    status: Option<InboxStatus>,
    limit: usize,
    offset: usize,
) -> rusqlite::Result<Vec<InboxItem>> {
    let status_str = status.map(|s| match s {
        InboxStatus::Pending => "pending",
        InboxStatus::Approved => "approved",
        InboxStatus::Rejected => "rejected",
    });
    let mut stmt = if status_str.is_some() {
        conn.prepare(
            "SELECT * FROM inbox_items WHERE project_id = ?1 AND status = ?2
             ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4",
        )?
    } else {
        conn.prepare(
            "SELECT * FROM inbox_items WHERE project_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?
    };
    let rows = if let Some(s) = status_str {
        stmt.query_map(params![project_id, s, limit as i64, offset as i64], row_to_inbox_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![project_id, limit as i64, offset as i64], row_to_inbox_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(rows)
}

pub fn mark_inbox_item_rejected(conn: &Connection, id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE inbox_items SET status = 'rejected', updated_at = ?2 WHERE id = ?1",
        params![id, format_timestamp(Utc::now())],
    )?;
    Ok(())
}

pub fn mark_inbox_item_approved(conn: &Connection, id: i64, promoted_memory_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE inbox_items SET status = 'approved', promoted_memory_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, promoted_memory_id, format_timestamp(Utc::now())],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------
// Raw captures (spec §6 "Ingest")
// ---------------------------------------------------------------------

pub fn create_raw_capture(conn: &Connection, project_id: i64, source: &str, payload: &serde_json::Value) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO raw_captures (project_id, source, payload, status, created_at)
         VALUES (?1, ?2, ?3, 'queued', ?4)",
        params![project_id, source, payload.to_string(), format_timestamp(Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

// ---------------------------------------------------------------------
// Recall logs / timings (spec §3 RecallLog/RecallTiming)
// ---------------------------------------------------------------------

pub struct RecallLogEntry {
    pub org_id: i64,
    pub project_id: i64,
    pub actor_user_id: Option<i64>,
    pub strategy: String,
    pub query_text: String,
    pub input_memory_ids: Vec<i64>,
    pub ranked_memory_ids: Vec<i64>,
    pub weights: serde_json::Value,
    pub score_details: serde_json::Value,
}

pub fn insert_recall_log(conn: &Connection, entry: &RecallLogEntry) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO recall_logs
            (org_id, project_id, actor_user_id, strategy, query_text, input_memory_ids,
             ranked_memory_ids, weights, score_details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.org_id,
            entry.project_id,
            entry.actor_user_id,
            entry.strategy,
            entry.query_text,
            serde_json::to_string(&entry.input_memory_ids).unwrap_or_default(),
            serde_json::to_string(&entry.ranked_memory_ids).unwrap_or_default(),
            entry.weights.to_string(),
            entry.score_details.to_string(),
            format_timestamp(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub struct RecallTimingEntry {
    pub org_id: i64,
    pub project_id: i64,
    pub served_by: String,
    pub strategy: String,
    pub hedge_delay_ms: i64,
    pub cag_duration_ms: Option<i64>,
    pub rag_duration_ms: Option<i64>,
    pub total_duration_ms: i64,
}

pub fn insert_recall_timing(conn: &Connection, entry: &RecallTimingEntry) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO recall_timings
            (org_id, project_id, served_by, strategy, hedge_delay_ms, cag_duration_ms,
             rag_duration_ms, total_duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.org_id,
            entry.project_id,
            entry.served_by,
            entry.strategy,
            entry.hedge_delay_ms,
            entry.cag_duration_ms,
            entry.rag_duration_ms,
            entry.total_duration_ms,
            format_timestamp(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ---------------------------------------------------------------------
// Usage counters (spec §3 UsageCounter, durable read-model for /me/usage;
// enforcement itself happens in `gate::UsageGate`'s in-process counters —
// see DESIGN.md for the split rationale)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageCounterRow {
    pub memories_created: i64,
    pub recall_queries: i64,
    pub projects_created: i64,
}

pub fn get_usage_counter(conn: &Connection, user_id: i64, day: NaiveDate) -> rusqlite::Result<UsageCounterRow> {
    conn.query_row(
        "SELECT memories_created, recall_queries, projects_created FROM usage_counters
         WHERE user_id = ?1 AND day = ?2",
        params![user_id, day.to_string()],
        |row| {
            Ok(UsageCounterRow {
                memories_created: row.get(0)?,
                recall_queries: row.get(1)?,
                projects_created: row.get(2)?,
            })
        },
    )
    .optional()
    .map(|v| v.unwrap_or_default())
}

pub fn increment_usage_counter(conn: &Connection, user_id: i64, day: NaiveDate, field: &str) -> rusqlite::Result<()> {
    debug_assert!(matches!(field, "memories_created" | "recall_queries" | "projects_created"));
    let sql = format!(
        "INSERT INTO usage_counters (user_id, day, {field}) VALUES (?1, ?2, 1)
         ON CONFLICT(user_id, day) DO UPDATE SET {field} = {field} + 1"
    );
    conn.execute(&sql, params![user_id, day.to_string()])?;
    Ok(())
}

pub fn is_user_unlimited(conn: &Connection, user_id: i64) -> rusqlite::Result<bool> {
    conn.query_row("SELECT is_unlimited FROM users WHERE id = ?1", params![user_id], |row| {
        row.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.unwrap_or(0) != 0)
}
