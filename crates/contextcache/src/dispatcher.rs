// crates/contextcache/src/dispatcher.rs
// Recall Dispatcher (spec 4.9): gate -> empty-query fast path -> hedged race
// between the CAG cache probe and the full hybrid recall -> pack formatting
// -> best-effort logging. States: GATED -> DISPATCHED ->
// (CACHE_HIT|HYBRID_HIT|FALLBACK) -> LOGGED -> DONE.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use contextcache_types::{Memory, MemoryType, RecallItem, RecallResponse};

use crate::cag::CagCache;
use crate::config::env::HedgeConfig;
use crate::db::{store, DatabasePool};
use crate::embeddings::EmbeddingProvider;
use crate::error::ContextCacheError;
use crate::gate::{GateKind, QuotaKind, UsageGate};
use crate::ranking::{rank_hybrid, RankWeights, ScoreTrace};
use crate::sfc::{hilbert_index, SfcParams};

/// Fixed presentation order for the memory pack (spec 4.9 "Formatting");
/// types not listed appear afterwards in the ranker's own order.
const TYPE_ORDER: [MemoryType; 8] = [
    MemoryType::Decision,
    MemoryType::Definition,
    MemoryType::Finding,
    MemoryType::Todo,
    MemoryType::Code,
    MemoryType::Doc,
    MemoryType::Link,
    MemoryType::Note,
];

/// Per-org adaptive hedge delay tracking (spec 4.9 "Hedging"): a rolling
/// p95-style estimate of cache probe latency, clamped to
/// `[min_delay_ms, max_delay_ms]`, with a TTL so a slow period doesn't pin
/// the delay forever.
struct HedgeStat {
    delay_ms: u64,
    updated_at: std::time::Instant,
}

pub struct HedgeTracker {
    stats: Mutex<HashMap<i64, HedgeStat>>,
    config: HedgeConfig,
    ttl: StdDuration,
}

impl HedgeTracker {
    pub fn new(config: HedgeConfig, ttl_seconds: u64) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            config,
            ttl: StdDuration::from_secs(ttl_seconds),
        }
    }

    fn delay_for(&self, org_id: i64) -> StdDuration {
        let guard = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let ms = match guard.get(&org_id) {
            Some(stat) if stat.updated_at.elapsed() < self.ttl => stat.delay_ms,
            _ => self.config.default_delay_ms,
        };
        StdDuration::from_millis(ms.clamp(self.config.min_delay_ms, self.config.max_delay_ms))
    }

    fn record(&self, org_id: i64, observed_ms: u64) {
        let mut guard = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let clamped = observed_ms.clamp(self.config.min_delay_ms, self.config.max_delay_ms);
        guard.insert(
            org_id,
            HedgeStat {
                delay_ms: clamped,
                updated_at: std::time::Instant::now(),
            },
        );
    }
}

/// Adaptive Hilbert-window prefiltering parameters (spec 4.6), carried as a
/// single optional bundle so the vector retriever can skip the feature
/// entirely when `HILBERT_ENABLED` is off.
#[derive(Debug, Clone, Copy)]
pub struct HilbertSettings {
    pub sfc_params: SfcParams,
    pub radius0: i64,
    pub widen_mult: f64,
    pub min_rows: usize,
    pub max_radius: i64,
}

/// Everything the dispatcher needs, bundled so call sites don't thread six
/// separate arguments through (spec 9: handles over globals).
#[derive(Clone)]
pub struct RecallContext {
    pub pool: std::sync::Arc<DatabasePool>,
    pub embeddings: std::sync::Arc<EmbeddingProvider>,
    pub cag: CagCache,
    pub gate: UsageGate,
    pub hedge: std::sync::Arc<HedgeTracker>,
    pub ranking_weights: RankWeights,
    pub vector_min_score: f64,
    pub vector_candidates_limit: usize,
    pub hilbert: Option<HilbertSettings>,
    pub cag_enabled: bool,
}

pub struct RecallRequest {
    pub project_id: i64,
    pub org_id: i64,
    pub actor_user_id: Option<i64>,
    pub query: String,
    pub limit: usize,
    pub client_ip: String,
    pub account_key: String,
    pub is_unlimited: bool,
}

/// Outcome of `dispatch` before pack formatting — kept separate so tests can
/// assert on strategy/served_by without building a full response.
struct DispatchOutcome {
    strategy: &'static str,
    served_by: &'static str,
    memories: Vec<Memory>,
    trace: HashMap<i64, ScoreTrace>,
    hedge_delay_ms: u64,
    cag_duration_ms: Option<i64>,
    rag_duration_ms: Option<i64>,
    /// `(cache source key, query embedding)` set only when a fresh hybrid
    /// result should be promoted into the CAG cache (spec 4.8 "Membership").
    promote: Option<(String, Vec<f32>)>,
}

/// `GET /projects/{id}/recall` core logic (spec 4.9).
pub async fn dispatch(ctx: &RecallContext, req: RecallRequest) -> Result<RecallResponse, ContextCacheError> {
    // GATED
    ctx.gate
        .check_burst(
            GateKind::RecallPerIp,
            &req.client_ip,
            std::time::Instant::now(),
            req.is_unlimited,
        )
        .map_err(to_gate_error)?;
    ctx.gate
        .check_burst(
            GateKind::RecallPerAccount,
            &req.account_key,
            std::time::Instant::now(),
            req.is_unlimited,
        )
        .map_err(to_gate_error)?;
    if let Some(user_id) = req.actor_user_id {
        ctx.gate
            .check_quota(user_id, QuotaKind::Recall, crate::gate::today(Utc::now()), req.is_unlimited)
            .map_err(to_gate_error)?;
    }

    // DISPATCHED
    let outcome = if req.query.trim().is_empty() {
        fallback_outcome(ctx, req.project_id, req.limit).await?
    } else {
        hedged_recall(ctx, &req).await?
    };

    // Formatting. A cache hit's single synthetic memory already carries the
    // fully formatted pack text from the hybrid pass that promoted it
    // (see `cache_hit_outcome`); re-running `format_memory_pack` over it
    // would wrap an already-formatted pack inside another one.
    let memory_pack_text = if outcome.served_by == "cache" {
        outcome.memories.first().map(|m| m.content.clone()).unwrap_or_default()
    } else {
        format_memory_pack(&req.query, &outcome.memories)
    };

    // Promote a freshly computed hybrid answer into the CAG cache so a
    // semantically similar follow-up query can hit it (spec 4.8
    // "Membership"). Best-effort: cheap, CPU-bound under the cache's own
    // mutex, never on the critical path of the response.
    if let Some((source, embedding)) = outcome.promote.clone() {
        ctx.cag.promote(source, memory_pack_text.clone(), embedding, Utc::now());
    }

    let items = outcome
        .memories
        .iter()
        .map(|m| RecallItem {
            id: m.id,
            memory_type: m.memory_type,
            source: m.source,
            title: m.title.clone(),
            content: m.content.clone(),
            created_at: m.created_at,
            rank_score: outcome.trace.get(&m.id).map(|t| t.total),
        })
        .collect();

    // LOGGED (best-effort, non-blocking per spec 4.9)
    let project_id = req.project_id;
    let org_id = req.org_id;
    let actor_user_id = req.actor_user_id;
    let strategy = outcome.strategy.to_string();
    let query_text = req.query.clone();
    let ranked_ids: Vec<i64> = outcome.memories.iter().map(|m| m.id).collect();
    let weights_json = serde_json::json!({
        "fts": ctx.ranking_weights.fts,
        "vector": ctx.ranking_weights.vector,
        "recency": ctx.ranking_weights.recency,
    });
    let score_details_json = serde_json::to_value(&outcome.trace).unwrap_or(serde_json::Value::Null);
    let served_by = outcome.served_by.to_string();
    let hedge_delay_ms = outcome.hedge_delay_ms as i64;
    let cag_duration_ms = outcome.cag_duration_ms;
    let rag_duration_ms = outcome.rag_duration_ms;
    let total_duration_ms = cag_duration_ms.unwrap_or(0).max(rag_duration_ms.unwrap_or(0));

    let strategy_for_timing = strategy.clone();
    ctx.pool
        .try_interact_warn("recall_log", move |conn| {
            store::insert_recall_log(
                conn,
                &store::RecallLogEntry {
                    org_id,
                    project_id,
                    actor_user_id,
                    strategy,
                    query_text,
                    input_memory_ids: Vec::new(),
                    ranked_memory_ids: ranked_ids,
                    weights: weights_json,
                    score_details: score_details_json,
                },
            )
        })
        .await;
    ctx.pool
        .try_interact_warn("recall_timing", move |conn| {
            store::insert_recall_timing(
                conn,
                &store::RecallTimingEntry {
                    org_id,
                    project_id,
                    served_by,
                    strategy: strategy_for_timing,
                    hedge_delay_ms,
                    cag_duration_ms,
                    rag_duration_ms,
                    total_duration_ms,
                },
            )
        })
        .await;
    if let Some(user_id) = req.actor_user_id {
        if let Err(e) = crate::db::record_recall_usage(&ctx.pool, user_id).await {
            tracing::warn!(error = %e, "failed to record recall usage counter");
        }
    }

    // DONE
    Ok(RecallResponse {
        project_id: req.project_id,
        query: req.query,
        strategy: outcome.strategy.to_string(),
        served_by: outcome.served_by.to_string(),
        memory_pack_text,
        items,
    })
}

async fn fallback_outcome(ctx: &RecallContext, project_id: i64, limit: usize) -> Result<DispatchOutcome, ContextCacheError> {
    let memories = ctx.pool.run(move |conn| store::recency_fallback(conn, project_id, limit)).await?;
    Ok(DispatchOutcome {
        strategy: "recency_fallback",
        served_by: "fallback",
        memories,
        trace: HashMap::new(),
        hedge_delay_ms: 0,
        cag_duration_ms: None,
        rag_duration_ms: None,
        promote: None,
    })
}

/// Opaque CAG cache key for a project/query pair (spec 4.8 "Membership":
/// promoting a duplicate source updates the existing entry in place).
fn cache_source_key(project_id: i64, query: &str) -> String {
    format!("recall:{project_id}:{}", crate::hash::content_hash(&crate::hash::canonicalize(query)))
}

/// Races the CAG cache probe against the full hybrid recall, returning
/// whichever finishes first after the adaptive hedge delay elapses for the
/// slower path (spec 4.9 "Hedging"). Falls back to recency if both paths
/// error. When CAG is disabled (`CAG_ENABLED=false`), skips the probe/race
/// entirely and runs the hybrid path directly.
async fn hedged_recall(ctx: &RecallContext, req: &RecallRequest) -> Result<DispatchOutcome, ContextCacheError> {
    let query_embedding = ctx.embeddings.embed(&req.query).await;
    let promote_key = cache_source_key(req.project_id, &req.query);

    let spawn_hybrid = |query_embedding: Vec<f32>| {
        let hybrid_args = HybridArgs {
            pool: ctx.pool.clone(),
            project_id: req.project_id,
            query: req.query.clone(),
            query_embedding,
            limit: req.limit,
            weights: ctx.ranking_weights,
            vector_min_score: ctx.vector_min_score,
            vector_candidates_limit: ctx.vector_candidates_limit,
            hilbert: ctx.hilbert,
        };
        let hybrid_start = std::time::Instant::now();
        tokio::spawn(async move { (run_hybrid(hybrid_args).await, hybrid_start.elapsed()) })
    };

    if !ctx.cag_enabled {
        let (result, elapsed) = spawn_hybrid(query_embedding)
            .await
            .map_err(|e| ContextCacheError::Internal(format!("hybrid recall task panicked: {e}")))?;
        return result.map(|outcome| finish_hybrid(outcome, 0, None, elapsed, None));
    }

    let hedge_delay = ctx.hedge.delay_for(req.org_id);
    let hedge_delay_ms = hedge_delay.as_millis() as u64;

    let cag = ctx.cag.clone();
    let query_embedding_for_cache = query_embedding.clone();
    let cache_start = std::time::Instant::now();
    let mut cache_task = tokio::spawn(async move {
        let outcome = cag.probe(&query_embedding_for_cache, Utc::now());
        (outcome, cache_start.elapsed())
    });

    // Primary: wait for the cache probe, but only up to the hedge delay. If
    // it answers within that window, its result (hit or miss) decides
    // everything and the hybrid path never starts (spec 4.9 "Hedging").
    let raced = tokio::select! {
        biased;
        cache_result = &mut cache_task => Some(cache_result),
        _ = tokio::time::sleep(hedge_delay) => None,
    };

    if let Some(cache_result) = raced {
        let (outcome, elapsed) = cache_result.map_err(|e| ContextCacheError::Internal(format!("cache probe task panicked: {e}")))?;
        ctx.hedge.record(req.org_id, elapsed.as_millis() as u64);
        if let crate::cag::ProbeOutcome::Hit { content, .. } = outcome {
            return Ok(cache_hit_outcome(content, hedge_delay_ms, elapsed.as_millis() as i64));
        }
        let hybrid_task = spawn_hybrid(query_embedding.clone());
        let (result, rag_elapsed) = hybrid_task
            .await
            .map_err(|e| ContextCacheError::Internal(format!("hybrid recall task panicked: {e}")))?;
        return result.map(|outcome| {
            finish_hybrid(outcome, hedge_delay_ms, Some(elapsed.as_millis() as i64), rag_elapsed, Some((promote_key, query_embedding)))
        });
    }

    // Hedge delay elapsed before the cache answered: start the hybrid path
    // concurrently and take whichever of the two finishes first.
    let hybrid_task = spawn_hybrid(query_embedding.clone());
    tokio::select! {
        cache_result = cache_task => {
            let (outcome, elapsed) = cache_result.map_err(|e| ContextCacheError::Internal(format!("cache probe task panicked: {e}")))?;
            ctx.hedge.record(req.org_id, elapsed.as_millis() as u64);
            if let crate::cag::ProbeOutcome::Hit { content, .. } = outcome {
                hybrid_task.abort();
                return Ok(cache_hit_outcome(content, hedge_delay_ms, elapsed.as_millis() as i64));
            }
            let (result, rag_elapsed) = hybrid_task.await.map_err(|e| ContextCacheError::Internal(format!("hybrid recall task panicked: {e}")))?;
            result.map(|outcome| {
                finish_hybrid(outcome, hedge_delay_ms, Some(elapsed.as_millis() as i64), rag_elapsed, Some((promote_key, query_embedding)))
            })
        }
        hybrid_result = hybrid_task => {
            let (result, elapsed) = hybrid_result.map_err(|e| ContextCacheError::Internal(format!("hybrid recall task panicked: {e}")))?;
            result.map(|outcome| finish_hybrid(outcome, hedge_delay_ms, None, elapsed, Some((promote_key, query_embedding))))
        }
    }
}

fn cache_hit_outcome(content: String, hedge_delay_ms: u64, cag_duration_ms: i64) -> DispatchOutcome {
    let synthetic = Memory {
        id: -1,
        project_id: -1,
        created_by_user_id: -1,
        memory_type: MemoryType::Note,
        source: contextcache_types::MemorySource::Manual,
        title: None,
        content,
        metadata: Default::default(),
        content_hash: String::new(),
        has_embedding: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    DispatchOutcome {
        strategy: "hybrid",
        served_by: "cache",
        memories: vec![synthetic],
        trace: HashMap::new(),
        hedge_delay_ms,
        cag_duration_ms: Some(cag_duration_ms),
        rag_duration_ms: None,
        promote: None,
    }
}

struct HybridResult {
    memories: Vec<Memory>,
    trace: HashMap<i64, ScoreTrace>,
}

fn finish_hybrid(
    outcome: HybridResult,
    hedge_delay_ms: u64,
    cag_duration_ms: Option<i64>,
    rag_elapsed: StdDuration,
    promote: Option<(String, Vec<f32>)>,
) -> DispatchOutcome {
    DispatchOutcome {
        strategy: "hybrid",
        served_by: "rag",
        memories: outcome.memories,
        trace: outcome.trace,
        hedge_delay_ms,
        cag_duration_ms,
        rag_duration_ms: Some(rag_elapsed.as_millis() as i64),
        promote,
    }
}

struct HybridArgs {
    pool: std::sync::Arc<DatabasePool>,
    project_id: i64,
    query: String,
    query_embedding: Vec<f32>,
    limit: usize,
    weights: RankWeights,
    vector_min_score: f64,
    vector_candidates_limit: usize,
    hilbert: Option<HilbertSettings>,
}

/// The full hybrid recall: lexical + vector candidate retrieval, fusion,
/// hydration (spec 4.7, 4.9).
async fn run_hybrid(args: HybridArgs) -> Result<HybridResult, ContextCacheError> {
    let project_id = args.project_id;
    let query = args.query.clone();
    let vector_candidates_limit = args.vector_candidates_limit;
    let lex_rows = args
        .pool
        .run(move |conn| store::lexical_candidates(conn, project_id, &query, vector_candidates_limit))
        .await?;

    let query_embedding = args.query_embedding.clone();
    let vector_min_score = args.vector_min_score;
    let hilbert = args.hilbert;
    let vec_rows = args
        .pool
        .run(move |conn| {
            let window = hilbert
                .map(|h| {
                    let center = hilbert_index(&query_embedding, h.sfc_params);
                    store::resolve_hilbert_window(conn, project_id, center, h.radius0, h.widen_mult, h.min_rows, h.max_radius)
                })
                .transpose()?;
            store::vector_candidates(conn, project_id, &query_embedding, vector_candidates_limit, vector_min_score, window)
        })
        .await?;

    let mut created_at = HashMap::new();
    let candidates_lex: HashMap<i64, f64> = lex_rows
        .iter()
        .map(|(id, score, created)| {
            created_at.entry(*id).or_insert(*created);
            (*id, *score)
        })
        .collect();
    let candidates_vec: HashMap<i64, f64> = vec_rows
        .iter()
        .map(|(id, score, created)| {
            created_at.entry(*id).or_insert(*created);
            (*id, *score)
        })
        .collect();

    let now = Utc::now();
    let (ranked_ids, trace) = rank_hybrid(&candidates_lex, &candidates_vec, &created_at, args.weights, now, args.limit);

    let memories = args.pool.run(move |conn| store::get_memories_by_ids(conn, &ranked_ids)).await?;
    let ordered = order_by_type(memories);

    Ok(HybridResult { memories: ordered, trace })
}

/// Group by the fixed type-presentation order (spec 4.9), preserving the
/// ranker's relative order within each group.
fn order_by_type(memories: Vec<Memory>) -> Vec<Memory> {
    let mut grouped: Vec<Memory> = Vec::with_capacity(memories.len());
    for t in TYPE_ORDER {
        for m in &memories {
            if m.memory_type == t {
                grouped.push(m.clone());
            }
        }
    }
    for m in &memories {
        if !TYPE_ORDER.contains(&m.memory_type) {
            grouped.push(m.clone());
        }
    }
    grouped
}

/// Deterministic plaintext pack (spec 4.9 "Format"): memories are grouped by
/// type header, in `TYPE_ORDER` then any remaining types in their existing
/// (ranker) order, each memory rendered as a `- content` bullet line.
/// `memories` must already be grouped by `order_by_type`.
fn format_memory_pack(query: &str, memories: &[Memory]) -> String {
    let mut out = format!("PROJECT MEMORY PACK\nQuery: {query}\n");
    if memories.is_empty() {
        return out;
    }

    let mut current: Option<MemoryType> = None;
    for m in memories {
        if current != Some(m.memory_type) {
            out.push('\n');
            out.push_str(m.memory_type.as_str().to_uppercase().as_str());
            out.push_str(":\n");
            current = Some(m.memory_type);
        }
        out.push_str("- ");
        out.push_str(&m.content);
        out.push('\n');
    }
    out
}

fn to_gate_error(refusal: crate::gate::GateRefusal) -> ContextCacheError {
    ContextCacheError::GateRefused {
        reason: refusal.reason,
        retry_after_seconds: Some(refusal.retry_after_seconds as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cag::CagParams;
    use crate::config::env::GateConfig;

    async fn seeded_context() -> (RecallContext, i64) {
        let pool = std::sync::Arc::new(DatabasePool::open_in_memory().await.unwrap());
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

        let embeddings = std::sync::Arc::new(EmbeddingProvider::Local {
            model: "local-fallback".into(),
            dims: 16,
        });

        let draft = crate::db::MemoryDraft {
            project_id: 1,
            created_by_user_id: 1,
            memory_type: MemoryType::Decision,
            source: contextcache_types::MemorySource::Manual,
            title: Some("Use Postgres".into()),
            content: "We chose Postgres for persistence because of JSONB support".into(),
            metadata: Default::default(),
        };
        crate::db::write_memory(&pool, &embeddings, crate::sfc::SfcParams::default(), draft)
            .await
            .unwrap();

        let ctx = RecallContext {
            pool,
            embeddings,
            cag: CagCache::new(CagParams::default()),
            gate: UsageGate::new(GateConfig::default()),
            hedge: std::sync::Arc::new(HedgeTracker::new(HedgeConfig::default(), 900)),
            ranking_weights: RankWeights::default(),
            vector_min_score: 0.0,
            vector_candidates_limit: 200,
            hilbert: None,
            cag_enabled: true,
        };
        (ctx, 1)
    }

    #[tokio::test]
    async fn empty_query_takes_recency_fallback() {
        let (ctx, project_id) = seeded_context().await;
        let req = RecallRequest {
            project_id,
            org_id: 1,
            actor_user_id: Some(1),
            query: "".into(),
            limit: 10,
            client_ip: "1.2.3.4".into(),
            account_key: "user:1".into(),
            is_unlimited: false,
        };
        let resp = dispatch(&ctx, req).await.unwrap();
        assert_eq!(resp.strategy, "recency_fallback");
        assert_eq!(resp.served_by, "fallback");
        assert_eq!(resp.items.len(), 1);
    }

    #[tokio::test]
    async fn lexical_query_finds_the_written_memory() {
        let (ctx, project_id) = seeded_context().await;
        let req = RecallRequest {
            project_id,
            org_id: 1,
            actor_user_id: Some(1),
            query: "Postgres persistence".into(),
            limit: 10,
            client_ip: "1.2.3.4".into(),
            account_key: "user:1".into(),
            is_unlimited: false,
        };
        let resp = dispatch(&ctx, req).await.unwrap();
        assert_eq!(resp.strategy, "hybrid");
        assert_eq!(resp.items.len(), 1);
        assert!(resp.memory_pack_text.contains("Use Postgres"));
    }

    #[tokio::test]
    async fn burst_gate_refuses_after_limit() {
        let (mut ctx, project_id) = seeded_context().await;
        ctx.gate = UsageGate::new(GateConfig {
            recall_per_ip_per_hour: 1,
            ..GateConfig::default()
        });
        let make_req = || RecallRequest {
            project_id,
            org_id: 1,
            actor_user_id: Some(1),
            query: "".into(),
            limit: 10,
            client_ip: "9.9.9.9".into(),
            account_key: "user:1".into(),
            is_unlimited: false,
        };
        assert!(dispatch(&ctx, make_req()).await.is_ok());
        let err = dispatch(&ctx, make_req()).await.unwrap_err();
        assert!(matches!(err, ContextCacheError::GateRefused { .. }));
    }
}
