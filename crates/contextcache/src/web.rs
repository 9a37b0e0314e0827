// crates/contextcache/src/web.rs
// HTTP surface (spec 6): a thin axum layer over the dispatcher/write
// pipeline/store. Handlers never touch SQL directly; they validate input,
// resolve the actor from request headers, and hand off to the library
// functions that already carry their own error taxonomy.
//
// Auth itself (session cookies, magic links, API key issuance) is out of
// scope; `ActorContext` only reads the headers an already-authenticated
// front door is expected to set (spec 6 "Auth", Non-goals).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{request::Parts, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use contextcache_types::{
    CreateMemoryRequest, InboxStatus, Memory, MemoryEdits, UsageResponse,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cag::CagCache;
use crate::db::{self, store, DatabasePool};
use crate::dispatcher::{HilbertSettings, RecallContext, RecallRequest};
use crate::embeddings::EmbeddingProvider;
use crate::error::ContextCacheError;
use crate::gate::{today, GateKind, QuotaKind, UsageGate};
use crate::ranking::RankWeights;
use crate::reindex::ReindexHandle;
use crate::sfc::SfcParams;

/// Everything a handler needs, cloned per request. `recall` bundles the
/// fields `dispatcher::dispatch` wants; the rest (pool/embeddings/sfc_params)
/// are shared with it but also used directly by the write/inbox/ingest
/// handlers that don't go through the dispatcher at all.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<DatabasePool>,
    pub embeddings: Arc<EmbeddingProvider>,
    pub sfc_params: SfcParams,
    pub gate: UsageGate,
    pub reindex: ReindexHandle,
    pub recall: RecallContext,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<DatabasePool>,
        embeddings: Arc<EmbeddingProvider>,
        sfc_params: SfcParams,
        cag: CagCache,
        cag_enabled: bool,
        gate: UsageGate,
        hedge: Arc<crate::dispatcher::HedgeTracker>,
        ranking_weights: RankWeights,
        vector_min_score: f64,
        vector_candidates_limit: usize,
        hilbert: Option<HilbertSettings>,
        reindex: ReindexHandle,
    ) -> Self {
        let recall = RecallContext {
            pool: pool.clone(),
            embeddings: embeddings.clone(),
            cag,
            gate: gate.clone(),
            hedge,
            ranking_weights,
            vector_min_score,
            vector_candidates_limit,
            hilbert,
            cag_enabled,
        };
        Self {
            pool,
            embeddings,
            sfc_params,
            gate,
            reindex,
            recall,
        }
    }
}

/// The caller's org/user, read from headers set by whatever front door
/// authenticated the request (spec 6 "Auth": session cookie or
/// `X-API-Key` + `X-Org-Id`; verifying those credentials is out of scope
/// here — this extractor trusts that it already happened and only parses
/// the resulting identity headers).
pub struct ActorContext {
    pub org_id: i64,
    pub user_id: i64,
    pub client_ip: String,
}

impl ActorContext {
    pub fn account_key(&self) -> String {
        format!("user:{}", self.user_id)
    }
}

impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = ContextCacheError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = header_i64(&parts.headers, "x-org-id").ok_or(ContextCacheError::Unauthenticated)?;
        let user_id = header_i64(&parts.headers, "x-user-id").ok_or(ContextCacheError::Unauthenticated)?;
        let client_ip = client_ip(&parts.headers);
        Ok(ActorContext {
            org_id,
            user_id,
            client_ip,
        })
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// `X-Forwarded-For`'s first hop, or "unknown" when the request didn't come
/// through a proxy that sets it (burst limiting still works per-unknown-ip,
/// it just shares a bucket across direct callers).
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn cross_tenant_check(pool: &DatabasePool, project_id: i64, org_id: i64) -> Result<(), ContextCacheError> {
    let owner = pool
        .run(move |conn| store::get_project_org_id(conn, project_id))
        .await?
        .ok_or_else(|| ContextCacheError::NotFound(format!("project {project_id}")))?;
    if owner != org_id {
        return Err(ContextCacheError::CrossTenant);
    }
    Ok(())
}

async fn unlimited(pool: &DatabasePool, user_id: i64) -> Result<bool, ContextCacheError> {
    pool.run(move |conn| store::is_user_unlimited(conn, user_id)).await
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(health))
        .route("/projects/{project_id}/recall", get(recall))
        .route("/projects/{project_id}/memories", post(create_memory).get(list_memories))
        .route("/projects/{project_id}/inbox", get(list_inbox))
        .route("/inbox/{inbox_id}/approve", post(approve_inbox))
        .route("/inbox/{inbox_id}/reject", post(reject_inbox))
        .route("/ingest/raw", post(ingest_raw))
        .route("/me/usage", get(usage));

    Router::new()
        .merge(api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct RecallQuery {
    query: String,
    limit: Option<usize>,
}

/// `GET /projects/{id}/recall` (spec 6 "Recall").
async fn recall(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    actor: ActorContext,
    Query(q): Query<RecallQuery>,
) -> Result<Json<contextcache_types::RecallResponse>, ContextCacheError> {
    cross_tenant_check(&state.pool, project_id, actor.org_id).await?;
    let is_unlimited = unlimited(&state.pool, actor.user_id).await?;
    let limit = q.limit.unwrap_or(10).clamp(1, 50);

    let req = RecallRequest {
        project_id,
        org_id: actor.org_id,
        actor_user_id: Some(actor.user_id),
        query: q.query,
        limit,
        client_ip: actor.client_ip.clone(),
        account_key: actor.account_key(),
        is_unlimited,
    };
    let resp = crate::dispatcher::dispatch(&state.recall, req).await?;
    Ok(Json(resp))
}

/// `POST /projects/{id}/memories` (spec 6 "Create memory", 4.10 Write Pipeline).
async fn create_memory(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    actor: ActorContext,
    Json(req): Json<CreateMemoryRequest>,
) -> Result<(StatusCode, Json<Memory>), ContextCacheError> {
    cross_tenant_check(&state.pool, project_id, actor.org_id).await?;
    if req.content.trim().is_empty() {
        return Err(ContextCacheError::Validation("content must not be empty".into()));
    }

    let is_unlimited = unlimited(&state.pool, actor.user_id).await?;
    state
        .gate
        .check_burst(GateKind::WritePerIp, &actor.client_ip, std::time::Instant::now(), is_unlimited)
        .map_err(to_gate_error)?;
    state
        .gate
        .check_burst(GateKind::WritePerAccount, &actor.account_key(), std::time::Instant::now(), is_unlimited)
        .map_err(to_gate_error)?;
    state
        .gate
        .check_quota(actor.user_id, QuotaKind::Memory, today(Utc::now()), is_unlimited)
        .map_err(to_gate_error)?;

    let mut metadata = req.metadata;
    if !req.tags.is_empty() {
        metadata.insert("tags".to_string(), serde_json::json!(req.tags));
    }

    let draft = db::MemoryDraft {
        project_id,
        created_by_user_id: actor.user_id,
        memory_type: req.memory_type,
        source: req.source.unwrap_or(contextcache_types::MemorySource::Api),
        title: req.title,
        content: req.content,
        metadata,
    };
    let (memory, is_new) = db::write_memory(&state.pool, &state.embeddings, state.sfc_params, draft).await?;
    if !is_new {
        return Err(ContextCacheError::Conflict { existing_id: memory.id });
    }

    state.reindex.enqueue(memory.id);
    if let Err(e) = db::record_memory_write_usage(&state.pool, actor.user_id).await {
        tracing::warn!(error = %e, "failed to record memory write usage counter");
    }

    Ok((StatusCode::CREATED, Json(memory)))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

/// `GET /projects/{id}/memories` (spec 6 "List memories").
async fn list_memories(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    actor: ActorContext,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<Memory>>, ContextCacheError> {
    cross_tenant_check(&state.pool, project_id, actor.org_id).await?;
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let offset = q.offset.unwrap_or(0);
    let memories = state
        .pool
        .run(move |conn| store::list_memories(conn, project_id, limit, offset))
        .await?;
    Ok(Json(memories))
}

#[derive(Debug, Deserialize)]
struct InboxQuery {
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// `GET /projects/{id}/inbox?status=pending|all` (spec 6 "Inbox").
async fn list_inbox(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    actor: ActorContext,
    Query(q): Query<InboxQuery>,
) -> Result<Json<Vec<contextcache_types::InboxItem>>, ContextCacheError> {
    cross_tenant_check(&state.pool, project_id, actor.org_id).await?;
    let status = match q.status.as_deref() {
        None | Some("pending") => Some(InboxStatus::Pending),
        Some("all") => None,
        Some("approved") => Some(InboxStatus::Approved),
        Some("rejected") => Some(InboxStatus::Rejected),
        Some(other) => {
            return Err(ContextCacheError::Validation(format!("unknown inbox status filter: {other}")));
        }
    };
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let offset = q.offset.unwrap_or(0);
    let items = state
        .pool
        .run(move |conn| store::list_inbox_items(conn, project_id, status, limit, offset))
        .await?;
    Ok(Json(items))
}

/// `POST /inbox/{id}/approve`, optional JSON body with field-level edits
/// (spec 4.10 "Inbox promotion"). An empty body means "promote as-is".
async fn approve_inbox(
    State(state): State<AppState>,
    Path(inbox_id): Path<i64>,
    actor: ActorContext,
    body: Bytes,
) -> Result<Json<Memory>, ContextCacheError> {
    let item = state
        .pool
        .run(move |conn| store::get_inbox_item(conn, inbox_id))
        .await?
        .ok_or_else(|| ContextCacheError::NotFound(format!("inbox item {inbox_id}")))?;
    cross_tenant_check(&state.pool, item.project_id, actor.org_id).await?;

    let edits: Option<MemoryEdits> = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&body)?)
    };

    let is_unlimited = unlimited(&state.pool, actor.user_id).await?;
    state
        .gate
        .check_burst(GateKind::WritePerIp, &actor.client_ip, std::time::Instant::now(), is_unlimited)
        .map_err(to_gate_error)?;
    state
        .gate
        .check_quota(actor.user_id, QuotaKind::Memory, today(Utc::now()), is_unlimited)
        .map_err(to_gate_error)?;

    let memory = db::approve_inbox_item(&state.pool, &state.embeddings, state.sfc_params, inbox_id, actor.user_id, edits).await?;
    state.reindex.enqueue(memory.id);
    if let Err(e) = db::record_memory_write_usage(&state.pool, actor.user_id).await {
        tracing::warn!(error = %e, "failed to record memory write usage counter");
    }
    Ok(Json(memory))
}

/// `POST /inbox/{id}/reject`.
async fn reject_inbox(State(state): State<AppState>, Path(inbox_id): Path<i64>, actor: ActorContext) -> Result<StatusCode, ContextCacheError> {
    let item = state
        .pool
        .run(move |conn| store::get_inbox_item(conn, inbox_id))
        .await?
        .ok_or_else(|| ContextCacheError::NotFound(format!("inbox item {inbox_id}")))?;
    cross_tenant_check(&state.pool, item.project_id, actor.org_id).await?;
    db::reject_inbox_item(&state.pool, inbox_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    project_id: i64,
    source: String,
    payload: serde_json::Value,
}

/// `POST /ingest/raw` (spec 6 "Ingest"): persists the raw capture and returns
/// immediately; turning captures into inbox suggestions is async/out of
/// scope here (spec Non-goals: "Inbox suggestion generation").
async fn ingest_raw(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ContextCacheError> {
    cross_tenant_check(&state.pool, req.project_id, actor.org_id).await?;
    let is_unlimited = unlimited(&state.pool, actor.user_id).await?;
    state
        .gate
        .check_burst(GateKind::IngestPerIp, &actor.client_ip, std::time::Instant::now(), is_unlimited)
        .map_err(to_gate_error)?;
    state
        .gate
        .check_burst(GateKind::IngestPerAccount, &actor.account_key(), std::time::Instant::now(), is_unlimited)
        .map_err(to_gate_error)?;

    let project_id = req.project_id;
    let source = req.source;
    let payload = req.payload;
    let capture_id = state
        .pool
        .run(move |conn| store::create_raw_capture(conn, project_id, &source, &payload))
        .await?;

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "queued", "capture_id": capture_id }))))
}

/// `GET /me/usage` (spec 6 "Usage").
async fn usage(State(state): State<AppState>, actor: ActorContext) -> Result<Json<UsageResponse>, ContextCacheError> {
    let day = today(Utc::now());
    let row = state.pool.run(move |conn| store::get_usage_counter(conn, actor.user_id, day)).await?;
    let is_unlimited = unlimited(&state.pool, actor.user_id).await?;
    let cfg = state.gate.config();
    Ok(Json(UsageResponse {
        day: day.to_string(),
        memories_created: row.memories_created,
        recall_queries: row.recall_queries,
        projects_created: row.projects_created,
        memories_per_day_limit: cfg.daily_memory_limit,
        recalls_per_day_limit: cfg.daily_recall_limit,
        projects_per_day_limit: cfg.daily_project_limit,
        is_unlimited,
    }))
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
    use crate::config::env::{GateConfig, HedgeConfig};
    use crate::dispatcher::HedgeTracker;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn seeded_state() -> AppState {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
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

        let embeddings = Arc::new(EmbeddingProvider::Local {
            model: "local-fallback".into(),
            dims: 16,
        });

        AppState::new(
            pool,
            embeddings,
            SfcParams::default(),
            CagCache::new(CagParams::default()),
            true,
            UsageGate::new(GateConfig::default()),
            Arc::new(HedgeTracker::new(HedgeConfig::default(), 900)),
            RankWeights::default(),
            0.0,
            200,
            None,
            ReindexHandle::disabled(),
        )
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let state = seeded_state().await;
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_memory_then_recall_round_trips() {
        let state = seeded_state().await;
        let app = router(state);

        let create_req = Request::builder()
            .method("POST")
            .uri("/projects/1/memories")
            .header("content-type", "application/json")
            .header("x-org-id", "1")
            .header("x-user-id", "1")
            .body(Body::from(
                serde_json::json!({
                    "type": "decision",
                    "content": "We chose SQLite for simplicity",
                    "title": "Storage choice"
                })
                .to_string(),
            ))
            .unwrap();
        let resp = app.clone().oneshot(create_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let recall_req = Request::builder()
            .uri("/projects/1/recall?query=SQLite%20simplicity")
            .header("x-org-id", "1")
            .header("x-user-id", "1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(recall_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_org_header_is_unauthenticated() {
        let state = seeded_state().await;
        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/projects/1/recall?query=x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cross_tenant_project_access_is_forbidden() {
        let state = seeded_state().await;
        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/projects/1/recall?query=x")
                    .header("x-org-id", "2")
                    .header("x-user-id", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
