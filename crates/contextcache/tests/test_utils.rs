//! Shared helpers for ContextCache's HTTP-level integration tests.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{Request, Response, StatusCode};
use contextcache::cag::{CagCache, CagParams};
use contextcache::config::env::{GateConfig, HedgeConfig};
use contextcache::db::DatabasePool;
use contextcache::dispatcher::HedgeTracker;
use contextcache::embeddings::EmbeddingProvider;
use contextcache::gate::UsageGate;
use contextcache::ranking::RankWeights;
use contextcache::reindex::ReindexHandle;
use contextcache::sfc::SfcParams;
use contextcache::web::{router, AppState};
use serde_json::Value;
use tower::ServiceExt;

/// Seeds a single organization/user/project (org_id=1, user_id=1, project_id=1)
/// against a fresh in-memory database and builds a ready-to-serve router.
pub async fn test_app() -> axum::Router {
    test_app_with_cag_params(CagParams::default()).await
}

pub async fn test_app_with_cag_params(cag_params: CagParams) -> axum::Router {
    let (router, _pool) = test_app_with_pool(cag_params).await;
    router
}

/// Like [`test_app_with_cag_params`] but also hands back the raw pool, for
/// tests that need to seed rows (e.g. inbox items) no endpoint creates.
pub async fn test_app_with_pool(cag_params: CagParams) -> (axum::Router, Arc<DatabasePool>) {
    let pool = Arc::new(DatabasePool::open_in_memory().await.expect("open in-memory pool"));
    pool.interact(|conn| {
        conn.execute("INSERT INTO organizations (name) VALUES ('acme')", [])?;
        conn.execute("INSERT INTO organizations (name) VALUES ('other')", [])?;
        conn.execute("INSERT INTO users (org_id, email) VALUES (1, 'alice@acme.test')", [])?;
        conn.execute(
            "INSERT INTO projects (org_id, name, created_by_user_id) VALUES (1, 'proj', 1)",
            [],
        )?;
        Ok(())
    })
    .await
    .expect("seed fixtures");

    let embeddings = Arc::new(EmbeddingProvider::Local {
        model: "local-fallback".into(),
        dims: 16,
    });

    let state = AppState::new(
        pool.clone(),
        embeddings,
        SfcParams::default(),
        CagCache::new(cag_params),
        true,
        UsageGate::new(GateConfig::default()),
        Arc::new(HedgeTracker::new(HedgeConfig::default(), 900)),
        RankWeights::default(),
        0.0,
        200,
        None,
        ReindexHandle::disabled(),
    );
    (router(state), pool)
}

pub fn authed_request(method: &str, uri: &str, org_id: i64, user_id: i64, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-org-id", org_id.to_string())
        .header("x-user-id", user_id.to_string());
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("build request")
}

pub async fn send(app: axum::Router, req: Request<Body>) -> Response<Body> {
    app.oneshot(req).await.expect("request failed")
}

pub async fn body_json(resp: Response<Body>) -> Value {
    let bytes = body_bytes(resp).await;
    serde_json::from_slice(&bytes).expect("response body is valid JSON")
}

pub async fn body_bytes(resp: Response<Body>) -> Bytes {
    use http_body_util::BodyExt;
    resp.into_body().collect().await.expect("read response body").to_bytes()
}

pub fn assert_status(resp: &Response<Body>, expected: StatusCode) {
    assert_eq!(resp.status(), expected, "unexpected status code");
}
