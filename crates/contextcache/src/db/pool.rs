// crates/contextcache/src/db/pool.rs
// Async connection pool using deadpool-sqlite, sqlite-vec registered globally
// for the dense vector column, WAL mode, contention-aware retry.
//
// Preferred pattern: `pool.run(...)` for request handlers (converts errors to
// `ContextCacheError` automatically). Use `pool.interact(...)` when an
// `anyhow::Result` is more convenient (migrations, background tasks).

use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::Once;

use crate::error::ContextCacheError;

static SQLITE_VEC_INIT: Once = Once::new();

#[allow(clippy::missing_transmute_annotations)]
pub(crate) fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init matches the signature sqlite3_auto_extension
        // expects; the transmute is the standard pattern for registering a
        // statically-linked SQLite extension.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered globally");
    });
}

fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn is_contextcache_contention(err: &ContextCacheError) -> bool {
    match err {
        ContextCacheError::Db(e) => is_rusqlite_contention(e),
        _ => false,
    }
}

const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

async fn retry_with_backoff<F, Fut, R, E>(mut op: F, is_retryable: impl Fn(&E) -> bool) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if is_retryable(&e) {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = RETRY_DELAYS.len(),
                        ?delay,
                        "sqlite contention, retrying"
                    );
                    tokio::time::sleep(*delay).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
    op().await
}

/// Pooled SQLite connection handle. `Clone`-cheap (wraps an `Arc`-backed pool
/// internally via `deadpool_sqlite::Pool`), threaded through `AppState`.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    memory_uri: Option<String>,
}

enum DbStorage {
    File(PathBuf),
    InMemory,
}

impl DatabasePool {
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf())).await
    }

    /// Shared-cache in-memory database (`file:memdb_<uuid>?mode=memory&cache=shared`)
    /// so every pooled connection sees the same state — required for tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_internal(DbStorage::InMemory).await
    }

    async fn open_internal(storage: DbStorage) -> Result<Self> {
        ensure_sqlite_vec_registered();

        let (conn_str, path, memory_uri, hook) = match storage {
            DbStorage::File(p) => {
                if let Some(parent) = p.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let s = p.to_string_lossy().into_owned();
                (s, Some(p), None, file_post_create_hook())
            }
            DbStorage::InMemory => {
                let uri = format!("file:memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
                (uri.clone(), None, Some(uri), file_post_create_hook())
            }
        };

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("failed to create sqlite pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("failed to build sqlite connection pool")?;

        let db_pool = Self {
            pool,
            path,
            memory_uri,
        };

        db_pool
            .interact(|conn| {
                super::schema::initialize_schema(conn)?;
                Ok(())
            })
            .await?;

        Ok(db_pool)
    }

    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure on a pooled connection, blocking-pool offloaded.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.pool.get().await.context("failed to get connection from pool")?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Like [`interact`](Self::interact) but surfaces `ContextCacheError`
    /// directly, the form request handlers want.
    pub async fn run<F, R, E>(&self, f: F) -> Result<R, ContextCacheError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<ContextCacheError> + Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| ContextCacheError::Internal(format!("failed to get connection: {e}")))?;
        conn.interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| ContextCacheError::Internal(format!("database interact failed: {e}")))?
    }

    /// Like [`run`](Self::run) with contention-aware retry (100ms, 500ms, 2s).
    /// Use for writes that must not be lost (memory creation, inbox approval).
    pub async fn run_with_retry<F, R, E>(&self, f: F) -> Result<R, ContextCacheError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + Clone + 'static,
        R: Send + 'static,
        E: Into<ContextCacheError> + Send + 'static,
    {
        retry_with_backoff(
            || {
                let f_clone = f.clone();
                self.run(f_clone)
            },
            is_contextcache_contention,
        )
        .await
    }

    /// Best-effort closure: logs failure at `warn` instead of propagating.
    /// Use for non-blocking log writes (`RecallLog`/`RecallTiming`, spec 4.9).
    pub async fn try_interact_warn<F, R>(&self, label: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let label = label.to_string();
        match self.interact(f).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(label = %label, error = %e, "best-effort db operation failed");
                None
            }
        }
    }
}

fn file_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode=WAL; \
                     PRAGMA foreign_keys=ON; \
                     PRAGMA busy_timeout=5000; \
                     PRAGMA synchronous=NORMAL;",
                )
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}
