// crates/contextcache/src/db/schema.rs
// Relational schema for the persistent state layout (spec §6, §3).
//
// Lexical index is an FTS5 virtual table kept in sync by triggers — the
// SQLite analogue of the original Python source's Postgres `tsvector`
// (SPEC_FULL 10.5). The dense vector column is stored as a raw little-endian
// f32 BLOB on `memories` itself; a `sqlite-vec` `vec0` mirror table is
// maintained alongside it for parity with the teacher's stack, but
// `vector_candidates` (db/store.rs) scores directly off the BLOB in Rust so
// cosine ranking stays exactly reproducible (spec §8 property 4) rather than
// depending on the extension's internal ANN approximation.

use rusqlite::Connection;

pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            name       TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS users (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id       INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
            email        TEXT NOT NULL,
            is_unlimited INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS memberships (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id     INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
            user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role       TEXT NOT NULL DEFAULT 'member',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(org_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS projects (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id             INTEGER NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
            name               TEXT NOT NULL,
            created_by_user_id INTEGER NOT NULL REFERENCES users(id),
            created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS memories (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id         INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            created_by_user_id INTEGER NOT NULL,
            memory_type        TEXT NOT NULL,
            source             TEXT NOT NULL,
            title              TEXT,
            content            TEXT NOT NULL,
            metadata           TEXT NOT NULL DEFAULT '{}',
            content_hash       TEXT NOT NULL,
            embedding_vector   BLOB,
            hilbert_index      INTEGER,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL,
            UNIQUE(project_id, content_hash)
        );

        CREATE INDEX IF NOT EXISTS idx_memories_project_created
            ON memories(project_id, created_at DESC, id DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_project_hilbert
            ON memories(project_id, hilbert_index);

        CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
            title, content, content='memories', content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS memories_fts_insert AFTER INSERT ON memories BEGIN
            INSERT INTO memories_fts(rowid, title, content) VALUES (new.id, new.title, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS memories_fts_delete AFTER DELETE ON memories BEGIN
            INSERT INTO memories_fts(memories_fts, rowid, title, content)
                VALUES ('delete', old.id, old.title, old.content);
        END;

        CREATE TRIGGER IF NOT EXISTS memories_fts_update AFTER UPDATE ON memories BEGIN
            INSERT INTO memories_fts(memories_fts, rowid, title, content)
                VALUES ('delete', old.id, old.title, old.content);
            INSERT INTO memories_fts(rowid, title, content) VALUES (new.id, new.title, new.content);
        END;

        CREATE TABLE IF NOT EXISTS inbox_items (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id           INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            raw_capture_id       INTEGER REFERENCES raw_captures(id),
            promoted_memory_id   INTEGER REFERENCES memories(id),
            suggested_type       TEXT NOT NULL,
            suggested_title      TEXT,
            suggested_content    TEXT NOT NULL,
            confidence_score     REAL NOT NULL,
            status               TEXT NOT NULL DEFAULT 'pending',
            created_at           TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at           TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS raw_captures (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            source     TEXT NOT NULL,
            payload    TEXT NOT NULL,
            status     TEXT NOT NULL DEFAULT 'queued',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS recall_logs (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id             INTEGER NOT NULL,
            project_id         INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            actor_user_id      INTEGER,
            strategy           TEXT NOT NULL,
            query_text         TEXT NOT NULL,
            input_memory_ids   TEXT NOT NULL,
            ranked_memory_ids  TEXT NOT NULL,
            weights            TEXT NOT NULL,
            score_details      TEXT NOT NULL,
            created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS recall_timings (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id            INTEGER NOT NULL,
            project_id        INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            served_by         TEXT NOT NULL,
            strategy          TEXT NOT NULL,
            hedge_delay_ms    INTEGER NOT NULL,
            cag_duration_ms   INTEGER,
            rag_duration_ms   INTEGER,
            total_duration_ms INTEGER NOT NULL,
            created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS usage_counters (
            user_id          INTEGER NOT NULL,
            day              TEXT NOT NULL,
            memories_created INTEGER NOT NULL DEFAULT 0,
            recall_queries   INTEGER NOT NULL DEFAULT 0,
            projects_created INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, day)
        );
        "#,
    )?;

    ensure_vec_mirror(conn)?;
    Ok(())
}

/// `sqlite-vec`'s `vec0` virtual table requires a fixed dimensionality at
/// creation time, so it can't be declared in the static batch above (the
/// configured embedding dims aren't known until `EnvConfig` loads). Callers
/// that want the mirror populated call this once the configured dims are
/// known; it is a no-op if the table already exists with a different shape.
pub fn ensure_vec_mirror_with_dims(conn: &Connection, dims: usize) -> rusqlite::Result<()> {
    let sql = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(embedding float[{dims}]);"
    );
    conn.execute_batch(&sql)
}

/// Placeholder no-op kept so `initialize_schema` has a single call site; the
/// dims-aware table is created lazily via `ensure_vec_mirror_with_dims` once
/// `EnvConfig::embedding.dims` is known (see `db::ensure_vec_mirror`).
fn ensure_vec_mirror(_conn: &Connection) -> rusqlite::Result<()> {
    Ok(())
}
