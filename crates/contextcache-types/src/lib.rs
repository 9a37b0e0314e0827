// crates/contextcache-types/src/lib.rs

//! Shared data contracts between the ContextCache server and its clients.
//!
//! This crate provides the core domain model for:
//! - **Project context**: the tenant-scoped container memories live in.
//! - **Memory**: the atomic unit of capture and recall.
//! - **Recall**: request/response shapes for the hybrid recall endpoint.
//!
//! These types are designed to work across native and WASM builds, with no
//! native-only dependencies allowed (no `rusqlite`, no `tokio`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ===================================================
// DOMAIN TYPES
// ===================================================

/// The kind of thing a memory represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Decision,
    Finding,
    Definition,
    Note,
    Link,
    Todo,
    Chat,
    Doc,
    Code,
    Web,
    File,
    Event,
}

impl MemoryType {
    /// Fixed priority table used by the type-prior ranker boost.
    pub fn priority(self) -> u8 {
        match self {
            MemoryType::Decision => 10,
            MemoryType::Finding => 9,
            MemoryType::Definition => 8,
            MemoryType::Todo => 7,
            MemoryType::Code => 6,
            MemoryType::Doc => 5,
            MemoryType::Chat => 4,
            MemoryType::Note => 3,
            MemoryType::Link => 2,
            MemoryType::Event => 1,
            MemoryType::Web => 1,
            MemoryType::File => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Decision => "decision",
            MemoryType::Finding => "finding",
            MemoryType::Definition => "definition",
            MemoryType::Note => "note",
            MemoryType::Link => "link",
            MemoryType::Todo => "todo",
            MemoryType::Chat => "chat",
            MemoryType::Doc => "doc",
            MemoryType::Code => "code",
            MemoryType::Web => "web",
            MemoryType::File => "file",
            MemoryType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "decision" => MemoryType::Decision,
            "finding" => MemoryType::Finding,
            "definition" => MemoryType::Definition,
            "note" => MemoryType::Note,
            "link" => MemoryType::Link,
            "todo" => MemoryType::Todo,
            "chat" => MemoryType::Chat,
            "doc" => MemoryType::Doc,
            "code" => MemoryType::Code,
            "web" => MemoryType::Web,
            "file" => MemoryType::File,
            "event" => MemoryType::Event,
            _ => return None,
        })
    }
}

/// Where a memory originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Manual,
    Api,
    Chatgpt,
    Claude,
    Cursor,
    Codex,
    Seed,
    Ingestion,
}

impl MemorySource {
    pub fn as_str(self) -> &'static str {
        match self {
            MemorySource::Manual => "manual",
            MemorySource::Api => "api",
            MemorySource::Chatgpt => "chatgpt",
            MemorySource::Claude => "claude",
            MemorySource::Cursor => "cursor",
            MemorySource::Codex => "codex",
            MemorySource::Seed => "seed",
            MemorySource::Ingestion => "ingestion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "manual" => MemorySource::Manual,
            "api" => MemorySource::Api,
            "chatgpt" => MemorySource::Chatgpt,
            "claude" => MemorySource::Claude,
            "cursor" => MemorySource::Cursor,
            "codex" => MemorySource::Codex,
            "seed" => MemorySource::Seed,
            "ingestion" => MemorySource::Ingestion,
            _ => return None,
        })
    }
}

/// Project context: the tenant-scoped container memories belong to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    pub id: i64,
    pub org_id: i64,
    pub name: String,
    pub created_by_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// The central entity: a single user-captured snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub project_id: i64,
    pub created_by_user_id: i64,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub source: MemorySource,
    pub title: Option<String>,
    pub content: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub content_hash: String,
    pub has_embedding: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One ranked candidate in a recall response, with the score shown to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub source: MemorySource,
    pub title: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub rank_score: Option<f64>,
}

/// `GET /projects/{id}/recall` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResponse {
    pub project_id: i64,
    pub query: String,
    pub strategy: String,
    pub served_by: String,
    pub memory_pack_text: String,
    pub items: Vec<RecallItem>,
}

/// `POST /projects/{id}/memories` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMemoryRequest {
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    #[serde(default)]
    pub source: Option<MemorySource>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Per-field edits accepted when approving an inbox item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryEdits {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub memory_type: Option<MemoryType>,
}

/// `GET /projects/{id}/inbox` item shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: i64,
    pub project_id: i64,
    pub raw_capture_id: Option<i64>,
    pub promoted_memory_id: Option<i64>,
    pub suggested_type: MemoryType,
    pub suggested_title: Option<String>,
    pub suggested_content: String,
    pub confidence_score: f64,
    pub status: InboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    Pending,
    Approved,
    Rejected,
}

/// `GET /me/usage` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResponse {
    pub day: String,
    pub memories_created: i64,
    pub recall_queries: i64,
    pub projects_created: i64,
    pub memories_per_day_limit: i64,
    pub recalls_per_day_limit: i64,
    pub projects_per_day_limit: i64,
    pub is_unlimited: bool,
}

/// Uniform error envelope returned by every non-2xx JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_round_trips_through_str() {
        for t in [
            MemoryType::Decision,
            MemoryType::Finding,
            MemoryType::Definition,
            MemoryType::Note,
            MemoryType::Link,
            MemoryType::Todo,
            MemoryType::Chat,
            MemoryType::Doc,
            MemoryType::Code,
            MemoryType::Web,
            MemoryType::File,
            MemoryType::Event,
        ] {
            assert_eq!(MemoryType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn memory_type_priority_matches_spec_table() {
        assert_eq!(MemoryType::Decision.priority(), 10);
        assert_eq!(MemoryType::Finding.priority(), 9);
        assert_eq!(MemoryType::File.priority(), 1);
        assert_eq!(MemoryType::Web.priority(), 1);
    }

    #[test]
    fn recall_response_serializes_with_type_tag() {
        let resp = RecallResponse {
            project_id: 1,
            query: "hello".into(),
            strategy: "hybrid".into(),
            served_by: "rag".into(),
            memory_pack_text: "PROJECT MEMORY PACK".into(),
            items: vec![RecallItem {
                id: 1,
                memory_type: MemoryType::Decision,
                source: MemorySource::Manual,
                title: None,
                content: "Use Postgres".into(),
                created_at: Utc::now(),
                rank_score: Some(0.9),
            }],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"type\":\"decision\""));
    }
}
