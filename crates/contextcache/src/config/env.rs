// crates/contextcache/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars.
//
// Every recognized key is a field of `EnvConfig`, enumerated here and nowhere
// else; no module reads `std::env::var` directly once `EnvConfig::load()`
// has run. This keeps hot paths (ranking, gating, recall) free of env
// lookups, per the "config via environment" redesign note.

use tracing::{debug, info, warn};

/// Which embedding backend to select, absent an explicit runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingProviderKind {
    #[default]
    Local,
    OpenAi,
    Ollama,
}

impl EmbeddingProviderKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Embedding provider configuration (spec 4.1).
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub dims: usize,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub http_timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            dims: 1536,
            openai_api_key: None,
            openai_model: "text-embedding-3-small".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "nomic-embed-text".to_string(),
            http_timeout_seconds: 20,
        }
    }
}

impl EmbeddingConfig {
    fn from_env() -> Self {
        let dims = std::env::var("EMBEDDING_DIMS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1536);

        let openai_api_key = read_key("OPENAI_API_KEY");
        let ollama_base_url = std::env::var("OLLAMA_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        // provider ∈ {openai, ollama, local}; an explicit EMBEDDING_PROVIDER
        // wins, otherwise select by key/host presence exactly as the
        // embedding client does at construction.
        let provider = std::env::var("EMBEDDING_PROVIDER")
            .ok()
            .and_then(|v| EmbeddingProviderKind::parse(&v))
            .unwrap_or_else(|| {
                if openai_api_key.is_some() {
                    EmbeddingProviderKind::OpenAi
                } else {
                    EmbeddingProviderKind::Local
                }
            });

        Self {
            provider,
            dims,
            openai_api_key,
            openai_model: std::env::var("OPENAI_EMBED_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            ollama_base_url,
            ollama_model: std::env::var("OLLAMA_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            http_timeout_seconds: std::env::var("EMBEDDING_HTTP_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Space-filling-curve (Hilbert) indexer configuration (spec 4.2, 4.6).
#[derive(Debug, Clone)]
pub struct HilbertConfig {
    pub enabled: bool,
    pub dims: usize,
    pub bits: u32,
    pub seed: u64,
    pub radius0: i64,
    pub widen_mult: f64,
    pub min_rows: usize,
    pub max_radius: i64,
}

impl Default for HilbertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dims: 8,
            bits: 12,
            seed: 1337,
            radius0: 500_000,
            widen_mult: 2.0,
            min_rows: 500,
            max_radius: 5_000_000,
        }
    }
}

impl HilbertConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            enabled: parse_bool_env("HILBERT_ENABLED").unwrap_or(default.enabled),
            dims: env_usize("HILBERT_DIMS", default.dims),
            bits: env_u32("HILBERT_BITS", default.bits),
            seed: env_u64("HILBERT_SEED", default.seed),
            radius0: env_i64("HILBERT_RADIUS", default.radius0),
            widen_mult: env_f64("HILBERT_WIDEN_MULT", default.widen_mult),
            min_rows: env_usize("HILBERT_MIN_ROWS", default.min_rows),
            max_radius: env_i64("HILBERT_MAX_RADIUS", default.max_radius),
        }
    }
}

/// CAG (Cache-Augmented Generation) cache configuration (spec 4.8).
#[derive(Debug, Clone)]
pub struct CagConfig {
    pub enabled: bool,
    pub match_threshold: f64,
    pub cache_max_items: usize,
    pub evaporation_rate: f64,
    pub evaporation_interval_seconds: u64,
    pub hit_boost: f64,
}

impl Default for CagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            match_threshold: 0.82,
            cache_max_items: 10_000,
            evaporation_rate: 0.5,
            evaporation_interval_seconds: 300,
            hit_boost: 0.4,
        }
    }
}

impl CagConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            enabled: parse_bool_env("CAG_ENABLED").unwrap_or(default.enabled),
            match_threshold: env_f64("CAG_MATCH_THRESHOLD", default.match_threshold),
            cache_max_items: env_usize("CAG_CACHE_MAX_ITEMS", default.cache_max_items),
            evaporation_rate: env_f64("CAG_PHEROMONE_EVAPORATION", default.evaporation_rate),
            evaporation_interval_seconds: env_u64(
                "CAG_EVAPORATION_INTERVAL_SECONDS",
                default.evaporation_interval_seconds,
            ),
            hit_boost: env_f64("CAG_PHEROMONE_HIT_BOOST", default.hit_boost),
        }
    }
}

/// Hybrid ranker weights and recency half-life (spec 4.7).
#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub fts_weight: f64,
    pub vector_weight: f64,
    pub recency_weight: f64,
    pub recency_half_life_days: f64,
    pub vector_min_score: f64,
    pub vector_candidates: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            fts_weight: 0.45,
            vector_weight: 0.40,
            recency_weight: 0.15,
            recency_half_life_days: 14.0,
            vector_min_score: 0.0,
            vector_candidates: 200,
        }
    }
}

impl RankingConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            fts_weight: env_f64("FTS_WEIGHT", default.fts_weight),
            vector_weight: env_f64("VECTOR_WEIGHT", default.vector_weight),
            recency_weight: env_f64("RECENCY_WEIGHT", default.recency_weight),
            recency_half_life_days: env_f64(
                "RECENCY_HALF_LIFE_DAYS",
                default.recency_half_life_days,
            ),
            vector_min_score: env_f64("VECTOR_MIN_SCORE", default.vector_min_score),
            vector_candidates: env_usize("VECTOR_CANDIDATES", default.vector_candidates),
        }
    }
}

/// Burst rate-limit buckets and daily quota defaults (spec 4.11).
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub recall_per_ip_per_hour: u32,
    pub recall_per_account_per_hour: u32,
    pub write_per_ip_per_minute: u32,
    pub write_per_account_per_minute: u32,
    pub ingest_per_ip_per_minute: u32,
    pub ingest_per_account_per_minute: u32,
    pub daily_memory_limit: i64,
    pub daily_recall_limit: i64,
    pub daily_project_limit: i64,
    pub hedge_p95_cache_ttl_seconds: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            recall_per_ip_per_hour: 240,
            recall_per_account_per_hour: 240,
            write_per_ip_per_minute: 60,
            write_per_account_per_minute: 60,
            ingest_per_ip_per_minute: 30,
            ingest_per_account_per_minute: 30,
            daily_memory_limit: 1000,
            daily_recall_limit: 500,
            daily_project_limit: 20,
            hedge_p95_cache_ttl_seconds: 900,
        }
    }
}

impl GateConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            recall_per_ip_per_hour: env_u32(
                "RECALL_RATE_LIMIT_PER_IP_PER_HOUR",
                default.recall_per_ip_per_hour,
            ),
            recall_per_account_per_hour: env_u32(
                "RECALL_RATE_LIMIT_PER_ACCOUNT_PER_HOUR",
                default.recall_per_account_per_hour,
            ),
            write_per_ip_per_minute: env_u32(
                "WRITE_RATE_LIMIT_PER_IP_PER_MINUTE",
                default.write_per_ip_per_minute,
            ),
            write_per_account_per_minute: env_u32(
                "WRITE_RATE_LIMIT_PER_ACCOUNT_PER_MINUTE",
                default.write_per_account_per_minute,
            ),
            ingest_per_ip_per_minute: env_u32(
                "INGEST_RATE_LIMIT_PER_IP_PER_MINUTE",
                default.ingest_per_ip_per_minute,
            ),
            ingest_per_account_per_minute: env_u32(
                "INGEST_RATE_LIMIT_PER_ACCOUNT_PER_MINUTE",
                default.ingest_per_account_per_minute,
            ),
            daily_memory_limit: env_i64("DAILY_MEMORY_LIMIT", default.daily_memory_limit),
            daily_recall_limit: env_i64("DAILY_RECALL_LIMIT", default.daily_recall_limit),
            daily_project_limit: env_i64("DAILY_PROJECT_LIMIT", default.daily_project_limit),
            hedge_p95_cache_ttl_seconds: env_u64(
                "HEDGE_P95_CACHE_TTL_SECONDS",
                default.hedge_p95_cache_ttl_seconds,
            ),
        }
    }
}

/// Recall dispatcher hedging defaults (spec 4.9).
#[derive(Debug, Clone)]
pub struct HedgeConfig {
    pub default_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            default_delay_ms: 250,
            min_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

impl HedgeConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            default_delay_ms: env_u64("HEDGE_DELAY_MS_DEFAULT", default.default_delay_ms),
            min_delay_ms: env_u64("HEDGE_DELAY_MS_MIN", default.min_delay_ms),
            max_delay_ms: env_u64("HEDGE_DELAY_MS_MAX", default.max_delay_ms),
        }
    }
}

/// Configuration validation result.
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Format as a human-readable report.
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {}", err));
            }
        }
        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for warn in &self.warnings {
                lines.push(format!("  - {}", warn));
            }
        }
        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Environment configuration — all env vars in one place, loaded once at
/// process start and threaded through request handlers from there on.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub embedding: EmbeddingConfig,
    pub hilbert: HilbertConfig,
    pub cag: CagConfig,
    pub ranking: RankingConfig,
    pub gate: GateConfig,
    pub hedge: HedgeConfig,
    /// `CONTEXTCACHE_LOG`, default "info".
    pub log_level: String,
    pub database_path: Option<String>,
    pub bind_addr: String,
    /// `REINDEX_WORKER_ENABLED` (spec 4.10 step 7): when off (default), the
    /// write pipeline's inline embedding computation is authoritative and no
    /// background worker is spawned.
    pub reindex_worker_enabled: bool,
    /// `CAG_WARM_ON_START` (spec 4.8 "Warming"): populate the CAG cache from
    /// the store's highest-type-priority recent memories at process start.
    pub cag_warm_on_start: bool,
    /// `REDIS_URL`: only consulted when built with `--features redis-gate`;
    /// absent, the gate's in-process burst limiter stays active (SPEC_FULL
    /// 11's "development falls back to in-process counters" posture).
    pub redis_url: Option<String>,
}

impl EnvConfig {
    /// Load all environment configuration (call once at startup).
    pub fn load() -> Self {
        info!("loading environment configuration");
        Self {
            embedding: EmbeddingConfig::from_env(),
            hilbert: HilbertConfig::from_env(),
            cag: CagConfig::from_env(),
            ranking: RankingConfig::from_env(),
            gate: GateConfig::from_env(),
            hedge: HedgeConfig::from_env(),
            log_level: std::env::var("CONTEXTCACHE_LOG")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "info".to_string()),
            database_path: std::env::var("DATABASE_PATH").ok().filter(|s| !s.is_empty()),
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            reindex_worker_enabled: parse_bool_env("REINDEX_WORKER_ENABLED").unwrap_or(false),
            cag_warm_on_start: parse_bool_env("CAG_WARM_ON_START").unwrap_or(false),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
        }
    }

    /// Validate the configuration, producing warnings (non-fatal) and errors
    /// (fatal — the caller should refuse to start).
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.embedding.provider == EmbeddingProviderKind::OpenAi
            && self.embedding.openai_api_key.is_none()
        {
            validation.add_warning(
                "EMBEDDING_PROVIDER=openai but OPENAI_API_KEY is unset; falling back to the local deterministic backend",
            );
        }

        if self.ranking.fts_weight < 0.0
            || self.ranking.vector_weight < 0.0
            || self.ranking.recency_weight < 0.0
        {
            validation.add_error("ranking weights must be non-negative");
        }

        if self.hilbert.enabled && self.hilbert.dims * self.hilbert.bits as usize > 63 {
            validation.add_error(format!(
                "HILBERT_DIMS({}) * HILBERT_BITS({}) exceeds 63 bits and cannot fit in a single i64 hilbert_index",
                self.hilbert.dims, self.hilbert.bits
            ));
        }

        if self.cag.cache_max_items == 0 {
            validation.add_warning("CAG_CACHE_MAX_ITEMS is 0; the cache will always be empty");
        }

        debug!(?validation, "configuration validated");
        validation
    }
}

fn read_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ranking_weights_match_spec() {
        let cfg = RankingConfig::default();
        assert_eq!(cfg.fts_weight, 0.45);
        assert_eq!(cfg.vector_weight, 0.40);
        assert_eq!(cfg.recency_weight, 0.15);
        assert_eq!(cfg.recency_half_life_days, 14.0);
    }

    #[test]
    fn default_cag_config_matches_spec() {
        let cfg = CagConfig::default();
        assert_eq!(cfg.match_threshold, 0.82);
        assert_eq!(cfg.hit_boost, 0.4);
        assert_eq!(cfg.evaporation_rate, 0.5);
        assert_eq!(cfg.evaporation_interval_seconds, 300);
    }

    #[test]
    fn default_hedge_config_matches_spec() {
        let cfg = HedgeConfig::default();
        assert_eq!(cfg.default_delay_ms, 250);
        assert_eq!(cfg.min_delay_ms, 50);
        assert_eq!(cfg.max_delay_ms, 2000);
    }

    #[test]
    fn validate_flags_negative_weights() {
        let mut cfg = EnvConfig::load();
        cfg.ranking.fts_weight = -0.1;
        let validation = cfg.validate();
        assert!(!validation.is_valid());
    }

    #[test]
    fn validate_flags_hilbert_bit_overflow() {
        let mut cfg = EnvConfig::load();
        cfg.hilbert.enabled = true;
        cfg.hilbert.dims = 8;
        cfg.hilbert.bits = 12; // 96 bits, overflows i64
        let validation = cfg.validate();
        assert!(!validation.is_valid());
    }
}
