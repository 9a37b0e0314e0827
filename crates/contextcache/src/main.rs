// crates/contextcache/src/main.rs
// ContextCache - hybrid recall core server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use contextcache::cag::{CagCache, CagParams};
use contextcache::config::env::EnvConfig;
use contextcache::db::{self, DatabasePool};
use contextcache::dispatcher::{self, HedgeTracker, HilbertSettings, RecallContext, RecallRequest};
use contextcache::embeddings::EmbeddingProvider;
use contextcache::gate::UsageGate;
use contextcache::ranking::RankWeights;
use contextcache::reindex::ReindexHandle;
use contextcache::sfc::SfcParams;
use contextcache::web;

#[derive(Parser)]
#[command(name = "contextcache", about = "Hybrid recall core for AI-assisted workflows")]
struct Cli {
    /// Load environment variables from this file before anything else (never
    /// the implicit CWD `.env` — configuration stays fully explicit).
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default if no subcommand is given).
    Serve,
    /// Open the database and apply schema migrations, then exit.
    Migrate,
    /// Run a single recall query against the configured database and print
    /// the resulting memory pack (operator smoke-test, bypasses HTTP).
    Recall {
        project_id: i64,
        query: String,
        #[arg(long)]
        org_id: i64,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the resolved configuration and its validation report.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.env_file {
        dotenvy::from_path(path).with_context(|| format!("failed to load env file {}", path.display()))?;
    }

    let config = EnvConfig::load();
    init_logging(&config.log_level, &cli.command);

    let validation = config.validate();
    for warning in &validation.warnings {
        tracing::warn!("{warning}");
    }
    if !validation.is_valid() {
        for error in &validation.errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("invalid configuration:\n{}", validation.report());
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(config).await,
        Commands::Migrate => run_migrate(config).await,
        Commands::Recall {
            project_id,
            query,
            org_id,
            limit,
        } => run_recall(config, project_id, query, org_id, limit).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", validation.report());
                println!("{config:#?}");
                Ok(())
            }
        },
    }
}

fn init_logging(log_level: &str, command: &Option<Commands>) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    // `config show` is a one-shot inspection command; keep it quiet so the
    // printed report isn't interleaved with startup spans.
    let level = if matches!(command, Some(Commands::Config { .. })) {
        level.min(Level::WARN)
    } else {
        level
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_writer(std::io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn database_path(config: &EnvConfig) -> PathBuf {
    PathBuf::from(config.database_path.clone().unwrap_or_else(|| "contextcache.db".to_string()))
}

async fn open_pool(config: &EnvConfig) -> Result<DatabasePool> {
    let pool = DatabasePool::open(&database_path(config)).await.context("failed to open database")?;
    db::ensure_vec_mirror(&pool, config.embedding.dims)
        .await
        .context("failed to ensure vec0 mirror table")?;
    Ok(pool)
}

fn ranking_weights(config: &EnvConfig) -> RankWeights {
    RankWeights {
        fts: config.ranking.fts_weight,
        vector: config.ranking.vector_weight,
        recency: config.ranking.recency_weight,
        half_life_days: config.ranking.recency_half_life_days,
    }
}

fn hilbert_settings(config: &EnvConfig) -> Option<HilbertSettings> {
    if !config.hilbert.enabled {
        return None;
    }
    Some(HilbertSettings {
        sfc_params: SfcParams {
            dims: config.hilbert.dims,
            bits: config.hilbert.bits,
            seed: config.hilbert.seed,
        },
        radius0: config.hilbert.radius0,
        widen_mult: config.hilbert.widen_mult,
        min_rows: config.hilbert.min_rows,
        max_radius: config.hilbert.max_radius,
    })
}

fn cag_params(config: &EnvConfig) -> CagParams {
    CagParams {
        match_threshold: config.cag.match_threshold,
        cache_max_items: config.cag.cache_max_items,
        evaporation_rate: config.cag.evaporation_rate,
        evaporation_interval_seconds: config.cag.evaporation_interval_seconds as i64,
        hit_boost: config.cag.hit_boost,
    }
}

/// Spawns a ticker that cooperatively evaporates the CAG cache on a fixed
/// interval (spec 4.8 "Evaporation": "a background ticker may also invoke
/// it"). Not load-bearing for correctness — every `probe` already evaporates
/// lazily — but keeps pheromone levels decaying even on an idle server.
fn spawn_evaporation_ticker(cag: CagCache, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
        loop {
            ticker.tick().await;
            cag.evaporate_now(chrono::Utc::now());
        }
    });
}

async fn warm_cag(pool: &DatabasePool, cag: &CagCache, limit: usize) -> Result<()> {
    let candidates = pool.interact(move |conn| Ok(db::store::warm_candidates(conn, limit)?)).await?;
    let chunks = candidates
        .into_iter()
        .map(|(memory, embedding)| (format!("memory:{}", memory.id), memory.content, embedding))
        .collect();
    cag.warm(chunks, chrono::Utc::now());
    Ok(())
}

/// Selects the burst-limiter backend (SPEC_FULL 11): in-process unless built
/// with `--features redis-gate` and `REDIS_URL` is set, in which case a
/// Redis connection failure is logged and the gate falls back in-process
/// rather than refusing to start.
#[cfg(feature = "redis-gate")]
fn build_gate(config: &EnvConfig) -> UsageGate {
    use contextcache::gate::RedisBurstLimiter;

    let Some(redis_url) = &config.redis_url else {
        return UsageGate::new(config.gate.clone());
    };
    match RedisBurstLimiter::connect(redis_url) {
        Ok(backend) => UsageGate::with_backend(config.gate.clone(), Arc::new(backend)),
        Err(err) => {
            tracing::warn!(error = %err, "failed to connect to Redis burst backend; falling back to in-process");
            UsageGate::new(config.gate.clone())
        }
    }
}

#[cfg(not(feature = "redis-gate"))]
fn build_gate(config: &EnvConfig) -> UsageGate {
    UsageGate::new(config.gate.clone())
}

async fn run_serve(config: EnvConfig) -> Result<()> {
    let pool = Arc::new(open_pool(&config).await?);
    let embeddings = Arc::new(EmbeddingProvider::from_config(&config.embedding));
    let sfc_params = SfcParams {
        dims: config.hilbert.dims,
        bits: config.hilbert.bits,
        seed: config.hilbert.seed,
    };

    let cag = CagCache::new(cag_params(&config));
    if config.cag_warm_on_start {
        warm_cag(&pool, &cag, config.cag.cache_max_items.min(1000)).await?;
    }
    if config.cag.enabled {
        spawn_evaporation_ticker(cag.clone(), config.cag.evaporation_interval_seconds);
    }

    let gate = build_gate(&config);
    let hedge = Arc::new(HedgeTracker::new(config.hedge.clone(), config.gate.hedge_p95_cache_ttl_seconds));

    let reindex = if config.reindex_worker_enabled {
        ReindexHandle::spawn(pool.clone(), embeddings.clone(), sfc_params)
    } else {
        ReindexHandle::disabled()
    };

    let state = web::AppState::new(
        pool,
        embeddings,
        sfc_params,
        cag,
        config.cag.enabled,
        gate,
        hedge,
        ranking_weights(&config),
        config.ranking.vector_min_score,
        config.ranking.vector_candidates,
        hilbert_settings(&config),
        reindex,
    );

    let app = web::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "contextcache listening");
    axum::serve(listener, app).await.context("server exited with an error")?;
    Ok(())
}

async fn run_migrate(config: EnvConfig) -> Result<()> {
    let path = database_path(&config);
    open_pool(&config).await?;
    println!("schema applied at {}", path.display());
    Ok(())
}

async fn run_recall(config: EnvConfig, project_id: i64, query: String, org_id: i64, limit: Option<usize>) -> Result<()> {
    let pool = Arc::new(open_pool(&config).await?);
    let embeddings = Arc::new(EmbeddingProvider::from_config(&config.embedding));

    let ctx = RecallContext {
        pool,
        embeddings,
        cag: CagCache::new(cag_params(&config)),
        gate: UsageGate::new(config.gate.clone()),
        hedge: Arc::new(HedgeTracker::new(config.hedge.clone(), config.gate.hedge_p95_cache_ttl_seconds)),
        ranking_weights: ranking_weights(&config),
        vector_min_score: config.ranking.vector_min_score,
        vector_candidates_limit: config.ranking.vector_candidates,
        hilbert: hilbert_settings(&config),
        cag_enabled: config.cag.enabled,
    };

    let req = RecallRequest {
        project_id,
        org_id,
        actor_user_id: None,
        query,
        limit: limit.unwrap_or(10).clamp(1, 50),
        client_ip: "cli".to_string(),
        account_key: "cli".to_string(),
        is_unlimited: true,
    };
    let resp = dispatcher::dispatch(&ctx, req).await?;
    println!("{}", resp.memory_pack_text);
    println!("\nstrategy={} served_by={} items={}", resp.strategy, resp.served_by, resp.items.len());
    Ok(())
}
