// crates/contextcache/src/config/mod.rs
// Configuration and shared constants

pub mod env;

pub use env::{
    CagConfig, ConfigValidation, EmbeddingConfig, EnvConfig, GateConfig, HedgeConfig, HilbertConfig,
    RankingConfig,
};
