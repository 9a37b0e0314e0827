// crates/contextcache/src/ranking.rs
// Hybrid ranker (spec 4.7): fuses lexical, vector, and recency scores into a
// single deterministic ranking with a full per-candidate trace.
//
// Two modes, per SPEC_FULL 11 (grounded in the original source's two
// ranking implementations, `analyzer/algorithm.py` and `analyzer/core.py`):
// `rank_hybrid` is the store-backed fusion used by the recall dispatcher;
// `rank_local` is the type-prior-boosted variant used to score an in-memory
// batch of candidates without a store round-trip.

use chrono::{DateTime, Utc};
use contextcache_types::MemoryType;
use std::collections::HashMap;

/// Per-candidate score breakdown, always recorded — including for candidates
/// dropped by the `limit` cutoff (spec 4.7 step 6).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoreTrace {
    pub fts: f64,
    pub vector: f64,
    pub recency: f64,
    pub total: f64,
}

/// Weights for the fusion step. Must be non-negative; they are not required
/// to sum to 1 (spec 4.7 step 4).
#[derive(Debug, Clone, Copy)]
pub struct RankWeights {
    pub fts: f64,
    pub vector: f64,
    pub recency: f64,
    pub half_life_days: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            fts: 0.45,
            vector: 0.40,
            recency: 0.15,
            half_life_days: 14.0,
        }
    }
}

/// Normalize a score map to `[0, 1]` by dividing by the maximum positive
/// value. If every value is <= 0, every candidate contributes 0 in that
/// channel (spec 4.7 step 2 / testable property 5).
fn normalize(scores: &HashMap<i64, f64>) -> HashMap<i64, f64> {
    let max = scores.values().cloned().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return scores.keys().map(|id| (*id, 0.0)).collect();
    }
    scores.iter().map(|(id, v)| (*id, (v / max).max(0.0))).collect()
}

fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    let age_seconds = (now - created_at).num_seconds().max(0) as f64;
    let age_days = age_seconds / 86_400.0;
    (-std::f64::consts::LN_2 * age_days / half_life_days).exp()
}

/// `rank(candidates_lex, candidates_vec, created_at, weights, limit) ->
/// (ranked_ids, trace)` (spec 4.7).
///
/// Determinism (spec 8 property 4): given the same inputs, returns
/// byte-identical output. Tie-break is `(-total, -id)` — highest score
/// first, most recently inserted id breaks ties (spec 4.7 step 5).
pub fn rank_hybrid(
    candidates_lex: &HashMap<i64, f64>,
    candidates_vec: &HashMap<i64, f64>,
    created_at: &HashMap<i64, DateTime<Utc>>,
    weights: RankWeights,
    now: DateTime<Utc>,
    limit: usize,
) -> (Vec<i64>, HashMap<i64, ScoreTrace>) {
    let norm_lex = normalize(candidates_lex);
    let norm_vec = normalize(candidates_vec);

    let mut ids: Vec<i64> = candidates_lex.keys().chain(candidates_vec.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut trace = HashMap::with_capacity(ids.len());
    for id in &ids {
        let fts = *norm_lex.get(id).unwrap_or(&0.0);
        let vector = *norm_vec.get(id).unwrap_or(&0.0);
        let recency = created_at
            .get(id)
            .map(|ts| recency_score(*ts, now, weights.half_life_days))
            .unwrap_or(0.0);
        let total = weights.fts * fts + weights.vector * vector + weights.recency * recency;
        trace.insert(
            *id,
            ScoreTrace {
                fts,
                vector,
                recency,
                total,
            },
        );
    }

    let mut ordered = ids;
    ordered.sort_unstable_by(|a, b| {
        let ta = trace[a].total;
        let tb = trace[b].total;
        tb.partial_cmp(&ta)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.cmp(a))
    });
    ordered.truncate(limit);

    (ordered, trace)
}

/// A candidate as seen by the lightweight local ranker: no store round-trip,
/// just an in-memory slice (SPEC_FULL 11).
#[derive(Debug, Clone)]
pub struct LocalCandidate {
    pub id: i64,
    pub memory_type: MemoryType,
    pub fts: f64,
    pub vector: f64,
    pub created_at: DateTime<Utc>,
}

/// Type-prior boost term, added before the fusion sort (spec 4.7): `priority
/// / 10 * 0.05`.
pub fn type_prior_boost(memory_type: MemoryType) -> f64 {
    (memory_type.priority() as f64 / 10.0) * 0.05
}

/// `rank_local`: the type-prior-boosted ranker used to score an in-memory
/// batch of candidates (e.g. before persistence, or for offline scoring)
/// without going through the store's lexical/vector retrievers.
pub fn rank_local(
    candidates: &[LocalCandidate],
    weights: RankWeights,
    now: DateTime<Utc>,
    limit: usize,
) -> (Vec<i64>, HashMap<i64, ScoreTrace>) {
    let lex: HashMap<i64, f64> = candidates.iter().map(|c| (c.id, c.fts)).collect();
    let vec_scores: HashMap<i64, f64> = candidates.iter().map(|c| (c.id, c.vector)).collect();
    let created: HashMap<i64, DateTime<Utc>> =
        candidates.iter().map(|c| (c.id, c.created_at)).collect();
    let types: HashMap<i64, MemoryType> = candidates.iter().map(|c| (c.id, c.memory_type)).collect();

    let norm_lex = normalize(&lex);
    let norm_vec = normalize(&vec_scores);

    let mut ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut trace = HashMap::with_capacity(ids.len());
    for id in &ids {
        let fts = *norm_lex.get(id).unwrap_or(&0.0);
        let vector = *norm_vec.get(id).unwrap_or(&0.0);
        let recency = created
            .get(id)
            .map(|ts| recency_score(*ts, now, weights.half_life_days))
            .unwrap_or(0.0);
        let boost = types.get(id).map(|t| type_prior_boost(*t)).unwrap_or(0.0);
        let total = weights.fts * fts + weights.vector * vector + weights.recency * recency + boost;
        trace.insert(
            *id,
            ScoreTrace {
                fts,
                vector,
                recency,
                total,
            },
        );
    }

    let mut ordered = ids;
    ordered.sort_unstable_by(|a, b| {
        let ta = trace[a].total;
        let tb = trace[b].total;
        tb.partial_cmp(&ta)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.cmp(a))
    });
    ordered.truncate(limit);

    (ordered, trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(days_ago: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(days_ago)
    }

    #[test]
    fn normalization_law_all_nonpositive_contributes_zero() {
        let now = Utc::now();
        let lex: HashMap<i64, f64> = [(1, -1.0), (2, 0.0)].into_iter().collect();
        let vecs: HashMap<i64, f64> = HashMap::new();
        let created: HashMap<i64, DateTime<Utc>> = [(1, now), (2, now)].into_iter().collect();
        let (_, trace) = rank_hybrid(&lex, &vecs, &created, RankWeights::default(), now, 10);
        assert_eq!(trace[&1].fts, 0.0);
        assert_eq!(trace[&2].fts, 0.0);
    }

    #[test]
    fn higher_total_ranks_first() {
        let now = Utc::now();
        let lex: HashMap<i64, f64> = [(1, 1.0), (2, 0.1)].into_iter().collect();
        let vecs: HashMap<i64, f64> = HashMap::new();
        let created: HashMap<i64, DateTime<Utc>> = [(1, ts(1, now)), (2, ts(1, now))].into_iter().collect();
        let (ranked, trace) = rank_hybrid(&lex, &vecs, &created, RankWeights::default(), now, 10);
        assert_eq!(ranked[0], 1);
        assert!(trace[&1].total > trace[&2].total);
    }

    #[test]
    fn tie_break_prefers_higher_id() {
        let now = Utc::now();
        let lex: HashMap<i64, f64> = [(10, 1.0), (20, 1.0)].into_iter().collect();
        let vecs: HashMap<i64, f64> = HashMap::new();
        let created: HashMap<i64, DateTime<Utc>> =
            [(10, ts(1, now)), (20, ts(1, now))].into_iter().collect();
        let (ranked, _) = rank_hybrid(&lex, &vecs, &created, RankWeights::default(), now, 10);
        assert_eq!(ranked[0], 20);
        assert_eq!(ranked[1], 10);
    }

    #[test]
    fn recency_decays_with_half_life() {
        let now = Utc::now();
        let fresh = recency_score(ts(0, now), now, 14.0);
        let half = recency_score(ts(14, now), now, 14.0);
        assert!((fresh - 1.0).abs() < 1e-9);
        assert!((half - 0.5).abs() < 1e-6);
    }

    #[test]
    fn determinism_same_inputs_same_output() {
        let now = Utc::now();
        let lex: HashMap<i64, f64> = [(1, 0.7), (2, 0.3), (3, 0.9)].into_iter().collect();
        let vecs: HashMap<i64, f64> = [(1, 0.2), (3, 0.5)].into_iter().collect();
        let created: HashMap<i64, DateTime<Utc>> =
            [(1, ts(1, now)), (2, ts(5, now)), (3, ts(2, now))].into_iter().collect();
        let weights = RankWeights::default();
        let (r1, t1) = rank_hybrid(&lex, &vecs, &created, weights, now, 10);
        let (r2, t2) = rank_hybrid(&lex, &vecs, &created, weights, now, 10);
        assert_eq!(r1, r2);
        for id in r1 {
            assert_eq!(t1[&id], t2[&id]);
        }
    }

    #[test]
    fn limit_truncates_but_trace_covers_all_candidates() {
        let now = Utc::now();
        let lex: HashMap<i64, f64> = [(1, 0.9), (2, 0.8), (3, 0.1)].into_iter().collect();
        let vecs: HashMap<i64, f64> = HashMap::new();
        let created: HashMap<i64, DateTime<Utc>> =
            [(1, now), (2, now), (3, now)].into_iter().collect();
        let (ranked, trace) = rank_hybrid(&lex, &vecs, &created, RankWeights::default(), now, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(trace.len(), 3, "trace records dropped candidates too");
    }

    #[test]
    fn local_ranker_applies_type_prior_boost() {
        let now = Utc::now();
        let candidates = vec![
            LocalCandidate {
                id: 1,
                memory_type: MemoryType::Note,
                fts: 0.5,
                vector: 0.0,
                created_at: now,
            },
            LocalCandidate {
                id: 2,
                memory_type: MemoryType::Decision,
                fts: 0.5,
                vector: 0.0,
                created_at: now,
            },
        ];
        let (ranked, _) = rank_local(&candidates, RankWeights::default(), now, 10);
        assert_eq!(ranked[0], 2, "decision type-prior should outrank note at equal fts");
    }
}
