// crates/contextcache/src/sfc.rs
// Space-filling-curve indexer (spec 4.2): project -> quantize -> Hilbert distance.

use moka::sync::Cache;
use std::sync::OnceLock;

/// A deterministic Gaussian random projection matrix, `d_h` rows of `input_dim`
/// columns each, every row L2-normalized. Generated from a Box-Muller transform
/// fed by a linear congruential generator seeded deterministically, so the
/// same `(input_dim, d_h, seed)` always yields byte-identical coefficients.
#[derive(Debug, Clone)]
struct ProjectionMatrix {
    rows: Vec<Vec<f64>>,
}

impl ProjectionMatrix {
    fn generate(input_dim: usize, d_h: usize, seed: u64) -> Self {
        let mut lcg = Lcg::new(seed);
        let mut rows = Vec::with_capacity(d_h);
        for _ in 0..d_h {
            let mut row: Vec<f64> = (0..input_dim).map(|_| lcg.next_gaussian()).collect();
            let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                for v in row.iter_mut() {
                    *v /= norm;
                }
            }
            rows.push(row);
        }
        Self { rows }
    }

    fn project(&self, vec: &[f32]) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(vec.iter())
                    .map(|(r, v)| r * (*v as f64))
                    .sum::<f64>()
            })
            .collect()
    }
}

/// A minimal linear congruential generator (Numerical Recipes constants),
/// paired with a Box-Muller transform to produce standard-normal samples.
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed ^ 0x5DEECE66D }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn next_unit(&mut self) -> f64 {
        // Top 53 bits give a uniform double in [0, 1).
        ((self.next_u64() >> 11) as f64) / ((1u64 << 53) as f64)
    }

    fn next_gaussian(&mut self) -> f64 {
        // Box-Muller, discarding the paired cosine sample for simplicity;
        // determinism only requires a fixed sequence, not maximal entropy use.
        let u1 = self.next_unit().max(f64::MIN_POSITIVE);
        let u2 = self.next_unit();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

fn matrix_cache() -> &'static Cache<(usize, usize, u64), std::sync::Arc<ProjectionMatrix>> {
    static CACHE: OnceLock<Cache<(usize, usize, u64), std::sync::Arc<ProjectionMatrix>>> =
        OnceLock::new();
    CACHE.get_or_init(|| Cache::builder().max_capacity(64).build())
}

fn projection_matrix(input_dim: usize, d_h: usize, seed: u64) -> std::sync::Arc<ProjectionMatrix> {
    let key = (input_dim, d_h, seed);
    matrix_cache().get_with(key, || {
        std::sync::Arc::new(ProjectionMatrix::generate(input_dim, d_h, seed))
    })
}

/// Quantize a projected coordinate in `[-1, 1]` into `[0, 2^bits - 1]`.
fn quantize(value: f64, bits: u32) -> u64 {
    let clamped = ((value + 1.0) / 2.0).clamp(0.0, 1.0);
    let max = (1u64 << bits) - 1;
    (clamped * max as f64).round() as u64
}

/// Compute the 1-D Hilbert distance of a `d`-dimensional integer point on a
/// `2^bits`-per-side hypercube, via the standard Hilbert-curve "rotate and
/// reflect" transform applied from the most-significant bit down.
fn hilbert_distance(mut point: Vec<u64>, bits: u32) -> u64 {
    let d = point.len();
    let n = 1u64 << bits;

    // Convert to Hilbert-curve-compatible coordinates (Gray-code-like transform).
    let mut bit = n >> 1;
    while bit > 0 {
        for i in 0..d {
            if point[i] & bit != 0 {
                point[0] ^= bit - 1;
            } else {
                let t = (point[0] ^ point[i]) & (bit - 1);
                point[0] ^= t;
                point[i] ^= t;
            }
        }
        bit >>= 1;
    }

    // Gray encode.
    for i in 1..d {
        point[i] ^= point[i - 1];
    }
    let mut t = 0u64;
    let mut bit = n >> 1;
    while bit > 1 {
        if point[d - 1] & bit != 0 {
            t ^= bit - 1;
        }
        bit >>= 1;
    }
    for v in point.iter_mut() {
        *v ^= t;
    }

    // Interleave bits into the final distance, most significant dimension bit first.
    let mut distance = 0u64;
    for b in (0..bits).rev() {
        for (i, &v) in point.iter().enumerate() {
            distance = (distance << 1) | ((v >> b) & 1);
            let _ = i;
        }
    }
    distance
}

/// Configuration needed to compute a Hilbert index, mirroring `HilbertConfig`
/// without pulling in the `config` module as a hard dependency.
#[derive(Debug, Clone, Copy)]
pub struct SfcParams {
    pub dims: usize,
    pub bits: u32,
    pub seed: u64,
}

impl Default for SfcParams {
    fn default() -> Self {
        Self {
            dims: 8,
            bits: 12,
            seed: 1337,
        }
    }
}

/// `hilbert_index(vec) -> i64`. Callers gate on `HILBERT_ENABLED` themselves
/// (returning `None` when disabled is the caller's responsibility per spec
/// 4.2); this function always computes the index when called.
///
/// Panics only if `dims * bits > 63`; callers must validate configuration
/// at startup (see `EnvConfig::validate`) rather than on the hot path.
pub fn hilbert_index(vec: &[f32], params: SfcParams) -> i64 {
    assert!(
        params.dims as u32 * params.bits <= 63,
        "hilbert dims*bits must fit in 63 bits"
    );
    let matrix = projection_matrix(vec.len(), params.dims, params.seed);
    let projected = matrix.project(vec);
    let quantized: Vec<u64> = projected.iter().map(|v| quantize(*v, params.bits)).collect();
    hilbert_distance(quantized, params.bits) as i64
}
