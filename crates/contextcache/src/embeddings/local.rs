// crates/contextcache/src/embeddings/local.rs
// Local deterministic embedding backend (spec 4.1).
//
// Seeds a hash chain with `sha256("fallback:" + model + ":" + text)`,
// repeatedly rehashes, extracts 16-bit big-endian words, maps each to
// `[-1, 1]`, then L2-normalizes. Used directly when `EMBEDDING_PROVIDER=local`
// and as the silent fallback for every remote backend failure.

use sha2::{Digest, Sha256};

/// Deterministic embedding: identical `(text, model, dims)` always yields the
/// same vector. Empty/whitespace input yields an exact zero vector — the one
/// permitted non-unit-norm output (spec 4.1).
pub fn embed_local(text: &str, model: &str, dims: usize) -> Vec<f32> {
    if text.trim().is_empty() {
        return vec![0.0; dims];
    }

    let mut words: Vec<u16> = Vec::with_capacity(dims);
    let mut seed = format!("fallback:{model}:{text}").into_bytes();
    while words.len() < dims {
        let digest = Sha256::digest(&seed);
        for chunk in digest.chunks_exact(2) {
            if words.len() >= dims {
                break;
            }
            words.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        seed = digest.to_vec();
    }

    let mut vec: Vec<f32> = words
        .into_iter()
        .map(|w| (w as f32) / 32767.5 - 1.0)
        .collect();
    l2_normalize(&mut vec);
    vec
}

/// Normalize in place to unit L2 norm. No-op on an all-zero vector.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v = (*v as f64 / norm) as f32;
        }
    }
}

/// Truncate or zero-pad `vec` to exactly `dims` entries.
pub fn resize_to_dims(mut vec: Vec<f32>, dims: usize) -> Vec<f32> {
    vec.resize(dims, 0.0);
    vec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_input() {
        let a = embed_local("hello world", "text-embedding-3-small", 1536);
        let b = embed_local("hello world", "text-embedding-3-small", 1536);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_by_model() {
        let a = embed_local("hello world", "model-a", 32);
        let b = embed_local("hello world", "model-b", 32);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_text_yields_zero_vector() {
        let v = embed_local("   ", "m", 16);
        assert_eq!(v, vec![0.0f32; 16]);
    }

    #[test]
    fn non_empty_text_is_unit_norm() {
        let v = embed_local("some content to embed", "m", 128);
        let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6, "norm was {norm}");
    }

    #[test]
    fn produces_requested_dimensionality() {
        let v = embed_local("x", "m", 777);
        assert_eq!(v.len(), 777);
    }
}
