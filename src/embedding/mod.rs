//! Text embedding adapters.
//!
//! Both implementations return unit-normalized vectors of the configured
//! dimension, suitable for cosine similarity. Retrieval treats embedding
//! failure as "no memories" — the turn continues.

pub mod local;
pub mod remote;

use async_trait::async_trait;

use crate::error::Result;

pub use local::LocalEmbedder;
pub use remote::RemoteEmbedder;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output dimension (D).
    fn dim(&self) -> usize;
}

/// Normalize a vector to unit length in place. Zero vectors are left as-is.
pub(crate) fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_untouched() {
        let mut v = vec![0.0, 0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }
}
