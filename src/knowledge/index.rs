//! In-process flat vector index.

use std::ops::Range;

use ndarray::ArrayView1;

use crate::core::errors::EngineError;

/// Append-only flat index over L2-normalized vectors.
///
/// Positions are assigned monotonically and never reused; a deleted
/// chunk's vector stays at its old position and is simply never resolved
/// again once its position row is gone. Scores are inner products, which
/// equal cosine similarity when both sides are normalized.
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Append vectors, returning the position range they occupy.
    /// Nothing is appended unless every vector matches the index
    /// dimension.
    pub fn add(&mut self, vectors: Vec<Vec<f32>>) -> Result<Range<usize>, EngineError> {
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(EngineError::BadRequest(format!(
                    "vector dimension {} does not match index dimension {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }

        let start = self.vectors.len();
        self.vectors.extend(vectors);
        Ok(start..self.vectors.len())
    }

    /// Return up to `k` `(score, position)` pairs by descending inner
    /// product against `query`.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(f32, usize)> {
        if query.len() != self.dimension || self.vectors.is_empty() || k == 0 {
            return Vec::new();
        }

        let query = ArrayView1::from(query);
        let mut scored: Vec<(f32, usize)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| {
                (ArrayView1::from(vector.as_slice()).dot(&query), position)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// Scale a vector to unit L2 norm. Zero vectors are returned unchanged.
pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let view = ArrayView1::from(vector.as_slice());
    let norm = view.dot(&view).sqrt();
    if norm <= f32::EPSILON {
        return vector;
    }
    for v in &mut vector {
        *v /= norm;
    }
    vector
}
