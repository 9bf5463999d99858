//! Cosine similarity over unit vectors, best target per input row, and
//! threshold classification.
//!
//! Inputs and targets are stacked into `ndarray` matrices and multiplied in
//! chunks of [`CHUNK_ROWS`] input rows, which bounds the score matrix held in
//! memory to `CHUNK_ROWS × N_targets`.

use ndarray::{Array2, ArrayView1, Axis};

use crate::embedding::EmbeddingVector;
use crate::error::ConfigError;
use crate::matching::types::MatchResult;
use crate::text::TextItem;

/// Input rows scored per matrix product.
pub const CHUNK_ROWS: usize = 1024;

/// Scores this close to a row's maximum count as tied.
pub const TIE_TOLERANCE: f64 = 1e-9;

/// Best target for one input row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    /// Position in the target matrix (and target item slice).
    pub target_index: usize,
    pub score: f64,
}

/// Stack vectors into an `N × dimensions` matrix.
pub fn to_matrix(vectors: &[EmbeddingVector], dimensions: usize) -> Result<Array2<f32>, ConfigError> {
    let mut flat = Vec::with_capacity(vectors.len() * dimensions);
    for vector in vectors {
        if vector.dimensions() != dimensions {
            return Err(ConfigError::DimensionMismatch {
                expected: dimensions,
                actual: vector.dimensions(),
            });
        }
        flat.extend_from_slice(&vector.values);
    }
    Array2::from_shape_vec((vectors.len(), dimensions), flat).map_err(|_| {
        ConfigError::DimensionMismatch {
            expected: dimensions,
            actual: 0,
        }
    })
}

/// Highest-scoring target for every input row, `None` when there are no targets.
pub fn best_matches(
    inputs: &Array2<f32>,
    targets: &Array2<f32>,
) -> Result<Vec<Option<BestMatch>>, ConfigError> {
    if inputs.ncols() != targets.ncols() {
        return Err(ConfigError::DimensionMismatch {
            expected: targets.ncols(),
            actual: inputs.ncols(),
        });
    }
    if targets.nrows() == 0 {
        return Ok(vec![None; inputs.nrows()]);
    }

    let targets_t = targets.t();
    let mut best = Vec::with_capacity(inputs.nrows());
    for chunk in inputs.axis_chunks_iter(Axis(0), CHUNK_ROWS) {
        let scores = chunk.dot(&targets_t);
        best.extend(scores.rows().into_iter().map(best_in_row));
    }
    Ok(best)
}

/// Lowest index among the scores within [`TIE_TOLERANCE`] of the maximum.
fn best_in_row(row: ArrayView1<'_, f32>) -> Option<BestMatch> {
    let max = row
        .iter()
        .map(|&s| s as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    row.iter()
        .position(|&s| s as f64 >= max - TIE_TOLERANCE)
        .map(|target_index| BestMatch {
            target_index,
            score: (row[target_index] as f64).clamp(-1.0, 1.0),
        })
}

/// Build one [`MatchResult`] per input item. `best[i]` belongs to `inputs[i]`.
pub fn classify(
    inputs: &[TextItem],
    best: &[Option<BestMatch>],
    targets: &[TextItem],
    threshold: f64,
) -> Vec<MatchResult> {
    inputs
        .iter()
        .zip(best)
        .map(|(input, best)| {
            let target = best.and_then(|b| targets.get(b.target_index).map(|t| (b.score, t)));
            match target {
                Some((score, target)) => MatchResult {
                    input_row_id: input.row_id,
                    best_target_row_id: Some(target.row_id),
                    similarity_score: score,
                    is_match: score >= threshold,
                    target_text: Some(target.raw_text.clone()),
                },
                None => unmatched(input.row_id),
            }
        })
        .collect()
}

/// Result for a row that has no candidate at all.
pub fn unmatched(input_row_id: usize) -> MatchResult {
    MatchResult {
        input_row_id,
        best_target_row_id: None,
        similarity_score: 0.0,
        is_match: false,
        target_text: None,
    }
}
