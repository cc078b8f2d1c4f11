//! Squared Euclidean distances over the high-dimensional input vectors.
//!
//! This module validates the caller's vectors and builds the dense pairwise
//! distance matrix that the probability calibration consumes. It includes
//! functions for:
//!
//! - Converting an ordered slice of vectors into a matrix, checking that all
//!   vectors share one dimension
//! - Computing squared Euclidean distances between vectors using SIMD
//! - Building the full symmetric N × N distance matrix in parallel

use crate::TsneError;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use tracing::warn;
use wide::f64x4;

/// Copies an ordered sequence of vectors into an N × D matrix.
///
/// # Arguments
/// * `vectors` - Input vectors in caller order; row `i` of the result is
///   `vectors[i]`
///
/// # Errors
/// * `TsneError::InsufficientData` - Fewer than two vectors
/// * `TsneError::EmptyVectors` - The first vector has no components
/// * `TsneError::DimensionMismatch` - A vector's length differs from the
///   first vector's length
/// * `TsneError::NonFiniteInput` - A component is NaN or infinite
pub fn vectors_to_array<V>(vectors: &[V]) -> Result<Array2<f64>, TsneError>
where
    V: AsRef<[f64]>,
{
    let n = vectors.len();
    if n < 2 {
        return Err(TsneError::InsufficientData { n });
    }

    let dim = vectors[0].as_ref().len();
    if dim == 0 {
        return Err(TsneError::EmptyVectors);
    }

    if let Some((index, vector)) = vectors
        .iter()
        .enumerate()
        .find(|(_, v)| v.as_ref().len() != dim)
    {
        return Err(TsneError::DimensionMismatch {
            index,
            expected: dim,
            actual: vector.as_ref().len(),
        });
    }

    let mut x = Array2::zeros((n, dim));
    for (mut row, vector) in x.rows_mut().into_iter().zip(vectors) {
        row.assign(&ArrayView1::from(vector.as_ref()));
    }

    if let Some((row, column)) = first_non_finite(x.view()) {
        return Err(TsneError::NonFiniteInput { row, column });
    }

    Ok(x)
}

/// Position of the first NaN or infinite entry of `x`, in row-major order.
pub(crate) fn first_non_finite(x: ArrayView2<f64>) -> Option<(usize, usize)> {
    x.indexed_iter()
        .find(|(_, value)| !value.is_finite())
        .map(|(position, _)| position)
}

/// Computes the symmetric matrix of squared Euclidean distances between all
/// rows of `x`.
///
/// The upper triangle is filled in parallel, one row per task, and then
/// mirrored, so `d[[i, j]]` and `d[[j, i]]` are bit-identical. The diagonal
/// is zero.
pub fn pairwise_squared_distances(x: ArrayView2<f64>) -> Array2<f64> {
    let n = x.nrows();
    let mut distances = Array2::zeros((n, n));

    distances
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let x_i = x.row(i);
            for j in (i + 1)..n {
                row[j] = array_squared_distance(x_i, x.row(j));
            }
        });

    for i in 1..n {
        for j in 0..i {
            distances[[i, j]] = distances[[j, i]];
        }
    }

    distances
}

/// Computes the squared Euclidean distance between vectors using SIMD
/// operations.
///
/// Processes vectors in chunks of 4 elements using SIMD instructions and
/// handles the remaining elements sequentially.
///
/// # Arguments
/// * `a` - First vector
/// * `b` - Second vector
///
/// # Panics
/// * In debug builds, if vectors have different lengths
pub fn simd_squared_euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(4);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(4);
    let b_remainder = b_chunks.remainder();

    let mut sum_sq = f64x4::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        let a_lanes = f64x4::from([a_chunk[0], a_chunk[1], a_chunk[2], a_chunk[3]]);
        let b_lanes = f64x4::from([b_chunk[0], b_chunk[1], b_chunk[2], b_chunk[3]]);
        let diff = a_lanes - b_lanes;
        sum_sq += diff * diff;
    }

    let mut total_sum_sq: f64 = sum_sq.as_array_ref().iter().sum();

    for (a, b) in a_remainder.iter().zip(b_remainder) {
        let diff = a - b;
        total_sum_sq += diff * diff;
    }

    total_sum_sq
}

/// Computes the squared Euclidean distance between array views with an
/// optimized path for contiguous data.
///
/// Non-contiguous views are copied before the SIMD kernel runs.
pub fn array_squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    match (a.as_slice(), b.as_slice()) {
        (Some(a), Some(b)) => simd_squared_euclidean_distance(a, b),
        (Some(a), None) => {
            warn!("b is non-contiguous, requiring allocation to compute distance");
            simd_squared_euclidean_distance(a, &b.to_vec())
        }
        (None, Some(b)) => {
            warn!("a is non-contiguous, requiring allocation to compute distance");
            simd_squared_euclidean_distance(&a.to_vec(), b)
        }
        (None, None) => {
            warn!("both a and b are non-contiguous, requiring allocation to compute distance");
            simd_squared_euclidean_distance(&a.to_vec(), &b.to_vec())
        }
    }
}
