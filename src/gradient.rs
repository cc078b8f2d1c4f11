//! t-SNE gradient calculation.
//!
//! Low-dimensional affinities use the heavy-tailed Student-t kernel
//! `q_ij = 1 / (1 + ‖y_i − y_j‖²)`, normalized over all ordered pairs. The
//! gradient attracts points whose high-dimensional affinity `P_ij` exceeds
//! their low-dimensional affinity `Q_ij` and repels the others:
//!
//! `grad_i = Σ_j (P_ij − Q_ij) · q_ij · (y_i − y_j)`
//!
//! No constant factor is applied to the sum. The derivative of the KL
//! divergence is four times this value; the learning rate absorbs the
//! difference.

use crate::distance::array_squared_distance;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use tracing::warn;

/// Unnormalized Student-t kernel values and their sum over ordered pairs.
#[derive(Clone, Debug)]
pub struct LowDimAffinities {
    /// `q_ij = 1 / (1 + ‖y_i − y_j‖²)` for `i != j`, zero on the diagonal
    pub kernel: Array2<f64>,

    /// `Z = Σ_{i≠j} q_ij`
    pub normalizer: f64,
}

/// Computes the Student-t kernel over all pairs of embedding points.
///
/// Rows are filled in parallel. Each row sum is accumulated sequentially and
/// the row sums are added in index order, so the normalizer does not depend
/// on thread scheduling.
pub fn student_t_affinities(y: ArrayView2<f64>) -> LowDimAffinities {
    let n = y.nrows();
    let mut kernel = Array2::zeros((n, n));

    let row_sums: Vec<f64> = kernel
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .map(|(i, mut row)| {
            let y_i = y.row(i);
            let mut sum = 0.0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let q = 1.0 / (1.0 + array_squared_distance(y_i, y.row(j)));
                row[j] = q;
                sum += q;
            }
            sum
        })
        .collect();

    LowDimAffinities {
        kernel,
        normalizer: row_sums.iter().sum(),
    }
}

/// Calculates the t-SNE gradient for the current embedding.
///
/// # Arguments
/// * `p` - Joint probability matrix of the input data, N × N
/// * `y` - Current embedding coordinates, N × dim
///
/// # Returns
/// An N × dim matrix holding the gradient for every coordinate. Fewer than
/// two points give a zero gradient.
pub fn tsne_grad(p: ArrayView2<f64>, y: ArrayView2<f64>) -> Array2<f64> {
    let (n, dim) = y.dim();
    let mut grad = Array2::zeros((n, dim));
    if n < 2 {
        return grad;
    }

    let LowDimAffinities { kernel, normalizer } = student_t_affinities(y);
    if normalizer <= 0.0 || !normalizer.is_finite() {
        warn!("Degenerate low-dimensional normalizer {normalizer}, skipping gradient");
        return grad;
    }

    grad.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut grad_i)| {
            for j in 0..n {
                if j == i {
                    continue;
                }
                let q = kernel[[i, j]];
                let mult = (p[[i, j]] - q / normalizer) * q;
                for d in 0..dim {
                    grad_i[d] += mult * (y[[i, d]] - y[[j, d]]);
                }
            }
        });

    grad
}

/// Kullback-Leibler divergence `KL(P ‖ Q)` of the current embedding.
///
/// Only entries with `P_ij > 0` contribute. Used for progress logging.
pub fn kl_divergence(p: ArrayView2<f64>, y: ArrayView2<f64>) -> f64 {
    let n = y.nrows();
    if n < 2 {
        return 0.0;
    }

    let LowDimAffinities { kernel, normalizer } = student_t_affinities(y);
    let mut kl = 0.0;
    for i in 0..n {
        for j in 0..n {
            let p_ij = p[[i, j]];
            if i == j || p_ij <= 0.0 {
                continue;
            }
            kl += p_ij * (p_ij / (kernel[[i, j]] / normalizer)).ln();
        }
    }
    kl
}
