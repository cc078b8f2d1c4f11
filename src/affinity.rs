//! Perplexity-calibrated affinities in the high-dimensional space.
//!
//! Each point `i` gets a Gaussian-style conditional distribution over its
//! neighbors, `P(j|i) ∝ exp(-d_ij · β_i)`, where the precision `β_i` is
//! found by binary search so that the distribution's Shannon entropy
//! matches `ln(perplexity)`. The conditional rows are then symmetrized into
//! the joint matrix `P` that the optimizer tries to reproduce:
//!
//! `P_ij = (P(j|i) + P(i|j)) / (2N)`
//!
//! Every conditional row sums to one, so the joint matrix is symmetric,
//! non-negative and has total mass one. The computation involves no
//! randomness.

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use tracing::{debug, warn};

/// Number of entropy evaluations allowed per row.
pub const MAX_SEARCH_STEPS: usize = 50;

/// Entropy difference at which the search for a row stops early.
pub const ENTROPY_TOLERANCE: f64 = 1e-5;

/// Probabilities are floored to this value before taking logarithms.
const PROBABILITY_FLOOR: f64 = 1e-12;

/// Computes the row-normalized conditional probabilities `P(j|i)`.
///
/// # Arguments
/// * `distances` - Symmetric N × N matrix of squared distances
/// * `perplexity` - Target effective number of neighbors per point
///
/// # Returns
/// An N × N matrix whose row `i` holds `P(j|i)`; each row sums to one and
/// the diagonal is zero. For N < 2 the result is all zeros.
#[allow(clippy::cast_precision_loss)]
pub fn conditional_probabilities(distances: ArrayView2<f64>, perplexity: f64) -> Array2<f64> {
    let n = distances.nrows();
    let mut conditional = Array2::zeros((n, n));
    if n < 2 {
        return conditional;
    }

    let target_entropy = perplexity.ln();

    let betas: Vec<f64> = conditional
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .map(|(i, row)| calibrate_row(distances.row(i), i, target_entropy, row))
        .collect();

    let mean_sigma = betas.iter().map(|beta| (1.0 / beta).sqrt()).sum::<f64>() / n as f64;
    debug!("Mean value of sigma: {mean_sigma}");

    conditional
}

/// Symmetrizes conditional probabilities into the joint matrix `P`.
///
/// `P_ij = (P(j|i) + P(i|j)) / (2N)` for `i != j`; the diagonal is zero.
#[allow(clippy::cast_precision_loss)]
pub fn joint_probabilities(conditional: ArrayView2<f64>) -> Array2<f64> {
    let n = conditional.nrows();
    let scale = 2.0 * n as f64;

    Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j {
            0.0
        } else {
            (conditional[[i, j]] + conditional[[j, i]]) / scale
        }
    })
}

/// Builds the joint probability matrix for a distance matrix and perplexity.
pub fn calibrate(distances: ArrayView2<f64>, perplexity: f64) -> Array2<f64> {
    let conditional = conditional_probabilities(distances, perplexity);
    joint_probabilities(conditional.view())
}

/// Binary search for the precision of row `i`, writing the resulting
/// distribution into `row`.
///
/// The bounds start unbounded on both sides. While an upper bound is
/// missing, a too-flat distribution doubles `β`; while a lower bound is
/// missing, a too-peaked one halves it. Once bracketed, `β` moves to the
/// midpoint. A row whose exponentials all underflow always pushes `β` down,
/// whatever the target entropy.
///
/// If the search ends on a row without mass, the row is rebuilt from the
/// largest `β` that still had mass. Only a row that never had mass falls
/// back to the uniform distribution.
///
/// # Returns
/// The precision `β_i` that produced the written row.
fn calibrate_row(
    distances: ArrayView1<f64>,
    i: usize,
    target_entropy: f64,
    mut row: ArrayViewMut1<f64>,
) -> f64 {
    let mut beta = 1.0;
    let mut lower: Option<f64> = None;
    let mut upper: Option<f64> = None;
    let mut mass = 0.0;
    let mut row_beta = beta;

    for _ in 0..MAX_SEARCH_STEPS {
        row_beta = beta;
        mass = fill_row(distances, i, beta, &mut row);
        if mass <= 0.0 {
            upper = Some(beta);
            beta = match lower {
                None => beta / 2.0,
                Some(lower) => (beta + lower) / 2.0,
            };
            continue;
        }

        row.mapv_inplace(|p| p / mass);
        let entropy = row_entropy(row.view());

        if (entropy - target_entropy).abs() < ENTROPY_TOLERANCE {
            break;
        }

        if entropy > target_entropy {
            lower = Some(beta);
            beta = match upper {
                None => beta * 2.0,
                Some(upper) => (beta + upper) / 2.0,
            };
        } else {
            upper = Some(beta);
            beta = match lower {
                None => beta / 2.0,
                Some(lower) => (beta + lower) / 2.0,
            };
        }
    }

    if mass > 0.0 {
        return row_beta;
    }

    // `lower` is only ever set from a row that had mass.
    if let Some(lower) = lower {
        let mass = fill_row(distances, i, lower, &mut row);
        if mass > 0.0 {
            row.mapv_inplace(|p| p / mass);
            return lower;
        }
    }

    warn!(
        "Row {} has no probability mass after {} search steps, using a uniform row",
        i, MAX_SEARCH_STEPS
    );
    fill_uniform(i, &mut row);
    row_beta
}

/// Writes unnormalized `exp(-d_ij · β)` into `row` (zero at `i`) and
/// returns their sum.
fn fill_row(distances: ArrayView1<f64>, i: usize, beta: f64, row: &mut ArrayViewMut1<f64>) -> f64 {
    let mut mass = 0.0;
    for (j, (p, &d)) in row.iter_mut().zip(distances.iter()).enumerate() {
        if j == i {
            *p = 0.0;
            continue;
        }
        *p = (-d * beta).exp();
        mass += *p;
    }
    mass
}

/// Shannon entropy (natural log) of a normalized row.
fn row_entropy(row: ArrayView1<f64>) -> f64 {
    row.iter()
        .map(|&p| -p * p.max(PROBABILITY_FLOOR).ln())
        .sum()
}

#[allow(clippy::cast_precision_loss)]
fn fill_uniform(i: usize, row: &mut ArrayViewMut1<f64>) {
    let share = 1.0 / (row.len() - 1) as f64;
    for (j, p) in row.iter_mut().enumerate() {
        *p = if j == i { 0.0 } else { share };
    }
}
