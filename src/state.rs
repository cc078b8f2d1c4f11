//! Mutable optimization state for the low-dimensional embedding.

use ndarray::{Array2, ArrayView2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;

/// Half-width of the uniform range used for random initialization.
pub const INIT_RANGE: f64 = 10.0;

/// Coordinates, per-coordinate gains and per-coordinate momentum steps.
///
/// All three matrices are N × dim. Only the optimizer step mutates them.
#[derive(Clone, Debug)]
pub struct EmbeddingState {
    pub(crate) y: Array2<f64>,
    pub(crate) gains: Array2<f64>,
    pub(crate) steps: Array2<f64>,
}

impl EmbeddingState {
    /// Draws every coordinate independently and uniformly from
    /// `[-INIT_RANGE, INIT_RANGE)` using the supplied generator.
    pub fn random<R>(n: usize, dim: usize, rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        let y = Array2::random_using((n, dim), Uniform::new(-INIT_RANGE, INIT_RANGE), rng);
        Self::from_coordinates(y)
    }

    /// Starts from caller-provided coordinates, with unit gains and zero
    /// steps.
    pub fn from_coordinates(y: Array2<f64>) -> Self {
        let shape = y.dim();
        Self {
            y,
            gains: Array2::ones(shape),
            steps: Array2::zeros(shape),
        }
    }

    /// Current coordinates, one row per input vector.
    pub fn coordinates(&self) -> ArrayView2<f64> {
        self.y.view()
    }

    /// Current adaptive gains.
    pub fn gains(&self) -> ArrayView2<f64> {
        self.gains.view()
    }

    /// Update applied to each coordinate by the previous step.
    pub fn steps(&self) -> ArrayView2<f64> {
        self.steps.view()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.y.nrows()
    }

    /// Whether the state holds no points.
    pub fn is_empty(&self) -> bool {
        self.y.nrows() == 0
    }

    /// Output dimensionality.
    pub fn dimensions(&self) -> usize {
        self.y.ncols()
    }

    /// Consumes the state, returning the coordinates.
    pub fn into_coordinates(self) -> Array2<f64> {
        self.y
    }
}
