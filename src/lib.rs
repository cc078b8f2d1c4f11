#![allow(clippy::multiple_crate_versions)]

//! # `tsne-embed`: t-SNE reduction for embedding visualization
//!
//! This crate reduces high-dimensional vectors, typically text embeddings,
//! to two or three coordinates for plotting. It implements exact t-SNE
//! (t-distributed Stochastic Neighbor Embedding): neighbor probabilities in
//! the input space are calibrated per point to a target perplexity, and a
//! low-dimensional layout is optimized so that its Student-t affinities
//! match them.
//!
//! ## Key Features
//!
//! - Per-point precision calibration by binary search on the row entropy
//! - Gradient descent with momentum and adaptive per-coordinate gains
//! - Step-by-step execution through an iterator, or a run loop with a
//!   progress callback and cooperative cancellation
//! - Pluggable random generator for reproducible layouts
//! - Optional snapshot capture of intermediate states
//! - A small in-memory vector store with cosine similarity search that feeds
//!   the engine and keeps the reduced coordinates next to each item
//!
//! ## Examples
//!
//! One-shot reduction:
//! ```rust,no_run
//! use ndarray::Array2;
//! use tsne_embed::{fit_transform, Configuration};
//!
//! let data: Array2<f64> = // ... load your embeddings
//! # Array2::zeros((100, 384));
//! let config = Configuration::builder().perplexity(10.0).build();
//! let embedding = fit_transform(data.view(), config).unwrap();
//! assert_eq!(embedding.coordinates.ncols(), 2);
//! ```
//!
//! Stepping manually with a seeded generator:
//! ```rust,no_run
//! use rand::SeedableRng;
//! use rand_pcg::Pcg64Mcg;
//! use tsne_embed::{Configuration, Tsne};
//!
//! let vectors = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]];
//! let tsne = Tsne::new(Configuration::builder().perplexity(2.0).num_iters(200).build());
//! tsne.initialize_with_rng(&vectors, &mut Pcg64Mcg::seed_from_u64(42)).unwrap();
//!
//! let mut steps = tsne.steps().unwrap();
//! while let Some(iteration) = steps.next() {
//!     // Yield to the host between iterations.
//!     let _ = (iteration, steps.state().coordinates());
//! }
//! ```
//!
//! Running with progress and cancellation:
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use tsne_embed::{Configuration, Tsne};
//!
//! # let vectors = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]];
//! let tsne = Tsne::new(Configuration::builder().perplexity(2.0).build());
//! tsne.initialize(&vectors).unwrap();
//!
//! let cancel = AtomicBool::new(false);
//! let embedding = tsne
//!     .run_with(&cancel, |current, total| println!("{current}/{total}"))
//!     .unwrap();
//! ```
//!
//! ## Configuration
//!
//! - `embedding_dimensions`: Output dimensionality (default: 2)
//! - `perplexity`: Effective neighborhood size, must be smaller than the
//!   number of points (default: 30)
//! - `num_iters`: Number of optimizer steps per run (default: 1000)
//! - `learning_rate`: Step size (default: 10)
//! - `initialization`: `Random(seed)` or `Value(coordinates)`
//! - `snapshots`: Optional iterations at which to copy the embedding
//! - `progress_interval`: Iterations between progress callbacks (default: 50)
//!
//! ## Implementation Notes
//!
//! - Exact O(N²) affinities: memory and time grow quadratically with the
//!   number of points, which suits a few hundred to a few thousand points
//! - Iteration count is the only stopping condition
//! - The gradient omits the factor 4 of the KL derivative; the default
//!   learning rate is tuned for that convention
//! - The embedding is not recentered between steps
//!
//! ## References
//!
//! [Visualizing Data using t-SNE](https://jmlr.org/papers/v9/vandermaaten08a.html).
//! van der Maaten, L., & Hinton, G. (2008).
//! Journal of Machine Learning Research, 9(86), 2579-2605.

pub mod affinity;
pub mod distance;
mod engine;
pub mod gradient;
mod runner;
mod state;
mod store;
pub mod update;

#[cfg(test)]
mod tests;

use crate::distance::first_non_finite;
use bon::Builder;
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

pub use crate::engine::Tsne;
pub use crate::runner::{Embedding, Steps};
pub use crate::state::EmbeddingState;
pub use crate::store::{cosine_similarity, Item, ItemId, SearchHit, StoreError, VectorStore};

/// Number of points above which the quadratic cost is reported.
const LARGE_SAMPLE_WARNING: usize = 1_000;

/// Configuration options for the t-SNE embedding process.
///
/// Controls initialization, calibration, optimization parameters, progress
/// reporting and snapshot capture. The momentum constant is fixed.
#[derive(Builder, Clone, Debug)]
pub struct Configuration {
    /// Number of dimensions in the output embedding space, typically 2 or 3
    #[builder(default = 2)]
    pub embedding_dimensions: usize,

    /// Target perplexity; must be positive and smaller than the number of
    /// points
    #[builder(default = 30.0)]
    pub perplexity: f64,

    /// Number of optimizer steps performed by each run
    #[builder(default = 1000)]
    pub num_iters: usize,

    /// Learning rate applied to the gain-scaled gradient
    #[builder(default = 10.0)]
    pub learning_rate: f64,

    /// Method for initializing the embedding coordinates
    #[builder(default)]
    pub initialization: Initialization,

    /// Optional iteration indices at which to save embedding states; `0` is
    /// the initial state
    pub snapshots: Option<Vec<usize>>,

    /// Number of completed iterations between progress callbacks; `0`
    /// reports only the final iteration
    #[builder(default = 50)]
    pub progress_interval: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            embedding_dimensions: 2,
            perplexity: 30.0,
            num_iters: 1000,
            learning_rate: 10.0,
            initialization: Initialization::default(),
            snapshots: None,
            progress_interval: 50,
        }
    }
}

/// Methods for initializing the embedding coordinates.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Initialization {
    /// Uniform draws in `[-10, 10)` with an optional seed; without a seed the
    /// generator is seeded from system entropy
    Random(Option<u64>),

    /// Use provided coordinate values, one row per input vector
    Value(Array2<f64>),
}

impl Default for Initialization {
    fn default() -> Self {
        Self::Random(None)
    }
}

/// Caps a perplexity at `n - 1` so that it is valid for `n` points.
///
/// Useful for small, growing collections where a fixed perplexity would
/// otherwise be rejected.
#[allow(clippy::cast_precision_loss)]
pub fn capped_perplexity(perplexity: f64, n: usize) -> f64 {
    perplexity.min(n.saturating_sub(1) as f64)
}

/// Reduces dimensionality of input data using t-SNE.
///
/// # Arguments
/// * `x` - Input data matrix where each row is a sample
/// * `config` - Configuration options controlling the embedding process
///
/// # Returns
/// The final embedding, with optional snapshots
///
/// # Errors
/// * `TsneError::InsufficientData` - Input has fewer than two samples
/// * `TsneError::EmptyVectors` - Input has zero columns
/// * `TsneError::NonFiniteInput` - Input contains NaN or infinite values
/// * `TsneError::InvalidPerplexity` - Perplexity is not in `(0, n)`
/// * `TsneError::InvalidLearningRate` - Learning rate is not positive
/// * `TsneError::InvalidEmbeddingDimensions` - Output dimension is zero
/// * `TsneError::InvalidInitialization` - Provided coordinates have the
///   wrong shape
/// * `TsneError::NonFiniteInitialization` - Provided coordinates contain NaN
///   or infinite values
pub fn fit_transform(x: ArrayView2<f64>, config: Configuration) -> Result<Embedding, TsneError> {
    let tsne = Tsne::new(config);
    tsne.initialize_array(x)?;
    tsne.run()
}

/// Checks a configuration against the input data.
///
/// Runs before any distance or probability computation.
fn validate(config: &Configuration, x: ArrayView2<f64>) -> Result<(), TsneError> {
    let (n, dim) = x.dim();
    if n < 2 {
        return Err(TsneError::InsufficientData { n });
    }

    if dim == 0 {
        return Err(TsneError::EmptyVectors);
    }

    if let Some((row, column)) = first_non_finite(x) {
        return Err(TsneError::NonFiniteInput { row, column });
    }

    if config.embedding_dimensions == 0 {
        return Err(TsneError::InvalidEmbeddingDimensions);
    }

    #[allow(clippy::cast_precision_loss)]
    let valid_perplexity = config.perplexity.is_finite()
        && config.perplexity > 0.0
        && config.perplexity < n as f64;
    if !valid_perplexity {
        return Err(TsneError::InvalidPerplexity {
            perplexity: config.perplexity,
            n,
        });
    }

    if !config.learning_rate.is_finite() || config.learning_rate <= 0.0 {
        return Err(TsneError::InvalidLearningRate(config.learning_rate));
    }

    if let Initialization::Value(y) = &config.initialization {
        let expected = [n, config.embedding_dimensions];
        if y.shape() != expected {
            return Err(TsneError::InvalidInitialization {
                expected,
                actual: y.shape().to_vec(),
            });
        }

        if let Some((row, column)) = first_non_finite(y.view()) {
            return Err(TsneError::NonFiniteInitialization { row, column });
        }
    }

    Ok(())
}

/// Errors that can occur during t-SNE embedding.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TsneError {
    /// Fewer than two input vectors
    #[error("At least two vectors are required, got {n}")]
    InsufficientData {
        /// Number of vectors provided
        n: usize,
    },

    /// Input vectors have no components
    #[error("Input vectors must have at least one dimension")]
    EmptyVectors,

    /// An input vector's length differs from the first vector's length
    #[error("Vector {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        /// Position of the offending vector
        index: usize,
        /// Dimension of the first vector
        expected: usize,
        /// Dimension of the offending vector
        actual: usize,
    },

    /// Perplexity is not a finite value in `(0, n)`
    #[error("Perplexity {perplexity} must be positive and smaller than the number of points ({n})")]
    InvalidPerplexity {
        /// Configured perplexity
        perplexity: f64,
        /// Number of points
        n: usize,
    },

    /// Learning rate is not a finite positive value
    #[error("Learning rate {0} must be finite and positive")]
    InvalidLearningRate(f64),

    /// An input component is NaN or infinite
    #[error("Input vector {row} has a non-finite component at position {column}")]
    NonFiniteInput {
        /// Position of the offending vector
        row: usize,
        /// Position of the component within the vector
        column: usize,
    },

    /// Output dimension is zero
    #[error("The embedding must have at least one dimension")]
    InvalidEmbeddingDimensions,

    /// Provided initial coordinates have incorrect dimensions
    #[error("Invalid shape for initial coordinates. Expected {expected:?}, got {actual:?}")]
    InvalidInitialization {
        /// Expected shape: [`n_samples`, `embedding_dimensions`]
        expected: [usize; 2],
        /// Actual shape of provided matrix
        actual: Vec<usize>,
    },

    /// A provided initial coordinate is NaN or infinite
    #[error("Initial coordinates of point {row} are non-finite at position {column}")]
    NonFiniteInitialization {
        /// Point whose coordinates are invalid
        row: usize,
        /// Position of the coordinate within the point
        column: usize,
    },

    /// A run was requested before any data was loaded
    #[error("The engine has not been initialized with data")]
    NotInitialized,

    /// Another run or step iterator currently owns the engine state
    #[error("A run is already in progress on this engine")]
    AlreadyRunning,

    /// Vector store error
    #[error(transparent)]
    Store(#[from] StoreError),
}
