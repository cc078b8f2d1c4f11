//! The t-SNE engine: one data set, one optimization session.
//!
//! Setup computes the distance matrix and the calibrated joint probabilities
//! once and allocates the embedding state. Runs then mutate that state in
//! place. The session lives behind a lock that is only ever acquired with
//! `try_lock`, so a second run, a re-initialization or a call from inside a
//! progress callback while a run is in progress fails with
//! [`TsneError::AlreadyRunning`] instead of blocking or corrupting state.

use crate::affinity::calibrate;
use crate::distance::{pairwise_squared_distances, vectors_to_array};
use crate::runner::{drive, Embedding, Steps};
use crate::state::EmbeddingState;
use crate::{validate, Configuration, Initialization, TsneError, LARGE_SAMPLE_WARNING};
use ndarray::{Array2, ArrayView2};
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything one optimization owns: the static joint probabilities and the
/// mutable embedding state.
#[derive(Debug)]
pub(crate) struct Session {
    /// Joint probability matrix, never mutated after setup
    pub(crate) p: Array2<f64>,

    /// Coordinates, gains and momentum steps
    pub(crate) state: EmbeddingState,
}

impl Session {
    /// Computes distances and joint probabilities for `x` and pairs them
    /// with an initial state.
    fn prepare(x: ArrayView2<f64>, perplexity: f64, state: EmbeddingState) -> Self {
        let n = x.nrows();
        if n > LARGE_SAMPLE_WARNING {
            warn!(
                "{n} points exceed {LARGE_SAMPLE_WARNING}; distances and probabilities need O(N²) memory and time"
            );
        }

        let start_time = Instant::now();
        let distances = pairwise_squared_distances(x);
        debug!("Computed pairwise distances in {:.2?}", start_time.elapsed());

        let p = calibrate(distances.view(), perplexity);
        debug!(
            "Calibrated joint probabilities for perplexity {} in {:.2?}",
            perplexity,
            start_time.elapsed()
        );

        Self { p, state }
    }
}

/// A t-SNE engine bound to one configuration.
///
/// The engine is `Sync`: a host may share it between a worker that runs the
/// optimization and a controller that requests cancellation through the
/// flag passed to [`Tsne::run_with`].
#[derive(Debug)]
pub struct Tsne {
    config: Configuration,
    session: Mutex<Option<Session>>,
}

impl Tsne {
    /// Creates an engine with no data loaded.
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    /// The engine's configuration.
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Loads vectors, computing distances and joint probabilities, and
    /// initializes the embedding as configured.
    ///
    /// Replaces any previous session.
    ///
    /// # Errors
    /// * `TsneError::InsufficientData`, `EmptyVectors`, `DimensionMismatch`
    ///   or `NonFiniteInput` for malformed input
    /// * Configuration errors, see [`crate::fit_transform`]
    /// * `TsneError::AlreadyRunning` if a run holds the session
    pub fn initialize<V>(&self, vectors: &[V]) -> Result<(), TsneError>
    where
        V: AsRef<[f64]>,
    {
        let x = vectors_to_array(vectors)?;
        self.initialize_array(x.view())
    }

    /// Like [`Tsne::initialize`], for data already held in a matrix with one
    /// row per sample.
    ///
    /// # Errors
    /// See [`Tsne::initialize`].
    pub fn initialize_array(&self, x: ArrayView2<f64>) -> Result<(), TsneError> {
        let n = x.nrows();
        validate(&self.config, x)?;

        let state = match &self.config.initialization {
            Initialization::Random(None) => EmbeddingState::random(
                n,
                self.config.embedding_dimensions,
                &mut SmallRng::from_entropy(),
            ),
            Initialization::Random(Some(seed)) => EmbeddingState::random(
                n,
                self.config.embedding_dimensions,
                &mut SmallRng::seed_from_u64(*seed),
            ),
            Initialization::Value(y) => EmbeddingState::from_coordinates(y.clone()),
        };

        self.install(x, state)
    }

    /// Loads vectors and draws the initial embedding from `rng`, ignoring
    /// the configured initialization.
    ///
    /// # Errors
    /// See [`Tsne::initialize`].
    pub fn initialize_with_rng<V, R>(&self, vectors: &[V], rng: &mut R) -> Result<(), TsneError>
    where
        V: AsRef<[f64]>,
        R: Rng + ?Sized,
    {
        let x = vectors_to_array(vectors)?;
        validate(&self.config, x.view())?;

        let state = EmbeddingState::random(x.nrows(), self.config.embedding_dimensions, rng);
        self.install(x.view(), state)
    }

    fn install(&self, x: ArrayView2<f64>, state: EmbeddingState) -> Result<(), TsneError> {
        let mut guard = self.lock()?;
        *guard = Some(Session::prepare(x, self.config.perplexity, state));
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Session>>, TsneError> {
        self.session.try_lock().ok_or(TsneError::AlreadyRunning)
    }

    /// Whether data has been loaded.
    ///
    /// # Errors
    /// * `TsneError::AlreadyRunning` if a run holds the session
    pub fn is_initialized(&self) -> Result<bool, TsneError> {
        Ok(self.lock()?.is_some())
    }

    /// A copy of the joint probability matrix.
    ///
    /// # Errors
    /// * `TsneError::NotInitialized` before [`Tsne::initialize`]
    /// * `TsneError::AlreadyRunning` if a run holds the session
    pub fn joint_probabilities(&self) -> Result<Array2<f64>, TsneError> {
        let guard = self.lock()?;
        let session = guard.as_ref().ok_or(TsneError::NotInitialized)?;
        Ok(session.p.clone())
    }

    /// A copy of the current embedding state.
    ///
    /// # Errors
    /// * `TsneError::NotInitialized` before [`Tsne::initialize`]
    /// * `TsneError::AlreadyRunning` if a run holds the session
    pub fn state(&self) -> Result<EmbeddingState, TsneError> {
        let guard = self.lock()?;
        let session = guard.as_ref().ok_or(TsneError::NotInitialized)?;
        Ok(session.state.clone())
    }

    /// Returns an iterator that performs one optimizer step per call to
    /// `next`, up to the configured number of iterations.
    ///
    /// The iterator owns the session until dropped; the host decides when,
    /// and on which thread, each step runs.
    ///
    /// # Errors
    /// * `TsneError::NotInitialized` before [`Tsne::initialize`]
    /// * `TsneError::AlreadyRunning` if a run holds the session
    pub fn steps(&self) -> Result<Steps<'_>, TsneError> {
        let guard = self.lock()?;
        let session = MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| TsneError::NotInitialized)?;
        Ok(Steps::new(
            session,
            self.config.learning_rate,
            self.config.num_iters,
        ))
    }

    /// Runs the configured number of iterations without progress reporting
    /// or cancellation.
    ///
    /// Running again continues from the current embedding.
    ///
    /// # Errors
    /// See [`Tsne::steps`].
    pub fn run(&self) -> Result<Embedding, TsneError> {
        self.run_with(&AtomicBool::new(false), |_, _| {})
    }

    /// Runs the configured number of iterations.
    ///
    /// `cancel` is checked before every iteration; once set, the run stops
    /// and returns the last completed embedding with `cancelled` set.
    /// `on_progress` receives `(completed, total)` every
    /// `progress_interval` iterations and after the last one.
    ///
    /// # Errors
    /// See [`Tsne::steps`].
    pub fn run_with<F>(&self, cancel: &AtomicBool, on_progress: F) -> Result<Embedding, TsneError>
    where
        F: FnMut(usize, usize),
    {
        let steps = self.steps()?;
        Ok(drive(
            steps,
            self.config.snapshots.as_deref(),
            self.config.progress_interval,
            cancel,
            on_progress,
        ))
    }
}
