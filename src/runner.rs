//! Iteration control for the optimizer.
//!
//! [`Steps`] performs exactly one optimizer step per call to `next`, so each
//! iteration observes the complete result of the previous one and the host
//! chooses where the pauses between iterations go. [`drive`] is the run loop
//! built on top of it: cancellation checks at iteration boundaries, periodic
//! progress reports and snapshot capture.

use crate::engine::Session;
use crate::gradient::kl_divergence;
use crate::state::EmbeddingState;
use crate::update::step;
use ndarray::{s, Array2, Array3, ArrayView2};
use parking_lot::MappedMutexGuard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, enabled, Level};

/// Result of a run.
#[derive(Clone, Debug)]
pub struct Embedding {
    /// Final coordinates, one row per input vector in input order
    pub coordinates: Array2<f64>,

    /// Embedding states at the requested snapshot iterations, shape
    /// (snapshots, N, dim); snapshots not reached before a cancellation are
    /// left as zeros
    pub snapshots: Option<Array3<f64>>,

    /// Number of iterations completed by this run
    pub iterations: usize,

    /// Whether the run stopped early because cancellation was requested
    pub cancelled: bool,
}

/// Step-by-step access to a running optimization.
///
/// Yields the number of completed iterations after each step. Holds the
/// engine's session until dropped.
pub struct Steps<'a> {
    session: MappedMutexGuard<'a, Session>,
    learning_rate: f64,
    total: usize,
    completed: usize,
}

impl<'a> Steps<'a> {
    pub(crate) fn new(
        session: MappedMutexGuard<'a, Session>,
        learning_rate: f64,
        total: usize,
    ) -> Self {
        Self {
            session,
            learning_rate,
            total,
            completed: 0,
        }
    }

    /// Current embedding state.
    pub fn state(&self) -> &EmbeddingState {
        &self.session.state
    }

    /// The joint probabilities being matched.
    pub fn joint_probabilities(&self) -> ArrayView2<f64> {
        self.session.p.view()
    }

    /// Iterations completed so far.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Iterations this iterator will perform in total.
    pub fn total(&self) -> usize {
        self.total
    }

    /// KL divergence of the current embedding. Costs O(N²).
    pub fn kl_divergence(&self) -> f64 {
        kl_divergence(self.session.p.view(), self.session.state.coordinates())
    }
}

impl Iterator for Steps<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.completed >= self.total {
            return None;
        }

        let Session { p, state } = &mut *self.session;
        step(p.view(), state, self.learning_rate);
        self.completed += 1;

        Some(self.completed)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.completed;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Steps<'_> {}

/// Drives `steps` to completion or cancellation.
///
/// # Arguments
/// * `steps` - Iterator over the session's optimizer steps
/// * `snapshot_indices` - Optional iterations at which to copy the embedding
/// * `progress_interval` - Completed iterations between progress reports;
///   `0` reports only the final iteration
/// * `cancel` - Checked before each iteration
/// * `on_progress` - Receives `(completed, total)`
pub(crate) fn drive<F>(
    mut steps: Steps<'_>,
    snapshot_indices: Option<&[usize]>,
    progress_interval: usize,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Embedding
where
    F: FnMut(usize, usize),
{
    let start_time = Instant::now();
    let total = steps.total();
    let state = steps.state();
    let mut snapshots = Snapshots::from(state.dimensions(), state.len(), snapshot_indices);

    if let Some(ref mut snapshots) = snapshots {
        snapshots.capture(0, steps.state().coordinates());
    }

    if enabled!(Level::DEBUG) {
        debug!("Initial KL divergence: {}", steps.kl_divergence());
    }

    let mut cancelled = false;
    while steps.completed() < total {
        if cancel.load(Ordering::Relaxed) {
            debug!("Cancelled after {} of {} iterations", steps.completed(), total);
            cancelled = true;
            break;
        }

        let Some(completed) = steps.next() else {
            break;
        };

        if let Some(ref mut snapshots) = snapshots {
            snapshots.capture(completed, steps.state().coordinates());
        }

        let report = completed == total
            || (progress_interval != 0 && completed % progress_interval == 0);
        if report {
            if enabled!(Level::DEBUG) {
                debug!(
                    "Iteration: {:4}/{}, KL divergence: {}",
                    completed,
                    total,
                    steps.kl_divergence()
                );
            }
            on_progress(completed, total);
        }
    }

    debug!("Elapsed time: {:.2?}", start_time.elapsed());

    Embedding {
        coordinates: steps.state().coordinates().to_owned(),
        snapshots: snapshots.map(|s| s.states),
        iterations: steps.completed(),
        cancelled,
    }
}

/// Manages intermediate embedding states during optimization.
struct Snapshots<'a> {
    /// Stored embedding states
    states: Array3<f64>,

    /// Iterations at which to take snapshots
    indices: &'a [usize],
}

impl<'a> Snapshots<'a> {
    /// Creates new snapshot manager if indices are provided.
    fn from(n_dims: usize, n: usize, maybe_snapshots: Option<&'a [usize]>) -> Option<Self> {
        let snapshots = maybe_snapshots?;
        Some(Self {
            states: Array3::zeros((snapshots.len(), n, n_dims)),
            indices: snapshots,
        })
    }

    /// Copies `y` into every slot requested for `iteration`.
    fn capture(&mut self, iteration: usize, y: ArrayView2<f64>) {
        for (slot, _) in self
            .indices
            .iter()
            .enumerate()
            .filter(|&(_, &index)| index == iteration)
        {
            self.states.slice_mut(s![slot, .., ..]).assign(&y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Snapshots;
    use ndarray::{array, s};

    #[test]
    fn test_snapshots_capture() {
        let indices = [0, 2, 2, 5];
        let mut snapshots = Snapshots::from(2, 2, Some(&indices[..])).unwrap();

        snapshots.capture(0, array![[1.0, 1.0], [1.0, 1.0]].view());
        snapshots.capture(1, array![[9.0, 9.0], [9.0, 9.0]].view());
        snapshots.capture(2, array![[2.0, 2.0], [2.0, 2.0]].view());

        assert_eq!(snapshots.states.shape(), &[4, 2, 2]);
        assert!(snapshots.states.slice(s![0, .., ..]).iter().all(|&v| v == 1.0));
        assert!(snapshots.states.slice(s![1, .., ..]).iter().all(|&v| v == 2.0));
        assert!(snapshots.states.slice(s![2, .., ..]).iter().all(|&v| v == 2.0));
        assert!(snapshots.states.slice(s![3, .., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_no_snapshots() {
        assert!(Snapshots::from(2, 10, None).is_none());
    }
}
