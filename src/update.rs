//! Gain-adapted momentum updates for t-SNE embeddings
//!
//! Each coordinate carries its own gain. A gain grows additively while the
//! gradient keeps pushing the coordinate the same way it moved last time,
//! and decays multiplicatively when the direction flips. The update itself
//! is heavy-ball momentum scaled by the gain.

use crate::gradient::tsne_grad;
use crate::state::EmbeddingState;
use ndarray::{ArrayView2, ArrayViewMut2, Zip};
use std::cmp::Ordering;

/// Fraction of the previous step carried into the next one.
pub const MOMENTUM: f64 = 0.8;

/// Added to a gain when the gradient sign differs from the previous step.
pub const GAIN_INCREMENT: f64 = 0.2;

/// Multiplies a gain when the gradient sign matches the previous step.
pub const GAIN_DECAY: f64 = 0.8;

/// Lower bound for every gain.
pub const MIN_GAIN: f64 = 0.01;

/// Performs one full optimizer step on `state`.
///
/// Computes the gradient against the joint probabilities `p` and applies
/// the gain and momentum rules. Fewer than two points leave the state
/// untouched.
pub fn step(p: ArrayView2<f64>, state: &mut EmbeddingState, learning_rate: f64) {
    if state.len() < 2 {
        return;
    }

    let grad = tsne_grad(p, state.y.view());
    update_embedding_gains(
        state.y.view_mut(),
        grad.view(),
        state.gains.view_mut(),
        state.steps.view_mut(),
        learning_rate,
    );

    debug_assert!(
        state.y.iter().all(|v| v.is_finite()),
        "optimizer produced a non-finite coordinate"
    );
}

/// Updates embedding coordinates using per-coordinate gains and momentum.
///
/// # Arguments
/// * `y` - Current embedding coordinates to update
/// * `grad` - Gradient for this iteration
/// * `gains` - Adaptive per-coordinate gains
/// * `steps` - Previous update of each coordinate, overwritten with the new
///   one
/// * `learning_rate` - Base learning rate
///
/// # Implementation Notes
/// - `sign(grad) != sign(step)` raises the gain by `GAIN_INCREMENT`,
///   otherwise it is multiplied by `GAIN_DECAY`; zero has its own sign, so
///   the first update after a zero step always raises the gain
/// - Gains are clamped to `MIN_GAIN`
/// - `step = MOMENTUM · step − learning_rate · gain · grad`, then `y += step`
///
/// # Panics
/// * If `grad`, `gains` or `steps` have a different shape than `y`
pub fn update_embedding_gains(
    y: ArrayViewMut2<f64>,
    grad: ArrayView2<f64>,
    gains: ArrayViewMut2<f64>,
    steps: ArrayViewMut2<f64>,
    learning_rate: f64,
) {
    Zip::from(y)
        .and(grad)
        .and(gains)
        .and(steps)
        .par_for_each(|y, &grad, gain, step| {
            *gain = if sign(grad) == sign(*step) {
                *gain * GAIN_DECAY
            } else {
                *gain + GAIN_INCREMENT
            };
            *gain = gain.max(MIN_GAIN);

            *step = MOMENTUM * *step - learning_rate * *gain * grad;
            *y += *step;
        });
}

/// Three-way sign; `-0.0` counts as zero.
fn sign(x: f64) -> Option<Ordering> {
    x.partial_cmp(&0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2, Zip};

    #[test]
    fn test_update_embedding_gains() {
        let mut y = array![[0.0, 0.0], [1.0, 1.0]];
        let grad = array![[0.5, -0.5], [0.0, 0.25]];
        let mut gains = Array2::ones((2, 2));
        let mut steps = array![[0.0, 0.0], [0.0, -1.0]];

        update_embedding_gains(
            y.view_mut(),
            grad.view(),
            gains.view_mut(),
            steps.view_mut(),
            10.0,
        );

        // Signs differ from the zero step for non-zero gradients; the zero
        // gradient against a zero step counts as matching.
        let gains_expected = array![[1.2, 1.2], [0.8, 1.2]];
        let steps_expected = array![[-6.0, 6.0], [0.0, -0.8 - 3.0]];
        let y_expected = array![[-6.0, 6.0], [1.0, 1.0 - 3.8]];

        Zip::from(&gains).and(&gains_expected).for_each(|&a, &b| {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        });
        Zip::from(&steps).and(&steps_expected).for_each(|&a, &b| {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        });
        Zip::from(&y).and(&y_expected).for_each(|&a, &b| {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        });
    }

    #[test]
    fn test_matching_signs_decay_gain() {
        // The previous step moved down and the gradient is negative, so the
        // new update moves up: the direction flipped.
        let mut y = array![[0.0]];
        let grad = array![[-1.0]];
        let mut gains = array![[2.0]];
        let mut steps = array![[-1.0]];

        update_embedding_gains(
            y.view_mut(),
            grad.view(),
            gains.view_mut(),
            steps.view_mut(),
            1.0,
        );

        assert_abs_diff_eq!(gains[[0, 0]], 1.6, epsilon = 1e-12);
        assert_abs_diff_eq!(steps[[0, 0]], -0.8 + 1.6, epsilon = 1e-12);
        assert_abs_diff_eq!(y[[0, 0]], 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_gain_floor() {
        let mut y = array![[0.0]];
        let grad = array![[1.0]];
        let mut gains = array![[0.011]];
        let mut steps = array![[1.0]];

        for _ in 0..5 {
            // Keep the previous step positive so the gain keeps decaying.
            steps[[0, 0]] = 1.0;
            update_embedding_gains(
                y.view_mut(),
                grad.view(),
                gains.view_mut(),
                steps.view_mut(),
                1.0,
            );
            assert!(gains[[0, 0]] >= MIN_GAIN);
        }

        assert_abs_diff_eq!(gains[[0, 0]], MIN_GAIN, epsilon = 1e-15);
    }

    #[test]
    fn test_sign() {
        assert_eq!(sign(0.0), sign(-0.0));
        assert_ne!(sign(1e-300), sign(0.0));
        assert_ne!(sign(-1e-300), sign(0.0));
        assert_eq!(sign(f64::NAN), None);
    }

    #[test]
    fn test_step_on_single_point_is_noop() {
        let mut state = EmbeddingState::from_coordinates(array![[1.0, 2.0]]);
        step(array![[0.0]].view(), &mut state, 10.0);

        assert_eq!(state.coordinates(), array![[1.0, 2.0]].view());
        assert_eq!(state.gains(), array![[1.0, 1.0]].view());
    }

    #[test]
    fn test_step_moves_points() {
        let mut state =
            EmbeddingState::from_coordinates(array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        let p = array![[0.0, 0.4, 0.05], [0.4, 0.0, 0.05], [0.05, 0.05, 0.0]];

        step(p.view(), &mut state, 10.0);

        assert!(state.coordinates().iter().all(|v| v.is_finite()));
        assert!(state.steps().iter().any(|&s| s != 0.0));
        assert!(state.gains().iter().all(|&g| g >= MIN_GAIN));
    }
}
