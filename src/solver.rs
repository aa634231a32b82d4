//! Gradient Descent and Gradient Hygiene
//!
//! The update rule plus the utilities that keep recurrent training stable:
//! gradient-norm monitoring and norm clipping.
//!
//! ## The Update Rule
//!
//! For each parameter value with a nonzero accumulated gradient:
//!
//! ```text
//! w[i] -= learning_rate * dw[i]
//! dw[i] = 0
//! ```
//!
//! Positions whose gradient is exactly zero are skipped entirely, and every
//! gradient is cleared by the step, so a parameter set is always ready for
//! the next pass's accumulation after `update`.
//!
//! ## Why Gradient Clipping?
//!
//! Backpropagation through many timesteps multiplies many Jacobians, and the
//! occasional sequence produces exploding gradients that can throw a model
//! into a region it never recovers from. Clipping rescales the whole
//! gradient vector when its L2 norm exceeds a threshold:
//!
//! ```text
//! norm = sqrt(sum of dw[i]^2 over all parameters)
//! if norm > max_norm:
//!     dw *= max_norm / norm
//! ```
//!
//! Every gradient is scaled by the same factor, so the update direction is
//! preserved; only its magnitude is limited.

use crate::matrix::Matrix;
use rayon::prelude::*;

/// Element count above which solver sweeps run in parallel
///
/// Below this, parallel overhead outweighs the gain.
const PARALLEL_UPDATE_THRESHOLD: usize = 1_000;

/// Apply one gradient-descent step to a single matrix
///
/// `w[i] -= learning_rate * dw[i]` wherever `dw[i] != 0`, then the gradient
/// is cleared. See the module docs for why the zero positions are skipped.
pub fn update_matrix(m: &mut Matrix, learning_rate: f64) {
    if m.w.len() > PARALLEL_UPDATE_THRESHOLD {
        m.w.par_iter_mut()
            .zip(m.dw.par_iter_mut())
            .for_each(|(w, dw)| {
                if *dw != 0.0 {
                    *w -= learning_rate * *dw;
                    *dw = 0.0;
                }
            });
    } else {
        for (w, dw) in m.w.iter_mut().zip(m.dw.iter_mut()) {
            if *dw != 0.0 {
                *w -= learning_rate * *dw;
                *dw = 0.0;
            }
        }
    }
}

/// L2 norm of all gradients across a set of matrices
///
/// A single number summarizing the magnitude of the pending update; useful
/// for logging and as the input to clipping.
pub fn grad_norm<'a, I>(matrices: I) -> f64
where
    I: IntoIterator<Item = &'a Matrix>,
{
    let sum_sq: f64 = matrices
        .into_iter()
        .map(|m| m.dw.par_iter().map(|&g| g * g).sum::<f64>())
        .sum();
    sum_sq.sqrt()
}

/// Clip a parameter set's gradients to a maximum L2 norm
///
/// When the joint norm exceeds `max_norm`, every gradient is scaled by
/// `max_norm / norm`; otherwise nothing changes. Returns the norm measured
/// before any scaling, so callers can log it.
pub fn clip_gradients(mut matrices: Vec<&mut Matrix>, max_norm: f64) -> f64 {
    let norm = grad_norm(matrices.iter().map(|m| &**m));
    if norm > max_norm {
        let scale = max_norm / norm;
        for m in matrices.iter_mut() {
            if m.dw.len() > PARALLEL_UPDATE_THRESHOLD {
                m.dw.par_iter_mut().for_each(|g| *g *= scale);
            } else {
                for g in m.dw.iter_mut() {
                    *g *= scale;
                }
            }
        }
    }
    norm
}
