//! Softmax and Sampling Utilities
//!
//! Non-differentiable helpers for the boundary between a network's output
//! scores and a decision: normalizing scores into probabilities, picking the
//! best index, or drawing one at random.
//!
//! ## Why Softmax Records Nothing
//!
//! [`softmax`] never touches a tape. At a softmax/cross-entropy boundary the
//! combined gradient has the famously simple closed form
//!
//! ```text
//! d(loss)/d(scores) = probabilities - one_hot_target
//! ```
//!
//! so training code writes that difference straight into the score matrix's
//! `dw` and lets `backward()` take it from there. Routing softmax through
//! the tape would only add work and numerical noise.
//!
//! ## Example
//!
//! ```rust
//! use lethe::{softmax, argmax, Matrix};
//!
//! let scores = Matrix::column(&[1.0, 3.0, 2.0]);
//! let probs = softmax(&scores);
//! let total: f64 = probs.w.iter().sum();
//! assert!((total - 1.0).abs() < 1e-12);
//! assert_eq!(argmax(&probs.w), 1);
//! ```

use crate::matrix::Matrix;
use rand::Rng;

/// Normalized exponential of a score matrix
///
/// Numerically stable: the maximum score is subtracted before
/// exponentiating, which cannot change the result (the factors cancel) but
/// keeps `exp` from overflowing. Output values sum to 1.
pub fn softmax(m: &Matrix) -> Matrix {
    let mut out = Matrix::zeros(m.rows, m.columns);
    let max = m.w.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sum = 0.0;
    for (o, &x) in out.w.iter_mut().zip(&m.w) {
        *o = (x - max).exp();
        sum += *o;
    }
    for o in out.w.iter_mut() {
        *o /= sum;
    }
    out
}

/// Index of the largest element; the first occurrence wins ties
///
/// # Panics
///
/// Panics if `w` is empty.
pub fn argmax(w: &[f64]) -> usize {
    assert!(!w.is_empty(), "argmax of an empty slice");
    let mut max_ix = 0;
    let mut max_v = w[0];
    for (i, &v) in w.iter().enumerate().skip(1) {
        if v > max_v {
            max_ix = i;
            max_v = v;
        }
    }
    max_ix
}

/// Draw an index from a probability vector by inverse CDF
///
/// Accumulates a running sum over `probs` and returns the first index whose
/// cumulative mass exceeds a uniform(0, 1) draw. If floating-point error
/// keeps the sum from ever exceeding the draw (probabilities that sum just
/// short of 1), the last index is returned; the clamp is deliberate rather
/// than an artifact of loop termination.
///
/// # Panics
///
/// Panics if `probs` is empty.
pub fn sample_index<R: Rng>(probs: &[f64], rng: &mut R) -> usize {
    assert!(!probs.is_empty(), "sample_index of an empty slice");
    let r = rng.random::<f64>();
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative > r {
            return i;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_softmax_sums_to_one() {
        let m = Matrix::column(&[0.1, -2.0, 3.5, 0.0]);
        let p = softmax(&m);
        let total: f64 = p.w.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(p.w.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_softmax_shift_invariant() {
        let m = Matrix::column(&[1.0, 2.0, 3.0]);
        let shifted = Matrix::column(&[101.0, 102.0, 103.0]);
        let p = softmax(&m);
        let q = softmax(&shifted);
        for (a, b) in p.w.iter().zip(&q.w) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_softmax_survives_large_scores() {
        // Without the max subtraction exp(1000) would overflow to infinity
        let m = Matrix::column(&[1000.0, 999.0]);
        let p = softmax(&m);
        assert!(p.w.iter().all(|v| v.is_finite()));
        let total: f64 = p.w.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_softmax_registers_no_backward_work() {
        let m = Matrix::column(&[1.0, 2.0]);
        let p = softmax(&m);
        assert!(p.dw.iter().all(|&g| g == 0.0));
        assert!(m.dw.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_argmax_first_occurrence_wins_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&[5.0]), 0);
        assert_eq!(argmax(&[-1.0, -3.0]), 0);
    }

    #[test]
    fn test_sample_index_certain_event() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            assert_eq!(sample_index(&[1.0], &mut rng), 0);
        }
    }

    #[test]
    fn test_sample_index_matches_seeded_draw() {
        // The returned index must be exactly the one implied by the
        // generator's next uniform draw.
        for seed in 0..20 {
            let mut draw_rng = StdRng::seed_from_u64(seed);
            let r = draw_rng.random::<f64>();
            let expected = if r < 0.5 { 0 } else { 1 };

            let mut rng = StdRng::seed_from_u64(seed);
            assert_eq!(sample_index(&[0.5, 0.5], &mut rng), expected);
        }
    }

    #[test]
    fn test_sample_index_clamps_to_last_on_shortfall() {
        // Degenerate mass that can never exceed the draw falls back to the
        // last index instead of running off the end.
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_index(&[0.0, 0.0, 0.0], &mut rng), 2);
    }

    #[test]
    fn test_sample_index_roughly_follows_distribution() {
        let mut rng = StdRng::seed_from_u64(123);
        let probs = [0.8, 0.2];
        let mut counts = [0usize; 2];
        for _ in 0..2000 {
            counts[sample_index(&probs, &mut rng)] += 1;
        }
        // loose bounds; the draw count keeps this stable for a fixed seed
        assert!(counts[0] > 1400 && counts[0] < 1800, "counts: {:?}", counts);
    }
}
