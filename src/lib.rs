//! Lethe: Tape-Based Autodiff for Recurrent Networks
//!
//! A reverse-mode automatic-differentiation engine over dense matrices,
//! implemented from scratch in Rust, with a multi-layer LSTM built on top
//! of it for sequence modeling. Named after the river of forgetfulness:
//! fitting for a library whose central network earns its keep by learning
//! what to forget.
//!
//! # Modules
//!
//! - [`matrix`] - Dense value+gradient matrix, the unit of all data flow
//! - [`graph`] - The tape: eager forward evaluation, recorded backward replay
//! - [`lstm`] - Stacked LSTM parameters and per-timestep forward construction
//! - [`sampling`] - Softmax, argmax and inverse-CDF sampling helpers
//! - [`network`] - String-keyed parameter mappings for solvers and persistence
//! - [`solver`] - Gradient-descent step, gradient norm, norm clipping
//! - [`logger`] - CSV/console training metrics
//!
//! # Example
//!
//! One gradient step through a two-layer LSTM:
//!
//! ```rust
//! use lethe::{softmax, Graph, Lstm, Matrix};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let mut lstm = Lstm::new(8, &[16, 16], 8, &mut rng);
//!
//! let mut g = Graph::recording();
//! let bound = lstm.bind(&mut g);
//! let x = g.insert(Matrix::column(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
//! let step = bound.forward(&mut g, x, None);
//!
//! // Cross-entropy against symbol 3, seeded directly at the tape boundary
//! let probs = softmax(g.matrix(step.output));
//! let target = 3;
//! g.matrix_mut(step.output).dw.copy_from_slice(&probs.w);
//! g.matrix_mut(step.output).dw[target] -= 1.0;
//!
//! g.backward();
//! lstm.absorb(&g, &bound);
//! lstm.clip_gradients(5.0);
//! lstm.update(0.01);
//! ```

pub mod graph;
pub mod logger;
pub mod lstm;
pub mod matrix;
pub mod network;
pub mod sampling;
pub mod solver;

// Re-export main types for convenience
pub use graph::{Graph, NodeId};
pub use logger::TrainingLogger;
pub use lstm::{BoundLstm, Lstm, LstmLayer, LstmState, LstmStep};
pub use matrix::{Matrix, MatrixRecord};
pub use network::Network;
pub use sampling::{argmax, sample_index, softmax};
