//! Multi-Layer LSTM Construction
//!
//! This module builds recurrent networks on top of the tape engine: it owns
//! the learnable parameters of a stacked LSTM and knows how to compute one
//! recurrent timestep through a [`Graph`], so that every gate and state
//! update participates in gradient propagation.
//!
//! ## One Timestep
//!
//! Per depth `d` (layers couple bottom-up within a timestep; the input of
//! layer `d` is the hidden output of layer `d-1`, or the external input at
//! `d = 0`):
//!
//! ```text
//! input_gate  = sigmoid(Wix * x + Wih * h_prev + bi)
//! forget_gate = sigmoid(Wfx * x + Wfh * h_prev + bf)
//! output_gate = sigmoid(Wox * x + Woh * h_prev + bo)
//! cell_write  = tanh(Wcx * x + Wch * h_prev + bc)
//! cell        = forget_gate .* cell_prev + input_gate .* cell_write
//! hidden      = output_gate .* tanh(cell)
//! ```
//!
//! After the top layer, a linear decoder maps the hidden state to output
//! scores: `output = Whd * h_top + bd`.
//!
//! ## Parameters and Graphs
//!
//! Parameters live outside any graph. Each pass [`Lstm::bind`]s them into a
//! fresh graph (cloning values in, gradients starting at zero there), runs
//! one or more timesteps, seeds and replays the tape, then
//! [`Lstm::absorb`]s the accumulated gradients back into the owned
//! parameters. Binding once per graph is what makes every timestep of a
//! sequence contribute to the same parameter gradients.
//!
//! ## Example
//!
//! ```rust
//! use lethe::{Graph, Lstm, Matrix};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let mut lstm = Lstm::new(4, &[8, 8], 4, &mut rng);
//!
//! let mut g = Graph::recording();
//! let bound = lstm.bind(&mut g);
//! let x = g.insert(Matrix::column(&[1.0, 0.0, 0.0, 0.0]));
//! let step = bound.forward(&mut g, x, None);
//!
//! // Seed d(loss)/d(output) and propagate
//! g.matrix_mut(step.output).dw[0] = 1.0;
//! g.backward();
//! lstm.absorb(&g, &bound);
//! ```

use crate::graph::{Graph, NodeId};
use crate::matrix::Matrix;
use crate::network::Network;
use crate::solver;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Standard deviation for Gaussian weight initialization
const INIT_STD: f64 = 0.08;

/// Parameters of one LSTM gate: input weights, recurrent weights, bias
///
/// Shapes for a layer with `hidden` units fed by `prev` units:
/// `wx` is `[hidden, prev]`, `wh` is `[hidden, hidden]`, `bias` is
/// `[hidden, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateParams {
    pub wx: Matrix,
    pub wh: Matrix,
    pub bias: Matrix,
}

impl GateParams {
    fn new<R: Rng>(hidden: usize, prev: usize, rng: &mut R) -> Self {
        Self {
            wx: Matrix::randn(hidden, prev, 0.0, INIT_STD, rng),
            wh: Matrix::randn(hidden, hidden, 0.0, INIT_STD, rng),
            bias: Matrix::zeros(hidden, 1),
        }
    }
}

/// All parameters of one LSTM depth: three sigmoid gates plus the tanh
/// cell-write path (12 matrices)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmLayer {
    pub input_gate: GateParams,
    pub forget_gate: GateParams,
    pub output_gate: GateParams,
    pub cell_write: GateParams,
}

/// A stacked LSTM with a linear decoder on top
///
/// # Fields
///
/// - `layers`: One [`LstmLayer`] per depth, ordered bottom-up
/// - `decoder_weight`, `decoder_bias`: Map the top hidden state to output
///   scores, shapes `[output_size, last_hidden]` and `[output_size, 1]`
/// - `input_size`, `hidden_sizes`: Recorded at construction; `hidden_sizes`
///   also sizes the zero state synthesized at t = 0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lstm {
    pub layers: Vec<LstmLayer>,
    pub decoder_weight: Matrix,
    pub decoder_bias: Matrix,
    pub input_size: usize,
    pub hidden_sizes: Vec<usize>,
}

impl Lstm {
    /// Allocate and initialize all parameters
    ///
    /// Weight matrices are Gaussian-initialized with mean 0 and std 0.08;
    /// biases start at zero. Layer `d` is fed by `input_size` units at
    /// `d = 0` and by `hidden_sizes[d - 1]` above that.
    ///
    /// # Panics
    ///
    /// Panics if `hidden_sizes` is empty.
    pub fn new<R: Rng>(
        input_size: usize,
        hidden_sizes: &[usize],
        output_size: usize,
        rng: &mut R,
    ) -> Self {
        assert!(
            !hidden_sizes.is_empty(),
            "An LSTM needs at least one hidden layer"
        );
        let mut layers = Vec::with_capacity(hidden_sizes.len());
        for (d, &hidden) in hidden_sizes.iter().enumerate() {
            let prev = if d == 0 {
                input_size
            } else {
                hidden_sizes[d - 1]
            };
            layers.push(LstmLayer {
                input_gate: GateParams::new(hidden, prev, rng),
                forget_gate: GateParams::new(hidden, prev, rng),
                output_gate: GateParams::new(hidden, prev, rng),
                cell_write: GateParams::new(hidden, prev, rng),
            });
        }
        let last_hidden = *hidden_sizes.last().unwrap();
        Self {
            layers,
            decoder_weight: Matrix::randn(output_size, last_hidden, 0.0, INIT_STD, rng),
            decoder_bias: Matrix::zeros(output_size, 1),
            input_size,
            hidden_sizes: hidden_sizes.to_vec(),
        }
    }

    /// Clone every parameter into a graph's arena for one pass
    ///
    /// Gradients on the bound copies start at zero; after `backward()` they
    /// hold exactly this pass's contributions, which [`Lstm::absorb`] adds
    /// back into the owned parameters.
    pub fn bind(&self, g: &mut Graph) -> BoundLstm {
        let bind_gate = |g: &mut Graph, gate: &GateParams| BoundGate {
            wx: g.insert(gate.wx.clone()),
            wh: g.insert(gate.wh.clone()),
            bias: g.insert(gate.bias.clone()),
        };
        let layers = self
            .layers
            .iter()
            .map(|layer| BoundLayer {
                input_gate: bind_gate(g, &layer.input_gate),
                forget_gate: bind_gate(g, &layer.forget_gate),
                output_gate: bind_gate(g, &layer.output_gate),
                cell_write: bind_gate(g, &layer.cell_write),
            })
            .collect();
        BoundLstm {
            layers,
            decoder_weight: g.insert(self.decoder_weight.clone()),
            decoder_bias: g.insert(self.decoder_bias.clone()),
            hidden_sizes: self.hidden_sizes.clone(),
        }
    }

    /// Add the gradients a pass accumulated on its bound copies back into
    /// the owned parameters
    ///
    /// This is the external merge point: with several independent graphs
    /// (parallel units, or one graph per timestep), absorb each one here and
    /// the parameter `dw` holds the sum.
    ///
    /// # Panics
    ///
    /// Panics if `bound` was produced by a differently shaped network.
    pub fn absorb(&mut self, g: &Graph, bound: &BoundLstm) {
        assert_eq!(
            self.layers.len(),
            bound.layers.len(),
            "Bound network depth ({}) doesn't match parameters ({})",
            bound.layers.len(),
            self.layers.len()
        );
        let absorb_gate = |gate: &mut GateParams, b: &BoundGate, g: &Graph| {
            absorb_matrix(&mut gate.wx, g.matrix(b.wx));
            absorb_matrix(&mut gate.wh, g.matrix(b.wh));
            absorb_matrix(&mut gate.bias, g.matrix(b.bias));
        };
        for (layer, b) in self.layers.iter_mut().zip(&bound.layers) {
            absorb_gate(&mut layer.input_gate, &b.input_gate, g);
            absorb_gate(&mut layer.forget_gate, &b.forget_gate, g);
            absorb_gate(&mut layer.output_gate, &b.output_gate, g);
            absorb_gate(&mut layer.cell_write, &b.cell_write, g);
        }
        absorb_matrix(&mut self.decoder_weight, g.matrix(bound.decoder_weight));
        absorb_matrix(&mut self.decoder_bias, g.matrix(bound.decoder_bias));
    }

    /// Total number of learnable values
    pub fn param_count(&self) -> usize {
        self.matrices().iter().map(|m| m.w.len()).sum()
    }

    /// Reset every parameter gradient to zero
    pub fn zero_grads(&mut self) {
        for m in self.matrices_mut() {
            m.zero_grads();
        }
    }

    /// Apply one gradient-descent step to every parameter and clear the
    /// gradients (see [`solver::update_matrix`])
    pub fn update(&mut self, learning_rate: f64) {
        for m in self.matrices_mut() {
            solver::update_matrix(m, learning_rate);
        }
    }

    /// L2 norm over all parameter gradients
    pub fn grad_norm(&self) -> f64 {
        solver::grad_norm(self.matrices())
    }

    /// Proportionally rescale all gradients when their norm exceeds
    /// `max_norm`; returns the norm measured before scaling
    /// (see [`solver::clip_gradients`])
    pub fn clip_gradients(&mut self, max_norm: f64) -> f64 {
        solver::clip_gradients(self.matrices_mut(), max_norm)
    }

    /// Export the parameters as a stable-keyed [`Network`] mapping
    ///
    /// Keys follow `layer{d}.{gate}.{wx|wh|bias}` plus `decoder.weight` and
    /// `decoder.bias`; the mapping clones the matrices (values and current
    /// gradients both).
    pub fn to_network(&self) -> Network {
        let mut net = Network::new();
        for (d, layer) in self.layers.iter().enumerate() {
            let gates = [
                ("input_gate", &layer.input_gate),
                ("forget_gate", &layer.forget_gate),
                ("output_gate", &layer.output_gate),
                ("cell_write", &layer.cell_write),
            ];
            for (name, gate) in gates {
                net.insert(format!("layer{}.{}.wx", d, name), gate.wx.clone());
                net.insert(format!("layer{}.{}.wh", d, name), gate.wh.clone());
                net.insert(format!("layer{}.{}.bias", d, name), gate.bias.clone());
            }
        }
        net.insert("decoder.weight".to_string(), self.decoder_weight.clone());
        net.insert("decoder.bias".to_string(), self.decoder_bias.clone());
        net
    }

    fn matrices(&self) -> Vec<&Matrix> {
        let mut out = Vec::with_capacity(self.layers.len() * 12 + 2);
        for layer in &self.layers {
            for gate in [
                &layer.input_gate,
                &layer.forget_gate,
                &layer.output_gate,
                &layer.cell_write,
            ] {
                out.push(&gate.wx);
                out.push(&gate.wh);
                out.push(&gate.bias);
            }
        }
        out.push(&self.decoder_weight);
        out.push(&self.decoder_bias);
        out
    }

    fn matrices_mut(&mut self) -> Vec<&mut Matrix> {
        let mut out = Vec::with_capacity(self.layers.len() * 12 + 2);
        for layer in &mut self.layers {
            for gate in [
                &mut layer.input_gate,
                &mut layer.forget_gate,
                &mut layer.output_gate,
                &mut layer.cell_write,
            ] {
                let GateParams { wx, wh, bias } = gate;
                out.push(wx);
                out.push(wh);
                out.push(bias);
            }
        }
        out.push(&mut self.decoder_weight);
        out.push(&mut self.decoder_bias);
        out
    }
}

fn absorb_matrix(target: &mut Matrix, source: &Matrix) {
    assert_eq!(
        target.dw.len(),
        source.dw.len(),
        "Gradient length mismatch while absorbing: {} vs {}",
        target.dw.len(),
        source.dw.len()
    );
    for (t, s) in target.dw.iter_mut().zip(&source.dw) {
        *t += s;
    }
}

/// One gate's parameters bound into a graph
#[derive(Debug, Clone, Copy)]
pub struct BoundGate {
    pub wx: NodeId,
    pub wh: NodeId,
    pub bias: NodeId,
}

impl BoundGate {
    /// `wx * x + wh * h_prev + bias`, recorded on the tape
    fn preactivation(&self, g: &mut Graph, x: NodeId, h_prev: NodeId) -> NodeId {
        let from_input = g.mul(self.wx, x);
        let from_hidden = g.mul(self.wh, h_prev);
        let sum = g.add(from_input, from_hidden);
        g.add(sum, self.bias)
    }
}

/// One layer's parameters bound into a graph
#[derive(Debug, Clone, Copy)]
pub struct BoundLayer {
    pub input_gate: BoundGate,
    pub forget_gate: BoundGate,
    pub output_gate: BoundGate,
    pub cell_write: BoundGate,
}

/// A whole network bound into a graph for one pass
#[derive(Debug, Clone)]
pub struct BoundLstm {
    pub layers: Vec<BoundLayer>,
    pub decoder_weight: NodeId,
    pub decoder_bias: NodeId,
    hidden_sizes: Vec<usize>,
}

/// Per-depth hidden and cell state threaded between timesteps
#[derive(Debug, Clone)]
pub struct LstmState {
    pub hidden: Vec<NodeId>,
    pub cell: Vec<NodeId>,
}

impl LstmState {
    /// Re-insert this state's values into another graph
    ///
    /// Node ids are graph-local, so carrying recurrent state across graph
    /// boundaries (one graph per chunk of timesteps) means cloning the
    /// values into the new arena with fresh zero gradients. Gradients do not
    /// flow back across the boundary: this is the truncation point of
    /// truncated backpropagation through time.
    pub fn carry_to(&self, from: &Graph, to: &mut Graph) -> LstmState {
        let carry = |ids: &[NodeId], to: &mut Graph| -> Vec<NodeId> {
            ids.iter()
                .map(|&id| {
                    let m = from.matrix(id);
                    to.insert(Matrix::new(m.rows, m.columns, m.w.clone()))
                })
                .collect()
        };
        LstmState {
            hidden: carry(&self.hidden, to),
            cell: carry(&self.cell, to),
        }
    }
}

/// Result of one timestep: the next recurrent state plus the decoder output
/// (unnormalized scores)
#[derive(Debug, Clone)]
pub struct LstmStep {
    pub state: LstmState,
    pub output: NodeId,
}

impl BoundLstm {
    /// Compute one recurrent timestep
    ///
    /// When `prev` is `None` (t = 0), zero hidden and cell vectors are
    /// synthesized per depth. All arithmetic goes through the graph's ops,
    /// so the whole timestep is differentiable end to end.
    ///
    /// # Arguments
    ///
    /// * `g` - The pass's graph (the same one this network was bound into)
    /// * `input` - External input column vector for this timestep
    /// * `prev` - State returned by the previous timestep, if any
    ///
    /// # Returns
    ///
    /// The new per-depth state and the decoder output node.
    pub fn forward(&self, g: &mut Graph, input: NodeId, prev: Option<&LstmState>) -> LstmStep {
        let depths = self.hidden_sizes.len();
        let (hidden_prevs, cell_prevs) = match prev {
            Some(state) => {
                assert_eq!(
                    state.hidden.len(),
                    depths,
                    "Previous state has {} depths, network has {}",
                    state.hidden.len(),
                    depths
                );
                (state.hidden.clone(), state.cell.clone())
            }
            None => {
                let hidden = self.hidden_sizes.iter().map(|&n| g.zeros(n, 1)).collect();
                let cell = self.hidden_sizes.iter().map(|&n| g.zeros(n, 1)).collect();
                (hidden, cell)
            }
        };

        let mut hidden: Vec<NodeId> = Vec::with_capacity(depths);
        let mut cell: Vec<NodeId> = Vec::with_capacity(depths);

        for (d, layer) in self.layers.iter().enumerate() {
            let x = if d == 0 { input } else { hidden[d - 1] };
            let h_prev = hidden_prevs[d];
            let c_prev = cell_prevs[d];

            let pre = layer.input_gate.preactivation(g, x, h_prev);
            let input_gate = g.sigmoid(pre);
            let pre = layer.forget_gate.preactivation(g, x, h_prev);
            let forget_gate = g.sigmoid(pre);
            let pre = layer.output_gate.preactivation(g, x, h_prev);
            let output_gate = g.sigmoid(pre);
            let pre = layer.cell_write.preactivation(g, x, h_prev);
            let cell_write = g.tanh(pre);

            // what we keep from the old cell, plus what we write to it
            let retained = g.eltmul(forget_gate, c_prev);
            let written = g.eltmul(input_gate, cell_write);
            let new_cell = g.add(retained, written);

            // hidden state is the gated, saturated cell activation
            let cell_act = g.tanh(new_cell);
            let new_hidden = g.eltmul(output_gate, cell_act);

            hidden.push(new_hidden);
            cell.push(new_cell);
        }

        let top = hidden[depths - 1];
        let decoded = g.mul(self.decoder_weight, top);
        let output = g.add(decoded, self.decoder_bias);

        LstmStep {
            state: LstmState { hidden, cell },
            output,
        }
    }
}
