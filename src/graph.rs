//! Tape-Based Reverse-Mode Differentiation
//!
//! This module provides the autodiff engine: a [`Graph`] that evaluates
//! operations eagerly in the forward direction while recording, onto a tape,
//! everything needed to propagate gradients backward.
//!
//! ## How the Tape Works
//!
//! There is no static computation graph. Each operation:
//!
//! 1. Reads its operand matrices from the graph's arena
//! 2. Allocates a fresh output matrix (inputs are never aliased)
//! 3. Appends one backward record to the tape (when recording is enabled)
//!
//! The backward pass replays the tape in exact reverse order. Each record
//! reads the *already accumulated* gradient of its output and **adds** a
//! transformed contribution into each operand's gradient:
//!
//! ```text
//! forward:   x ──tanh──▶ y ──dot(y, z)──▶ s
//! tape:      [Tanh{x, y}, Dot{y, z, s}]
//! backward:  seed s.dw, then replay Dot, then Tanh
//! ```
//!
//! Accumulation (never overwriting) is what makes gradients compose when a
//! matrix feeds several operations, including both operands of the same one.
//!
//! ## Ownership Model
//!
//! The graph owns every matrix involved in a pass, in an append-only arena.
//! Operations take and return [`NodeId`] indices into that arena, so tape
//! records hold plain indices rather than references. Parameters owned
//! outside the graph are cloned in at the start of a pass and their
//! accumulated gradients are harvested back out after `backward` (see
//! [`Lstm::bind`](crate::Lstm::bind) and [`Lstm::absorb`](crate::Lstm::absorb)).
//!
//! ## Single Use
//!
//! A graph is built for exactly one forward/backward cycle:
//!
//! - `Graph::recording()` starts a recording graph; `backward()` consumes it
//! - Calling `backward()` twice, registering operations after consumption, or
//!   calling `backward()` on an inference graph is a usage error and panics
//!
//! ## Example
//!
//! ```rust
//! use lethe::{Graph, Matrix};
//!
//! let mut g = Graph::recording();
//! let v = g.insert(Matrix::column(&[1.0, 2.0, 3.0]));
//! let s = g.dot(v, v); // s = |v|^2
//!
//! g.matrix_mut(s).dw[0] = 1.0; // seed the scalar output
//! g.backward();
//!
//! // d|v|^2/dv = 2v
//! assert_eq!(g.matrix(v).dw, vec![2.0, 4.0, 6.0]);
//! ```

use crate::matrix::Matrix;
use rayon::prelude::*;

/// Index of a matrix in a graph's arena
///
/// Node ids are only meaningful for the graph that produced them; using an id
/// from one graph with another is a usage error (and is caught by the arena
/// bounds checks in all but pathological cases).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// One backward record: opcode plus operand indices and any auxiliary data
///
/// The output index is always greater than every operand index because
/// outputs are freshly appended to the arena, which is what lets the replay
/// split the arena around the output.
#[derive(Debug, Clone, Copy)]
enum Op {
    Pluck { input: NodeId, out: NodeId, row: usize },
    Tanh { input: NodeId, out: NodeId },
    Sigmoid { input: NodeId, out: NodeId },
    Relu { input: NodeId, out: NodeId },
    Mul { lhs: NodeId, rhs: NodeId, out: NodeId },
    Add { lhs: NodeId, rhs: NodeId, out: NodeId },
    Dot { lhs: NodeId, rhs: NodeId, out: NodeId },
    EltMul { lhs: NodeId, rhs: NodeId, out: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Recording,
    Consumed,
}

/// Work threshold below which matrix multiplication stays sequential
///
/// Balances parallel overhead against gains; with the column-vector shapes of
/// small recurrent networks most products stay under it.
const PARALLEL_MATMUL_WORK: usize = 1_000;

/// Block size for the cache-blocked parallel matmul (8x8 doubles per block)
const BLOCK_SIZE: usize = 8;

/// Tape-based autodiff graph
///
/// Owns the matrix arena and the tape of backward records for one forward
/// pass. See the module docs for the lifecycle.
pub struct Graph {
    nodes: Vec<Matrix>,
    tape: Vec<Op>,
    needs_backprop: bool,
    state: State,
}

impl Graph {
    /// Create a graph that records backward operations
    pub fn recording() -> Self {
        Self {
            nodes: Vec::new(),
            tape: Vec::new(),
            needs_backprop: true,
            state: State::Recording,
        }
    }

    /// Create a forward-only graph
    ///
    /// Operations compute values but record nothing; `backward()` on such a
    /// graph is a usage error and panics. Use this for generation/evaluation
    /// passes where gradients are not needed.
    pub fn inference() -> Self {
        Self {
            nodes: Vec::new(),
            tape: Vec::new(),
            needs_backprop: false,
            state: State::Recording,
        }
    }

    /// Whether this graph records backward operations
    pub fn needs_backprop(&self) -> bool {
        self.needs_backprop
    }

    /// Move a matrix into the graph's arena
    ///
    /// Returns the id under which operations can consume it. Gradients
    /// accumulated into it during `backward()` are read back through
    /// [`Graph::matrix`].
    ///
    /// # Panics
    ///
    /// Panics if the graph has already been consumed by `backward()`.
    pub fn insert(&mut self, m: Matrix) -> NodeId {
        self.assert_active("insert");
        self.push(m)
    }

    /// Allocate a zero matrix directly in the arena
    pub fn zeros(&mut self, rows: usize, columns: usize) -> NodeId {
        self.insert(Matrix::zeros(rows, columns))
    }

    /// Borrow the matrix behind an id
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph's arena.
    pub fn matrix(&self, id: NodeId) -> &Matrix {
        &self.nodes[id.0]
    }

    /// Mutably borrow the matrix behind an id
    ///
    /// The main use is seeding the final output's gradient before
    /// `backward()`, e.g. `dw[0] = 1.0` on a scalar loss, or writing
    /// `probabilities - one_hot_target` at a softmax/cross-entropy boundary.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph's arena.
    pub fn matrix_mut(&mut self, id: NodeId) -> &mut Matrix {
        &mut self.nodes[id.0]
    }

    /// Shape of the matrix behind an id, as `(rows, columns)`
    pub fn shape(&self, id: NodeId) -> (usize, usize) {
        let m = &self.nodes[id.0];
        (m.rows, m.columns)
    }

    fn push(&mut self, m: Matrix) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(m);
        id
    }

    fn assert_active(&self, what: &str) {
        assert!(
            self.state == State::Recording,
            "{} called on a consumed graph; a graph is single-use, build a fresh one per forward pass",
            what
        );
    }

    /// Pluck row `row` of a matrix and return it as a column vector
    ///
    /// Backward routes the output gradient into exactly that row of the
    /// input; all other rows are untouched. This is the embedding-lookup
    /// primitive for sequence models.
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of range, or if the graph is consumed.
    pub fn pluck(&mut self, input: NodeId, row: usize) -> NodeId {
        self.assert_active("pluck");
        let m = &self.nodes[input.0];
        assert!(
            row < m.rows,
            "Pluck row {} out of bounds for [{}, {}] matrix",
            row,
            m.rows,
            m.columns
        );
        let d = m.columns;
        let out_w: Vec<f64> = m.w[d * row..d * (row + 1)].to_vec();
        let out = self.push(Matrix::new(d, 1, out_w));
        if self.needs_backprop {
            self.tape.push(Op::Pluck { input, out, row });
        }
        out
    }

    /// Elementwise hyperbolic tangent
    pub fn tanh(&mut self, input: NodeId) -> NodeId {
        self.assert_active("tanh");
        let (rows, columns) = self.shape(input);
        let out_w: Vec<f64> = self.nodes[input.0].w.par_iter().map(|&x| x.tanh()).collect();
        let out = self.push(Matrix::new(rows, columns, out_w));
        if self.needs_backprop {
            self.tape.push(Op::Tanh { input, out });
        }
        out
    }

    /// Elementwise logistic sigmoid: `1 / (1 + exp(-x))`
    pub fn sigmoid(&mut self, input: NodeId) -> NodeId {
        self.assert_active("sigmoid");
        let (rows, columns) = self.shape(input);
        let out_w: Vec<f64> = self.nodes[input.0]
            .w
            .par_iter()
            .map(|&x| 1.0 / (1.0 + (-x).exp()))
            .collect();
        let out = self.push(Matrix::new(rows, columns, out_w));
        if self.needs_backprop {
            self.tape.push(Op::Sigmoid { input, out });
        }
        out
    }

    /// Elementwise rectified linear unit: `max(0, x)`
    ///
    /// The backward gate uses the sign of the *input*, so positions that were
    /// exactly zeroed pass no gradient.
    pub fn relu(&mut self, input: NodeId) -> NodeId {
        self.assert_active("relu");
        let (rows, columns) = self.shape(input);
        let out_w: Vec<f64> = self.nodes[input.0]
            .w
            .par_iter()
            .map(|&x| x.max(0.0))
            .collect();
        let out = self.push(Matrix::new(rows, columns, out_w));
        if self.needs_backprop {
            self.tape.push(Op::Relu { input, out });
        }
        out
    }

    /// Matrix product `lhs * rhs`
    ///
    /// For `lhs` of shape `[n, k]` and `rhs` of shape `[k, d]` the output has
    /// shape `[n, d]`. Both gradient directions cost O(n*k*d), same as the
    /// forward product.
    ///
    /// # Performance
    ///
    /// Large products use a cache-blocked, row-parallel kernel; small ones
    /// (under ~1K multiply-adds) stay sequential to avoid parallel overhead.
    ///
    /// # Panics
    ///
    /// Panics if `lhs.columns != rhs.rows`, before any output is allocated.
    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.assert_active("mul");
        let (n, k) = self.shape(lhs);
        let (k2, d) = self.shape(rhs);
        assert_eq!(
            k, k2,
            "Matrix dimensions incompatible for mul: [{}, {}] * [{}, {}]",
            n, k, k2, d
        );
        let out_w = matmul_values(&self.nodes[lhs.0], &self.nodes[rhs.0]);
        let out = self.push(Matrix::new(n, d, out_w));
        if self.needs_backprop {
            self.tape.push(Op::Mul { lhs, rhs, out });
        }
        out
    }

    /// Elementwise sum
    ///
    /// # Panics
    ///
    /// Panics if the operands' element counts differ.
    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.assert_active("add");
        let (rows, columns) = self.shape(lhs);
        assert_eq!(
            self.nodes[lhs.0].w.len(),
            self.nodes[rhs.0].w.len(),
            "Element count mismatch for add: [{}, {}] + [{}, {}]",
            rows,
            columns,
            self.nodes[rhs.0].rows,
            self.nodes[rhs.0].columns
        );
        let out_w: Vec<f64> = self.nodes[lhs.0]
            .w
            .par_iter()
            .zip(&self.nodes[rhs.0].w)
            .map(|(a, b)| a + b)
            .collect();
        let out = self.push(Matrix::new(rows, columns, out_w));
        if self.needs_backprop {
            self.tape.push(Op::Add { lhs, rhs, out });
        }
        out
    }

    /// Inner product of two equal-length vectors, as a 1x1 matrix
    ///
    /// # Panics
    ///
    /// Panics if the operands' element counts differ.
    pub fn dot(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.assert_active("dot");
        assert_eq!(
            self.nodes[lhs.0].w.len(),
            self.nodes[rhs.0].w.len(),
            "Element count mismatch for dot: {} vs {}",
            self.nodes[lhs.0].w.len(),
            self.nodes[rhs.0].w.len()
        );
        let value: f64 = self.nodes[lhs.0]
            .w
            .iter()
            .zip(&self.nodes[rhs.0].w)
            .map(|(a, b)| a * b)
            .sum();
        let out = self.push(Matrix::new(1, 1, vec![value]));
        if self.needs_backprop {
            self.tape.push(Op::Dot { lhs, rhs, out });
        }
        out
    }

    /// Elementwise product
    ///
    /// # Panics
    ///
    /// Panics if the operands' element counts differ.
    pub fn eltmul(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.assert_active("eltmul");
        let (rows, columns) = self.shape(lhs);
        assert_eq!(
            self.nodes[lhs.0].w.len(),
            self.nodes[rhs.0].w.len(),
            "Element count mismatch for eltmul: [{}, {}] vs [{}, {}]",
            rows,
            columns,
            self.nodes[rhs.0].rows,
            self.nodes[rhs.0].columns
        );
        let out_w: Vec<f64> = self.nodes[lhs.0]
            .w
            .par_iter()
            .zip(&self.nodes[rhs.0].w)
            .map(|(a, b)| a * b)
            .collect();
        let out = self.push(Matrix::new(rows, columns, out_w));
        if self.needs_backprop {
            self.tape.push(Op::EltMul { lhs, rhs, out });
        }
        out
    }

    /// Replay the tape in reverse, propagating gradients into every operand
    ///
    /// The caller must have seeded the final output's gradient first
    /// (typically `dw[0] = 1.0` on a scalar). Each record runs exactly once;
    /// gradients are accumulated, never reset. Zeroing gradients across a
    /// parameter set is a separate, explicit operation.
    ///
    /// Consumes the graph: no further operations may be registered and
    /// `backward()` may not run again.
    ///
    /// # Panics
    ///
    /// Panics if the graph was built with [`Graph::inference`], or if it has
    /// already been consumed.
    pub fn backward(&mut self) {
        assert!(
            self.needs_backprop,
            "backward() called on an inference graph; build the pass with Graph::recording()"
        );
        self.assert_active("backward");
        self.state = State::Consumed;

        let tape = std::mem::take(&mut self.tape);
        for op in tape.iter().rev() {
            self.apply_backward(op);
        }
    }

    /// Apply one backward record
    ///
    /// The arena is split at the output index: operands live strictly below
    /// it, so the output is read-only while operands are mutated. Operand
    /// values are copied into locals before accumulating so that an operation
    /// whose two operands are the same matrix contributes for both roles.
    fn apply_backward(&mut self, op: &Op) {
        match *op {
            Op::Pluck { input, out, row } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let out_m = &tail[0];
                let m = &mut head[input.0];
                let d = m.columns;
                for i in 0..d {
                    m.dw[d * row + i] += out_m.dw[i];
                }
            }
            Op::Tanh { input, out } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let out_m = &tail[0];
                let m = &mut head[input.0];
                for i in 0..m.w.len() {
                    // d tanh(x) = 1 - tanh(x)^2, read from the forward output
                    let y = out_m.w[i];
                    m.dw[i] += (1.0 - y * y) * out_m.dw[i];
                }
            }
            Op::Sigmoid { input, out } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let out_m = &tail[0];
                let m = &mut head[input.0];
                for i in 0..m.w.len() {
                    // d sigmoid(x) = y * (1 - y)
                    let y = out_m.w[i];
                    m.dw[i] += y * (1.0 - y) * out_m.dw[i];
                }
            }
            Op::Relu { input, out } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let out_m = &tail[0];
                let m = &mut head[input.0];
                for i in 0..m.w.len() {
                    if m.w[i] > 0.0 {
                        m.dw[i] += out_m.dw[i];
                    }
                }
            }
            Op::Mul { lhs, rhs, out } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let out_m = &tail[0];
                let n = head[lhs.0].rows;
                let k = head[lhs.0].columns;
                let d = head[rhs.0].columns;
                for i in 0..n {
                    for j in 0..d {
                        let g = out_m.dw[d * i + j];
                        for t in 0..k {
                            let lw = head[lhs.0].w[k * i + t];
                            let rw = head[rhs.0].w[d * t + j];
                            head[lhs.0].dw[k * i + t] += rw * g;
                            head[rhs.0].dw[d * t + j] += lw * g;
                        }
                    }
                }
            }
            Op::Add { lhs, rhs, out } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let out_m = &tail[0];
                for i in 0..out_m.dw.len() {
                    let g = out_m.dw[i];
                    head[lhs.0].dw[i] += g;
                    head[rhs.0].dw[i] += g;
                }
            }
            Op::Dot { lhs, rhs, out } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let g = tail[0].dw[0];
                for i in 0..head[lhs.0].w.len() {
                    let lw = head[lhs.0].w[i];
                    let rw = head[rhs.0].w[i];
                    head[lhs.0].dw[i] += rw * g;
                    head[rhs.0].dw[i] += lw * g;
                }
            }
            Op::EltMul { lhs, rhs, out } => {
                let (head, tail) = self.nodes.split_at_mut(out.0);
                let out_m = &tail[0];
                for i in 0..out_m.dw.len() {
                    let g = out_m.dw[i];
                    let lw = head[lhs.0].w[i];
                    let rw = head[rhs.0].w[i];
                    head[lhs.0].dw[i] += rw * g;
                    head[rhs.0].dw[i] += lw * g;
                }
            }
        }
    }
}

/// Compute the values of `a * b`, choosing a sequential or parallel kernel
fn matmul_values(a: &Matrix, b: &Matrix) -> Vec<f64> {
    let m = a.rows;
    let k = a.columns;
    let n = b.columns;

    if m * k * n < PARALLEL_MATMUL_WORK {
        // Sequential version for small products (avoids parallel overhead)
        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..k {
                    sum += a.w[i * k + l] * b.w[l * n + j];
                }
                result[i * n + j] = sum;
            }
        }
        return result;
    }

    matmul_parallel_blocked(a, b, m, n, k)
}

/// Inner loop of the blocked kernel: `result[j] += a_val * b[j]` for all j
///
/// Written as a plain zip so LLVM can auto-vectorize it.
#[inline(always)]
fn matmul_inner(a_val: f64, b: &[f64], result: &mut [f64]) {
    for (r, &b_val) in result.iter_mut().zip(b.iter()) {
        *r += a_val * b_val;
    }
}

/// Cache-blocked, row-parallel matrix multiplication
///
/// Processes 8x8 blocks for cache locality and distributes row blocks across
/// cores. Worth it only above the work threshold; see `matmul_values`.
fn matmul_parallel_blocked(a: &Matrix, b: &Matrix, m: usize, n: usize, k: usize) -> Vec<f64> {
    let mut result = vec![0.0; m * n];

    result
        .par_chunks_mut(BLOCK_SIZE * n)
        .enumerate()
        .for_each(|(block_i, result_block)| {
            let i_start = block_i * BLOCK_SIZE;
            let i_end = (i_start + BLOCK_SIZE).min(m);

            for j_start in (0..n).step_by(BLOCK_SIZE) {
                let j_end = (j_start + BLOCK_SIZE).min(n);

                for k_start in (0..k).step_by(BLOCK_SIZE) {
                    let k_end = (k_start + BLOCK_SIZE).min(k);

                    for i in i_start..i_end {
                        let row_offset = (i - i_start) * n;
                        for k_idx in k_start..k_end {
                            let a_val = a.w[i * k + k_idx];
                            matmul_inner(
                                a_val,
                                &b.w[k_idx * n + j_start..k_idx * n + j_end],
                                &mut result_block[row_offset + j_start..row_offset + j_end],
                            );
                        }
                    }
                }
            }
        });

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Seed every element of the output gradient with 1.0 and run backward,
    /// then compare each input element's analytic gradient against a central
    /// finite difference of the summed output.
    fn grad_check<F>(inputs: &[Matrix], f: F, tol: f64)
    where
        F: Fn(&mut Graph, &[NodeId]) -> NodeId,
    {
        // Analytic gradients
        let mut g = Graph::recording();
        let ids: Vec<NodeId> = inputs.iter().map(|m| g.insert(m.clone())).collect();
        let out = f(&mut g, &ids);
        for gd in g.matrix_mut(out).dw.iter_mut() {
            *gd = 1.0;
        }
        g.backward();

        // Numeric gradients, one input element at a time
        let eps = 1e-5;
        for (which, input) in inputs.iter().enumerate() {
            for ei in 0..input.w.len() {
                let run = |delta: f64| -> f64 {
                    let mut g2 = Graph::inference();
                    let ids2: Vec<NodeId> = inputs
                        .iter()
                        .enumerate()
                        .map(|(j, m)| {
                            let mut m = m.clone();
                            if j == which {
                                m.w[ei] += delta;
                            }
                            g2.insert(m)
                        })
                        .collect();
                    let out2 = f(&mut g2, &ids2);
                    g2.matrix(out2).w.iter().sum()
                };
                let numeric = (run(eps) - run(-eps)) / (2.0 * eps);
                let analytic = g.matrix(ids[which]).dw[ei];
                assert!(
                    (numeric - analytic).abs() < tol,
                    "gradient mismatch for input {} element {}: numeric {} vs analytic {}",
                    which,
                    ei,
                    numeric,
                    analytic
                );
            }
        }
    }

    fn random_matrix(rows: usize, columns: usize, rng: &mut StdRng) -> Matrix {
        Matrix::randn(rows, columns, 0.0, 1.0, rng)
    }

    #[test]
    fn test_pluck_forward() {
        let mut g = Graph::recording();
        let m = g.insert(Matrix::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let row = g.pluck(m, 1);
        let out = g.matrix(row);
        assert_eq!((out.rows, out.columns), (2, 1));
        assert_eq!(out.w, vec![3.0, 4.0]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_pluck_bad_row_panics() {
        let mut g = Graph::recording();
        let m = g.zeros(3, 2);
        g.pluck(m, 3);
    }

    #[test]
    fn test_tanh_sigmoid_relu_forward() {
        let mut g = Graph::recording();
        let m = g.insert(Matrix::column(&[-1.0, 0.0, 2.0]));

        let t = g.tanh(m);
        assert_eq!(
            g.matrix(t).w,
            vec![(-1.0f64).tanh(), 0.0, 2.0f64.tanh()]
        );

        let s = g.sigmoid(m);
        let expected: Vec<f64> = [-1.0f64, 0.0, 2.0]
            .iter()
            .map(|&x| 1.0 / (1.0 + (-x).exp()))
            .collect();
        assert_eq!(g.matrix(s).w, expected);

        let r = g.relu(m);
        assert_eq!(g.matrix(r).w, vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_mul_forward() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let b = g.insert(Matrix::new(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]));
        let c = g.mul(a, b);
        let out = g.matrix(c);
        assert_eq!((out.rows, out.columns), (2, 2));
        assert_eq!(out.w, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_mul_matches_blocked_kernel() {
        // Large enough to cross the parallel threshold; compare against the
        // naive triple loop.
        let mut rng = StdRng::seed_from_u64(11);
        let a = random_matrix(16, 12, &mut rng);
        let b = random_matrix(12, 16, &mut rng);

        let fast = matmul_values(&a, &b);
        let mut naive = vec![0.0; 16 * 16];
        for i in 0..16 {
            for j in 0..16 {
                let mut sum = 0.0;
                for l in 0..12 {
                    sum += a.w[i * 12 + l] * b.w[l * 16 + j];
                }
                naive[i * 16 + j] = sum;
            }
        }
        for (x, y) in fast.iter().zip(&naive) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    #[should_panic(expected = "dimensions incompatible")]
    fn test_mul_shape_mismatch_panics() {
        let mut g = Graph::recording();
        let a = g.zeros(2, 3);
        let b = g.zeros(2, 2);
        g.mul(a, b);
    }

    #[test]
    fn test_add_forward() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::column(&[1.0, 2.0, 3.0]));
        let b = g.insert(Matrix::column(&[4.0, 5.0, 6.0]));
        let s = g.add(a, b);
        assert_eq!(g.matrix(s).w, vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_dot_forward() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::column(&[1.0, 2.0, 3.0]));
        let b = g.insert(Matrix::column(&[4.0, 5.0, 6.0]));
        let s = g.dot(a, b);
        assert_eq!(g.matrix(s).w, vec![32.0]);
        assert_eq!((g.matrix(s).rows, g.matrix(s).columns), (1, 1));
    }

    #[test]
    fn test_eltmul_forward() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::column(&[1.0, 2.0, 3.0]));
        let b = g.insert(Matrix::column(&[4.0, 5.0, 6.0]));
        let p = g.eltmul(a, b);
        assert_eq!(g.matrix(p).w, vec![4.0, 10.0, 18.0]);
    }

    #[test]
    #[should_panic(expected = "Element count mismatch")]
    fn test_add_shape_mismatch_panics() {
        let mut g = Graph::recording();
        let a = g.zeros(2, 2);
        let b = g.zeros(3, 1);
        g.add(a, b);
    }

    #[test]
    fn test_outputs_never_alias_inputs() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::column(&[1.0, 2.0]));
        let t = g.tanh(a);
        g.matrix_mut(t).w[0] = 99.0;
        assert_eq!(g.matrix(a).w[0], 1.0);
    }

    #[test]
    fn test_dot_of_vector_with_itself_doubles() {
        let mut g = Graph::recording();
        let v = g.insert(Matrix::column(&[1.0, -2.0, 3.0]));
        let s = g.dot(v, v);
        g.matrix_mut(s).dw[0] = 1.0;
        g.backward();
        assert_eq!(g.matrix(v).dw, vec![2.0, -4.0, 6.0]);
    }

    #[test]
    fn test_pluck_backward_touches_only_plucked_row() {
        let mut g = Graph::recording();
        let m = g.insert(Matrix::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let row = g.pluck(m, 2);
        g.matrix_mut(row).dw.copy_from_slice(&[10.0, 20.0]);
        g.backward();
        assert_eq!(g.matrix(m).dw, vec![0.0, 0.0, 0.0, 0.0, 10.0, 20.0]);
    }

    #[test]
    fn test_backward_accumulates_across_consumers() {
        // x feeds two ops; its gradient must be the sum of both paths
        let mut g = Graph::recording();
        let x = g.insert(Matrix::column(&[2.0]));
        let y = g.insert(Matrix::column(&[3.0]));
        let p = g.eltmul(x, y); // p = 6
        let s = g.add(p, x); // s = p + x = 8, ds/dx = y + 1 = 4
        g.matrix_mut(s).dw[0] = 1.0;
        g.backward();
        assert_eq!(g.matrix(x).dw, vec![4.0]);
        assert_eq!(g.matrix(y).dw, vec![2.0]);
    }

    #[test]
    fn test_grad_check_tanh() {
        let mut rng = StdRng::seed_from_u64(1);
        let m = random_matrix(3, 2, &mut rng);
        grad_check(&[m], |g, ids| g.tanh(ids[0]), 1e-4);
    }

    #[test]
    fn test_grad_check_sigmoid() {
        let mut rng = StdRng::seed_from_u64(2);
        let m = random_matrix(3, 2, &mut rng);
        grad_check(&[m], |g, ids| g.sigmoid(ids[0]), 1e-4);
    }

    #[test]
    fn test_grad_check_relu() {
        // Keep values away from the kink at zero
        let m = Matrix::new(2, 2, vec![1.5, -2.0, 0.75, -0.5]);
        grad_check(&[m], |g, ids| g.relu(ids[0]), 1e-4);
    }

    #[test]
    fn test_grad_check_mul() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random_matrix(3, 4, &mut rng);
        let b = random_matrix(4, 2, &mut rng);
        grad_check(&[a, b], |g, ids| g.mul(ids[0], ids[1]), 1e-4);
    }

    #[test]
    fn test_grad_check_add() {
        let mut rng = StdRng::seed_from_u64(4);
        let a = random_matrix(2, 3, &mut rng);
        let b = random_matrix(2, 3, &mut rng);
        grad_check(&[a, b], |g, ids| g.add(ids[0], ids[1]), 1e-4);
    }

    #[test]
    fn test_grad_check_dot() {
        let mut rng = StdRng::seed_from_u64(5);
        let a = random_matrix(4, 1, &mut rng);
        let b = random_matrix(4, 1, &mut rng);
        grad_check(&[a, b], |g, ids| g.dot(ids[0], ids[1]), 1e-4);
    }

    #[test]
    fn test_grad_check_eltmul() {
        let mut rng = StdRng::seed_from_u64(6);
        let a = random_matrix(3, 3, &mut rng);
        let b = random_matrix(3, 3, &mut rng);
        grad_check(&[a, b], |g, ids| g.eltmul(ids[0], ids[1]), 1e-4);
    }

    #[test]
    fn test_grad_check_pluck() {
        let mut rng = StdRng::seed_from_u64(7);
        let m = random_matrix(4, 3, &mut rng);
        grad_check(&[m], |g, ids| g.pluck(ids[0], 2), 1e-4);
    }

    #[test]
    fn test_grad_check_chained_ops() {
        // A small composite expression exercising the whole tape:
        // out = dot(tanh(W * x), sigmoid(x))
        let mut rng = StdRng::seed_from_u64(8);
        let w = random_matrix(3, 3, &mut rng);
        let x = random_matrix(3, 1, &mut rng);
        grad_check(
            &[w, x],
            |g, ids| {
                let h = g.mul(ids[0], ids[1]);
                let t = g.tanh(h);
                let s = g.sigmoid(ids[1]);
                g.dot(t, s)
            },
            1e-4,
        );
    }

    #[test]
    fn test_inference_graph_records_nothing() {
        let mut g = Graph::inference();
        let a = g.insert(Matrix::column(&[1.0, 2.0]));
        let t = g.tanh(a);
        assert_eq!(g.matrix(t).w.len(), 2);
        assert!(g.tape.is_empty());
    }

    #[test]
    #[should_panic(expected = "inference graph")]
    fn test_backward_on_inference_graph_panics() {
        let mut g = Graph::inference();
        let a = g.insert(Matrix::column(&[1.0]));
        let _ = g.tanh(a);
        g.backward();
    }

    #[test]
    #[should_panic(expected = "consumed graph")]
    fn test_backward_twice_panics() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::column(&[1.0]));
        let _ = g.tanh(a);
        g.backward();
        g.backward();
    }

    #[test]
    #[should_panic(expected = "consumed graph")]
    fn test_op_after_backward_panics() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::column(&[1.0]));
        let _ = g.tanh(a);
        g.backward();
        let _ = g.sigmoid(a);
    }

    #[test]
    #[should_panic(expected = "consumed graph")]
    fn test_insert_after_backward_panics() {
        let mut g = Graph::recording();
        let a = g.insert(Matrix::column(&[1.0]));
        let _ = g.tanh(a);
        g.backward();
        g.insert(Matrix::zeros(1, 1));
    }
}
