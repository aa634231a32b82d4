//! String-Keyed Parameter Collections
//!
//! A [`Network`] maps stable string keys to owned parameter matrices. It is
//! the generic, model-agnostic container the solver and persistence layers
//! work against: any model can export its parameters into one (see
//! [`Lstm::to_network`](crate::Lstm::to_network)) or be assembled from one.
//!
//! ## Key Order
//!
//! Keys iterate in sorted order, always. Solvers that flatten all gradients
//! into a single vector rely on that order being identical between calls and
//! across save/load cycles, so the map is a `BTreeMap` rather than a hash
//! map.
//!
//! ## Persistence
//!
//! The JSON form is the mapping `key -> {rows, columns, values}`. Gradients
//! are never written; loading always yields zeroed gradient buffers.

use crate::matrix::Matrix;
use crate::solver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered mapping from parameter name to owned matrix
///
/// No structural sharing: every entry owns its storage, and cloning the
/// network deep-copies every matrix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Network {
    params: BTreeMap<String, Matrix>,
}

impl Network {
    /// Create an empty parameter mapping
    pub fn new() -> Self {
        Self {
            params: BTreeMap::new(),
        }
    }

    /// Insert (or replace) a parameter under `key`
    pub fn insert(&mut self, key: String, m: Matrix) {
        self.params.insert(key, m);
    }

    /// Borrow a parameter by key
    pub fn get(&self, key: &str) -> Option<&Matrix> {
        self.params.get(key)
    }

    /// Mutably borrow a parameter by key
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Matrix> {
        self.params.get_mut(key)
    }

    /// Number of parameters in the mapping
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate entries in sorted key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Matrix)> {
        self.params.iter()
    }

    /// Iterate entries mutably, in sorted key order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Matrix)> {
        self.params.iter_mut()
    }

    /// Reset every parameter's gradient to zero
    pub fn zero_grads(&mut self) {
        for m in self.params.values_mut() {
            m.zero_grads();
        }
    }

    /// Concatenate all gradients into one column vector, in sorted key order
    ///
    /// For solvers that want a single flat gradient. The layout is stable:
    /// the same network always flattens the same way.
    pub fn flatten_grads(&self) -> Matrix {
        let total: usize = self.params.values().map(|m| m.dw.len()).sum();
        let mut flat = Vec::with_capacity(total);
        for m in self.params.values() {
            flat.extend_from_slice(&m.dw);
        }
        Matrix::new(total, 1, flat)
    }

    /// Apply one gradient-descent step to every parameter and clear the
    /// gradients (see [`solver::update_matrix`])
    pub fn update(&mut self, learning_rate: f64) {
        for m in self.params.values_mut() {
            solver::update_matrix(m, learning_rate);
        }
    }

    /// L2 norm over all parameter gradients
    pub fn grad_norm(&self) -> f64 {
        solver::grad_norm(self.params.values())
    }

    /// Proportionally rescale all gradients when their norm exceeds
    /// `max_norm`; returns the norm measured before scaling
    /// (see [`solver::clip_gradients`])
    pub fn clip_gradients(&mut self, max_norm: f64) -> f64 {
        solver::clip_gradients(self.params.values_mut().collect(), max_norm)
    }

    /// Serialize the mapping to JSON (`key -> {rows, columns, values}`)
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Restore a mapping from its JSON form; all gradients come back zeroed
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
