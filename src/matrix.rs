//! Dense Matrix with Gradient Storage
//!
//! This module provides the core data structure that flows through every
//! differentiable operation: a dense 2D matrix that carries both its values
//! and an accumulator for gradients.
//!
//! ## Core Concepts
//!
//! - **Values (`w`)**: Flat `Vec<f64>` storing all elements in row-major order
//! - **Gradients (`dw`)**: Same shape as `w`, accumulated (never overwritten)
//!   during the backward pass
//!
//! ## Memory Layout
//!
//! For a 2x3 matrix, values are stored as:
//! `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
//!
//! Element `(row, col)` lives at flat index `row * columns + col`.
//!
//! ## Gradient Discipline
//!
//! `dw` starts zero-filled and is only ever added to by backward operations.
//! It is cleared explicitly (by [`Matrix::zero_grads`] or a solver step) and
//! reset to zero when a matrix is deserialized. Gradients are never persisted.
//!
//! ## Example
//!
//! ```rust
//! use lethe::Matrix;
//!
//! let mut m = Matrix::zeros(2, 3);
//! m.set(1, 2, 5.0);
//! assert_eq!(m.get(1, 2), 5.0);
//! assert_eq!(m.w.len(), 6);
//! assert!(m.dw.iter().all(|&g| g == 0.0));
//! ```

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// A dense 2D matrix holding values and accumulated gradients
///
/// This is the unit of data for the whole engine: network parameters,
/// intermediate activations, and outputs are all `Matrix` instances.
///
/// # Fields
///
/// - `rows`, `columns`: Shape of the matrix
/// - `w`: Values in row-major order, length `rows * columns`
/// - `dw`: Gradient accumulator, always the same length as `w`
///
/// # Invariant
///
/// `w.len() == dw.len() == rows * columns` at all times. The accessors keep
/// this invariant; code that mutates `w`/`dw` directly must preserve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "MatrixRecord", try_from = "MatrixRecord")]
pub struct Matrix {
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub columns: usize,
    /// Values, row-major
    pub w: Vec<f64>,
    /// Gradients, accumulated during the backward pass
    pub dw: Vec<f64>,
}

impl Matrix {
    /// Create a matrix from existing values
    ///
    /// Gradients start at zero.
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != rows * columns`.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use lethe::Matrix;
    /// let m = Matrix::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
    /// assert_eq!(m.get(1, 0), 3.0);
    /// ```
    pub fn new(rows: usize, columns: usize, values: Vec<f64>) -> Self {
        assert_eq!(
            values.len(),
            rows * columns,
            "Value length ({}) doesn't match shape [{}, {}] (expected {})",
            values.len(),
            rows,
            columns,
            rows * columns
        );
        let dw = vec![0.0; values.len()];
        Self {
            rows,
            columns,
            w: values,
            dw,
        }
    }

    /// Create a zero-filled matrix
    ///
    /// # Example
    ///
    /// ```rust
    /// # use lethe::Matrix;
    /// let m = Matrix::zeros(3, 4);
    /// assert_eq!(m.w.len(), 12);
    /// assert!(m.w.iter().all(|&x| x == 0.0));
    /// ```
    pub fn zeros(rows: usize, columns: usize) -> Self {
        Self::new(rows, columns, vec![0.0; rows * columns])
    }

    /// Create a column vector from a slice of values
    ///
    /// Shorthand for a `len x 1` matrix; column vectors are the shape of
    /// network inputs, hidden states, and biases throughout the crate.
    pub fn column(values: &[f64]) -> Self {
        Self::new(values.len(), 1, values.to_vec())
    }

    /// Create a matrix filled with Gaussian noise
    ///
    /// Samples every value from N(mean, std) using the caller's generator,
    /// so initialization is reproducible with a seeded RNG.
    ///
    /// # Arguments
    ///
    /// * `rows`, `columns` - Shape
    /// * `mean`, `std` - Parameters of the normal distribution
    /// * `rng` - Random number generator to draw from
    ///
    /// # Panics
    ///
    /// Panics if `std` is negative or not finite.
    pub fn randn<R: Rng>(rows: usize, columns: usize, mean: f64, std: f64, rng: &mut R) -> Self {
        let mut m = Self::zeros(rows, columns);
        m.fill_randn(mean, std, rng);
        m
    }

    /// Overwrite every value with a fresh Gaussian sample
    ///
    /// Gradients are left untouched.
    pub fn fill_randn<R: Rng>(&mut self, mean: f64, std: f64, rng: &mut R) {
        let normal = Normal::new(mean, std)
            .unwrap_or_else(|e| panic!("Invalid normal distribution (std = {}): {}", std, e));
        for v in self.w.iter_mut() {
            *v = normal.sample(rng);
        }
    }

    /// Read the value at `(row, col)`
    ///
    /// Slow but careful accessor; use direct `w` indexing in hot loops.
    ///
    /// # Panics
    ///
    /// Panics if `(row, col)` is outside the matrix.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let ix = self.columns * row + col;
        assert!(
            row < self.rows && col < self.columns && ix < self.w.len(),
            "Index ({}, {}) out of bounds for [{}, {}] matrix",
            row,
            col,
            self.rows,
            self.columns
        );
        self.w[ix]
    }

    /// Write the value at `(row, col)`
    ///
    /// # Panics
    ///
    /// Panics if `(row, col)` is outside the matrix.
    pub fn set(&mut self, row: usize, col: usize, v: f64) {
        let ix = self.columns * row + col;
        assert!(
            row < self.rows && col < self.columns && ix < self.w.len(),
            "Index ({}, {}) out of bounds for [{}, {}] matrix",
            row,
            col,
            self.rows,
            self.columns
        );
        self.w[ix] = v;
    }

    /// Bulk-copy external values into `w`, in order
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != w.len()`; callers must supply a slice of
    /// exactly the matrix's element count.
    pub fn set_from(&mut self, values: &[f64]) {
        assert_eq!(
            values.len(),
            self.w.len(),
            "Source length ({}) doesn't match matrix element count ({})",
            values.len(),
            self.w.len()
        );
        self.w.copy_from_slice(values);
    }

    /// Copy a column vector into column `col` of this matrix
    ///
    /// # Panics
    ///
    /// Panics if `source` is not a column vector with `rows` equal to this
    /// matrix's `rows`, or if `col` is out of range.
    pub fn set_column(&mut self, source: &Matrix, col: usize) {
        assert_eq!(
            source.columns, 1,
            "set_column source must be a column vector, got [{}, {}]",
            source.rows, source.columns
        );
        assert_eq!(
            source.rows, self.rows,
            "set_column row mismatch: source has {} rows, matrix has {}",
            source.rows, self.rows
        );
        assert!(
            col < self.columns,
            "Column index {} out of bounds for [{}, {}] matrix",
            col,
            self.rows,
            self.columns
        );
        for (q, &v) in source.w.iter().enumerate() {
            self.w[self.columns * q + col] = v;
        }
    }

    /// Reset all accumulated gradients to zero
    ///
    /// Backward passes only ever add to `dw`; this is the explicit reset the
    /// caller (typically a solver step) performs between updates.
    pub fn zero_grads(&mut self) {
        for g in self.dw.iter_mut() {
            *g = 0.0;
        }
    }
}

/// Persisted form of a matrix: shape plus values, no gradients
///
/// This is the on-disk record for every parameter; loading one always yields
/// a matrix with freshly zeroed gradients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixRecord {
    pub rows: usize,
    pub columns: usize,
    pub values: Vec<f64>,
}

impl From<Matrix> for MatrixRecord {
    fn from(m: Matrix) -> Self {
        Self {
            rows: m.rows,
            columns: m.columns,
            values: m.w,
        }
    }
}

impl TryFrom<MatrixRecord> for Matrix {
    type Error = String;

    fn try_from(record: MatrixRecord) -> Result<Self, Self::Error> {
        if record.values.len() != record.rows * record.columns {
            return Err(format!(
                "matrix record has {} values but shape [{}, {}] needs {}",
                record.values.len(),
                record.rows,
                record.columns,
                record.rows * record.columns
            ));
        }
        Ok(Matrix::new(record.rows, record.columns, record.values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zeros_shape_and_gradients() {
        let m = Matrix::zeros(3, 2);
        assert_eq!(m.rows, 3);
        assert_eq!(m.columns, 2);
        assert_eq!(m.w.len(), 6);
        assert_eq!(m.dw.len(), 6);
        assert!(m.w.iter().all(|&x| x == 0.0));
        assert!(m.dw.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_get_set_row_major() {
        let mut m = Matrix::zeros(2, 3);
        m.set(0, 2, 1.5);
        m.set(1, 0, -2.0);
        assert_eq!(m.get(0, 2), 1.5);
        assert_eq!(m.get(1, 0), -2.0);
        // row-major flat layout
        assert_eq!(m.w[2], 1.5);
        assert_eq!(m.w[3], -2.0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds_panics() {
        let m = Matrix::zeros(2, 2);
        m.get(2, 0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_column_overflow_panics() {
        let m = Matrix::zeros(2, 2);
        // (0, 3) would alias (1, 1) through the flat index without the
        // per-coordinate check
        m.get(0, 3);
    }

    #[test]
    fn test_set_from_copies_in_order() {
        let mut m = Matrix::zeros(2, 2);
        m.set_from(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m.w, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(m.dw.iter().all(|&g| g == 0.0));
    }

    #[test]
    #[should_panic(expected = "doesn't match matrix element count")]
    fn test_set_from_wrong_length_panics() {
        let mut m = Matrix::zeros(2, 2);
        m.set_from(&[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_set_column() {
        let mut m = Matrix::zeros(3, 2);
        let col = Matrix::column(&[1.0, 2.0, 3.0]);
        m.set_column(&col, 1);
        assert_eq!(m.get(0, 1), 1.0);
        assert_eq!(m.get(1, 1), 2.0);
        assert_eq!(m.get(2, 1), 3.0);
        // other column untouched
        assert_eq!(m.get(0, 0), 0.0);
    }

    #[test]
    #[should_panic(expected = "row mismatch")]
    fn test_set_column_row_mismatch_panics() {
        let mut m = Matrix::zeros(3, 2);
        let col = Matrix::column(&[1.0, 2.0]);
        m.set_column(&col, 0);
    }

    #[test]
    fn test_serde_round_trip_resets_gradients() {
        let mut m = Matrix::new(2, 2, vec![1.0, -2.5, 3.0, 0.25]);
        m.dw = vec![9.0, 9.0, 9.0, 9.0];

        let json = serde_json::to_string(&m).unwrap();
        let restored: Matrix = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.rows, 2);
        assert_eq!(restored.columns, 2);
        assert_eq!(restored.w, m.w);
        assert!(restored.dw.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_serde_record_shape() {
        let m = Matrix::new(1, 2, vec![1.0, 2.0]);
        let json = serde_json::to_string(&m).unwrap();
        // Gradients must never be persisted
        assert!(json.contains("\"values\""));
        assert!(!json.contains("dw"));
    }

    #[test]
    fn test_deserialize_bad_length_fails() {
        let json = r#"{"rows": 2, "columns": 2, "values": [1.0, 2.0]}"#;
        let result: Result<Matrix, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_randn_is_seeded_and_reasonable() {
        let mut rng = StdRng::seed_from_u64(7);
        let m = Matrix::randn(20, 20, 0.0, 0.08, &mut rng);

        let mut rng2 = StdRng::seed_from_u64(7);
        let m2 = Matrix::randn(20, 20, 0.0, 0.08, &mut rng2);
        assert_eq!(m.w, m2.w, "same seed must reproduce the same matrix");

        let mean: f64 = m.w.iter().sum::<f64>() / m.w.len() as f64;
        assert!(mean.abs() < 0.02, "sample mean {} too far from 0", mean);
        assert!(m.w.iter().all(|&v| v.abs() < 1.0));
        assert!(m.dw.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_zero_grads() {
        let mut m = Matrix::zeros(2, 2);
        m.dw = vec![1.0, 2.0, 3.0, 4.0];
        m.zero_grads();
        assert!(m.dw.iter().all(|&g| g == 0.0));
    }
}
