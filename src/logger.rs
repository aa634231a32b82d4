//! Training Logger
//!
//! Tracks training metrics to a CSV file and the console. The CSV can be
//! loaded later for plotting or model comparison.
//!
//! ## CSV Format
//!
//! - `step`: Training step (sequence) number
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: Current learning rate
//! - `loss`: Per-symbol cross-entropy for the step
//! - `perplexity`: exp(loss), a more interpretable form of the same number
//! - `grad_norm`: Gradient L2 norm before clipping
//! - `sample`: Optional generated text sample
//!
//! ## Perplexity
//!
//! Perplexity measures how "surprised" the model is by the data:
//! a perfect model scores 1.0, random guessing over a vocabulary of V
//! symbols scores about V. Lower is better.

use std::fs::File;
use std::io::Write;
use std::time::Instant;

/// CSV/console logger for training metrics
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create a logger writing to `log_path`
    ///
    /// Creates the CSV file and writes its header row.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use lethe::TrainingLogger;
    /// let logger = TrainingLogger::new("training_log.csv")?;
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn new(log_path: &str) -> std::io::Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(
            log_file,
            "step,elapsed_seconds,learning_rate,loss,perplexity,grad_norm,sample"
        )?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Log one training step to CSV and console
    ///
    /// # Arguments
    ///
    /// * `step` - Step number
    /// * `learning_rate` - Learning rate in effect
    /// * `loss` - Per-symbol cross-entropy
    /// * `grad_norm` - Gradient norm before clipping
    /// * `sample` - Optional generated text to record alongside the metrics
    pub fn log(
        &mut self,
        step: usize,
        learning_rate: f64,
        loss: f64,
        grad_norm: f64,
        sample: Option<&str>,
    ) -> std::io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let perplexity = loss.exp();

        // Escape quotes so samples stay valid CSV
        let sample_escaped = sample.map(|s| s.replace('"', "\"\"")).unwrap_or_default();

        writeln!(
            self.log_file,
            "{},{:.2},{:.6},{:.4},{:.2},{:.4},\"{}\"",
            step, elapsed, learning_rate, loss, perplexity, grad_norm, sample_escaped
        )?;
        // Flush immediately so a crash loses nothing
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f64();
        println!(
            "Step {:5} | Time: {:7.1}s (+{:.1}s) | LR: {:.5} | Loss: {:.4} | Perplexity: {:.2} | |grad|: {:.3}",
            step, elapsed, step_time, learning_rate, loss, perplexity, grad_norm
        );
        if let Some(text) = sample {
            println!("  Sample: \"{}\"", text);
        }

        self.last_log_time = Instant::now();
        Ok(())
    }
}
