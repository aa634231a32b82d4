//! Train a Character-Level LSTM on a Tiny Embedded Corpus
//!
//! This demo runs the whole stack end to end: embedding lookups via row
//! pluck, per-sequence tape construction, softmax/cross-entropy gradient
//! seeding at the tape boundary, gradient clipping, the update step, and
//! text generation by sampling.
//!
//! ## What You'll See
//!
//! - A two-layer LSTM (~15K parameters) learning next-character prediction
//! - Loss and perplexity falling over a few thousand sequences
//! - Generated samples evolving from noise toward corpus-like fragments
//! - `char_lstm_log.csv` with the full training trace
//! - `char_lstm_model.json` with the final parameters (gradients excluded)
//!
//! ## How Sequences Are Modeled
//!
//! Symbol 0 is a start/end sentinel. For a sentence of n characters the
//! network sees n+1 steps: sentinel -> first char, ..., last char ->
//! sentinel. Each step plucks the source symbol's embedding row, runs one
//! LSTM tick, and scores every vocabulary symbol for the target.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example char_lstm
//! ```
//!
//! Everything is seeded, so two runs produce identical traces.

use lethe::{sample_index, softmax, Graph, Lstm, LstmState, Matrix, Network, TrainingLogger};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// A few sentences are plenty for a network this small to latch onto
const CORPUS: &[&str] = &[
    "the quick brown fox jumps over the lazy dog",
    "pack my box with five dozen liquor jugs",
    "how vexingly quick daft zebras jump",
    "the five boxing wizards jump quickly",
    "sphinx of black quartz judge my vow",
    "a quick movement of the enemy will jeopardize six gunboats",
];

const EMBEDDING_SIZE: usize = 12;
const HIDDEN_SIZES: [usize; 2] = [24, 24];
const LEARNING_RATE: f64 = 0.01;
const CLIP_NORM: f64 = 5.0;
const TRAIN_STEPS: usize = 4000;
const LOG_EVERY: usize = 200;
const SAMPLE_MAX_LEN: usize = 60;

/// Character vocabulary with symbol 0 reserved as the start/end sentinel
struct Vocab {
    chars: Vec<char>,
    index: HashMap<char, usize>,
}

impl Vocab {
    fn build(corpus: &[&str]) -> Self {
        // BTreeSet dedups and yields the characters already sorted
        let chars: Vec<char> = corpus
            .iter()
            .flat_map(|s| s.chars())
            .collect::<std::collections::BTreeSet<char>>()
            .into_iter()
            .collect();
        let index = chars
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i + 1))
            .collect();
        Self { chars, index }
    }

    /// Total symbol count, sentinel included
    fn size(&self) -> usize {
        self.chars.len() + 1
    }

    fn encode(&self, s: &str) -> Vec<usize> {
        s.chars().map(|c| self.index[&c]).collect()
    }

    fn decode_char(&self, ix: usize) -> char {
        self.chars[ix - 1]
    }
}

/// Run one sentence through its own graph and accumulate gradients
///
/// Returns the per-symbol cross-entropy. The same bound parameters serve
/// every timestep, so one backward pass credits the whole sequence.
fn train_sentence(lstm: &mut Lstm, embeddings: &mut Matrix, symbols: &[usize]) -> f64 {
    let mut g = Graph::recording();
    let bound = lstm.bind(&mut g);
    let embed = g.insert(embeddings.clone());

    let mut state: Option<LstmState> = None;
    let mut loss = 0.0;
    let steps = symbols.len() + 1;

    for t in 0..steps {
        let source = if t == 0 { 0 } else { symbols[t - 1] };
        let target = if t == symbols.len() { 0 } else { symbols[t] };

        let x = g.pluck(embed, source);
        let step = bound.forward(&mut g, x, state.as_ref());

        let probs = softmax(g.matrix(step.output));
        loss -= probs.w[target].ln();

        // d(cross_entropy(softmax(scores)))/d(scores) = probs - one_hot
        let out = g.matrix_mut(step.output);
        out.dw.copy_from_slice(&probs.w);
        out.dw[target] -= 1.0;

        state = Some(step.state);
    }

    g.backward();
    lstm.absorb(&g, &bound);
    for (dw, src) in embeddings.dw.iter_mut().zip(&g.matrix(embed).dw) {
        *dw += src;
    }

    loss / steps as f64
}

/// Sample a sentence from the model, stopping at the sentinel
fn generate(lstm: &Lstm, embeddings: &Matrix, vocab: &Vocab, rng: &mut StdRng) -> String {
    let mut g = Graph::inference();
    let bound = lstm.bind(&mut g);
    let embed = g.insert(embeddings.clone());

    let mut state: Option<LstmState> = None;
    let mut text = String::new();
    let mut ix = 0;

    loop {
        let x = g.pluck(embed, ix);
        let step = bound.forward(&mut g, x, state.as_ref());
        let probs = softmax(g.matrix(step.output));
        ix = sample_index(&probs.w, rng);
        if ix == 0 || text.chars().count() >= SAMPLE_MAX_LEN {
            break;
        }
        text.push(vocab.decode_char(ix));
        state = Some(step.state);
    }
    text
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let vocab = Vocab::build(CORPUS);
    let sentences: Vec<Vec<usize>> = CORPUS.iter().map(|s| vocab.encode(s)).collect();

    let mut rng = StdRng::seed_from_u64(42);
    let mut lstm = Lstm::new(EMBEDDING_SIZE, &HIDDEN_SIZES, vocab.size(), &mut rng);
    let mut embeddings = Matrix::randn(vocab.size(), EMBEDDING_SIZE, 0.0, 0.08, &mut rng);

    println!("Vocabulary: {} symbols (sentinel included)", vocab.size());
    println!(
        "Parameters: {} (network) + {} (embeddings)",
        lstm.param_count(),
        embeddings.w.len()
    );

    let mut logger = TrainingLogger::new("char_lstm_log.csv")?;
    let mut smooth_loss = (vocab.size() as f64).ln(); // start at chance level

    for step in 1..=TRAIN_STEPS {
        let sentence = &sentences[step % sentences.len()];
        let loss = train_sentence(&mut lstm, &mut embeddings, sentence);
        smooth_loss = 0.99 * smooth_loss + 0.01 * loss;

        // clip the network and the embedding table, then step both
        let norm = lstm.clip_gradients(CLIP_NORM);
        lethe::solver::clip_gradients(vec![&mut embeddings], CLIP_NORM);
        lstm.update(LEARNING_RATE);
        lethe::solver::update_matrix(&mut embeddings, LEARNING_RATE);

        if step % LOG_EVERY == 0 {
            let sample = generate(&lstm, &embeddings, &vocab, &mut rng);
            logger.log(step, LEARNING_RATE, smooth_loss, norm, Some(&sample))?;
        }
    }

    // Persist the trained parameters; gradients never hit the disk
    let mut params = lstm.to_network();
    params.insert("embeddings".to_string(), embeddings);
    std::fs::write("char_lstm_model.json", params.to_json()?)?;
    println!("Saved parameters for {} matrices to char_lstm_model.json", params.len());

    // Show that the saved form restores cleanly
    let restored = Network::from_json(&std::fs::read_to_string("char_lstm_model.json")?)?;
    println!("Restored {} matrices", restored.len());

    Ok(())
}
