//! Zero-padding packing: several tokenised examples per sequence.
//!
//! Examples keep their own position ids and attention end rows; packing
//! only shifts the end rows and spans by the example's offset, so examples
//! in one sequence never attend to each other.

use std::ops::Range;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::TokenizedExample;

/// Spans of one example inside a packed sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExampleSpans {
    pub response: Range<usize>,
    pub kl: Range<usize>,
    pub desirable: bool,
}

/// Several examples concatenated into one sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedSequence {
    pub input_ids: Vec<u32>,
    pub position_ids: Vec<u32>,
    pub attn_end_rows: Vec<u32>,
    pub examples: Vec<ExampleSpans>,
}

impl PackedSequence {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    fn push(&mut self, ex: &TokenizedExample) {
        let offset = self.input_ids.len();
        self.input_ids.extend_from_slice(&ex.input_ids);
        self.position_ids.extend_from_slice(&ex.position_ids);
        self.attn_end_rows
            .extend(ex.attn_end_rows.iter().map(|&e| e + offset as u32));
        self.examples.push(ExampleSpans {
            response: ex.response_span.start + offset..ex.response_span.end + offset,
            kl: ex.kl_span.start + offset..ex.kl_span.end + offset,
            desirable: ex.desirable,
        });
    }
}

/// Packed dataset over preprocessed preference examples.
pub struct ZeroPaddingDataset {
    sequences: Vec<PackedSequence>,
    max_length: usize,
}

impl ZeroPaddingDataset {
    /// Pack examples into sequences of at most `max_length` tokens.
    ///
    /// Sequential packing keeps the example order. Greedy packing sorts by
    /// length and places each example into the first sequence with room
    /// (first-fit decreasing). Examples longer than `max_length` are skipped.
    pub fn new(examples: Vec<TokenizedExample>, max_length: usize, greedy: bool) -> Self {
        let (fitting, skipped): (Vec<_>, Vec<_>) =
            examples.into_iter().partition(|e| e.len() <= max_length && !e.is_empty());
        if !skipped.is_empty() {
            tracing::warn!(skipped = skipped.len(), max_length, "examples longer than max_length skipped");
        }
        let sequences = if greedy {
            pack_greedy(&fitting, max_length)
        } else {
            pack_sequential(&fitting, max_length)
        };
        Self {
            sequences,
            max_length,
        }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PackedSequence> {
        self.sequences.get(index)
    }

    pub fn sequences(&self) -> &[PackedSequence] {
        &self.sequences
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn num_examples(&self) -> usize {
        self.sequences.iter().map(|s| s.examples.len()).sum()
    }

    /// Non-padding tokens across all sequences.
    pub fn num_tokens(&self) -> usize {
        self.sequences.iter().map(|s| s.len()).sum()
    }

    /// Sequence indices grouped into batches; the last batch may be short.
    ///
    /// With `shuffle` the order is a permutation drawn from `seed`, so the
    /// same seed reproduces the same epoch.
    pub fn batch_indices(&self, batch_size: usize, shuffle: bool, seed: u64) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.sequences.len()).collect();
        if shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        order
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.sequences.len().div_ceil(batch_size.max(1))
    }
}

fn pack_sequential(examples: &[TokenizedExample], max_length: usize) -> Vec<PackedSequence> {
    let mut out = Vec::new();
    let mut current = PackedSequence::default();
    for ex in examples {
        if current.len() + ex.len() > max_length && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        current.push(ex);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn pack_greedy(examples: &[TokenizedExample], max_length: usize) -> Vec<PackedSequence> {
    let mut order: Vec<usize> = (0..examples.len()).collect();
    order.sort_by(|&a, &b| examples[b].len().cmp(&examples[a].len()).then(a.cmp(&b)));
    let mut bins: Vec<PackedSequence> = Vec::new();
    for i in order {
        let ex = &examples[i];
        match bins.iter_mut().find(|b| b.len() + ex.len() <= max_length) {
            Some(bin) => bin.push(ex),
            None => {
                let mut bin = PackedSequence::default();
                bin.push(ex);
                bins.push(bin);
            }
        }
    }
    bins
}

// ── Tests ───────────────────────────────────────────────────────────────────
