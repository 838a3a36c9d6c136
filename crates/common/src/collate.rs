//! Packed sequences → Candle tensors.
//!
//! Every sequence is padded to `max_len`. Padding columns are visible only
//! to their own row so no softmax row is fully masked.
//!
//! Response log-probs are pooled with selector matrices: row `e` of
//! `response_selector` has a 1 at every flattened `(batch, row)` index whose
//! logits predict a response token of example `e`. A single matmul then turns
//! per-token log-probs into per-example sums while keeping gradients.

use candle_core::{Device, Result, Tensor};

use crate::packing::PackedSequence;

/// Additive bias for masked attention scores.
pub const MASKED_BIAS: f32 = -1e9;

/// Which attention-mask representation the model consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskLayout {
    /// Per-column end rows ("flash mask"); the model expands them on device.
    EndRows,
    /// Materialised `(batch, 1, seq, seq)` additive bias.
    Dense,
}

pub enum BatchMask {
    /// `(batch, seq)` u32 end rows.
    EndRows(Tensor),
    /// `(batch, 1, seq, seq)` f32 additive bias.
    Dense(Tensor),
}

/// A collated batch of packed preference sequences.
pub struct PreferenceBatch {
    /// `(batch, seq)` u32.
    pub input_ids: Tensor,
    /// `(batch, seq)` u32, the input shifted left by one.
    pub labels: Tensor,
    /// `(batch, seq)` u32.
    pub position_ids: Tensor,
    pub mask: BatchMask,
    /// `(examples, batch * seq)` f32.
    pub response_selector: Tensor,
    /// `(examples, batch * seq)` f32.
    pub kl_selector: Tensor,
    pub desirable: Vec<bool>,
    pub num_sequences: usize,
    /// Non-padding tokens.
    pub num_tokens: usize,
}

impl PreferenceBatch {
    pub fn num_examples(&self) -> usize {
        self.desirable.len()
    }
}

/// Whether query `row` may attend key `col` given per-column end rows.
#[inline]
pub fn mask_allows(end_rows: &[u32], row: usize, col: usize) -> bool {
    col <= row && (row as u32) < end_rows[col]
}

/// Pad end rows so padding columns are visible only to their own row.
fn padded_end_rows(seq: &PackedSequence, max_len: usize) -> Vec<u32> {
    let mut out = seq.attn_end_rows.clone();
    out.extend((seq.len()..max_len).map(|c| c as u32 + 1));
    out
}

/// Collate packed sequences into a batch.
pub fn collate(
    seqs: &[&PackedSequence],
    max_len: usize,
    pad_id: u32,
    layout: MaskLayout,
    device: &Device,
) -> Result<PreferenceBatch> {
    let b = seqs.len();
    let t = max_len;
    if b == 0 {
        candle_core::bail!("cannot collate an empty batch");
    }
    if let Some(long) = seqs.iter().find(|s| s.len() > t) {
        candle_core::bail!("sequence of {} tokens exceeds max_len {t}", long.len());
    }

    let mut input_ids = Vec::with_capacity(b * t);
    let mut labels = Vec::with_capacity(b * t);
    let mut position_ids = Vec::with_capacity(b * t);
    let mut end_rows = Vec::with_capacity(b * t);
    for seq in seqs {
        let pad = t - seq.len();
        input_ids.extend_from_slice(&seq.input_ids);
        input_ids.extend(std::iter::repeat(pad_id).take(pad));
        position_ids.extend_from_slice(&seq.position_ids);
        position_ids.extend(std::iter::repeat(0u32).take(pad));
        end_rows.extend(padded_end_rows(seq, t));
    }
    for row in input_ids.chunks(t) {
        labels.extend_from_slice(&row[1..]);
        labels.push(pad_id);
    }

    let n: usize = seqs.iter().map(|s| s.examples.len()).sum();
    let mut response_sel = vec![0f32; n * b * t];
    let mut kl_sel = vec![0f32; n * b * t];
    let mut desirable = Vec::with_capacity(n);
    let mut e = 0usize;
    for (bi, seq) in seqs.iter().enumerate() {
        for spans in &seq.examples {
            let base = e * b * t + bi * t;
            for row in spans.response.clone() {
                response_sel[base + row] = 1.0;
            }
            for row in spans.kl.clone() {
                kl_sel[base + row] = 1.0;
            }
            desirable.push(spans.desirable);
            e += 1;
        }
    }

    let mask = match layout {
        MaskLayout::EndRows => BatchMask::EndRows(Tensor::from_vec(end_rows, (b, t), device)?),
        MaskLayout::Dense => {
            let mut bias = vec![MASKED_BIAS; b * t * t];
            for bi in 0..b {
                let ends = &end_rows[bi * t..(bi + 1) * t];
                for row in 0..t {
                    for col in 0..=row {
                        if mask_allows(ends, row, col) {
                            bias[bi * t * t + row * t + col] = 0.0;
                        }
                    }
                }
            }
            BatchMask::Dense(Tensor::from_vec(bias, (b, 1, t, t), device)?)
        }
    };

    Ok(PreferenceBatch {
        input_ids: Tensor::from_vec(input_ids, (b, t), device)?,
        labels: Tensor::from_vec(labels, (b, t), device)?,
        position_ids: Tensor::from_vec(position_ids, (b, t), device)?,
        mask,
        response_selector: Tensor::from_vec(response_sel, (n, b * t), device)?,
        kl_selector: Tensor::from_vec(kl_sel, (n, b * t), device)?,
        desirable,
        num_sequences: b,
        num_tokens: seqs.iter().map(|s| s.len()).sum(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
