//! Preference data: JSONL loading, KL pairing, tokenisation.
//!
//! Each JSONL line is one pointwise preference example:
//!
//! ```text
//! {"src": ["question"], "tgt": [], "response": ["answer"], "sort": [1]}
//! ```
//!
//! `sort[0] > 0` marks the response desirable. Before tokenisation every
//! example receives a second, mismatched response ([`attach_kl_responses`])
//! used to estimate the KL term of the objective.
//!
//! A tokenised example lays out the prompt once and both responses after it,
//! each response block starting with a copy of the last prompt token (the
//! *anchor*) so both are predicted from the same context:
//!
//! ```text
//! prompt[..a] | anchor r_1 .. r_n | anchor k_1 .. k_m
//! ```
//!
//! Position ids restart at `a` for each block and the per-column end rows
//! hide the first block from the second.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use tokenizers::Tokenizer;

use crate::args::DataArgs;

// ── Raw examples ────────────────────────────────────────────────────────────

/// One pointwise preference example as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceExample {
    /// User turns; the last one is the prompt being answered.
    #[serde(deserialize_with = "one_or_many")]
    pub src: Vec<String>,
    /// Earlier assistant turns (`src.len() - 1` of them).
    #[serde(default, deserialize_with = "one_or_many")]
    pub tgt: Vec<String>,
    /// `[response]` on disk, `[response, kl_response]` after pairing.
    #[serde(deserialize_with = "one_or_many")]
    pub response: Vec<String>,
    pub sort: Vec<i64>,
}

impl PreferenceExample {
    pub fn is_desirable(&self) -> bool {
        self.sort.first().copied().unwrap_or(0) > 0
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Load examples from a JSONL file or every `.jsonl`/`.json` file in a directory.
pub fn load_preference_jsonl(path: &Path) -> Result<Vec<PreferenceExample>> {
    let mut out = Vec::new();
    for file in collect_files(path)? {
        let reader = BufReader::new(
            File::open(&file).with_context(|| format!("open dataset {}", file.display()))?,
        );
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let example: PreferenceExample = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid preference example", file.display(), lineno + 1))?;
            if example.response.len() != 1 || example.sort.len() != 1 {
                bail!(
                    "{}:{}: pointwise examples hold exactly one `response` and one `sort` (got {} and {})",
                    file.display(),
                    lineno + 1,
                    example.response.len(),
                    example.sort.len()
                );
            }
            out.push(example);
        }
    }
    Ok(out)
}

/// Collect JSONL files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("dataset path does not exist: {}", path.display());
    }
    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e == "jsonl" || e == "json")
                    .unwrap_or(false)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

// ── KL pairing ──────────────────────────────────────────────────────────────

/// Index of the example whose response serves as the KL response of `i`.
///
/// `(n - i) mod n`: example 0 pairs with itself, the rest pair in mirror order.
pub fn kl_partner(i: usize, n: usize) -> usize {
    (n - i) % n
}

/// Append a mismatched response and a lower sort value to every example.
pub fn attach_kl_responses(examples: &mut [PreferenceExample]) {
    let n = examples.len();
    let partners: Vec<String> = (0..n)
        .map(|i| examples[kl_partner(i, n)].response[0].clone())
        .collect();
    for (example, kl_response) in examples.iter_mut().zip(partners) {
        example.response.push(kl_response);
        example.sort.push(example.sort[0] - 1);
    }
}

// ── Tokenisation ────────────────────────────────────────────────────────────

/// Text → token ids, plus the special ids the layout needs.
pub trait TextEncoder: Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn eos_token_id(&self) -> u32;
    fn bos_token_id(&self) -> Option<u32>;
    fn pad_token_id(&self) -> u32;
}

/// `tokenizer.json` tokenizer with resolved special ids. No chat template.
pub struct PreferenceTokenizer {
    inner: Tokenizer,
    eos: u32,
    bos: Option<u32>,
    pad: u32,
    source: PathBuf,
}

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<eos>", "<|end_of_text|>"];
const BOS_CANDIDATES: &[&str] = &["<s>", "<|begin_of_text|>", "<bos>"];

impl PreferenceTokenizer {
    /// Load from a directory holding `tokenizer.json`, or the file itself.
    ///
    /// Explicit ids (from the model config) win over token-name lookup.
    pub fn from_pretrained(
        path: &Path,
        eos_token_id: Option<u32>,
        bos_token_id: Option<u32>,
        pad_token_id: Option<u32>,
    ) -> Result<Self> {
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };
        let inner = Tokenizer::from_file(&file)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", file.display()))?;
        let lookup = |names: &[&str]| names.iter().find_map(|n| inner.token_to_id(n));
        let eos = match eos_token_id.or_else(|| lookup(EOS_CANDIDATES)) {
            Some(id) => id,
            None => bail!("cannot resolve an eos token for {}", file.display()),
        };
        let bos = bos_token_id.or_else(|| lookup(BOS_CANDIDATES));
        let pad = pad_token_id.unwrap_or(eos);
        Ok(Self {
            inner,
            eos,
            bos,
            pad,
            source: file,
        })
    }

    /// Path of the `tokenizer.json` this was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextEncoder for PreferenceTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn eos_token_id(&self) -> u32 {
        self.eos
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    fn pad_token_id(&self) -> u32 {
        self.pad
    }
}

/// One example in packed layout (see module docs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub position_ids: Vec<u32>,
    /// Per key column: first example-local query row that can no longer see it.
    pub attn_end_rows: Vec<u32>,
    /// Logits rows predicting the response tokens.
    pub response_span: Range<usize>,
    /// Logits rows predicting the KL response tokens.
    pub kl_span: Range<usize>,
    pub desirable: bool,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Split `budget` tokens between two responses, trimming the longer first.
fn split_budget(n: usize, m: usize, budget: usize) -> (usize, usize) {
    if n + m <= budget {
        return (n, m);
    }
    let half = budget / 2;
    let n_keep = n.min(half.max(budget.saturating_sub(m)));
    let m_keep = m.min(budget - n_keep);
    (n_keep, m_keep)
}

/// Tokenise one KL-paired example. `Ok(None)` when nothing fits.
pub fn preprocess_example(
    example: &PreferenceExample,
    encoder: &dyn TextEncoder,
    data_args: &DataArgs,
) -> Result<Option<TokenizedExample>> {
    if example.response.len() < 2 || example.sort.is_empty() {
        bail!("example has no KL response; call attach_kl_responses first");
    }
    if example.src.is_empty() {
        bail!("example has no `src` turn");
    }
    if example.tgt.len() + 1 != example.src.len() {
        bail!(
            "`tgt` must hold one turn fewer than `src` (got {} src, {} tgt)",
            example.src.len(),
            example.tgt.len()
        );
    }
    let eos = encoder.eos_token_id();

    let mut prompt = Vec::new();
    let bos = encoder.bos_token_id();
    if let Some(bos) = bos {
        prompt.push(bos);
    }
    for (i, turn) in example.src.iter().enumerate() {
        prompt.extend(encoder.encode(turn)?);
        if let Some(reply) = example.tgt.get(i) {
            prompt.extend(encoder.encode(reply)?);
            prompt.push(eos);
        }
    }
    if prompt.len() > data_args.max_prompt_len {
        // Left-truncate behind the BOS token.
        let keep_bos = usize::from(bos.is_some() && data_args.max_prompt_len > 1);
        let excess = prompt.len() - data_args.max_prompt_len;
        prompt.drain(keep_bos..keep_bos + excess);
    }
    if prompt.is_empty() {
        prompt.push(eos);
    }

    let mut response = encoder.encode(&example.response[0])?;
    response.push(eos);
    let mut kl_response = encoder.encode(&example.response[1])?;
    kl_response.push(eos);

    let p = prompt.len();
    let budget = data_args.max_seq_len.saturating_sub(p + 1);
    if budget < 2 {
        return Ok(None);
    }
    let (n, m) = split_budget(response.len(), kl_response.len(), budget);
    response.truncate(n);
    kl_response.truncate(m);

    let a = p - 1;
    let anchor = prompt[a];
    let b = a + 1 + n;
    let total = b + 1 + m;

    let mut input_ids = Vec::with_capacity(total);
    input_ids.extend_from_slice(&prompt[..a]);
    input_ids.push(anchor);
    input_ids.extend_from_slice(&response);
    input_ids.push(anchor);
    input_ids.extend_from_slice(&kl_response);

    let mut position_ids: Vec<u32> = (0..=(a + n) as u32).collect();
    position_ids.extend(a as u32..=(a + m) as u32);

    let mut attn_end_rows = vec![total as u32; total];
    for end in &mut attn_end_rows[a..b] {
        *end = b as u32;
    }

    Ok(Some(TokenizedExample {
        input_ids,
        position_ids,
        attn_end_rows,
        response_span: a..a + n,
        kl_span: b..b + m,
        desirable: example.is_desirable(),
    }))
}

/// Tokenise a dataset in parallel, dropping examples that cannot fit.
pub fn preprocess_dataset(
    examples: &[PreferenceExample],
    encoder: &dyn TextEncoder,
    data_args: &DataArgs,
) -> Result<Vec<TokenizedExample>> {
    let results: Vec<Option<TokenizedExample>> = examples
        .par_iter()
        .enumerate()
        .map(|(i, ex)| {
            preprocess_example(ex, encoder, data_args)
                .with_context(|| format!("preprocess example {i}"))
        })
        .collect::<Result<_>>()?;
    let dropped = results.iter().filter(|r| r.is_none()).count();
    if dropped > 0 {
        tracing::warn!(dropped, "examples skipped: prompt leaves no room for responses");
    }
    Ok(results.into_iter().flatten().collect())
}

// ── Tests ───────────────────────────────────────────────────────────────────
