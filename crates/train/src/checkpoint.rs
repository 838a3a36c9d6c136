//! Checkpoint directories and trainer state.
//!
//! A checkpoint is `output_dir/checkpoint-<step>/` holding the trainable
//! weights (full model or LoRA adapters) plus `trainer_state.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const PREFIX_CHECKPOINT_DIR: &str = "checkpoint";
pub const TRAINER_STATE_NAME: &str = "trainer_state.json";

// ── Trainer state ───────────────────────────────────────────────────────────

/// Progress and log history persisted with every checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerState {
    pub global_step: usize,
    /// Fractional epoch reached at `global_step`.
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub train_batch_size: usize,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    /// One entry per logging / evaluation event, each carrying `step`.
    pub log_history: Vec<BTreeMap<String, f64>>,
}

impl TrainerState {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn push_log(&mut self, mut entry: BTreeMap<String, f64>) {
        entry.insert("step".into(), self.global_step as f64);
        entry.insert("epoch".into(), self.epoch);
        self.log_history.push(entry);
    }
}

// ── Discovery and rotation ──────────────────────────────────────────────────

pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("{PREFIX_CHECKPOINT_DIR}-{step}"))
}

/// Step number of a `checkpoint-<step>` directory name.
fn checkpoint_step(name: &str) -> Option<usize> {
    name.strip_prefix(PREFIX_CHECKPOINT_DIR)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Checkpoint directories under `output_dir`, oldest first.
pub fn sorted_checkpoints(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }
    for entry in std::fs::read_dir(output_dir)
        .with_context(|| format!("list {}", output_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(checkpoint_step);
        if let Some(step) = step {
            found.push((step, path));
        }
    }
    found.sort_by_key(|(step, _)| *step);
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

/// Most recent checkpoint in `output_dir`, if any.
pub fn get_last_checkpoint(output_dir: &Path) -> Result<Option<PathBuf>> {
    Ok(sorted_checkpoints(output_dir)?.pop())
}

/// Delete the oldest checkpoints so at most `limit` remain; `0` keeps all.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let checkpoints = sorted_checkpoints(output_dir)?;
    let excess = checkpoints.len().saturating_sub(limit);
    let removed: Vec<PathBuf> = checkpoints.into_iter().take(excess).collect();
    for dir in &removed {
        tracing::info!(
            "Deleting older checkpoint [{}] due to save_total_limit",
            dir.display()
        );
        std::fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    Ok(removed)
}

// ── Tests ───────────────────────────────────────────────────────────────────
