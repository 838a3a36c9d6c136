//! Metric formatting, persistence and throughput accounting.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use kto_common::{TrainingArgs, ZeroPaddingDataset};

/// Named scalar metrics, sorted by key.
pub type Metrics = BTreeMap<String, f64>;

pub const ALL_RESULTS_NAME: &str = "all_results.json";

// ── Formatting ──────────────────────────────────────────────────────────────

/// `h:mm:ss.cc`
pub fn secs_to_timecode(secs: f64) -> String {
    let secs = secs.max(0.0);
    let whole = secs.trunc() as u64;
    let centis = ((secs - secs.trunc()) * 100.0) as u64;
    format!(
        "{}:{:02}:{:02}.{:02}",
        whole / 3600,
        (whole / 60) % 60,
        whole % 60,
        centis
    )
}

fn format_value(key: &str, value: f64) -> String {
    if key.ends_with("_runtime") {
        return secs_to_timecode(value);
    }
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let rounded = format!("{value:.4}");
    let trimmed = rounded.trim_end_matches('0');
    trimmed.strip_suffix('.').unwrap_or(trimmed).to_string()
}

/// Human-readable `(key, value)` pairs: runtimes as timecodes, floats
/// rounded to four decimals.
pub fn metrics_format(metrics: &Metrics) -> Vec<(String, String)> {
    metrics
        .iter()
        .map(|(k, v)| (k.clone(), format_value(k, *v)))
        .collect()
}

/// Log a `***** {split} metrics *****` block.
pub fn log_metrics(split: &str, metrics: &Metrics) {
    let formatted = metrics_format(metrics);
    let key_width = formatted.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let value_width = formatted.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    tracing::info!("***** {split} metrics *****");
    for (key, value) in formatted {
        tracing::info!("  {key:<key_width$} = {value:>value_width$}");
    }
}

// ── Persistence ─────────────────────────────────────────────────────────────

/// Write `{split}_results.json` and merge the same entries into
/// `all_results.json`.
pub fn save_metrics(output_dir: &Path, split: &str, metrics: &Metrics) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("create {}", output_dir.display()))?;
    let path = output_dir.join(format!("{split}_results.json"));
    std::fs::write(&path, serde_json::to_string_pretty(metrics)?)
        .with_context(|| format!("write {}", path.display()))?;

    let all_path = output_dir.join(ALL_RESULTS_NAME);
    let mut all: Metrics = if all_path.exists() {
        let text = std::fs::read_to_string(&all_path)
            .with_context(|| format!("read {}", all_path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", all_path.display()))?
    } else {
        Metrics::new()
    };
    all.extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));
    std::fs::write(&all_path, serde_json::to_string_pretty(&all)?)
        .with_context(|| format!("write {}", all_path.display()))?;
    Ok(())
}

// ── Throughput ──────────────────────────────────────────────────────────────

/// `{split}_runtime`, `{split}_samples_per_second`, `{split}_steps_per_second`.
pub fn speed_metrics(split: &str, start: Instant, num_samples: usize, num_steps: usize) -> Metrics {
    let runtime = start.elapsed().as_secs_f64();
    let per_sec = |n: usize| {
        if runtime > 0.0 {
            n as f64 / runtime
        } else {
            0.0
        }
    };
    let round = |v: f64| (v * 1e4).round() / 1e4;
    Metrics::from([
        (format!("{split}_runtime"), round(runtime)),
        (format!("{split}_samples_per_second"), round(per_sec(num_samples))),
        (format!("{split}_steps_per_second"), round(per_sec(num_steps))),
    ])
}

/// Real vs padded tokens seen over `max_steps` optimiser updates.
///
/// Returns `(effective_tokens, total_tokens)`; every consumed sequence
/// counts `max_seq_len` toward the total. The dataset is cycled when the
/// run outlasts one epoch.
pub fn calculate_effective_tokens(
    args: &TrainingArgs,
    dataset: &ZeroPaddingDataset,
    max_steps: usize,
    max_seq_len: usize,
) -> (usize, usize) {
    let sequences = max_steps * args.total_train_batch_size();
    let lens: Vec<usize> = dataset.sequences().iter().map(|s| s.len()).collect();
    let effective = lens.iter().cycle().take(sequences).sum();
    (effective, sequences * max_seq_len)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kto_common::TokenizedExample;

    #[test]
    fn runtime_formats_as_timecode() {
        assert_eq!(secs_to_timecode(3725.257), "1:02:05.25");
        assert_eq!(secs_to_timecode(0.5), "0:00:00.50");
    }

    #[test]
    fn floats_round_to_four_places() {
        let m = Metrics::from([
            ("train_loss".to_string(), 0.693_147_18),
            ("train_runtime".to_string(), 61.0),
            ("progress_or_epoch".to_string(), 2.0),
        ]);
        let f: BTreeMap<_, _> = metrics_format(&m).into_iter().collect();
        assert_eq!(f["train_loss"], "0.6931");
        assert_eq!(f["train_runtime"], "0:01:01.00");
        assert_eq!(f["progress_or_epoch"], "2");
    }

    #[test]
    fn save_merges_all_results() {
        let tmp = tempfile::tempdir().unwrap();
        save_metrics(tmp.path(), "train", &Metrics::from([("train_loss".into(), 0.5)])).unwrap();
        save_metrics(tmp.path(), "eval", &Metrics::from([("eval_loss".into(), 0.7)])).unwrap();
        let text = std::fs::read_to_string(tmp.path().join(ALL_RESULTS_NAME)).unwrap();
        let all: Metrics = serde_json::from_str(&text).unwrap();
        assert_eq!(all.len(), 2);
        assert!(tmp.path().join("train_results.json").exists());
        assert!(tmp.path().join("eval_results.json").exists());
    }

    #[test]
    fn effective_tokens_cycle_the_dataset() {
        let example = |n: usize| TokenizedExample {
            input_ids: vec![1; n],
            position_ids: (0..n as u32).collect(),
            attn_end_rows: vec![n as u32; n],
            response_span: 1..n,
            kl_span: 1..n,
            desirable: true,
        };
        let ds = ZeroPaddingDataset::new(vec![example(3), example(5)], 5, false);
        assert_eq!(ds.len(), 2);
        let args = TrainingArgs {
            per_device_train_batch_size: 1,
            gradient_accumulation_steps: 3,
            ..Default::default()
        };
        let (effective, total) = calculate_effective_tokens(&args, &ds, 1, 8);
        assert_eq!(effective, 3 + 5 + 3);
        assert_eq!(total, 24);
    }
}
