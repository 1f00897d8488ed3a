#![allow(dead_code)]

use std::path::{Path, PathBuf};

use pretraining_data::write_token_shards;
use serde_json::{json, Value};
use training::TrainingConfig;

pub const VOCAB: usize = 32;
pub const SEQ_LEN: usize = 8;

/// Writes `sequences` deterministic token rows into `dir/corpus`.
pub fn write_corpus(dir: &Path, sequences: usize) -> PathBuf {
    let tokens: Vec<u32> = (0..sequences * SEQ_LEN)
        .map(|i| ((i * 7 + i / SEQ_LEN) % VOCAB) as u32)
        .collect();
    let destination = dir.join("corpus");
    write_token_shards(&tokens, SEQ_LEN, 16, &destination, "train").unwrap();
    destination
}

/// Sequences in the default corpus. Covers 20 steps of batch 4 without
/// wrapping.
pub const SEQUENCES: usize = 96;

/// A tiny single-process run rooted at `root`, with `patch` merged on top.
pub fn config(root: &Path, patch: Value) -> TrainingConfig {
    config_with_corpus(root, SEQUENCES, patch)
}

/// Like [`config`] over a corpus of `sequences` rows.
pub fn config_with_corpus(root: &Path, sequences: usize, patch: Value) -> TrainingConfig {
    let corpus = write_corpus(root, sequences);
    let mut value = json!({
        "run": { "run_name": "test", "runs_dir": root.join("runs") },
        "model": { "vocab_size": VOCAB, "hidden_dim": 16, "n_layers": 1, "n_heads": 2 },
        "data": {
            "train_path": corpus,
            "sequence_length": SEQ_LEN,
            "batch_size": 4,
            "seed": 42
        },
        "optimizer": { "learning_rate": 0.01 },
        "scheduler": { "total_steps": 20 },
        "training": { "max_steps": 20 },
        "checkpointing": { "every_n_steps": 10 },
        "logging": { "stdout": false, "tensorboard": false }
    });
    merge(&mut value, patch);
    TrainingConfig::from_value(value, root).unwrap()
}

fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

pub fn flatten(tensors: &std::collections::BTreeMap<String, candle_core::Tensor>) -> Vec<f32> {
    tensors
        .values()
        .flat_map(|t| t.flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect()
}
