use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use super::{TrainingState, TRAINING_STATE_FILENAME};
use crate::{
    metrics::{EvaluationSummary, MetricRecord},
    TrainingError,
};

/// Manifest schema written by this build.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Metrics known when the checkpoint was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    #[serde(default)]
    pub train: Option<MetricRecord>,
    #[serde(default)]
    pub eval: Option<EvaluationSummary>,
}

/// Self-description of one checkpoint directory. Also appended to the
/// manifest history so metric timelines survive pruning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub schema_version: u32,
    pub step: u64,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub world_size: usize,
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub metrics: MetricSnapshot,
}

impl CheckpointManifest {
    pub fn file(&self, filename: &str) -> Option<&FileRecord> {
        self.files.iter().find(|record| record.filename == filename)
    }
}

/// First published layout: files as a map, no metrics, no world size.
#[derive(Debug, Deserialize)]
struct ManifestV1 {
    step: u64,
    created_unix_timestamp: u64,
    config_sha256: String,
    files: BTreeMap<String, FileDigestV1>,
}

#[derive(Debug, Deserialize)]
struct FileDigestV1 {
    sha256: String,
    bytes: u64,
}

/// Reads a manifest of any supported schema and upgrades it in memory.
/// `checkpoint_dir`, when the payload still exists, lets a v1 manifest
/// recover its world size from the stored training state.
pub fn read_manifest(
    path: &Path,
    checkpoint_dir: Option<&Path>,
) -> Result<CheckpointManifest, TrainingError> {
    let bytes = fs::read(path).map_err(|err| TrainingError::storage(path, err))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|err| TrainingError::corrupt(path, format!("manifest is not JSON: {err}")))?;

    let version = value
        .get("schema_version")
        .or_else(|| value.get("version"))
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| TrainingError::IncompatibleCheckpoint {
            path: path.to_path_buf(),
            reason: "manifest has no schema version".to_string(),
        })?;

    match version {
        2 => serde_json::from_value(value)
            .map_err(|err| TrainingError::corrupt(path, format!("invalid manifest: {err}"))),
        1 => {
            let v1: ManifestV1 = serde_json::from_value(value)
                .map_err(|err| TrainingError::corrupt(path, format!("invalid v1 manifest: {err}")))?;
            Ok(migrate_v1(v1, checkpoint_dir))
        }
        other => Err(TrainingError::IncompatibleCheckpoint {
            path: path.to_path_buf(),
            reason: format!("schema version {other}, this build reads up to {SCHEMA_VERSION}"),
        }),
    }
}

fn migrate_v1(v1: ManifestV1, checkpoint_dir: Option<&Path>) -> CheckpointManifest {
    let world_size = checkpoint_dir
        .and_then(|dir| fs::read(dir.join(TRAINING_STATE_FILENAME)).ok())
        .and_then(|bytes| serde_json::from_slice::<TrainingState>(&bytes).ok())
        .map_or(1, |state| state.world_size);
    CheckpointManifest {
        schema_version: SCHEMA_VERSION,
        step: v1.step,
        created_unix_timestamp: v1.created_unix_timestamp,
        config_sha256: v1.config_sha256,
        world_size,
        files: v1
            .files
            .into_iter()
            .map(|(filename, digest)| FileRecord {
                filename,
                sha256: digest.sha256,
                bytes: digest.bytes,
            })
            .collect(),
        metrics: MetricSnapshot::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn v1_manifest_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(
            &path,
            r#"{"version":1,"step":30,"created_unix_timestamp":5,"config_sha256":"ab",
               "files":{"model.safetensors":{"sha256":"00","bytes":4}}}"#,
        )
        .unwrap();
        let manifest = read_manifest(&path, None).unwrap();
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
        assert_eq!(manifest.step, 30);
        assert_eq!(manifest.file("model.safetensors").unwrap().bytes, 4);
        assert!(manifest.metrics.train.is_none());
    }

    #[test]
    fn newer_schema_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, r#"{"schema_version":3,"step":1}"#).unwrap();
        let err = read_manifest(&path, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleCheckpoint);
    }
}
