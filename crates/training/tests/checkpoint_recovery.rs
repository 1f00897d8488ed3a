mod common;

use std::{
    collections::BTreeMap,
    fs,
    sync::{Arc, Mutex},
};

use candle_core::Device;
use model::{DecoderModel, NoopObserver};
use serde_json::json;
use tempfile::tempdir;
use training::{
    checkpoint::{CheckpointManager, MetricSnapshot, SaveRequest, TrainingState},
    data::{DataSequencer, SequencerSettings},
    publish::{DirectoryPublisher, PublishJob, PublishQueue, Publisher},
    ErrorKind, ModelAdapter, TrainingError,
};

use common::{config, flatten};

fn trained_request(root: &std::path::Path, steps: u64) -> SaveRequest {
    let cfg = config(root, json!({}));
    let model = DecoderModel::new(cfg.model_config(&Device::Cpu)).unwrap();
    let mut adapter = ModelAdapter::from_config(model, &cfg, Device::Cpu).unwrap();
    let mut sequencer = DataSequencer::open(
        &cfg.data.train_path,
        cfg.data.sequence_length,
        SequencerSettings::from_config(&cfg, 0, 1),
        0,
    )
    .unwrap();
    for _ in 0..steps {
        let batch = sequencer.next_batch().unwrap();
        for micro_batch in &batch.micro_batches {
            let output = adapter.forward(micro_batch, &mut NoopObserver).unwrap();
            adapter.backward(&output).unwrap();
        }
        adapter.step(1e-2).unwrap();
    }
    let (model, optimizer) = adapter.export_state().unwrap();
    let mut state = TrainingState::initial(42, 1);
    state.global_step = steps;
    state.sample_cursor = sequencer.sample_position(steps);
    state.tokens_seen = steps * 4 * 7;
    SaveRequest {
        state,
        model,
        optimizer,
        dynamics: None,
        metrics: MetricSnapshot::default(),
    }
}

fn manager(root: &std::path::Path, keep_last: Option<usize>) -> CheckpointManager {
    CheckpointManager::new(root.join("checkpoints"), "fingerprint", keep_last, None, Device::Cpu)
}

#[test]
fn save_then_load_is_bit_identical() {
    let tmp = tempdir().unwrap();
    let request = trained_request(tmp.path(), 3);
    let manager = manager(tmp.path(), None);
    let manifest = manager.save(&request).unwrap();
    assert_eq!(manifest.step, 3);

    let loaded = manager.load(3).unwrap();
    assert_eq!(loaded.state, request.state);
    assert_eq!(flatten(&loaded.model.parameters), flatten(&request.model.parameters));
    assert_eq!(loaded.optimizer.step, request.optimizer.step);
    assert_eq!(
        flatten(&loaded.optimizer.first_moment),
        flatten(&request.optimizer.first_moment)
    );
    assert_eq!(
        flatten(&loaded.optimizer.second_moment),
        flatten(&request.optimizer.second_moment)
    );
    let names: Vec<&String> = loaded.model.parameters.keys().collect();
    let expected: Vec<&String> = request.model.parameters.keys().collect();
    assert_eq!(names, expected);
}

#[test]
fn interrupted_save_is_never_reported_latest() {
    let tmp = tempdir().unwrap();
    let request = trained_request(tmp.path(), 1);
    let manager = manager(tmp.path(), None);
    manager.save(&request).unwrap();

    // A save of step 2 that died before its rename.
    let partial = manager.root().join(".tmp-step_00000002");
    fs::create_dir_all(&partial).unwrap();
    fs::write(partial.join("model.safetensors"), b"truncated").unwrap();
    // A directory under a final name but without a manifest.
    fs::create_dir_all(manager.step_dir(3)).unwrap();

    assert_eq!(manager.latest().unwrap(), Some(1));
    assert_eq!(manager.available_steps().unwrap(), vec![1]);
    assert!(manager.load(1).is_ok());
    assert!(manager.load(3).is_err());

    assert_eq!(manager.cleanup_incomplete().unwrap(), 1);
    assert!(!partial.exists());
    assert_eq!(manager.latest().unwrap(), Some(1));
}

#[test]
fn retention_leaves_exactly_k_payloads_and_every_manifest() {
    let tmp = tempdir().unwrap();
    let base = trained_request(tmp.path(), 1);
    let manager = manager(tmp.path(), Some(3));
    for step in 1..=6 {
        let mut request = base.clone();
        request.state.global_step = step;
        manager.save(&request).unwrap();
    }
    assert_eq!(manager.available_steps().unwrap(), vec![4, 5, 6]);
    assert_eq!(manager.latest().unwrap(), Some(6));
    let history: Vec<u64> = manager.manifests().unwrap().iter().map(|m| m.step).collect();
    assert_eq!(history, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
        manager.load(2).unwrap_err().kind(),
        ErrorKind::Storage
    );
}

#[test]
fn v1_checkpoint_loads_with_migrated_manifest() {
    let tmp = tempdir().unwrap();
    let request = trained_request(tmp.path(), 2);
    let manager = manager(tmp.path(), None);
    let manifest = manager.save(&request).unwrap();

    let files: BTreeMap<String, serde_json::Value> = manifest
        .files
        .iter()
        .map(|f| (f.filename.clone(), json!({ "sha256": f.sha256, "bytes": f.bytes })))
        .collect();
    let v1 = json!({
        "version": 1,
        "step": 2,
        "created_unix_timestamp": manifest.created_unix_timestamp,
        "config_sha256": manifest.config_sha256,
        "files": files,
    });
    fs::write(
        manager.step_dir(2).join("manifest.json"),
        serde_json::to_vec_pretty(&v1).unwrap(),
    )
    .unwrap();

    let loaded = manager.load(2).unwrap();
    assert_eq!(loaded.manifest.schema_version, 2);
    assert_eq!(loaded.manifest.world_size, 1);
    assert_eq!(loaded.state.global_step, 2);
}

#[test]
fn persistent_storage_failure_keeps_the_previous_latest() {
    let tmp = tempdir().unwrap();
    let base = trained_request(tmp.path(), 1);
    let manager = manager(tmp.path(), None);
    manager.save(&base).unwrap();

    // The manifest history cannot be written on either attempt.
    let history = manager.root().join("manifests");
    fs::remove_dir_all(&history).unwrap();
    fs::write(&history, b"not a directory").unwrap();

    let mut next = base.clone();
    next.state.global_step = 2;
    let err = manager.save(&next).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    assert_eq!(manager.latest().unwrap(), Some(1));
    assert_eq!(manager.load(1).unwrap().state.global_step, 1);
    assert!(!manager.root().join(".tmp-step_00000002").exists());
}

/// Mirrors into a directory, failing the first attempt of step 1.
struct OfflineOnce {
    inner: DirectoryPublisher,
    attempts: Arc<Mutex<Vec<(u64, bool)>>>,
}

impl Publisher for OfflineOnce {
    fn publish(&self, job: &PublishJob) -> Result<(), TrainingError> {
        let mut attempts = self.attempts.lock().unwrap();
        if job.step == 1 && attempts.is_empty() {
            attempts.push((job.step, false));
            return Err(TrainingError::Publish("hub unreachable".into()));
        }
        attempts.push((job.step, true));
        self.inner.publish(job)
    }

    fn describe(&self) -> String {
        "offline-once".into()
    }
}

#[test]
fn failed_publish_is_retried_with_the_next_checkpoint() {
    let tmp = tempdir().unwrap();
    let mirror = tempdir().unwrap();
    let base = trained_request(tmp.path(), 1);
    let manager = manager(tmp.path(), None);
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let queue = PublishQueue::spawn(Box::new(OfflineOnce {
        inner: DirectoryPublisher::new(mirror.path(), "run"),
        attempts: Arc::clone(&attempts),
    }));

    for step in 1..=2 {
        let mut request = base.clone();
        request.state.global_step = step;
        let manifest = manager.save(&request).unwrap();
        queue.enqueue(PublishJob {
            step,
            directory: manager.step_dir(step),
            files: manifest.files.iter().map(|f| f.filename.clone()).collect(),
        });
    }
    drop(queue);

    assert_eq!(*attempts.lock().unwrap(), vec![(1, false), (1, true), (2, true)]);
    for step in ["step_00000001", "step_00000002"] {
        assert!(mirror.path().join("run").join(step).join("model.safetensors").is_file());
    }
}
