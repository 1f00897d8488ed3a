//! Durable, self-describing checkpoints.
//!
//! Layout under `<run_dir>/checkpoints/`:
//!
//! ```text
//! LATEST                      name of the newest complete checkpoint
//! manifests/step_XXXXXXXX.json  manifest history, never pruned
//! step_XXXXXXXX/
//!     model.safetensors
//!     optimizer.safetensors   first_moment.* / second_moment.*
//!     optimizer.json
//!     training_state.json
//!     learning_dynamics.safetensors   (sampled steps only)
//!     manifest.json           written last
//! ```
//!
//! A checkpoint is assembled in `.tmp-step_XXXXXXXX` and renamed into place
//! once every file is synced, so a reader never observes a partial
//! directory under its final name. `LATEST` moves only after the rename.

mod manifest;

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub use manifest::{read_manifest, CheckpointManifest, FileRecord, MetricSnapshot, SCHEMA_VERSION};

use crate::{
    adapter::ModelSnapshot,
    capture::LearningDynamicsRecord,
    distributed::{broadcast_value, DistributedContext, ReduceOp},
    optimizer::OptimizerSnapshot,
    TrainingConfig, TrainingError,
};

const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_TENSORS_FILENAME: &str = "optimizer.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
pub(crate) const TRAINING_STATE_FILENAME: &str = "training_state.json";
const DYNAMICS_FILENAME: &str = "learning_dynamics.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";
const LATEST_FILENAME: &str = "LATEST";
const MANIFEST_HISTORY_DIR: &str = "manifests";
const STEP_PREFIX: &str = "step_";
const TMP_PREFIX: &str = ".tmp-";
const TRASH_PREFIX: &str = ".trash-";

/// Loop position and seeds, identical on every rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Number of completed optimizer steps.
    pub global_step: u64,
    pub epoch: u64,
    /// Global sample position the next step starts from.
    pub sample_cursor: u64,
    pub tokens_seen: u64,
    pub master_seed: u64,
    pub rank_seeds: Vec<u64>,
    pub world_size: usize,
}

impl TrainingState {
    pub fn initial(master_seed: u64, world_size: usize) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            sample_cursor: 0,
            tokens_seen: 0,
            master_seed,
            rank_seeds: rank_seeds(master_seed, world_size),
            world_size,
        }
    }
}

/// Derived per-rank seeds. Stable across resumes for the same master seed.
pub fn rank_seeds(master_seed: u64, world_size: usize) -> Vec<u64> {
    (0..world_size as u64)
        .map(|rank| master_seed ^ rank.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct OptimizerIndex {
    step: u64,
    parameters: Vec<String>,
}

/// Everything one checkpoint persists.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub state: TrainingState,
    pub model: ModelSnapshot,
    pub optimizer: OptimizerSnapshot,
    pub dynamics: Option<LearningDynamicsRecord>,
    pub metrics: MetricSnapshot,
}

#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub manifest: CheckpointManifest,
    pub state: TrainingState,
    pub model: ModelSnapshot,
    pub optimizer: OptimizerSnapshot,
    pub dynamics: Option<LearningDynamicsRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSelector {
    Latest,
    Step(u64),
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    config_sha256: String,
    keep_last: Option<usize>,
    milestone_every: Option<u64>,
    device: Device,
}

impl CheckpointManager {
    pub fn new(
        root: impl Into<PathBuf>,
        config_sha256: impl Into<String>,
        keep_last: Option<usize>,
        milestone_every: Option<u64>,
        device: Device,
    ) -> Self {
        Self {
            root: root.into(),
            config_sha256: config_sha256.into(),
            keep_last,
            milestone_every,
            device,
        }
    }

    pub fn from_config(config: &TrainingConfig, device: Device) -> Result<Self, TrainingError> {
        Ok(Self::new(
            config.checkpoint_dir(),
            config.fingerprint()?,
            config.checkpointing.keep_last,
            config.checkpointing.milestone_every,
            device,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step_dir(&self, step: u64) -> PathBuf {
        self.root.join(step_name(step))
    }

    /// Removes leftovers of interrupted saves. Returns how many were removed.
    pub fn cleanup_incomplete(&self) -> Result<usize, TrainingError> {
        let mut removed = 0;
        for entry in read_dir_entries(&self.root)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TMP_PREFIX) || name.starts_with(TRASH_PREFIX) {
                let path = entry.path();
                remove_path(&path)?;
                warn!(path = %path.display(), "removed incomplete checkpoint");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Writes a checkpoint, retrying once on a storage failure. The previous
    /// `LATEST` stays valid if both attempts fail.
    pub fn save(&self, request: &SaveRequest) -> Result<CheckpointManifest, TrainingError> {
        let step = request.state.global_step;
        retry_storage_once(|attempt| {
            if attempt > 0 {
                warn!(step, "retrying checkpoint write");
                if let Err(err) = remove_path(&self.root.join(tmp_name(step))) {
                    debug!(step, error = %err, "stale staging directory left in place");
                }
            }
            self.write_checkpoint(request)
        })
    }

    /// Collective save: every rank enters, only the primary builds and writes
    /// the checkpoint, and every rank learns the outcome before leaving.
    pub fn save_collective<F>(
        &self,
        ctx: &dyn DistributedContext,
        build: F,
    ) -> Result<CheckpointManifest, TrainingError>
    where
        F: FnOnce() -> Result<SaveRequest, TrainingError>,
    {
        ctx.barrier()?;
        let local = if ctx.is_primary() {
            Some(build().and_then(|request| self.save(&request)))
        } else {
            None
        };
        let outcome: Option<Result<CheckpointManifest, String>> = local
            .as_ref()
            .map(|result| result.as_ref().cloned().map_err(|err| err.to_string()));
        let shared: Result<CheckpointManifest, String> = broadcast_value(ctx, outcome.as_ref(), 0)?;
        ctx.barrier()?;

        match (local, shared) {
            (Some(result), _) => result,
            (None, Ok(manifest)) => Ok(manifest),
            (None, Err(message)) => Err(TrainingError::storage(
                &self.root,
                io::Error::new(io::ErrorKind::Other, format!("primary rank failed to save: {message}")),
            )),
        }
    }

    fn write_checkpoint(&self, request: &SaveRequest) -> Result<CheckpointManifest, TrainingError> {
        let step = request.state.global_step;
        create_dir_all(&self.root)?;
        let staging = self.root.join(tmp_name(step));
        if staging.exists() {
            remove_path(&staging)?;
        }
        create_dir_all(&staging)?;

        let mut files = Vec::new();

        let model_path = staging.join(MODEL_FILENAME);
        save_tensors(&to_hash_map(&request.model.parameters, ""), &model_path)?;
        files.push(file_record(&model_path)?);

        let moments_path = staging.join(OPTIMIZER_TENSORS_FILENAME);
        let mut moments = to_hash_map(&request.optimizer.first_moment, "first_moment.");
        moments.extend(to_hash_map(&request.optimizer.second_moment, "second_moment."));
        save_tensors(&moments, &moments_path)?;
        files.push(file_record(&moments_path)?);

        let index_path = staging.join(OPTIMIZER_FILENAME);
        write_json(
            &index_path,
            &OptimizerIndex {
                step: request.optimizer.step,
                parameters: request.optimizer.first_moment.keys().cloned().collect(),
            },
        )?;
        files.push(file_record(&index_path)?);

        let state_path = staging.join(TRAINING_STATE_FILENAME);
        write_json(&state_path, &request.state)?;
        files.push(file_record(&state_path)?);

        if let Some(dynamics) = &request.dynamics {
            let dynamics_path = staging.join(DYNAMICS_FILENAME);
            dynamics.save(&dynamics_path)?;
            sync_file(&dynamics_path)?;
            files.push(file_record(&dynamics_path)?);
        }

        let manifest = CheckpointManifest {
            schema_version: SCHEMA_VERSION,
            step,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.config_sha256.clone(),
            world_size: request.state.world_size,
            files,
            metrics: request.metrics.clone(),
        };
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;
        sync_dir(&staging);

        let target = self.step_dir(step);
        if target.exists() {
            let trash = self
                .root
                .join(format!("{TRASH_PREFIX}{}-{}", step_name(step), unix_timestamp()));
            rename(&target, &trash)?;
            rename(&staging, &target)?;
            remove_path(&trash)?;
        } else {
            rename(&staging, &target)?;
        }
        sync_dir(&self.root);

        let history = self.root.join(MANIFEST_HISTORY_DIR);
        create_dir_all(&history)?;
        write_atomic(&history.join(format!("{}.json", step_name(step))), &json_bytes(&manifest)?)?;
        write_atomic(&self.root.join(LATEST_FILENAME), step_name(step).as_bytes())?;

        info!(step, path = %target.display(), "saved checkpoint");
        self.prune()?;
        Ok(manifest)
    }

    /// Steps of every checkpoint whose payload is present, ascending.
    pub fn available_steps(&self) -> Result<Vec<u64>, TrainingError> {
        let mut steps: Vec<u64> = read_dir_entries(&self.root)?
            .into_iter()
            .filter(|entry| entry.path().join(MANIFEST_FILENAME).is_file())
            .filter_map(|entry| parse_step_name(&entry.file_name().to_string_lossy()))
            .collect();
        steps.sort_unstable();
        Ok(steps)
    }

    /// Newest complete checkpoint. Falls back to scanning when `LATEST` is
    /// missing or points at something that is gone.
    pub fn latest(&self) -> Result<Option<u64>, TrainingError> {
        let pointer = self.root.join(LATEST_FILENAME);
        match fs::read_to_string(&pointer) {
            Ok(contents) => {
                if let Some(step) = parse_step_name(contents.trim()) {
                    if self.step_dir(step).join(MANIFEST_FILENAME).is_file() {
                        return Ok(Some(step));
                    }
                }
                warn!(path = %pointer.display(), "LATEST does not name a complete checkpoint");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(TrainingError::storage(pointer, err)),
        }
        Ok(self.available_steps()?.last().copied())
    }

    pub fn resolve(&self, selector: CheckpointSelector) -> Result<Option<u64>, TrainingError> {
        match selector {
            CheckpointSelector::Latest => self.latest(),
            CheckpointSelector::Step(step) => Ok(Some(step)),
        }
    }

    /// Loads and verifies the checkpoint of `step`.
    pub fn load(&self, step: u64) -> Result<LoadedCheckpoint, TrainingError> {
        let dir = self.step_dir(step);
        let manifest_path = dir.join(MANIFEST_FILENAME);
        if !manifest_path.is_file() {
            let history = self
                .root
                .join(MANIFEST_HISTORY_DIR)
                .join(format!("{}.json", step_name(step)));
            let reason = if history.is_file() {
                "checkpoint payload was pruned; only its manifest remains"
            } else {
                "no checkpoint exists for this step"
            };
            return Err(TrainingError::storage(
                dir,
                io::Error::new(io::ErrorKind::NotFound, reason),
            ));
        }

        let manifest = read_manifest(&manifest_path, Some(&dir))?;
        if manifest.step != step {
            return Err(TrainingError::corrupt(
                &manifest_path,
                format!("manifest describes step {}, expected {step}", manifest.step),
            ));
        }
        for record in &manifest.files {
            validate_file(&dir.join(&record.filename), record)?;
        }
        if manifest.config_sha256 != self.config_sha256 {
            debug!(step, "resuming with a configuration that differs from the checkpoint's");
        }

        let state: TrainingState = read_json(&dir.join(TRAINING_STATE_FILENAME))?;
        let parameters = load_tensors(&dir.join(MODEL_FILENAME), &self.device)?;
        let index: OptimizerIndex = read_json(&dir.join(OPTIMIZER_FILENAME))?;
        let mut moments = load_tensors(&dir.join(OPTIMIZER_TENSORS_FILENAME), &self.device)?;
        let first_moment = take_prefixed(&mut moments, "first_moment.");
        let second_moment = take_prefixed(&mut moments, "second_moment.");
        let dynamics = match manifest.file(DYNAMICS_FILENAME) {
            Some(_) => {
                let tensors = candle_core::safetensors::load(dir.join(DYNAMICS_FILENAME), &self.device)
                    .map_err(|err| tensor_io_error(&dir.join(DYNAMICS_FILENAME), err))?;
                Some(LearningDynamicsRecord::from_tensors(step, tensors))
            }
            None => None,
        };

        info!(step, path = %dir.display(), "loaded checkpoint");
        Ok(LoadedCheckpoint {
            manifest,
            state,
            model: ModelSnapshot { parameters },
            optimizer: OptimizerSnapshot {
                step: index.step,
                first_moment,
                second_moment,
            },
            dynamics,
        })
    }

    /// Rank 0 resolves the selector; every rank then loads the same step.
    /// Fails on every rank if any rank fails to load.
    pub fn load_collective(
        &self,
        ctx: &dyn DistributedContext,
        selector: CheckpointSelector,
    ) -> Result<Option<LoadedCheckpoint>, TrainingError> {
        let resolved = if ctx.is_primary() {
            Some(self.resolve(selector).map_err(|err| err.to_string()))
        } else {
            None
        };
        let step: Result<Option<u64>, String> = broadcast_value(ctx, resolved.as_ref(), 0)?;
        let step = step.map_err(|message| {
            TrainingError::storage(&self.root, io::Error::new(io::ErrorKind::Other, message))
        })?;
        let Some(step) = step else {
            return Ok(None);
        };

        let loaded = self.load(step);
        let mut failed = [if loaded.is_ok() { 0.0 } else { 1.0 }];
        ctx.all_reduce_f64(&mut failed, ReduceOp::Max)?;
        match loaded {
            Err(err) => Err(err),
            Ok(_) if failed[0] > 0.0 => Err(TrainingError::storage(
                self.step_dir(step),
                io::Error::new(io::ErrorKind::Other, "another rank failed to load this checkpoint"),
            )),
            Ok(checkpoint) => Ok(Some(checkpoint)),
        }
    }

    /// Manifest history, ascending by step, including pruned checkpoints.
    pub fn manifests(&self) -> Result<Vec<CheckpointManifest>, TrainingError> {
        let history = self.root.join(MANIFEST_HISTORY_DIR);
        let mut manifests = Vec::new();
        for entry in read_dir_entries(&history)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(step) = name.strip_suffix(".json").and_then(parse_step_name) else {
                continue;
            };
            let dir = self.step_dir(step);
            let payload = dir.is_dir().then_some(dir.as_path());
            manifests.push(read_manifest(&entry.path(), payload)?);
        }
        manifests.sort_by_key(|manifest| manifest.step);
        Ok(manifests)
    }

    /// Applies retention. Keeps the newest `keep_last` payloads, every
    /// milestone, and whatever `LATEST` names. Returns the pruned steps.
    pub fn prune(&self) -> Result<Vec<u64>, TrainingError> {
        let Some(keep_last) = self.keep_last else {
            return Ok(Vec::new());
        };
        let steps = self.available_steps()?;
        let latest = self.latest()?;
        let recent_from = steps.len().saturating_sub(keep_last.max(1));
        let mut pruned = Vec::new();
        for (position, &step) in steps.iter().enumerate() {
            let milestone = self
                .milestone_every
                .is_some_and(|every| every > 0 && step % every == 0);
            if position >= recent_from || milestone || Some(step) == latest {
                continue;
            }
            remove_path(&self.step_dir(step))?;
            debug!(step, "pruned checkpoint payload");
            pruned.push(step);
        }
        Ok(pruned)
    }
}

pub fn step_name(step: u64) -> String {
    format!("{STEP_PREFIX}{step:08}")
}

fn tmp_name(step: u64) -> String {
    format!("{TMP_PREFIX}{}", step_name(step))
}

fn parse_step_name(name: &str) -> Option<u64> {
    name.strip_prefix(STEP_PREFIX)?.parse().ok()
}

fn to_hash_map(tensors: &BTreeMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    tensors
        .iter()
        .map(|(name, tensor)| (format!("{prefix}{name}"), tensor.clone()))
        .collect()
}

/// Runs `op` once more when the first attempt fails with a storage error.
/// `op` receives the attempt index.
fn retry_storage_once<T>(
    mut op: impl FnMut(u32) -> Result<T, TrainingError>,
) -> Result<T, TrainingError> {
    match op(0) {
        Err(err) if err.kind() == crate::ErrorKind::Storage => {
            warn!(error = %err, "transient storage failure");
            op(1)
        }
        other => other,
    }
}

fn take_prefixed(tensors: &mut BTreeMap<String, Tensor>, prefix: &str) -> BTreeMap<String, Tensor> {
    let keys: Vec<String> = tensors
        .keys()
        .filter(|key| key.starts_with(prefix))
        .cloned()
        .collect();
    keys.into_iter()
        .filter_map(|key| {
            let tensor = tensors.remove(&key)?;
            Some((key[prefix.len()..].to_string(), tensor))
        })
        .collect()
}

fn tensor_io_error(path: &Path, err: candle_core::Error) -> TrainingError {
    TrainingError::storage(path, io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), TrainingError> {
    candle_core::safetensors::save(tensors, path).map_err(|err| tensor_io_error(path, err))?;
    sync_file(path)
}

fn load_tensors(path: &Path, device: &Device) -> Result<BTreeMap<String, Tensor>, TrainingError> {
    let tensors =
        candle_core::safetensors::load(path, device).map_err(|err| tensor_io_error(path, err))?;
    Ok(tensors.into_iter().collect())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| TrainingError::storage(path, err))?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TrainingError::corrupt(path, "checkpoint file name is not valid UTF-8"))?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn validate_file(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != record.sha256 {
        return Err(TrainingError::corrupt(path, "checksum does not match manifest"));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| TrainingError::storage(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| TrainingError::storage(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, TrainingError> {
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    data.push(b'\n');
    Ok(data)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let data = json_bytes(value)?;
    let mut file = File::create(path).map_err(|err| TrainingError::storage(path, err))?;
    file.write_all(&data)
        .and_then(|()| file.sync_all())
        .map_err(|err| TrainingError::storage(path, err))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| TrainingError::storage(path, err))?;
    serde_json::from_reader(io::BufReader::new(file))
        .map_err(|err| TrainingError::corrupt(path, format!("failed to parse JSON: {err}")))
}

/// Replaces `path` through a synced sibling and a rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), TrainingError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = File::create(&tmp).map_err(|err| TrainingError::storage(&tmp, err))?;
    file.write_all(data)
        .and_then(|()| file.sync_all())
        .map_err(|err| TrainingError::storage(&tmp, err))?;
    rename(&tmp, path)
}

fn sync_file(path: &Path) -> Result<(), TrainingError> {
    File::open(path)
        .and_then(|file| file.sync_all())
        .map_err(|err| TrainingError::storage(path, err))
}

// Not every platform can fsync a directory handle.
fn sync_dir(path: &Path) {
    if let Err(err) = File::open(path).and_then(|dir| dir.sync_all()) {
        debug!(path = %path.display(), error = %err, "directory sync skipped");
    }
}

fn rename(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| TrainingError::storage(to, err))
}

fn create_dir_all(path: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(path).map_err(|err| TrainingError::storage(path, err))
}

fn remove_path(path: &Path) -> Result<(), TrainingError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TrainingError::storage(path, err)),
    }
}

fn read_dir_entries(dir: &Path) -> Result<Vec<fs::DirEntry>, TrainingError> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(TrainingError::storage(dir, err)),
    };
    reader
        .map(|entry| entry.map_err(|err| TrainingError::storage(dir, err)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use candle_core::DType;

    fn request(step: u64) -> SaveRequest {
        let device = Device::Cpu;
        let weight = Tensor::arange(0f32, 6.0, &device)
            .unwrap()
            .reshape((2, 3))
            .unwrap()
            .affine(1.0, step as f64)
            .unwrap();
        let zeros = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let mut state = TrainingState::initial(7, 1);
        state.global_step = step;
        SaveRequest {
            state,
            model: ModelSnapshot {
                parameters: BTreeMap::from([("embedding.weight".to_string(), weight)]),
            },
            optimizer: OptimizerSnapshot {
                step,
                first_moment: BTreeMap::from([("embedding.weight".to_string(), zeros.clone())]),
                second_moment: BTreeMap::from([("embedding.weight".to_string(), zeros)]),
            },
            dynamics: None,
            metrics: MetricSnapshot::default(),
        }
    }

    fn manager(root: &Path, keep_last: Option<usize>, milestone: Option<u64>) -> CheckpointManager {
        CheckpointManager::new(root, "cfg", keep_last, milestone, Device::Cpu)
    }

    #[test]
    fn saved_checkpoint_loads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), None, None);
        let original = request(10);
        manager.save(&original).unwrap();

        assert_eq!(manager.latest().unwrap(), Some(10));
        let loaded = manager.load(10).unwrap();
        assert_eq!(loaded.state, original.state);
        assert_eq!(loaded.optimizer.step, 10);
        let saved = original.model.parameters["embedding.weight"].to_vec2::<f32>().unwrap();
        let restored = loaded.model.parameters["embedding.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(saved, restored);
        assert!(loaded.manifest.file(MODEL_FILENAME).is_some());
    }

    #[test]
    fn tampered_file_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), None, None);
        manager.save(&request(5)).unwrap();
        fs::write(manager.step_dir(5).join(TRAINING_STATE_FILENAME), b"{}").unwrap();
        let err = manager.load(5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn retention_keeps_recent_milestones_and_all_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Some(2), Some(20));
        for step in [10, 20, 30, 40, 50] {
            manager.save(&request(step)).unwrap();
        }
        assert_eq!(manager.available_steps().unwrap(), vec![20, 40, 50]);
        let history: Vec<u64> = manager.manifests().unwrap().iter().map(|m| m.step).collect();
        assert_eq!(history, vec![10, 20, 30, 40, 50]);

        let err = manager.load(30).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("pruned"));
    }

    #[test]
    fn latest_falls_back_to_scanning() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), None, None);
        manager.save(&request(3)).unwrap();
        manager.save(&request(6)).unwrap();
        fs::remove_file(dir.path().join(LATEST_FILENAME)).unwrap();
        assert_eq!(manager.latest().unwrap(), Some(6));
    }

    #[test]
    fn resaving_a_step_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), None, None);
        manager.save(&request(4)).unwrap();
        let mut second = request(4);
        second.state.tokens_seen = 99;
        manager.save(&second).unwrap();
        assert_eq!(manager.load(4).unwrap().state.tokens_seen, 99);
        assert_eq!(manager.cleanup_incomplete().unwrap(), 0);
    }

    fn disk_full() -> TrainingError {
        TrainingError::storage("step_00000001", std::io::Error::other("disk full"))
    }

    #[test]
    fn one_storage_failure_is_absorbed() {
        let mut attempts = Vec::new();
        let value = retry_storage_once(|attempt| {
            attempts.push(attempt);
            if attempt == 0 {
                Err(disk_full())
            } else {
                Ok(5)
            }
        })
        .unwrap();
        assert_eq!(value, 5);
        assert_eq!(attempts, vec![0, 1]);
    }

    #[test]
    fn second_storage_failure_is_surfaced() {
        let mut calls = 0;
        let err = retry_storage_once::<()>(|_| {
            calls += 1;
            Err(disk_full())
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(calls, 2);
    }

    #[test]
    fn other_failures_are_not_retried() {
        let mut calls = 0;
        let err = retry_storage_once::<()>(|_| {
            calls += 1;
            Err(TrainingError::runtime("nan"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(calls, 1);
    }
}
