use std::{
    env, fs,
    path::{Path, PathBuf},
};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TrainingError;

/// Immutable run configuration handed to every component constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    #[serde(default)]
    pub run: RunConfig,
    pub model: ModelSettings,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub training: LoopConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub checkpointing: CheckpointConfig,
    #[serde(default)]
    pub learning_dynamics: LearningDynamicsConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, TrainingError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") | Some("tml") | None => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some(other) => Err(TrainingError::configuration(format!(
                "unsupported configuration extension '{other}'"
            ))),
        }
    }
}

impl TrainingConfig {
    /// Reads, resolves and validates a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let value = Self::load_value(path)?;
        Self::from_value(value, base_dir(path))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Parses a configuration file into a generic tree so callers can apply
    /// overrides before the typed structure is built.
    pub fn load_value(path: &Path) -> Result<serde_json::Value, TrainingError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            TrainingError::configuration(format!(
                "failed to read config {}: {err}",
                path.display()
            ))
        })?;
        Self::parse_value(&contents, ConfigFormat::from_path(path)?)
    }

    pub fn parse_value(
        contents: &str,
        format: ConfigFormat,
    ) -> Result<serde_json::Value, TrainingError> {
        Ok(match format {
            ConfigFormat::Toml => toml::from_str(contents)?,
            ConfigFormat::Json => serde_json::from_str(contents)
                .map_err(|err| TrainingError::configuration(err.to_string()))?,
            ConfigFormat::Yaml => serde_yaml::from_str(contents)?,
        })
    }

    /// Builds the typed configuration, resolving relative paths against
    /// `base_dir`, and validates it.
    pub fn from_value(value: serde_json::Value, base_dir: &Path) -> Result<Self, TrainingError> {
        let mut config: TrainingConfig = serde_json::from_value(value)
            .map_err(|err| TrainingError::configuration(err.to_string()))?;
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str, format: ConfigFormat) -> Result<Self, TrainingError> {
        Self::from_value(Self::parse_value(contents, format)?, Path::new("."))
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.run.run_name.trim().is_empty() {
            errors.push("run.run_name must not be empty".to_string());
        }
        if self.run.run_name.contains(['/', '\\']) {
            errors.push("run.run_name must not contain path separators".to_string());
        }

        let model = &self.model;
        if model.vocab_size == 0 {
            errors.push("model.vocab_size must be greater than 0".to_string());
        }
        if model.hidden_dim == 0 || model.n_layers == 0 || model.n_heads == 0 {
            errors.push(
                "model.hidden_dim, model.n_layers and model.n_heads must be greater than 0"
                    .to_string(),
            );
        } else if model.hidden_dim % model.n_heads != 0 {
            errors.push(format!(
                "model.hidden_dim ({}) must be divisible by model.n_heads ({})",
                model.hidden_dim, model.n_heads
            ));
        }
        if model.ff_dim == Some(0) {
            errors.push("model.ff_dim must be greater than 0".to_string());
        }
        if model.norm_eps.is_nan() || model.norm_eps <= 0.0 {
            errors.push("model.norm_eps must be positive".to_string());
        }

        let data = &self.data;
        if data.train_path.as_os_str().is_empty() {
            errors.push("data.train_path must not be empty".to_string());
        }
        if data.sequence_length < 2 {
            errors.push("data.sequence_length must be at least 2".to_string());
        }
        if self.model_context_length() < data.sequence_length.saturating_sub(1) {
            errors.push(format!(
                "model.max_seq_len ({}) must cover data.sequence_length - 1 ({})",
                self.model_context_length(),
                data.sequence_length.saturating_sub(1)
            ));
        }
        if data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }

        let dist = &self.distributed;
        if dist.world_size == 0 {
            errors.push("distributed.world_size must be greater than 0".to_string());
        } else {
            if dist.rank >= dist.world_size {
                errors.push(format!(
                    "distributed.rank ({}) must be below distributed.world_size ({})",
                    dist.rank, dist.world_size
                ));
            }
            if data.batch_size % dist.world_size != 0 {
                errors.push(format!(
                    "data.batch_size ({}) must be divisible by distributed.world_size ({})",
                    data.batch_size, dist.world_size
                ));
            } else if data.gradient_accumulation_steps > 0
                && (data.batch_size / dist.world_size) % data.gradient_accumulation_steps != 0
            {
                errors.push(format!(
                    "per-rank batch ({}) must be divisible by data.gradient_accumulation_steps ({})",
                    data.batch_size / dist.world_size,
                    data.gradient_accumulation_steps
                ));
            }
        }
        if dist.strategy == DistributedStrategy::Single && dist.world_size != 1 {
            errors.push("distributed.strategy `single` requires world_size = 1".to_string());
        }
        if dist.timeout_secs == 0 {
            errors.push("distributed.timeout_secs must be greater than 0".to_string());
        }

        let opt = &self.optimizer;
        if opt.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if opt.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < opt.beta1 && opt.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < opt.beta2 && opt.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if opt.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if let Some(norm) = opt.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        let sched = &self.scheduler;
        if sched.total_steps == Some(0) {
            errors.push("scheduler.total_steps must be greater than 0".to_string());
        }
        if sched.warmup_steps > self.scheduler_total_steps() {
            errors.push("scheduler.warmup_steps cannot exceed the scheduled steps".to_string());
        }
        if sched.min_lr < 0.0 || sched.min_lr > opt.learning_rate {
            errors.push("scheduler.min_lr must be in [0, optimizer.learning_rate]".to_string());
        }
        if sched.power <= 0.0 {
            errors.push("scheduler.power must be greater than 0".to_string());
        }

        if self.training.max_steps == 0 {
            errors.push("training.max_steps must be greater than 0".to_string());
        }
        if self.training.log_every_n_steps == 0 {
            errors.push("training.log_every_n_steps must be greater than 0".to_string());
        }

        if self.evaluation.every_n_steps == Some(0) {
            errors.push("evaluation.every_n_steps must be greater than 0".to_string());
        }
        if self.evaluation.max_batches == 0 {
            errors.push("evaluation.max_batches must be greater than 0".to_string());
        }

        let ckpt = &self.checkpointing;
        if ckpt.every_n_steps == 0 {
            errors.push("checkpointing.every_n_steps must be greater than 0".to_string());
        }
        if ckpt.keep_last == Some(0) {
            errors.push("checkpointing.keep_last must be greater than 0".to_string());
        }
        if ckpt.milestone_every == Some(0) {
            errors.push("checkpointing.milestone_every must be greater than 0".to_string());
        }
        let publish = &ckpt.publish;
        if publish.enabled {
            match publish.target {
                PublishTarget::Hub => {
                    if publish.repo_id.as_deref().map_or(true, str::is_empty) {
                        errors.push(
                            "checkpointing.publish.repo_id is required for the hub target"
                                .to_string(),
                        );
                    }
                }
                PublishTarget::Directory => {
                    if publish.directory.is_none() {
                        errors.push(
                            "checkpointing.publish.directory is required for the directory target"
                                .to_string(),
                        );
                    }
                }
            }
        }

        let dynamics = &self.learning_dynamics;
        if dynamics.enabled && dynamics.modules.is_empty() {
            errors.push("learning_dynamics.modules must not be empty when enabled".to_string());
        }
        if dynamics.every_n_steps == Some(0) {
            errors.push("learning_dynamics.every_n_steps must be greater than 0".to_string());
        }
        if dynamics.batch_size == 0 {
            errors.push("learning_dynamics.batch_size must be greater than 0".to_string());
        }
        let index = dynamics.sequence_index;
        let input_len = data.sequence_length.saturating_sub(1) as i64;
        if index >= input_len || index < -input_len {
            errors.push(format!(
                "learning_dynamics.sequence_index ({index}) outside the {input_len}-token model input"
            ));
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.run.runs_dir, base);
        absolutize_in_place(&mut self.data.train_path, base);
        if let Some(path) = self.data.eval_path.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.checkpointing.publish.directory.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.learning_dynamics.eval_data.as_mut() {
            absolutize_in_place(path, base);
        }
    }

    /// Applies the launcher environment (`RANK`, `WORLD_SIZE`, `MASTER_ADDR`,
    /// `MASTER_PORT`) for TCP process groups and re-validates.
    pub fn apply_environment(&mut self) -> Result<(), TrainingError> {
        if self.distributed.strategy != DistributedStrategy::Tcp {
            return Ok(());
        }
        let mut errors = Vec::new();
        if let Some(rank) = parse_env::<usize>("RANK", &mut errors) {
            self.distributed.rank = rank;
        }
        if let Some(world) = parse_env::<usize>("WORLD_SIZE", &mut errors) {
            self.distributed.world_size = world;
        }
        if let Ok(addr) = env::var("MASTER_ADDR") {
            self.distributed.master_addr = addr;
        }
        if let Some(port) = parse_env::<u16>("MASTER_PORT", &mut errors) {
            self.distributed.master_port = port;
        }
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        self.validate()
    }

    pub fn run_dir(&self) -> PathBuf {
        self.run.runs_dir.join(&self.run.run_name)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir().join("checkpoints")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir().join("logs")
    }

    pub fn learning_dynamics_dir(&self) -> PathBuf {
        self.run_dir().join("learning_dynamics")
    }

    /// Longest sequence fed to the model (inputs drop the final token).
    pub fn model_context_length(&self) -> usize {
        self.model
            .max_seq_len
            .unwrap_or(self.data.sequence_length.saturating_sub(1))
    }

    pub fn scheduler_total_steps(&self) -> u64 {
        self.scheduler.total_steps.unwrap_or(self.training.max_steps)
    }

    pub fn capture_interval(&self) -> u64 {
        self.learning_dynamics
            .every_n_steps
            .unwrap_or(self.checkpointing.every_n_steps)
    }

    pub fn model_config(&self, device: &Device) -> model::ModelConfig {
        model::ModelConfig {
            vocab_size: self.model.vocab_size,
            hidden_dim: self.model.hidden_dim,
            n_layers: self.model.n_layers,
            n_heads: self.model.n_heads,
            ff_dim: self.model.ff_dim.unwrap_or(self.model.hidden_dim * 4),
            max_seq_len: self.model_context_length(),
            norm_eps: self.model.norm_eps,
            init_seed: self.model.init_seed.unwrap_or(self.data.seed),
            device: device.clone(),
        }
    }

    /// SHA-256 of the canonical JSON form, recorded in every manifest.
    pub fn fingerprint(&self) -> Result<String, TrainingError> {
        let json = serde_json::to_vec(self).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize config for fingerprint: {err}"))
        })?;
        Ok(hex::encode(Sha256::digest(&json)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_run_name")]
    pub run_name: String,
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_name: default_run_name(),
            runs_dir: default_runs_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSettings {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    #[serde(default)]
    pub ff_dim: Option<usize>,
    #[serde(default)]
    pub max_seq_len: Option<usize>,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Defaults to `data.seed`.
    #[serde(default)]
    pub init_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Token shard file or directory of `*.tokens` shards.
    pub train_path: PathBuf,
    #[serde(default)]
    pub eval_path: Option<PathBuf>,
    pub sequence_length: usize,
    /// Global batch size across all ranks.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub wrap_around: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_weight_decay_exclude")]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            weight_decay_exclude: default_weight_decay_exclude(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    #[serde(alias = "adam_w")]
    Adamw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: ScheduleKind,
    #[serde(default)]
    pub warmup_steps: u64,
    /// Defaults to `training.max_steps`.
    #[serde(default)]
    pub total_steps: Option<u64>,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default = "default_power")]
    pub power: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: ScheduleKind::default(),
            warmup_steps: 0,
            total_steps: None,
            min_lr: 0.0,
            power: default_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Constant,
    ConstantWithWarmup,
    #[default]
    LinearWithWarmup,
    CosineWithWarmup,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopConfig {
    pub max_steps: u64,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub every_n_steps: Option<u64>,
    #[serde(default = "default_eval_batches")]
    pub max_batches: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: None,
            max_batches: default_eval_batches(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_every")]
    pub every_n_steps: u64,
    /// Number of most recent checkpoints whose payloads are kept.
    #[serde(default)]
    pub keep_last: Option<usize>,
    /// Checkpoints at multiples of this step are never pruned.
    #[serde(default)]
    pub milestone_every: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_resume: bool,
    #[serde(default)]
    pub resume_from: Option<u64>,
    /// Writes a step-0 checkpoint before the first step of a fresh run.
    #[serde(default = "default_true")]
    pub save_initial: bool,
    #[serde(default)]
    pub publish: PublishConfig,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_n_steps: default_checkpoint_every(),
            keep_last: None,
            milestone_every: None,
            auto_resume: true,
            resume_from: None,
            save_initial: true,
            publish: PublishConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub target: PublishTarget,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default = "default_hub_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_publish_timeout")]
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: PublishTarget::default(),
            repo_id: None,
            endpoint: default_hub_endpoint(),
            directory: None,
            token_env: default_token_env(),
            timeout_secs: default_publish_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishTarget {
    #[default]
    Hub,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearningDynamicsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Exact module names or dotted suffixes such as `attention.v_proj`.
    #[serde(default = "default_watched_modules")]
    pub modules: Vec<String>,
    /// Defaults to `checkpointing.every_n_steps`.
    #[serde(default)]
    pub every_n_steps: Option<u64>,
    /// Token position whose activation is kept; negative counts from the end.
    #[serde(default = "default_sequence_index")]
    pub sequence_index: i64,
    /// Fixed held-out corpus; when set, sampled steps also record gradients of
    /// its first `batch_size` sequences, outside the optimizer path.
    #[serde(default)]
    pub eval_data: Option<PathBuf>,
    #[serde(default = "default_dynamics_batch_size")]
    pub batch_size: usize,
}

impl Default for LearningDynamicsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            modules: default_watched_modules(),
            every_n_steps: None,
            sequence_index: default_sequence_index(),
            eval_data: None,
            batch_size: default_dynamics_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributedConfig {
    #[serde(default)]
    pub strategy: DistributedStrategy,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default)]
    pub rank: usize,
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    #[serde(default = "default_collective_timeout")]
    pub timeout_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            strategy: DistributedStrategy::default(),
            world_size: default_world_size(),
            rank: 0,
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            timeout_secs: default_collective_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistributedStrategy {
    #[default]
    Single,
    /// One thread per rank inside this process.
    Local,
    /// One process per rank connected over TCP.
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: true,
            tensorboard: true,
            flush_every: default_flush_every(),
        }
    }
}

fn base_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, errors: &mut Vec<String>) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(format!("environment variable {name}='{raw}' is not valid"));
            None
        }
    }
}

fn default_run_name() -> String {
    "default".to_string()
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_norm_eps() -> f64 {
    1e-6
}

fn default_batch_size() -> usize {
    8
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_learning_rate() -> f64 {
    3e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_weight_decay_exclude() -> Vec<String> {
    vec!["norm".to_string(), "embedding".to_string()]
}

fn default_power() -> f64 {
    1.0
}

fn default_log_every_n_steps() -> u64 {
    1
}

fn default_eval_batches() -> usize {
    8
}

fn default_checkpoint_every() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_hub_endpoint() -> String {
    "https://huggingface.co/api/upload".to_string()
}

fn default_token_env() -> String {
    "HF_TOKEN".to_string()
}

fn default_publish_timeout() -> u64 {
    120
}

fn default_watched_modules() -> Vec<String> {
    vec![
        "attention.v_proj".to_string(),
        "attention.o_proj".to_string(),
        "swiglu.w_2".to_string(),
    ]
}

fn default_dynamics_batch_size() -> usize {
    8
}

fn default_sequence_index() -> i64 {
    -1
}

fn default_world_size() -> usize {
    1
}

fn default_master_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_master_port() -> u16 {
    29500
}

fn default_collective_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_every() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const MINIMAL: &str = r#"
[model]
vocab_size = 32
hidden_dim = 16
n_layers = 1
n_heads = 2

[data]
train_path = "data/train"
sequence_length = 9
batch_size = 4

[training]
max_steps = 20
"#;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config = TrainingConfig::parse(MINIMAL, ConfigFormat::Toml).unwrap();
        assert_eq!(config.checkpointing.every_n_steps, 1000);
        assert!(config.checkpointing.auto_resume);
        assert!(config.checkpointing.save_initial);
        assert_eq!(config.model_context_length(), 8);
        assert_eq!(config.scheduler_total_steps(), 20);
        assert_eq!(config.capture_interval(), 1000);
        assert_eq!(config.learning_dynamics.sequence_index, -1);
        assert!(config.data.train_path.ends_with("data/train"));
    }

    #[test]
    fn unknown_field_is_a_configuration_error() {
        let contents = format!("{MINIMAL}\n[logging]\nverbosity = 3\n");
        let err = TrainingConfig::parse(&contents, ConfigFormat::Toml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("verbosity"));
    }

    #[test]
    fn missing_required_group_is_rejected() {
        let contents = MINIMAL.replace("[training]\nmax_steps = 20\n", "");
        let err = TrainingConfig::parse(&contents, ConfigFormat::Toml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn batch_must_split_across_ranks() {
        let contents =
            format!("{MINIMAL}\n[distributed]\nstrategy = \"local\"\nworld_size = 3\n");
        let err = TrainingConfig::parse(&contents, ConfigFormat::Toml).unwrap_err();
        match err {
            TrainingError::Validation(messages) => {
                assert!(messages.iter().any(|m| m.contains("divisible by distributed.world_size")))
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn yaml_and_toml_agree() {
        let yaml = r#"
model: {vocab_size: 32, hidden_dim: 16, n_layers: 1, n_heads: 2}
data: {train_path: data/train, sequence_length: 9, batch_size: 4}
training: {max_steps: 20}
"#;
        let from_yaml = TrainingConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        let from_toml = TrainingConfig::parse(MINIMAL, ConfigFormat::Toml).unwrap();
        assert_eq!(from_yaml.fingerprint().unwrap(), from_toml.fingerprint().unwrap());
    }

    #[test]
    fn dynamics_eval_data_is_resolved_and_batch_checked() {
        let contents = format!(
            "{MINIMAL}\n[learning_dynamics]\nenabled = true\neval_data = \"data/fixed\"\n"
        );
        let config = TrainingConfig::parse(&contents, ConfigFormat::Toml).unwrap();
        let eval = config.learning_dynamics.eval_data.as_ref().unwrap();
        assert!(eval.ends_with("data/fixed"));
        assert_eq!(config.learning_dynamics.batch_size, 8);

        let zero = format!("{contents}batch_size = 0\n");
        let err = TrainingConfig::parse(&zero, ConfigFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("learning_dynamics.batch_size"));
    }
}
