//! Learning-dynamics capture: activations and gradients of watched modules
//! on sampled steps.
//!
//! A [`StepCapture`] lives for exactly one step. It is attached as the
//! observer of the first micro-batch forward, and [`StepCapture::finish`]
//! reads the synchronized gradients before the optimizer consumes them.
//! With a fixed evaluation batch configured, [`DynamicsCapture::capture_batch`]
//! adds a second record from its own forward and backward pass.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use candle_core::Tensor;
use model::{ActivationObserver, LanguageModel};

use crate::{
    adapter::ModelAdapter,
    config::{LearningDynamicsConfig, TrainingConfig},
    data::MicroBatch,
    TrainingError,
};

const EVAL_PREFIX: &str = "eval/";

#[derive(Debug, Clone)]
pub struct DynamicsCapture {
    modules: Vec<String>,
    interval: u64,
    sequence_index: i64,
}

impl DynamicsCapture {
    /// Resolves watched entries against `available` module names. An entry
    /// matches a module with the same name or one ending in `.{entry}`, and
    /// every match must own a weight.
    pub fn new(
        config: &LearningDynamicsConfig,
        interval: u64,
        available: &[String],
        has_weight: impl Fn(&str) -> bool,
    ) -> Result<Self, TrainingError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let mut modules = Vec::new();
        let mut unmatched = Vec::new();
        for entry in &config.modules {
            let suffix = format!(".{entry}");
            let matches: Vec<&String> = available
                .iter()
                .filter(|name| *name == entry || name.ends_with(&suffix))
                .collect();
            if matches.is_empty() {
                unmatched.push(entry.clone());
            }
            for name in matches {
                if !modules.contains(name) {
                    modules.push(name.clone());
                }
            }
        }
        if !unmatched.is_empty() {
            return Err(TrainingError::configuration(format!(
                "learning_dynamics.modules entries match no model module: {}",
                unmatched.join(", ")
            )));
        }
        let weightless: Vec<&str> = modules
            .iter()
            .map(String::as_str)
            .filter(|name| !has_weight(*name))
            .collect();
        if !weightless.is_empty() {
            return Err(TrainingError::configuration(format!(
                "learning_dynamics.modules entries resolve to modules without a weight: {}",
                weightless.join(", ")
            )));
        }
        Ok(Self {
            modules,
            interval: interval.max(1),
            sequence_index: config.sequence_index,
        })
    }

    pub fn from_config(
        config: &TrainingConfig,
        model: &impl LanguageModel,
    ) -> Result<Self, TrainingError> {
        Self::new(
            &config.learning_dynamics,
            config.capture_interval(),
            &model.module_names(),
            |name| model.module_parameter(name).is_some(),
        )
    }

    pub fn disabled() -> Self {
        Self {
            modules: Vec::new(),
            interval: 1,
            sequence_index: -1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.modules.is_empty()
    }

    /// Fully qualified names of the watched modules.
    pub fn watched(&self) -> &[String] {
        &self.modules
    }

    pub fn is_sampled(&self, step: u64) -> bool {
        self.is_enabled() && step % self.interval == 0
    }

    /// Observer for the step that completes as `step`, if that step is sampled.
    pub fn begin_step(&self, step: u64) -> Option<StepCapture> {
        self.is_sampled(step).then(|| self.observer(step))
    }

    /// Activations and gradients of a fixed `batch` from a separate forward
    /// and backward pass. Training state is left as it was.
    pub fn capture_batch<M: LanguageModel>(
        &self,
        step: u64,
        adapter: &ModelAdapter<M>,
        batch: &MicroBatch,
    ) -> Result<BTreeMap<String, ModuleDynamics>, TrainingError> {
        let mut observer = self.observer(step);
        let gradients = adapter.isolated_gradients(batch, &mut observer)?;
        let model = adapter.model();
        observer.pair(|name| {
            model
                .module_parameter(name)
                .and_then(|parameter| gradients.get(&parameter))
        })
    }

    fn observer(&self, step: u64) -> StepCapture {
        StepCapture {
            step,
            modules: self.modules.clone(),
            sequence_index: self.sequence_index,
            activations: BTreeMap::new(),
        }
    }
}

/// Per-step observer holding detached copies of watched activations.
#[derive(Debug)]
pub struct StepCapture {
    step: u64,
    modules: Vec<String>,
    sequence_index: i64,
    activations: BTreeMap<String, Tensor>,
}

impl StepCapture {
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Pairs the recorded activations with the adapter's pending gradients.
    pub fn finish<M: LanguageModel>(
        self,
        adapter: &ModelAdapter<M>,
    ) -> Result<LearningDynamicsRecord, TrainingError> {
        let modules = self.pair(|name| adapter.gradient(name))?;
        Ok(LearningDynamicsRecord {
            step: self.step,
            modules,
            eval_modules: BTreeMap::new(),
        })
    }

    fn pair<'g>(
        &self,
        gradient: impl Fn(&str) -> Option<&'g Tensor>,
    ) -> Result<BTreeMap<String, ModuleDynamics>, TrainingError> {
        let mut modules = BTreeMap::new();
        for name in &self.modules {
            let gradient = match gradient(name) {
                Some(grad) => Some(grad.detach().copy()?),
                None => None,
            };
            modules.insert(
                name.clone(),
                ModuleDynamics {
                    activation: self.activations.get(name).cloned(),
                    gradient,
                },
            );
        }
        Ok(modules)
    }

    fn position(&self, seq: usize) -> usize {
        if self.sequence_index < 0 {
            seq.saturating_sub(self.sequence_index.unsigned_abs() as usize)
        } else {
            (self.sequence_index as usize).min(seq.saturating_sub(1))
        }
    }
}

impl ActivationObserver for StepCapture {
    fn wants(&self, module: &str) -> bool {
        self.modules.iter().any(|name| name == module)
    }

    fn observe(&mut self, module: &str, output: &Tensor) -> candle_core::Result<()> {
        let detached = output.detach();
        let kept = if detached.rank() == 3 {
            let seq = detached.dim(1)?;
            detached.narrow(1, self.position(seq), 1)?.squeeze(1)?.copy()?
        } else {
            detached.copy()?
        };
        self.activations.insert(module.to_string(), kept);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ModuleDynamics {
    /// Output at the captured token position, `[batch, hidden]`.
    pub activation: Option<Tensor>,
    /// Gradient of the module's weight after cross-rank averaging.
    pub gradient: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct LearningDynamicsRecord {
    pub step: u64,
    /// From the training micro-batch.
    pub modules: BTreeMap<String, ModuleDynamics>,
    /// From the fixed evaluation batch, empty when none is configured.
    pub eval_modules: BTreeMap<String, ModuleDynamics>,
}

impl LearningDynamicsRecord {
    /// Flat tensor map, `{module}.activation` and `{module}.gradient`, with
    /// evaluation-batch entries under `eval/`.
    pub fn tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        flatten_into(&mut tensors, "", &self.modules);
        flatten_into(&mut tensors, EVAL_PREFIX, &self.eval_modules);
        tensors
    }

    pub fn from_tensors(step: u64, tensors: HashMap<String, Tensor>) -> Self {
        let mut modules: BTreeMap<String, ModuleDynamics> = BTreeMap::new();
        let mut eval_modules: BTreeMap<String, ModuleDynamics> = BTreeMap::new();
        for (key, tensor) in tensors {
            let (target, key) = match key.strip_prefix(EVAL_PREFIX) {
                Some(rest) => (&mut eval_modules, rest),
                None => (&mut modules, key.as_str()),
            };
            let (name, is_gradient) = if let Some(name) = key.strip_suffix(".gradient") {
                (name.to_string(), true)
            } else if let Some(name) = key.strip_suffix(".activation") {
                (name.to_string(), false)
            } else {
                continue;
            };
            let entry = target.entry(name).or_insert(ModuleDynamics {
                activation: None,
                gradient: None,
            });
            if is_gradient {
                entry.gradient = Some(tensor);
            } else {
                entry.activation = Some(tensor);
            }
        }
        Self {
            step,
            modules,
            eval_modules,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        candle_core::safetensors::save(&self.tensors(), path).map_err(|err| {
            TrainingError::storage(path, std::io::Error::new(std::io::ErrorKind::Other, err))
        })
    }

    /// Writes `learning_dynamics/step_XXXXXXXX.safetensors` under `dir`.
    pub fn save_standalone(&self, dir: &Path) -> Result<PathBuf, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| TrainingError::storage(dir, err))?;
        let path = dir.join(format!("step_{:08}.safetensors", self.step));
        self.save(&path)?;
        Ok(path)
    }
}

fn flatten_into(
    tensors: &mut HashMap<String, Tensor>,
    prefix: &str,
    modules: &BTreeMap<String, ModuleDynamics>,
) {
    for (name, dynamics) in modules {
        if let Some(activation) = &dynamics.activation {
            tensors.insert(format!("{prefix}{name}.activation"), activation.clone());
        }
        if let Some(gradient) = &dynamics.gradient {
            tensors.insert(format!("{prefix}{name}.gradient"), gradient.clone());
        }
    }
}
