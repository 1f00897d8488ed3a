//! Training-side wrapper around a [`LanguageModel`]: loss, gradient
//! accumulation, cross-rank gradient averaging, the optimizer, and state
//! export/import for checkpoints.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use model::{ActivationObserver, LanguageModel};
use tracing::debug;

use crate::{
    config::TrainingConfig,
    data::MicroBatch,
    distributed::{DistributedContext, ReduceOp},
    loss::{CrossEntropyLoss, LossMetrics},
    optimizer::{AdamW, AdamWConfig, OptimizerOptions, OptimizerSnapshot, StepReport},
    TrainingError,
};

/// Parameter values keyed by name.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub parameters: BTreeMap<String, Tensor>,
}

/// Result of one micro-batch forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

pub struct ModelAdapter<M: LanguageModel> {
    model: M,
    parameters: Vec<(String, Var)>,
    optimizer: AdamW,
    loss: CrossEntropyLoss,
    accumulated: BTreeMap<String, Tensor>,
    accumulation_steps: usize,
    device: Device,
}

impl<M: LanguageModel> ModelAdapter<M> {
    pub fn new(
        model: M,
        optimizer: AdamWConfig,
        options: OptimizerOptions,
        accumulation_steps: usize,
        device: Device,
    ) -> Result<Self, TrainingError> {
        let parameters = model.named_parameters();
        let optimizer = AdamW::new(parameters.clone(), optimizer, options)?;
        Ok(Self {
            model,
            parameters,
            optimizer,
            loss: CrossEntropyLoss::new(),
            accumulated: BTreeMap::new(),
            accumulation_steps: accumulation_steps.max(1),
            device,
        })
    }

    pub fn from_config(
        model: M,
        config: &TrainingConfig,
        device: Device,
    ) -> Result<Self, TrainingError> {
        Self::new(
            model,
            AdamWConfig::from(&config.optimizer),
            OptimizerOptions::from(&config.optimizer),
            config.data.gradient_accumulation_steps,
            device,
        )
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of optimizer updates applied.
    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer.step_count()
    }

    pub fn forward(
        &self,
        micro_batch: &MicroBatch,
        observer: &mut dyn ActivationObserver,
    ) -> Result<ForwardOutput, TrainingError> {
        let vocab = self.model.vocab_size();
        if let Some(&token) = micro_batch.tokens.iter().find(|&&t| t as usize >= vocab) {
            return Err(TrainingError::configuration(format!(
                "token id {token} is outside the model vocabulary of {vocab}"
            )));
        }
        let inputs = micro_batch.inputs(&self.device)?;
        let targets = micro_batch.targets(&self.device)?;
        let logits = self.model.forward(&inputs, observer)?;
        let output = self.loss.compute(&logits, &targets)?;
        Ok(ForwardOutput {
            loss: output.loss,
            metrics: output.metrics,
        })
    }

    /// Back-propagates the micro-batch loss scaled by `1 / accumulation_steps`
    /// and adds the result to the pending gradients.
    pub fn backward(&mut self, output: &ForwardOutput) -> Result<(), TrainingError> {
        let scaled = output
            .loss
            .affine(1.0 / self.accumulation_steps as f64, 0.0)?;
        let grads = scaled.backward()?;
        for (name, var) in &self.parameters {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let next = match self.accumulated.remove(name) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            self.accumulated.insert(name.clone(), next);
        }
        Ok(())
    }

    /// Gradients of one unscaled forward and backward pass over `micro_batch`,
    /// keyed by parameter name. Pending gradients and the optimizer are not
    /// touched.
    pub fn isolated_gradients(
        &self,
        micro_batch: &MicroBatch,
        observer: &mut dyn ActivationObserver,
    ) -> Result<BTreeMap<String, Tensor>, TrainingError> {
        let output = self.forward(micro_batch, observer)?;
        let grads = output.loss.backward()?;
        let mut gradients = BTreeMap::new();
        for (name, var) in &self.parameters {
            if let Some(grad) = grads.get(var.as_tensor()) {
                gradients.insert(name.clone(), grad.detach().copy()?);
            }
        }
        Ok(gradients)
    }

    /// Replaces every pending gradient with its mean across ranks, in one
    /// flattened collective.
    pub fn synchronize_gradients(
        &mut self,
        ctx: &dyn DistributedContext,
    ) -> Result<(), TrainingError> {
        if ctx.world_size() == 1 {
            return Ok(());
        }

        let mut flat = Vec::new();
        let mut spans = Vec::with_capacity(self.parameters.len());
        for (name, var) in &self.parameters {
            let len = var.as_tensor().elem_count();
            match self.accumulated.get(name) {
                Some(grad) => flat.extend(grad.flatten_all()?.to_vec1::<f32>()?),
                None => flat.extend(std::iter::repeat(0.0f32).take(len)),
            }
            spans.push(len);
        }

        ctx.all_reduce(&mut flat, ReduceOp::Mean)?;

        let mut offset = 0;
        for ((name, var), len) in self.parameters.iter().zip(spans) {
            let values = flat[offset..offset + len].to_vec();
            offset += len;
            let grad = Tensor::from_vec(values, var.as_tensor().dims(), &self.device)?;
            self.accumulated.insert(name.clone(), grad);
        }
        debug!(elements = offset, "gradients synchronized");
        Ok(())
    }

    /// Pending gradient of the weight owned by `module`.
    pub fn gradient(&self, module: &str) -> Option<&Tensor> {
        let parameter = self.model.module_parameter(module)?;
        self.accumulated.get(&parameter)
    }

    /// Applies the accumulated gradients and clears them.
    pub fn step(&mut self, learning_rate: f64) -> Result<StepReport, TrainingError> {
        let report = self.optimizer.step(&self.accumulated, learning_rate)?;
        self.accumulated.clear();
        Ok(report)
    }

    pub fn export_state(&self) -> Result<(ModelSnapshot, OptimizerSnapshot), TrainingError> {
        let mut parameters = BTreeMap::new();
        for (name, var) in &self.parameters {
            parameters.insert(name.clone(), var.as_tensor().detach().copy()?);
        }
        Ok((ModelSnapshot { parameters }, self.optimizer.snapshot()))
    }

    /// Loads parameters and optimizer state. Nothing is modified unless every
    /// parameter name and shape matches.
    pub fn import_state(
        &mut self,
        model: &ModelSnapshot,
        optimizer: &OptimizerSnapshot,
    ) -> Result<(), TrainingError> {
        let extra: Vec<&str> = model
            .parameters
            .keys()
            .filter(|name| !self.parameters.iter().any(|(own, _)| own == *name))
            .map(String::as_str)
            .collect();
        if !extra.is_empty() {
            return Err(TrainingError::shape_mismatch(format!(
                "snapshot has unknown parameters: {}",
                extra.join(", ")
            )));
        }
        for (name, var) in &self.parameters {
            let tensor = model.parameters.get(name).ok_or_else(|| {
                TrainingError::shape_mismatch(format!("snapshot is missing parameter '{name}'"))
            })?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(TrainingError::shape_mismatch(format!(
                    "parameter '{name}' has shape {:?} in the snapshot, model expects {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
        }

        self.optimizer.restore(optimizer)?;
        for (name, var) in &self.parameters {
            if let Some(tensor) = model.parameters.get(name) {
                var.set(&tensor.to_dtype(DType::F32)?.to_device(&self.device)?)?;
            }
        }
        self.accumulated.clear();
        Ok(())
    }

    /// Overwrites every rank's parameters with rank 0's.
    pub fn broadcast_parameters(&self, ctx: &dyn DistributedContext) -> Result<(), TrainingError> {
        if ctx.world_size() == 1 {
            return Ok(());
        }
        let payload = if ctx.is_primary() {
            let mut bytes = Vec::new();
            for (_, var) in &self.parameters {
                for value in var.as_tensor().flatten_all()?.to_vec1::<f32>()? {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
            }
            bytes
        } else {
            Vec::new()
        };
        let bytes = ctx.broadcast_bytes(payload, 0)?;
        if ctx.is_primary() {
            return Ok(());
        }

        let expected: usize = self
            .parameters
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count() * 4)
            .sum();
        if bytes.len() != expected {
            return Err(TrainingError::shape_mismatch(format!(
                "rank 0 broadcast {} parameter bytes, this rank expects {expected}",
                bytes.len()
            )));
        }
        let mut chunks = bytes.chunks_exact(4);
        for (_, var) in &self.parameters {
            let len = var.as_tensor().elem_count();
            let values: Vec<f32> = chunks
                .by_ref()
                .take(len)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            var.set(&Tensor::from_vec(values, var.as_tensor().dims(), &self.device)?)?;
        }
        Ok(())
    }
}
