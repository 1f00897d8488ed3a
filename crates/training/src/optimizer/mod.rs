use std::collections::BTreeMap;

use candle_core::{DType, Tensor, Var};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        match value.algorithm {
            config::OptimizerType::Adamw => AdamWConfig {
                learning_rate: value.learning_rate,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon,
                weight_decay: value.weight_decay,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OptimizerOptions {
    pub clip_global_norm: Option<f64>,
    /// Parameter-name fragments exempt from weight decay.
    pub weight_decay_exclude: Vec<String>,
}

impl From<&config::OptimizerConfig> for OptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            clip_global_norm: value.max_grad_norm,
            weight_decay_exclude: value.weight_decay_exclude.clone(),
        }
    }
}

/// First and second moments keyed by parameter name, plus the update count.
#[derive(Debug, Clone)]
pub struct OptimizerSnapshot {
    pub step: u64,
    pub first_moment: BTreeMap<String, Tensor>,
    pub second_moment: BTreeMap<String, Tensor>,
}

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Global L2 norm of the gradients before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
    /// False when the update was skipped because of a non-finite norm.
    pub applied: bool,
}

#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: u64,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: OptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::configuration(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::configuration(format!(
                    "optimizer expects f32 parameters, '{name}' is {:?}",
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like()?;
            let second_moment = tensor.zeros_like()?;
            let apply_weight_decay =
                should_apply_weight_decay(&name, &options.weight_decay_exclude);
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Clips by global norm and applies one AdamW update at `learning_rate`.
    /// Parameters without a gradient keep their value and moments.
    pub fn step(
        &mut self,
        grads: &BTreeMap<String, Tensor>,
        learning_rate: f64,
    ) -> Result<StepReport, TrainingError> {
        let mut processed = Vec::with_capacity(self.params.len());
        let mut norm_sq = 0.0f64;
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.get(&slot.name) else {
                continue;
            };
            if grad.dims() != slot.param.as_tensor().dims() {
                return Err(TrainingError::shape_mismatch(format!(
                    "gradient for '{}' has shape {:?}, parameter has {:?}",
                    slot.name,
                    grad.dims(),
                    slot.param.as_tensor().dims()
                )));
            }
            let grad = grad.to_dtype(DType::F32)?;
            norm_sq += squared_norm(&grad)?;
            processed.push((index, grad));
        }

        let grad_norm = norm_sq.sqrt();
        if !grad_norm.is_finite() {
            return Ok(StepReport {
                grad_norm,
                clipped: false,
                applied: false,
            });
        }
        if processed.is_empty() {
            return Ok(StepReport {
                grad_norm,
                clipped: false,
                applied: false,
            });
        }

        let mut clipped = false;
        if let Some(max_norm) = self.clip_global_norm {
            if grad_norm > max_norm {
                let scale = max_norm / (grad_norm + EPS);
                for (_, grad) in &mut processed {
                    *grad = grad.affine(scale, 0.0)?;
                }
                clipped = true;
            }
        }

        self.step += 1;
        self.apply(processed, learning_rate)?;

        Ok(StepReport {
            grad_norm,
            clipped,
            applied: true,
        })
    }

    fn apply(
        &mut self,
        processed: Vec<(usize, Tensor)>,
        learning_rate: f64,
    ) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(learning_rate, 0.0)?;

            let base = slot.param.as_tensor().detach();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };
            slot.param.set(&decayed.sub(&update)?)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> OptimizerSnapshot {
        let mut first_moment = BTreeMap::new();
        let mut second_moment = BTreeMap::new();
        for slot in &self.params {
            first_moment.insert(slot.name.clone(), slot.first_moment.clone());
            second_moment.insert(slot.name.clone(), slot.second_moment.clone());
        }
        OptimizerSnapshot {
            step: self.step,
            first_moment,
            second_moment,
        }
    }

    /// Replaces the moments and step count. Every parameter must be present
    /// in both moment maps with its exact shape, and nothing else may be.
    pub fn restore(&mut self, snapshot: &OptimizerSnapshot) -> Result<(), TrainingError> {
        for (label, moments) in [
            ("first moment", &snapshot.first_moment),
            ("second moment", &snapshot.second_moment),
        ] {
            if moments.len() != self.params.len() {
                let extra: Vec<&str> = moments
                    .keys()
                    .filter(|name| !self.params.iter().any(|slot| &slot.name == *name))
                    .map(String::as_str)
                    .collect();
                if !extra.is_empty() {
                    return Err(TrainingError::shape_mismatch(format!(
                        "optimizer {label} has unknown parameters: {}",
                        extra.join(", ")
                    )));
                }
            }
            for slot in &self.params {
                let tensor = moments.get(&slot.name).ok_or_else(|| {
                    TrainingError::shape_mismatch(format!(
                        "optimizer {label} missing parameter '{}'",
                        slot.name
                    ))
                })?;
                if tensor.dims() != slot.param.as_tensor().dims() {
                    return Err(TrainingError::shape_mismatch(format!(
                        "optimizer {label} for '{}' has shape {:?}, expected {:?}",
                        slot.name,
                        tensor.dims(),
                        slot.param.as_tensor().dims()
                    )));
                }
            }
        }

        let device = self
            .params
            .first()
            .map(|slot| slot.param.as_tensor().device().clone());
        for slot in &mut self.params {
            if let (Some(m), Some(v), Some(device)) = (
                snapshot.first_moment.get(&slot.name),
                snapshot.second_moment.get(&slot.name),
                device.as_ref(),
            ) {
                slot.first_moment = m.to_dtype(DType::F32)?.to_device(device)?;
                slot.second_moment = v.to_dtype(DType::F32)?.to_device(device)?;
            }
        }
        self.step = snapshot.step;
        Ok(())
    }
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| matches_pattern(name, pattern))
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    name.ends_with(pattern) || name.contains(pattern)
}

fn squared_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor.sqr()?.sum_all()?.to_vec0::<f32>()?;
    Ok(value as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config() -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn single_parameter(values: &[f32]) -> (Var, AdamW) {
        let var = Var::from_vec(values.to_vec(), values.len(), &Device::Cpu).unwrap();
        let optimizer = AdamW::new(
            vec![("layers.0.w".to_string(), var.clone())],
            config(),
            OptimizerOptions::default(),
        )
        .unwrap();
        (var, optimizer)
    }

    fn grads(values: &[f32]) -> BTreeMap<String, Tensor> {
        let grad = Tensor::from_vec(values.to_vec(), values.len(), &Device::Cpu).unwrap();
        BTreeMap::from([("layers.0.w".to_string(), grad)])
    }

    #[test]
    fn first_update_moves_against_the_gradient_by_lr() {
        let (var, mut optimizer) = single_parameter(&[1.0, -1.0]);
        let report = optimizer.step(&grads(&[0.5, -0.5]), 0.1).unwrap();
        assert!(report.applied);
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        // Bias-corrected first step is lr * sign(grad).
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 0.9).abs() < 1e-4);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn non_finite_gradients_skip_the_update() {
        let (var, mut optimizer) = single_parameter(&[1.0]);
        let report = optimizer.step(&grads(&[f32::NAN]), 0.1).unwrap();
        assert!(!report.applied);
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn global_norm_is_clipped() {
        let var = Var::from_vec(vec![0.0f32; 2], 2, &Device::Cpu).unwrap();
        let mut optimizer = AdamW::new(
            vec![("layers.0.w".to_string(), var)],
            config(),
            OptimizerOptions {
                clip_global_norm: Some(1.0),
                weight_decay_exclude: vec![],
            },
        )
        .unwrap();
        let report = optimizer.step(&grads(&[3.0, 4.0]), 0.1).unwrap();
        assert!(report.clipped);
        assert!((report.grad_norm - 5.0).abs() < 1e-6);
    }

    #[test]
    fn restore_rejects_missing_and_misshapen_moments() {
        let (_, mut optimizer) = single_parameter(&[1.0, 2.0]);
        optimizer.step(&grads(&[0.1, 0.2]), 0.1).unwrap();
        let snapshot = optimizer.snapshot();

        let mut missing = snapshot.clone();
        missing.second_moment.clear();
        let err = optimizer.restore(&missing).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StateShapeMismatch);

        let mut misshapen = snapshot.clone();
        misshapen.first_moment.insert(
            "layers.0.w".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(optimizer.restore(&misshapen).is_err());

        optimizer.restore(&snapshot).unwrap();
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn weight_decay_exclusions_match_fragments() {
        let exclude = vec!["norm".to_string(), "embedding".to_string()];
        assert!(!should_apply_weight_decay("layers.0.attention_norm.weight", &exclude));
        assert!(!should_apply_weight_decay("embedding.weight", &exclude));
        assert!(should_apply_weight_decay("layers.0.attention.q_proj.weight", &exclude));
    }
}
