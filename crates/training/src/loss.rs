use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Token-mean next-token cross entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// `logits` is `[batch, seq, vocab]`, `targets` is `[batch, seq]` of `u32`.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }
        let vocab_size = dims[dims.len() - 1];
        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(format!(
                "targets {:?} do not match logits {:?}",
                targets.dims(),
                dims
            )));
        }
        let token_count: usize = token_dims.iter().product();
        if token_count == 0 || vocab_size == 0 {
            return Err(TrainingError::runtime("no tokens available for loss computation"));
        }

        let logits_flat = logits.reshape((token_count, vocab_size))?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;
        let targets_flat = targets
            .to_device(logits.device())?
            .reshape((token_count,))?
            .to_dtype(DType::U32)?;

        let nll = log_probs
            .gather(&targets_flat.unsqueeze(1)?, 1)?
            .neg()?
            .squeeze(1)?;
        let loss = nll.mean_all()?;
        let average_loss = loss.to_vec0::<f32>()? as f64;

        let correct_tokens = logits_flat
            .argmax(D::Minus1)?
            .eq(&targets_flat)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_vec0::<f32>()?
            .round() as u64;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_tokens: token_count as u64,
                correct_tokens,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar mean loss, still attached to the graph.
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossMetrics {
    average_loss: f64,
    total_tokens: u64,
    correct_tokens: u64,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f64 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> u64 {
        self.correct_tokens
    }

    pub fn is_finite(&self) -> bool {
        self.average_loss.is_finite()
    }

    pub fn accuracy(&self) -> f64 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f64 / self.total_tokens as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::from_vec(vec![0u32, 1, 2, 3, 0, 1], (2, 3), &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        assert!((out.metrics.average_loss() - 4f64.ln()).abs() < 1e-5);
        assert_eq!(out.metrics.total_tokens(), 6);
    }

    #[test]
    fn confident_correct_predictions_count_as_correct() {
        let logits = Tensor::from_vec(
            vec![10.0f32, 0.0, 0.0, 10.0],
            (1, 2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let targets = Tensor::from_vec(vec![0u32, 0], (1, 2), &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        assert_eq!(out.metrics.correct_tokens(), 1);
        assert!((out.metrics.accuracy() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, 2), DType::U32, &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
    }
}
