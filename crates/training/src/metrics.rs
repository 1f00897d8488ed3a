use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Per-rank sums for one step, laid out for a single `f64` all-reduce.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepTotals {
    /// Sum over finite micro-batches of `mean_loss * tokens`.
    pub loss_sum: f64,
    /// Tokens behind `loss_sum`.
    pub loss_tokens: f64,
    pub tokens: f64,
    pub correct: f64,
    pub non_finite: f64,
}

impl StepTotals {
    pub const LEN: usize = 5;

    pub fn add_micro_batch(&mut self, mean_loss: f64, tokens: u64, correct: u64) {
        self.tokens += tokens as f64;
        self.correct += correct as f64;
        if mean_loss.is_finite() {
            self.loss_sum += mean_loss * tokens as f64;
            self.loss_tokens += tokens as f64;
        } else {
            self.non_finite += 1.0;
        }
    }

    pub fn to_array(self) -> [f64; Self::LEN] {
        [
            self.loss_sum,
            self.loss_tokens,
            self.tokens,
            self.correct,
            self.non_finite,
        ]
    }

    pub fn from_array(values: [f64; Self::LEN]) -> Self {
        let [loss_sum, loss_tokens, tokens, correct, non_finite] = values;
        Self {
            loss_sum,
            loss_tokens,
            tokens,
            correct,
            non_finite,
        }
    }

    pub fn mean_loss(&self) -> f64 {
        if self.loss_tokens > 0.0 {
            self.loss_sum / self.loss_tokens
        } else {
            f64::NAN
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.tokens > 0.0 {
            self.correct / self.tokens
        } else {
            0.0
        }
    }
}

/// One line of the metric log: the globally reduced result of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: u64,
    #[serde(deserialize_with = "nan_if_null")]
    pub loss: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub perplexity: f64,
    pub accuracy: f64,
    pub tokens: u64,
    pub learning_rate: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub grad_norm: f64,
    pub non_finite_losses: u64,
}

// serde_json writes non-finite floats as `null`.
fn nan_if_null<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

impl MetricRecord {
    pub fn from_totals(step: u64, totals: &StepTotals, learning_rate: f64, grad_norm: f64) -> Self {
        let loss = totals.mean_loss();
        Self {
            step,
            loss,
            perplexity: loss.exp(),
            accuracy: totals.accuracy(),
            tokens: totals.tokens as u64,
            learning_rate,
            grad_norm,
            non_finite_losses: totals.non_finite as u64,
        }
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    tokens_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            tokens_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, record: &MetricRecord) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.tokens_processed = self.tokens_processed.saturating_add(record.tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            record.tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let loss = if record.loss.is_finite() {
            self.loss_ema.update(record.loss)
        } else {
            self.loss_ema.value().unwrap_or(record.loss)
        };

        StepSnapshot {
            loss,
            tokens_per_sec: self.throughput_ema.update(step_tokens_per_sec),
            total_tokens: self.tokens_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

/// Smoothed view of the run for console output.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub tokens_per_sec: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    token_count: u64,
    correct_tokens: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, tokens: u64, correct: u64) {
        self.loss_sum += loss * tokens as f64;
        self.token_count += tokens;
        self.correct_tokens += correct;
    }

    pub fn to_array(&self) -> [f64; 3] {
        [
            self.loss_sum,
            self.token_count as f64,
            self.correct_tokens as f64,
        ]
    }

    /// Builds the summary from all-reduced sums.
    pub fn finalize_reduced(step: u64, values: [f64; 3]) -> Option<EvaluationSummary> {
        let [loss_sum, tokens, correct] = values;
        if tokens <= 0.0 {
            return None;
        }
        let average_loss = loss_sum / tokens;
        Some(EvaluationSummary {
            step,
            average_loss,
            perplexity: average_loss.exp(),
            accuracy: correct / tokens,
            tokens: tokens as u64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub step: u64,
    pub average_loss: f64,
    pub perplexity: f64,
    pub accuracy: f64,
    pub tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_losses_are_counted_not_averaged() {
        let mut totals = StepTotals::default();
        totals.add_micro_batch(2.0, 10, 4);
        totals.add_micro_batch(f64::NAN, 10, 0);
        totals.add_micro_batch(4.0, 10, 6);
        assert_eq!(totals.mean_loss(), 3.0);
        assert_eq!(totals.non_finite, 1.0);
        assert!((totals.accuracy() - 10.0 / 30.0).abs() < 1e-12);

        let round_trip = StepTotals::from_array(totals.to_array());
        assert_eq!(round_trip, totals);
    }

    #[test]
    fn non_finite_record_survives_json() {
        let totals = StepTotals {
            non_finite: 2.0,
            tokens: 8.0,
            ..StepTotals::default()
        };
        let record = MetricRecord::from_totals(3, &totals, 1e-3, f64::NAN);
        let json = serde_json::to_string(&record).unwrap();
        let back: MetricRecord = serde_json::from_str(&json).unwrap();
        assert!(back.loss.is_nan() && back.grad_norm.is_nan());
        assert_eq!(back.non_finite_losses, 2);
    }

    #[test]
    fn evaluation_summary_uses_token_weighted_loss() {
        let mut eval = EvaluationMetrics::default();
        eval.update(1.0, 30, 3);
        eval.update(3.0, 10, 1);
        let summary = EvaluationMetrics::finalize_reduced(7, eval.to_array()).unwrap();
        assert!((summary.average_loss - 1.5).abs() < 1e-12);
        assert_eq!(summary.tokens, 40);
        assert!(EvaluationMetrics::finalize_reduced(7, [0.0; 3]).is_none());
    }
}
