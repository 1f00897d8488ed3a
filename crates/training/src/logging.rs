use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::TrainingConfig,
    metrics::{EvaluationSummary, MetricRecord, StepSnapshot},
    TrainingError,
};

/// Installs the process-wide fmt subscriber. `RUST_LOG` takes precedence over
/// `level`. Calling it twice keeps the first subscriber.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
    {
        debug!(error = %err, "tracing subscriber already installed");
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
    pub metric_log: PathBuf,
    pub log_every_n_steps: u64,
}

impl LoggingSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        let logs = config.logs_dir();
        Self {
            enable_stdout: config.logging.stdout,
            tensorboard_dir: config.logging.tensorboard.then(|| logs.join("tensorboard")),
            tensorboard_flush_every_n: config.logging.flush_every.max(1),
            metric_log: logs.join("metrics.jsonl"),
            log_every_n_steps: config.training.log_every_n_steps.max(1),
        }
    }
}

/// Metric sinks of the primary rank.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
    metric_log: MetricLog,
}

impl Logger {
    /// `resume_step` truncates metric records past the restored step.
    pub fn new(settings: LoggingSettings, resume_step: Option<u64>) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        let metric_log = MetricLog::open(&settings.metric_log, resume_step)?;
        Ok(Self {
            settings,
            tensorboard,
            metric_log,
        })
    }

    pub fn log_training_step(
        &mut self,
        record: &MetricRecord,
        snapshot: &StepSnapshot,
    ) -> Result<(), TrainingError> {
        self.metric_log.append(record)?;

        if self.settings.enable_stdout && record.step % self.settings.log_every_n_steps == 0 {
            info!(
                step = record.step,
                loss = format_args!("{:.4}", record.loss),
                loss_ema = format_args!("{:.4}", snapshot.loss),
                ppl = format_args!("{:.2}", record.perplexity),
                acc = format_args!("{:.3}", record.accuracy),
                tok_s = format_args!("{:.1}", snapshot.tokens_per_sec),
                grad_norm = format_args!("{:.3}", record.grad_norm),
                lr = format_args!("{:.3e}", record.learning_rate),
                "train"
            );
        }
        if record.non_finite_losses > 0 {
            warn!(
                step = record.step,
                count = record.non_finite_losses,
                "non-finite loss in micro-batches"
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = record.step as i64;
            let scalars = [
                ("train/loss", record.loss),
                ("train/loss_ema", snapshot.loss),
                ("train/perplexity", record.perplexity),
                ("train/accuracy", record.accuracy),
                ("train/tokens_per_sec", snapshot.tokens_per_sec),
                ("train/grad_norm", record.grad_norm),
                ("train/learning_rate", record.learning_rate),
            ];
            for (tag, value) in scalars {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    warn!(error = %err, "tensorboard write failed");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn log_evaluation(&mut self, summary: &EvaluationSummary) {
        if self.settings.enable_stdout {
            info!(
                step = summary.step,
                loss = format_args!("{:.4}", summary.average_loss),
                ppl = format_args!("{:.4}", summary.perplexity),
                acc = format_args!("{:.2}%", summary.accuracy * 100.0),
                tokens = summary.tokens,
                "eval"
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = summary.step as i64;
            let scalars = [
                ("eval/loss", summary.average_loss),
                ("eval/perplexity", summary.perplexity),
                ("eval/accuracy", summary.accuracy),
            ];
            for (tag, value) in scalars {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    warn!(error = %err, "tensorboard write failed");
                    break;
                }
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(error = %err, "tensorboard flush failed");
            }
        }
        if let Err(err) = self.metric_log.flush() {
            warn!(error = %err, "metric log flush failed");
        }
    }
}

/// Append-only JSON-lines log of [`MetricRecord`]s.
pub struct MetricLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricLog {
    /// Opens the log. A fresh run (`resume_step = None`) starts an empty
    /// file; a resumed run keeps only records up to `resume_step`.
    pub fn open(path: &Path, resume_step: Option<u64>) -> Result<Self, TrainingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| TrainingError::storage(parent, err))?;
        }
        let kept = match resume_step {
            Some(step) if path.exists() => Self::read(path)?
                .into_iter()
                .filter(|record| record.step <= step)
                .collect(),
            _ => Vec::new(),
        };

        let tmp = path.with_extension("jsonl.tmp");
        {
            let file = File::create(&tmp).map_err(|err| TrainingError::storage(&tmp, err))?;
            let mut writer = BufWriter::new(file);
            for record in &kept {
                write_record(&mut writer, record).map_err(|err| TrainingError::storage(&tmp, err))?;
            }
            writer.flush().map_err(|err| TrainingError::storage(&tmp, err))?;
        }
        fs::rename(&tmp, path).map_err(|err| TrainingError::storage(path, err))?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|err| TrainingError::storage(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, record: &MetricRecord) -> Result<(), TrainingError> {
        write_record(&mut self.writer, record)
            .and_then(|_| self.writer.flush())
            .map_err(|err| TrainingError::storage(&self.path, err))
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer
            .flush()
            .map_err(|err| TrainingError::storage(&self.path, err))
    }

    /// Reads every record; a torn final line is ignored.
    pub fn read(path: &Path) -> Result<Vec<MetricRecord>, TrainingError> {
        let file = File::open(path).map_err(|err| TrainingError::storage(path, err))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| TrainingError::storage(path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable metric record");
                }
            }
        }
        Ok(records)
    }
}

fn write_record(writer: &mut impl Write, record: &MetricRecord) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| TrainingError::storage(dir, err))?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| TrainingError::storage(&path, err))?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "tensorboard flush failed on close");
        }
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u64) -> MetricRecord {
        MetricRecord {
            step,
            loss: 1.0 / step as f64,
            perplexity: 1.0,
            accuracy: 0.5,
            tokens: 64,
            learning_rate: 1e-3,
            grad_norm: 0.5,
            non_finite_losses: 0,
        }
    }

    #[test]
    fn resume_truncates_records_past_the_restored_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/metrics.jsonl");
        {
            let mut log = MetricLog::open(&path, None).unwrap();
            for step in 1..=7 {
                log.append(&record(step)).unwrap();
            }
        }
        {
            let mut log = MetricLog::open(&path, Some(5)).unwrap();
            log.append(&record(6)).unwrap();
        }
        let steps: Vec<u64> = MetricLog::read(&path)
            .unwrap()
            .iter()
            .map(|r| r.step)
            .collect();
        assert_eq!(steps, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn fresh_run_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        MetricLog::open(&path, None)
            .unwrap()
            .append(&record(1))
            .unwrap();
        MetricLog::open(&path, None).unwrap();
        assert!(MetricLog::read(&path).unwrap().is_empty());
    }

    #[test]
    fn evaluation_scalars_reach_the_event_file_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(dir.path().join("tensorboard")),
            tensorboard_flush_every_n: 100,
            metric_log: dir.path().join("metrics.jsonl"),
            log_every_n_steps: 1,
        };
        let mut logger = Logger::new(settings, None).unwrap();
        logger.log_evaluation(&EvaluationSummary {
            step: 3,
            average_loss: 2.0,
            perplexity: 7.4,
            accuracy: 0.25,
            tokens: 32,
        });
        logger.flush();

        let event_file = fs::read_dir(dir.path().join("tensorboard"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let bytes = fs::read(event_file).unwrap();
        for tag in ["eval/loss", "eval/perplexity", "eval/accuracy"] {
            assert!(
                bytes.windows(tag.len()).any(|w| w == tag.as_bytes()),
                "missing {tag}"
            );
        }
    }
}
