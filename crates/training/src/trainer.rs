//! The training loop state machine.
//!
//! ```text
//! INIT -> RUNNING -> {CHECKPOINTING -> RUNNING} -> {EVALUATING -> RUNNING} -> TERMINATED
//!                 \-> FAILED
//! ```
//!
//! Every rank runs the same sequence of collectives per step: gradient mean,
//! metric sums, optional evaluation sums, the stop vote and, when a
//! checkpoint is due, the save protocol.

use std::{fs, ops::Range, path::Path, sync::Arc};

use candle_core::Device;
use model::{DecoderModel, LanguageModel, NoopObserver};
use pretraining_data::{TokenCorpus, TokenShardCorpus};
use tracing::{debug, error, info, warn};

use crate::{
    adapter::ModelAdapter,
    capture::{DynamicsCapture, LearningDynamicsRecord},
    checkpoint::{
        CheckpointManager, CheckpointManifest, CheckpointSelector, MetricSnapshot, SaveRequest,
        TrainingState,
    },
    data::{DataSequencer, MicroBatch, SequencerSettings},
    distributed::{DistributedContext, ReduceOp},
    logging::{Logger, LoggingSettings},
    metrics::{EvaluationMetrics, EvaluationSummary, MetricRecord, StepTotals, TrainingMetrics},
    publish::{self, PublishJob, PublishQueue},
    scheduler::LearningRateSchedule,
    ErrorKind, TrainingConfig, TrainingError,
};

const CONFIG_SNAPSHOT_FILENAME: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Checkpointing,
    Evaluating,
    Terminated,
    Failed,
}

/// Result of a run that reached TERMINATED.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_step: u64,
    pub state: TrainingState,
    pub metrics: Option<MetricRecord>,
    pub evaluation: Option<EvaluationSummary>,
    pub last_manifest: Option<CheckpointManifest>,
}

pub struct Trainer<M: LanguageModel = DecoderModel> {
    config: TrainingConfig,
    ctx: Box<dyn DistributedContext>,
    phase: Phase,
    adapter: ModelAdapter<M>,
    schedule: LearningRateSchedule,
    sequencer: DataSequencer,
    eval_corpus: Option<Arc<dyn TokenCorpus>>,
    capture: DynamicsCapture,
    dynamics_batch: Option<MicroBatch>,
    checkpoints: CheckpointManager,
    logger: Option<Logger>,
    publisher: Option<PublishQueue>,
    metrics: TrainingMetrics,
    state: TrainingState,
    active_step: u64,
    last_record: Option<MetricRecord>,
    last_eval: Option<EvaluationSummary>,
    last_manifest: Option<CheckpointManifest>,
    last_saved_step: Option<u64>,
}

impl Trainer<DecoderModel> {
    /// Builds the reference decoder and opens the corpora named in `config`.
    pub fn new(
        config: TrainingConfig,
        ctx: Box<dyn DistributedContext>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = Device::Cpu;
        let model = DecoderModel::new(config.model_config(&device))?;
        let train = open_corpus(&config.data.train_path, config.data.sequence_length)?;
        let eval = match config.data.eval_path.as_ref() {
            Some(path) => Some(open_corpus(path, config.data.sequence_length)?),
            None => None,
        };
        Self::with_parts(config, ctx, model, train, eval)
    }
}

impl<M: LanguageModel> Trainer<M> {
    /// INIT with caller-supplied model and corpora.
    pub fn with_parts(
        config: TrainingConfig,
        ctx: Box<dyn DistributedContext>,
        model: M,
        train_corpus: Arc<dyn TokenCorpus>,
        eval_corpus: Option<Arc<dyn TokenCorpus>>,
    ) -> Result<Self, TrainingError> {
        let rank = ctx.rank();
        Self::initialize(config, ctx, model, train_corpus, eval_corpus).map_err(|err| err.at(0, rank))
    }

    fn initialize(
        config: TrainingConfig,
        ctx: Box<dyn DistributedContext>,
        model: M,
        train_corpus: Arc<dyn TokenCorpus>,
        eval_corpus: Option<Arc<dyn TokenCorpus>>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let (rank, world_size) = (ctx.rank(), ctx.world_size());
        if world_size != config.distributed.world_size {
            return Err(TrainingError::configuration(format!(
                "process group {} has {world_size} ranks but distributed.world_size is {}",
                ctx.describe(),
                config.distributed.world_size
            )));
        }
        if train_corpus.sequence_length() != config.data.sequence_length {
            return Err(TrainingError::configuration(format!(
                "training corpus holds sequences of {} tokens, data.sequence_length is {}",
                train_corpus.sequence_length(),
                config.data.sequence_length
            )));
        }
        if let Some(eval) = &eval_corpus {
            if eval.sequence_length() != config.data.sequence_length {
                return Err(TrainingError::configuration(
                    "evaluation corpus sequence length differs from the training corpus",
                ));
            }
        }
        if config.evaluation.every_n_steps.is_some() && eval_corpus.is_none() {
            warn!("evaluation is scheduled but no evaluation corpus is configured, skipping it");
        }

        let capture = DynamicsCapture::from_config(&config, &model)?;
        let dynamics_batch = match config.learning_dynamics.eval_data.as_ref() {
            Some(path) if capture.is_enabled() => {
                let corpus = open_corpus(path, config.data.sequence_length)?;
                let rows = (config.learning_dynamics.batch_size as u64).min(corpus.len());
                if rows == 0 {
                    return Err(TrainingError::configuration(format!(
                        "learning_dynamics.eval_data {} holds no sequences",
                        path.display()
                    )));
                }
                Some(read_micro_batch(corpus.as_ref(), 0..rows)?)
            }
            _ => None,
        };
        let device = Device::Cpu;
        let mut adapter = ModelAdapter::from_config(model, &config, device.clone())?;
        let mut sequencer = DataSequencer::new(
            train_corpus,
            SequencerSettings::from_config(&config, rank, world_size),
            0,
        )?;
        let schedule = LearningRateSchedule::from_config(&config);

        let checkpoints = CheckpointManager::from_config(&config, device)?;
        if ctx.is_primary() {
            checkpoints.cleanup_incomplete()?;
        }
        ctx.barrier()?;
        adapter.broadcast_parameters(ctx.as_ref())?;

        let selector = match config.checkpointing.resume_from {
            Some(step) => Some(CheckpointSelector::Step(step)),
            None if config.checkpointing.auto_resume => Some(CheckpointSelector::Latest),
            None => None,
        };
        let loaded = match selector {
            Some(selector) => checkpoints.load_collective(ctx.as_ref(), selector)?,
            None => None,
        };

        let mut state = TrainingState::initial(config.data.seed, world_size);
        let mut last_record = None;
        let mut last_eval = None;
        let mut last_manifest = None;
        let resumed = loaded.is_some();
        if let Some(checkpoint) = loaded {
            adapter.import_state(&checkpoint.model, &checkpoint.optimizer)?;
            state = checkpoint.state;
            if state.world_size != world_size {
                warn!(
                    saved = state.world_size,
                    current = world_size,
                    "resuming with a different world size; data order is unchanged"
                );
                state.world_size = world_size;
                state.rank_seeds = crate::checkpoint::rank_seeds(state.master_seed, world_size);
            }
            last_record = checkpoint.manifest.metrics.train.clone();
            last_eval = checkpoint.manifest.metrics.eval.clone();
            last_manifest = Some(checkpoint.manifest);
            info!(step = state.global_step, rank, "resumed from checkpoint");
        } else if ctx.is_primary() {
            write_config_snapshot(&config)?;
        }
        sequencer.seek(state.global_step);

        let (logger, publisher) = if ctx.is_primary() {
            let resume_step = resumed.then_some(state.global_step);
            let logger = Logger::new(LoggingSettings::from_config(&config), resume_step)?;
            let publisher = publish::from_config(&config.checkpointing.publish, &config.run.run_name)?
                .map(PublishQueue::spawn);
            (Some(logger), publisher)
        } else {
            (None, None)
        };

        info!(
            rank,
            group = %ctx.describe(),
            corpus = sequencer.corpus_len(),
            watched = capture.watched().len(),
            start_step = state.global_step,
            "trainer initialized"
        );

        let last_saved_step = last_manifest.as_ref().map(|manifest| manifest.step);
        Ok(Self {
            active_step: state.global_step,
            config,
            ctx,
            phase: Phase::Init,
            adapter,
            schedule,
            sequencer,
            eval_corpus,
            capture,
            dynamics_batch,
            checkpoints,
            logger,
            publisher,
            metrics: TrainingMetrics::new(),
            state,
            last_record,
            last_eval,
            last_manifest,
            last_saved_step,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn adapter(&self) -> &ModelAdapter<M> {
        &self.adapter
    }

    /// Runs until `max_steps` or until any rank's `should_stop` returns true
    /// at a step boundary.
    pub fn run<F>(&mut self, mut should_stop: F) -> Result<RunOutcome, TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.phase = Phase::Running;
        match self.run_steps(&mut should_stop) {
            Ok(()) => {
                self.phase = Phase::Terminated;
                if let Some(logger) = self.logger.as_mut() {
                    logger.flush();
                }
                info!(step = self.state.global_step, rank = self.ctx.rank(), "training finished");
                Ok(RunOutcome {
                    final_step: self.state.global_step,
                    state: self.state.clone(),
                    metrics: self.last_record.clone(),
                    evaluation: self.last_eval.clone(),
                    last_manifest: self.last_manifest.clone(),
                })
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn run_steps(&mut self, should_stop: &mut dyn FnMut() -> bool) -> Result<(), TrainingError> {
        let max_steps = self.config.training.max_steps;
        let every = self.config.checkpointing.every_n_steps.max(1);

        if self.state.global_step == 0
            && self.config.checkpointing.save_initial
            && self.last_saved_step.is_none()
        {
            self.checkpoint(None)?;
        }

        while self.state.global_step < max_steps {
            let step = self.state.global_step + 1;
            self.active_step = step;
            let dynamics = self.train_step(step)?;

            if let Some(interval) = self.config.evaluation.every_n_steps {
                if interval > 0 && step % interval == 0 {
                    self.evaluate(step)?;
                }
            }

            let stop = self.agree_stop(should_stop())?;
            let due = step % every == 0 || step == max_steps || stop;
            if due && self.last_saved_step != Some(step) {
                self.checkpoint(dynamics)?;
            } else if let Some(record) = dynamics {
                self.save_standalone_dynamics(&record);
            }
            if stop {
                info!(step, "stop requested, leaving the training loop");
                break;
            }
        }
        Ok(())
    }

    /// Completes step `step` and returns its capture record, if sampled.
    fn train_step(&mut self, step: u64) -> Result<Option<LearningDynamicsRecord>, TrainingError> {
        let batch = self.sequencer.next_batch()?;
        debug_assert_eq!(batch.step + 1, step);

        let mut capture = if self.ctx.is_primary() {
            self.capture.begin_step(step)
        } else {
            None
        };
        let mut totals = StepTotals::default();
        for (index, micro_batch) in batch.micro_batches.iter().enumerate() {
            let output = match capture.as_mut() {
                Some(observer) if index == 0 => self.adapter.forward(micro_batch, observer)?,
                _ => self.adapter.forward(micro_batch, &mut NoopObserver)?,
            };
            totals.add_micro_batch(
                output.metrics.average_loss(),
                output.metrics.total_tokens(),
                output.metrics.correct_tokens(),
            );
            self.adapter.backward(&output)?;
        }

        self.adapter.synchronize_gradients(self.ctx.as_ref())?;
        let dynamics = match capture {
            Some(capture) => {
                let mut record = capture.finish(&self.adapter)?;
                if let Some(batch) = &self.dynamics_batch {
                    record.eval_modules = self.capture.capture_batch(step, &self.adapter, batch)?;
                }
                Some(record)
            }
            None => None,
        };

        let learning_rate = self.schedule.lr_at(step - 1);
        let report = self.adapter.step(learning_rate)?;
        if !report.applied {
            warn!(step, grad_norm = report.grad_norm, "non-finite gradient norm, update skipped");
        }

        self.state.global_step = step;
        self.state.epoch = self.sequencer.epoch_of_step(step);
        self.state.sample_cursor = self.sequencer.sample_position(step);

        let mut values = totals.to_array();
        self.ctx.all_reduce_f64(&mut values, ReduceOp::Sum)?;
        let totals = StepTotals::from_array(values);
        self.state.tokens_seen = self.state.tokens_seen.saturating_add(totals.tokens as u64);

        let record = MetricRecord::from_totals(step, &totals, learning_rate, report.grad_norm);
        let snapshot = self.metrics.record_step(&record);
        if let Some(logger) = self.logger.as_mut() {
            logger.log_training_step(&record, &snapshot)?;
        }
        self.last_record = Some(record);
        Ok(dynamics)
    }

    /// Forward-only pass over up to `evaluation.max_batches` rank-sharded
    /// held-out batches.
    fn evaluate(&mut self, step: u64) -> Result<Option<EvaluationSummary>, TrainingError> {
        let Some(corpus) = self.eval_corpus.clone() else {
            return Ok(None);
        };
        self.phase = Phase::Evaluating;

        let rows = self.sequencer.settings().micro_batch_size();
        let (rank, world_size) = (self.ctx.rank() as u64, self.ctx.world_size() as u64);
        let mut metrics = EvaluationMetrics::default();
        for batch_index in 0..self.config.evaluation.max_batches as u64 {
            let first = (batch_index * world_size + rank) * rows as u64;
            let last = (first + rows as u64).min(corpus.len());
            if first >= last {
                break;
            }
            let micro_batch = read_micro_batch(corpus.as_ref(), first..last)?;
            let output = self.adapter.forward(&micro_batch, &mut NoopObserver)?;
            metrics.update(
                output.metrics.average_loss(),
                output.metrics.total_tokens(),
                output.metrics.correct_tokens(),
            );
        }

        let mut values = metrics.to_array();
        self.ctx.all_reduce_f64(&mut values, ReduceOp::Sum)?;
        let summary = EvaluationMetrics::finalize_reduced(step, values);
        if let (Some(summary), Some(logger)) = (summary.as_ref(), self.logger.as_mut()) {
            logger.log_evaluation(summary);
        }
        if summary.is_some() {
            self.last_eval = summary.clone();
        }
        self.phase = Phase::Running;
        Ok(summary)
    }

    fn agree_stop(&self, local: bool) -> Result<bool, TrainingError> {
        let mut vote = [if local { 1.0 } else { 0.0 }];
        self.ctx.all_reduce_f64(&mut vote, ReduceOp::Max)?;
        Ok(vote[0] > 0.0)
    }

    fn checkpoint(&mut self, dynamics: Option<LearningDynamicsRecord>) -> Result<(), TrainingError> {
        self.phase = Phase::Checkpointing;
        let step = self.state.global_step;
        let request = self.save_parts(dynamics);
        let adapter = &self.adapter;
        let manifest = self.checkpoints.save_collective(self.ctx.as_ref(), move || {
            let (state, dynamics, metrics) = request;
            let (model, optimizer) = adapter.export_state()?;
            Ok(SaveRequest {
                state,
                model,
                optimizer,
                dynamics,
                metrics,
            })
        })?;

        if let Some(queue) = &self.publisher {
            let mut files: Vec<String> = manifest.files.iter().map(|f| f.filename.clone()).collect();
            files.push("manifest.json".to_string());
            queue.enqueue(PublishJob {
                step,
                directory: self.checkpoints.step_dir(step),
                files,
            });
        }
        self.last_saved_step = Some(step);
        self.last_manifest = Some(manifest);
        self.phase = Phase::Running;
        Ok(())
    }

    fn save_parts(
        &self,
        dynamics: Option<LearningDynamicsRecord>,
    ) -> (TrainingState, Option<LearningDynamicsRecord>, MetricSnapshot) {
        (
            self.state.clone(),
            dynamics,
            MetricSnapshot {
                train: self.last_record.clone(),
                eval: self.last_eval.clone(),
            },
        )
    }

    fn save_standalone_dynamics(&self, record: &LearningDynamicsRecord) {
        let dir = self.config.learning_dynamics_dir();
        match record.save_standalone(&dir) {
            Ok(path) => debug!(step = record.step, path = %path.display(), "saved learning dynamics"),
            Err(err) => warn!(step = record.step, error = %err, "failed to save learning dynamics"),
        }
    }

    /// FAILED: annotate, attempt a local save of the last completed step,
    /// and hand the error back.
    fn fail(&mut self, err: TrainingError) -> TrainingError {
        self.phase = Phase::Failed;
        let rank = self.ctx.rank();
        let err = err.at(self.active_step, rank);
        error!(step = self.active_step, rank, kind = %err.kind(), error = %err, "training failed");

        let recoverable = !matches!(err.kind(), ErrorKind::Storage | ErrorKind::CollectiveTimeout);
        let step = self.state.global_step;
        if self.ctx.is_primary() && recoverable && step > 0 && self.last_saved_step != Some(step) {
            let attempt = self.adapter.export_state().and_then(|(model, optimizer)| {
                let (state, dynamics, metrics) = self.save_parts(None);
                self.checkpoints.save(&SaveRequest {
                    state,
                    model,
                    optimizer,
                    dynamics,
                    metrics,
                })
            });
            match attempt {
                Ok(manifest) => {
                    warn!(step, "saved last completed step after failure");
                    self.last_manifest = Some(manifest);
                    self.last_saved_step = Some(step);
                }
                Err(save_err) => warn!(step, error = %save_err, "best-effort checkpoint failed"),
            }
        }
        if let Some(logger) = self.logger.as_mut() {
            logger.flush();
        }
        err
    }
}

fn open_corpus(path: &Path, sequence_length: usize) -> Result<Arc<dyn TokenCorpus>, TrainingError> {
    let corpus = TokenShardCorpus::open_path(path, sequence_length).map_err(|err| {
        TrainingError::configuration(format!("failed to open token corpus {}: {err}", path.display()))
    })?;
    Ok(Arc::new(corpus))
}

/// Reads the sequences in `indices` into one micro-batch.
fn read_micro_batch(
    corpus: &dyn TokenCorpus,
    indices: Range<u64>,
) -> Result<MicroBatch, TrainingError> {
    let seq_len = corpus.sequence_length();
    let rows = (indices.end - indices.start) as usize;
    let mut tokens = Vec::with_capacity(rows * seq_len);
    for index in indices {
        corpus.read_sequence(index, &mut tokens).map_err(|err| {
            TrainingError::runtime(format!("failed to read sequence {index}: {err}"))
        })?;
    }
    Ok(MicroBatch {
        tokens,
        rows,
        seq_len,
    })
}

/// Writes the resolved configuration next to the checkpoints of a fresh run.
fn write_config_snapshot(config: &TrainingConfig) -> Result<(), TrainingError> {
    let dir = config.run_dir();
    fs::create_dir_all(&dir).map_err(|err| TrainingError::storage(&dir, err))?;
    let path = dir.join(CONFIG_SNAPSHOT_FILENAME);
    let mut data = serde_json::to_vec_pretty(config)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize config: {err}")))?;
    data.push(b'\n');
    fs::write(&path, data).map_err(|err| TrainingError::storage(&path, err))
}
