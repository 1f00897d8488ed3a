//! Deterministic, resumable, distributed training engine for decoder-only
//! language models.

pub mod adapter;
pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod launch;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod publish;
pub mod scheduler;
pub mod trainer;

pub use adapter::{ModelAdapter, ModelSnapshot};
pub use checkpoint::{CheckpointManager, CheckpointManifest, TrainingState};
pub use config::TrainingConfig;
pub use data::{DataBatch, DataSequencer, MicroBatch};
pub use distributed::{DistributedContext, ReduceOp};
pub use error::{ErrorKind, TrainingError};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use optimizer::{AdamW, OptimizerSnapshot};
pub use scheduler::LearningRateSchedule;
pub use trainer::{Phase, RunOutcome, Trainer};
