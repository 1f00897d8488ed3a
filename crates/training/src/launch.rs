//! Process-group setup around [`Trainer`].
//!
//! `single` and `tcp` runs own one rank per process. `local` runs start one
//! thread per rank inside this process.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use model::LanguageModel;
use tracing::info;

use crate::{
    config::DistributedStrategy,
    distributed::{self, DistributedContext, LocalGroup},
    trainer::{RunOutcome, Trainer},
    ErrorKind, TrainingConfig, TrainingError,
};

/// Runs the reference model as configured. Returns the outcome of this
/// process's rank, or of rank 0 for a local group.
pub fn run(config: TrainingConfig, stop: &AtomicBool) -> Result<RunOutcome, TrainingError> {
    run_with(config, stop, Trainer::new)
}

/// Same as [`run`] with a caller-supplied trainer builder.
pub fn run_with<M, B>(
    config: TrainingConfig,
    stop: &AtomicBool,
    build: B,
) -> Result<RunOutcome, TrainingError>
where
    M: LanguageModel,
    B: Fn(TrainingConfig, Box<dyn DistributedContext>) -> Result<Trainer<M>, TrainingError> + Sync,
{
    match config.distributed.strategy {
        DistributedStrategy::Local => {
            let mut outcomes = run_local(config, stop, build)?;
            Ok(outcomes.swap_remove(0))
        }
        _ => {
            let ctx = distributed::connect(&config.distributed)?;
            info!(group = %ctx.describe(), rank = ctx.rank(), "joined process group");
            build(config, ctx)?.run(|| stop.load(Ordering::Relaxed))
        }
    }
}

/// Runs every rank of a local group on its own thread and returns the
/// outcomes in rank order. When ranks fail, the root cause is reported in
/// preference to the collective errors it triggers on the other ranks.
pub fn run_local<M, B>(
    config: TrainingConfig,
    stop: &AtomicBool,
    build: B,
) -> Result<Vec<RunOutcome>, TrainingError>
where
    M: LanguageModel,
    B: Fn(TrainingConfig, Box<dyn DistributedContext>) -> Result<Trainer<M>, TrainingError> + Sync,
{
    let contexts = LocalGroup::create(
        config.distributed.world_size,
        distributed::timeout(&config.distributed),
    )?;
    let build = &build;
    let config = &config;
    let results: Vec<Result<RunOutcome, TrainingError>> = thread::scope(|scope| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                let rank = ctx.rank();
                let handle = thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        build(config.clone(), Box::new(ctx))?.run(|| stop.load(Ordering::Relaxed))
                    });
                (rank, handle)
            })
            .collect();
        handles
            .into_iter()
            .map(|(rank, handle)| {
                let handle = handle.map_err(|err| {
                    TrainingError::runtime(format!("failed to start rank {rank}: {err}"))
                })?;
                handle
                    .join()
                    .map_err(|_| TrainingError::runtime(format!("rank {rank} panicked")))?
            })
            .collect()
    });

    let mut outcomes = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() {
        return Ok(outcomes);
    }
    let root = errors
        .iter()
        .position(|err| err.kind() != ErrorKind::CollectiveTimeout)
        .unwrap_or(0);
    Err(errors.swap_remove(root))
}
