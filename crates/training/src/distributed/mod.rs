//! Process-group identity and collective operations.
//!
//! Every rank must issue the same collectives in the same order. The star
//! backends tag each call with a sequence number so a divergence is reported
//! by rank 0 instead of silently pairing unrelated buffers, but the ordering
//! itself is the caller's obligation.

mod local;
mod star;
mod tcp;

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

pub use local::{LocalContext, LocalGroup};
pub use tcp::TcpContext;

use crate::{
    config::{DistributedConfig, DistributedStrategy},
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    fn code(self) -> u8 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Mean => 1,
            ReduceOp::Max => 2,
            ReduceOp::Min => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReduceOp::Sum),
            1 => Some(ReduceOp::Mean),
            2 => Some(ReduceOp::Max),
            3 => Some(ReduceOp::Min),
            _ => None,
        }
    }
}

/// Rank identity plus the collectives the rest of the engine may use.
pub trait DistributedContext: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    fn barrier(&self) -> Result<(), TrainingError>;

    /// Element-wise reduction of `values` across ranks, in place.
    fn all_reduce(&self, values: &mut [f32], op: ReduceOp) -> Result<(), TrainingError>;

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), TrainingError>;

    /// Returns the payload held by rank `src` on every rank.
    fn broadcast_bytes(&self, payload: Vec<u8>, src: usize) -> Result<Vec<u8>, TrainingError>;

    /// Short label for logs, e.g. `local[2]`.
    fn describe(&self) -> String;
}

/// Broadcasts a serializable value from `src`. Only `src` needs to supply it.
pub fn broadcast_value<T>(
    ctx: &dyn DistributedContext,
    value: Option<&T>,
    src: usize,
) -> Result<T, TrainingError>
where
    T: Serialize + DeserializeOwned,
{
    let payload = if ctx.rank() == src {
        let value = value.ok_or_else(|| {
            TrainingError::runtime(format!("broadcast source rank {src} supplied no value"))
        })?;
        serde_json::to_vec(value).map_err(|err| {
            TrainingError::runtime(format!("failed to encode broadcast value: {err}"))
        })?
    } else {
        Vec::new()
    };
    let bytes = ctx.broadcast_bytes(payload, src)?;
    serde_json::from_slice(&bytes).map_err(|err| {
        TrainingError::runtime(format!("failed to decode broadcast value: {err}"))
    })
}

/// Context for a job with exactly one rank.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl DistributedContext for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn all_reduce(&self, _values: &mut [f32], _op: ReduceOp) -> Result<(), TrainingError> {
        Ok(())
    }

    fn all_reduce_f64(&self, _values: &mut [f64], _op: ReduceOp) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast_bytes(&self, payload: Vec<u8>, src: usize) -> Result<Vec<u8>, TrainingError> {
        if src != 0 {
            return Err(TrainingError::collective(
                "broadcast",
                0,
                format!("source rank {src} does not exist in a single-process group"),
            ));
        }
        Ok(payload)
    }

    fn describe(&self) -> String {
        "single".to_string()
    }
}

/// Establishes the context of this process for single and TCP strategies.
///
/// Local groups own one context per thread and are built by
/// [`LocalGroup::create`] instead.
pub fn connect(config: &DistributedConfig) -> Result<Box<dyn DistributedContext>, TrainingError> {
    match config.strategy {
        DistributedStrategy::Single => Ok(Box::new(SingleProcess)),
        DistributedStrategy::Tcp => Ok(Box::new(TcpContext::connect(config)?)),
        DistributedStrategy::Local => Err(TrainingError::configuration(
            "local process groups are created per thread by the launcher",
        )),
    }
}

pub(crate) fn timeout(config: &DistributedConfig) -> Duration {
    Duration::from_secs(config.timeout_secs)
}
