use std::sync::atomic::{AtomicU64, Ordering};

use super::ReduceOp;
use crate::TrainingError;

/// Data carried by one collective call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    Empty,
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Type and length, for error messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            Payload::Empty => "empty".to_string(),
            Payload::F32(values) => format!("f32[{}]", values.len()),
            Payload::F64(values) => format!("f64[{}]", values.len()),
            Payload::Bytes(bytes) => format!("bytes[{}]", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Collective {
    Barrier,
    AllReduce(ReduceOp),
    Broadcast { src: usize },
}

impl Collective {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Collective::Barrier => "barrier",
            Collective::AllReduce(_) => "all_reduce",
            Collective::Broadcast { .. } => "broadcast",
        }
    }
}

/// One rank's contribution to a collective, sent to rank 0.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub(crate) seq: u64,
    pub(crate) rank: usize,
    pub(crate) op: Collective,
    pub(crate) payload: Payload,
}

/// Point-to-point links of a star topology rooted at rank 0.
pub(crate) trait StarTransport {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn sequence(&self) -> &AtomicU64;

    fn send_to_root(&self, envelope: Envelope) -> Result<(), TrainingError>;

    fn recv_from_root(&self, op: Collective) -> Result<Payload, TrainingError>;

    fn recv_from_peer(&self, peer: usize, op: Collective) -> Result<Envelope, TrainingError>;

    fn send_to_peer(&self, peer: usize, op: Collective, payload: Payload)
        -> Result<(), TrainingError>;
}

/// Runs one collective: members send their contribution to rank 0, rank 0
/// combines contributions in rank order and sends the result back.
pub(crate) fn run_collective<T: StarTransport>(
    transport: &T,
    op: Collective,
    payload: Payload,
) -> Result<Payload, TrainingError> {
    let rank = transport.rank();
    let seq = transport.sequence().fetch_add(1, Ordering::SeqCst);
    let envelope = Envelope {
        seq,
        rank,
        op,
        payload,
    };

    if rank != 0 {
        transport.send_to_root(envelope)?;
        return transport.recv_from_root(op);
    }

    let mut contributions = Vec::with_capacity(transport.world_size());
    contributions.push(envelope);
    for peer in 1..transport.world_size() {
        let incoming = transport.recv_from_peer(peer, op)?;
        if incoming.rank != peer {
            return Err(TrainingError::collective(
                op.name(),
                rank,
                format!(
                    "contribution on the link of rank {peer} claims to come from rank {}",
                    incoming.rank
                ),
            ));
        }
        if incoming.seq != seq || incoming.op != op {
            return Err(TrainingError::collective(
                op.name(),
                rank,
                format!(
                    "rank {peer} issued {} #{} while rank 0 issued {} #{seq}",
                    incoming.op.name(),
                    incoming.seq,
                    op.name()
                ),
            ));
        }
        contributions.push(incoming);
    }

    let result = combine(op, contributions)?;
    for peer in 1..transport.world_size() {
        transport.send_to_peer(peer, op, result.clone())?;
    }
    Ok(result)
}

fn combine(op: Collective, contributions: Vec<Envelope>) -> Result<Payload, TrainingError> {
    match op {
        Collective::Barrier => Ok(Payload::Empty),
        Collective::Broadcast { src } => contributions
            .into_iter()
            .find(|envelope| envelope.rank == src)
            .map(|envelope| envelope.payload)
            .ok_or_else(|| {
                TrainingError::collective(
                    "broadcast",
                    0,
                    format!("source rank {src} is not part of the group"),
                )
            }),
        Collective::AllReduce(reduce) => {
            let count = contributions.len();
            let mut payloads = contributions.into_iter().map(|envelope| envelope.payload);
            match payloads.next() {
                Some(Payload::F32(mut acc)) => {
                    for payload in payloads {
                        match payload {
                            Payload::F32(values) => fold(&mut acc, &values, reduce)?,
                            other => return Err(mixed(&other)),
                        }
                    }
                    if reduce == ReduceOp::Mean {
                        let scale = 1.0 / count as f32;
                        acc.iter_mut().for_each(|value| *value *= scale);
                    }
                    Ok(Payload::F32(acc))
                }
                Some(Payload::F64(mut acc)) => {
                    for payload in payloads {
                        match payload {
                            Payload::F64(values) => fold(&mut acc, &values, reduce)?,
                            other => return Err(mixed(&other)),
                        }
                    }
                    if reduce == ReduceOp::Mean {
                        let scale = 1.0 / count as f64;
                        acc.iter_mut().for_each(|value| *value *= scale);
                    }
                    Ok(Payload::F64(acc))
                }
                Some(other) => Err(mixed(&other)),
                None => Ok(Payload::Empty),
            }
        }
    }
}

fn fold<T>(acc: &mut [T], values: &[T], op: ReduceOp) -> Result<(), TrainingError>
where
    T: Copy + PartialOrd + std::ops::Add<Output = T>,
{
    if acc.len() != values.len() {
        return Err(TrainingError::collective(
            "all_reduce",
            0,
            format!(
                "buffer length mismatch: {} vs {} elements",
                acc.len(),
                values.len()
            ),
        ));
    }
    for (slot, &value) in acc.iter_mut().zip(values) {
        *slot = match op {
            ReduceOp::Sum | ReduceOp::Mean => *slot + value,
            ReduceOp::Max => {
                if value > *slot {
                    value
                } else {
                    *slot
                }
            }
            ReduceOp::Min => {
                if value < *slot {
                    value
                } else {
                    *slot
                }
            }
        };
    }
    Ok(())
}

fn mixed(payload: &Payload) -> TrainingError {
    TrainingError::collective(
        "all_reduce",
        0,
        format!("ranks supplied different element types ({})", payload.describe()),
    )
}

/// Copies a reduced result back into the caller's buffer.
pub(crate) fn write_back<T: Copy>(
    target: &mut [T],
    result: &[T],
    rank: usize,
) -> Result<(), TrainingError> {
    if target.len() != result.len() {
        return Err(TrainingError::collective(
            "all_reduce",
            rank,
            format!(
                "reduced buffer has {} elements, expected {}",
                result.len(),
                target.len()
            ),
        ));
    }
    target.copy_from_slice(result);
    Ok(())
}
