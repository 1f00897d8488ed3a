use std::{sync::atomic::AtomicU64, time::Duration};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use super::{
    star::{run_collective, write_back, Collective, Envelope, Payload, StarTransport},
    DistributedContext, ReduceOp,
};
use crate::TrainingError;

/// Builder for an in-process group with one thread per rank.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates the contexts of a `world_size` group. Context `i` belongs to
    /// rank `i` and must be moved onto that rank's thread.
    pub fn create(
        world_size: usize,
        timeout: Duration,
    ) -> Result<Vec<LocalContext>, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::configuration(
                "local process group needs at least one rank",
            ));
        }

        let mut peers = Vec::with_capacity(world_size.saturating_sub(1));
        let mut members = Vec::with_capacity(world_size.saturating_sub(1));
        for rank in 1..world_size {
            let (up_tx, up_rx) = bounded(1);
            let (down_tx, down_rx) = bounded(1);
            peers.push(PeerLink {
                uplink: up_rx,
                downlink: down_tx,
            });
            members.push(LocalContext {
                rank,
                world_size,
                timeout,
                sequence: AtomicU64::new(0),
                role: Role::Member {
                    uplink: up_tx,
                    downlink: down_rx,
                },
            });
        }

        let mut contexts = Vec::with_capacity(world_size);
        contexts.push(LocalContext {
            rank: 0,
            world_size,
            timeout,
            sequence: AtomicU64::new(0),
            role: Role::Root { peers },
        });
        contexts.extend(members);
        Ok(contexts)
    }
}

struct PeerLink {
    uplink: Receiver<Envelope>,
    downlink: Sender<Payload>,
}

enum Role {
    Root {
        peers: Vec<PeerLink>,
    },
    Member {
        uplink: Sender<Envelope>,
        downlink: Receiver<Payload>,
    },
}

/// One rank of a [`LocalGroup`].
pub struct LocalContext {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    sequence: AtomicU64,
    role: Role,
}

impl LocalContext {
    fn peer(&self, peer: usize, op: Collective) -> Result<&PeerLink, TrainingError> {
        match &self.role {
            Role::Root { peers } => peers.get(peer - 1).ok_or_else(|| {
                TrainingError::collective(op.name(), self.rank, format!("no link to rank {peer}"))
            }),
            Role::Member { .. } => Err(TrainingError::collective(
                op.name(),
                self.rank,
                "only rank 0 talks to peers",
            )),
        }
    }

    fn member(&self, op: Collective) -> Result<(&Sender<Envelope>, &Receiver<Payload>), TrainingError> {
        match &self.role {
            Role::Member { uplink, downlink } => Ok((uplink, downlink)),
            Role::Root { .. } => Err(TrainingError::collective(
                op.name(),
                self.rank,
                "rank 0 has no root link",
            )),
        }
    }

    fn recv_error(&self, op: Collective, from: usize, err: RecvTimeoutError) -> TrainingError {
        let detail = match err {
            RecvTimeoutError::Timeout => {
                format!("timed out after {:?} waiting for rank {from}", self.timeout)
            }
            RecvTimeoutError::Disconnected => format!("rank {from} left the group"),
        };
        TrainingError::collective(op.name(), self.rank, detail)
    }

    fn send_error<T>(&self, op: Collective, to: usize, err: SendTimeoutError<T>) -> TrainingError {
        let detail = match err {
            SendTimeoutError::Timeout(_) => {
                format!("timed out after {:?} sending to rank {to}", self.timeout)
            }
            SendTimeoutError::Disconnected(_) => format!("rank {to} left the group"),
        };
        TrainingError::collective(op.name(), self.rank, detail)
    }
}

impl StarTransport for LocalContext {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn sequence(&self) -> &AtomicU64 {
        &self.sequence
    }

    fn send_to_root(&self, envelope: Envelope) -> Result<(), TrainingError> {
        let op = envelope.op;
        let (uplink, _) = self.member(op)?;
        uplink
            .send_timeout(envelope, self.timeout)
            .map_err(|err| self.send_error(op, 0, err))
    }

    fn recv_from_root(&self, op: Collective) -> Result<Payload, TrainingError> {
        let (_, downlink) = self.member(op)?;
        downlink
            .recv_timeout(self.timeout)
            .map_err(|err| self.recv_error(op, 0, err))
    }

    fn recv_from_peer(&self, peer: usize, op: Collective) -> Result<Envelope, TrainingError> {
        self.peer(peer, op)?
            .uplink
            .recv_timeout(self.timeout)
            .map_err(|err| self.recv_error(op, peer, err))
    }

    fn send_to_peer(
        &self,
        peer: usize,
        op: Collective,
        payload: Payload,
    ) -> Result<(), TrainingError> {
        self.peer(peer, op)?
            .downlink
            .send_timeout(payload, self.timeout)
            .map_err(|err| self.send_error(op, peer, err))
    }
}

impl DistributedContext for LocalContext {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        run_collective(self, Collective::Barrier, Payload::Empty).map(|_| ())
    }

    fn all_reduce(&self, values: &mut [f32], op: ReduceOp) -> Result<(), TrainingError> {
        match run_collective(self, Collective::AllReduce(op), Payload::F32(values.to_vec()))? {
            Payload::F32(result) => write_back(values, &result, self.rank),
            other => Err(unexpected(self.rank, &other)),
        }
    }

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), TrainingError> {
        match run_collective(self, Collective::AllReduce(op), Payload::F64(values.to_vec()))? {
            Payload::F64(result) => write_back(values, &result, self.rank),
            other => Err(unexpected(self.rank, &other)),
        }
    }

    fn broadcast_bytes(&self, payload: Vec<u8>, src: usize) -> Result<Vec<u8>, TrainingError> {
        match run_collective(self, Collective::Broadcast { src }, Payload::Bytes(payload))? {
            Payload::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected(self.rank, &other)),
        }
    }

    fn describe(&self) -> String {
        format!("local[{}]", self.world_size)
    }
}

pub(crate) fn unexpected(rank: usize, payload: &Payload) -> TrainingError {
    TrainingError::collective(
        "collective",
        rank,
        format!("unexpected result payload {}", payload.describe()),
    )
}
