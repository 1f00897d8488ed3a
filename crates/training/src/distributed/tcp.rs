use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::atomic::AtomicU64,
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info};

use super::{
    local::unexpected,
    star::{run_collective, write_back, Collective, Envelope, Payload, StarTransport},
    timeout, DistributedContext, ReduceOp,
};
use crate::{config::DistributedConfig, TrainingError};

const HANDSHAKE_MAGIC: &[u8; 4] = b"TRNG";
const MAX_FRAME_BYTES: u64 = 1 << 34;

const OP_BARRIER: u8 = 0;
const OP_ALL_REDUCE: u8 = 1;
const OP_BROADCAST: u8 = 2;

const PAYLOAD_EMPTY: u8 = 0;
const PAYLOAD_F32: u8 = 1;
const PAYLOAD_F64: u8 = 2;
const PAYLOAD_BYTES: u8 = 3;

/// One rank of a multi-process group joined over TCP. Rank 0 listens on
/// `master_addr:master_port` and every other rank holds a single connection
/// to it.
pub struct TcpContext {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    sequence: AtomicU64,
    links: Vec<TcpStream>,
}

impl TcpContext {
    pub fn connect(config: &DistributedConfig) -> Result<Self, TrainingError> {
        let timeout = timeout(config);
        let addr = resolve(&config.master_addr, config.master_port)?;
        if config.rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|err| {
                TrainingError::collective("connect", 0, format!("cannot listen on {addr}: {err}"))
            })?;
            info!(%addr, world_size = config.world_size, "waiting for ranks to join");
            Self::accept_members(listener, config.world_size, timeout)
        } else {
            Self::join(addr, config.rank, config.world_size, timeout)
        }
    }

    /// Accepts `world_size - 1` members on an already bound listener.
    pub(crate) fn accept_members(
        listener: TcpListener,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, TrainingError> {
        let deadline = Instant::now() + timeout;
        listener
            .set_nonblocking(true)
            .map_err(|err| connect_error(0, err))?;

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < slots.len() {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    stream
                        .set_nonblocking(false)
                        .map_err(|err| connect_error(0, err))?;
                    configure(&stream, timeout).map_err(|err| connect_error(0, err))?;
                    let peer = match read_handshake(&stream, world_size) {
                        Ok(peer) if slots[peer - 1].is_none() => peer,
                        Ok(peer) => {
                            reject(&stream);
                            return Err(TrainingError::collective(
                                "connect",
                                0,
                                format!("rank {peer} joined twice"),
                            ));
                        }
                        Err(reason) => {
                            reject(&stream);
                            return Err(TrainingError::collective("connect", 0, reason));
                        }
                    };
                    write_all(&stream, &[1]).map_err(|err| connect_error(0, err))?;
                    debug!(peer, %peer_addr, "rank joined");
                    slots[peer - 1] = Some(stream);
                    joined += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TrainingError::collective(
                            "connect",
                            0,
                            format!(
                                "only {joined} of {} ranks joined within {timeout:?}",
                                slots.len()
                            ),
                        ));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(connect_error(0, err)),
            }
        }

        Ok(Self {
            rank: 0,
            world_size,
            timeout,
            sequence: AtomicU64::new(0),
            links: slots.into_iter().flatten().collect(),
        })
    }

    /// Connects to rank 0 at `addr`, retrying until `timeout` elapses.
    pub(crate) fn join(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, TrainingError> {
        let deadline = Instant::now() + timeout;
        let stream = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TrainingError::collective(
                    "connect",
                    rank,
                    format!("rank 0 at {addr} unreachable within {timeout:?}"),
                ));
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => break stream,
                Err(err) => {
                    debug!(%addr, error = %err, "rank 0 not reachable yet");
                    thread::sleep(Duration::from_millis(100).min(remaining));
                }
            }
        };
        configure(&stream, timeout).map_err(|err| connect_error(rank, err))?;

        let mut hello = BytesMut::with_capacity(12);
        hello.put_slice(HANDSHAKE_MAGIC);
        hello.put_u32_le(rank as u32);
        hello.put_u32_le(world_size as u32);
        write_all(&stream, &hello).map_err(|err| connect_error(rank, err))?;

        let mut ack = [0u8; 1];
        read_exact(&stream, &mut ack).map_err(|err| connect_error(rank, err))?;
        if ack[0] != 1 {
            return Err(TrainingError::collective(
                "connect",
                rank,
                "rank 0 rejected the handshake",
            ));
        }
        info!(rank, world_size, %addr, "joined process group");

        Ok(Self {
            rank,
            world_size,
            timeout,
            sequence: AtomicU64::new(0),
            links: vec![stream],
        })
    }

    fn link(&self, peer: usize, op: Collective) -> Result<&TcpStream, TrainingError> {
        let index = if self.rank == 0 {
            peer.checked_sub(1)
        } else if peer == 0 {
            Some(0)
        } else {
            None
        };
        index
            .and_then(|index| self.links.get(index))
            .ok_or_else(|| {
                TrainingError::collective(op.name(), self.rank, format!("no link to rank {peer}"))
            })
    }

    fn io_error(&self, op: Collective, peer: usize, err: io::Error) -> TrainingError {
        let detail = match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                format!("timed out after {:?} talking to rank {peer}", self.timeout)
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => format!("rank {peer} left the group"),
            _ => format!("link to rank {peer} failed: {err}"),
        };
        TrainingError::collective(op.name(), self.rank, detail)
    }

    fn send_frame(&self, peer: usize, op: Collective, body: &[u8]) -> Result<(), TrainingError> {
        let stream = self.link(peer, op)?;
        let mut frame = BytesMut::with_capacity(body.len() + 8);
        frame.put_u64_le(body.len() as u64);
        frame.put_slice(body);
        write_all(stream, &frame).map_err(|err| self.io_error(op, peer, err))
    }

    fn recv_frame(&self, peer: usize, op: Collective) -> Result<Vec<u8>, TrainingError> {
        let stream = self.link(peer, op)?;
        let mut header = [0u8; 8];
        read_exact(stream, &mut header).map_err(|err| self.io_error(op, peer, err))?;
        let len = u64::from_le_bytes(header);
        if len > MAX_FRAME_BYTES {
            return Err(TrainingError::collective(
                op.name(),
                self.rank,
                format!("rank {peer} sent an oversized frame of {len} bytes"),
            ));
        }
        let mut body = vec![0u8; len as usize];
        read_exact(stream, &mut body).map_err(|err| self.io_error(op, peer, err))?;
        Ok(body)
    }

    fn malformed(&self, op: Collective, peer: usize, what: &str) -> TrainingError {
        TrainingError::collective(
            op.name(),
            self.rank,
            format!("malformed {what} frame from rank {peer}"),
        )
    }
}

impl StarTransport for TcpContext {
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
        let mut body = BytesMut::new();
        body.put_u64_le(envelope.seq);
        body.put_u32_le(envelope.rank as u32);
        encode_op(&mut body, envelope.op);
        encode_payload(&mut body, &envelope.payload);
        self.send_frame(0, envelope.op, &body)
    }

    fn recv_from_root(&self, op: Collective) -> Result<Payload, TrainingError> {
        let body = self.recv_frame(0, op)?;
        let mut cursor = body.as_slice();
        decode_payload(&mut cursor).ok_or_else(|| self.malformed(op, 0, "result"))
    }

    fn recv_from_peer(&self, peer: usize, op: Collective) -> Result<Envelope, TrainingError> {
        let body = self.recv_frame(peer, op)?;
        let mut cursor = body.as_slice();
        decode_envelope(&mut cursor).ok_or_else(|| self.malformed(op, peer, "contribution"))
    }

    fn send_to_peer(
        &self,
        peer: usize,
        op: Collective,
        payload: Payload,
    ) -> Result<(), TrainingError> {
        let mut body = BytesMut::new();
        encode_payload(&mut body, &payload);
        self.send_frame(peer, op, &body)
    }
}

impl DistributedContext for TcpContext {
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
        format!("tcp[{}]", self.world_size)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TrainingError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|err| TrainingError::configuration(format!("cannot resolve {host}:{port}: {err}")))?
        .next()
        .ok_or_else(|| TrainingError::configuration(format!("{host}:{port} has no addresses")))
}

fn configure(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))
}

fn connect_error(rank: usize, err: io::Error) -> TrainingError {
    TrainingError::collective("connect", rank, err.to_string())
}

fn write_all(mut stream: &TcpStream, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes)?;
    stream.flush()
}

fn read_exact(mut stream: &TcpStream, buf: &mut [u8]) -> io::Result<()> {
    stream.read_exact(buf)
}

fn reject(stream: &TcpStream) {
    if let Err(err) = write_all(stream, &[0]) {
        debug!(error = %err, "could not notify rejected peer");
    }
}

fn read_handshake(stream: &TcpStream, world_size: usize) -> Result<usize, String> {
    let mut hello = [0u8; 12];
    read_exact(stream, &mut hello).map_err(|err| format!("handshake failed: {err}"))?;
    let mut cursor = &hello[..];
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if &magic != HANDSHAKE_MAGIC {
        return Err("peer is not a training rank".to_string());
    }
    let rank = cursor.get_u32_le() as usize;
    let claimed_world = cursor.get_u32_le() as usize;
    if claimed_world != world_size {
        return Err(format!(
            "rank {rank} expects world size {claimed_world}, rank 0 has {world_size}"
        ));
    }
    if rank == 0 || rank >= world_size {
        return Err(format!("rank {rank} is outside 1..{world_size}"));
    }
    Ok(rank)
}

fn encode_op(buf: &mut BytesMut, op: Collective) {
    match op {
        Collective::Barrier => {
            buf.put_u8(OP_BARRIER);
            buf.put_u64_le(0);
        }
        Collective::AllReduce(reduce) => {
            buf.put_u8(OP_ALL_REDUCE);
            buf.put_u64_le(u64::from(reduce.code()));
        }
        Collective::Broadcast { src } => {
            buf.put_u8(OP_BROADCAST);
            buf.put_u64_le(src as u64);
        }
    }
}

fn decode_op(buf: &mut &[u8]) -> Option<Collective> {
    if buf.remaining() < 9 {
        return None;
    }
    let tag = buf.get_u8();
    let arg = buf.get_u64_le();
    match tag {
        OP_BARRIER => Some(Collective::Barrier),
        OP_ALL_REDUCE => u8::try_from(arg)
            .ok()
            .and_then(ReduceOp::from_code)
            .map(Collective::AllReduce),
        OP_BROADCAST => Some(Collective::Broadcast { src: arg as usize }),
        _ => None,
    }
}

fn encode_payload(buf: &mut BytesMut, payload: &Payload) {
    match payload {
        Payload::Empty => {
            buf.put_u8(PAYLOAD_EMPTY);
            buf.put_u64_le(0);
        }
        Payload::F32(values) => {
            buf.put_u8(PAYLOAD_F32);
            buf.put_u64_le(values.len() as u64);
            values.iter().for_each(|value| buf.put_f32_le(*value));
        }
        Payload::F64(values) => {
            buf.put_u8(PAYLOAD_F64);
            buf.put_u64_le(values.len() as u64);
            values.iter().for_each(|value| buf.put_f64_le(*value));
        }
        Payload::Bytes(bytes) => {
            buf.put_u8(PAYLOAD_BYTES);
            buf.put_u64_le(bytes.len() as u64);
            buf.put_slice(bytes);
        }
    }
}

fn decode_payload(buf: &mut &[u8]) -> Option<Payload> {
    if buf.remaining() < 9 {
        return None;
    }
    let tag = buf.get_u8();
    let len = usize::try_from(buf.get_u64_le()).ok()?;
    let width = match tag {
        PAYLOAD_EMPTY | PAYLOAD_BYTES => 1,
        PAYLOAD_F32 => 4,
        PAYLOAD_F64 => 8,
        _ => return None,
    };
    if buf.remaining() != len.checked_mul(width)? {
        return None;
    }
    let payload = match tag {
        PAYLOAD_EMPTY if len == 0 => Payload::Empty,
        PAYLOAD_F32 => Payload::F32((0..len).map(|_| buf.get_f32_le()).collect()),
        PAYLOAD_F64 => Payload::F64((0..len).map(|_| buf.get_f64_le()).collect()),
        PAYLOAD_BYTES => Payload::Bytes(buf.copy_to_bytes(len).to_vec()),
        _ => return None,
    };
    Some(payload)
}

fn decode_envelope(buf: &mut &[u8]) -> Option<Envelope> {
    if buf.remaining() < 12 {
        return None;
    }
    let seq = buf.get_u64_le();
    let rank = buf.get_u32_le() as usize;
    let op = decode_op(buf)?;
    let payload = decode_payload(buf)?;
    Some(Envelope {
        seq,
        rank,
        op,
        payload,
    })
}
