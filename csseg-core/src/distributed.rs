//! Process groups and data-parallel gradient synchronization.
//!
//! Every collective is built on [`ProcessGroup::all_gather`]: each rank
//! contributes one [`Frame`] and receives every rank's frame in rank order.
//! Reductions then sum contributions in rank order locally, so every rank
//! computes a bit-identical result.

use std::fmt;
use std::ops::AddAssign;
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info};

use crate::error::DistributedError;
use crate::model::{Segmentor, SegmentorCache, SegmentorOutput};
use crate::tensor::{FeatureMap, Gradients};

// ── Frames ────────────────────────────────────────────────────────────

/// One rank's contribution to a collective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    /// First message a peer sends after connecting to rank 0.
    Hello { rank: usize },
    Barrier,
    /// IEEE-754 bit patterns, so every rank decodes identical values.
    F32(Vec<u32>),
    U64(Vec<u64>),
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Hello { rank } => write!(f, "hello from rank {rank}"),
            Frame::Barrier => f.write_str("barrier"),
            Frame::F32(values) => write!(f, "{} f32 values", values.len()),
            Frame::U64(values) => write!(f, "{} u64 values", values.len()),
        }
    }
}

/// Element types that can be summed across ranks.
pub trait Reducible: Copy + Default + AddAssign {
    fn to_frame(buf: &[Self]) -> Frame;
    fn from_frame(frame: &Frame) -> Option<Vec<Self>>;
}

impl Reducible for f32 {
    fn to_frame(buf: &[Self]) -> Frame {
        Frame::F32(buf.iter().map(|v| v.to_bits()).collect())
    }

    fn from_frame(frame: &Frame) -> Option<Vec<Self>> {
        match frame {
            Frame::F32(bits) => Some(bits.iter().copied().map(f32::from_bits).collect()),
            _ => None,
        }
    }
}

impl Reducible for u64 {
    fn to_frame(buf: &[Self]) -> Frame {
        Frame::U64(buf.to_vec())
    }

    fn from_frame(frame: &Frame) -> Option<Vec<Self>> {
        match frame {
            Frame::U64(values) => Some(values.clone()),
            _ => None,
        }
    }
}

/// Sum gathered frames into `buf`, in rank order.
fn reduce_into<T: Reducible>(frames: &[Frame], buf: &mut [T]) -> Result<(), DistributedError> {
    let mut acc = vec![T::default(); buf.len()];
    for (rank, frame) in frames.iter().enumerate() {
        let values = T::from_frame(frame)
            .filter(|values| values.len() == buf.len())
            .ok_or_else(|| DistributedError::Collective {
                message: format!(
                    "rank {rank} contributed {frame}, expected {} {} values",
                    buf.len(),
                    std::any::type_name::<T>()
                ),
            })?;
        for (a, v) in acc.iter_mut().zip(values) {
            *a += v;
        }
    }
    buf.copy_from_slice(&acc);
    Ok(())
}

// ── ProcessGroup trait ────────────────────────────────────────────────

/// Collective communication between the ranks of one training job.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Every rank's frame, indexed by rank. Blocks until all ranks contribute.
    fn all_gather(&self, frame: Frame) -> Result<Vec<Frame>, DistributedError>;

    /// In-place element-wise sum across ranks.
    fn allreduce_sum_f32(&self, buf: &mut [f32]) -> Result<(), DistributedError> {
        let frames = self.all_gather(f32::to_frame(buf))?;
        reduce_into(&frames, buf)
    }

    /// In-place element-wise sum across ranks. Exact.
    fn allreduce_sum_u64(&self, buf: &mut [u64]) -> Result<(), DistributedError> {
        let frames = self.all_gather(u64::to_frame(buf))?;
        reduce_into(&frames, buf)
    }

    fn barrier(&self) -> Result<(), DistributedError> {
        self.all_gather(Frame::Barrier).map(|_| ())
    }
}

// ── SingleProcessGroup ────────────────────────────────────────────────

/// A world of one. Every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcessGroup;

impl ProcessGroup for SingleProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, frame: Frame) -> Result<Vec<Frame>, DistributedError> {
        Ok(vec![frame])
    }
}

// ── ThreadGroup ───────────────────────────────────────────────────────

struct SharedSlots {
    slots: Mutex<Vec<Option<Frame>>>,
    barrier: Barrier,
}

/// In-process group: one handle per rank, each driven by its own thread.
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedSlots>,
}

impl ThreadGroup {
    /// Create the handles of an `n`-rank group, indexed by rank.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedSlots {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, frame: Frame) -> Result<Vec<Frame>, DistributedError> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[self.rank] = Some(frame);
        self.shared.barrier.wait();
        let gathered = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone().ok_or_else(|| DistributedError::Collective {
                    message: format!("rank {rank} did not contribute"),
                })
            })
            .collect::<Result<Vec<_>, _>>();
        // Nobody may overwrite a slot until every rank has read all of them.
        self.shared.barrier.wait();
        gathered
    }
}

// ── TcpProcessGroup ───────────────────────────────────────────────────

type Link = Framed<TcpStream, LengthDelimitedCodec>;

fn link(stream: TcpStream, max_frame_bytes: usize) -> Link {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec();
    Framed::new(stream, codec)
}

fn collective_error(context: &str, err: impl fmt::Display) -> DistributedError {
    DistributedError::Collective {
        message: format!("{context}: {err}"),
    }
}

async fn send_frame(link: &mut Link, frame: &Frame, peer: &str) -> Result<(), DistributedError> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| collective_error(&format!("cannot encode {frame} for {peer}"), e))?;
    link.send(Bytes::from(body))
        .await
        .map_err(|e| collective_error(&format!("send to {peer}"), e))
}

async fn recv_frame(link: &mut Link, peer: &str) -> Result<Frame, DistributedError> {
    let body = link
        .next()
        .await
        .ok_or_else(|| DistributedError::Collective {
            message: format!("{peer} closed the connection"),
        })?
        .map_err(|e| collective_error(&format!("receive from {peer}"), e))?;
    serde_json::from_slice(&body)
        .map_err(|e| collective_error(&format!("undecodable frame from {peer}"), e))
}

enum Links {
    /// Rank 0 holds one link per peer, indexed by `rank - 1`.
    Root(Vec<Link>),
    Peer(Link),
}

/// Star topology through rank 0: peers send their frame to the root, the
/// root forwards the full set back to every peer.
///
/// Each rank drives its sockets on a private current-thread runtime, so the
/// group exposes the same blocking interface as the in-process groups.
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    // Declared before the runtime so the sockets are dropped first.
    links: Mutex<Links>,
    runtime: Runtime,
}

impl TcpProcessGroup {
    /// Form the group. Rank 0 listens on `init_method`; other ranks connect
    /// with bounded retries and announce their rank.
    pub fn connect(
        rank: usize,
        world_size: usize,
        init_method: &str,
        config: &ParallelConfig,
    ) -> Result<Self, DistributedError> {
        if rank >= world_size {
            return Err(DistributedError::Init {
                message: format!("rank {rank} is outside a world of {world_size}"),
            });
        }
        let address = init_method
            .strip_prefix("tcp://")
            .ok_or_else(|| DistributedError::Init {
                message: format!("init method '{init_method}' must look like tcp://host:port"),
            })?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| DistributedError::Init {
                message: format!("cannot start network runtime: {e}"),
            })?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let links = runtime.block_on(async {
            match tokio::time::timeout(timeout, rendezvous(rank, world_size, address, config)).await
            {
                Ok(links) => links,
                Err(_) => Err(DistributedError::Init {
                    message: format!(
                        "rendezvous at {address} timed out after {}s",
                        timeout.as_secs()
                    ),
                }),
            }
        })?;

        Ok(Self {
            rank,
            world_size,
            timeout,
            links: Mutex::new(links),
            runtime,
        })
    }
}

async fn rendezvous(
    rank: usize,
    world_size: usize,
    address: &str,
    config: &ParallelConfig,
) -> Result<Links, DistributedError> {
    let init_error = |context: &str, err: &dyn fmt::Display| DistributedError::Init {
        message: format!("{context} {address}: {err}"),
    };

    if rank == 0 {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| init_error("cannot listen on", &e))?;
        let mut peers: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| init_error("accept failed on", &e))?;
            let mut peer = link(stream, config.max_frame_bytes);
            let peer_rank = match recv_frame(&mut peer, "joining peer").await {
                Ok(Frame::Hello { rank }) if rank > 0 && rank < world_size => rank,
                Ok(other) => {
                    return Err(DistributedError::Init {
                        message: format!("peer opened with {other} in a world of {world_size}"),
                    });
                }
                Err(e) => return Err(init_error("handshake failed on", &e)),
            };
            if peers[peer_rank - 1].replace(peer).is_some() {
                return Err(DistributedError::Init {
                    message: format!("rank {peer_rank} joined twice"),
                });
            }
            debug!(peer_rank, "Peer joined");
        }
        Ok(Links::Root(peers.into_iter().flatten().collect()))
    } else {
        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(address).await {
                Ok(stream) => break stream,
                Err(e) if attempt < config.connect_retries => {
                    attempt += 1;
                    debug!(rank, attempt, error = %e, "Rendezvous not ready, retrying");
                    tokio::time::sleep(Duration::from_millis(config.retry_interval_ms)).await;
                }
                Err(e) => return Err(init_error("cannot reach rendezvous", &e)),
            }
        };
        let mut root = link(stream, config.max_frame_bytes);
        send_frame(&mut root, &Frame::Hello { rank }, "rank 0")
            .await
            .map_err(|e| init_error("handshake failed with", &e))?;
        Ok(Links::Peer(root))
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, frame: Frame) -> Result<Vec<Frame>, DistributedError> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        let world_size = self.world_size;
        let exchange = async {
            match &mut *links {
                Links::Root(peers) => {
                    let mut frames = Vec::with_capacity(world_size);
                    frames.push(frame);
                    for (i, peer) in peers.iter_mut().enumerate() {
                        let received = recv_frame(peer, &format!("rank {}", i + 1)).await?;
                        frames.push(received);
                    }
                    for (i, peer) in peers.iter_mut().enumerate() {
                        let name = format!("rank {}", i + 1);
                        for f in &frames {
                            send_frame(peer, f, &name).await?;
                        }
                    }
                    Ok::<_, DistributedError>(frames)
                }
                Links::Peer(root) => {
                    send_frame(root, &frame, "rank 0").await?;
                    let mut frames = Vec::with_capacity(world_size);
                    for _ in 0..world_size {
                        frames.push(recv_frame(root, "rank 0").await?);
                    }
                    Ok::<_, DistributedError>(frames)
                }
            }
        };
        let timeout = self.timeout;
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, exchange).await });
        match outcome {
            Ok(result) => result,
            Err(_) => Err(DistributedError::Collective {
                message: format!(
                    "rank {} timed out after {}s",
                    self.rank,
                    self.timeout.as_secs()
                ),
            }),
        }
    }
}

// ── Coordinator ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Single,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelConfig {
    pub backend: Backend,
    pub init_method: String,
    pub connect_retries: u32,
    pub retry_interval_ms: u64,
    /// Upper bound on rendezvous and on any single collective.
    pub timeout_secs: u64,
    /// Largest frame a rank accepts from or sends to a peer.
    pub max_frame_bytes: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Single,
            init_method: "tcp://127.0.0.1:29500".into(),
            connect_retries: 50,
            retry_interval_ms: 200,
            timeout_secs: 300,
            max_frame_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Owns the process group for the lifetime of a run.
#[derive(Clone)]
pub struct DistributedCoordinator {
    group: Arc<dyn ProcessGroup>,
}

impl DistributedCoordinator {
    pub fn init(
        config: &ParallelConfig,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, DistributedError> {
        let group: Arc<dyn ProcessGroup> = match config.backend {
            Backend::Single if world_size <= 1 && rank == 0 => Arc::new(SingleProcessGroup),
            Backend::Single => {
                return Err(DistributedError::Init {
                    message: format!(
                        "backend 'single' hosts exactly one process at rank 0, \
                         got rank {rank} of {world_size}"
                    ),
                });
            }
            Backend::Tcp => Arc::new(TcpProcessGroup::connect(
                rank,
                world_size,
                &config.init_method,
                config,
            )?),
        };
        info!(rank, world_size, backend = ?config.backend, "Process group initialized");
        Ok(Self { group })
    }

    pub fn from_group(group: Arc<dyn ProcessGroup>) -> Self {
        Self { group }
    }

    pub fn single() -> Self {
        Self::from_group(Arc::new(SingleProcessGroup))
    }

    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// Rank 0 owns checkpoint writes, best promotion and log output.
    pub fn is_leader(&self) -> bool {
        self.group.rank() == 0
    }

    pub fn barrier(&self) -> Result<(), DistributedError> {
        self.group.barrier()
    }

    pub fn wrap_for_gradient_sync(&self, model: Segmentor) -> DistributedModel {
        DistributedModel {
            module: model,
            group: self.group.clone(),
            sync_count: 0,
        }
    }
}

/// A model whose backward pass averages gradients over all ranks.
pub struct DistributedModel {
    module: Segmentor,
    group: Arc<dyn ProcessGroup>,
    sync_count: usize,
}

impl DistributedModel {
    pub fn module(&self) -> &Segmentor {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Segmentor {
        &mut self.module
    }

    pub fn into_inner(self) -> Segmentor {
        self.module
    }

    /// Number of gradient synchronizations performed so far.
    pub fn sync_count(&self) -> usize {
        self.sync_count
    }

    pub fn forward_train(
        &self,
        input: &FeatureMap,
        rng: &mut dyn RngCore,
    ) -> (SegmentorOutput, SegmentorCache) {
        self.module.forward_train(input, rng)
    }

    /// Local backward followed by exactly one all-reduce of every gradient.
    pub fn backward(
        &mut self,
        cache: &SegmentorCache,
        grad_logits: &FeatureMap,
        grad_distillation: Option<&[FeatureMap]>,
    ) -> Result<Gradients, DistributedError> {
        let mut grads = self.module.backward(cache, grad_logits, grad_distillation);
        let world_size = self.group.world_size();
        if world_size > 1 {
            let mut flat: Vec<f32> = grads.values().flat_map(|g| g.iter().copied()).collect();
            self.group.allreduce_sum_f32(&mut flat)?;
            let scale = 1.0 / world_size as f32;
            let mut values = flat.into_iter();
            for grad in grads.values_mut() {
                for (dst, src) in grad.iter_mut().zip(values.by_ref()) {
                    *dst = src * scale;
                }
            }
        }
        self.sync_count += 1;
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SegmentorConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::thread;

    fn run_ranks<T, F>(world: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(ThreadGroup) -> T + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = ThreadGroup::new_group(world)
            .into_iter()
            .map(|group| {
                let f = f.clone();
                thread::spawn(move || f(group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn tcp_config() -> ParallelConfig {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        ParallelConfig {
            backend: Backend::Tcp,
            init_method: format!("tcp://127.0.0.1:{port}"),
            retry_interval_ms: 20,
            timeout_secs: 30,
            ..ParallelConfig::default()
        }
    }

    #[test]
    fn test_single_group_is_identity() {
        let group = SingleProcessGroup;
        let mut buf = vec![1.5f32, -2.0];
        group.allreduce_sum_f32(&mut buf).unwrap();
        assert_eq!(buf, vec![1.5, -2.0]);
        group.barrier().unwrap();
        assert_eq!(group.world_size(), 1);
    }

    #[test]
    fn test_thread_group_allreduce() {
        let results = run_ranks(4, |group| {
            let rank = group.rank() as u64;
            let mut counts = vec![rank, 10 * rank, 1];
            group.allreduce_sum_u64(&mut counts).unwrap();
            let mut values = vec![group.rank() as f32 * 0.5];
            group.allreduce_sum_f32(&mut values).unwrap();
            group.barrier().unwrap();
            (counts, values)
        });
        for (counts, values) in results {
            assert_eq!(counts, vec![6, 60, 4]);
            assert_eq!(values, vec![3.0]);
        }
    }

    #[test]
    fn test_thread_group_repeated_collectives() {
        let results = run_ranks(3, |group| {
            let mut total = 0u64;
            for step in 0..50u64 {
                let mut buf = vec![step + group.rank() as u64];
                group.allreduce_sum_u64(&mut buf).unwrap();
                total += buf[0];
            }
            total
        });
        let expected: u64 = (0..50u64).map(|s| 3 * s + 3).sum();
        assert!(results.iter().all(|&t| t == expected));
    }

    #[test]
    fn test_thread_group_length_mismatch_fails_everywhere() {
        let results = run_ranks(2, |group| {
            let mut buf = vec![0u64; 1 + group.rank()];
            group.allreduce_sum_u64(&mut buf).is_err()
        });
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn test_reduce_rejects_wrong_element_type() {
        let frames = vec![f32::to_frame(&[1.0]), Frame::U64(vec![1])];
        let mut buf = vec![0.0f32];
        let err = reduce_into(&frames, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::Collective { ref message } if message.contains("rank 1")
        ));
    }

    #[test]
    fn test_frame_json_roundtrip() {
        let values = [0.1f32, -3.5e-8, f32::INFINITY];
        let frame = f32::to_frame(&values);
        let body = serde_json::to_vec(&frame).unwrap();
        let decoded = serde_json::from_slice::<Frame>(&body).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(f32::from_frame(&decoded).unwrap(), values.to_vec());
        assert!(u64::from_frame(&decoded).is_none());
        assert_eq!(Frame::Hello { rank: 2 }.to_string(), "hello from rank 2");
    }

    #[test]
    fn test_tcp_group_allreduce() {
        let config = tcp_config();
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let config = config.clone();
                thread::spawn(move || {
                    let coordinator = DistributedCoordinator::init(&config, rank, 3).unwrap();
                    let mut buf = vec![rank as f32 + 1.0, 2.0];
                    coordinator.group().allreduce_sum_f32(&mut buf).unwrap();
                    let mut counts = vec![rank as u64];
                    coordinator.group().allreduce_sum_u64(&mut counts).unwrap();
                    coordinator.barrier().unwrap();
                    (coordinator.is_leader(), buf, counts)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(leader, _, _)| *leader).count(), 1);
        for (_, buf, counts) in results {
            assert_eq!(buf, vec![6.0, 6.0]);
            assert_eq!(counts, vec![3]);
        }
    }

    #[test]
    fn test_tcp_root_rejects_frame_over_limit() {
        let root_config = ParallelConfig {
            max_frame_bytes: 64,
            ..tcp_config()
        };
        let peer_config = ParallelConfig {
            max_frame_bytes: 1 << 20,
            ..root_config.clone()
        };
        let init = root_config.init_method.clone();

        let root_init = init.clone();
        let root = thread::spawn(move || {
            let group = TcpProcessGroup::connect(0, 2, &root_init, &root_config).unwrap();
            let mut buf = vec![0.0f32; 256];
            group.allreduce_sum_f32(&mut buf)
        });
        let peer = thread::spawn(move || {
            let group = TcpProcessGroup::connect(1, 2, &init, &peer_config).unwrap();
            let mut buf = vec![1.0f32; 256];
            group.allreduce_sum_f32(&mut buf)
        });

        let root_result = root.join().unwrap();
        assert!(matches!(root_result, Err(DistributedError::Collective { .. })));
        // The root drops its sockets on failure, so the peer cannot hang.
        assert!(peer.join().unwrap().is_err());
    }

    #[test]
    fn test_tcp_rejects_bad_init_method() {
        let err = TcpProcessGroup::connect(0, 2, "127.0.0.1:1", &ParallelConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, DistributedError::Init { .. }));
    }

    #[test]
    fn test_single_backend_rejects_multiple_processes() {
        let result = DistributedCoordinator::init(&ParallelConfig::default(), 0, 2);
        assert!(matches!(result, Err(DistributedError::Init { .. })));
    }

    #[test]
    fn test_single_backend_rejects_nonzero_rank() {
        let result = DistributedCoordinator::init(&ParallelConfig::default(), 1, 1);
        assert!(matches!(result, Err(DistributedError::Init { .. })));

        let coordinator = DistributedCoordinator::init(&ParallelConfig::default(), 0, 1).unwrap();
        assert!(coordinator.is_leader());
    }

    #[test]
    fn test_gradient_sync_averages_once_per_backward() {
        let config = SegmentorConfig {
            in_channels: 2,
            feature_channels: 3,
            num_blocks: 1,
            ..SegmentorConfig::default()
        };
        let results = run_ranks(2, move |group| {
            let rank = group.rank();
            let coordinator = DistributedCoordinator::from_group(Arc::new(group));
            let model = Segmentor::new(config.clone(), &[2], &mut StdRng::seed_from_u64(1));
            let mut model = coordinator.wrap_for_gradient_sync(model);
            let input = FeatureMap::from_elem((1, 2, 2, 2), rank as f32 + 1.0);
            let mut rng = StdRng::seed_from_u64(rank as u64);
            let (out, cache) = model.forward_train(&input, &mut rng);
            let grads = model.backward(&cache, &out.logits, None).unwrap();
            (model.sync_count(), grads)
        });
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 1);
        assert_eq!(results[0].1, results[1].1);
    }
}
