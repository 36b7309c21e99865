use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Barrier, Mutex, MutexGuard,
    },
    thread,
};
use tch::{Device, Tensor};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("tensor of shape {shape:?} cannot be split into {world_size} equal chunks along dim {dim}")]
    Shape {
        shape: Vec<i64>,
        dim: i64,
        world_size: usize,
    },

    #[error("dim {dim} is out of range for a tensor with {ndim} dims")]
    InvalidDim { dim: i64, ndim: usize },

    #[error("rank {rank} is not a member of a group of size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("expected {expected} tensors for the collective, got {actual}")]
    TensorCount { expected: usize, actual: usize },

    #[error("rank {peer} sent a tensor of shape {sent:?}, receive buffer has shape {expected:?}")]
    Mismatch {
        peer: usize,
        sent: Vec<i64>,
        expected: Vec<i64>,
    },

    #[error("world size {world_size} is not divisible by shard group size {shard_size}")]
    InvalidTopology { world_size: usize, shard_size: usize },

    #[error("collective state poisoned by a panicking rank")]
    Poisoned,

    #[error("rank {0} panicked")]
    RankPanicked(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(0);

/// An ordered set of ranks that participate in collective operations together.
///
/// Every collective is a barrier: all members must enter the same call, in the same
/// order, before any of them returns. A rank that never enters blocks the others.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    fn id(&self) -> GroupId;
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Device that receive buffers for this rank live on.
    fn device(&self) -> Device;

    /// `inputs[i]` goes to rank `i`; `outputs[i]` is overwritten with what rank `i` sent here.
    fn all_to_all(&self, outputs: &[Tensor], inputs: &[Tensor]) -> Result<(), CommError>;

    /// `outputs[i]` is overwritten with rank `i`'s `input`.
    fn all_gather(&self, outputs: &[Tensor], input: &Tensor) -> Result<(), CommError>;

    /// Overwrites `tensor` on every rank with the contents of `tensor` on `src`.
    fn broadcast(&self, tensor: &Tensor, src: usize) -> Result<(), CommError>;

    fn barrier(&self) -> Result<(), CommError>;
}

pub type Group = Arc<dyn ProcessGroup>;

/// Rendezvous shared by the ranks of one in-process group.
///
/// Each rank owns one slot. A collective deposits into the caller's slot, waits for every
/// rank, copies what it needs out of the peers' slots, waits again, then clears its slot.
#[derive(Debug)]
pub struct LocalStore {
    id: GroupId,
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<Tensor>>>>,
}

impl LocalStore {
    /// A store for `world_size` ranks. Zero is accepted but no rank can ever join it.
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id: GroupId(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed)),
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn slots(&self) -> Result<MutexGuard<'_, Vec<Option<Vec<Tensor>>>>, CommError> {
        self.slots.lock().map_err(|_| CommError::Poisoned)
    }

    fn snapshot(&self) -> Result<Vec<Vec<Tensor>>, CommError> {
        let slots = self.slots()?;
        Ok(slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|tensors| tensors.iter().map(Tensor::shallow_clone).collect())
                    .unwrap_or_default()
            })
            .collect())
    }

    fn exchange<R>(
        &self,
        rank: usize,
        deposit: Vec<Tensor>,
        consume: impl FnOnce(Vec<Vec<Tensor>>) -> Result<R, CommError>,
    ) -> Result<R, CommError> {
        // both barriers are entered even on error, or the peers would wait forever
        let deposited = self.slots().map(|mut slots| slots[rank] = Some(deposit));
        self.barrier.wait();
        // peers' deposits stay readable until everyone passes the second barrier
        let result = deposited.and_then(|()| self.snapshot()).and_then(consume);
        self.barrier.wait();
        if let Ok(mut slots) = self.slots() {
            slots[rank] = None;
        }
        result
    }
}

/// One rank's handle onto a [`LocalStore`]. Ranks are threads of the same process.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    store: Arc<LocalStore>,
    rank: usize,
    device: Device,
}

impl LocalGroup {
    pub fn new(store: Arc<LocalStore>, rank: usize, device: Device) -> Result<Self, CommError> {
        if rank >= store.world_size() {
            return Err(CommError::InvalidRank {
                rank,
                world_size: store.world_size(),
            });
        }
        Ok(Self {
            store,
            rank,
            device,
        })
    }

    fn check_count(&self, actual: usize) -> Result<(), CommError> {
        match actual == self.size() {
            true => Ok(()),
            false => Err(CommError::TensorCount {
                expected: self.size(),
                actual,
            }),
        }
    }
}

fn receive_into(output: &Tensor, sent: Option<&Tensor>, peer: usize) -> Result<(), CommError> {
    let sent = sent.ok_or(CommError::TensorCount {
        expected: 1,
        actual: 0,
    })?;
    if sent.size() != output.size() {
        return Err(CommError::Mismatch {
            peer,
            sent: sent.size(),
            expected: output.size(),
        });
    }
    // shares storage with the caller's buffer; never records a graph edge into the peer
    let _guard = tch::no_grad_guard();
    output.shallow_clone().copy_(sent);
    Ok(())
}

impl ProcessGroup for LocalGroup {
    fn id(&self) -> GroupId {
        self.store.id()
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.store.world_size()
    }

    fn device(&self) -> Device {
        self.device
    }

    fn all_to_all(&self, outputs: &[Tensor], inputs: &[Tensor]) -> Result<(), CommError> {
        self.check_count(inputs.len())?;
        self.check_count(outputs.len())?;
        trace!(group = %self.id(), rank = self.rank, "all_to_all");
        let deposit = inputs.iter().map(Tensor::detach).collect();
        self.store.exchange(self.rank, deposit, |slots| {
            for (peer, (sent, output)) in slots.iter().zip(outputs).enumerate() {
                receive_into(output, sent.get(self.rank), peer)?;
            }
            Ok(())
        })
    }

    fn all_gather(&self, outputs: &[Tensor], input: &Tensor) -> Result<(), CommError> {
        self.check_count(outputs.len())?;
        trace!(group = %self.id(), rank = self.rank, "all_gather");
        self.store
            .exchange(self.rank, vec![input.detach()], |slots| {
                for (peer, (sent, output)) in slots.iter().zip(outputs).enumerate() {
                    receive_into(output, sent.first(), peer)?;
                }
                Ok(())
            })
    }

    fn broadcast(&self, tensor: &Tensor, src: usize) -> Result<(), CommError> {
        if src >= self.size() {
            return Err(CommError::InvalidRank {
                rank: src,
                world_size: self.size(),
            });
        }
        trace!(group = %self.id(), rank = self.rank, src, "broadcast");
        let deposit = match self.rank == src {
            true => vec![tensor.detach()],
            false => Vec::new(),
        };
        self.store.exchange(self.rank, deposit, |slots| {
            if self.rank != src {
                receive_into(tensor, slots[src].first(), src)?;
            }
            Ok(())
        })
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.store.exchange(self.rank, Vec::new(), |_| Ok(()))
    }
}

/// Shard and replicate sub-groups for hybrid sharding.
///
/// Ranks `[k * shard_size, (k + 1) * shard_size)` form shard group `k`; ranks with the same
/// position inside their shard group form a replicate group.
#[derive(Debug, Clone)]
pub struct HybridTopology {
    shard_size: usize,
    shard_stores: Vec<Arc<LocalStore>>,
    replicate_stores: Vec<Arc<LocalStore>>,
}

impl HybridTopology {
    pub fn new(world_size: usize, shard_size: usize) -> Result<Self, CommError> {
        if world_size == 0 || shard_size == 0 || world_size % shard_size != 0 {
            return Err(CommError::InvalidTopology {
                world_size,
                shard_size,
            });
        }
        let replicas = world_size / shard_size;
        Ok(Self {
            shard_size,
            shard_stores: (0..replicas).map(|_| LocalStore::new(shard_size)).collect(),
            replicate_stores: (0..shard_size).map(|_| LocalStore::new(replicas)).collect(),
        })
    }

    pub fn world_size(&self) -> usize {
        self.shard_size * self.shard_stores.len()
    }

    /// Returns `(shard_group, replicate_group)` for a global rank.
    pub fn groups(&self, rank: usize, device: Device) -> Result<(Group, Group), CommError> {
        if rank >= self.world_size() {
            return Err(CommError::InvalidRank {
                rank,
                world_size: self.world_size(),
            });
        }
        let shard: Group = Arc::new(LocalGroup::new(
            self.shard_stores[rank / self.shard_size].clone(),
            rank % self.shard_size,
            device,
        )?);
        let replicate: Group = Arc::new(LocalGroup::new(
            self.replicate_stores[rank % self.shard_size].clone(),
            rank / self.shard_size,
            device,
        )?);
        Ok((shard, replicate))
    }
}

/// Runs `f` once per rank, each on its own thread with its own group handle, and returns
/// the results in rank order. The world size is `devices.len()`.
pub fn run_local_ranks<F, R>(devices: &[Device], f: F) -> Result<Vec<R>, CommError>
where
    F: Fn(Group) -> R + Sync,
    R: Send,
{
    let store = LocalStore::new(devices.len());
    let groups = devices
        .iter()
        .enumerate()
        .map(|(rank, device)| LocalGroup::new(store.clone(), rank, *device))
        .collect::<Result<Vec<_>, _>>()?;

    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| scope.spawn(move || f(Arc::new(group))))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| handle.join().map_err(|_| CommError::RankPanicked(rank)))
            .collect()
    })
}
