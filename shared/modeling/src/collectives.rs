//! Collective operations used by sequence-parallel inference.
//!
//! Every operation short-circuits to an identity pass-through when there is no group or
//! the group has a single rank; the group is never consulted in that case.

use crate::parallelism::{CommError, Group};

use std::{
    collections::HashMap,
    slice,
    sync::{Mutex, MutexGuard},
};
use tch::{Device, Kind, Tensor};
use tracing::trace;

/// Receive buffers reused across collective calls, keyed by shape, dtype, device and slot.
#[derive(Debug, Default)]
pub struct CommunicationBuffer {
    buffers: HashMap<(Vec<i64>, Kind, Device, usize), Tensor>,
}

impl CommunicationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `count` distinct buffers of the requested layout, allocating on first use.
    pub fn get_buffers(
        &mut self,
        shape: &[i64],
        kind: Kind,
        device: Device,
        count: usize,
    ) -> Vec<Tensor> {
        (0..count)
            .map(|slot| {
                self.buffers
                    .entry((shape.to_vec(), kind, device, slot))
                    .or_insert_with(|| Tensor::empty(shape, (kind, device)))
                    .shallow_clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

fn normalize_dim(dim: i64, ndim: usize) -> Result<i64, CommError> {
    let ndim_i = ndim as i64;
    let normalized = if dim < 0 { dim + ndim_i } else { dim };
    match (0..ndim_i).contains(&normalized) {
        true => Ok(normalized),
        false => Err(CommError::InvalidDim { dim, ndim }),
    }
}

/// Collective primitives scoped to one process group.
#[derive(Debug)]
pub struct CollectiveTransport {
    group: Option<Group>,
    buffers: Mutex<CommunicationBuffer>,
}

impl CollectiveTransport {
    pub fn new(group: Option<Group>) -> Self {
        Self {
            group,
            buffers: Mutex::new(CommunicationBuffer::new()),
        }
    }

    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    pub fn world_size(&self) -> usize {
        self.group.as_ref().map(|g| g.size()).unwrap_or(1)
    }

    pub fn rank(&self) -> usize {
        self.group.as_ref().map(|g| g.rank()).unwrap_or(0)
    }

    /// Number of receive buffers currently pooled.
    pub fn pooled_buffers(&self) -> usize {
        self.buffers().map(|b| b.len()).unwrap_or(0)
    }

    pub fn clear_buffers(&self) -> Result<(), CommError> {
        self.buffers()?.clear();
        Ok(())
    }

    fn buffers(&self) -> Result<MutexGuard<'_, CommunicationBuffer>, CommError> {
        self.buffers.lock().map_err(|_| CommError::Poisoned)
    }

    /// The group, only if it spans more than one rank.
    fn multi_rank_group(&self) -> Option<&Group> {
        self.group.as_ref().filter(|g| g.size() > 1)
    }

    fn scatter_gather_dims(
        tensor: &Tensor,
        scatter_dim: i64,
        gather_dim: i64,
        world_size: usize,
    ) -> Result<(i64, i64), CommError> {
        let scatter = normalize_dim(scatter_dim, tensor.dim())?;
        let gather = normalize_dim(gather_dim, tensor.dim())?;
        if tensor.size()[scatter as usize] % world_size as i64 != 0 {
            return Err(CommError::Shape {
                shape: tensor.size(),
                dim: scatter_dim,
                world_size,
            });
        }
        Ok((scatter, gather))
    }

    fn exchange_chunks(
        &self,
        group: &Group,
        input: &Tensor,
        scatter: i64,
        gather: i64,
    ) -> Result<Tensor, CommError> {
        let world_size = group.size();
        let chunk = input.size()[scatter as usize] / world_size as i64;
        let chunks: Vec<Tensor> = (0..world_size as i64)
            .map(|i| input.narrow(scatter, i * chunk, chunk).contiguous())
            .collect();
        let outputs = self.buffers()?.get_buffers(
            &chunks[0].size(),
            input.kind(),
            group.device(),
            world_size,
        );
        group.all_to_all(&outputs, &chunks)?;
        Ok(Tensor::cat(&outputs, gather).contiguous())
    }

    /// Splits each tensor along `scatter_dim` into one chunk per rank, sends chunk `i` to
    /// rank `i` and concatenates what comes back along `gather_dim`.
    ///
    /// Issues one all-to-all per tensor. Every tensor is validated before the first call,
    /// so a shape error never leaves the group half way through a batch.
    pub fn batched_all_to_all(
        &self,
        inputs: &[Tensor],
        scatter_dim: i64,
        gather_dim: i64,
    ) -> Result<Vec<Tensor>, CommError> {
        let Some(group) = self.multi_rank_group() else {
            return Ok(inputs.iter().map(Tensor::shallow_clone).collect());
        };
        let dims = inputs
            .iter()
            .map(|t| Self::scatter_gather_dims(t, scatter_dim, gather_dim, group.size()))
            .collect::<Result<Vec<_>, _>>()?;
        trace!(
            tensors = inputs.len(),
            scatter_dim,
            gather_dim,
            "batched all_to_all"
        );
        inputs
            .iter()
            .zip(dims)
            .map(|(input, (scatter, gather))| self.exchange_chunks(group, input, scatter, gather))
            .collect()
    }

    pub fn all_to_all(
        &self,
        input: &Tensor,
        scatter_dim: i64,
        gather_dim: i64,
    ) -> Result<Tensor, CommError> {
        let mut outputs =
            self.batched_all_to_all(slice::from_ref(input), scatter_dim, gather_dim)?;
        Ok(outputs.remove(0))
    }

    /// Gathers `input` from every rank and concatenates along `dim` in ascending rank
    /// order. Layout depends only on rank, never on arrival order.
    pub fn overlapped_all_gather(&self, input: &Tensor, dim: i64) -> Result<Tensor, CommError> {
        let Some(group) = self.multi_rank_group() else {
            return Ok(input.shallow_clone());
        };
        let dim = normalize_dim(dim, input.dim())?;
        let outputs = self.gather_buffers(group, input)?;
        Ok(Tensor::cat(&outputs, dim))
    }

    /// Same result as [`Self::overlapped_all_gather`], but the receive buffers are
    /// allocated for this call and freed with the result instead of being pooled.
    pub fn all_gather(&self, input: &Tensor, dim: i64) -> Result<Tensor, CommError> {
        let Some(group) = self.multi_rank_group() else {
            return Ok(input.shallow_clone());
        };
        let dim = normalize_dim(dim, input.dim())?;
        let input = input.contiguous();
        let outputs: Vec<Tensor> = (0..group.size())
            .map(|_| Tensor::empty(input.size(), (input.kind(), group.device())))
            .collect();
        group.all_gather(&outputs, &input)?;
        Ok(Tensor::cat(&outputs, dim))
    }

    fn gather_buffers(&self, group: &Group, input: &Tensor) -> Result<Vec<Tensor>, CommError> {
        let input = input.contiguous();
        let outputs =
            self.buffers()?
                .get_buffers(&input.size(), input.kind(), group.device(), group.size());
        group.all_gather(&outputs, &input)?;
        Ok(outputs)
    }

    /// Replicates `src`'s tensor to every rank. The result is always a fresh contiguous
    /// tensor; `input` is never written, on any rank.
    pub fn efficient_broadcast(&self, input: &Tensor, src: usize) -> Result<Tensor, CommError> {
        let Some(group) = self.multi_rank_group() else {
            return Ok(input.shallow_clone());
        };
        if src >= group.size() {
            return Err(CommError::InvalidRank {
                rank: src,
                world_size: group.size(),
            });
        }
        let mut tensor = Tensor::empty(input.size(), (input.kind(), input.device()));
        if group.rank() == src {
            let _guard = tch::no_grad_guard();
            tensor.copy_(input);
        }
        group.broadcast(&tensor, src)?;
        Ok(tensor)
    }

    /// Element-wise sum of `input` over all ranks, accumulated in rank order so every rank
    /// ends up with bit-identical results.
    pub fn all_reduce_sum(&self, input: &Tensor) -> Result<Tensor, CommError> {
        let Some(group) = self.multi_rank_group() else {
            return Ok(input.shallow_clone());
        };
        let gathered = self.gather_buffers(group, input)?;
        Ok(sum_in_order(input, &gathered))
    }

    /// Sums `input` over all ranks and keeps this rank's `1 / W` slice along `dim`.
    pub fn reduce_scatter_sum(&self, input: &Tensor, dim: i64) -> Result<Tensor, CommError> {
        let Some(group) = self.multi_rank_group() else {
            return Ok(input.shallow_clone());
        };
        let (scatter, _) = Self::scatter_gather_dims(input, dim, dim, group.size())?;
        let world_size = group.size();
        let chunk = input.size()[scatter as usize] / world_size as i64;
        let chunks: Vec<Tensor> = (0..world_size as i64)
            .map(|i| input.narrow(scatter, i * chunk, chunk).contiguous())
            .collect();
        let received = self.buffers()?.get_buffers(
            &chunks[0].size(),
            input.kind(),
            group.device(),
            world_size,
        );
        group.all_to_all(&received, &chunks)?;
        Ok(sum_in_order(&chunks[0], &received))
    }

    /// Forward all-to-all paired with its transpose, see [`AllToAll`].
    pub fn optimized_all_to_all(
        &self,
        input: &Tensor,
        scatter_dim: i64,
        gather_dim: i64,
    ) -> Result<(Tensor, AllToAll<'_>), CommError> {
        let op = AllToAll {
            transport: self,
            scatter_dim,
            gather_dim,
        };
        let output = op.forward(input)?;
        Ok((output, op))
    }
}

/// Folds `tensors` left to right; `like` only fixes the layout of the zero accumulator.
fn sum_in_order(like: &Tensor, tensors: &[Tensor]) -> Tensor {
    match tensors.split_first() {
        Some((first, rest)) => rest.iter().fold(first.copy(), |acc, t| acc + t),
        None => like.zeros_like(),
    }
}

/// An operation with an explicit transpose, for ops the tensor library cannot
/// differentiate through on its own.
pub trait DifferentiableOp {
    fn forward(&self, input: &Tensor) -> Result<Tensor, CommError>;

    /// Maps the gradient w.r.t. the output to the gradient w.r.t. the input.
    fn backward(&self, grad_output: &Tensor) -> Result<Tensor, CommError>;
}

/// All-to-all whose backward is the all-to-all with scatter and gather swapped.
/// `backward(forward(x)) == x` exactly, since both are pure permutations of data.
#[derive(Debug, Clone, Copy)]
pub struct AllToAll<'a> {
    transport: &'a CollectiveTransport,
    scatter_dim: i64,
    gather_dim: i64,
}

impl<'a> AllToAll<'a> {
    pub fn new(transport: &'a CollectiveTransport, scatter_dim: i64, gather_dim: i64) -> Self {
        Self {
            transport,
            scatter_dim,
            gather_dim,
        }
    }
}

impl DifferentiableOp for AllToAll<'_> {
    fn forward(&self, input: &Tensor) -> Result<Tensor, CommError> {
        self.transport
            .all_to_all(input, self.scatter_dim, self.gather_dim)
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Tensor, CommError> {
        self.transport
            .all_to_all(grad_output, self.gather_dim, self.scatter_dim)
    }
}

/// Records differentiable ops in forward order and replays their transposes in reverse.
#[derive(Default)]
pub struct BackwardTape<'a> {
    ops: Vec<Box<dyn DifferentiableOp + 'a>>,
}

impl<'a> BackwardTape<'a> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Runs `op` forward and records it.
    pub fn forward(
        &mut self,
        op: impl DifferentiableOp + 'a,
        input: &Tensor,
    ) -> Result<Tensor, CommError> {
        let output = op.forward(input)?;
        self.ops.push(Box::new(op));
        Ok(output)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Propagates `grad_output` back through every recorded op, consuming the tape.
    pub fn backward(self, grad_output: &Tensor) -> Result<Tensor, CommError> {
        self.ops
            .iter()
            .rev()
            .try_fold(grad_output.shallow_clone(), |grad, op| op.backward(&grad))
    }
}

/// Largest power-of-two sequence-parallel degree up to 8 that both fits in `num_gpus` and
/// divides `sequence_length`.
pub fn optimal_sp_size(num_gpus: usize, sequence_length: usize) -> usize {
    [8, 4, 2, 1]
        .into_iter()
        .find(|&size| num_gpus >= size && sequence_length % size == 0)
        .unwrap_or(1)
}

/// Issues a non-blocking copy to `device`. The computation that reads the result is the
/// synchronization point.
pub fn stage_to_device(tensor: &Tensor, device: Device) -> Tensor {
    match tensor.device() == device {
        true => tensor.shallow_clone(),
        false => tensor.to_device_(device, tensor.kind(), true, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallelism::{run_local_ranks, Group};
    use std::{thread, time::Duration};

    fn cpu_ranks(world_size: usize) -> Vec<Device> {
        vec![Device::Cpu; world_size]
    }

    /// A `[2, 8, 4]` tensor whose values encode the owning rank.
    fn rank_tensor(rank: usize) -> Tensor {
        Tensor::arange(64, (Kind::Float, Device::Cpu)).reshape([2, 8, 4]) + (rank as f64) * 1000.0
    }

    fn assert_identity(transport: &CollectiveTransport) -> Result<(), CommError> {
        let input = rank_tensor(0);
        // odd-length scatter axes are fine without peers
        let odd = Tensor::ones([3, 5], (Kind::Float, Device::Cpu));
        assert!(transport.batched_all_to_all(&[odd.shallow_clone()], 1, 0)?[0].equal(&odd));
        assert!(transport.overlapped_all_gather(&input, 0)?.equal(&input));
        assert!(transport.efficient_broadcast(&input, 7)?.equal(&input));
        assert!(transport.all_reduce_sum(&input)?.equal(&input));
        let (output, op) = transport.optimized_all_to_all(&input, 1, 2)?;
        assert!(output.equal(&input));
        assert!(op.backward(&output)?.equal(&input));
        assert_eq!(transport.pooled_buffers(), 0);
        Ok(())
    }

    #[test]
    fn test_single_rank_is_identity() -> anyhow::Result<()> {
        assert_identity(&CollectiveTransport::new(None))?;
        let results = run_local_ranks(&cpu_ranks(1), |group| {
            assert_identity(&CollectiveTransport::new(Some(group)))
        })?;
        for result in results {
            result?;
        }
        Ok(())
    }

    #[test]
    fn test_all_to_all_round_trip() {
        for world_size in [2, 4, 8] {
            let results = run_local_ranks(&cpu_ranks(world_size), |group| {
                let transport = CollectiveTransport::new(Some(group.clone()));
                let inputs = vec![rank_tensor(group.rank()), rank_tensor(group.rank()) * -1.0];
                let forward = transport.batched_all_to_all(&inputs, 1, 2).unwrap();
                let back = transport.batched_all_to_all(&forward, 2, 1).unwrap();
                (inputs, forward, back)
            })
            .unwrap();

            for (rank, (inputs, forward, back)) in results.iter().enumerate() {
                let chunk = 8 / world_size as i64;
                assert_eq!(forward[0].size(), vec![2, chunk, 4 * world_size as i64]);
                for (input, restored) in inputs.iter().zip(back) {
                    assert!(
                        input.equal(restored),
                        "round trip failed for rank {rank} with world size {world_size}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_all_to_all_places_peer_chunks_in_rank_order() {
        const WORLD_SIZE: usize = 2;
        let results = run_local_ranks(&cpu_ranks(WORLD_SIZE), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            transport.all_to_all(&rank_tensor(group.rank()), 1, 2).unwrap()
        })
        .unwrap();

        for (rank, output) in results.iter().enumerate() {
            for src in 0..WORLD_SIZE {
                let expected = rank_tensor(src).narrow(1, rank as i64 * 4, 4);
                let received = output.narrow(2, src as i64 * 4, 4);
                assert!(received.equal(&expected));
            }
        }
    }

    #[test]
    fn test_indivisible_scatter_axis_is_a_shape_error() {
        let results = run_local_ranks(&cpu_ranks(4), |group| {
            let transport = CollectiveTransport::new(Some(group));
            let good = Tensor::zeros([2, 8], (Kind::Float, Device::Cpu));
            let bad = Tensor::zeros([2, 6], (Kind::Float, Device::Cpu));
            transport.batched_all_to_all(&[good, bad], 1, 0)
        })
        .unwrap();
        for result in results {
            assert!(matches!(
                result,
                Err(CommError::Shape { world_size: 4, .. })
            ));
        }
    }

    #[test]
    fn test_all_gather_is_rank_ordered_regardless_of_arrival() {
        for world_size in [2, 4, 8] {
            let results = run_local_ranks(&cpu_ranks(world_size), |group: Group| {
                // higher ranks arrive first
                thread::sleep(Duration::from_millis(((world_size - group.rank()) * 3) as u64));
                let transport = CollectiveTransport::new(Some(group.clone()));
                transport
                    .overlapped_all_gather(&rank_tensor(group.rank()), 1)
                    .unwrap()
            })
            .unwrap();

            for output in &results {
                assert_eq!(output.size(), vec![2, 8 * world_size as i64, 4]);
                for src in 0..world_size {
                    assert!(output
                        .narrow(1, src as i64 * 8, 8)
                        .equal(&rank_tensor(src)));
                }
            }
        }
    }

    #[test]
    fn test_broadcast_coerces_non_contiguous_input() {
        let results = run_local_ranks(&cpu_ranks(4), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            let input = rank_tensor(group.rank()).transpose(1, 2);
            assert!(!input.is_contiguous());
            transport.efficient_broadcast(&input, 2).unwrap()
        })
        .unwrap();
        let expected = rank_tensor(2).transpose(1, 2);
        for output in results {
            assert!(output.is_contiguous());
            assert!(output.equal(&expected));
        }
    }

    #[test]
    fn test_broadcast_leaves_input_untouched() {
        let results = run_local_ranks(&cpu_ranks(2), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            let input = rank_tensor(group.rank());
            assert!(input.is_contiguous());
            let output = transport.efficient_broadcast(&input, 0).unwrap();
            (input, output)
        })
        .unwrap();
        for (rank, (input, output)) in results.iter().enumerate() {
            assert!(input.equal(&rank_tensor(rank)));
            assert!(output.equal(&rank_tensor(0)));
        }
    }

    #[test]
    fn test_broadcast_rejects_unknown_source() {
        let results = run_local_ranks(&cpu_ranks(2), |group| {
            CollectiveTransport::new(Some(group)).efficient_broadcast(&rank_tensor(0), 2)
        })
        .unwrap();
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(CommError::InvalidRank { rank: 2, .. }))));
    }

    #[test]
    fn test_backward_is_exact_transpose() {
        for world_size in [2, 4, 8] {
            let results = run_local_ranks(&cpu_ranks(world_size), |group| {
                let transport = CollectiveTransport::new(Some(group.clone()));
                let input = Tensor::randn([4, 8, 16], (Kind::Float, Device::Cpu));
                let (output, op) = transport.optimized_all_to_all(&input, -1, 1).unwrap();
                let grad_input = op.backward(&output).unwrap();
                (input, output, grad_input)
            })
            .unwrap();
            for (input, output, grad_input) in results {
                assert_eq!(
                    output.size(),
                    vec![4, 8 * world_size as i64, 16 / world_size as i64]
                );
                assert!(grad_input.equal(&input));
            }
        }
    }

    #[test]
    fn test_tape_replays_in_reverse() {
        let results = run_local_ranks(&cpu_ranks(2), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            let input = rank_tensor(group.rank());
            let mut tape = BackwardTape::new();
            let hidden = tape
                .forward(AllToAll::new(&transport, 1, 2), &input)
                .unwrap();
            let output = tape
                .forward(AllToAll::new(&transport, 0, 1), &hidden)
                .unwrap();
            assert_eq!(tape.len(), 2);
            (input, tape.backward(&output).unwrap())
        })
        .unwrap();
        for (input, grad) in results {
            assert!(grad.equal(&input));
        }
    }

    #[test]
    fn test_reductions() {
        let results = run_local_ranks(&cpu_ranks(4), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            let input = Tensor::arange(8, (Kind::Float, Device::Cpu)) + group.rank() as f64;
            let summed = transport.all_reduce_sum(&input).unwrap();
            let scattered = transport.reduce_scatter_sum(&input, 0).unwrap();
            (summed, scattered)
        })
        .unwrap();

        // sum over ranks of (i + r) = 4i + 6
        let expected = Tensor::arange(8, (Kind::Float, Device::Cpu)) * 4.0 + 6.0;
        for (rank, (summed, scattered)) in results.iter().enumerate() {
            assert!(summed.equal(&expected));
            assert!(scattered.equal(&expected.narrow(0, rank as i64 * 2, 2)));
        }
    }

    #[test]
    fn test_outputs_are_not_linked_to_peer_graphs() {
        let results = run_local_ranks(&cpu_ranks(2), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            let input = rank_tensor(group.rank()).set_requires_grad(true);
            let (output, op) = transport.optimized_all_to_all(&input, 1, 2).unwrap();
            let gathered = transport.all_gather(&input, 0).unwrap();
            let pooled = transport.overlapped_all_gather(&input, 0).unwrap();
            let grad = op.backward(&output).unwrap();
            (
                output.requires_grad(),
                gathered.requires_grad(),
                pooled.requires_grad(),
                grad.equal(&input.detach()),
            )
        })
        .unwrap();
        for flags in results {
            assert_eq!(flags, (false, false, false, true));
        }
    }

    #[test]
    fn test_unpooled_gather_matches_pooled() {
        let results = run_local_ranks(&cpu_ranks(4), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            let input = rank_tensor(group.rank());
            let fresh = transport.all_gather(&input, 1).unwrap();
            let fresh_pool = transport.pooled_buffers();
            let pooled = transport.overlapped_all_gather(&input, 1).unwrap();
            (fresh.equal(&pooled), fresh_pool, transport.pooled_buffers())
        })
        .unwrap();
        assert!(results.iter().all(|&r| r == (true, 0, 4)));
    }

    #[test]
    fn test_buffers_are_reused() {
        let results = run_local_ranks(&cpu_ranks(2), |group| {
            let transport = CollectiveTransport::new(Some(group.clone()));
            for _ in 0..3 {
                transport
                    .overlapped_all_gather(&rank_tensor(group.rank()), 0)
                    .unwrap();
            }
            transport.pooled_buffers()
        })
        .unwrap();
        assert_eq!(results, vec![2, 2]);
    }

    #[test]
    fn test_optimal_sp_size() {
        assert_eq!(optimal_sp_size(8, 1024), 8);
        assert_eq!(optimal_sp_size(4, 1024), 4);
        assert_eq!(optimal_sp_size(8, 12), 4);
        assert_eq!(optimal_sp_size(3, 10), 2);
        assert_eq!(optimal_sp_size(8, 7), 1);
        assert_eq!(optimal_sp_size(0, 16), 1);
    }

    #[test]
    fn test_stage_to_same_device_is_shallow() {
        let tensor = Tensor::ones([4], (Kind::Float, Device::Cpu));
        let staged = stage_to_device(&tensor, Device::Cpu);
        assert_eq!(staged.data_ptr(), tensor.data_ptr());
    }
}
