use ovi_modeling::{
    run_local_ranks, ClipDuration, EnginePlan, FleetConfig, GenerationRequest, LoraManager,
    MixedPrecision, ModelGraph, Precision, ProcessGroup, Resolution, ResourcePlanner,
    ShardingPlanner, ShardingStrategy,
};
use std::collections::BTreeMap;
use tch::{Device, Kind, Tensor};

const FLEET: &str = r#"
[[devices]]
name = "RTX 4090"
total_gb = 24.0

[[devices]]
name = "RTX 4090"
total_gb = 24.0
"#;

/// Plans an FSDP placement, shards a model over the planned ranks, adapts it and hands
/// it back. Every step runs on real threads over the in-process process group.
#[test]
fn plan_shard_adapt_release() -> anyhow::Result<()> {
    let planner = ResourcePlanner::new(FLEET.parse::<FleetConfig>()?.into_runtime())?;
    let mut request = GenerationRequest::new(Resolution::new(720, 720), ClipDuration::FIVE_SECONDS);
    request.vram_mode = Some("fp8".into());
    request.gpu_allocation = Some("fsdp".into());

    let plan = EnginePlan::resolve(&planner, &request, 1 << 30)?;
    assert_eq!(plan.world_size(), 2);
    let mut config = plan.sharding.clone().expect("fsdp plans carry a sharding config");
    assert_eq!(config.strategy, ShardingStrategy::ShardGradOp);

    // exact comparisons below need full precision, and parameters must be split
    config.strategy = ShardingStrategy::FullShard;
    config.mixed_precision = MixedPrecision {
        param_dtype: Precision::Fp32,
        reduce_dtype: Precision::Fp32,
        buffer_dtype: Precision::Fp32,
    };

    let devices = vec![Device::Cpu; plan.world_size()];
    let results = run_local_ranks(&devices, |group| -> anyhow::Result<_> {
        let rank = group.rank();
        // each rank starts from different random weights, rank 0's win
        let model = ModelGraph::transformer(2, 8, 16, Device::Cpu)?;
        let reference: BTreeMap<String, Tensor> = model
            .named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.copy()))
            .collect();
        let xs = Tensor::ones([3, 8], (Kind::Float, Device::Cpu));
        let expected = model.forward_linear("layers.0.self_attn.q", &xs)?;

        let mut sharded = ShardingPlanner::new(config.clone()).shard(model, Some(group))?;
        assert!(sharded.memory_stats().savings() > 0.4);

        let mut manager = LoraManager::new();
        manager.register("style", BTreeMap::new());
        let adapted = sharded.with_full_model(|model| {
            manager.apply(model, "style", &[], 4, 4.0, false)
        })??;
        assert_eq!(adapted, 8);

        // fresh adapters contribute nothing
        let output = sharded.with_unit("layers.0", |model| {
            model.forward_linear("layers.0.self_attn.q", &xs)
        })??;

        sharded.with_full_model(|model| manager.remove(model))??;
        assert_eq!(manager.active_adapter(), None);

        let released = sharded.release()?;
        Ok((rank, reference, expected, output, released.named_parameters()))
    })?;

    let results = results.into_iter().collect::<anyhow::Result<Vec<_>>>()?;
    let (_, reference, expected, _, _) = &results[0];
    for (rank, _, _, output, released) in &results {
        assert!(
            output.equal(expected),
            "rank {rank} forward differs from rank 0's unsharded model"
        );
        assert_eq!(released.len(), reference.len());
        for (name, tensor) in released {
            assert!(tensor.equal(&reference[name]), "rank {rank} parameter {name}");
        }
    }
    Ok(())
}
