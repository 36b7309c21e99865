use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ovi_modeling::{
    choose_strategy, run_local_ranks, ClipDuration, DeviceRuntime, Devices, EnginePlan,
    FleetConfig, GenerationRequest, HybridTopology, LoraConfig, ModelGraph, ProcessGroup,
    Resolution, ResourcePlanner, ShardingConfig, ShardingPlanner, ShardingStrategy,
};
use serde_json::json;
use std::path::PathBuf;
use tch::Device;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const GIB: f64 = (1u64 << 30) as f64;

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
enum LogOutput {
    Console,
    Json,
    None,
}

#[derive(Parser, Debug)]
#[command(name = "ovi-planner")]
#[command(about = "GPU placement planning for the video generator")]
struct Args {
    /// TOML description of the GPU fleet. Without it the local GPUs are queried.
    #[arg(long, env = "OVI_FLEET", global = true)]
    fleet: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogOutput::Console, global = true)]
    logs: LogOutput,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List inventoried devices with their current free memory
    Devices,

    /// Device with the most free memory right now
    BestDevice,

    /// Resolve an allocation mode against the fleet
    Allocate {
        #[arg(default_value = "auto")]
        mode: String,
    },

    /// Estimate peak VRAM for one generation
    Estimate {
        #[arg(long, default_value = "720x720")]
        resolution: Resolution,

        #[arg(long, default_value = "5s")]
        duration: ClipDuration,

        #[arg(long, default_value = "standard")]
        mode: String,
    },

    /// Suggest a VRAM mode and allocation for the fleet
    Recommend {
        #[arg(long, default_value = "720x720")]
        resolution: Resolution,

        #[arg(long, default_value = "5s")]
        duration: ClipDuration,
    },

    /// Pick a sharding strategy from model and device sizes
    Strategy {
        #[arg(long)]
        num_devices: usize,

        #[arg(long)]
        model_gb: f64,

        #[arg(long)]
        available_gb: f64,
    },

    /// Resolve a full engine plan for one request
    Plan {
        #[arg(long, default_value = "720x720")]
        resolution: Resolution,

        #[arg(long, default_value = "5s")]
        duration: ClipDuration,

        #[arg(long)]
        vram_mode: Option<String>,

        #[arg(long)]
        allocation: Option<String>,

        /// Parameter memory of the generator
        #[arg(long, default_value = "22.0")]
        model_gb: f64,

        #[arg(long)]
        sequence_length: Option<usize>,
    },

    /// Print a LoRA preset
    LoraPreset { name: String },

    /// Shard a small transformer over in-process ranks and report per-rank memory
    Simulate {
        #[arg(long, default_value = "4")]
        ranks: usize,

        /// auto, cpu, mps, cuda or cuda:0,1,... CPU runs every rank on the host, other
        /// sets are cut down to --ranks devices
        #[arg(long, default_value = "cpu")]
        devices: Devices,

        #[arg(long, default_value = "FULL_SHARD")]
        strategy: ShardingStrategy,

        /// Ranks per shard group for HYBRID_SHARD
        #[arg(long, default_value = "2")]
        shard_size: usize,

        #[arg(long, default_value = "4")]
        blocks: usize,

        #[arg(long, default_value = "64")]
        hidden: i64,

        #[arg(long)]
        cpu_offload: bool,
    },
}

fn init_logging(output: LogOutput) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()?;
    let layer = match output {
        LogOutput::Console => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogOutput::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .flatten_event(true)
            .boxed(),
        LogOutput::None => return Ok(()),
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()?;
    Ok(())
}

fn runtime(fleet: Option<&PathBuf>) -> Result<Box<dyn DeviceRuntime>> {
    if let Some(path) = fleet {
        let fleet = FleetConfig::load(path)?;
        info!(path = %path.display(), devices = fleet.devices.len(), "Loaded fleet description");
        return Ok(Box::new(fleet.into_runtime()));
    }
    #[cfg(feature = "cuda")]
    {
        Ok(Box::new(ovi_modeling::CudaRuntime::new()?))
    }
    #[cfg(not(feature = "cuda"))]
    {
        Ok(Box::new(ovi_modeling::NvmlRuntime::new()?))
    }
}

fn print(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn simulate(
    ranks: usize,
    devices: Devices,
    strategy: ShardingStrategy,
    shard_size: usize,
    blocks: usize,
    hidden: i64,
    cpu_offload: bool,
) -> Result<()> {
    if ranks == 0 {
        bail!("need at least one rank");
    }
    let devices = match devices {
        Devices::Cpu => vec![Device::Cpu; ranks],
        devices => devices.limit(ranks).torch_devices(),
    };
    let topology = match strategy {
        ShardingStrategy::HybridShard => Some(HybridTopology::new(devices.len(), shard_size)?),
        _ => None,
    };
    let config = ShardingConfig::inference(strategy, cpu_offload);
    info!(ranks = devices.len(), %strategy, "Simulating sharded placement");
    let stats = run_local_ranks(&devices, |group| -> Result<_> {
        let (rank, device) = (group.rank(), group.device());
        let model = ModelGraph::transformer(blocks, hidden, 4 * hidden, device)?;
        let planner = ShardingPlanner::new(config.clone());
        let sharded = match &topology {
            Some(topology) => {
                let (shard, replicate) = topology.groups(rank, device)?;
                planner.with_replicate_group(replicate).shard(model, Some(shard))?
            }
            None => planner.shard(model, Some(group))?,
        };
        Ok(sharded.memory_stats())
    })?
    .into_iter()
    .collect::<Result<Vec<_>>>()?;

    let report: Vec<_> = stats
        .iter()
        .enumerate()
        .map(|(rank, stats)| {
            json!({
                "rank": rank,
                "local_mb": stats.local_param_bytes as f64 / (1 << 20) as f64,
                "full_mb": stats.full_param_bytes as f64 / (1 << 20) as f64,
                "savings": stats.savings(),
                "offloaded": stats.offloaded,
            })
        })
        .collect();
    print(&json!({ "strategy": strategy, "ranks": report }))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.logs)?;

    let fleet = args.fleet;
    let planner = || -> Result<ResourcePlanner<Box<dyn DeviceRuntime>>> {
        Ok(ResourcePlanner::new(runtime(fleet.as_ref())?)?)
    };

    match args.command {
        Commands::Estimate {
            resolution,
            duration,
            mode,
        } => {
            let config = ovi_modeling::vram_mode(&mode).with_context(|| {
                format!("unknown VRAM mode {mode}, expected one of standard, fp8, fp8_offload, ultra_low")
            })?;
            let gb = ovi_modeling::estimate_vram(resolution, duration, config);
            print(&json!({
                "resolution": resolution.to_string(),
                "duration": duration,
                "frames": duration.frames(),
                "mode": config,
                "estimated_gb": gb,
            }))
        }
        Commands::Strategy {
            num_devices,
            model_gb,
            available_gb,
        } => {
            let strategy = choose_strategy(
                num_devices,
                (model_gb * GIB) as u64,
                (available_gb * GIB) as u64,
            );
            print(&strategy)
        }
        Commands::LoraPreset { name } => print(&LoraConfig::preset(&name)?),
        Commands::Simulate {
            ranks,
            devices,
            strategy,
            shard_size,
            blocks,
            hidden,
            cpu_offload,
        } => simulate(
            ranks,
            devices,
            strategy,
            shard_size,
            blocks,
            hidden,
            cpu_offload,
        ),
        Commands::Devices => {
            let planner = planner()?;
            let devices = planner
                .devices()
                .iter()
                .map(|d| {
                    Ok(json!({
                        "index": d.index,
                        "total_gb": d.total_gb(),
                        "free_gb": planner.free_memory(d.index)? as f64 / GIB,
                    }))
                })
                .collect::<Result<Vec<_>>>()?;
            print(&devices)
        }
        Commands::BestDevice => print(&planner()?.best_device()?),
        Commands::Allocate { mode } => print(planner()?.allocate(&mode)),
        Commands::Recommend {
            resolution,
            duration,
        } => print(&planner()?.recommend(resolution, duration)),
        Commands::Plan {
            resolution,
            duration,
            vram_mode,
            allocation,
            model_gb,
            sequence_length,
        } => {
            let request = GenerationRequest {
                resolution,
                duration,
                vram_mode,
                gpu_allocation: allocation,
                sequence_length,
            };
            print(&EnginePlan::resolve(
                &planner()?,
                &request,
                (model_gb * GIB) as u64,
            )?)
        }
    }
}
