use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use straggler_trace::synth::{write_traces, SynthConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Write seeded synthetic multi-device profiler traces", long_about = None)]
struct Args {
    /// Number of devices (one trace file each)
    #[arg(long, default_value_t = 2)]
    devices: usize,

    /// Training iterations per trace
    #[arg(long, default_value_t = 3)]
    iterations: usize,

    /// Transformer layers per iteration
    #[arg(long, default_value_t = 2)]
    layers: usize,

    /// Random seed; device `i` uses `seed + i`
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Upper bound of per-kernel start delay in microseconds
    #[arg(long, default_value_t = 20)]
    jitter_us: i64,

    /// Output directory
    #[arg(short, long, default_value = "traces")]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = SynthConfig {
        devices: args.devices,
        iterations: args.iterations,
        layers: args.layers,
        seed: args.seed,
        max_jitter_us: args.jitter_us,
    };
    info!("🔧 {:?}", config);

    let paths = write_traces(&config, &args.out_dir)?;
    for path in &paths {
        println!("  {}", path.display());
    }
    Ok(())
}
