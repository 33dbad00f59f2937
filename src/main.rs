use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

use straggler_trace::counters::{load_counter_file, merge_counters};
use straggler_trace::ingest::{concat_tables, device_order, parse_traces, write_table};
use straggler_trace::overlap::{communication_table, overlap_cdf, overlap_table};
use straggler_trace::straggler::{
    slack_table, straggler_contributors, straggler_table, CONTRIBUTOR_REDUCTIONS,
};
use straggler_trace::{
    aggregate, AggregateSpec, AnalysisConfig, Framework, GroupedTable, MetricRegistry, Reduction,
    Report, ReportMeta, TableCache, UnifiedTable,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every analysis; flags override the config file.
#[derive(Args, Debug, Clone)]
struct AnalysisArgs {
    /// Unified table produced by `parse`
    #[arg(short, long, default_value = "unified.json")]
    table: PathBuf,

    /// Analysis configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Framework variant (fsdp-v1, fsdp-v2)
    #[arg(long)]
    framework: Option<Framework>,

    /// Iteration offsets into the sorted distinct iterations, e.g. `0,-1`
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    iterations: Vec<i64>,

    /// Group down to kernel names
    #[arg(long)]
    kernel_name: bool,

    /// Keep records without a chunk
    #[arg(long)]
    keep_unchunked: bool,

    /// Skip GEMM/FA/Vec operator-type labels
    #[arg(long)]
    no_operator_types: bool,

    /// Straggler reference across devices (max, min, median, mean)
    #[arg(long)]
    reference: Option<Reduction>,

    /// Write the result as a JSON report
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Rows to print
    #[arg(long, default_value_t = 40)]
    limit: usize,
}

impl AnalysisArgs {
    fn resolve(&self) -> Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        if let Some(framework) = self.framework {
            config.framework = framework;
        }
        if !self.iterations.is_empty() {
            config.iterations = self.iterations.clone();
        }
        if self.kernel_name {
            config.kernel_name = true;
        }
        if self.keep_unchunked {
            config.drop_unchunked = false;
        }
        if self.no_operator_types {
            config.assign_operator_types = false;
        }
        if let Some(reference) = self.reference {
            config.reference = reference;
        }
        config.validate()?;
        Ok(config)
    }

    fn emit(&self, config: &AnalysisConfig, analysis: &str, table: GroupedTable) -> Result<()> {
        let report = Report::new(
            ReportMeta::new(config, analysis, &self.table.display().to_string()),
            table,
        );
        println!("\n{}", report.summary(self.limit));
        if let Some(path) = &self.output {
            report
                .save_to_file(path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Results saved to: {}", path.display());
        }
        Ok(())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse trace files (one per device) into a unified table
    Parse {
        /// Trace JSON files; sorted path order assigns device ids
        #[arg(required = true)]
        traces: Vec<PathBuf>,

        #[arg(short, long, default_value = "unified.json")]
        output: PathBuf,
    },
    /// Concatenate unified tables
    Concat {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(short, long, default_value = "unified.json")]
        output: PathBuf,
    },
    /// Attach hardware counters to a unified table
    MergeCounters {
        #[arg(short, long, default_value = "unified.json")]
        table: PathBuf,

        /// Counter JSON files; sorted path order assigns device ids
        #[arg(long, required = true)]
        counters: Vec<PathBuf>,

        /// Raw iteration numbers that receive counters
        #[arg(long, value_delimiter = ',')]
        iterations: Vec<i64>,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Per-device lead over the slowest device at each operator
    Straggler {
        #[command(flatten)]
        analysis: AnalysisArgs,
    },
    /// Reduce straggler lead per device and operator
    Contributors {
        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Reduce s-delta instead of s-value
        #[arg(long)]
        delta: bool,

        #[arg(long, value_delimiter = ',', default_value = "device,operator-name")]
        group_by: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        reductions: Vec<Reduction>,
    },
    /// Per-device lead at each communication group
    Slack {
        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Print the computation intervals instead
        #[arg(long)]
        computation: bool,
    },
    /// Communication overlap ratio of each computation interval
    Overlap {
        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Print the communication intervals instead
        #[arg(long)]
        communication: bool,
    },
    /// Cumulative distribution of overlap ratios per device
    OverlapCdf {
        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Order by start time only
        #[arg(long)]
        by_time: bool,
    },
    /// Compute registered metrics onto every record
    Derive {
        #[arg(short, long, default_value = "unified.json")]
        table: PathBuf,

        #[arg(short, long = "metric", required = true)]
        metrics: Vec<String>,

        /// Write the table with derived metrics
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List available metrics
    ListMetrics,
    /// Generate a default analysis configuration file
    GenConfig {
        #[arg(short, long, default_value = "analysis.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command).await {
        error!("❌ {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let mut cache = TableCache::new();

    match command {
        Commands::Parse { traces, output } => {
            for (device, path) in device_order(&traces) {
                info!("device {} <- {}", device, path.display());
            }
            let table = parse_traces(&traces).await.context("parsing traces")?;
            write_table(&output, &table)?;
            println!(
                "📦 {} records across {} devices written to {}",
                table.len(),
                table.devices().len(),
                output.display()
            );
        }
        Commands::Concat { inputs, output } => {
            let table = concat_tables(&inputs)?;
            write_table(&output, &table)?;
            println!("📦 {} records written to {}", table.len(), output.display());
        }
        Commands::MergeCounters {
            table,
            counters,
            iterations,
            output,
        } => {
            let mut unified = (*load(&mut cache, &table)?).clone();
            let mut rows = Vec::new();
            for (device, path) in device_order(&counters) {
                rows.extend(load_counter_file(&path, device)?);
            }
            let selection = (!iterations.is_empty()).then_some(iterations.as_slice());
            let report = merge_counters(&mut unified, &rows, selection)?;
            write_table(&output, &unified)?;
            println!(
                "🔗 {} records received counters ({} kernels only in counters, {} only in trace)",
                report.matched,
                report.missing_from_trace.len(),
                report.missing_from_counters.len()
            );
        }
        Commands::Straggler { analysis } => {
            let config = analysis.resolve()?;
            let table = load(&mut cache, &analysis.table)?;
            let out = straggler_table(&table, &config)?;
            analysis.emit(&config, "straggler", out)?;
        }
        Commands::Contributors {
            analysis,
            delta,
            group_by,
            reductions,
        } => {
            let config = analysis.resolve()?;
            let table = load(&mut cache, &analysis.table)?;
            let straggler = straggler_table(&table, &config)?;
            let reductions = if reductions.is_empty() {
                CONTRIBUTOR_REDUCTIONS.to_vec()
            } else {
                reductions
            };
            let group_by: Vec<&str> = group_by.iter().map(String::as_str).collect();
            let out = straggler_contributors(&straggler, &group_by, delta, &reductions)?;
            analysis.emit(&config, "contributors", out)?;
        }
        Commands::Slack {
            analysis,
            computation,
        } => {
            let config = analysis.resolve()?;
            let table = load(&mut cache, &analysis.table)?;
            let slack = slack_table(&table, &config)?;
            if computation {
                analysis.emit(&config, "slack-computation", slack.computation)?;
            } else {
                analysis.emit(&config, "slack", slack.communication)?;
            }
        }
        Commands::Overlap {
            analysis,
            communication,
        } => {
            let config = analysis.resolve()?;
            let table = load(&mut cache, &analysis.table)?;
            if communication {
                let out = communication_table(&table, &config)?;
                analysis.emit(&config, "communication", out)?;
            } else {
                let out = overlap_table(&table, &config)?;
                analysis.emit(&config, "overlap", out)?;
            }
        }
        Commands::OverlapCdf { analysis, by_time } => {
            let mut config = analysis.resolve()?;
            if by_time {
                config.sort_overlap_cdf_by_ratio = false;
            }
            let table = load(&mut cache, &analysis.table)?;
            let overlap = overlap_table(&table, &config)?;
            let out = overlap_cdf(&overlap, config.sort_overlap_cdf_by_ratio)?;
            analysis.emit(&config, "overlap-cdf", out)?;
        }
        Commands::Derive {
            table,
            metrics,
            output,
        } => {
            let registry = MetricRegistry::builtin();
            let mut unified = (*load(&mut cache, &table)?).clone();
            for name in &metrics {
                registry.derive(name, &mut unified)?;
            }

            let mut spec = AggregateSpec::new(&["device"]);
            for name in &metrics {
                spec = spec.column(name, name, Reduction::Mean);
            }
            println!("\n📐 Mean per device:");
            println!("{}", aggregate(&unified.records, &spec)?.display_table(usize::MAX));

            if let Some(path) = output {
                write_table(&path, &unified)?;
            }
        }
        Commands::ListMetrics => {
            let registry = MetricRegistry::builtin();
            println!("📋 Available metrics:");
            for def in registry.iter() {
                println!("  - {} [{}] requires {:?}", def.name, def.unit, def.required_columns());
            }
        }
        Commands::GenConfig { output } => {
            if output.exists() {
                warn!("⚠️ Overwriting {}", output.display());
            }
            AnalysisConfig::default().save(&output)?;
            println!("✅ Default configuration written to {}", output.display());
        }
    }
    Ok(())
}

fn load(cache: &mut TableCache, path: &Path) -> Result<Arc<UnifiedTable>> {
    cache
        .load(path)
        .with_context(|| format!("loading unified table {}", path.display()))
}
