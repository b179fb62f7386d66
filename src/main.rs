//! Grizzly CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use grizzly::{Config, Fuzzer, ScheduleStrategy};

#[derive(Debug, Parser)]
#[command(name = "grizzly")]
#[command(about = "coverage-guided mutational greybox fuzzer")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, default_value = "grizzly.toml")]
    config: PathBuf,

    /// Log level.
    #[arg(long, default_value = "info")]
    log: String,

    /// Target program path.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Target argument template; `@@` marks the input file, otherwise input
    /// arrives on stdin.
    #[arg(long)]
    args: Option<String>,

    /// Initial seed directory.
    #[arg(long)]
    seeds: Option<PathBuf>,

    /// Output directory.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Fuzzing duration (seconds).
    #[arg(long)]
    duration: Option<u64>,

    /// Execution timeout per input (seconds).
    #[arg(long)]
    timeout: Option<f64>,

    /// Memory limit for the target process (MB).
    #[arg(long)]
    mem_limit: Option<u64>,

    /// Coverage bitmap size (bytes).
    #[arg(long)]
    bitmap_size: Option<usize>,

    /// Maximum seed size (bytes) for initial and mutated seeds.
    #[arg(long)]
    max_seed_size: Option<usize>,

    /// Havoc mutation iterations (higher = more mutations).
    #[arg(long)]
    havoc_iterations: Option<u32>,

    /// Seed scheduling strategy.
    #[arg(long)]
    seed_sort_strategy: Option<ScheduleStrategy>,

    /// Maximum number of seeds in queue.
    #[arg(long)]
    max_seeds: Option<usize>,

    /// Maximum seed queue memory usage (MB).
    #[arg(long)]
    max_seeds_memory: Option<u64>,

    /// Splice instead of havoc every Nth iteration (0 disables).
    #[arg(long)]
    splice_period: Option<u64>,

    /// Status log update interval (seconds).
    #[arg(long)]
    log_interval: Option<f64>,

    /// Periodic checkpoint interval (seconds).
    #[arg(long)]
    checkpoint_interval: Option<f64>,

    /// Maximum captured stderr length (bytes).
    #[arg(long)]
    stderr_max_len: Option<usize>,

    /// Maximum stderr length in crash info files (bytes).
    #[arg(long)]
    crash_info_max_len: Option<usize>,

    /// Enable sandbox isolation (bubblewrap).
    #[arg(long)]
    use_sandbox: bool,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Directory to save checkpoints (default: <output>/checkpoints).
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    /// Path to checkpoint.json to resume from.
    #[arg(long)]
    resume_from: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(&cli.log) {
        // Tracing is best-effort; if it fails, we still continue.
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    let mut config = Config::load_optional(&cli.config);
    apply_cli_overrides(&cli, &mut config);

    if let Err(err) = config.validate() {
        return print_error_and_exit(anyhow::Error::new(err).context("invalid configuration"));
    }

    let mut fuzzer = match Fuzzer::new(config) {
        Ok(fuzzer) => fuzzer,
        Err(err) => return print_error_and_exit(anyhow::Error::new(err).context("startup failed")),
    };

    match fuzzer.run() {
        Ok(report) => {
            tracing::info!(
                execs = report.total_execs,
                crashes = report.saved_crashes,
                hangs = report.saved_hangs,
                coverage = report.coverage_bits,
                "fuzzing finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => print_error_and_exit(anyhow::Error::new(err)),
    }
}

fn apply_cli_overrides(cli: &Cli, config: &mut Config) {
    if let Some(v) = &cli.target {
        config.target = v.clone();
    }
    if let Some(v) = &cli.args {
        config.args = v.clone();
    }
    if let Some(v) = &cli.seeds {
        config.seeds = v.clone();
    }
    if let Some(v) = &cli.output {
        config.output = v.clone();
    }
    if let Some(v) = cli.duration {
        config.duration = v;
    }
    if let Some(v) = cli.timeout {
        config.timeout = v;
    }
    if let Some(v) = cli.mem_limit {
        config.mem_limit = v;
    }
    if let Some(v) = cli.bitmap_size {
        config.bitmap_size = v;
    }
    if let Some(v) = cli.max_seed_size {
        config.max_seed_size = v;
    }
    if let Some(v) = cli.havoc_iterations {
        config.havoc_iterations = v;
    }
    if let Some(v) = cli.seed_sort_strategy {
        config.seed_sort_strategy = v;
    }
    if let Some(v) = cli.max_seeds {
        config.max_seeds = v;
    }
    if let Some(v) = cli.max_seeds_memory {
        config.max_seeds_memory = v;
    }
    if let Some(v) = cli.splice_period {
        config.splice_period = v;
    }
    if let Some(v) = cli.log_interval {
        config.log_interval = v;
    }
    if let Some(v) = cli.checkpoint_interval {
        config.checkpoint_interval = v;
    }
    if let Some(v) = cli.stderr_max_len {
        config.stderr_max_len = v;
    }
    if let Some(v) = cli.crash_info_max_len {
        config.crash_info_max_len = v;
    }
    if cli.use_sandbox {
        config.use_sandbox = true;
    }
    if let Some(v) = cli.seed {
        config.seed = Some(v);
    }
    if let Some(v) = &cli.checkpoint_path {
        config.checkpoint_path = Some(v.clone());
    }
    if let Some(v) = &cli.resume_from {
        config.resume_from = Some(v.clone());
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn print_error_and_exit(err: anyhow::Error) -> ExitCode {
    eprintln!("{err:#}");
    ExitCode::from(2)
}
