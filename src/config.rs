//! Configuration: defaults, optional `grizzly.toml`, validation.
//!
//! Every field has a serde default so partial config files work; the CLI
//! layer overrides individual fields on top. `validate` collects every
//! violation at once instead of failing on the first.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::scheduler::ScheduleStrategy;
use crate::{GrizzlyError, GrizzlyResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Target binary path.
    #[serde(default)]
    pub target: PathBuf,

    /// Argument template; the token `@@` is replaced with the input file
    /// path. Without `@@`, input arrives on stdin.
    #[serde(default)]
    pub args: String,

    /// Initial seed directory.
    #[serde(default = "default_seeds")]
    pub seeds: PathBuf,

    /// Output directory (crashes/, hangs/, queue/, timeline, reports).
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Fuzzing duration in seconds.
    #[serde(default = "default_duration")]
    pub duration: u64,

    /// Per-execution wall-clock timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// Target address-space limit in MB.
    #[serde(default = "default_mem_limit")]
    pub mem_limit: u64,

    /// Coverage bitmap size in bytes.
    #[serde(default = "default_bitmap_size")]
    pub bitmap_size: usize,

    /// Cap on initial and mutated seed sizes in bytes.
    #[serde(default = "default_max_seed_size")]
    pub max_seed_size: usize,

    /// Stacked mutation rounds per havoc pass.
    #[serde(default = "default_havoc_iterations")]
    pub havoc_iterations: u32,

    /// Seed selection strategy.
    #[serde(default = "default_seed_sort_strategy")]
    pub seed_sort_strategy: ScheduleStrategy,

    /// Seed queue count bound.
    #[serde(default = "default_max_seeds")]
    pub max_seeds: usize,

    /// Seed queue memory bound in MB.
    #[serde(default = "default_max_seeds_memory")]
    pub max_seeds_memory: u64,

    /// Every Nth iteration splices two parents instead of havoc. 0 disables.
    #[serde(default = "default_splice_period")]
    pub splice_period: u64,

    /// Timeline/status cadence in seconds.
    #[serde(default = "default_log_interval")]
    pub log_interval: f64,

    /// Periodic checkpoint cadence in seconds.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: f64,

    /// Captured stderr bound in bytes.
    #[serde(default = "default_stderr_max_len")]
    pub stderr_max_len: usize,

    /// Bound on the `.stderr` sibling saved next to crash inputs.
    #[serde(default = "default_crash_info_max_len")]
    pub crash_info_max_len: usize,

    /// Wrap the target in bubblewrap when available.
    #[serde(default)]
    pub use_sandbox: bool,

    /// RNG seed; omitted means OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Checkpoint directory (default: `<output>/checkpoints`).
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,

    /// Resume from this checkpoint file, skipping the seed dry run.
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
}

fn default_seeds() -> PathBuf {
    PathBuf::from("seeds")
}

fn default_output() -> PathBuf {
    PathBuf::from("output")
}

fn default_duration() -> u64 {
    3600
}

fn default_timeout() -> f64 {
    1.0
}

fn default_mem_limit() -> u64 {
    256
}

fn default_bitmap_size() -> usize {
    65536
}

fn default_max_seed_size() -> usize {
    512 * 1000
}

fn default_havoc_iterations() -> u32 {
    16
}

fn default_seed_sort_strategy() -> ScheduleStrategy {
    ScheduleStrategy::Energy
}

fn default_max_seeds() -> usize {
    10_000
}

fn default_max_seeds_memory() -> u64 {
    256
}

fn default_splice_period() -> u64 {
    4
}

fn default_log_interval() -> f64 {
    10.0
}

fn default_checkpoint_interval() -> f64 {
    60.0
}

fn default_stderr_max_len() -> usize {
    1000
}

fn default_crash_info_max_len() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: PathBuf::new(),
            args: String::new(),
            seeds: default_seeds(),
            output: default_output(),
            duration: default_duration(),
            timeout: default_timeout(),
            mem_limit: default_mem_limit(),
            bitmap_size: default_bitmap_size(),
            max_seed_size: default_max_seed_size(),
            havoc_iterations: default_havoc_iterations(),
            seed_sort_strategy: default_seed_sort_strategy(),
            max_seeds: default_max_seeds(),
            max_seeds_memory: default_max_seeds_memory(),
            splice_period: default_splice_period(),
            log_interval: default_log_interval(),
            checkpoint_interval: default_checkpoint_interval(),
            stderr_max_len: default_stderr_max_len(),
            crash_info_max_len: default_crash_info_max_len(),
            use_sandbox: false,
            seed: None,
            checkpoint_path: None,
            resume_from: None,
        }
    }
}

impl Config {
    /// Load a config file if present; a missing file means defaults, a
    /// malformed one means a warning plus defaults.
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Validate every constraint; startup-fatal on any violation.
    pub fn validate(&self) -> GrizzlyResult<()> {
        let mut errors = Vec::new();

        if self.target.as_os_str().is_empty() {
            errors.push("target is required".to_string());
        }
        if self.duration == 0 {
            errors.push("duration must be positive".to_string());
        }
        if !(self.timeout > 0.0) {
            errors.push("timeout must be positive".to_string());
        }
        if self.mem_limit == 0 {
            errors.push("mem_limit must be positive".to_string());
        }
        if self.bitmap_size == 0 {
            errors.push("bitmap_size must be positive".to_string());
        }
        if self.max_seed_size == 0 {
            errors.push("max_seed_size must be at least 1".to_string());
        }
        if self.max_seeds == 0 {
            errors.push("max_seeds must be at least 1".to_string());
        }
        if self.max_seeds_memory == 0 {
            errors.push("max_seeds_memory must be positive".to_string());
        }
        if !(self.log_interval > 0.0) {
            errors.push("log_interval must be positive".to_string());
        }
        if !(self.checkpoint_interval > 0.0) {
            errors.push("checkpoint_interval must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GrizzlyError::Config(errors.join("; ")))
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_path
            .clone()
            .unwrap_or_else(|| self.output.join("checkpoints"))
    }

    pub fn max_seeds_memory_bytes(&self) -> usize {
        (self.max_seeds_memory as usize).saturating_mul(1024 * 1024)
    }
}
