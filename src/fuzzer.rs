//! The fuzzing loop: select, mutate, execute, classify, save.
//!
//! Single-threaded and synchronous; the only blocking point is waiting for
//! the child. Every save triggered by an execution completes before the next
//! execution starts, which is what makes checkpoints consistent.

use std::time::{Duration, Instant};

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore as _, SeedableRng as _};
use walkdir::WalkDir;

use crate::checkpoint::Checkpoint;
use crate::evaluator::{Evaluator, FinalReport, TimelineRow};
use crate::executor::Executor;
use crate::monitor::Monitor;
use crate::mutator::{self, MutationStrategy, MutatorConfig};
use crate::scheduler::{Seed, SeedScheduler};
use crate::shmem::{classify_counts, count_bits};
use crate::signals::{self, Shutdown};
use crate::{Config, GrizzlyError, GrizzlyResult};

pub struct Fuzzer {
    config: Config,
    executor: Executor,
    monitor: Monitor,
    scheduler: SeedScheduler,
    evaluator: Evaluator,
    rng: ChaCha20Rng,
    started: Instant,
    /// Logical time already spent before a checkpoint resume.
    elapsed_offset: Duration,
    last_log: Instant,
    last_checkpoint: Instant,
    last_execs: u64,
    iteration: u64,
}

impl Fuzzer {
    pub fn new(config: Config) -> GrizzlyResult<Self> {
        config.validate()?;

        let executor = Executor::new(&config)?;
        let monitor = Monitor::new(&config.output, config.bitmap_size, config.crash_info_max_len)?;
        let scheduler = SeedScheduler::new(
            config.seed_sort_strategy,
            config.max_seeds,
            config.max_seeds_memory_bytes(),
        );
        let evaluator = Evaluator::new(&config.output)?;

        let seed = config.seed.unwrap_or_else(gen_seed);
        tracing::info!(seed, target = %config.target.display(), "fuzzer initialized");

        Ok(Self {
            config,
            executor,
            monitor,
            scheduler,
            evaluator,
            rng: rng_from_seed(seed),
            started: Instant::now(),
            elapsed_offset: Duration::ZERO,
            last_log: Instant::now(),
            last_checkpoint: Instant::now(),
            last_execs: 0,
            iteration: 0,
        })
    }

    /// Run until the duration budget is spent or a shutdown signal arrives.
    pub fn run(&mut self) -> GrizzlyResult<FinalReport> {
        signals::install();
        self.started = Instant::now();
        self.last_log = Instant::now();
        self.last_checkpoint = Instant::now();

        match self.config.resume_from.clone() {
            Some(path) => self.load_checkpoint(&path)?,
            None => self.load_initial_seeds()?,
        }

        let budget = Duration::from_secs(self.config.duration);
        let mut shutdown = None;

        while self.elapsed() < budget {
            if let Some(sig) = signals::pending() {
                tracing::info!(?sig, "shutdown requested");
                shutdown = Some(sig);
                break;
            }
            if self.scheduler.is_empty() {
                tracing::warn!("seed queue is empty; stopping");
                break;
            }

            self.iteration += 1;
            let variant = self.next_variant();
            let result = self.executor.execute(&variant)?;
            let is_new = self.monitor.process_execution(&variant, &result);

            if is_new {
                let coverage_bits = result
                    .coverage
                    .as_deref()
                    .map(classified_popcount)
                    .unwrap_or(0);
                let discovered_at_us =
                    self.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
                self.scheduler.add_seed(Seed::new(
                    variant,
                    coverage_bits,
                    result.exec_time_us,
                    discovered_at_us,
                ))?;
            }

            if self.last_log.elapsed().as_secs_f64() >= self.config.log_interval {
                self.record_timeline();
            }
            if self.last_checkpoint.elapsed().as_secs_f64() >= self.config.checkpoint_interval {
                self.save_checkpoint();
                self.last_checkpoint = Instant::now();
            }
        }

        self.finalize(shutdown)
    }

    fn next_variant(&mut self) -> Vec<u8> {
        let mutator_cfg =
            MutatorConfig::new(self.config.max_seed_size, self.config.havoc_iterations);

        // select_next is only reached on a non-empty queue.
        let Some(slot) = self.scheduler.select_next() else {
            return Vec::new();
        };
        let parent = self
            .scheduler
            .seed(slot)
            .map(|s| s.data.clone())
            .unwrap_or_default();

        let splice_due = self.config.splice_period > 0
            && self.iteration % self.config.splice_period == 0
            && self.scheduler.len() >= 2;
        if splice_due {
            if let Some(other_slot) = self.scheduler.random_slot(&mut self.rng) {
                let other = self
                    .scheduler
                    .seed(other_slot)
                    .map(|s| s.data.clone())
                    .unwrap_or_default();
                return mutator::mutate(
                    &parent,
                    MutationStrategy::Splice,
                    Some(&other),
                    &mut self.rng,
                    &mutator_cfg,
                );
            }
        }
        mutator::mutate(
            &parent,
            MutationStrategy::Havoc,
            None,
            &mut self.rng,
            &mutator_cfg,
        )
    }

    /// Load every file under the seed directory, execute it once to learn its
    /// coverage and timing, and enqueue it as an initial seed. This dry run
    /// never checkpoints.
    fn load_initial_seeds(&mut self) -> GrizzlyResult<()> {
        let dir = self.config.seeds.clone();
        let mut files = Vec::new();
        if dir.is_dir() {
            for entry in WalkDir::new(&dir).follow_links(true) {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        files.push(entry.path().to_path_buf());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("skipping unreadable seed entry: {err}");
                    }
                }
            }
        }
        files.sort();

        if files.len() > self.config.max_seeds {
            return Err(GrizzlyError::Config(format!(
                "{} initial seeds exceed max_seeds ({}); initial seeds are never evicted",
                files.len(),
                self.config.max_seeds
            )));
        }

        if files.is_empty() {
            tracing::warn!(dir = %dir.display(), "no seeds found; starting from an empty seed");
            self.dry_run(Vec::new())?;
            return Ok(());
        }

        tracing::info!(count = files.len(), "loading initial seeds");
        for path in files {
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(file = %path.display(), "failed to read seed: {err}");
                    continue;
                }
            };
            if data.len() > self.config.max_seed_size {
                tracing::warn!(
                    file = %path.display(),
                    size = data.len(),
                    "seed exceeds max_seed_size; skipped"
                );
                continue;
            }
            self.dry_run(data)?;
        }

        if self.scheduler.is_empty() {
            tracing::warn!("every seed was rejected; starting from an empty seed");
            self.dry_run(Vec::new())?;
        }
        tracing::info!(count = self.scheduler.len(), "seed queue ready");
        Ok(())
    }

    fn dry_run(&mut self, data: Vec<u8>) -> GrizzlyResult<()> {
        let result = self.executor.execute(&data)?;
        self.monitor.process_execution(&data, &result);
        let coverage_bits = result
            .coverage
            .as_deref()
            .map(classified_popcount)
            .unwrap_or(0);
        self.scheduler.add_seed(
            Seed::new(data, coverage_bits, result.exec_time_us, 0).initial(),
        )?;
        Ok(())
    }

    fn finalize(&mut self, shutdown: Option<Shutdown>) -> GrizzlyResult<FinalReport> {
        self.record_timeline();
        if shutdown == Some(Shutdown::Interrupt) {
            self.save_checkpoint();
        }

        if let Err(err) = self.evaluator.write_stats(self.monitor.stats()) {
            tracing::warn!("failed to write stats: {err}");
        }

        let elapsed = self.elapsed().as_secs_f64();
        let stats = self.monitor.stats().clone();
        let report = FinalReport {
            target: self.config.target.display().to_string(),
            args: self.config.args.clone(),
            duration_s: elapsed,
            total_execs: stats.total_execs,
            exec_rate: if elapsed > 0.0 {
                stats.total_execs as f64 / elapsed
            } else {
                0.0
            },
            total_crashes: stats.total_crashes,
            saved_crashes: stats.saved_crashes,
            total_hangs: stats.total_hangs,
            saved_hangs: stats.saved_hangs,
            coverage_bits: self.monitor.coverage_bits(),
            total_seeds: self.scheduler.len(),
        };
        self.evaluator.save_final_report(&report)?;
        self.executor.cleanup();
        Ok(report)
    }

    fn record_timeline(&mut self) {
        let elapsed = self.elapsed().as_secs_f64();
        let window = self.last_log.elapsed().as_secs_f64();
        let stats = self.monitor.stats().clone();
        let recent = stats.total_execs.saturating_sub(self.last_execs);
        let exec_rate = if window > 0.0 {
            recent as f64 / window
        } else {
            0.0
        };

        let row = TimelineRow {
            elapsed_s: elapsed,
            total_execs: stats.total_execs,
            exec_rate,
            total_crashes: stats.total_crashes,
            saved_crashes: stats.saved_crashes,
            total_hangs: stats.total_hangs,
            saved_hangs: stats.saved_hangs,
            coverage_bits: self.monitor.coverage_bits(),
        };
        if let Err(err) = self.evaluator.record(&row) {
            tracing::warn!("failed to record timeline row: {err}");
        }

        tracing::info!(
            elapsed = format_args!("{elapsed:.0}s"),
            execs = row.total_execs,
            rate = format_args!("{exec_rate:.1}/s"),
            coverage = row.coverage_bits,
            crashes = format_args!("{}/{}", row.saved_crashes, row.total_crashes),
            hangs = format_args!("{}/{}", row.saved_hangs, row.total_hangs),
            "status"
        );

        self.last_log = Instant::now();
        self.last_execs = stats.total_execs;
    }

    fn save_checkpoint(&mut self) {
        let path = self.config.checkpoint_dir().join("checkpoint.json");
        let checkpoint = Checkpoint::capture(
            self.elapsed().as_secs_f64(),
            &self.monitor,
            &self.scheduler,
            &self.rng,
        );
        if let Err(err) = checkpoint.write(&path) {
            tracing::warn!(file = %path.display(), "failed to write checkpoint: {err}");
        }
    }

    fn load_checkpoint(&mut self, path: &std::path::Path) -> GrizzlyResult<()> {
        let checkpoint = Checkpoint::read(path)?;
        self.elapsed_offset = Duration::from_secs_f64(checkpoint.elapsed_s);
        self.rng = checkpoint.restore_into(&mut self.monitor, &mut self.scheduler)?;
        self.last_execs = self.monitor.stats().total_execs;
        tracing::info!(
            file = %path.display(),
            seeds = self.scheduler.len(),
            execs = self.last_execs,
            "resumed from checkpoint"
        );
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.elapsed_offset + self.started.elapsed()
    }
}

fn gen_seed() -> u64 {
    let mut bytes = [0u8; 8];
    rand_core::OsRng.fill_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
}

fn rng_from_seed(seed: u64) -> ChaCha20Rng {
    let digest = blake3::hash(&seed.to_le_bytes());
    let mut seed32 = [0u8; 32];
    seed32.copy_from_slice(&digest.as_bytes()[..32]);
    ChaCha20Rng::from_seed(seed32)
}

fn classified_popcount(coverage: &[u8]) -> u32 {
    let mut trace = coverage.to_vec();
    classify_counts(&mut trace);
    count_bits(&trace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rng_derivation_is_deterministic() {
        let mut a = rng_from_seed(7);
        let mut b = rng_from_seed(7);
        assert_eq!(a.next_u64(), b.next_u64());

        let mut c = rng_from_seed(8);
        assert_ne!(rng_from_seed(7).next_u64(), c.next_u64());
    }

    #[test]
    fn classified_popcount_uses_buckets() {
        let mut coverage = vec![0u8; 16];
        coverage[0] = 1; // bucket 1: one bit
        coverage[1] = 5; // bucket 8: one bit
        assert_eq!(classified_popcount(&coverage), 2);
    }
}
