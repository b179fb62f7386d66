//! Checkpoint save/load.
//!
//! The whole fuzzing state that matters for resumption goes into one JSON
//! file: counters, the three virgin bitmaps (base64), the seed corpus, the
//! RNG state and the queue sequence counter. Loading a checkpoint skips the
//! initial-seed dry run.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::monitor::{Monitor, MonitorStats};
use crate::scheduler::{Seed, SeedScheduler};
use crate::{GrizzlyError, GrizzlyResult};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSeed {
    pub data_b64: String,
    pub coverage_bits: u32,
    pub exec_time_us: u64,
    pub exec_count: u64,
    pub energy: f64,
    pub discovered_at_us: u64,
    #[serde(default)]
    pub initial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub elapsed_s: f64,
    pub stats: MonitorStats,
    pub virgin_bits: String,
    pub virgin_crash: String,
    pub virgin_tmout: String,
    pub seeds: Vec<CheckpointSeed>,
    pub rng_state: ChaCha20Rng,
    pub next_queue_seq: u64,
}

impl Checkpoint {
    pub fn capture(
        elapsed_s: f64,
        monitor: &Monitor,
        scheduler: &SeedScheduler,
        rng: &ChaCha20Rng,
    ) -> Self {
        let seeds = scheduler
            .seeds()
            .map(|seed| CheckpointSeed {
                data_b64: BASE64.encode(&seed.data),
                coverage_bits: seed.coverage_bits,
                exec_time_us: seed.exec_time_us,
                exec_count: seed.exec_count,
                energy: seed.energy,
                discovered_at_us: seed.discovered_at_us,
                initial: seed.initial,
            })
            .collect();

        Self {
            version: CHECKPOINT_VERSION,
            elapsed_s,
            stats: monitor.stats().clone(),
            virgin_bits: BASE64.encode(monitor.virgin_bits()),
            virgin_crash: BASE64.encode(monitor.virgin_crash()),
            virgin_tmout: BASE64.encode(monitor.virgin_tmout()),
            seeds,
            rng_state: rng.clone(),
            next_queue_seq: monitor.next_queue_seq(),
        }
    }

    pub fn write(&self, path: &Path) -> GrizzlyResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        tracing::info!(file = %path.display(), seeds = self.seeds.len(), "checkpoint saved");
        Ok(())
    }

    pub fn read(path: &Path) -> GrizzlyResult<Self> {
        let bytes = std::fs::read(path).map_err(|err| {
            GrizzlyError::Checkpoint(format!("cannot read {}: {err}", path.display()))
        })?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|err| {
            GrizzlyError::Checkpoint(format!("cannot parse {}: {err}", path.display()))
        })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(GrizzlyError::Checkpoint(format!(
                "unsupported checkpoint version {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }
        Ok(checkpoint)
    }

    /// Restore monitor and scheduler state. The executor's live bitmap is
    /// untouched; it is zeroed before every run anyway.
    pub fn restore_into(
        self,
        monitor: &mut Monitor,
        scheduler: &mut SeedScheduler,
    ) -> GrizzlyResult<ChaCha20Rng> {
        let virgin_bits = decode_bitmap(&self.virgin_bits, "virgin_bits")?;
        let virgin_crash = decode_bitmap(&self.virgin_crash, "virgin_crash")?;
        let virgin_tmout = decode_bitmap(&self.virgin_tmout, "virgin_tmout")?;

        monitor.restore(
            self.stats,
            virgin_bits,
            virgin_crash,
            virgin_tmout,
            self.next_queue_seq,
        );

        for entry in self.seeds {
            let data = BASE64.decode(&entry.data_b64).map_err(|err| {
                GrizzlyError::Checkpoint(format!("bad seed payload: {err}"))
            })?;
            let mut seed = Seed::new(
                data,
                entry.coverage_bits,
                entry.exec_time_us,
                entry.discovered_at_us,
            );
            seed.exec_count = entry.exec_count;
            seed.energy = entry.energy;
            seed.initial = entry.initial;
            scheduler.restore_seed(seed);
        }

        Ok(self.rng_state)
    }
}

fn decode_bitmap(b64: &str, name: &str) -> GrizzlyResult<Vec<u8>> {
    BASE64
        .decode(b64)
        .map_err(|err| GrizzlyError::Checkpoint(format!("bad {name} payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use crate::scheduler::ScheduleStrategy;
    use rand_core::{RngCore as _, SeedableRng as _};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_output(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("grizzly-ckpt-{name}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn touched_monitor(out: &Path) -> Monitor {
        let mut monitor = Monitor::new(out, 64, 500).expect("monitor");
        let mut coverage = vec![0u8; 64];
        coverage[5] = 1;
        coverage[9] = 30;
        let result = ExecutionResult {
            exit_code: 0,
            signal: None,
            crashed: false,
            hanged: false,
            exec_time_us: 250,
            stdout: Vec::new(),
            stderr: Vec::new(),
            coverage: Some(coverage),
        };
        assert!(monitor.process_execution(b"seed", &result));
        monitor
    }

    #[test]
    fn roundtrip_restores_state_bit_for_bit() {
        let out = temp_output("roundtrip");
        let mut monitor = touched_monitor(&out);

        let mut scheduler = SeedScheduler::new(ScheduleStrategy::Energy, 100, 1 << 20);
        scheduler
            .add_seed(Seed::new(b"hello".to_vec(), 3, 250, 0).initial())
            .expect("add");
        scheduler
            .add_seed(Seed::new(b"world".to_vec(), 9, 100, 1200))
            .expect("add");
        scheduler.select_next().expect("select");

        let mut rng = ChaCha20Rng::seed_from_u64(42);
        rng.next_u64();

        let path = out.join("checkpoints").join("checkpoint.json");
        Checkpoint::capture(12.5, &monitor, &scheduler, &rng)
            .write(&path)
            .expect("write");

        let loaded = Checkpoint::read(&path).expect("read");
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert_eq!(loaded.elapsed_s, 12.5);
        assert_eq!(loaded.next_queue_seq, 1);

        let other_out = temp_output("restored");
        let mut restored_monitor = Monitor::new(&other_out, 64, 500).expect("monitor");
        let mut restored_scheduler = SeedScheduler::new(ScheduleStrategy::Energy, 100, 1 << 20);
        let mut restored_rng = loaded
            .restore_into(&mut restored_monitor, &mut restored_scheduler)
            .expect("restore");

        assert_eq!(restored_monitor.virgin_bits(), monitor.virgin_bits());
        assert_eq!(restored_monitor.virgin_crash(), monitor.virgin_crash());
        assert_eq!(restored_monitor.virgin_tmout(), monitor.virgin_tmout());
        assert_eq!(restored_monitor.stats(), monitor.stats());
        assert_eq!(restored_monitor.next_queue_seq(), monitor.next_queue_seq());
        assert_eq!(restored_monitor.coverage_bits(), monitor.coverage_bits());

        let mut before: Vec<&Seed> = scheduler.seeds().collect();
        before.sort_by(|a, b| a.data.cmp(&b.data));
        let mut after: Vec<&Seed> = restored_scheduler.seeds().collect();
        after.sort_by(|a, b| a.data.cmp(&b.data));
        assert_eq!(before, after);

        // Identical RNG state means identical continuation.
        assert_eq!(restored_rng.next_u64(), rng.next_u64());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let out = temp_output("version");
        let monitor = touched_monitor(&out);
        let scheduler = SeedScheduler::new(ScheduleStrategy::Energy, 10, 1 << 20);
        let rng = ChaCha20Rng::seed_from_u64(1);

        let mut checkpoint = Checkpoint::capture(0.0, &monitor, &scheduler, &rng);
        checkpoint.version = 99;
        let path = out.join("checkpoint.json");
        checkpoint.write(&path).expect("write");

        assert!(Checkpoint::read(&path).is_err());
    }

    #[test]
    fn missing_file_is_a_checkpoint_error() {
        let err = Checkpoint::read(Path::new("/nonexistent/checkpoint.json"))
            .expect_err("should fail");
        assert!(matches!(err, GrizzlyError::Checkpoint(_)));
    }
}
