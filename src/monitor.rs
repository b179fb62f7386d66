//! Coverage monitor: novelty detection, crash/hang dedup, artifact saving.
//!
//! Three AFL-style virgin bitmaps start all-ones and only ever lose bits:
//! `virgin_bits` for normal executions, `virgin_crash` and `virgin_tmout`
//! for crash and hang dedup. Every comparison sees the *bucketized* trace,
//! so hit-count noise on a hot edge is not novelty.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::evaluator::wall_time_iso_utc;
use crate::executor::ExecutionResult;
use crate::shmem::{classify_counts, count_bits};
use crate::GrizzlyResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub total_execs: u64,
    pub total_crashes: u64,
    pub saved_crashes: u64,
    pub total_hangs: u64,
    pub saved_hangs: u64,
    pub start_time: String,
    #[serde(default)]
    pub last_save_at: Option<String>,
}

#[derive(Debug)]
pub struct Monitor {
    output_dir: PathBuf,
    crashes_dir: PathBuf,
    hangs_dir: PathBuf,
    queue_dir: PathBuf,
    virgin_bits: Vec<u8>,
    virgin_crash: Vec<u8>,
    virgin_tmout: Vec<u8>,
    coverage_bits_cache: u32,
    cache_valid: bool,
    next_queue_seq: u64,
    crash_info_max_len: usize,
    stats: MonitorStats,
    // Hash fallback for results that carry no coverage snapshot.
    crash_hashes: HashSet<u64>,
    hang_hashes: HashSet<u64>,
}

impl Monitor {
    pub fn new(
        output_dir: &Path,
        bitmap_size: usize,
        crash_info_max_len: usize,
    ) -> GrizzlyResult<Self> {
        let crashes_dir = output_dir.join("crashes");
        let hangs_dir = output_dir.join("hangs");
        let queue_dir = output_dir.join("queue");
        std::fs::create_dir_all(&crashes_dir)?;
        std::fs::create_dir_all(&hangs_dir)?;
        std::fs::create_dir_all(&queue_dir)?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            crashes_dir,
            hangs_dir,
            queue_dir,
            virgin_bits: vec![0xFF; bitmap_size],
            virgin_crash: vec![0xFF; bitmap_size],
            virgin_tmout: vec![0xFF; bitmap_size],
            coverage_bits_cache: 0,
            cache_valid: false,
            next_queue_seq: 0,
            crash_info_max_len,
            stats: MonitorStats {
                start_time: wall_time_iso_utc(),
                ..MonitorStats::default()
            },
            crash_hashes: HashSet::new(),
            hang_hashes: HashSet::new(),
        })
    }

    /// Ingest one execution. Returns true iff the input produced strictly new
    /// coverage and belongs in the corpus.
    pub fn process_execution(&mut self, input: &[u8], result: &ExecutionResult) -> bool {
        self.stats.total_execs += 1;

        if result.hanged {
            self.handle_hang(input, result);
            return false;
        }
        if result.crashed {
            self.handle_crash(input, result);
            return false;
        }

        let Some(trace) = classified(result) else {
            return false;
        };
        if !has_new_bits(&trace, &mut self.virgin_bits) {
            return false;
        }
        self.cache_valid = false;

        let seq = self.next_queue_seq;
        self.next_queue_seq += 1;
        let path = self.queue_dir.join(format!("{seq:06}"));
        match std::fs::write(&path, input) {
            Ok(()) => {
                self.stats.last_save_at = Some(wall_time_iso_utc());
                tracing::info!(file = %path.display(), coverage = self.coverage_bits(), "new coverage");
            }
            Err(err) => {
                tracing::warn!(file = %path.display(), "failed to save queue entry: {err}");
            }
        }
        true
    }

    fn handle_hang(&mut self, input: &[u8], result: &ExecutionResult) {
        self.stats.total_hangs += 1;

        let key = match classified(result) {
            Some(trace) => {
                if !has_new_bits(&trace, &mut self.virgin_tmout) {
                    return;
                }
                hex16(&trace)
            }
            None => {
                let h = hash64(input);
                if !self.hang_hashes.insert(h) {
                    return;
                }
                hex16(input)
            }
        };

        let path = self.hangs_dir.join(&key);
        match std::fs::write(&path, input) {
            Ok(()) => {
                self.stats.saved_hangs += 1;
                self.stats.last_save_at = Some(wall_time_iso_utc());
                tracing::info!(file = %path.display(), unique = self.stats.saved_hangs, "new hang");
            }
            Err(err) => {
                tracing::warn!(file = %path.display(), "failed to save hang: {err}");
            }
        }
    }

    fn handle_crash(&mut self, input: &[u8], result: &ExecutionResult) {
        self.stats.total_crashes += 1;

        let stderr = result.stderr.trim_ascii();
        let key = match classified(result) {
            Some(trace) => {
                if !has_new_bits(&trace, &mut self.virgin_crash) {
                    return;
                }
                // Dedup key prefers the failure text; an empty stderr falls
                // back to the coverage fingerprint.
                if stderr.is_empty() {
                    hex16(&trace)
                } else {
                    hex16(stderr)
                }
            }
            None => {
                let basis = if stderr.is_empty() { input } else { stderr };
                let h = hash64(basis);
                if !self.crash_hashes.insert(h) {
                    return;
                }
                hex16(basis)
            }
        };

        let path = self.crashes_dir.join(&key);
        match std::fs::write(&path, input) {
            Ok(()) => {
                self.stats.saved_crashes += 1;
                self.stats.last_save_at = Some(wall_time_iso_utc());
                tracing::info!(
                    file = %path.display(),
                    signal = result.signal,
                    unique = self.stats.saved_crashes,
                    "new crash"
                );

                let mut info = stderr.to_vec();
                info.truncate(self.crash_info_max_len);
                let info_path = self.crashes_dir.join(format!("{key}.stderr"));
                if let Err(err) = std::fs::write(&info_path, info) {
                    tracing::warn!(file = %info_path.display(), "failed to save crash info: {err}");
                }
            }
            Err(err) => {
                tracing::warn!(file = %path.display(), "failed to save crash: {err}");
            }
        }
    }

    /// Total discovered edge buckets: popcount of the negated virgin bitmap.
    /// Cached; recomputed lazily after any virgin mutation.
    pub fn coverage_bits(&mut self) -> u32 {
        if !self.cache_valid {
            self.coverage_bits_cache = self
                .virgin_bits
                .iter()
                .map(|b| (0xFF ^ b).count_ones())
                .sum();
            self.cache_valid = true;
        }
        self.coverage_bits_cache
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn next_queue_seq(&self) -> u64 {
        self.next_queue_seq
    }

    pub fn virgin_bits(&self) -> &[u8] {
        &self.virgin_bits
    }

    pub fn virgin_crash(&self) -> &[u8] {
        &self.virgin_crash
    }

    pub fn virgin_tmout(&self) -> &[u8] {
        &self.virgin_tmout
    }

    /// Replace monitor state wholesale, used on checkpoint resume.
    pub fn restore(
        &mut self,
        stats: MonitorStats,
        virgin_bits: Vec<u8>,
        virgin_crash: Vec<u8>,
        virgin_tmout: Vec<u8>,
        next_queue_seq: u64,
    ) {
        self.stats = stats;
        self.virgin_bits = virgin_bits;
        self.virgin_crash = virgin_crash;
        self.virgin_tmout = virgin_tmout;
        self.next_queue_seq = next_queue_seq;
        self.cache_valid = false;
    }
}

/// Clear every trace bit still set in `virgin`; report whether any was.
fn has_new_bits(trace: &[u8], virgin: &mut [u8]) -> bool {
    let mut new = false;
    for (t, v) in trace.iter().zip(virgin.iter_mut()) {
        if *t != 0 && (*t & *v) != 0 {
            *v &= !*t;
            new = true;
        }
    }
    new
}

fn classified(result: &ExecutionResult) -> Option<Vec<u8>> {
    let mut trace = result.coverage.clone()?;
    classify_counts(&mut trace);
    Some(trace)
}

fn hash64(data: &[u8]) -> u64 {
    let digest = blake3::hash(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

/// First 16 hex chars of the blake3 digest; artifact file names.
fn hex16(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..16].to_string()
}
