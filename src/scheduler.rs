//! Energy-based seed scheduler.
//!
//! The corpus slots own seed data; the heap holds (energy, slot, stamp)
//! back-references, never the seeds themselves. Stale heap entries are
//! dropped lazily on pop by comparing stamps, which keeps selection at
//! O(log n) without rebuilding the heap on energy updates or eviction.

use std::collections::{BinaryHeap, VecDeque};

use rand_chacha::ChaCha20Rng;
use rand_core::RngCore as _;
use serde::{Deserialize, Serialize};

use crate::{GrizzlyError, GrizzlyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    Energy,
    Fifo,
}

impl clap::ValueEnum for ScheduleStrategy {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Energy, Self::Fifo]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Energy => clap::builder::PossibleValue::new("energy"),
            Self::Fifo => clap::builder::PossibleValue::new("fifo"),
        })
    }
}

/// One corpus entry. `data` is immutable after insertion; `exec_count` and
/// `energy` mutate under scheduler control only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub data: Vec<u8>,
    pub coverage_bits: u32,
    pub exec_time_us: u64,
    pub exec_count: u64,
    pub energy: f64,
    pub discovered_at_us: u64,
    #[serde(default)]
    pub initial: bool,
}

impl Seed {
    pub fn new(data: Vec<u8>, coverage_bits: u32, exec_time_us: u64, discovered_at_us: u64) -> Self {
        Self {
            data,
            coverage_bits,
            exec_time_us,
            exec_count: 0,
            energy: 0.0,
            discovered_at_us,
            initial: false,
        }
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }
}

#[derive(Debug)]
struct HeapEntry {
    energy: f64,
    stamp: u64,
    slot: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.energy
            .total_cmp(&other.energy)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

#[derive(Debug)]
pub struct SeedScheduler {
    strategy: ScheduleStrategy,
    slots: Vec<Option<Seed>>,
    stamps: Vec<u64>,
    heap: BinaryHeap<HeapEntry>,
    fifo: VecDeque<usize>,
    live: usize,
    total_bytes: usize,
    sum_exec_time_us: f64,
    sum_coverage_bits: f64,
    max_seeds: usize,
    max_bytes: usize,
}

impl SeedScheduler {
    pub fn new(strategy: ScheduleStrategy, max_seeds: usize, max_bytes: usize) -> Self {
        Self {
            strategy,
            slots: Vec::new(),
            stamps: Vec::new(),
            heap: BinaryHeap::new(),
            fifo: VecDeque::new(),
            live: 0,
            total_bytes: 0,
            sum_exec_time_us: 0.0,
            sum_coverage_bits: 0.0,
            max_seeds,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn seed(&self, slot: usize) -> Option<&Seed> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Insert a seed, score it against the running means, and evict the
    /// lowest-energy non-initial seed while over capacity. Initial seeds are
    /// never evicted; an initial set that alone exceeds `max_seeds` is a
    /// configuration error.
    pub fn add_seed(&mut self, mut seed: Seed) -> GrizzlyResult<usize> {
        if seed.initial && self.initial_count() >= self.max_seeds {
            return Err(GrizzlyError::Config(format!(
                "initial seed count exceeds max_seeds ({})",
                self.max_seeds
            )));
        }

        self.live += 1;
        self.total_bytes += seed.data.len();
        self.sum_exec_time_us += seed.exec_time_us as f64;
        self.sum_coverage_bits += seed.coverage_bits as f64;
        seed.energy = self.calculate_energy(&seed);

        let slot = self.push_slot(seed);
        self.enforce_capacity();
        Ok(slot)
    }

    /// Re-insert a checkpointed seed verbatim: stored energy and exec_count
    /// are trusted, no rescoring, no eviction sweep.
    pub fn restore_seed(&mut self, seed: Seed) {
        self.live += 1;
        self.total_bytes += seed.data.len();
        self.sum_exec_time_us += seed.exec_time_us as f64;
        self.sum_coverage_bits += seed.coverage_bits as f64;
        self.push_slot(seed);
    }

    /// Pick the next seed to fuzz: heap top under `energy`, rotation under
    /// `fifo`. Bumps `exec_count` and rescores before handing the slot back.
    pub fn select_next(&mut self) -> Option<usize> {
        match self.strategy {
            ScheduleStrategy::Energy => self.select_energy(),
            ScheduleStrategy::Fifo => self.select_fifo(),
        }
    }

    fn select_energy(&mut self) -> Option<usize> {
        loop {
            let entry = self.heap.pop()?;
            if self.stamps[entry.slot] != entry.stamp {
                continue;
            }
            let live = self.live.max(1) as f64;
            let mean_t = self.sum_exec_time_us / live;
            let mean_c = self.sum_coverage_bits / live;
            let Some(seed) = self.slots[entry.slot].as_mut() else {
                continue;
            };
            seed.exec_count += 1;
            seed.energy = energy_score(mean_t, mean_c, seed);
            let energy = seed.energy;

            self.stamps[entry.slot] += 1;
            self.heap.push(HeapEntry {
                energy,
                stamp: self.stamps[entry.slot],
                slot: entry.slot,
            });
            return Some(entry.slot);
        }
    }

    fn select_fifo(&mut self) -> Option<usize> {
        loop {
            let slot = self.fifo.pop_front()?;
            if self.slots[slot].is_none() {
                continue;
            }
            if let Some(seed) = self.slots[slot].as_mut() {
                seed.exec_count += 1;
            }
            self.fifo.push_back(slot);
            return Some(slot);
        }
    }

    /// Uniform-ish draw over live slots, used to pick splice partners.
    pub fn random_slot(&self, rng: &mut ChaCha20Rng) -> Option<usize> {
        if self.live == 0 {
            return None;
        }
        let start = (rng.next_u64() as usize) % self.slots.len();
        (0..self.slots.len())
            .map(|i| (start + i) % self.slots.len())
            .find(|&slot| self.slots[slot].is_some())
    }

    pub fn seeds(&self) -> impl Iterator<Item = &Seed> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn initial_count(&self) -> usize {
        self.seeds().filter(|s| s.initial).count()
    }

    fn calculate_energy(&self, seed: &Seed) -> f64 {
        let live = self.live.max(1) as f64;
        energy_score(
            self.sum_exec_time_us / live,
            self.sum_coverage_bits / live,
            seed,
        )
    }

    fn push_slot(&mut self, seed: Seed) -> usize {
        let slot = self.slots.len();
        let energy = seed.energy;
        self.slots.push(Some(seed));
        self.stamps.push(0);
        match self.strategy {
            ScheduleStrategy::Energy => self.heap.push(HeapEntry {
                energy,
                stamp: 0,
                slot,
            }),
            ScheduleStrategy::Fifo => self.fifo.push_back(slot),
        }
        slot
    }

    fn enforce_capacity(&mut self) {
        while self.live > self.max_seeds || self.total_bytes > self.max_bytes {
            let victim = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|seed| (i, seed)))
                .filter(|(_, seed)| !seed.initial)
                .min_by(|(_, a), (_, b)| a.energy.total_cmp(&b.energy))
                .map(|(i, _)| i);
            let Some(slot) = victim else {
                break; // only initial seeds left; those are untouchable
            };
            self.evict(slot);
        }
    }

    fn evict(&mut self, slot: usize) {
        if let Some(seed) = self.slots[slot].take() {
            self.live -= 1;
            self.total_bytes -= seed.data.len();
            self.sum_exec_time_us -= seed.exec_time_us as f64;
            self.sum_coverage_bits -= seed.coverage_bits as f64;
            self.stamps[slot] += 1;
            tracing::debug!(slot, energy = seed.energy, "evicted seed");
        }
    }
}

/// AFL `calculate_score` approximation: execution speed and coverage size
/// relative to the running means, divided by a staleness decay, clamped to
/// [1, 1600].
fn energy_score(mean_t: f64, mean_c: f64, seed: &Seed) -> f64 {
    let t = seed.exec_time_us as f64;
    let cov = seed.coverage_bits as f64;

    let mut score = 100.0;

    if mean_t > 0.0 {
        if t * 4.0 < mean_t {
            score = 300.0;
        } else if t * 2.0 < mean_t {
            score = 200.0;
        } else if t < mean_t {
            score = 150.0;
        } else if t > mean_t * 4.0 {
            score = 50.0;
        } else if t > mean_t * 2.0 {
            score = 75.0;
        }
    }

    if mean_c > 0.0 {
        if cov * 0.3 > mean_c {
            score *= 3.0;
        } else if cov * 0.5 > mean_c {
            score *= 2.0;
        } else if cov * 0.75 > mean_c {
            score *= 1.5;
        } else if cov < mean_c * 0.25 {
            score *= 0.25;
        } else if cov < mean_c * 0.5 {
            score *= 0.5;
        } else if cov < mean_c * 0.75 {
            score *= 0.75;
        }
    }

    score /= 1.0 + 0.2 * seed.exec_count as f64;
    score.clamp(1.0, 1600.0)
}
