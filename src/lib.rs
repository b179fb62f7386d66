//! Grizzly core library: a coverage-guided, mutational greybox fuzzer.
//!
//! The pieces compose the classic AFL-style loop: the executor runs the
//! instrumented target with a shared coverage bitmap, the monitor keeps
//! virgin bitmaps and decides what to save, the mutator produces variants,
//! the scheduler ranks seeds by energy, and the fuzzer module sequences it
//! all with checkpointing and graceful shutdown.

mod checkpoint;
mod config;
mod error;
mod evaluator;
mod executor;
mod fuzzer;
mod monitor;
mod mutator;
mod scheduler;
mod shmem;
mod signals;

pub use checkpoint::*;
pub use config::*;
pub use error::*;
pub use evaluator::*;
pub use executor::*;
pub use fuzzer::*;
pub use monitor::*;
pub use mutator::*;
pub use scheduler::*;
pub use shmem::*;
pub use signals::*;
