//! Target executor: one fresh process per input.
//!
//! Each call to `execute` zeroes the shared coverage bitmap, stages the input
//! (temp file for `@@` argv templates, stdin pipe otherwise), spawns the
//! target in its own session with address-space and core limits applied,
//! enforces a wall-clock timeout with a process-group SIGKILL, and classifies
//! the exit as normal, crash, or hang. The forkserver is deliberately
//! disabled (`AFL_NO_FORKSRV=1`): a fresh exec per run costs throughput but
//! keeps the channel protocol trivial.

use std::fs::File;
use std::io::Write as _;
use std::os::unix::process::{CommandExt as _, ExitStatusExt as _};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::shmem::SharedBitmap;
use crate::{Config, GrizzlyError, GrizzlyResult};

/// Signals that classify a child death as a crash.
const CRASH_SIGNALS: [i32; 5] = [
    libc::SIGSEGV,
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
];

/// ASan is told to exit with this code on any report.
const ASAN_EXIT_CODE: i32 = 77;
const ASAN_OPTIONS: &str = "exitcode=77:abort_on_error=1:symbolize=0:detect_leaks=0";

/// Outcome of a single execution. A plain value: crashes and hangs are data.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub crashed: bool,
    pub hanged: bool,
    pub exec_time_us: u64,
    /// Discarded by this executor; kept so callers can rely on the field.
    pub stdout: Vec<u8>,
    /// Truncated to `stderr_max_len`.
    pub stderr: Vec<u8>,
    /// Snapshot of the coverage bitmap, independent of the live region.
    pub coverage: Option<Vec<u8>>,
}

/// Spawns the instrumented target and collects coverage through a shared
/// System-V segment. Owns the segment and the temp input path; both are
/// released by `cleanup`, which also runs on drop.
#[derive(Debug)]
pub struct Executor {
    target: PathBuf,
    args_template: Vec<String>,
    file_input: bool,
    timeout: Duration,
    mem_limit_mb: u64,
    stderr_max_len: usize,
    temp_dir: PathBuf,
    input_path: PathBuf,
    stderr_path: PathBuf,
    shm: SharedBitmap,
    bwrap: Option<PathBuf>,
    asan_options: String,
}

impl Executor {
    pub fn new(config: &Config) -> GrizzlyResult<Self> {
        let target = config.target.clone();
        let meta = std::fs::metadata(&target).map_err(|err| GrizzlyError::Spawn {
            target: target.clone(),
            reason: err.to_string(),
        })?;
        if !meta.is_file() {
            return Err(GrizzlyError::Spawn {
                target,
                reason: "not a regular file".to_string(),
            });
        }

        let args_template: Vec<String> =
            config.args.split_whitespace().map(str::to_string).collect();
        let file_input = args_template.iter().any(|a| a.contains("@@"));

        let temp_dir = tmpfs_root().join(format!("grizzly-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&temp_dir)?;

        let shm = SharedBitmap::create(config.bitmap_size)?;
        tracing::info!(
            shm_id = shm.id(),
            size = config.bitmap_size,
            temp_dir = %temp_dir.display(),
            "executor ready"
        );

        let bwrap = if config.use_sandbox {
            match find_in_path("bwrap") {
                Some(path) => {
                    tracing::info!(bwrap = %path.display(), "sandbox enabled");
                    Some(path)
                }
                None => {
                    tracing::warn!("use_sandbox enabled but bwrap not found; running unsandboxed");
                    None
                }
            }
        } else {
            None
        };

        // Required flags are appended after any caller-provided options so
        // they win on conflict.
        let asan_options = match std::env::var("ASAN_OPTIONS") {
            Ok(existing) if !existing.is_empty() => format!("{existing}:{ASAN_OPTIONS}"),
            _ => ASAN_OPTIONS.to_string(),
        };

        Ok(Self {
            target,
            args_template,
            file_input,
            timeout: Duration::from_secs_f64(config.timeout),
            mem_limit_mb: config.mem_limit,
            stderr_max_len: config.stderr_max_len,
            input_path: temp_dir.join("input"),
            stderr_path: temp_dir.join("stderr"),
            temp_dir,
            shm,
            bwrap,
            asan_options,
        })
    }

    pub fn bitmap_size(&self) -> usize {
        self.shm.size()
    }

    /// Run the target once on `input`.
    ///
    /// Only an unspawnable target is an error; everything the child does is
    /// reported in the result.
    pub fn execute(&mut self, input: &[u8]) -> GrizzlyResult<ExecutionResult> {
        self.shm.clear();

        if self.file_input {
            std::fs::write(&self.input_path, input)?;
        }

        let mut cmd = self.build_command();
        let stderr_file = File::create(&self.stderr_path)?;
        cmd.stdin(if self.file_input { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file));

        let mem_bytes = self.mem_limit_mb.saturating_mul(1024 * 1024);
        unsafe {
            cmd.pre_exec(move || {
                // Own session => own process group, so a timeout SIGKILL
                // reaches every descendant.
                libc::setsid();
                let mem = libc::rlimit {
                    rlim_cur: mem_bytes,
                    rlim_max: mem_bytes,
                };
                // Best effort; unsupported platforms simply skip the limit.
                libc::setrlimit(libc::RLIMIT_AS, &mem);
                let core = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                libc::setrlimit(libc::RLIMIT_CORE, &core);
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|err| GrizzlyError::Spawn {
            target: self.target.clone(),
            reason: err.to_string(),
        })?;

        if !self.file_input {
            if let Some(mut stdin) = child.stdin.take() {
                // The child may exit before reading everything (EPIPE); that
                // is its business, not ours.
                let _ = stdin.write_all(input);
            }
        }

        let (status, hanged) = self.wait_with_timeout(&mut child)?;
        let exec_time_us = started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;

        let coverage = self.shm.snapshot();
        let stderr = self.read_stderr();

        let exit_code = status.code().unwrap_or(-1);
        let signal = status.signal();
        let crashed = !hanged
            && (exit_code == ASAN_EXIT_CODE
                || signal.is_some_and(|s| CRASH_SIGNALS.contains(&s))
                || exit_code >= 128);

        Ok(ExecutionResult {
            exit_code,
            signal,
            crashed,
            hanged,
            exec_time_us,
            stdout: Vec::new(),
            stderr,
            coverage: Some(coverage),
        })
    }

    /// Release the shared segment and the temp directory. Idempotent.
    pub fn cleanup(&mut self) {
        self.shm.destroy();
        if self.temp_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.temp_dir) {
                tracing::warn!(dir = %self.temp_dir.display(), "temp dir cleanup failed: {err}");
            }
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = match &self.bwrap {
            Some(bwrap) => {
                let mut c = Command::new(bwrap);
                c.args(["--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc"])
                    .arg("--bind")
                    .arg(&self.temp_dir)
                    .arg(&self.temp_dir)
                    .args(["--unshare-pid", "--die-with-parent", "--new-session", "--"])
                    .arg(&self.target);
                c
            }
            None => Command::new(&self.target),
        };

        let input_path = self.input_path.to_string_lossy();
        for arg in &self.args_template {
            if arg.contains("@@") {
                cmd.arg(arg.replace("@@", &input_path));
            } else {
                cmd.arg(arg);
            }
        }

        cmd.current_dir(&self.temp_dir)
            .env("__AFL_SHM_ID", self.shm.id().to_string())
            .env("AFL_NO_FORKSRV", "1")
            .env("ASAN_OPTIONS", &self.asan_options);
        cmd
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
    ) -> GrizzlyResult<(std::process::ExitStatus, bool)> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((status, false));
            }
            if Instant::now() >= deadline {
                // setsid in pre_exec makes the child's pid its pgid.
                unsafe {
                    libc::killpg(child.id() as i32, libc::SIGKILL);
                }
                let status = child.wait()?;
                return Ok((status, true));
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn read_stderr(&self) -> Vec<u8> {
        match std::fs::read(&self.stderr_path) {
            Ok(mut bytes) => {
                bytes.truncate(self.stderr_max_len);
                bytes
            }
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Temp files live on tmpfs when one is mounted; input staging is on the
/// hot path.
fn tmpfs_root() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_in_path_resolves_the_shell() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("grizzly-definitely-not-a-binary").is_none());
    }

    #[test]
    fn crash_signal_set_matches_fault_signals() {
        for sig in [libc::SIGSEGV, libc::SIGABRT, libc::SIGBUS, libc::SIGILL, libc::SIGFPE] {
            assert!(CRASH_SIGNALS.contains(&sig));
        }
        assert!(!CRASH_SIGNALS.contains(&libc::SIGKILL));
        assert!(!CRASH_SIGNALS.contains(&libc::SIGTERM));
    }
}
