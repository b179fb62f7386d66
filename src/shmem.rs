//! System-V shared-memory coverage channel.
//!
//! The fuzzer allocates one segment per executor, zeroes it before every run,
//! and passes its id to the instrumented child through `__AFL_SHM_ID`. The
//! child's instrumentation bumps one byte per edge hit; after `wait()` the
//! parent takes an immutable snapshot for novelty detection.

use crate::{GrizzlyError, GrizzlyResult};

/// Hit-count bucket lookup, one byte in -> canonical bucket byte out.
///
/// Buckets: 0, 1, 2, 3, 4-7, 8-15, 16-31, 32-127, 128-255 map to
/// 0, 1, 2, 4, 8, 16, 32, 64, 128. Collapsing raw counts this way keeps
/// "one more loop iteration on a hot edge" from registering as novelty.
const COUNT_CLASS_LOOKUP: [u8; 256] = build_count_class_lookup();

const fn build_count_class_lookup() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 1usize;
    while i < 256 {
        table[i] = match i {
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        };
        i += 1;
    }
    table
}

/// In-place bucketization of a raw trace. Idempotent.
pub fn classify_counts(trace: &mut [u8]) {
    for byte in trace.iter_mut() {
        *byte = COUNT_CLASS_LOOKUP[*byte as usize];
    }
}

/// Population count over a bitmap.
pub fn count_bits(map: &[u8]) -> u32 {
    map.iter().map(|b| b.count_ones()).sum()
}

/// An attached System-V shared memory segment of fixed size.
///
/// The parent owns the segment exclusively; the child writes to it while
/// running and the parent only reads after `wait()`, so no synchronization
/// is needed. Destruction is idempotent and also runs on drop, covering
/// every exit path of the owning process.
#[derive(Debug)]
pub struct SharedBitmap {
    id: i32,
    addr: *mut u8,
    size: usize,
}

impl SharedBitmap {
    pub fn create(size: usize) -> GrizzlyResult<Self> {
        if size == 0 {
            return Err(GrizzlyError::Shm("bitmap size must be non-zero".to_string()));
        }

        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(GrizzlyError::Shm(format!(
                "shmget failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr == usize::MAX as *mut libc::c_void {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
            return Err(GrizzlyError::Shm(format!("shmat failed: {err}")));
        }

        let mut shm = Self {
            id,
            addr: addr as *mut u8,
            size,
        };
        shm.clear();
        Ok(shm)
    }

    /// Segment id, stringified into the child environment.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Zero the live region. Called before every execution.
    pub fn clear(&mut self) {
        if !self.addr.is_null() {
            unsafe { std::ptr::write_bytes(self.addr, 0, self.size) };
        }
    }

    /// Copy the live region into an owned snapshot, independent of later runs.
    pub fn snapshot(&self) -> Vec<u8> {
        if self.addr.is_null() {
            return vec![0u8; self.size];
        }
        unsafe { std::slice::from_raw_parts(self.addr, self.size) }.to_vec()
    }

    /// Detach and remove the segment. Safe to call more than once.
    pub fn destroy(&mut self) {
        if !self.addr.is_null() {
            unsafe {
                libc::shmdt(self.addr as *const libc::c_void);
            }
            self.addr = std::ptr::null_mut();
        }
        if self.id >= 0 {
            unsafe {
                libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            }
            self.id = -1;
        }
    }
}

impl Drop for SharedBitmap {
    fn drop(&mut self) {
        self.destroy();
    }
}

// The attached pointer is only ever touched from the owning thread, but the
// executor that owns it may be moved across threads by tests.
unsafe impl Send for SharedBitmap {}
