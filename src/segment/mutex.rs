//! Cross-process exclusive mutex using POSIX `pthread_mutex_t` with the
//! `PTHREAD_PROCESS_SHARED` attribute. One of these is embedded in every
//! hash-engine bucket; the hash engine's write path is exclusive-only (no
//! readers ever block on it — reads are lock-free), so a plain mutex is
//! used rather than a `ProcessRwLock`.

use std::io;

/// Bytes reserved per bucket for its mutex. `pthread_mutex_t` is ~40 bytes
/// on glibc/x86_64; this leaves headroom for other libcs while staying
/// small enough that a large bucket array doesn't bloat the segment.
pub const MUTEX_SIZE: usize = 64;

pub struct ProcessMutex {
    mutex_ptr: *mut libc::pthread_mutex_t,
}

unsafe impl Send for ProcessMutex {}
unsafe impl Sync for ProcessMutex {}

impl ProcessMutex {
    /// # Safety
    /// `ptr` must point to at least `size_of::<pthread_mutex_t>()` bytes of
    /// shared memory that are zeroed or uninitialized.
    pub unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
        let mutex_ptr = ptr as *mut libc::pthread_mutex_t;

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let ret = libc::pthread_mutexattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }
        let ret = libc::pthread_mutex_init(mutex_ptr, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(ProcessMutex { mutex_ptr })
    }

    /// # Safety
    /// `ptr` must point to a previously `init`-ed `pthread_mutex_t` in
    /// shared memory.
    pub unsafe fn from_existing(ptr: *mut u8) -> Self {
        ProcessMutex {
            mutex_ptr: ptr as *mut libc::pthread_mutex_t,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_> {
        unsafe {
            let ret = libc::pthread_mutex_lock(self.mutex_ptr);
            debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
        }
        MutexGuard(self)
    }

    fn unlock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_unlock(self.mutex_ptr);
            debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
        }
    }

    /// # Safety
    /// Only call when no other process holds or will acquire this mutex.
    pub unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.mutex_ptr);
    }
}

pub struct MutexGuard<'a>(&'a ProcessMutex);

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}
