//! Cross-process reader/writer lock using POSIX `pthread_rwlock_t` with the
//! `PTHREAD_PROCESS_SHARED` attribute.
//!
//! The lock lives in shared memory so it is visible to every process that
//! maps the segment, unlike a `std::sync::RwLock` which is only valid
//! within one process's address space. Used for each collection header's
//! structural lock (Sequence, Queue, Stack rare-ops, Segment growth).

use std::io;

/// Bytes reserved for the lock in the segment.
/// `pthread_rwlock_t` is 56 bytes on x86_64 Linux, up to ~200 bytes on
/// other libcs (e.g. macOS); over-allocate to stay safe across platforms.
/// Only one of these exists per collection header, so the margin costs
/// nothing at scale.
pub const LOCK_SIZE: usize = 256;

pub struct ProcessRwLock {
    lock_ptr: *mut libc::pthread_rwlock_t,
}

unsafe impl Send for ProcessRwLock {}
unsafe impl Sync for ProcessRwLock {}

impl ProcessRwLock {
    /// Initialize a new rwlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<pthread_rwlock_t>()` bytes of
    /// shared memory that are zeroed or uninitialized.
    pub unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
        let lock_ptr = ptr as *mut libc::pthread_rwlock_t;

        let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
        let ret = libc::pthread_rwlockattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        let ret = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_rwlockattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }
        let ret = libc::pthread_rwlock_init(lock_ptr, &attr);
        libc::pthread_rwlockattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(ProcessRwLock { lock_ptr })
    }

    /// Attach to an already-initialized rwlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to a previously `init`-ed `pthread_rwlock_t` in
    /// shared memory.
    pub unsafe fn from_existing(ptr: *mut u8) -> Self {
        ProcessRwLock {
            lock_ptr: ptr as *mut libc::pthread_rwlock_t,
        }
    }

    pub fn read_lock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_rdlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_rdlock failed: {ret}");
        }
    }

    pub fn read_unlock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_unlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_unlock failed: {ret}");
        }
    }

    pub fn write_lock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_wrlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_wrlock failed: {ret}");
        }
    }

    pub fn write_unlock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_unlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_unlock failed: {ret}");
        }
    }

    /// # Safety
    /// Only call when no other process holds or will acquire this lock.
    pub unsafe fn destroy(&self) {
        libc::pthread_rwlock_destroy(self.lock_ptr);
    }
}

/// RAII write-guard, mirroring `std::sync::RwLockWriteGuard` ergonomics.
pub struct WriteGuard<'a>(&'a ProcessRwLock);

impl ProcessRwLock {
    pub fn write(&self) -> WriteGuard<'_> {
        self.write_lock();
        WriteGuard(self)
    }

    pub fn read(&self) -> ReadGuard<'_> {
        self.read_lock();
        ReadGuard(self)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.write_unlock();
    }
}

pub struct ReadGuard<'a>(&'a ProcessRwLock);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.read_unlock();
    }
}
