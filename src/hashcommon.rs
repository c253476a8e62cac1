//! Bucket array and chain-walk primitives shared by `set` and `map`.
//!
//! A chained-bucket design: each bucket owns its own exclusive mutex and a
//! singly-linked chain of `Node` (Set) or `KeyValue` (Map) records. The
//! read path stays lock-free, using the version-recheck protocol described
//! in `DESIGN.md` for the in-place-update race.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::entry::SENTINEL;
use crate::error::Result;
use crate::segment::mutex::{ProcessMutex, MUTEX_SIZE};
use crate::segment::Segment;

#[repr(C)]
pub struct BucketSlot {
    mutex_bytes: [u8; MUTEX_SIZE],
    pub head_offset: AtomicI64,
    pub count: AtomicU32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<BucketSlot>() == MUTEX_SIZE + 16);

impl BucketSlot {
    /// # Safety
    /// `ptr` must point to zeroed, writable memory of at least
    /// `size_of::<BucketSlot>()` bytes.
    pub unsafe fn init(ptr: *mut BucketSlot) -> Result<()> {
        std::ptr::write_bytes(ptr as *mut u8, 0, std::mem::size_of::<BucketSlot>());
        ProcessMutex::init(ptr as *mut u8).map_err(|e| crate::error::Error::file("<bucket>", e))?;
        (*ptr).head_offset.store(SENTINEL, Ordering::Relaxed);
        (*ptr).count.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn mutex(&self) -> ProcessMutex {
        unsafe { ProcessMutex::from_existing(self as *const BucketSlot as *mut u8) }
    }
}

/// Ensures the bucket array named object exists, returning its offset.
/// Callers must hold the segment's structural write lock. `name` is the
/// engine-specific directory name ("map_buckets" or "set_buckets") so a
/// file's directory records which engine's layout a bucket array belongs to.
pub fn ensure_buckets(segment: &Segment, bucket_count: u32, name: &str) -> Result<i64> {
    let slot_size = std::mem::size_of::<BucketSlot>();
    let total = bucket_count as usize * slot_size;
    segment.find_or_construct_bytes(name, total, move |base| {
        for i in 0..bucket_count as usize {
            let slot_ptr = unsafe { base.add(i * slot_size) } as *mut BucketSlot;
            unsafe { BucketSlot::init(slot_ptr)? };
        }
        Ok(())
    })
}

pub fn bucket_slot_ptr(segment: &Segment, buckets_offset: i64, bucket_index: u32) -> *mut BucketSlot {
    let slot_size = std::mem::size_of::<BucketSlot>();
    unsafe {
        segment
            .resolve(buckets_offset)
            .add(bucket_index as usize * slot_size) as *mut BucketSlot
    }
}

pub fn bucket_index(hash: u32, bucket_count: u32) -> u32 {
    debug_assert!(bucket_count.is_power_of_two());
    hash & (bucket_count - 1)
}

/// Bounded retry count for the optimistic read path's version re-check.
pub const READ_RETRY_LIMIT: u32 = 8;

/// Runs `read` under the version-recheck protocol resolved for in-place
/// updates: snapshot `version`, confirm `state == Valid`, run `read`,
/// re-snapshot `version`. A stable pair of snapshots with a live entry
/// yields `Some(value)`; an entry that isn't Valid/alive yields `None`;
/// a torn read (version changed mid-read) retries up to
/// `READ_RETRY_LIMIT` times before giving up with `None`. A caller that
/// gets `None` back after exhausting retries should treat the entry as
/// "currently unreadable," not "absent" — for all practical bucket-lock
/// hold times this is unreachable outside pathological contention.
pub fn read_consistent<T>(
    entry: &crate::entry::EntryHeader,
    now_ns: u64,
    mut read: impl FnMut() -> T,
) -> Option<T> {
    use crate::entry::State;
    for _ in 0..READ_RETRY_LIMIT {
        let v0 = entry.version.load(Ordering::Acquire);
        if entry.load_state() != State::Valid {
            return None;
        }
        let value = read();
        let alive = entry.is_alive(now_ns);
        let v1 = entry.version.load(Ordering::Acquire);
        if v0 == v1 {
            return if alive { Some(value) } else { None };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::layout::CollectionKind;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "persist_collections_hashcommon_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn bucket_index_masks_to_power_of_two() {
        assert_eq!(bucket_index(0b1010_1010, 16), 0b1010);
        assert_eq!(bucket_index(7, 8), 7);
    }

    #[test]
    fn ensure_buckets_is_idempotent_and_initializes_slots() {
        let path = temp_path("ensure_buckets");
        let _ = std::fs::remove_file(&path);
        let segment = Segment::create(&path, 1 << 20, CollectionKind::Map, 16).unwrap();
        let lock = segment.structural_lock();
        lock.write_lock();
        let off1 = ensure_buckets(&segment, 16, "map_buckets").unwrap();
        let off2 = ensure_buckets(&segment, 16, "map_buckets").unwrap();
        lock.write_unlock();
        assert_eq!(off1, off2);
        let slot = unsafe { &*bucket_slot_ptr(&segment, off1, 0) };
        assert_eq!(slot.head_offset.load(Ordering::Relaxed), SENTINEL);
        std::fs::remove_file(&path).unwrap();
    }
}
