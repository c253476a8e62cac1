//! Unique-set collection: fixed-bucket chained hash of `Node` records where
//! the payload is both identity and value.
//!
//! Built on `hashcommon`'s per-bucket singly-linked chains.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use crate::clock::now_ns;
use crate::entry::{fnv1a32, node_record_size, NodeHeader, State, SENTINEL};
use crate::error::Result;
use crate::hashcommon::{bucket_index, bucket_slot_ptr, ensure_buckets, read_consistent};
use crate::segment::layout::CollectionKind;
use crate::segment::{Segment, DEFAULT_INITIAL_SIZE};
use crate::stats::{stats_of_segment, Stats};

pub const DEFAULT_BUCKET_COUNT: u32 = 1 << 14;

pub struct Set {
    segment: Segment,
    bucket_count: u32,
    buckets_offset: i64,
}

impl Set {
    pub fn open(path: &Path, initial_size_bytes: u64, create_new: bool, bucket_count: u32) -> Result<Set> {
        let bucket_count = bucket_count.max(2).next_power_of_two();
        let segment = Segment::create_or_open(path, initial_size_bytes, create_new, CollectionKind::Set, bucket_count)?;
        let buckets_offset = {
            let lock = segment.structural_lock();
            let _guard = lock.write();
            ensure_buckets(&segment, segment.header().bucket_count, "set_buckets")?
        };
        let bucket_count = segment.header().bucket_count;
        Ok(Set {
            segment,
            bucket_count,
            buckets_offset,
        })
    }

    pub fn create(path: &Path) -> Result<Set> {
        Self::open(path, DEFAULT_INITIAL_SIZE, true, DEFAULT_BUCKET_COUNT)
    }

    /// Inserts `payload` with the given TTL if no live entry matches it
    /// (refreshing an expired entry in place). Returns `true` if an
    /// insertion/refresh happened, `false` if an equal live entry already
    /// existed.
    pub fn add(&self, payload: &[u8], ttl_seconds: i32) -> Result<bool> {
        let hash = fnv1a32(payload);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();
        let now = now_ns();

        let mut cur = slot.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *mut NodeHeader;
            let node = unsafe { &*node_ptr };
            if node.entry.hash == hash && node.entry.load_state() != State::Empty {
                let data_size = node.entry.data_size as usize;
                let existing =
                    unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr), data_size) };
                if existing == payload {
                    if node.entry.is_alive(now) {
                        return Ok(false);
                    }
                    unsafe {
                        node.entry.set_ttl(ttl_seconds, now);
                    }
                    node.entry.state.store(State::Valid as u32, Ordering::Release);
                    return Ok(true);
                }
            }
            cur = node.next_offset.load(Ordering::Acquire);
        }

        let size = node_record_size(payload.len());
        let offset = self.segment.allocate(size)?;
        let node_ptr = self.segment.resolve(offset) as *mut NodeHeader;
        unsafe {
            NodeHeader::init_empty(node_ptr);
            (*node_ptr).entry.force_writing();
            let payload_ptr = NodeHeader::payload_ptr(node_ptr);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), payload_ptr, payload.len());
            (*node_ptr).entry.publish(payload.len() as u32, hash, ttl_seconds, now);
            let old_head = slot.head_offset.load(Ordering::Acquire);
            (*node_ptr).next_offset.store(old_head, Ordering::Relaxed);
            (*node_ptr).prev_offset.store(SENTINEL, Ordering::Relaxed);
        }
        slot.head_offset.store(offset, Ordering::Release);
        slot.count.fetch_add(1, Ordering::Relaxed);
        self.segment.header().element_count.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Lock-free optimistic read: true if a live entry equal to `payload`
    /// exists.
    pub fn contains(&self, payload: &[u8]) -> bool {
        let hash = fnv1a32(payload);
        let idx = bucket_index(hash, self.bucket_count);
        let _ = self.segment.sync_mapping();
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let now = now_ns();

        let mut cur = slot.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *mut NodeHeader;
            let node = unsafe { &*node_ptr };
            if node.entry.hash == hash {
                let matched = read_consistent(&node.entry, now, || {
                    let data_size = node.entry.data_size as usize;
                    let existing =
                        unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr), data_size) };
                    existing == payload
                });
                if matched == Some(true) {
                    return true;
                }
            }
            cur = node.next_offset.load(Ordering::Acquire);
        }
        false
    }

    pub fn remove(&self, payload: &[u8]) -> Result<bool> {
        let hash = fnv1a32(payload);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();

        let mut prev: i64 = SENTINEL;
        let mut cur = slot.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *mut NodeHeader;
            let node = unsafe { &*node_ptr };
            let next = node.next_offset.load(Ordering::Acquire);
            if node.entry.hash == hash && node.entry.load_state() == State::Valid {
                let data_size = node.entry.data_size as usize;
                let existing =
                    unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr), data_size) };
                if existing == payload {
                    if prev == SENTINEL {
                        slot.head_offset.store(next, Ordering::Release);
                    } else {
                        let prev_node = unsafe { &*(self.segment.resolve(prev) as *const NodeHeader) };
                        prev_node.next_offset.store(next, Ordering::Release);
                    }
                    node.entry.mark_deleted();
                    slot.count.fetch_sub(1, Ordering::Relaxed);
                    self.segment.deallocate(cur, node_record_size(data_size));
                    self.segment.header().element_count.fetch_sub(1, Ordering::Relaxed);
                    return Ok(true);
                }
            }
            prev = cur;
            cur = next;
        }
        Ok(false)
    }

    /// Sweeps every bucket, physically unlinking expired/deleted entries.
    /// Returns the number removed.
    pub fn remove_expired(&self) -> Result<usize> {
        self.segment.sync_mapping()?;
        let now = now_ns();
        let mut total = 0usize;
        for idx in 0..self.bucket_count {
            let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
            let _guard = slot.mutex().lock();
            let mut prev: i64 = SENTINEL;
            let mut cur = slot.head_offset.load(Ordering::Acquire);
            while cur != SENTINEL {
                let node_ptr = self.segment.resolve(cur) as *mut NodeHeader;
                let node = unsafe { &*node_ptr };
                let next = node.next_offset.load(Ordering::Acquire);
                let state = node.entry.load_state();
                let stale = state == State::Deleted
                    || state == State::Expired
                    || (state == State::Valid && !node.entry.is_alive(now));
                if stale {
                    if state == State::Valid {
                        node.entry.mark_expired_hint();
                    }
                    if prev == SENTINEL {
                        slot.head_offset.store(next, Ordering::Release);
                    } else {
                        let prev_node = unsafe { &*(self.segment.resolve(prev) as *const NodeHeader) };
                        prev_node.next_offset.store(next, Ordering::Release);
                    }
                    slot.count.fetch_sub(1, Ordering::Relaxed);
                    self.segment
                        .deallocate(cur, node_record_size(node.entry.data_size as usize));
                    self.segment.header().element_count.fetch_sub(1, Ordering::Relaxed);
                    total += 1;
                    cur = next;
                    continue;
                }
                prev = cur;
                cur = next;
            }
        }
        Ok(total)
    }

    /// Live count; O(n).
    pub fn size(&self) -> usize {
        let _ = self.segment.sync_mapping();
        let now = now_ns();
        let mut total = 0usize;
        for idx in 0..self.bucket_count {
            let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
            let mut cur = slot.head_offset.load(Ordering::Acquire);
            while cur != SENTINEL {
                let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
                if node.entry.is_alive(now) {
                    total += 1;
                }
                cur = node.next_offset.load(Ordering::Acquire);
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) -> Result<()> {
        self.segment.sync_mapping()?;
        for idx in 0..self.bucket_count {
            let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
            let _guard = slot.mutex().lock();
            let mut cur = slot.head_offset.load(Ordering::Acquire);
            while cur != SENTINEL {
                let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
                let next = node.next_offset.load(Ordering::Acquire);
                let data_size = node.entry.data_size as usize;
                node.entry.mark_deleted();
                self.segment.deallocate(cur, node_record_size(data_size));
                cur = next;
            }
            slot.head_offset.store(SENTINEL, Ordering::Release);
            slot.count.store(0, Ordering::Relaxed);
        }
        self.segment.header().element_count.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn filename(&self) -> &Path {
        self.segment.path()
    }

    pub fn flush(&self) -> Result<()> {
        self.segment.flush()
    }

    pub fn stats(&self) -> Stats {
        stats_of_segment(&self.segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "persist_collections_set_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn add_dedupes_and_contains_finds_it() {
        let path = temp_path("dedup");
        let _ = std::fs::remove_file(&path);
        let set = Set::open(&path, 1 << 20, true, 16).unwrap();
        assert!(set.add(b"id-1", -1).unwrap());
        assert!(!set.add(b"id-1", -1).unwrap());
        assert!(set.contains(b"id-1"));
        assert_eq!(set.size(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn remove_then_contains_false() {
        let path = temp_path("remove");
        let _ = std::fs::remove_file(&path);
        let set = Set::open(&path, 1 << 20, true, 16).unwrap();
        set.add(b"x", -1).unwrap();
        assert!(set.remove(b"x").unwrap());
        assert!(!set.contains(b"x"));
        assert_eq!(set.size(), 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn expiry_excludes_from_size_and_contains() {
        let path = temp_path("expiry");
        let _ = std::fs::remove_file(&path);
        let set = Set::open(&path, 1 << 20, true, 16).unwrap();
        set.add(b"temp", 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!set.contains(b"temp"));
        assert_eq!(set.size(), 0);
        assert_eq!(set.remove_expired().unwrap(), 1);
        std::fs::remove_file(&path).unwrap();
    }
}
