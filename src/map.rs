//! Key-value map: fixed-bucket chained hash of `KeyValue` records, keyed by
//! an arbitrary byte string with an independent byte-string value.
//!
//! Shares its bucket-array/mutex/read-consistency machinery with `set`
//! (see `hashcommon`); the difference is the record shape (`KeyValue`
//! carries key and value lengths rather than a single payload length) and
//! the richer API (`put_if_absent`, `replace_if_value_matches`, etc.)
//! required for map semantics.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use crate::clock::now_ns;
use crate::entry::{fnv1a32, kv_record_size, KeyValueHeader, State, SENTINEL};
use crate::error::{Error, Result};
use crate::hashcommon::{bucket_index, bucket_slot_ptr, ensure_buckets, read_consistent};
use crate::segment::layout::CollectionKind;
use crate::segment::{Segment, DEFAULT_INITIAL_SIZE};
use crate::stats::{stats_of_segment, Stats};

pub const DEFAULT_BUCKET_COUNT: u32 = 1 << 14;

pub struct Map {
    segment: Segment,
    bucket_count: u32,
    buckets_offset: i64,
}

/// Owned key+value bytes returned by `get`.
pub type Entry = (Vec<u8>, Vec<u8>);

impl Map {
    pub fn open(path: &Path, initial_size_bytes: u64, create_new: bool, bucket_count: u32) -> Result<Map> {
        let bucket_count = bucket_count.max(2).next_power_of_two();
        let segment = Segment::create_or_open(path, initial_size_bytes, create_new, CollectionKind::Map, bucket_count)?;
        let buckets_offset = {
            let lock = segment.structural_lock();
            let _guard = lock.write();
            ensure_buckets(&segment, segment.header().bucket_count, "map_buckets")?
        };
        let bucket_count = segment.header().bucket_count;
        Ok(Map {
            segment,
            bucket_count,
            buckets_offset,
        })
    }

    pub fn create(path: &Path) -> Result<Map> {
        Self::open(path, DEFAULT_INITIAL_SIZE, true, DEFAULT_BUCKET_COUNT)
    }

    /// Inserts or overwrites `key` -> `value` with the given TTL.
    pub fn put(&self, key: &[u8], value: &[u8], ttl_seconds: i32) -> Result<()> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();
        let now = now_ns();

        if let (offset, Some(kv_ptr)) = self.find_in_chain_locked(slot, key, hash) {
            let kv = unsafe { &*kv_ptr };
            if value.len() as u32 == kv.value_size && kv.key_size as usize == key.len() {
                unsafe {
                    let value_ptr = KeyValueHeader::value_ptr(kv_ptr, kv.key_size as usize);
                    std::ptr::copy_nonoverlapping(value.as_ptr(), value_ptr, value.len());
                    kv.entry.set_ttl(ttl_seconds, now);
                }
                return Ok(());
            }
            self.unlink_and_free(slot, offset, kv_ptr);
        }
        self.insert_new(slot, key, value, hash, ttl_seconds, now)
    }

    /// Inserts only if `key` has no live entry; returns `false` without
    /// modifying the map if one already exists. An expired entry for `key`
    /// is physically evicted first, then the new value is inserted.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8], ttl_seconds: i32) -> Result<bool> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();
        let now = now_ns();

        if self.find_in_chain_locked(slot, key, hash).1.is_some() {
            return Ok(false);
        }
        // `find_in_chain_locked` only matches live entries, so a matching
        // key that is merely expired-but-not-yet-swept isn't returned
        // above; look again, ignoring liveness, and evict it before insert.
        if let Some(offset) = self.find_stale_in_chain_locked(slot, key, hash) {
            let kv_ptr = self.segment.resolve(offset) as *mut KeyValueHeader;
            self.unlink_and_free(slot, offset, kv_ptr);
        }
        self.insert_new(slot, key, value, hash, ttl_seconds, now)?;
        Ok(true)
    }

    /// Finds `key`'s record in the chain regardless of liveness (expired or
    /// deleted), for callers that need to evict a stale slot before insert.
    fn find_stale_in_chain_locked(&self, slot: &crate::hashcommon::BucketSlot, key: &[u8], hash: u32) -> Option<i64> {
        let mut cur = slot.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let kv_ptr = self.segment.resolve(cur) as *mut KeyValueHeader;
            let kv = unsafe { &*kv_ptr };
            let next = kv.next_offset.load(Ordering::Acquire);
            if kv.entry.hash == hash && kv.entry.load_state() != State::Deleted {
                let key_size = kv.key_size as usize;
                let existing_key = unsafe { std::slice::from_raw_parts(KeyValueHeader::key_ptr(kv_ptr), key_size) };
                if existing_key == key {
                    return Some(cur);
                }
            }
            cur = next;
        }
        None
    }

    fn find_in_chain_locked(
        &self,
        slot: &crate::hashcommon::BucketSlot,
        key: &[u8],
        hash: u32,
    ) -> (i64, Option<*mut KeyValueHeader>) {
        let now = now_ns();
        let mut cur = slot.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let kv_ptr = self.segment.resolve(cur) as *mut KeyValueHeader;
            let kv = unsafe { &*kv_ptr };
            let next = kv.next_offset.load(Ordering::Acquire);
            if kv.entry.hash == hash && kv.entry.load_state() == State::Valid && kv.entry.is_alive(now) {
                let key_size = kv.key_size as usize;
                let existing_key = unsafe { std::slice::from_raw_parts(KeyValueHeader::key_ptr(kv_ptr), key_size) };
                if existing_key == key {
                    return (cur, Some(kv_ptr));
                }
            }
            cur = next;
        }
        (SENTINEL, None)
    }

    fn unlink_and_free(&self, slot: &crate::hashcommon::BucketSlot, offset: i64, kv_ptr: *mut KeyValueHeader) {
        let kv = unsafe { &*kv_ptr };
        let next = kv.next_offset.load(Ordering::Acquire);
        let prev = kv.prev_offset.load(Ordering::Acquire);
        if prev == SENTINEL {
            slot.head_offset.store(next, Ordering::Release);
        } else {
            let prev_kv = unsafe { &*(self.segment.resolve(prev) as *const KeyValueHeader) };
            prev_kv.next_offset.store(next, Ordering::Release);
        }
        if next != SENTINEL {
            let next_kv = unsafe { &*(self.segment.resolve(next) as *const KeyValueHeader) };
            next_kv.prev_offset.store(prev, Ordering::Release);
        }
        kv.entry.mark_deleted();
        slot.count.fetch_sub(1, Ordering::Relaxed);
        let size = kv_record_size(kv.key_size as usize, kv.value_size as usize);
        self.segment.deallocate(offset, size);
        self.segment.header().element_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn insert_new(
        &self,
        slot: &crate::hashcommon::BucketSlot,
        key: &[u8],
        value: &[u8],
        hash: u32,
        ttl_seconds: i32,
        now: u64,
    ) -> Result<()> {
        let size = kv_record_size(key.len(), value.len());
        let offset = self.segment.allocate(size)?;
        let kv_ptr = self.segment.resolve(offset) as *mut KeyValueHeader;
        unsafe {
            KeyValueHeader::init_empty(kv_ptr);
            (*kv_ptr).entry.force_writing();
            (*kv_ptr).key_size = key.len() as u32;
            (*kv_ptr).value_size = value.len() as u32;
            let key_ptr = KeyValueHeader::key_ptr(kv_ptr);
            std::ptr::copy_nonoverlapping(key.as_ptr(), key_ptr, key.len());
            let value_ptr = KeyValueHeader::value_ptr(kv_ptr, key.len());
            std::ptr::copy_nonoverlapping(value.as_ptr(), value_ptr, value.len());
            let payload_size = key.len() + value.len();
            (*kv_ptr).entry.publish(payload_size as u32, hash, ttl_seconds, now);
            let old_head = slot.head_offset.load(Ordering::Acquire);
            (*kv_ptr).next_offset.store(old_head, Ordering::Relaxed);
            (*kv_ptr).prev_offset.store(SENTINEL, Ordering::Relaxed);
            if old_head != SENTINEL {
                let old_head_kv = &*(self.segment.resolve(old_head) as *const KeyValueHeader);
                old_head_kv.prev_offset.store(offset, Ordering::Relaxed);
            }
        }
        slot.head_offset.store(offset, Ordering::Release);
        slot.count.fetch_add(1, Ordering::Relaxed);
        self.segment.header().element_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Lock-free read of the value for `key`, if a live entry exists.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        let _ = self.segment.sync_mapping();
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let now = now_ns();

        let mut cur = slot.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let kv_ptr = self.segment.resolve(cur) as *mut KeyValueHeader;
            let kv = unsafe { &*kv_ptr };
            if kv.entry.hash == hash {
                let result = read_consistent(&kv.entry, now, || {
                    let key_size = kv.key_size as usize;
                    let existing_key =
                        unsafe { std::slice::from_raw_parts(KeyValueHeader::key_ptr(kv_ptr), key_size) };
                    if existing_key == key {
                        let value_size = kv.value_size as usize;
                        Some(unsafe {
                            std::slice::from_raw_parts(KeyValueHeader::value_ptr(kv_ptr, key_size), value_size)
                                .to_vec()
                        })
                    } else {
                        None
                    }
                });
                if let Some(Some(value)) = result {
                    return Some(value);
                }
            }
            cur = kv.next_offset.load(Ordering::Acquire);
        }
        None
    }

    pub fn get_or_err(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get(key).ok_or(Error::NotFound)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// O(n) scan across live values; no secondary value index is maintained.
    pub fn contains_value(&self, value: &[u8]) -> bool {
        let _ = self.segment.sync_mapping();
        let now = now_ns();
        for idx in 0..self.bucket_count {
            let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
            let mut cur = slot.head_offset.load(Ordering::Acquire);
            while cur != SENTINEL {
                let kv_ptr = self.segment.resolve(cur) as *mut KeyValueHeader;
                let kv = unsafe { &*kv_ptr };
                if kv.entry.is_alive(now) {
                    let key_size = kv.key_size as usize;
                    let value_size = kv.value_size as usize;
                    let existing_value = unsafe {
                        std::slice::from_raw_parts(KeyValueHeader::value_ptr(kv_ptr, key_size), value_size)
                    };
                    if existing_value == value {
                        return true;
                    }
                }
                cur = kv.next_offset.load(Ordering::Acquire);
            }
        }
        false
    }

    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();

        let (offset, found) = self.find_in_chain_locked(slot, key, hash);
        match found {
            None => Ok(None),
            Some(kv_ptr) => {
                let kv = unsafe { &*kv_ptr };
                let key_size = kv.key_size as usize;
                let value_size = kv.value_size as usize;
                let value = unsafe {
                    std::slice::from_raw_parts(KeyValueHeader::value_ptr(kv_ptr, key_size), value_size).to_vec()
                };
                self.unlink_and_free(slot, offset, kv_ptr);
                Ok(Some(value))
            }
        }
    }

    /// Removes `key` only if its current live value equals `expected`.
    pub fn remove_if_value_matches(&self, key: &[u8], expected: &[u8]) -> Result<bool> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();

        let (offset, found) = self.find_in_chain_locked(slot, key, hash);
        match found {
            None => Ok(false),
            Some(kv_ptr) => {
                let kv = unsafe { &*kv_ptr };
                let key_size = kv.key_size as usize;
                let value_size = kv.value_size as usize;
                let existing_value = unsafe {
                    std::slice::from_raw_parts(KeyValueHeader::value_ptr(kv_ptr, key_size), value_size)
                };
                if existing_value != expected {
                    return Ok(false);
                }
                self.unlink_and_free(slot, offset, kv_ptr);
                Ok(true)
            }
        }
    }

    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();
        let now = now_ns();

        match self.find_in_chain_locked(slot, key, hash).1 {
            None => Ok(false),
            Some(kv_ptr) => {
                let kv = unsafe { &*kv_ptr };
                if value.len() as u32 == kv.value_size {
                    unsafe {
                        let value_ptr = KeyValueHeader::value_ptr(kv_ptr, kv.key_size as usize);
                        std::ptr::copy_nonoverlapping(value.as_ptr(), value_ptr, value.len());
                        kv.entry.version.fetch_add(1, Ordering::Release);
                    }
                    Ok(true)
                } else {
                    let ttl = kv.entry.remaining_ttl_seconds(now);
                    let offset = self.find_in_chain_locked(slot, key, hash).0;
                    self.unlink_and_free(slot, offset, kv_ptr);
                    let ttl_seconds = if ttl < 0 { -1 } else { ttl as i32 };
                    self.insert_new(slot, key, value, hash, ttl_seconds, now)?;
                    Ok(true)
                }
            }
        }
    }

    /// Replaces `key`'s value only if its current live value equals
    /// `expected`.
    pub fn replace_if_value_matches(&self, key: &[u8], expected: &[u8], new_value: &[u8]) -> Result<bool> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();
        let now = now_ns();

        match self.find_in_chain_locked(slot, key, hash).1 {
            None => Ok(false),
            Some(kv_ptr) => {
                let kv = unsafe { &*kv_ptr };
                let key_size = kv.key_size as usize;
                let value_size = kv.value_size as usize;
                let existing_value = unsafe {
                    std::slice::from_raw_parts(KeyValueHeader::value_ptr(kv_ptr, key_size), value_size)
                };
                if existing_value != expected {
                    return Ok(false);
                }
                if new_value.len() as u32 == kv.value_size {
                    unsafe {
                        let value_ptr = KeyValueHeader::value_ptr(kv_ptr, key_size);
                        std::ptr::copy_nonoverlapping(new_value.as_ptr(), value_ptr, new_value.len());
                        kv.entry.version.fetch_add(1, Ordering::Release);
                    }
                } else {
                    let ttl = kv.entry.remaining_ttl_seconds(now);
                    let offset = self.find_in_chain_locked(slot, key, hash).0;
                    self.unlink_and_free(slot, offset, kv_ptr);
                    let ttl_seconds = if ttl < 0 { -1 } else { ttl as i32 };
                    self.insert_new(slot, key, new_value, hash, ttl_seconds, now)?;
                }
                Ok(true)
            }
        }
    }

    /// Lock-free: remaining TTL in whole seconds, `-1` if infinite, `None`
    /// if no live entry matches `key`.
    pub fn get_ttl(&self, key: &[u8]) -> Option<i64> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        let _ = self.segment.sync_mapping();
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let now = now_ns();

        let mut cur = slot.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let kv_ptr = self.segment.resolve(cur) as *mut KeyValueHeader;
            let kv = unsafe { &*kv_ptr };
            if kv.entry.hash == hash {
                let result = read_consistent(&kv.entry, now, || {
                    let key_size = kv.key_size as usize;
                    let existing_key =
                        unsafe { std::slice::from_raw_parts(KeyValueHeader::key_ptr(kv_ptr), key_size) };
                    if existing_key == key {
                        Some(kv.entry.remaining_ttl_seconds(now))
                    } else {
                        None
                    }
                });
                if let Some(Some(ttl)) = result {
                    return Some(ttl);
                }
            }
            cur = kv.next_offset.load(Ordering::Acquire);
        }
        None
    }

    pub fn set_ttl(&self, key: &[u8], ttl_seconds: i32) -> Result<bool> {
        let hash = fnv1a32(key);
        let idx = bucket_index(hash, self.bucket_count);
        self.segment.sync_mapping()?;
        let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
        let _guard = slot.mutex().lock();
        let now = now_ns();
        match self.find_in_chain_locked(slot, key, hash).1 {
            None => Ok(false),
            Some(kv_ptr) => {
                unsafe { (*kv_ptr).entry.set_ttl(ttl_seconds, now) };
                Ok(true)
            }
        }
    }

    /// Sweeps every bucket, physically unlinking expired/deleted entries.
    pub fn remove_expired(&self) -> Result<usize> {
        self.segment.sync_mapping()?;
        let now = now_ns();
        let mut total = 0usize;
        for idx in 0..self.bucket_count {
            let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
            let _guard = slot.mutex().lock();
            let mut cur = slot.head_offset.load(Ordering::Acquire);
            while cur != SENTINEL {
                let kv_ptr = self.segment.resolve(cur) as *mut KeyValueHeader;
                let kv = unsafe { &*kv_ptr };
                let next = kv.next_offset.load(Ordering::Acquire);
                let state = kv.entry.load_state();
                let stale = state == State::Deleted
                    || state == State::Expired
                    || (state == State::Valid && !kv.entry.is_alive(now));
                if stale {
                    self.unlink_and_free(slot, cur, kv_ptr);
                    total += 1;
                }
                cur = next;
            }
        }
        Ok(total)
    }

    pub fn size(&self) -> usize {
        let _ = self.segment.sync_mapping();
        let now = now_ns();
        let mut total = 0usize;
        for idx in 0..self.bucket_count {
            let slot = unsafe { &*bucket_slot_ptr(&self.segment, self.buckets_offset, idx) };
            let mut cur = slot.head_offset.load(Ordering::Acquire);
            while cur != SENTINEL {
                let kv = unsafe { &*(self.segment.resolve(cur) as *const KeyValueHeader) };
                if kv.entry.is_alive(now) {
                    total += 1;
                }
                cur = kv.next_offset.load(Ordering::Acquire);
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
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
            "persist_collections_map_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn put_then_get_round_trips() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let map = Map::open(&path, 1 << 20, true, 16).unwrap();
        map.put(b"k1", b"v1", -1).unwrap();
        assert_eq!(map.get(b"k1"), Some(b"v1".to_vec()));
        assert_eq!(map.size(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn put_overwrites_existing_key() {
        let path = temp_path("overwrite");
        let _ = std::fs::remove_file(&path);
        let map = Map::open(&path, 1 << 20, true, 16).unwrap();
        map.put(b"k", b"v1", -1).unwrap();
        map.put(b"k", b"different-length-value", -1).unwrap();
        assert_eq!(map.get(b"k"), Some(b"different-length-value".to_vec()));
        assert_eq!(map.size(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn put_if_absent_respects_existing_entry() {
        let path = temp_path("if_absent");
        let _ = std::fs::remove_file(&path);
        let map = Map::open(&path, 1 << 20, true, 16).unwrap();
        assert!(map.put_if_absent(b"k", b"v1", -1).unwrap());
        assert!(!map.put_if_absent(b"k", b"v2", -1).unwrap());
        assert_eq!(map.get(b"k"), Some(b"v1".to_vec()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn remove_if_value_matches_requires_match() {
        let path = temp_path("cas_remove");
        let _ = std::fs::remove_file(&path);
        let map = Map::open(&path, 1 << 20, true, 16).unwrap();
        map.put(b"k", b"v1", -1).unwrap();
        assert!(!map.remove_if_value_matches(b"k", b"wrong").unwrap());
        assert!(map.remove_if_value_matches(b"k", b"v1").unwrap());
        assert!(map.get(b"k").is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn expired_entries_excluded_and_swept() {
        let path = temp_path("expiry");
        let _ = std::fs::remove_file(&path);
        let map = Map::open(&path, 1 << 20, true, 16).unwrap();
        map.put(b"temp", b"v", 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(map.get(b"temp").is_none());
        assert_eq!(map.size(), 0);
        assert_eq!(map.remove_expired().unwrap(), 1);
        std::fs::remove_file(&path).unwrap();
    }
}
