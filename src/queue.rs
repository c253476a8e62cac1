//! Deque engine: FIFO queue with full double-ended offer/poll/peek, built
//! over the same doubly-linked `Node` spine as `sequence.rs` but exposed
//! through queue-shaped operations (`offer_*`/`poll_*`/`peek_*`) instead of
//! index-addressed ones, plus blocking/timeout consumers.
//!
//! An intrusive doubly-linked list over segment offsets rather than slot
//! indices, with skip-expired consumer semantics: a consumer walks from its
//! end of the spine, evicting any expired nodes it passes, and only
//! returns once it reaches a live node or the spine is empty.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::clock::now_ns;
use crate::entry::{fnv1a32, node_record_size, NodeHeader, State, SENTINEL};
use crate::error::{Error, Result};
use crate::segment::layout::CollectionKind;
use crate::segment::{Segment, DEFAULT_INITIAL_SIZE};
use crate::stats::{stats_of_segment, Stats};

/// `take`/`poll_with_timeout` re-poll at this cadence while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct Queue {
    segment: Segment,
}

impl Queue {
    pub fn open(path: &Path, initial_size_bytes: u64, create_new: bool) -> Result<Queue> {
        let segment = Segment::create_or_open(path, initial_size_bytes, create_new, CollectionKind::Queue, 0)?;
        Ok(Queue { segment })
    }

    pub fn create(path: &Path) -> Result<Queue> {
        Self::open(path, DEFAULT_INITIAL_SIZE, true)
    }

    fn new_node(&self, payload: &[u8], ttl_seconds: i32, now: u64) -> Result<i64> {
        let hash = fnv1a32(payload);
        let size = node_record_size(payload.len());
        let offset = self.segment.allocate(size)?;
        let node_ptr = self.segment.resolve(offset) as *mut NodeHeader;
        unsafe {
            NodeHeader::init_empty(node_ptr);
            (*node_ptr).entry.force_writing();
            let payload_ptr = NodeHeader::payload_ptr(node_ptr);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), payload_ptr, payload.len());
            (*node_ptr).entry.publish(payload.len() as u32, hash, ttl_seconds, now);
        }
        Ok(offset)
    }

    /// Appends to the back. O(1) under the header exclusive lock.
    pub fn offer_back(&self, payload: &[u8], ttl_seconds: i32) -> Result<()> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let offset = self.new_node(payload, ttl_seconds, now)?;
        let header = self.segment.header();
        let node = unsafe { &*(self.segment.resolve(offset) as *const NodeHeader) };
        let old_back = header.tail_offset.load(Ordering::Acquire);
        node.prev_offset.store(old_back, Ordering::Relaxed);
        node.next_offset.store(SENTINEL, Ordering::Relaxed);
        if old_back == SENTINEL {
            header.head_offset.store(offset, Ordering::Release);
        } else {
            let old_back_node = unsafe { &*(self.segment.resolve(old_back) as *const NodeHeader) };
            old_back_node.next_offset.store(offset, Ordering::Release);
        }
        header.tail_offset.store(offset, Ordering::Release);
        header.element_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Prepends to the front. O(1) under the header exclusive lock.
    pub fn offer_front(&self, payload: &[u8], ttl_seconds: i32) -> Result<()> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let offset = self.new_node(payload, ttl_seconds, now)?;
        let header = self.segment.header();
        let node = unsafe { &*(self.segment.resolve(offset) as *const NodeHeader) };
        let old_front = header.head_offset.load(Ordering::Acquire);
        node.next_offset.store(old_front, Ordering::Relaxed);
        node.prev_offset.store(SENTINEL, Ordering::Relaxed);
        if old_front == SENTINEL {
            header.tail_offset.store(offset, Ordering::Release);
        } else {
            let old_front_node = unsafe { &*(self.segment.resolve(old_front) as *const NodeHeader) };
            old_front_node.prev_offset.store(offset, Ordering::Release);
        }
        header.head_offset.store(offset, Ordering::Release);
        header.element_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unlink(&self, offset: i64) -> Vec<u8> {
        let header = self.segment.header();
        let node_ptr = self.segment.resolve(offset) as *mut NodeHeader;
        let node = unsafe { &*node_ptr };
        let data_size = node.entry.data_size as usize;
        let payload = unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr), data_size) }.to_vec();
        let prev = node.prev_offset.load(Ordering::Acquire);
        let next = node.next_offset.load(Ordering::Acquire);
        if prev == SENTINEL {
            header.head_offset.store(next, Ordering::Release);
        } else {
            let prev_node = unsafe { &*(self.segment.resolve(prev) as *const NodeHeader) };
            prev_node.next_offset.store(next, Ordering::Release);
        }
        if next == SENTINEL {
            header.tail_offset.store(prev, Ordering::Release);
        } else {
            let next_node = unsafe { &*(self.segment.resolve(next) as *const NodeHeader) };
            next_node.prev_offset.store(prev, Ordering::Release);
        }
        node.entry.mark_deleted();
        header.element_count.fetch_sub(1, Ordering::Relaxed);
        self.segment.deallocate(offset, node_record_size(data_size));
        payload
    }

    /// Skips (evicting) expired entries from the front, then unlinks and
    /// returns the first live one, or `None` if the queue drains to empty.
    pub fn poll_front(&self) -> Result<Option<Vec<u8>>> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let header = self.segment.header();
        loop {
            let cur = header.head_offset.load(Ordering::Acquire);
            if cur == SENTINEL {
                return Ok(None);
            }
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            if !node.entry.is_alive(now) {
                self.unlink(cur);
                continue;
            }
            return Ok(Some(self.unlink(cur)));
        }
    }

    /// Symmetric to `poll_front`, from the back.
    pub fn poll_back(&self) -> Result<Option<Vec<u8>>> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let header = self.segment.header();
        loop {
            let cur = header.tail_offset.load(Ordering::Acquire);
            if cur == SENTINEL {
                return Ok(None);
            }
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            if !node.entry.is_alive(now) {
                self.unlink(cur);
                continue;
            }
            return Ok(Some(self.unlink(cur)));
        }
    }

    pub fn poll_front_or_err(&self) -> Result<Vec<u8>> {
        self.poll_front()?.ok_or(Error::Empty)
    }

    pub fn poll_back_or_err(&self) -> Result<Vec<u8>> {
        self.poll_back()?.ok_or(Error::Empty)
    }

    /// Read-only: the first live payload from the front, skipping (without
    /// unlinking) any expired nodes encountered along the way.
    pub fn peek_front(&self) -> Option<Vec<u8>> {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let mut cur = self.segment.header().head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *const NodeHeader;
            let node = unsafe { &*node_ptr };
            if node.entry.is_alive(now) {
                let data_size = node.entry.data_size as usize;
                return Some(
                    unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr as *mut NodeHeader), data_size) }
                        .to_vec(),
                );
            }
            cur = node.next_offset.load(Ordering::Acquire);
        }
        None
    }

    /// Symmetric to `peek_front`, from the back.
    pub fn peek_back(&self) -> Option<Vec<u8>> {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let mut cur = self.segment.header().tail_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *const NodeHeader;
            let node = unsafe { &*node_ptr };
            if node.entry.is_alive(now) {
                let data_size = node.entry.data_size as usize;
                return Some(
                    unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr as *mut NodeHeader), data_size) }
                        .to_vec(),
                );
            }
            cur = node.prev_offset.load(Ordering::Acquire);
        }
        None
    }

    /// Remaining TTL of the entry `peek_front` would return, if any.
    pub fn peek_ttl(&self) -> Option<i64> {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let mut cur = self.segment.header().head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            if node.entry.is_alive(now) {
                return Some(node.entry.remaining_ttl_seconds(now));
            }
            cur = node.next_offset.load(Ordering::Acquire);
        }
        None
    }

    /// Polls the front, busy-waiting in `POLL_INTERVAL` steps until a live
    /// element arrives or `timeout` elapses. The queue itself is unbounded,
    /// so `offer_*` never times out — only consumer waits can.
    pub fn poll_with_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = self.poll_front()? {
                return Ok(Some(v));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll: loops indefinitely until an element is available.
    /// Uninterruptible within the engine — callers that need cancellation
    /// must close the collection from another thread.
    pub fn take(&self) -> Result<Vec<u8>> {
        loop {
            if let Some(v) = self.poll_front()? {
                return Ok(v);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// O(n) scan from the front for a live entry equal to `payload`.
    pub fn contains(&self, payload: &[u8]) -> bool {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let hash = fnv1a32(payload);
        let now = now_ns();
        let mut cur = self.segment.header().head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *const NodeHeader;
            let node = unsafe { &*node_ptr };
            if node.entry.is_alive(now) && node.entry.hash == hash {
                let data_size = node.entry.data_size as usize;
                let existing =
                    unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr as *mut NodeHeader), data_size) };
                if existing == payload {
                    return true;
                }
            }
            cur = node.next_offset.load(Ordering::Acquire);
        }
        false
    }

    /// Removes the first live entry (front-to-back) equal to `payload`.
    /// Returns whether one was found and removed.
    pub fn remove_first_matching(&self, payload: &[u8]) -> Result<bool> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let hash = fnv1a32(payload);
        let now = now_ns();
        let mut cur = self.segment.header().head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *const NodeHeader;
            let node = unsafe { &*node_ptr };
            let next = node.next_offset.load(Ordering::Acquire);
            if node.entry.is_alive(now) && node.entry.hash == hash {
                let data_size = node.entry.data_size as usize;
                let existing = unsafe {
                    std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr as *mut NodeHeader), data_size)
                };
                if existing == payload {
                    self.unlink(cur);
                    return Ok(true);
                }
            }
            cur = next;
        }
        Ok(false)
    }

    /// Pops up to `max` live elements in FIFO order, invoking `callback`
    /// with each. Returns the number drained.
    pub fn drain_into(&self, max: usize, mut callback: impl FnMut(Vec<u8>)) -> Result<usize> {
        let mut drained = 0;
        while drained < max {
            match self.poll_front()? {
                Some(payload) => {
                    callback(payload);
                    drained += 1;
                }
                None => break,
            }
        }
        Ok(drained)
    }

    /// Sweeps the whole spine, unlinking every expired/deleted node,
    /// including ones in the middle that ordinary consumer ops leave alone.
    pub fn remove_expired(&self) -> Result<usize> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let header = self.segment.header();
        let mut cur = header.head_offset.load(Ordering::Acquire);
        let mut total = 0usize;
        while cur != SENTINEL {
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            let next = node.next_offset.load(Ordering::Acquire);
            let state = node.entry.load_state();
            let stale = state == State::Deleted
                || state == State::Expired
                || (state == State::Valid && !node.entry.is_alive(now));
            if stale {
                if state == State::Valid {
                    node.entry.mark_expired_hint();
                }
                self.unlink(cur);
                total += 1;
            }
            cur = next;
        }
        Ok(total)
    }

    pub fn clear(&self) -> Result<()> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let header = self.segment.header();
        let mut cur = header.head_offset.load(Ordering::Acquire);
        while cur != SENTINEL {
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            let next = node.next_offset.load(Ordering::Acquire);
            let data_size = node.entry.data_size as usize;
            node.entry.mark_deleted();
            self.segment.deallocate(cur, node_record_size(data_size));
            cur = next;
        }
        header.head_offset.store(SENTINEL, Ordering::Release);
        header.tail_offset.store(SENTINEL, Ordering::Release);
        header.element_count.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Live count; O(n), consistent with every other collection's `size()`.
    pub fn size(&self) -> usize {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let mut cur = self.segment.header().head_offset.load(Ordering::Acquire);
        let mut total = 0usize;
        while cur != SENTINEL {
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            if node.entry.is_alive(now) {
                total += 1;
            }
            cur = node.next_offset.load(Ordering::Acquire);
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
            "persist_collections_queue_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn offer_back_then_poll_front_is_fifo() {
        let path = temp_path("fifo");
        let _ = std::fs::remove_file(&path);
        let q = Queue::open(&path, 1 << 20, true).unwrap();
        q.offer_back(b"a", -1).unwrap();
        q.offer_back(b"b", -1).unwrap();
        assert_eq!(q.poll_front().unwrap(), Some(b"a".to_vec()));
        assert_eq!(q.poll_front().unwrap(), Some(b"b".to_vec()));
        assert_eq!(q.poll_front().unwrap(), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn offer_front_prepends() {
        let path = temp_path("offer_front");
        let _ = std::fs::remove_file(&path);
        let q = Queue::open(&path, 1 << 20, true).unwrap();
        q.offer_back(b"b", -1).unwrap();
        q.offer_front(b"a", -1).unwrap();
        assert_eq!(q.poll_front().unwrap(), Some(b"a".to_vec()));
        assert_eq!(q.poll_front().unwrap(), Some(b"b".to_vec()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn poll_front_skips_expired_entries() {
        let path = temp_path("skip_expired");
        let _ = std::fs::remove_file(&path);
        let q = Queue::open(&path, 1 << 20, true).unwrap();
        q.offer_back(b"expired", 0).unwrap();
        q.offer_back(b"live", -1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(q.poll_front().unwrap(), Some(b"live".to_vec()));
        assert_eq!(q.size(), 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn peek_is_read_only() {
        let path = temp_path("peek");
        let _ = std::fs::remove_file(&path);
        let q = Queue::open(&path, 1 << 20, true).unwrap();
        q.offer_back(b"a", -1).unwrap();
        assert_eq!(q.peek_front(), Some(b"a".to_vec()));
        assert_eq!(q.peek_front(), Some(b"a".to_vec()));
        assert_eq!(q.size(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn poll_with_timeout_returns_none_on_empty() {
        let path = temp_path("timeout");
        let _ = std::fs::remove_file(&path);
        let q = Queue::open(&path, 1 << 20, true).unwrap();
        let start = std::time::Instant::now();
        assert_eq!(q.poll_with_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn drain_into_collects_in_fifo_order() {
        let path = temp_path("drain");
        let _ = std::fs::remove_file(&path);
        let q = Queue::open(&path, 1 << 20, true).unwrap();
        q.offer_back(b"a", -1).unwrap();
        q.offer_back(b"b", -1).unwrap();
        q.offer_back(b"c", -1).unwrap();
        let mut seen = Vec::new();
        let drained = q.drain_into(2, |v| seen.push(v)).unwrap();
        assert_eq!(drained, 2);
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(q.size(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn remove_first_matching_unlinks_single_match() {
        let path = temp_path("remove_match");
        let _ = std::fs::remove_file(&path);
        let q = Queue::open(&path, 1 << 20, true).unwrap();
        q.offer_back(b"a", -1).unwrap();
        q.offer_back(b"b", -1).unwrap();
        assert!(q.remove_first_matching(b"a").unwrap());
        assert!(!q.contains(b"a"));
        assert_eq!(q.size(), 1);
        std::fs::remove_file(&path).unwrap();
    }
}
