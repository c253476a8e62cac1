//! Ordered list: doubly-linked `Node` chain addressed by live index (expired
//! entries are transparent to callers). Every operation takes the
//! segment's structural exclusive lock; the spine is addressed by offsets
//! into a growable segment rather than fixed slot indices.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::clock::now_ns;
use crate::entry::{fnv1a32, node_record_size, NodeHeader, State, SENTINEL};
use crate::error::{Error, Result};
use crate::segment::layout::CollectionKind;
use crate::segment::{Segment, DEFAULT_INITIAL_SIZE};
use crate::stats::{stats_of_segment, Stats};

/// Process-local hint of the last (live-index, node-offset) pair visited by
/// `get_at`. Never shared across processes; invalidated by any write.
struct Cursor {
    index: usize,
    offset: i64,
}

pub struct Sequence {
    segment: Segment,
    cursor: Mutex<Option<Cursor>>,
}

impl Sequence {
    pub fn open(path: &Path, initial_size_bytes: u64, create_new: bool) -> Result<Sequence> {
        let segment = Segment::create_or_open(path, initial_size_bytes, create_new, CollectionKind::Sequence, 0)?;
        Ok(Sequence {
            segment,
            cursor: Mutex::new(None),
        })
    }

    pub fn create(path: &Path) -> Result<Sequence> {
        Self::open(path, DEFAULT_INITIAL_SIZE, true)
    }

    fn invalidate_cursor(&self) {
        *self.cursor.lock() = None;
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

    pub fn push_tail(&self, payload: &[u8], ttl_seconds: i32) -> Result<()> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let offset = self.new_node(payload, ttl_seconds, now)?;
        let header = self.segment.header();
        let node = unsafe { &*(self.segment.resolve(offset) as *const NodeHeader) };
        let old_tail = header.tail_offset.load(Ordering::Acquire);
        node.prev_offset.store(old_tail, Ordering::Relaxed);
        node.next_offset.store(SENTINEL, Ordering::Relaxed);
        if old_tail == SENTINEL {
            header.head_offset.store(offset, Ordering::Release);
        } else {
            let old_tail_node = unsafe { &*(self.segment.resolve(old_tail) as *const NodeHeader) };
            old_tail_node.next_offset.store(offset, Ordering::Release);
        }
        header.tail_offset.store(offset, Ordering::Release);
        header.element_count.fetch_add(1, Ordering::Relaxed);
        self.invalidate_cursor();
        Ok(())
    }

    pub fn push_head(&self, payload: &[u8], ttl_seconds: i32) -> Result<()> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let offset = self.new_node(payload, ttl_seconds, now)?;
        let header = self.segment.header();
        let node = unsafe { &*(self.segment.resolve(offset) as *const NodeHeader) };
        let old_head = header.head_offset.load(Ordering::Acquire);
        node.next_offset.store(old_head, Ordering::Relaxed);
        node.prev_offset.store(SENTINEL, Ordering::Relaxed);
        if old_head == SENTINEL {
            header.tail_offset.store(offset, Ordering::Release);
        } else {
            let old_head_node = unsafe { &*(self.segment.resolve(old_head) as *const NodeHeader) };
            old_head_node.prev_offset.store(offset, Ordering::Release);
        }
        header.head_offset.store(offset, Ordering::Release);
        header.element_count.fetch_add(1, Ordering::Relaxed);
        self.invalidate_cursor();
        Ok(())
    }

    /// Walks forward from `head_offset`, skipping non-live nodes, until the
    /// `target`-th live node (0-based) is reached. Caller must hold the
    /// structural lock.
    fn walk_to_live_index(&self, target: usize) -> Option<i64> {
        let header = self.segment.header();
        let mut cur = header.head_offset.load(Ordering::Acquire);
        let mut seen = 0usize;
        let now = now_ns();
        while cur != SENTINEL {
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            if node.entry.is_alive(now) {
                if seen == target {
                    return Some(cur);
                }
                seen += 1;
            }
            cur = node.next_offset.load(Ordering::Acquire);
        }
        None
    }

    /// Resolves `index` to a node offset, preferring the cursor when
    /// `index` follows the last cached access by exactly one.
    fn resolve_live_index(&self, index: usize) -> Option<i64> {
        let mut cursor = self.cursor.lock();
        if let Some(c) = cursor.as_ref() {
            if index == c.index + 1 {
                let node = unsafe { &*(self.segment.resolve(c.offset) as *const NodeHeader) };
                let now = now_ns();
                let mut cur = node.next_offset.load(Ordering::Acquire);
                while cur != SENTINEL {
                    let n = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
                    if n.entry.is_alive(now) {
                        *cursor = Some(Cursor { index, offset: cur });
                        return Some(cur);
                    }
                    cur = n.next_offset.load(Ordering::Acquire);
                }
                return None;
            }
        }
        let found = self.walk_to_live_index(index);
        *cursor = found.map(|offset| Cursor { index, offset });
        found
    }

    pub fn get_at(&self, index: usize) -> Option<Vec<u8>> {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let offset = self.resolve_live_index(index)?;
        let node_ptr = self.segment.resolve(offset) as *const NodeHeader;
        let node = unsafe { &*node_ptr };
        let data_size = node.entry.data_size as usize;
        Some(unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr as *mut NodeHeader), data_size) }.to_vec())
    }

    pub fn get_at_or_err(&self, index: usize) -> Result<Vec<u8>> {
        self.get_at(index).ok_or(Error::NotFound)
    }

    pub fn insert_at(&self, index: usize, payload: &[u8], ttl_seconds: i32) -> Result<()> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let header = self.segment.header();

        let before = self.walk_to_live_index(index);
        let new_offset = self.new_node(payload, ttl_seconds, now)?;
        let new_node = unsafe { &*(self.segment.resolve(new_offset) as *const NodeHeader) };

        match before {
            None => {
                let old_tail = header.tail_offset.load(Ordering::Acquire);
                new_node.prev_offset.store(old_tail, Ordering::Relaxed);
                new_node.next_offset.store(SENTINEL, Ordering::Relaxed);
                if old_tail == SENTINEL {
                    header.head_offset.store(new_offset, Ordering::Release);
                } else {
                    let old_tail_node = unsafe { &*(self.segment.resolve(old_tail) as *const NodeHeader) };
                    old_tail_node.next_offset.store(new_offset, Ordering::Release);
                }
                header.tail_offset.store(new_offset, Ordering::Release);
            }
            Some(before_offset) => {
                let before_node = unsafe { &*(self.segment.resolve(before_offset) as *const NodeHeader) };
                let prev_offset = before_node.prev_offset.load(Ordering::Acquire);
                new_node.next_offset.store(before_offset, Ordering::Relaxed);
                new_node.prev_offset.store(prev_offset, Ordering::Relaxed);
                before_node.prev_offset.store(new_offset, Ordering::Release);
                if prev_offset == SENTINEL {
                    header.head_offset.store(new_offset, Ordering::Release);
                } else {
                    let prev_node = unsafe { &*(self.segment.resolve(prev_offset) as *const NodeHeader) };
                    prev_node.next_offset.store(new_offset, Ordering::Release);
                }
            }
        }
        header.element_count.fetch_add(1, Ordering::Relaxed);
        self.invalidate_cursor();
        Ok(())
    }

    pub fn set_at(&self, index: usize, payload: &[u8], ttl_seconds: i32) -> Result<bool> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let Some(offset) = self.resolve_live_index_unlocked(index) else {
            return Ok(false);
        };
        let node_ptr = self.segment.resolve(offset) as *mut NodeHeader;
        let node = unsafe { &*node_ptr };
        let hash = fnv1a32(payload);
        if payload.len() as u32 == node.entry.data_size {
            unsafe {
                let payload_ptr = NodeHeader::payload_ptr(node_ptr);
                std::ptr::copy_nonoverlapping(payload.as_ptr(), payload_ptr, payload.len());
                node.entry.set_ttl(ttl_seconds, now);
            }
            unsafe {
                let header_ptr = node_ptr;
                (*header_ptr).entry.publish(payload.len() as u32, hash, ttl_seconds, now);
            }
            self.invalidate_cursor();
            return Ok(true);
        }

        let prev = node.prev_offset.load(Ordering::Acquire);
        let next = node.next_offset.load(Ordering::Acquire);
        let new_offset = self.new_node(payload, ttl_seconds, now)?;
        let new_node = unsafe { &*(self.segment.resolve(new_offset) as *const NodeHeader) };
        new_node.prev_offset.store(prev, Ordering::Relaxed);
        new_node.next_offset.store(next, Ordering::Relaxed);

        let header = self.segment.header();
        if prev == SENTINEL {
            header.head_offset.store(new_offset, Ordering::Release);
        } else {
            let prev_node = unsafe { &*(self.segment.resolve(prev) as *const NodeHeader) };
            prev_node.next_offset.store(new_offset, Ordering::Release);
        }
        if next == SENTINEL {
            header.tail_offset.store(new_offset, Ordering::Release);
        } else {
            let next_node = unsafe { &*(self.segment.resolve(next) as *const NodeHeader) };
            next_node.prev_offset.store(new_offset, Ordering::Release);
        }
        node.entry.mark_deleted();
        self.segment.deallocate(offset, node_record_size(node.entry.data_size as usize));
        self.invalidate_cursor();
        Ok(true)
    }

    fn resolve_live_index_unlocked(&self, index: usize) -> Option<i64> {
        self.walk_to_live_index(index)
    }

    pub fn remove_at(&self, index: usize) -> Result<Option<Vec<u8>>> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let Some(offset) = self.walk_to_live_index(index) else {
            return Ok(None);
        };
        Ok(Some(self.unlink_and_collect(offset)))
    }

    fn unlink_and_collect(&self, offset: i64) -> Vec<u8> {
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
        self.invalidate_cursor();
        payload
    }

    pub fn pop_head(&self) -> Result<Option<Vec<u8>>> {
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
                self.unlink_and_collect(cur);
                continue;
            }
            return Ok(Some(self.unlink_and_collect(cur)));
        }
    }

    pub fn pop_tail(&self) -> Result<Option<Vec<u8>>> {
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
                self.unlink_and_collect(cur);
                continue;
            }
            return Ok(Some(self.unlink_and_collect(cur)));
        }
    }

    pub fn index_of(&self, payload: &[u8]) -> Option<usize> {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let hash = fnv1a32(payload);
        let header = self.segment.header();
        let mut cur = header.head_offset.load(Ordering::Acquire);
        let now = now_ns();
        let mut live_index = 0usize;
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *const NodeHeader;
            let node = unsafe { &*node_ptr };
            if node.entry.is_alive(now) {
                if node.entry.hash == hash {
                    let data_size = node.entry.data_size as usize;
                    let existing = unsafe {
                        std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr as *mut NodeHeader), data_size)
                    };
                    if existing == payload {
                        return Some(live_index);
                    }
                }
                live_index += 1;
            }
            cur = node.next_offset.load(Ordering::Acquire);
        }
        None
    }

    pub fn contains(&self, payload: &[u8]) -> bool {
        self.index_of(payload).is_some()
    }

    pub fn size(&self) -> usize {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let header = self.segment.header();
        let mut cur = header.head_offset.load(Ordering::Acquire);
        let now = now_ns();
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
                self.unlink_and_collect(cur);
                total += 1;
            }
            cur = next;
        }
        Ok(total)
    }

    pub fn set_ttl(&self, index: usize, ttl_seconds: i32) -> Result<bool> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let Some(offset) = self.walk_to_live_index(index) else {
            return Ok(false);
        };
        let node = unsafe { &*(self.segment.resolve(offset) as *const NodeHeader) };
        unsafe { node.entry.set_ttl(ttl_seconds, now_ns()) };
        Ok(true)
    }

    pub fn get_ttl(&self, index: usize) -> Option<i64> {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let offset = self.walk_to_live_index(index)?;
        let node = unsafe { &*(self.segment.resolve(offset) as *const NodeHeader) };
        Some(node.entry.remaining_ttl_seconds(now_ns()))
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
