//! Lock-free LIFO Stack engine.
//!
//! `push`/`pop` are a Treiber stack over `header.head_offset` (the "top"):
//! a single `compare_exchange` loop with no mutex on the hot path.
//!
//! The classic Treiber-stack hazard is ABA: a thread reads `top == X`,
//! stalls, and by the time it retries its CAS another thread has popped
//! `X`, freed it back to the allocator, and a third thread's `push` has
//! been handed the very same offset for an unrelated node. A plain
//! `compare_exchange` on the raw offset can't tell that apart from `top`
//! never having changed. We avoid the dual-width CAS (and the
//! hazard-pointer machinery) a fully general fix would need by packing a
//! tag into the unused high bits of the stored offset: every successful
//! push or pop CAS carries a fresh value drawn from a named ABA-tag
//! counter kept alongside the segment header, so two different occupants
//! of the same offset are (overwhelmingly likely
//! to be) tagged differently and a stale CAS attempt fails on value
//! mismatch instead of spuriously succeeding. 48 offset bits is far more
//! than any realistic segment size; the remaining 16 tag bits wrap after
//! 65536 push/pop events on one collection, a window no real scheduling
//! delay spans.
//!
//! `search`/`remove_specific`/`remove_expired`/`clear` are not lock-free:
//! they take the structural write lock for exclusive access to walk and
//! unlink from the middle of the spine, which a pure CAS-at-the-head
//! protocol cannot do safely. `push`/`pop` take the same lock's *read*
//! side, so an OS rwlock — not a hand-rolled protocol — is what actually
//! keeps the two families of operations from racing each other; read-read
//! concurrency between pushers/poppers costs nothing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::now_ns;
use crate::entry::{fnv1a32, node_record_size, NodeHeader, SENTINEL};
use crate::error::{Error, Result};
use crate::segment::layout::CollectionKind;
use crate::segment::{Segment, DEFAULT_INITIAL_SIZE};
use crate::stats::{stats_of_segment, Stats};

/// Bits of the packed head word given to the real offset. Segments well
/// past a terabyte still fit; the remaining 16 bits are the ABA tag.
const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: i64 = (1i64 << OFFSET_BITS) - 1;
const TAG_MASK: u64 = (1u64 << (64 - OFFSET_BITS)) - 1;

/// Consecutive CAS losses before `push`/`pop` logs a contention warning.
const CAS_RETRY_WARN_THRESHOLD: u32 = 32;

fn pack(offset: i64, tag: u64) -> i64 {
    if offset == SENTINEL {
        return SENTINEL;
    }
    debug_assert!(offset >= 0 && offset <= OFFSET_MASK, "offset exceeds 48 packable bits");
    offset | (((tag & TAG_MASK) as i64) << OFFSET_BITS)
}

fn unpack_offset(word: i64) -> i64 {
    if word == SENTINEL {
        SENTINEL
    } else {
        word & OFFSET_MASK
    }
}

/// Ensures the ABA-tag counter named object exists, returning its offset.
/// Callers must hold the segment's structural write lock.
fn ensure_aba_tag(segment: &Segment) -> Result<i64> {
    segment.find_or_construct::<AtomicU64>("stack_aba_tag", |ptr| {
        unsafe { std::ptr::write(ptr, AtomicU64::new(0)) };
        Ok(())
    })
}

pub struct Stack {
    segment: Segment,
    aba_tag_offset: i64,
}

impl Stack {
    pub fn open(path: &Path, initial_size_bytes: u64, create_new: bool) -> Result<Stack> {
        let segment = Segment::create_or_open(path, initial_size_bytes, create_new, CollectionKind::Stack, 0)?;
        let aba_tag_offset = {
            let lock = segment.structural_lock();
            let _guard = lock.write();
            ensure_aba_tag(&segment)?
        };
        Ok(Stack { segment, aba_tag_offset })
    }

    pub fn create(path: &Path) -> Result<Stack> {
        Self::open(path, DEFAULT_INITIAL_SIZE, true)
    }

    fn aba_tag(&self) -> &AtomicU64 {
        unsafe { &*(self.segment.resolve(self.aba_tag_offset) as *const AtomicU64) }
    }

    /// Pushes onto the top. Lock-free: a single CAS loop, no node on the
    /// spine is ever touched besides the new one.
    pub fn push(&self, payload: &[u8], ttl_seconds: i32) -> Result<()> {
        self.segment.sync_mapping()?;
        let read_guard = self.segment.structural_lock();
        let _guard = read_guard.read();

        let now = now_ns();
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
        let node = unsafe { &*node_ptr };
        let header = self.segment.header();

        let mut retries = 0u32;
        loop {
            let old_word = header.head_offset.load(Ordering::Acquire);
            let old_top = unpack_offset(old_word);
            node.next_offset.store(old_top, Ordering::Relaxed);
            let tag = self.aba_tag().fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let new_word = pack(offset, tag);
            if header
                .head_offset
                .compare_exchange(old_word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                header.element_count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            retries += 1;
            if retries == CAS_RETRY_WARN_THRESHOLD {
                tracing::warn!(path = %self.segment.path().display(), retries, "stack push CAS under heavy contention");
            }
        }
    }

    /// Pops the top live entry, lock-free. Skips (evicting) any expired
    /// entries it finds sitting at the top before a live one, same
    /// skip-expired contract as `Queue::poll_front`.
    pub fn pop(&self) -> Result<Option<Vec<u8>>> {
        self.segment.sync_mapping()?;
        let read_guard = self.segment.structural_lock();
        let _guard = read_guard.read();

        let now = now_ns();
        let header = self.segment.header();
        let mut retries = 0u32;
        loop {
            let old_word = header.head_offset.load(Ordering::Acquire);
            let old_top = unpack_offset(old_word);
            if old_top == SENTINEL {
                return Ok(None);
            }
            let node_ptr = self.segment.resolve(old_top) as *mut NodeHeader;
            let node = unsafe { &*node_ptr };
            let next = node.next_offset.load(Ordering::Acquire);
            let tag = self.aba_tag().fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let new_word = pack(next, tag);
            if header
                .head_offset
                .compare_exchange(old_word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Won the race: this offset is now exclusively ours to
                // finalize, no other thread can still be racing the same
                // (offset, tag) pair.
                header.element_count.fetch_sub(1, Ordering::Relaxed);
                let alive = node.entry.is_alive(now);
                let data_size = node.entry.data_size as usize;
                let payload = unsafe {
                    std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr), data_size)
                }
                .to_vec();
                node.entry.mark_deleted();
                self.segment.deallocate(old_top, node_record_size(data_size));
                if alive {
                    return Ok(Some(payload));
                }
                // Expired: discard and keep unwinding toward the next node.
                retries = 0;
                continue;
            }
            retries += 1;
            if retries == CAS_RETRY_WARN_THRESHOLD {
                tracing::warn!(path = %self.segment.path().display(), retries, "stack pop CAS under heavy contention");
            }
        }
    }

    pub fn pop_or_err(&self) -> Result<Vec<u8>> {
        self.pop()?.ok_or(Error::Empty)
    }

    /// Read-only peek at the top live entry, skipping expired ones without
    /// unlinking anything. Takes the structural write lock, unlike
    /// `push`/`pop`: a pure read-side scan down `next_offset` without any
    /// exclusion is not safe against a concurrent `remove_expired`/`clear`
    /// physically reclaiming the very node being walked.
    pub fn peek(&self) -> Option<Vec<u8>> {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let mut cur = unpack_offset(self.segment.header().head_offset.load(Ordering::Acquire));
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

    /// O(n) scan from the top for a live entry equal to `payload`. Not
    /// lock-free: takes the structural write lock for the same reason as
    /// `peek`.
    pub fn search(&self, payload: &[u8]) -> bool {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let hash = fnv1a32(payload);
        let now = now_ns();
        let mut cur = unpack_offset(self.segment.header().head_offset.load(Ordering::Acquire));
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

    /// Removes the first live entry equal to `payload`, wherever it sits
    /// in the stack. Not lock-free: full exclusive spine walk under the
    /// structural write lock.
    pub fn remove_specific(&self, payload: &[u8]) -> Result<bool> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let hash = fnv1a32(payload);
        let now = now_ns();
        let header = self.segment.header();

        let mut prev: i64 = SENTINEL;
        let mut cur = unpack_offset(header.head_offset.load(Ordering::Acquire));
        while cur != SENTINEL {
            let node_ptr = self.segment.resolve(cur) as *mut NodeHeader;
            let node = unsafe { &*node_ptr };
            let next = node.next_offset.load(Ordering::Acquire);
            if node.entry.is_alive(now) && node.entry.hash == hash {
                let data_size = node.entry.data_size as usize;
                let existing =
                    unsafe { std::slice::from_raw_parts(NodeHeader::payload_ptr(node_ptr), data_size) };
                if existing == payload {
                    self.unlink_locked(prev, cur, next);
                    return Ok(true);
                }
            }
            prev = cur;
            cur = next;
        }
        Ok(false)
    }

    /// Unlinks `cur` (whose predecessor is `prev`, `SENTINEL` if it is the
    /// top) from the spine, bumping the ABA tag so any in-flight lock-free
    /// `pop` holding a stale view of the top fails its CAS instead of
    /// resurrecting a reclaimed node. Caller must hold the structural
    /// write lock.
    fn unlink_locked(&self, prev: i64, cur: i64, next: i64) {
        let header = self.segment.header();
        let node_ptr = self.segment.resolve(cur) as *mut NodeHeader;
        let node = unsafe { &*node_ptr };
        let data_size = node.entry.data_size as usize;
        if prev == SENTINEL {
            let tag = self.aba_tag().fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            header.head_offset.store(pack(next, tag), Ordering::Release);
        } else {
            let prev_node = unsafe { &*(self.segment.resolve(prev) as *const NodeHeader) };
            prev_node.next_offset.store(next, Ordering::Release);
        }
        node.entry.mark_deleted();
        header.element_count.fetch_sub(1, Ordering::Relaxed);
        self.segment.deallocate(cur, node_record_size(data_size));
    }

    /// Sweeps the whole spine, unlinking every expired/deleted node.
    pub fn remove_expired(&self) -> Result<usize> {
        self.segment.sync_mapping()?;
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let header = self.segment.header();

        let mut prev: i64 = SENTINEL;
        let mut cur = unpack_offset(header.head_offset.load(Ordering::Acquire));
        let mut total = 0usize;
        while cur != SENTINEL {
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            let next = node.next_offset.load(Ordering::Acquire);
            if !node.entry.is_alive(now) {
                self.unlink_locked(prev, cur, next);
                total += 1;
            } else {
                prev = cur;
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
        let mut cur = unpack_offset(header.head_offset.load(Ordering::Acquire));
        while cur != SENTINEL {
            let node = unsafe { &*(self.segment.resolve(cur) as *const NodeHeader) };
            let next = node.next_offset.load(Ordering::Acquire);
            let data_size = node.entry.data_size as usize;
            node.entry.mark_deleted();
            self.segment.deallocate(cur, node_record_size(data_size));
            cur = next;
        }
        let tag = self.aba_tag().fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        header.head_offset.store(pack(SENTINEL, tag), Ordering::Release);
        header.element_count.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Live count; O(n), consistent with every other collection's `size()`.
    pub fn size(&self) -> usize {
        let _ = self.segment.sync_mapping();
        let lock = self.segment.structural_lock();
        let _guard = lock.write();
        let now = now_ns();
        let mut cur = unpack_offset(self.segment.header().head_offset.load(Ordering::Acquire));
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
    use std::sync::Arc;
    use std::thread;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "persist_collections_stack_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn push_then_pop_is_lifo() {
        let path = temp_path("lifo");
        let _ = std::fs::remove_file(&path);
        let s = Stack::open(&path, 1 << 20, true).unwrap();
        s.push(b"a", -1).unwrap();
        s.push(b"b", -1).unwrap();
        assert_eq!(s.pop().unwrap(), Some(b"b".to_vec()));
        assert_eq!(s.pop().unwrap(), Some(b"a".to_vec()));
        assert_eq!(s.pop().unwrap(), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn pop_skips_expired_entries() {
        let path = temp_path("skip_expired");
        let _ = std::fs::remove_file(&path);
        let s = Stack::open(&path, 1 << 20, true).unwrap();
        s.push(b"bottom", -1).unwrap();
        s.push(b"expired", 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(s.pop().unwrap(), Some(b"bottom".to_vec()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn remove_specific_unlinks_from_middle() {
        let path = temp_path("remove_specific");
        let _ = std::fs::remove_file(&path);
        let s = Stack::open(&path, 1 << 20, true).unwrap();
        s.push(b"a", -1).unwrap();
        s.push(b"b", -1).unwrap();
        s.push(b"c", -1).unwrap();
        assert!(s.remove_specific(b"b").unwrap());
        assert!(!s.search(b"b"));
        assert_eq!(s.size(), 2);
        assert_eq!(s.pop().unwrap(), Some(b"c".to_vec()));
        assert_eq!(s.pop().unwrap(), Some(b"a".to_vec()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn clear_empties_the_stack() {
        let path = temp_path("clear");
        let _ = std::fs::remove_file(&path);
        let s = Stack::open(&path, 1 << 20, true).unwrap();
        s.push(b"a", -1).unwrap();
        s.push(b"b", -1).unwrap();
        s.clear().unwrap();
        assert!(s.is_empty());
        assert_eq!(s.pop().unwrap(), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn concurrent_push_pop_preserves_total_count() {
        let path = temp_path("concurrent");
        let _ = std::fs::remove_file(&path);
        let stack = Arc::new(Stack::open(&path, 8 << 20, true).unwrap());
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|i| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for j in 0..PER_PRODUCER {
                        let payload = format!("{i}-{j}");
                        stack.push(payload.as_bytes(), -1).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut popped = 0usize;
        while stack.pop().unwrap().is_some() {
            popped += 1;
        }
        assert_eq!(popped, PRODUCERS * PER_PRODUCER);
        std::fs::remove_file(&path).unwrap();
    }
}
