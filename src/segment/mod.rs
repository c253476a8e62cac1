//! Segment Manager: owns the memory-mapped file backing one collection.
//!
//! A single growable file holds the header, structural lock, named-object
//! directory, and a bump/free-list allocator, so a collection is always
//! exactly one file on disk. Opening validates the header and recreates the
//! file if it's missing or malformed; creation zeroes the region first and
//! only then stamps the header, so a reader can never observe a
//! partially-initialized header.

pub mod layout;
pub mod lock;
pub mod mutex;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::clock::now_ns;
use crate::entry::{FORMAT_VERSION, SENTINEL};
use crate::error::{Error, Result};

use layout::{
    data_region_offset, round_up, CollectionKind, DirectoryEntry, FreeBlockHeader, SegmentHeader,
    DIRECTORY_CAPACITY, DIRECTORY_OFFSET, GROWTH_LOCK_OFFSET, SEGMENT_HEADER_SIZE,
};
use lock::ProcessRwLock;
use mutex::ProcessMutex;

pub const DEFAULT_INITIAL_SIZE: u64 = 64 * 1024 * 1024;
const MIN_GROWTH: u64 = 1024 * 1024;
/// Hard cap on a single segment's total size. A 48-bit offset (the Stack's
/// packed ABA word, see `stack.rs`) addresses far more than this, so the
/// cap exists to give `allocate` a real exhaustion case rather than growing
/// the file without bound.
const MAX_SEGMENT_SIZE: u64 = 1 << 40;

/// A single memory-mapped file backing one collection.
///
/// `grow` never unmaps an existing mapping: it creates an additional
/// `MmapMut` covering the whole (now larger) file, retains it forever in
/// `mappings` (the prefix every earlier mapping already covered stays
/// backed by the same file pages, so old mappings remain valid — only the
/// newly extended tail needs a fresh mapping to become visible), and
/// publishes its base pointer through `base` with `Release` ordering. This
/// lets `resolve`/`base_ptr` be called by any thread at any time, with no
/// lock at all — required for the hash engine's lock-free reads and the
/// stack's lock-free push/pop, which never take the structural lock grow
/// would otherwise need to coordinate against.
pub struct Segment {
    base: AtomicPtr<u8>,
    mapped_len: AtomicU64,
    mappings: Mutex<Vec<MmapMut>>,
    file: File,
    path: PathBuf,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn create_or_open(
        path: &Path,
        initial_size_bytes: u64,
        create_new: bool,
        kind: CollectionKind,
        bucket_count: u32,
    ) -> Result<Segment> {
        if create_new {
            return Self::create(path, initial_size_bytes, kind, bucket_count);
        }
        match Self::open(path) {
            Ok(segment) => {
                let header = segment.header();
                let kind_matches = header.kind == kind as u32;
                let buckets_match = kind != CollectionKind::Set && kind != CollectionKind::Map
                    || header.bucket_count == bucket_count;
                if kind_matches && buckets_match {
                    return Ok(segment);
                }
                drop(segment);
                Self::create(path, initial_size_bytes, kind, bucket_count)
            }
            Err(_) => Self::create(path, initial_size_bytes, kind, bucket_count),
        }
    }

    pub fn create(
        path: &Path,
        initial_size_bytes: u64,
        kind: CollectionKind,
        bucket_count: u32,
    ) -> Result<Segment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::file(path, e))?;

        let min_size = data_region_offset() as u64 + 64;
        let size = initial_size_bytes.max(min_size);
        file.set_len(size).map_err(|e| Error::file(path, e))?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::file(path, e))?;
        mmap.fill(0);

        let now = now_ns();
        unsafe {
            SegmentHeader::init(mmap.as_mut_ptr() as *mut SegmentHeader, kind, bucket_count, now);
            ProcessRwLock::init(mmap.as_mut_ptr().add(SEGMENT_HEADER_SIZE))
                .map_err(|e| Error::file(path, e))?;
            ProcessMutex::init(mmap.as_mut_ptr().add(GROWTH_LOCK_OFFSET))
                .map_err(|e| Error::file(path, e))?;
            (*(mmap.as_mut_ptr() as *mut SegmentHeader))
                .total_size
                .store(size, Ordering::Relaxed);
        }
        mmap.flush().map_err(|e| Error::file(path, e))?;

        tracing::debug!(path = %path.display(), size, "created segment");

        let base = mmap.as_mut_ptr();
        Ok(Segment {
            base: AtomicPtr::new(base),
            mapped_len: AtomicU64::new(size),
            mappings: Mutex::new(vec![mmap]),
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Segment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::file(path, e))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::file(path, e))?;

        if mmap.len() < SEGMENT_HEADER_SIZE {
            return Err(Error::format(format!(
                "{} is too small to contain a segment header",
                path.display()
            )));
        }
        let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };
        if !header.is_magic_valid() {
            return Err(Error::format(format!("bad magic in {}", path.display())));
        }
        if header.version != FORMAT_VERSION {
            return Err(Error::format(format!(
                "unsupported format version {} in {}",
                header.version,
                path.display()
            )));
        }

        tracing::debug!(path = %path.display(), "opened segment");

        let mapped_len = mmap.len() as u64;
        let base = mmap.as_mut_ptr();
        Ok(Segment {
            base: AtomicPtr::new(base),
            mapped_len: AtomicU64::new(mapped_len),
            mappings: Mutex::new(vec![mmap]),
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base_ptr() as *const SegmentHeader) }
    }

    /// The segment-wide structural lock. Sequence and Queue take the write
    /// side for every mutation; the hash engine only takes it for
    /// directory construction at `open`, relying on per-bucket mutexes for
    /// everything else. The Stack takes the *read* side in `push`/`pop` —
    /// an OS rwlock never blocks concurrent readers against each other, so
    /// this costs nothing beyond the atomic increment/decrement and leaves
    /// the head-offset CAS loop itself lock-free — and the write side in
    /// its rarer `search`/`remove_specific`/`remove_expired`/`clear`,
    /// which need exclusive access to walk the spine safely. Cheap to
    /// construct: `ProcessRwLock` is just a pointer into the lock region,
    /// initialized once in `create`.
    pub fn structural_lock(&self) -> ProcessRwLock {
        unsafe { ProcessRwLock::from_existing(self.base_ptr().add(SEGMENT_HEADER_SIZE)) }
    }

    /// The dedicated allocator-growth mutex. Serializes the "extend the
    /// file and add a mapping" step in `grow`, independent of
    /// `structural_lock` so bucket-lock holders (hash engine) and the
    /// lock-free stack can trigger growth without ever acquiring the
    /// collection's header lock (see locking-order note on `Segment`).
    fn growth_lock(&self) -> ProcessMutex {
        unsafe { ProcessMutex::from_existing(self.base_ptr().add(GROWTH_LOCK_OFFSET)) }
    }

    /// Current base pointer, valid to dereference at any time: callers
    /// never need to hold a lock to call this, since `grow` only ever adds
    /// mappings, never removes the one this pointer was read from.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base.load(Ordering::Acquire)
    }

    pub fn resolve(&self, offset: i64) -> *mut u8 {
        debug_assert!(offset >= 0, "attempt to resolve a sentinel offset");
        unsafe { self.base_ptr().add(offset as usize) }
    }

    /// Picks up a remap performed by another process, lock-free. Safe to
    /// call from any thread at any time: worst case it races a concurrent
    /// `remap_to_at_least` and both install a (redundant but valid)
    /// mapping, or it observes a slightly stale `total_size` and retries
    /// on the next call.
    pub fn sync_mapping(&self) -> Result<()> {
        let total = self.header().total_size.load(Ordering::Acquire);
        if self.mapped_len.load(Ordering::Acquire) < total {
            self.remap_to_at_least(total)?;
        }
        Ok(())
    }

    fn remap_to_at_least(&self, min_len: u64) -> Result<()> {
        let mut mappings = self.mappings.lock();
        if self.mapped_len.load(Ordering::Acquire) >= min_len {
            return Ok(());
        }
        let mut new_mmap =
            unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| Error::file(&self.path, e))?;
        let new_len = new_mmap.len() as u64;
        let new_ptr = new_mmap.as_mut_ptr();
        mappings.push(new_mmap);
        self.base.store(new_ptr, Ordering::Release);
        self.mapped_len.store(new_len, Ordering::Release);
        Ok(())
    }

    /// Allocate `size` bytes, returning their offset. Thread- and
    /// process-safe on its own: the free-list pop and the bump-pointer
    /// advance are both single `compare_exchange` operations on atomics
    /// that live in the shared header, so callers need no lock beyond
    /// whatever their own structure (list splice, bucket chain) requires.
    /// Growth, on the rare path where the bump pointer is exhausted, is
    /// internally serialized by `growth_lock`.
    pub fn allocate(&self, size: usize) -> Result<i64> {
        let size = round_up(size, 64) as u64;
        self.sync_mapping()?;

        if let Some(offset) = self.take_from_free_list(size) {
            return Ok(offset);
        }

        loop {
            let header = self.header();
            let total = header.total_size.load(Ordering::Acquire);
            let start = header.next_free_offset.load(Ordering::Acquire);
            if start + size > total {
                if start + size > MAX_SEGMENT_SIZE {
                    return Err(Error::AllocFailed { requested: size as usize });
                }
                self.grow((start + size - total) as usize)?;
                continue;
            }
            if header
                .next_free_offset
                .compare_exchange(start, start + size, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                header.modified_at_ns.store(now_ns(), Ordering::Relaxed);
                return Ok(start as i64);
            }
            // Lost the race to another allocator; retry with a fresh read.
        }
    }

    fn take_from_free_list(&self, size: u64) -> Option<i64> {
        let header = self.header();
        loop {
            let cur = header.free_list_head.load(Ordering::Acquire);
            if cur == SENTINEL {
                return None;
            }
            let block = unsafe { &*(self.resolve(cur) as *const FreeBlockHeader) };
            if block.size < size {
                // First-fit over a singly-linked free list; a block too
                // small to satisfy `size` leaves it for a future request
                // and falls through to the bump allocator instead of
                // walking past it (collections allocate few distinct
                // sizes, so the list is short and this is rare).
                return None;
            }
            let next = block.next_offset.load(Ordering::Acquire);
            if header
                .free_list_head
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(cur);
            }
            // Another allocator popped first; retry against the new head.
        }
    }

    /// Return a previously allocated block to the free list. Safe to call
    /// without any external lock: the free-list push is a single CAS loop
    /// on `free_list_head`.
    pub fn deallocate(&self, offset: i64, size: usize) {
        let _ = self.sync_mapping();
        let size = round_up(size, 64) as u64;
        let header = self.header();
        let block_ptr = self.resolve(offset) as *mut FreeBlockHeader;
        loop {
            let old_head = header.free_list_head.load(Ordering::Acquire);
            unsafe {
                std::ptr::write(
                    block_ptr,
                    FreeBlockHeader {
                        size,
                        next_offset: std::sync::atomic::AtomicI64::new(old_head),
                    },
                );
            }
            if header
                .free_list_head
                .compare_exchange(old_head, offset, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        header.modified_at_ns.store(now_ns(), Ordering::Relaxed);
    }

    /// Atomically fetch the offset of a named record, constructing it with
    /// `init` if absent. Callers must hold the structural write lock.
    pub fn find_or_construct<T>(
        &self,
        name: &str,
        init: impl FnOnce(*mut T) -> Result<()>,
    ) -> Result<i64> {
        self.find_or_construct_bytes(name, std::mem::size_of::<T>(), |ptr| init(ptr as *mut T))
    }

    /// Byte-oriented form of `find_or_construct`, for named objects whose
    /// size is only known at runtime (e.g. the hash engine's bucket array,
    /// sized by `bucket_count`).
    pub fn find_or_construct_bytes(
        &self,
        name: &str,
        size: usize,
        init: impl FnOnce(*mut u8) -> Result<()>,
    ) -> Result<i64> {
        self.sync_mapping()?;
        let header = self.header();
        let count = header.directory_count.load(Ordering::Acquire) as usize;
        for i in 0..count {
            let entry = unsafe { &*self.directory_entry_ptr(i) };
            if entry.name_matches(name) {
                return Ok(entry.offset.load(Ordering::Acquire));
            }
        }
        if count >= DIRECTORY_CAPACITY {
            return Err(Error::format("named-object directory is full"));
        }
        let offset = self.allocate(size)?;
        let ptr = self.resolve(offset);
        init(ptr)?;

        let entry_ptr = self.directory_entry_ptr(count);
        unsafe {
            std::ptr::write(
                entry_ptr,
                DirectoryEntry {
                    name: layout::encode_name(name),
                    offset: std::sync::atomic::AtomicI64::new(offset),
                },
            );
        }
        header
            .directory_count
            .store((count + 1) as u32, Ordering::Release);
        Ok(offset)
    }

    fn directory_entry_ptr(&self, index: usize) -> *mut DirectoryEntry {
        let offset = DIRECTORY_OFFSET + index * std::mem::size_of::<DirectoryEntry>();
        unsafe { self.base_ptr().add(offset) as *mut DirectoryEntry }
    }

    /// Extend the backing file and add a fresh mapping covering it.
    /// Internally serialized by `growth_lock` so concurrent callers (a
    /// bucket-lock holder and the lock-free stack, say) never both extend
    /// the file for the same shortfall; never unmaps anything already
    /// mapped, so it never races a concurrent lock-free `resolve`.
    pub fn grow(&self, additional_bytes: usize) -> Result<()> {
        let growth_lock = self.growth_lock();
        let _guard = growth_lock.lock();

        let header = self.header();
        let old_size = header.total_size.load(Ordering::Acquire);
        let growth = (additional_bytes as u64).max(old_size / 2).max(MIN_GROWTH);
        let new_size = old_size + growth;

        tracing::warn!(
            path = %self.path.display(),
            old_size,
            new_size,
            "growing segment"
        );

        self.file
            .set_len(new_size)
            .map_err(|e| Error::file(&self.path, e))?;
        header.total_size.store(new_size, Ordering::Release);
        self.remap_to_at_least(new_size)
    }

    pub fn flush(&self) -> Result<()> {
        self.mappings
            .lock()
            .last_mut()
            .expect("segment always has at least one mapping")
            .flush()
            .map_err(|e| Error::file(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "persist_collections_segment_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn create_then_open_round_trips_header() {
        let path = temp_path("create_open");
        let _ = std::fs::remove_file(&path);
        {
            let seg = Segment::create(&path, 1 << 20, CollectionKind::Map, 1024).unwrap();
            assert!(seg.header().is_magic_valid());
            assert_eq!(seg.header().bucket_count, 1024);
        }
        let seg = Segment::open(&path).unwrap();
        assert!(seg.header().is_magic_valid());
        assert_eq!(seg.header().bucket_count, 1024);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn allocate_deallocate_reuses_block() {
        let path = temp_path("alloc_reuse");
        let _ = std::fs::remove_file(&path);
        let seg = Segment::create(&path, 1 << 20, CollectionKind::Sequence, 0).unwrap();
        let a = seg.allocate(64).unwrap();
        seg.deallocate(a, 64);
        let b = seg.allocate(64).unwrap();
        assert_eq!(a, b);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn allocate_past_capacity_grows() {
        let path = temp_path("grow");
        let _ = std::fs::remove_file(&path);
        let seg = Segment::create(&path, data_region_offset() as u64 + 64, CollectionKind::Sequence, 0).unwrap();
        let before = seg.header().total_size.load(Ordering::Relaxed);
        for _ in 0..(1 << 16) / 64 + 10 {
            seg.allocate(64).unwrap();
        }
        let after = seg.header().total_size.load(Ordering::Relaxed);
        assert!(after > before);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn find_or_construct_is_idempotent() {
        let path = temp_path("directory");
        let _ = std::fs::remove_file(&path);
        let seg = Segment::create(&path, 1 << 20, CollectionKind::Map, 16).unwrap();
        let off1 = seg
            .find_or_construct::<u64>("widgets", |p| {
                unsafe { *p = 7 };
                Ok(())
            })
            .unwrap();
        let off2 = seg
            .find_or_construct::<u64>("widgets", |p| {
                unsafe { *p = 999 };
                Ok(())
            })
            .unwrap();
        assert_eq!(off1, off2);
        let value = unsafe { *(seg.resolve(off1) as *const u64) };
        assert_eq!(value, 7);
        std::fs::remove_file(&path).unwrap();
    }
}
