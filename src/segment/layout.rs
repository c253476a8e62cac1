//! `#[repr(C)]` structures that live at fixed offsets in the memory-mapped
//! segment. Fixed-size fields and explicit padding keep the layout
//! identical across compilations and processes: a growable segment with a
//! bump/free-list allocator and a small named-object directory.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64};

use crate::entry::{FORMAT_VERSION, MAGIC, SENTINEL};
use crate::segment::lock::LOCK_SIZE;
use crate::segment::mutex::MUTEX_SIZE;

/// Which collection kind a segment's header describes. Stored so
/// `is_valid`/`stats` can sanity-check a file without opening it as the
/// wrong engine.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CollectionKind {
    Sequence = 0,
    Set = 1,
    Map = 2,
    Queue = 3,
    Stack = 4,
}

impl CollectionKind {
    pub fn from_u32(v: u32) -> Option<CollectionKind> {
        match v {
            0 => Some(CollectionKind::Sequence),
            1 => Some(CollectionKind::Set),
            2 => Some(CollectionKind::Map),
            3 => Some(CollectionKind::Queue),
            4 => Some(CollectionKind::Stack),
            _ => None,
        }
    }
}

pub const SEGMENT_HEADER_SIZE: usize = 256;

/// Fixed record at offset 0 of every segment. Combines the Segment
/// Manager's own bookkeeping (magic, version, sizes, allocator state,
/// directory count) with the Collection Header fields common to all five
/// engines (element count, structural lock is stored separately
/// immediately after this header) plus the handful of variant-specific
/// atomics (head/tail/front/back/bucket_count) every engine uses a subset
/// of. The Stack's ABA-avoidance counter is not one of these: it lives in
/// the named-object directory as "stack_aba_tag", same as the hash
/// engines' bucket arrays, rather than being a header field only one
/// engine touches. Fields are ordered 8-byte-first to avoid implicit
/// padding.
#[repr(C)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub kind: u32,
    pub bucket_count: u32,

    pub created_at_ns: u64,
    pub modified_at_ns: AtomicU64,
    pub total_size: AtomicU64,
    pub next_free_offset: AtomicU64,
    pub free_list_head: AtomicI64,
    pub element_count: AtomicU64,

    /// Sequence: head. Queue/Stack: front/top.
    pub head_offset: AtomicI64,
    /// Sequence/Queue: tail/back. Unused by Set/Map/Stack.
    pub tail_offset: AtomicI64,

    pub directory_count: AtomicU32,
    _reserved: [u8; 172],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

impl SegmentHeader {
    /// # Safety
    /// `ptr` must point to at least `SEGMENT_HEADER_SIZE` writable, zeroed
    /// bytes.
    pub unsafe fn init(ptr: *mut SegmentHeader, kind: CollectionKind, bucket_count: u32, now_ns: u64) {
        std::ptr::write_bytes(ptr as *mut u8, 0, SEGMENT_HEADER_SIZE);
        (*ptr).magic = MAGIC;
        (*ptr).version = FORMAT_VERSION;
        (*ptr).kind = kind as u32;
        (*ptr).bucket_count = bucket_count;
        (*ptr).created_at_ns = now_ns;
        (*ptr).modified_at_ns = AtomicU64::new(now_ns);
        (*ptr).next_free_offset = AtomicU64::new(data_region_offset() as u64);
        (*ptr).free_list_head = AtomicI64::new(SENTINEL);
        (*ptr).element_count = AtomicU64::new(0);
        (*ptr).head_offset = AtomicI64::new(SENTINEL);
        (*ptr).tail_offset = AtomicI64::new(SENTINEL);
        (*ptr).directory_count = AtomicU32::new(0);
    }

    pub fn is_magic_valid(&self) -> bool {
        self.magic == MAGIC
    }
}

/// Directory entries stored immediately after the segment header and its
/// embedded structural lock. Fixed capacity: every engine needs at most one
/// extra named object beyond the header itself ("map_buckets"/"set_buckets"
/// for Map/Set, "stack_aba_tag" for Stack) — four slots leaves headroom for
/// future named objects without another format revision.
pub const DIRECTORY_CAPACITY: usize = 4;
pub const DIRECTORY_NAME_LEN: usize = 32;

#[repr(C)]
pub struct DirectoryEntry {
    pub name: [u8; DIRECTORY_NAME_LEN],
    pub offset: AtomicI64,
}

const _: () = assert!(std::mem::size_of::<DirectoryEntry>() == 40);

/// Offset of the dedicated growth mutex, embedded right after the
/// structural rwlock. Serializes the rare "extend the file and remap"
/// step across threads/processes without requiring callers to hold the
/// collection's structural lock — the hash engine calls into the
/// allocator while holding only a bucket mutex, and the locking order
/// that governs this engine says it must never also acquire the header
/// lock, so growth gets its own lock instead of reusing
/// `structural_lock()`.
pub const GROWTH_LOCK_OFFSET: usize = SEGMENT_HEADER_SIZE + LOCK_SIZE;
pub const GROWTH_LOCK_SIZE: usize = MUTEX_SIZE;

pub const DIRECTORY_OFFSET: usize = GROWTH_LOCK_OFFSET + GROWTH_LOCK_SIZE;
pub const DIRECTORY_SIZE: usize = DIRECTORY_CAPACITY * std::mem::size_of::<DirectoryEntry>();

/// Byte offset at which the allocator's bump/free region begins: right
/// after the header, structural lock, and directory table.
pub fn data_region_offset() -> usize {
    round_up(DIRECTORY_OFFSET + DIRECTORY_SIZE, 64)
}

/// Header of a block currently on the allocator's free list. Lives at the
/// start of the freed block's bytes; overwritten the moment the block is
/// reused.
#[repr(C)]
pub struct FreeBlockHeader {
    pub size: u64,
    pub next_offset: AtomicI64,
}

const _: () = assert!(std::mem::size_of::<FreeBlockHeader>() == 16);

pub fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

pub fn encode_name(name: &str) -> [u8; DIRECTORY_NAME_LEN] {
    let bytes = name.as_bytes();
    debug_assert!(
        bytes.len() <= DIRECTORY_NAME_LEN,
        "directory object name too long: {name}"
    );
    let mut buf = [0u8; DIRECTORY_NAME_LEN];
    let n = bytes.len().min(DIRECTORY_NAME_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

impl DirectoryEntry {
    pub fn name_matches(&self, name: &str) -> bool {
        self.name == encode_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_init_sets_magic_and_version() {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        let ptr = buf.as_mut_ptr() as *mut SegmentHeader;
        unsafe {
            SegmentHeader::init(ptr, CollectionKind::Map, 16384, 42);
            assert!((*ptr).is_magic_valid());
            assert_eq!((*ptr).version, FORMAT_VERSION);
            assert_eq!((*ptr).kind, CollectionKind::Map as u32);
            assert_eq!((*ptr).bucket_count, 16384);
        }
    }

    #[test]
    fn data_region_offset_is_64_aligned() {
        assert_eq!(data_region_offset() % 64, 0);
        assert!(data_region_offset() >= DIRECTORY_OFFSET + DIRECTORY_SIZE);
    }
}
