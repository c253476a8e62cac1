//! File-level utilities: existence/validity checks, deletion, and a
//! `serde`-serializable snapshot of a segment's header fields for
//! diagnostics/export, independent of any specific metrics pipeline.

use std::path::Path;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::entry::SENTINEL;
use crate::error::Result;
use crate::segment::layout::{CollectionKind, FreeBlockHeader};
use crate::segment::Segment;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub kind: String,
    pub format_version: u32,
    pub bucket_count: u32,
    pub created_at_ns: u64,
    pub modified_at_ns: u64,
    pub total_size_bytes: u64,
    pub next_free_offset: u64,
    pub element_count: u64,
    /// Bytes currently live, i.e. not sitting on the free list and not
    /// beyond the bump pointer.
    pub used_bytes: u64,
    /// Bytes reclaimable without growing the file: the free list plus the
    /// untouched region past the bump pointer.
    pub free_bytes: u64,
}

/// Read-only walk of the free list, for stats snapshots. Unlike
/// `Segment::take_from_free_list` this never pops anything.
fn free_list_bytes(segment: &Segment) -> u64 {
    let header = segment.header();
    let mut total = 0u64;
    let mut cur = header.free_list_head.load(Ordering::Acquire);
    while cur != SENTINEL {
        let block = unsafe { &*(segment.resolve(cur) as *const FreeBlockHeader) };
        total += block.size;
        cur = block.next_offset.load(Ordering::Acquire);
    }
    total
}

pub fn stats_of_segment(segment: &Segment) -> Stats {
    let header = segment.header();
    let kind = CollectionKind::from_u32(header.kind)
        .map(|k| format!("{k:?}"))
        .unwrap_or_else(|| "Unknown".to_string());
    let total_size_bytes = header.total_size.load(Ordering::Relaxed);
    let next_free_offset = header.next_free_offset.load(Ordering::Relaxed);
    let free_bytes = free_list_bytes(segment) + (total_size_bytes - next_free_offset);
    Stats {
        kind,
        format_version: header.version,
        bucket_count: header.bucket_count,
        created_at_ns: header.created_at_ns,
        modified_at_ns: header.modified_at_ns.load(Ordering::Relaxed),
        total_size_bytes,
        next_free_offset,
        element_count: header.element_count.load(Ordering::Relaxed),
        used_bytes: total_size_bytes - free_bytes,
        free_bytes,
    }
}

/// Opens the file read-only as a segment, snapshots its stats, and drops it.
pub fn stats(path: &Path) -> Result<Stats> {
    let segment = Segment::open(path)?;
    Ok(stats_of_segment(&segment))
}

/// True if `path` exists and its first bytes pass the segment magic/version
/// check. Never panics on a corrupt or foreign file; returns `false`
/// instead.
pub fn is_valid(path: &Path) -> bool {
    Segment::open(path).is_ok()
}

/// Removes the backing file. Not coordinated with other processes that may
/// still have it mapped; callers are responsible for ensuring no other
/// process needs this collection before calling.
pub fn delete(path: &Path) -> Result<()> {
    std::fs::remove_file(path).map_err(|e| crate::error::Error::file(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::layout::CollectionKind as Kind;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "persist_collections_stats_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn stats_reports_kind_and_counts() {
        let path = temp_path("basic");
        let _ = std::fs::remove_file(&path);
        {
            let segment = Segment::create(&path, 1 << 20, Kind::Set, 16).unwrap();
            segment.flush().unwrap();
        }
        let s = stats(&path).unwrap();
        assert_eq!(s.kind, "Set");
        assert_eq!(s.bucket_count, 16);
        assert_eq!(s.element_count, 0);
        assert!(is_valid(&path));
        delete(&path).unwrap();
        assert!(!is_valid(&path));
    }

    #[test]
    fn is_valid_false_for_missing_file() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);
        assert!(!is_valid(&path));
    }
}
