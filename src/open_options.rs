//! Builder-style configuration surface over each collection's
//! `open`/`create`, mirroring `std::fs::OpenOptions` (already the shape
//! `segment::Segment` itself is built on) so a caller with knobs beyond the
//! default can set them once and get back any of the five collection
//! types, instead of remembering each positional-argument signature.
//!
//! This does not replace the direct `Sequence::open`/`Map::open`/etc.
//! constructors — those stay as the minimal, always-available surface —
//! it only adds a convenience layer for callers that want named options.

use std::path::Path;

use crate::error::Result;
use crate::map::{Map, DEFAULT_BUCKET_COUNT as MAP_DEFAULT_BUCKET_COUNT};
use crate::queue::Queue;
use crate::segment::DEFAULT_INITIAL_SIZE;
use crate::sequence::Sequence;
use crate::set::Set;
use crate::stack::Stack;

/// Configuration for opening or creating any of the five collection types.
///
/// `bucket_count` is only consulted by [`OpenOptions::open_map`] and
/// [`OpenOptions::open_set`]; the ordered/deque/stack engines ignore it.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    initial_size_bytes: u64,
    create_new: bool,
    bucket_count: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            initial_size_bytes: DEFAULT_INITIAL_SIZE,
            create_new: false,
            bucket_count: MAP_DEFAULT_BUCKET_COUNT,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size to create the backing file at if it doesn't already exist.
    /// Default 64 MiB; the segment grows on demand past this regardless.
    pub fn initial_size_bytes(mut self, bytes: u64) -> Self {
        self.initial_size_bytes = bytes;
        self
    }

    /// If `true`, truncate/replace any existing file at the target path.
    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    /// Bucket count for `open_map`/`open_set`; rounded up to a power of two
    /// (minimum 2). Ignored by the ordered/deque/stack engines.
    pub fn bucket_count(mut self, bucket_count: u32) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn open_sequence(&self, path: &Path) -> Result<Sequence> {
        Sequence::open(path, self.initial_size_bytes, self.create_new)
    }

    pub fn open_queue(&self, path: &Path) -> Result<Queue> {
        Queue::open(path, self.initial_size_bytes, self.create_new)
    }

    pub fn open_stack(&self, path: &Path) -> Result<Stack> {
        Stack::open(path, self.initial_size_bytes, self.create_new)
    }

    pub fn open_map(&self, path: &Path) -> Result<Map> {
        Map::open(path, self.initial_size_bytes, self.create_new, self.bucket_count)
    }

    pub fn open_set(&self, path: &Path) -> Result<Set> {
        Set::open(path, self.initial_size_bytes, self.create_new, self.bucket_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "persist_collections_open_options_test_{name}_{}",
            std::process::id()
        ))
    }

    #[test]
    fn builder_defaults_match_create_helpers() {
        let path = temp_path("defaults");
        let _ = std::fs::remove_file(&path);
        let seq = OpenOptions::new().create_new(true).open_sequence(&path).unwrap();
        seq.push_tail(b"a", -1).unwrap();
        assert_eq!(seq.get_at(0), Some(b"a".to_vec()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn builder_threads_bucket_count_into_map() {
        let path = temp_path("bucket_count");
        let _ = std::fs::remove_file(&path);
        let map = OpenOptions::new()
            .create_new(true)
            .bucket_count(7)
            .open_map(&path)
            .unwrap();
        map.put(b"k", b"v", -1).unwrap();
        assert_eq!(map.get(b"k"), Some(b"v".to_vec()));
        let stats = map.stats();
        assert_eq!(stats.bucket_count, 8); // rounded up to a power of two
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn builder_reopens_existing_file_without_truncating() {
        let path = temp_path("reopen");
        let _ = std::fs::remove_file(&path);
        {
            let stack = OpenOptions::new().create_new(true).open_stack(&path).unwrap();
            stack.push(b"a", -1).unwrap();
            stack.flush().unwrap();
        }
        {
            let stack = OpenOptions::new().create_new(false).open_stack(&path).unwrap();
            assert_eq!(stack.pop().unwrap(), Some(b"a".to_vec()));
        }
        std::fs::remove_file(&path).unwrap();
    }
}
