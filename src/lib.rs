//! Persistent, process-shareable collections backed by a single
//! memory-mapped file per collection: an ordered sequence, a unique set, a
//! key-value map, a FIFO/deque queue, and a LIFO stack. Every element may
//! carry a TTL; expired elements are invisible to readers and reclaimed
//! lazily by the collection that encounters them (or eagerly by
//! `remove_expired`). Contents survive process restart and are visible to
//! every process that opens the same backing file.
//!
//! The engine only moves opaque `&[u8]` buffers — key/value encoding,
//! object lifecycle, and language bindings are the embedder's concern.
//!
//! ```no_run
//! use persist_collections::sequence::Sequence;
//!
//! persist_collections::init();
//! let seq = Sequence::create(std::path::Path::new("/tmp/example.seq")).unwrap();
//! seq.push_tail(b"hello", -1).unwrap();
//! assert_eq!(seq.get_at(0), Some(b"hello".to_vec()));
//! ```

pub mod clock;
pub mod entry;
pub mod error;
pub mod hashcommon;
pub mod map;
pub mod open_options;
pub mod queue;
pub mod segment;
pub mod sequence;
pub mod set;
pub mod stack;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Marks the process as having initialized this library. Collections can be
/// opened without calling this first — there is no global state that
/// requires it — but embedders (particularly language bindings) use it as
/// a single well-known place to install a `tracing` subscriber or otherwise
/// prepare process-wide state exactly once. Idempotent.
pub fn init() {
    INITIALIZED.store(true, Ordering::Release);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Reverses `init()`. Does not close or flush any open collection; callers
/// are responsible for dropping their own `Sequence`/`Set`/`Map`/`Queue`/
/// `Stack` handles first.
pub fn shutdown() {
    INITIALIZED.store(false, Ordering::Release);
}
