use persist_collections::entry::EntryHeader;
use proptest::prelude::*;

fn published_header(ttl_seconds: i32, created_at_ns: u64) -> [u8; std::mem::size_of::<EntryHeader>()] {
    let mut buf = [0u8; std::mem::size_of::<EntryHeader>()];
    let ptr = buf.as_mut_ptr() as *mut EntryHeader;
    unsafe {
        EntryHeader::init_empty(ptr);
        assert!((*ptr).begin_write());
        (*ptr).publish(0, 0, ttl_seconds, created_at_ns);
    }
    buf
}

proptest! {
    /// An infinite-TTL entry (`ttl_seconds < 0`) is alive at any later
    /// timestamp and reports `remaining_ttl_seconds == -1` forever.
    #[test]
    fn infinite_ttl_never_expires(created_at_ns in 0u64..1_000_000_000_000, elapsed_ns in 0u64..1_000_000_000_000) {
        let buf = published_header(-1, created_at_ns);
        let header = unsafe { &*(buf.as_ptr() as *const EntryHeader) };
        let now = created_at_ns.saturating_add(elapsed_ns);
        prop_assert!(header.is_alive(now));
        prop_assert_eq!(header.remaining_ttl_seconds(now), -1);
    }

    /// For a finite TTL, `is_alive` and `remaining_ttl_seconds` agree: alive
    /// iff remaining time is nonzero, and remaining time never exceeds the
    /// configured TTL.
    #[test]
    fn finite_ttl_remaining_is_consistent_with_liveness(
        ttl_seconds in 0i32..100_000,
        created_at_ns in 0u64..1_000_000_000_000,
        elapsed_seconds in 0u64..200_000,
    ) {
        let buf = published_header(ttl_seconds, created_at_ns);
        let header = unsafe { &*(buf.as_ptr() as *const EntryHeader) };
        let now = created_at_ns.saturating_add(elapsed_seconds * 1_000_000_000);

        let remaining = header.remaining_ttl_seconds(now);
        prop_assert!(remaining >= 0);
        prop_assert!(remaining <= ttl_seconds as i64);

        let alive = header.is_alive(now);
        prop_assert_eq!(alive, elapsed_seconds < ttl_seconds as u64);
        if !alive {
            prop_assert_eq!(remaining, 0);
        }
    }

    /// `remaining_ttl_seconds` is monotonically non-increasing as time
    /// advances for a fixed finite-TTL entry.
    #[test]
    fn remaining_ttl_is_monotonically_non_increasing(
        ttl_seconds in 1i32..100_000,
        created_at_ns in 0u64..1_000_000_000_000,
        step_seconds in 1u64..1_000,
    ) {
        let buf = published_header(ttl_seconds, created_at_ns);
        let header = unsafe { &*(buf.as_ptr() as *const EntryHeader) };

        let mut previous = header.remaining_ttl_seconds(created_at_ns);
        for step in 1..10u64 {
            let now = created_at_ns.saturating_add(step * step_seconds * 1_000_000_000);
            let current = header.remaining_ttl_seconds(now);
            prop_assert!(current <= previous);
            previous = current;
        }
    }
}
