use persist_collections::set::Set;
use std::time::Duration;

fn scratch() -> tempfile::TempPath {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.into_temp_path()
}

#[test]
fn add_is_idempotent_and_dedups() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let set = Set::open(&path, 1 << 20, true, 64).unwrap();

    assert!(set.add(b"alpha", -1).unwrap());
    assert!(!set.add(b"alpha", -1).unwrap());
    assert_eq!(set.size(), 1);
    assert!(set.contains(b"alpha"));
}

#[test]
fn expired_member_is_refreshed_not_duplicated() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let set = Set::open(&path, 1 << 20, true, 64).unwrap();

    assert!(set.add(b"alpha", 0).unwrap());
    std::thread::sleep(Duration::from_millis(5));
    assert!(!set.contains(b"alpha"));

    // re-adding the now-expired member refreshes it in place rather than
    // growing the bucket chain with a duplicate record
    assert!(set.add(b"alpha", -1).unwrap());
    assert_eq!(set.size(), 1);
    assert!(set.contains(b"alpha"));
}

#[test]
fn remove_and_clear() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let set = Set::open(&path, 1 << 20, true, 64).unwrap();

    set.add(b"a", -1).unwrap();
    set.add(b"b", -1).unwrap();
    assert!(set.remove(b"a").unwrap());
    assert!(!set.remove(b"a").unwrap());
    assert_eq!(set.size(), 1);

    set.clear().unwrap();
    assert!(set.is_empty());
}
