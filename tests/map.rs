use persist_collections::map::Map;
use std::time::Duration;

fn scratch() -> tempfile::TempPath {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.into_temp_path()
}

#[test]
fn put_overwrites_and_refreshes_ttl() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let map = Map::open(&path, 1 << 20, true, 64).unwrap();

    map.put(b"key", b"v1", -1).unwrap();
    assert_eq!(map.get(b"key"), Some(b"v1".to_vec()));

    map.put(b"key", b"v2-longer-value", -1).unwrap();
    assert_eq!(map.get(b"key"), Some(b"v2-longer-value".to_vec()));
    assert_eq!(map.size(), 1);
}

#[test]
fn put_if_absent_evicts_stale_entry_before_inserting() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let map = Map::open(&path, 1 << 20, true, 64).unwrap();

    assert!(map.put_if_absent(b"key", b"first", 0).unwrap());
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(map.get(b"key"), None);

    // the first value expired; put_if_absent must evict the stale record and
    // succeed rather than leaving it orphaned in the bucket chain
    assert!(map.put_if_absent(b"key", b"second", -1).unwrap());
    assert_eq!(map.get(b"key"), Some(b"second".to_vec()));
    assert_eq!(map.size(), 1);

    assert!(!map.put_if_absent(b"key", b"third", -1).unwrap());
    assert_eq!(map.get(b"key"), Some(b"second".to_vec()));
}

#[test]
fn remove_and_ttl_queries() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let map = Map::open(&path, 1 << 20, true, 64).unwrap();

    map.put(b"key", b"value", 30).unwrap();
    let ttl = map.get_ttl(b"key").unwrap();
    assert!(ttl > 0 && ttl <= 30);

    assert_eq!(map.remove(b"key").unwrap(), Some(b"value".to_vec()));
    assert_eq!(map.get(b"key"), None);
    assert!(map.is_empty());
}
