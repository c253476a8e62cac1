use persist_collections::sequence::Sequence;
use std::time::Duration;

fn scratch() -> tempfile::TempPath {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.into_temp_path()
}

#[test]
fn expired_entries_are_skipped_on_read() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let seq = Sequence::open(&path, 1 << 20, true).unwrap();

    seq.push_tail(b"first", -1).unwrap();
    seq.push_tail(b"short-lived", 0).unwrap();
    seq.push_tail(b"third", -1).unwrap();
    std::thread::sleep(Duration::from_millis(5));

    // the expired middle entry is invisible, so live indices collapse around it
    assert_eq!(seq.size(), 2);
    assert_eq!(seq.get_at(0), Some(b"first".to_vec()));
    assert_eq!(seq.get_at(1), Some(b"third".to_vec()));
    assert!(!seq.contains(b"short-lived"));

    assert_eq!(seq.remove_expired().unwrap(), 1);
    assert_eq!(seq.size(), 2);
}

#[test]
fn persists_across_reopen() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    {
        let seq = Sequence::open(&path, 1 << 20, true).unwrap();
        seq.push_tail(b"a", -1).unwrap();
        seq.push_tail(b"b", -1).unwrap();
        seq.flush().unwrap();
    }
    {
        let seq = Sequence::open(&path, 1 << 20, false).unwrap();
        assert_eq!(seq.size(), 2);
        assert_eq!(seq.get_at(0), Some(b"a".to_vec()));
        assert_eq!(seq.get_at(1), Some(b"b".to_vec()));
    }
}

#[test]
fn insert_and_remove_at_arbitrary_index() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let seq = Sequence::open(&path, 1 << 20, true).unwrap();
    seq.push_tail(b"a", -1).unwrap();
    seq.push_tail(b"c", -1).unwrap();
    seq.insert_at(1, b"b", -1).unwrap();

    assert_eq!(seq.get_at(0), Some(b"a".to_vec()));
    assert_eq!(seq.get_at(1), Some(b"b".to_vec()));
    assert_eq!(seq.get_at(2), Some(b"c".to_vec()));

    assert_eq!(seq.remove_at(1).unwrap(), Some(b"b".to_vec()));
    assert_eq!(seq.size(), 2);
    assert_eq!(seq.index_of(b"c"), Some(1));
}
