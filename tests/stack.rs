use persist_collections::stack::Stack;
use std::sync::Arc;

fn scratch() -> tempfile::TempPath {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.into_temp_path()
}

#[test]
fn lifo_order_push_pop() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let stack = Stack::open(&path, 1 << 20, true).unwrap();

    stack.push(b"a", -1).unwrap();
    stack.push(b"b", -1).unwrap();
    stack.push(b"c", -1).unwrap();

    assert_eq!(stack.pop().unwrap(), Some(b"c".to_vec()));
    assert_eq!(stack.pop().unwrap(), Some(b"b".to_vec()));
    assert_eq!(stack.pop().unwrap(), Some(b"a".to_vec()));
    assert_eq!(stack.pop().unwrap(), None);
}

#[test]
fn lifo_order_survives_close_and_reopen() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    {
        let stack = Stack::open(&path, 1 << 20, true).unwrap();
        stack.push(b"first", -1).unwrap();
        stack.push(b"second", -1).unwrap();
        stack.flush().unwrap();
    }
    {
        let stack = Stack::open(&path, 1 << 20, false).unwrap();
        assert_eq!(stack.pop().unwrap(), Some(b"second".to_vec()));
        assert_eq!(stack.pop().unwrap(), Some(b"first".to_vec()));
    }
}

#[test]
fn concurrent_push_pop_preserves_total_count() {
    let path = scratch();
    std::fs::remove_file(&path).ok();
    let stack = Arc::new(Stack::open(&path, 8 << 20, true).unwrap());

    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 500;

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let stack = stack.clone();
            std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let payload = format!("producer-{id}-item-{i}");
                    stack.push(payload.as_bytes(), -1).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(stack.size(), PRODUCERS * PER_PRODUCER);

    let mut popped = 0usize;
    while stack.pop().unwrap().is_some() {
        popped += 1;
    }
    assert_eq!(popped, PRODUCERS * PER_PRODUCER);
    assert!(stack.is_empty());
}
