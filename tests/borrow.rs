use compute_map::{ComputeOp, HashMap};
use std::sync::Arc;
use std::thread;

// keys are `String`, lookups go through `&str`

fn names() -> Vec<String> {
    (0..64).map(|i| format!("key-{}", i)).collect()
}

#[test]
fn lookups_by_str() {
    let map = HashMap::<String, usize>::new();
    let guard = map.guard();
    assert_eq!(map.get("foo", &guard), None);
    assert_eq!(map.remove("foo", &guard), None);

    map.compute_v2("foo".to_string(), |_| ComputeOp::Update(0), &guard);
    assert_eq!(map.get("foo", &guard), Some(&0));
    assert!(map.contains_key("foo", &guard));
    assert_eq!(
        map.get_key_value("foo", &guard),
        Some((&"foo".to_string(), &0))
    );

    assert_eq!(map.insert("foo".to_string(), 1, &guard), Some(&0));
    assert_eq!(map.remove("foo", &guard), Some(&1));
    assert_eq!(map.get("foo", &guard), None);
}

#[test]
fn compute_then_borrowed_lookup() {
    let map = HashMap::<String, usize>::new();
    let guard = map.guard();

    for _ in 0..3 {
        map.compute_v2(
            "foo".to_string(),
            |v| ComputeOp::Update(v.map_or(1, |v| v + 1)),
            &guard,
        );
    }
    assert_eq!(map.get("foo", &guard), Some(&3));
    assert_eq!(map.remove_entry("foo", &guard), Some((&"foo".to_string(), &3)));
    assert!(!map.contains_key("foo", &guard));
}

#[test]
#[cfg_attr(miri, ignore)]
fn racing_computes_then_str_lookups() {
    let map = Arc::new(HashMap::<String, usize>::new());

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let guard = map.guard();
                for name in names() {
                    map.compute_v2(name, |v| ComputeOp::Update(v.map_or(1, |v| v + 1)), &guard);
                }
            })
        })
        .collect();
    for w in writers {
        w.join().expect("failed to join thread");
    }

    let guard = map.guard();
    for name in names() {
        assert_eq!(map.get(name.as_str(), &guard), Some(&2));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn racing_str_removes() {
    let map = Arc::new(HashMap::<String, usize>::new());
    {
        let guard = map.guard();
        for (i, name) in names().into_iter().enumerate() {
            map.insert(name, i, &guard);
        }
    }

    let removers: Vec<_> = (0..2)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let guard = map.guard();
                let mut won = 0;
                for (i, name) in names().iter().enumerate() {
                    if let Some(v) = map.remove(name.as_str(), &guard) {
                        assert_eq!(*v, i);
                        won += 1;
                    }
                }
                won
            })
        })
        .collect();
    let won: usize = removers
        .into_iter()
        .map(|r| r.join().expect("failed to join thread"))
        .sum();

    assert_eq!(won, 64);
    assert!(map.is_empty());
}
