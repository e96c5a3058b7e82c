use compute_map::{ComputeOp, HashMap};
use rand::Rng;
use std::sync::Arc;
use std::thread;

const PER_THREAD: usize = 128;
const REPEATS: usize = 64;

type Map = HashMap<u64, u64>;

/// Ways of associating a fresh key with a value.
type Associate = fn(&Map, u64);

fn via_insert(map: &Map, key: u64) {
    map.insert(key, key, &map.guard());
}

fn via_compute(map: &Map, key: u64) {
    map.compute(key, |_| Some(key), &map.guard());
}

fn via_compute_v2(map: &Map, key: u64) {
    map.compute_v2(key, |_| ComputeOp::Update(key), &map.guard());
}

fn via_try_insert(map: &Map, key: u64) {
    let _ = map.try_insert(key, key, &map.guard());
}

/// Every thread associates random keys and must see each of its own keys immediately.
fn associate_from_all_threads(associate: Associate) {
    for _ in 0..REPEATS {
        let map = Arc::new(Map::new());
        let workers: Vec<_> = (0..num_cpus::get().min(8))
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..PER_THREAD {
                        let key = rng.gen();
                        associate(&map, key);
                        let guard = map.guard();
                        assert_eq!(map.get(&key, &guard), Some(&key));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("failed to join thread");
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn insert_is_visible() {
    associate_from_all_threads(via_insert);
}

#[test]
#[cfg_attr(miri, ignore)]
fn compute_is_visible() {
    associate_from_all_threads(via_compute);
}

#[test]
#[cfg_attr(miri, ignore)]
fn compute_v2_is_visible() {
    associate_from_all_threads(via_compute_v2);
}

#[test]
#[cfg_attr(miri, ignore)]
fn try_insert_is_visible() {
    associate_from_all_threads(via_try_insert);
}
