use compute_map::{ComputeOp, Guard, HashMap};
use rand::prelude::*;

#[cfg(not(miri))]
const PRESENT: usize = 50_000;
#[cfg(miri)]
const PRESENT: usize = 12;

// more absent keys than present ones, so lookups mostly miss
#[cfg(not(miri))]
const ABSENT: usize = 1 << 17;
#[cfg(miri)]
const ABSENT: usize = 1 << 5;

type Map = HashMap<usize, usize>;

/// Runs `op` on every key and returns how many times it reported a hit.
fn hits<F>(map: &Map, keys: &[usize], mut op: F) -> usize
where
    F: FnMut(&Map, usize, &Guard<'_>) -> bool,
{
    let guard = map.guard();
    keys.iter().filter(|&&k| op(map, k, &guard)).count()
}

fn add_if_absent(map: &Map, key: usize, guard: &Guard<'_>) -> bool {
    let mut added = false;
    map.compute_v2(
        key,
        |old| match old {
            Some(_) => ComputeOp::Noop,
            None => {
                added = true;
                ComputeOp::Update(0)
            }
        },
        guard,
    );
    added
}

fn bump_if_present(map: &Map, key: usize, guard: &Guard<'_>) -> bool {
    let step = |old: Option<&usize>| match old {
        Some(v) => ComputeOp::Update(v + 1),
        None => ComputeOp::Noop,
    };
    map.compute_v2(key, step, guard).1
}

fn delete(map: &Map, key: usize, guard: &Guard<'_>) -> bool {
    matches!(
        map.compute_v2(key, |_| ComputeOp::Delete, guard),
        (Some(_), false)
    )
}

fn peek(map: &Map, key: usize, guard: &Guard<'_>) -> bool {
    // a transform that keeps whatever it sees is a read
    map.compute(key, |old| old.copied(), guard).1
}

fn lookup(map: &Map, key: usize, guard: &Guard<'_>) -> bool {
    map.get(&key, guard).is_some()
}

#[test]
fn phases() {
    let mut rng = rand::thread_rng();
    let mut all: Vec<usize> = (0..PRESENT + ABSENT).collect();
    all.shuffle(&mut rng);
    let (absent, present) = all.split_at(ABSENT);

    let map = Map::new();

    assert_eq!(hits(&map, present, add_if_absent), PRESENT);
    assert_eq!(hits(&map, present, add_if_absent), 0);
    assert_eq!(map.len(), PRESENT);

    assert_eq!(hits(&map, present, peek), PRESENT);
    assert_eq!(hits(&map, absent, peek), 0);
    assert_eq!(map.len(), PRESENT, "a read through compute must not insert");

    // lock-free reads agree with the compute path
    assert_eq!(hits(&map, present, lookup), PRESENT);
    assert_eq!(hits(&map, absent, lookup), 0);

    assert_eq!(hits(&map, absent, delete), 0);
    let every_other: Vec<usize> = present.iter().copied().step_by(2).collect();
    assert_eq!(hits(&map, &every_other, delete), every_other.len());
    let left = PRESENT - every_other.len();
    assert_eq!(map.len(), left);

    assert_eq!(hits(&map, present, bump_if_present), left);
    assert_eq!(hits(&map, absent, bump_if_present), 0);
    assert_eq!(map.len(), left, "a Noop on a missing key must not insert");

    let guard = map.guard();
    assert!(map.values(&guard).all(|&v| v == 1));
    drop(guard);

    assert_eq!(hits(&map, present, add_if_absent), every_other.len());
    assert_eq!(map.len(), PRESENT);

    let guard = map.guard();
    assert_eq!(map.keys(&guard).count(), PRESENT);
    assert_eq!(map.values(&guard).filter(|&&v| v == 0).count(), every_other.len());
    assert_eq!(map.iter(&guard).filter(|&(_, &v)| v == 1).count(), left);
}
