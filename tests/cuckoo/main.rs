// Randomized stress test: two maps take the same stream of writes, one through
// insert/try_insert/remove and the other through compute, and both are checked against a
// per-key shadow copy after every step.

use compute_map::{ComputeOp, HashMap};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const KEYS: usize = 1 << 12;
const THREADS_PER_ROLE: usize = 4;
const RUN_FOR: Duration = Duration::from_secs(5);

struct Shared {
    plain: HashMap<usize, u64>,
    computed: HashMap<usize, u64>,
    /// The value each key should currently have in both maps. A thread holds a key's slot for
    /// the whole of its step, so the maps and the shadow change together.
    shadow: Vec<Mutex<Option<u64>>>,
    stop: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Shared {
            plain: HashMap::new(),
            computed: HashMap::new(),
            shadow: (0..KEYS).map(|_| Mutex::new(None)).collect(),
            stop: AtomicBool::new(false),
        }
    }

    fn running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }
}

fn writer(env: Arc<Shared>) {
    let mut rng = rand::thread_rng();
    let plain = env.plain.guard();
    let computed = env.computed.guard();
    while env.running() {
        let key = rng.gen_range(0..KEYS);
        let value: u64 = rng.gen();
        let Some(mut slot) = env.shadow[key].try_lock() else {
            continue;
        };

        let added = env.plain.try_insert(key, value, &plain).is_ok();
        let mut computed_added = false;
        let (now, present) = env.computed.compute_v2(
            key,
            |old| match old {
                Some(_) => ComputeOp::Noop,
                None => {
                    computed_added = true;
                    ComputeOp::Update(value)
                }
            },
            &computed,
        );

        assert_eq!(added, slot.is_none());
        assert_eq!(computed_added, slot.is_none());
        assert!(present);
        if added {
            *slot = Some(value);
        }
        assert_eq!(now.copied(), *slot);
        assert_eq!(env.plain.get(&key, &plain).copied(), *slot);
    }
}

fn updater(env: Arc<Shared>) {
    let mut rng = rand::thread_rng();
    let plain = env.plain.guard();
    let computed = env.computed.guard();
    while env.running() {
        let key = rng.gen_range(0..KEYS);
        let Some(mut slot) = env.shadow[key].try_lock() else {
            continue;
        };

        let Some(current) = *slot else {
            let bumped = env.computed.compute(key, |old| old.map(|v| v + 1), &computed);
            assert_eq!(bumped, (None, false));
            continue;
        };
        let next = current.wrapping_add(1);
        assert_eq!(env.plain.insert(key, next, &plain), Some(&current));
        let step = |old: Option<&u64>| ComputeOp::Update(old.map_or(0, |v| v.wrapping_add(1)));
        let bumped = env.computed.compute_v2(key, step, &computed);
        assert_eq!(bumped, (Some(&next), true));
        *slot = Some(next);
    }
}

fn deleter(env: Arc<Shared>) {
    let mut rng = rand::thread_rng();
    let plain = env.plain.guard();
    let computed = env.computed.guard();
    while env.running() {
        let key = rng.gen_range(0..KEYS);
        let Some(mut slot) = env.shadow[key].try_lock() else {
            continue;
        };

        let removed = env.plain.remove(&key, &plain).copied();
        let (deleted, present) = env.computed.compute(key, |_| None, &computed);
        assert_eq!(removed, *slot);
        assert_eq!(deleted.copied(), *slot);
        assert!(!present);
        assert!(!env.computed.contains_key(&key, &computed));
        *slot = None;
    }
}

fn reader(env: Arc<Shared>) {
    let mut rng = rand::thread_rng();
    while env.running() {
        let key = rng.gen_range(0..KEYS);
        let slot = env.shadow[key].lock();
        // fresh guards so readers do not hold back reclamation for the whole run
        let plain = env.plain.guard();
        let computed = env.computed.guard();
        assert_eq!(env.plain.get(&key, &plain).copied(), *slot);
        assert_eq!(env.computed.get(&key, &computed).copied(), *slot);
        assert_eq!(
            env.computed.compute_v2(key, |_| ComputeOp::Noop, &computed),
            (env.computed.get(&key, &computed), slot.is_some())
        );
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn stress_test() {
    let env = Arc::new(Shared::new());
    let roles: [fn(Arc<Shared>); 4] = [writer, updater, deleter, reader];

    let threads: Vec<_> = roles
        .iter()
        .flat_map(|&role| (0..THREADS_PER_ROLE).map(move |_| role))
        .map(|role| {
            let env = Arc::clone(&env);
            thread::spawn(move || role(env))
        })
        .collect();

    thread::sleep(RUN_FOR);
    env.stop.store(true, Ordering::SeqCst);
    for t in threads {
        t.join().expect("failed to join thread");
    }

    let live = env.shadow.iter().filter(|slot| slot.lock().is_some()).count();
    assert_eq!(env.plain.len(), live);
    assert_eq!(env.computed.len(), live);
    assert_eq!(env.plain, env.computed);
}
