use crate::HashMap;
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};
use std::hash::{BuildHasher, Hash};

impl<K, V, S> ParallelExtend<(K, V)> for &HashMap<K, V, S>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, items: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let map = &**self;
        // guards are per rayon job, not per item
        items.into_par_iter().for_each_init(
            || map.guard(),
            |guard, (key, value)| {
                map.insert(key, value, guard);
            },
        );
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for HashMap<K, V, S>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, items: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        (&*self).par_extend(items);
    }
}

impl<K, V, S> FromParallelIterator<(K, V)> for HashMap<K, V, S>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default + Sync,
{
    fn from_par_iter<I>(items: I) -> Self
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let map = HashMap::with_hasher(S::default());
        (&map).par_extend(items);
        map
    }
}

#[cfg(test)]
mod test {
    use crate::{ComputeOp, HashMap};
    use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

    #[test]
    fn empty_extend_keeps_computed_entries() {
        let mut map = HashMap::new();
        {
            let map = map.pin();
            map.compute_v2("a", |_| ComputeOp::Update(1));
            map.compute_v2("b", |_| ComputeOp::Update(2));
        }

        map.par_extend(Vec::new().into_par_iter());

        let map = map.pin();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.get("b"), Some(&2));
    }

    #[test]
    fn extend_overwrites_then_compute_sees_the_new_values() {
        let mut map = HashMap::new();
        {
            let map = map.pin();
            for k in 0..10u32 {
                map.compute(k, |_| Some(0));
            }
        }

        // keys 5..10 already exist and are replaced, 10..50 are new
        map.par_extend((5..50u32).into_par_iter().map(|k| (k, k * 3)));
        assert_eq!(map.len(), 50);

        let map = map.pin();
        assert_eq!(map.get(&4), Some(&0));
        assert_eq!(map.get(&5), Some(&15));
        let bumped = map.compute_v2(49, |old| ComputeOp::Update(old.map_or(0, |v| v + 1)));
        assert_eq!(bumped, (Some(&148), true));
    }

    #[test]
    fn extend_through_a_shared_reference_while_computing() {
        let map = HashMap::<u32, u32>::new();
        rayon::join(
            || {
                let mut shared = &map;
                shared.par_extend((0..1000).into_par_iter().map(|k| (k, k * 2)));
            },
            || {
                let map = map.pin();
                for k in 1000..1100 {
                    map.compute_v2(k, |_| ComputeOp::Update(k));
                }
            },
        );

        assert_eq!(map.len(), 1100);
        let map = map.pin();
        assert_eq!(map.get(&999), Some(&1998));
        assert_eq!(map.get(&1050), Some(&1050));
    }

    #[test]
    fn collected_map_answers_compute() {
        let map: HashMap<u32, u32> =
            HashMap::from_par_iter((0..200u32).into_par_iter().map(|k| (k, k % 7)));
        assert_eq!(map.len(), 200);

        let map = map.pin();
        let (value, present) = map.compute_v2(13, |old| match old {
            Some(&v) if v > 0 => ComputeOp::Noop,
            _ => ComputeOp::Delete,
        });
        assert_eq!((value, present), (Some(&6), true));
        assert_eq!(map.compute_v2(14, |_| ComputeOp::Delete), (Some(&0), false));
        assert_eq!(map.len(), 199);
    }

    #[test]
    fn collect_from_nothing() {
        let map: HashMap<u8, u8> = HashMap::from_par_iter(Vec::new().into_par_iter());
        assert!(map.is_empty());
        assert_eq!(map.pin().compute(1, |old| old.copied()), (None, false));
    }
}
