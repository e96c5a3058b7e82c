use crate::compute::ComputeOp;
use crate::iter::{Iter, Keys, Values};
use crate::reclaim::{Guard, GuardRef};
use crate::{HashMap, TryInsertError};
use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::Index;

/// A [`HashMap`] together with the guard its operations run under.
///
/// Obtained from [`HashMap::pin`], which creates a guard, or [`HashMap::with_guard`], which
/// borrows one. The methods mirror the map's own but drop the trailing guard argument, and
/// references they hand out live as long as the `HashMapRef`. Retired values cannot be freed
/// while the guard is held, so a pinned reference should not be kept around.
pub struct HashMapRef<'map, K, V, S = crate::DefaultHashBuilder> {
    map: &'map HashMap<K, V, S>,
    guard: GuardRef<'map>,
}

impl<K, V, S> HashMap<K, V, S> {
    /// Pins a new guard and bundles it with this map.
    pub fn pin(&self) -> HashMapRef<'_, K, V, S> {
        let guard = self.guard();
        HashMapRef {
            map: self,
            guard: GuardRef::Owned(guard),
        }
    }

    /// Bundles this map with a guard the caller already holds.
    ///
    /// # Panics
    ///
    /// Panics if `guard` belongs to a different map.
    pub fn with_guard<'g>(&'g self, guard: &'g Guard<'_>) -> HashMapRef<'g, K, V, S> {
        self.check_guard(guard);
        HashMapRef {
            map: self,
            guard: GuardRef::Ref(guard),
        }
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S> {
    fn g(&self) -> &Guard<'_> {
        &self.guard
    }

    /// Iterates over `(key, value)` pairs. See [`HashMap::iter`].
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.map.iter(self.g())
    }

    /// Iterates over keys. See [`HashMap::keys`].
    pub fn keys(&self) -> Keys<'_, K, V> {
        self.map.keys(self.g())
    }

    /// Iterates over values. See [`HashMap::values`].
    pub fn values(&self) -> Values<'_, K, V> {
        self.map.values(self.g())
    }

    /// See [`HashMap::len`].
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// See [`HashMap::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Clone, V, S> HashMapRef<'_, K, V, S> {
    /// Grows the table ahead of `additional` more entries. See [`HashMap::reserve`].
    pub fn reserve(&self, additional: usize) {
        self.map.reserve(additional, self.g());
    }

    /// Deletes every entry. See [`HashMap::clear`].
    pub fn clear(&self) {
        self.map.clear(self.g());
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// See [`HashMap::contains_key`].
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.contains_key(key, self.g())
    }

    /// Looks up the value stored for `key`. See [`HashMap::get`].
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.get(key, self.g())
    }

    /// Like [`get`](Self::get), but also returns the stored key.
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.get_key_value(key, self.g())
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S>
where
    K: Clone + Hash + Eq,
    S: BuildHasher,
{
    /// Deletes `key` and returns the value it had. See [`HashMap::remove`].
    pub fn remove<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.remove(key, self.g())
    }

    /// Deletes `key` and returns the stored key and value. See [`HashMap::remove_entry`].
    pub fn remove_entry<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.remove_entry(key, self.g())
    }

    /// Keeps the entries `f` accepts, calling it more than once for an entry it rejects.
    /// See [`HashMap::retain`].
    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.retain(f, self.g());
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    /// Stores `value` under `key` and returns the value it replaced. See [`HashMap::insert`].
    pub fn insert(&self, key: K, value: V) -> Option<&V> {
        self.map.insert(key, value, self.g())
    }

    /// Stores `value` only if `key` is absent. See [`HashMap::try_insert`].
    pub fn try_insert(&self, key: K, value: V) -> Result<&V, TryInsertError<'_, V>> {
        self.map.try_insert(key, value, self.g())
    }

    /// Sets or deletes `key` from its current value in one atomic step.
    /// See [`HashMap::compute`].
    pub fn compute<F>(&self, key: K, transform: F) -> (Option<&V>, bool)
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        self.map.compute(key, transform, self.g())
    }

    /// Sets, deletes or keeps `key` from its current value in one atomic step.
    /// See [`HashMap::compute_v2`].
    pub fn compute_v2<F>(&self, key: K, transform: F) -> (Option<&V>, bool)
    where
        F: FnOnce(Option<&V>) -> ComputeOp<V>,
    {
        self.map.compute_v2(key, transform, self.g())
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashMapRef<'_, K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for HashMapRef<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Cloning pins a fresh guard rather than sharing the original one.
impl<K, V, S> Clone for HashMapRef<'_, K, V, S> {
    fn clone(&self) -> Self {
        self.map.pin()
    }
}

impl<K, V, S> PartialEq for HashMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.map.guarded_eq(other.map, self.g(), other.g())
    }
}

impl<K, V, S> PartialEq<HashMap<K, V, S>> for HashMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &HashMap<K, V, S>) -> bool {
        let theirs = other.guard();
        self.map.guarded_eq(other, self.g(), &theirs)
    }
}

impl<K, V, S> PartialEq<HashMapRef<'_, K, V, S>> for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &HashMapRef<'_, K, V, S>) -> bool {
        other == self
    }
}

impl<K: Hash + Eq, V: Eq, S: BuildHasher> Eq for HashMapRef<'_, K, V, S> {}

impl<K, Q, V, S> Index<&Q> for HashMapRef<'_, K, V, S>
where
    K: Hash + Eq + Borrow<Q>,
    Q: ?Sized + Hash + Eq,
    S: BuildHasher,
{
    type Output = V;

    fn index(&self, key: &Q) -> &V {
        self.get(key).expect("no entry found for key")
    }
}
