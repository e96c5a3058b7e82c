use crate::compute::ComputeOp;
use crate::iter::{Iter, Keys, NodeIter, Values};
use crate::node::{BinEntry, Node};
use crate::raw::Table;
use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FromIterator;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

const ISIZE_BITS: usize = isize::BITS as usize;

/// Upper bound on the number of bins.
///
/// The upper half of `size_ctl` holds the resize stamp while a resize runs, and the lower
/// half counts helpers, so bin counts past this would not leave room for either.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Bins allocated on first write when no capacity was asked for.
const DEFAULT_CAPACITY: usize = 16;

/// Fewest bins a resizing thread takes on at once.
const MIN_TRANSFER_STRIDE: isize = 16;

/// Width of the resize stamp stored in `size_ctl`.
const RESIZE_STAMP_BITS: usize = ISIZE_BITS / 2;

/// Where the resize stamp starts in `size_ctl`.
const RESIZE_STAMP_SHIFT: usize = ISIZE_BITS - RESIZE_STAMP_BITS;

/// Cap on threads moving bins for one resize.
const MAX_RESIZERS: isize = (1 << RESIZE_STAMP_SHIFT) - 1;

/// Entry count at which a table with `bins` bins is grown (three quarters full).
fn threshold(bins: usize) -> isize {
    (bins - (bins >> 2)) as isize
}

/// Bins needed so that `entries` fit in a fresh table without an immediate resize.
fn bins_for(entries: usize) -> usize {
    if entries >= MAXIMUM_CAPACITY / 2 {
        return MAXIMUM_CAPACITY;
    }
    let padded = entries + (entries >> 1) + 1;
    padded.next_power_of_two().min(MAXIMUM_CAPACITY)
}

/// Marks a resize of a table with `n` bins. Negative once shifted by `RESIZE_STAMP_SHIFT`.
fn resize_stamp(n: usize) -> isize {
    n.leading_zeros() as isize | (1_isize << (RESIZE_STAMP_BITS - 1))
}

/// Recovers the stamp from a `size_ctl` recorded during a resize.
fn stamp_of(size_ctl: isize) -> isize {
    ((size_ctl as usize) >> RESIZE_STAMP_SHIFT) as isize
}

/// Views a table loaded from the map, from `next_table`, or through a forwarding bin.
fn live<'g, K, V>(table: Shared<'g, Table<K, V>>) -> Option<&'g Table<K, V>> {
    // safety: a table is retired only after a newer one has taken its place in the map, and
    // 'g is bounded by the guard the pointer was loaded under.
    unsafe { table.as_ref() }
        .map(|t| &**t)
        .filter(|t| !t.is_empty())
}

/// Reads a non-null bin head.
fn head_of<'g, K, V>(bin: Shared<'g, BinEntry<K, V>>) -> &'g BinEntry<K, V> {
    // safety: a head is retired only once it is no longer in its bin, which happened after
    // our load if at all, and the guard bounding 'g delays reclamation past that.
    &**unsafe { bin.deref() }
}

/// Reads a value pointer taken from a node.
fn value_ref<'g, V>(value: Shared<'g, V>) -> &'g V {
    // safety: values are retired after being swapped out of their node or after the node is
    // unlinked. either way the guard bounding 'g keeps them allocated.
    &**unsafe { value.deref() }
}

/// Where a key was found in a chain whose bin lock is held.
struct Spot<'g, K, V> {
    /// The node before `at`, or null when `at` heads the bin.
    prev: Shared<'g, BinEntry<K, V>>,
    /// The node holding the key, or the last node of the chain if none does.
    at: Shared<'g, BinEntry<K, V>>,
    found: bool,
}

/// Walks the chain headed by `head` looking for `key`.
///
/// The caller holds the bin lock, so nothing can be linked into or out of the chain meanwhile.
fn seek<'g, K, V, Q>(
    head: Shared<'g, BinEntry<K, V>>,
    hash: u64,
    key: &Q,
    guard: &'g Guard<'_>,
) -> Spot<'g, K, V>
where
    K: Borrow<Q>,
    Q: ?Sized + Eq,
{
    let mut prev = Shared::null();
    let mut at = head;
    loop {
        // safety: unlinking needs the lock the caller holds, so every node of the chain stays
        // reachable (and unretired) for the whole walk.
        let node = unsafe { at.node() };
        if node.hash == hash && node.key.borrow() == key {
            return Spot {
                prev,
                at,
                found: true,
            };
        }
        let next = node.next.load(Ordering::SeqCst, guard);
        if next.is_null() {
            return Spot {
                prev,
                at,
                found: false,
            };
        }
        prev = at;
        at = next;
    }
}

/// Takes the node at `spot` out of bin `bini` and retires it together with its `value`.
fn unlink<'g, K, V>(
    table: &Table<K, V>,
    bini: usize,
    spot: &Spot<'g, K, V>,
    value: Shared<'g, V>,
    guard: &'g Guard<'_>,
) {
    // safety: see `seek`; the caller still holds the bin lock.
    let next = unsafe { spot.at.node() }.next.load(Ordering::SeqCst, guard);
    if spot.prev.is_null() {
        table.store_bin(bini, next);
    } else {
        unsafe { spot.prev.node() }.next.store(next, Ordering::SeqCst);
    }
    // safety: the node is no longer linked, so only readers that reached it before this point
    // can still see it or its value, and they hold guards that delay the free.
    unsafe {
        guard.retire_shared(spot.at);
        guard.retire_shared(value);
    }
}

/// A concurrent hash map whose writes all go through an atomic compute step.
///
/// Reads never block. Writes lock only the bin their key hashes to, and empty bins are
/// claimed without locking at all. When the map grows, every thread that touches a bin that
/// has already been migrated helps finish the migration before carrying on.
///
/// References handed out by the map are tied to a [`Guard`]. Values that are removed or
/// replaced stay readable for as long as any guard that could have observed them is alive,
/// so hold guards only as long as you need the references. Guards come from
/// [`HashMap::guard`], or implicitly from [`HashMap::pin`]; a guard obtained from a different
/// map cannot be used with this one.
pub struct HashMap<K, V, S = crate::DefaultHashBuilder> {
    /// Current generation of bins, null until the first write. Iterators start here.
    table: Atomic<Table<K, V>>,

    /// The generation a resize is filling; null when no resize runs.
    next_table: Atomic<Table<K, V>>,

    /// One past the highest bin of the old table not yet claimed by a resizing thread.
    transfer_index: AtomicIsize,

    count: AtomicUsize,

    /// Allocation and resize state.
    ///
    /// * `-1`: a thread is allocating the first table.
    /// * other negative values: the resize stamp of the table being resized, shifted up by
    ///   `RESIZE_STAMP_SHIFT`, plus one more than the number of threads moving bins.
    /// * otherwise, with no table: the bin count to allocate (0 meaning the default).
    /// * otherwise: the entry count that triggers the next resize.
    size_ctl: AtomicIsize,

    /// Source of every guard used with this map. Retired memory goes back through it.
    collector: Collector,

    build_hasher: S,
}

#[cfg(test)]
#[test]
#[should_panic(expected = "guard was not created by this map")]
fn foreign_guard_is_rejected() {
    let map: HashMap<_, _> = HashMap::default();
    let other: HashMap<usize, usize> = HashMap::default();
    map.compute(7, |_| Some('x'), &other.guard());
}

/// Returned by [`HashMap::try_insert`] when the key is already taken.
#[derive(Eq, PartialEq, Clone, Copy)]
pub struct TryInsertError<'a, V> {
    /// What the key maps to.
    pub current: &'a V,
    /// The value `try_insert` was given, handed back untouched.
    pub not_inserted: V,
}

impl<V> Display for TryInsertError<'_, V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key already maps to {:?}, so {:?} was not inserted",
            self.current, self.not_inserted
        )
    }
}

impl<V> Debug for TryInsertError<'_, V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TryInsertError")
            .field("current", self.current)
            .field("not_inserted", &self.not_inserted)
            .finish()
    }
}

impl<V> Error for TryInsertError<'_, V> where V: Debug {}

/// The committed outcome of one compute step.
///
/// `old` is what the transform was shown, `new` is what the key maps to afterwards.
struct Computed<'g, V> {
    old: Option<&'g V>,
    new: Option<&'g V>,
}

impl<'g, V> Computed<'g, V> {
    /// Folds the outcome into the `(value, present)` pair callers of `compute` receive.
    fn into_result(self) -> (Option<&'g V>, bool) {
        match self.new {
            Some(v) => (Some(v), true),
            None => (self.old, false),
        }
    }

    fn count_delta(&self) -> isize {
        self.new.is_some() as isize - self.old.is_some() as isize
    }
}

/// Puts a reserved bin back to empty if the transform deciding its contents unwinds, and
/// retires the reservation once it is no longer reachable.
struct ReservedBin<'g, K, V> {
    table: &'g Table<K, V>,
    index: usize,
    reservation: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard<'g>,
}

impl<K, V> Drop for ReservedBin<'_, K, V> {
    fn drop(&mut self) {
        if self.table.bin(self.index, self.guard) == self.reservation {
            self.table.store_bin(self.index, Shared::null());
        }
        // safety: the reservation was just replaced in (or removed from) its only bin, so no
        // thread that loads the bin from now on can see it.
        unsafe { self.guard.retire_shared(self.reservation) };
    }
}

// constructors, guards, and the read-only views below never create keys or values, so they
// carry no Send/Sync bounds.

impl<K, V> HashMap<K, V, crate::DefaultHashBuilder> {
    /// Creates an empty map. Nothing is allocated until the first write.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let scores: HashMap<String, u32> = HashMap::new();
    /// assert!(scores.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty map with room for `capacity` entries before its first resize.
    ///
    /// A `capacity` of 0 allocates nothing, like [`HashMap::new`].
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let seen: HashMap<u64, ()> = HashMap::with_capacity(1000);
    /// assert_eq!(seen.len(), 0);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, crate::DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty map that hashes keys with `hash_builder`.
    ///
    /// Keys that an attacker controls should be hashed with a randomly seeded builder, or
    /// colliding keys can pile up in one bin.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::{DefaultHashBuilder, HashMap};
    ///
    /// let map = HashMap::with_hasher(DefaultHashBuilder::default());
    /// map.pin().compute("a", |_| Some(1));
    /// assert_eq!(map.pin().get("a"), Some(&1));
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            table: Atomic::null(),
            next_table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            count: AtomicUsize::new(0),
            size_ctl: AtomicIsize::new(0),
            collector: Collector::new(),
            build_hasher: hash_builder,
        }
    }

    /// Combines [`HashMap::with_capacity`] and [`HashMap::with_hasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map = HashMap::with_capacity_and_hasher(64, RandomState::new());
    /// map.pin().insert("b", 2);
    /// assert_eq!(map.len(), 1);
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        let mut map = Self::with_hasher(hash_builder);
        if capacity > 0 {
            map.presize(capacity);
        }
        map
    }

    /// Enters the map's collector, for use with the guard-taking methods.
    ///
    /// Nothing retired while the guard is alive can be freed, so drop it once the references
    /// obtained through it are no longer needed.
    pub fn guard(&self) -> Guard<'_> {
        self.collector.enter()
    }

    #[inline]
    pub(crate) fn check_guard(&self, guard: &Guard<'_>) {
        // unprotected guards have no collector and are always accepted
        if let Some(c) = guard.collector() {
            assert!(
                Collector::ptr_eq(c, &self.collector),
                "guard was not created by this map"
            );
        }
    }

    /// Number of entries.
    ///
    /// While other threads write, the answer may already be stale when it is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.compute(1, |_| Some('a'));
    /// mref.compute(2, |_| Some('b'));
    /// mref.compute(2, |_| Some('c'));
    /// assert_eq!(mref.len(), 2);
    /// ```
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether [`HashMap::len`] is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn bin_count(&self, guard: &Guard<'_>) -> usize {
        self.check_guard(guard);
        live(self.table.load(Ordering::Relaxed, guard)).map_or(0, Table::len)
    }

    /// Visits every entry once, in no particular order.
    ///
    /// Entries written or removed while the walk is underway may or may not be seen.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'_>) -> Iter<'g, K, V> {
        self.check_guard(guard);
        Iter {
            node_iter: self.nodes(guard),
            guard,
        }
    }

    /// Visits every key once, in no particular order.
    pub fn keys<'g>(&'g self, guard: &'g Guard<'_>) -> Keys<'g, K, V> {
        self.check_guard(guard);
        Keys {
            node_iter: self.nodes(guard),
        }
    }

    /// Visits every value once, in no particular order.
    pub fn values<'g>(&'g self, guard: &'g Guard<'_>) -> Values<'g, K, V> {
        self.check_guard(guard);
        Values {
            node_iter: self.nodes(guard),
            guard,
        }
    }

    fn nodes<'g>(&'g self, guard: &'g Guard<'_>) -> NodeIter<'g, K, V> {
        NodeIter::new(self.table.load(Ordering::SeqCst, guard), guard)
    }

    /// Returns the current table, allocating it if no thread has yet.
    fn init_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if live(table).is_some() {
                return table;
            }

            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // someone else is allocating
                std::thread::yield_now();
                continue;
            }
            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            if live(table).is_some() {
                self.size_ctl.store(sc, Ordering::SeqCst);
                return table;
            }
            let bins = if sc > 0 { sc as usize } else { DEFAULT_CAPACITY };
            let table = Shared::boxed(Table::new(bins, &self.collector), &self.collector);
            self.table.store(table, Ordering::SeqCst);
            self.size_ctl.store(threshold(bins), Ordering::SeqCst);
            log::debug!("allocated table with {} bins", bins);
            return table;
        }
    }

    /// Allocates a table sized for `size` entries on a map nobody else can see yet.
    fn presize(&mut self, size: usize) {
        assert_eq!(self.size_ctl.load(Ordering::SeqCst), 0);
        // safety: &mut self means no other thread holds this map
        assert!(unsafe { self.table.load_unprotected(Ordering::SeqCst) }.is_null());

        let bins = bins_for(size);
        let table = Shared::boxed(Table::new(bins, &self.collector), &self.collector);
        self.table.store(table, Ordering::SeqCst);
        self.size_ctl.store(threshold(bins), Ordering::SeqCst);
    }
}

// resizing copies the nodes that cannot be reused, which takes `K: Clone`.

impl<K, V, S> HashMap<K, V, S>
where
    K: Clone,
{
    /// Grows the table until `size` entries fit below the resize threshold.
    fn try_presize(&self, size: usize, guard: &Guard<'_>) {
        let wanted = bins_for(size);
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // allocation or a resize is already underway
                return;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            let Some(t) = live(table) else {
                // no table yet: sc is the bin count asked for at construction
                let bins = wanted.max(sc as usize);
                if self
                    .size_ctl
                    .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                if self.table.load(Ordering::SeqCst, guard) != table {
                    // allocated by someone else between our two loads
                    self.size_ctl.store(sc, Ordering::SeqCst);
                    continue;
                }
                let fresh = Shared::boxed(Table::new(bins, &self.collector), &self.collector);
                self.table.store(fresh, Ordering::SeqCst);
                self.size_ctl.store(threshold(bins), Ordering::SeqCst);
                log::debug!("allocated table with {} bins", bins);
                continue;
            };

            if wanted as isize <= sc || t.len() >= MAXIMUM_CAPACITY {
                return;
            }
            if table != self.table.load(Ordering::SeqCst, guard) {
                continue;
            }
            let first = resize_stamp(t.len()) << RESIZE_STAMP_SHIFT;
            if self
                .size_ctl
                .compare_exchange(sc, first + 2, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.transfer(table, Shared::null(), guard);
            }
        }
    }

    /// Allocates the table a resize of an `n`-bin table moves into.
    fn start_resize<'g>(&'g self, n: usize, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        log::debug!("resizing from {} to {} bins", n, n << 1);
        let next = Shared::boxed(Table::new(n << 1, &self.collector), &self.collector);
        let previous = self.next_table.swap(next, Ordering::SeqCst, guard);
        assert!(previous.is_null());
        self.transfer_index.store(n as isize, Ordering::SeqCst);
        next
    }

    /// Hands out the next `stride` unclaimed bins as `(low, high)`, high exclusive.
    fn claim_bins(&self, stride: isize) -> Option<(isize, isize)> {
        loop {
            let high = self.transfer_index.load(Ordering::SeqCst);
            if high <= 0 {
                return None;
            }
            let low = (high - stride).max(0);
            if self
                .transfer_index
                .compare_exchange(high, low, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some((low, high));
            }
        }
    }

    /// Whether another thread may still sign up to move bins for the resize that `sc`
    /// describes, given that the table being resized has `n` bins.
    fn joinable(&self, sc: isize, n: usize) -> bool {
        let stamp = resize_stamp(n);
        let first = stamp << RESIZE_STAMP_SHIFT;
        sc < 0
            && stamp_of(sc) == stamp
            && sc != first + 1
            && sc != first + MAX_RESIZERS
            && self.transfer_index.load(Ordering::SeqCst) > 0
    }

    /// Signs off the resize of an `n`-bin table. True for the last thread to do so.
    fn leave_resize(&self, n: usize) -> bool {
        let last = (resize_stamp(n) << RESIZE_STAMP_SHIFT) + 2;
        self.size_ctl.fetch_sub(1, Ordering::SeqCst) == last
    }

    /// Publishes `next_table` as the map's table once every bin of the `n`-bin table has moved.
    fn finish_resize<'g>(
        &'g self,
        n: usize,
        next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        self.next_table.store(Shared::null(), Ordering::SeqCst);
        let old = self.table.swap(next_table, Ordering::SeqCst, guard);
        // safety: `old` is no longer the map's table, and any older table whose forwarding
        // entries lead to it has already been retired, so no new load can return it.
        unsafe { guard.retire_shared(old) };
        self.size_ctl.store(threshold(n << 1), Ordering::SeqCst);
        log::debug!("resize to {} bins complete", n << 1);
    }

    /// Moves bins of `table` into `next_table` for as long as there are bins left to claim.
    ///
    /// The caller has already counted itself in `size_ctl`. A null `next_table` means the
    /// caller is starting the resize.
    fn transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        mut next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        let Some(t) = live(table) else {
            return;
        };
        let n = t.len();
        if next_table.is_null() {
            next_table = self.start_resize(n, guard);
        }
        let Some(next) = live(next_table) else {
            return;
        };
        let next_n = next.len();
        let stride = stride_for(n);

        // bins are moved from the top down. `i` is the current bin, `bound` the lowest bin
        // of the current claim.
        let mut i: isize = 0;
        let mut bound: isize = 0;
        let mut step = true;
        let mut sweeping = false;
        loop {
            if step {
                step = false;
                i -= 1;
                if i < bound && !sweeping {
                    (bound, i) = match self.claim_bins(stride) {
                        Some((low, high)) => (low, high - 1),
                        None => (0, -1),
                    };
                }
            }

            if i < 0 || i as usize >= n || i as usize + n >= next_n {
                if sweeping {
                    self.finish_resize(n, next_table, guard);
                    return;
                }
                if !self.leave_resize(n) {
                    return;
                }
                // last one out re-reads every bin before publishing
                sweeping = true;
                step = true;
                i = n as isize;
                continue;
            }
            let bini = i as usize;

            let bin = t.bin(bini, guard);
            if bin.is_null() {
                step = t
                    .cas_bin(bini, Shared::null(), t.get_moved(next_table, guard), guard)
                    .is_ok();
                continue;
            }
            match *head_of(bin) {
                BinEntry::Moved => step = true,
                // the compute holding it installs a new head before unlocking; read it again
                BinEntry::Reserved(ref lock) => drop(lock.lock()),
                BinEntry::Node(ref head) => {
                    if let Some(_held) = t.lock_if_head(bini, bin, &head.lock, guard) {
                        self.split_bin(t, bini, bin, next, next_table, guard);
                        step = true;
                    }
                }
            }
        }
    }

    /// Copies the locked chain at `bin` into bins `i` and `i + n` of `next` and forwards bin
    /// `i` of `t` there.
    ///
    /// The longest tail of the chain whose nodes all land in the same half is linked into the
    /// new table as is. Only the nodes ahead of it are copied, and those are retired.
    fn split_bin<'g>(
        &'g self,
        t: &'g Table<K, V>,
        i: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        next: &'g Table<K, V>,
        next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        let n = t.len();
        let upper = |node: &Node<K, V>| node.hash & n as u64 != 0;

        // safety (for every `node()` below): the bin lock is held, so no node of this chain
        // can be unlinked, and none is retired before the walks are over.
        let mut tail = bin;
        let mut tail_upper = upper(unsafe { bin.node() });
        let mut p = bin;
        while !p.is_null() {
            let node = unsafe { p.node() };
            if upper(node) != tail_upper {
                tail = p;
                tail_upper = !tail_upper;
            }
            p = node.next.load(Ordering::SeqCst, guard);
        }

        let (mut lower_half, mut upper_half) = if tail_upper {
            (Shared::null(), tail)
        } else {
            (tail, Shared::null())
        };
        let mut p = bin;
        while p != tail {
            let node = unsafe { p.node() };
            let half = if upper(node) {
                &mut upper_half
            } else {
                &mut lower_half
            };
            let copy = Node::with_next(
                node.hash,
                node.key.clone(),
                node.value.load(Ordering::SeqCst, guard),
                Atomic::from(*half),
            );
            *half = Shared::boxed(BinEntry::Node(copy), &self.collector);
            p = node.next.load(Ordering::SeqCst, guard);
        }

        next.store_bin(i, lower_half);
        next.store_bin(i + n, upper_half);
        t.store_bin(i, t.get_moved(next_table, guard));

        let mut p = bin;
        while p != tail {
            let following = unsafe { p.node() }.next.load(Ordering::SeqCst, guard);
            // safety: bin `i` now forwards to `next`, so the copied nodes cannot be reached by
            // anyone who loads the bin from here on. the values now belong to the copies and
            // are not freed along with the originals.
            unsafe { guard.retire_shared(p) };
            p = following;
        }
    }

    /// Helps with the resize `table` is part of, if any, and returns the table to retry on.
    fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Table<K, V>> {
        let Some(t) = live(table) else {
            return table;
        };
        let next_table = t.next_table(guard);
        if next_table.is_null() {
            return table;
        }

        let n = t.len();
        while next_table == self.next_table.load(Ordering::SeqCst, guard)
            && table == self.table.load(Ordering::SeqCst, guard)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if !self.joinable(sc, n) {
                break;
            }
            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                log::trace!("joining resize of {} bins", n);
                self.transfer(table, next_table, guard);
                break;
            }
        }
        next_table
    }

    /// Counts one new entry and starts (or helps) a resize if the table is now too full.
    fn entry_added(&self, guard: &Guard<'_>) {
        let mut count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if (count as isize) < sc {
                return;
            }
            let table = self.table.load(Ordering::SeqCst, guard);
            let Some(t) = live(table) else {
                // whoever allocates it sizes it
                return;
            };
            let n = t.len();
            if n >= MAXIMUM_CAPACITY {
                return;
            }

            if sc < 0 {
                let next_table = self.next_table.load(Ordering::SeqCst, guard);
                if next_table.is_null() || !self.joinable(sc, n) {
                    return;
                }
                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    log::trace!("joining resize of {} bins", n);
                    self.transfer(table, next_table, guard);
                }
            } else {
                let first = resize_stamp(n) << RESIZE_STAMP_SHIFT;
                if self
                    .size_ctl
                    .compare_exchange(sc, first + 2, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.transfer(table, Shared::null(), guard);
                }
            }

            // the table may have filled up again while we were moving bins
            count = self.count.load(Ordering::SeqCst);
        }
    }

    fn entries_removed(&self, n: usize) {
        self.count.fetch_sub(n, Ordering::SeqCst);
    }

    /// Makes room for `additional` more entries than the map holds now, resizing ahead of time
    /// if needed.
    pub fn reserve(&self, additional: usize, guard: &Guard<'_>) {
        self.check_guard(guard);
        self.try_presize(self.len() + additional, guard);
    }

    /// Removes every entry.
    ///
    /// Entries written by other threads while the clear runs may survive it.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// for i in 0..10 {
    ///     mref.compute(i, |_| Some(i));
    /// }
    /// mref.clear();
    /// assert!(mref.is_empty());
    /// assert_eq!(mref.get(&3), None);
    /// ```
    pub fn clear(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        let mut removed = 0;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut i = 0;
        while let Some(t) = live(table).filter(|t| i < t.len()) {
            let bin = t.bin(i, guard);
            if bin.is_null() {
                i += 1;
                continue;
            }
            match *head_of(bin) {
                BinEntry::Moved => {
                    // restart in the table the bins went to
                    table = self.help_transfer(table, guard);
                    i = 0;
                }
                BinEntry::Reserved(ref lock) => drop(lock.lock()),
                BinEntry::Node(ref head) => {
                    let Some(held) = t.lock_if_head(i, bin, &head.lock, guard) else {
                        continue;
                    };
                    t.store_bin(i, Shared::null());
                    drop(held);
                    removed += retire_chain(bin, guard);
                    i += 1;
                }
            }
        }

        if removed > 0 {
            self.entries_removed(removed);
        }
    }
}

/// Retires every node of a chain that has just been detached from its bin, values included,
/// and returns how many there were.
fn retire_chain<'g, K, V>(mut p: Shared<'g, BinEntry<K, V>>, guard: &'g Guard<'_>) -> usize {
    let mut retired = 0;
    while !p.is_null() {
        // safety: the chain was detached under its bin lock. writers re-check the head after
        // locking, so none will link into or out of it any more, and readers that got in
        // before the detach are protected by their guards.
        let node = unsafe { p.node() };
        let next = node.next.load(Ordering::SeqCst, guard);
        unsafe {
            guard.retire_shared(node.value.load(Ordering::SeqCst, guard));
            guard.retire_shared(p);
        }
        retired += 1;
        p = next;
    }
    retired
}

/// Bins each thread claims per step of a resize of an `n`-bin table.
fn stride_for(n: usize) -> isize {
    let cpus = num_cpus();
    let stride = if cpus > 1 { (n >> 3) / cpus } else { n };
    (stride as isize).max(MIN_TRANSFER_STRIDE)
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn get_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let table = live(self.table.load(Ordering::SeqCst, guard))?;
        let hash = self.hash(key);
        let bin = table.bin(table.bini(hash), guard);
        if bin.is_null() {
            return None;
        }
        table.find(head_of(bin), hash, key, guard)
    }

    /// Whether `key` currently has a value.
    ///
    /// `key` may be any borrowed form of `K`, as long as its `Hash` and `Eq` agree with `K`'s.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.compute("x".to_string(), |_| Some(0));
    /// assert!(mref.contains_key("x"));
    /// assert!(!mref.contains_key("y"));
    /// ```
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard<'_>) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        self.get_node(key, guard).is_some()
    }

    /// The value `key` maps to, if any.
    ///
    /// Never blocks, not even on a bin another thread is writing to. The reference stays valid
    /// for as long as `guard` does, even if the entry is replaced or removed meanwhile.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.compute(3, |_| Some("three"), &guard);
    /// assert_eq!(map.get(&3, &guard), Some(&"three"));
    /// assert_eq!(map.get(&4, &guard), None);
    /// ```
    #[inline]
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;
        Some(value_ref(node.value.load(Ordering::SeqCst, guard)))
    }

    /// Like [`HashMap::get`], but also returns the key as stored in the map.
    #[inline]
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;
        Some((&node.key, value_ref(node.value.load(Ordering::SeqCst, guard))))
    }

    pub(crate) fn guarded_eq(
        &self,
        other: &Self,
        our_guard: &Guard<'_>,
        their_guard: &Guard<'_>,
    ) -> bool
    where
        V: PartialEq,
    {
        self.len() == other.len()
            && self
                .iter(our_guard)
                .all(|(key, value)| other.get(key, their_guard) == Some(value))
    }
}

// removal may land on a forwarded bin and have to help the resize along, so it needs
// `K: Clone` as well.

impl<K, V, S> HashMap<K, V, S>
where
    K: Clone + Hash + Eq,
    S: BuildHasher,
{
    /// Deletes `key`, returning the value it had.
    ///
    /// Same as [`HashMap::compute`] with a transform that always returns `None`, except that
    /// `key` may be borrowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.compute(9, |_| Some('z'));
    /// assert_eq!(mref.remove(&9), Some(&'z'));
    /// assert_eq!(mref.remove(&9), None);
    /// ```
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.remove_entry(key, guard).map(|(_, value)| value)
    }

    /// Like [`HashMap::remove`], but also returns the key as it was stored.
    pub fn remove_entry<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        self.remove_where(key, |_| true, guard)
    }

    /// Unlinks the entry for `key` if `should_remove` approves of its current value.
    ///
    /// `should_remove` is called at most once, under the bin lock.
    fn remove_where<'g, Q, P>(
        &'g self,
        key: &Q,
        should_remove: P,
        guard: &'g Guard<'_>,
    ) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        P: FnOnce(&V) -> bool,
    {
        let hash = self.hash(key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            let t = live(table)?;
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                return None;
            }

            match *head_of(bin) {
                BinEntry::Moved => table = self.help_transfer(table, guard),
                // an empty bin being filled by a compute; it may hold the key afterwards
                BinEntry::Reserved(ref lock) => drop(lock.lock()),
                BinEntry::Node(ref head) => {
                    let Some(held) = t.lock_if_head(bini, bin, &head.lock, guard) else {
                        continue;
                    };
                    let spot = seek(bin, hash, key, guard);
                    let mut removed = None;
                    if spot.found {
                        // safety: see `seek`
                        let node = unsafe { spot.at.node() };
                        let value = node.value.load(Ordering::SeqCst, guard);
                        let current = value_ref(value);
                        if should_remove(current) {
                            unlink(t, bini, &spot, value, guard);
                            removed = Some((&node.key, current));
                        }
                    }
                    drop(held);

                    if removed.is_some() {
                        self.entries_removed(1);
                    }
                    return removed;
                }
            }
        }
    }

    /// Deletes every entry for which `f` returns `false`; `f` may be called more than once per
    /// entry.
    ///
    /// Each entry is first judged without any locks. An entry that `f` rejects is judged again
    /// under its bin lock before it is unlinked, so a rejected entry is called twice, and one
    /// whose value changed in between is judged by its current value.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// for word in ["ant", "bee", "cat", "dog"] {
    ///     mref.compute(word, |_| Some(word.len()));
    /// }
    /// mref.retain(|word, _| word.contains('a'));
    /// assert_eq!(mref.len(), 2);
    /// assert!(mref.contains_key("cat"));
    /// ```
    pub fn retain<F>(&self, mut f: F, guard: &Guard<'_>)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        for (key, value) in self.iter(guard) {
            if !f(key, value) {
                self.remove_where(key, |current| !f(key, current), guard);
            }
        }
    }
}

// writes create keys and values that other threads will read and free, hence the
// `'static + Send + Sync` bounds.

impl<K, V, S> HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    /// Maps `key` to `value`, returning the value it replaced.
    ///
    /// A compute whose transform always answers [`ComputeOp::Update`]. If the key was
    /// present, the stored key is kept and the `key` passed in is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.insert("lang", "rust"), None);
    /// assert_eq!(mref.insert("lang", "c"), Some(&"rust"));
    /// assert_eq!(mref.get("lang"), Some(&"c"));
    /// ```
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        self.compute_inner(key, |_| ComputeOp::Update(value), guard)
            .old
    }

    /// Maps `key` to `value` only if `key` has no value yet.
    ///
    /// On success returns the stored value. Otherwise the map is unchanged and the error
    /// carries both the existing value and `value`.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::{HashMap, TryInsertError};
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.try_insert('k', 10), Ok(&10));
    /// assert_eq!(
    ///     mref.try_insert('k', 20),
    ///     Err(TryInsertError { current: &10, not_inserted: 20 })
    /// );
    /// ```
    pub fn try_insert<'g>(
        &'g self,
        key: K,
        value: V,
        guard: &'g Guard<'_>,
    ) -> Result<&'g V, TryInsertError<'g, V>> {
        self.check_guard(guard);
        let mut value = Some(value);
        let computed = self.compute_inner(
            key,
            |current| match current {
                Some(_) => ComputeOp::Noop,
                None => value.take().map_or(ComputeOp::Noop, ComputeOp::Update),
            },
            guard,
        );
        match (computed.new, value) {
            (Some(current), Some(not_inserted)) => Err(TryInsertError {
                current,
                not_inserted,
            }),
            (Some(new), None) => Ok(new),
            (None, _) => unreachable!("the key is always present after try_insert"),
        }
    }

    /// Atomically inspects and rewrites the entry for `key`.
    ///
    /// `remapping_function` is shown the current value (`None` if the key is absent) and
    /// returns the value to store, or `None` to remove the entry. It is called exactly once,
    /// while the key's bin is locked, so no other write to the same key can happen in
    /// between. Keep it short, and do not use the map from inside it: touching a key in the
    /// same bin deadlocks.
    ///
    /// Returns the value now stored with `true`, or, if the entry was removed (or never
    /// existed), the value it had before with `false`.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    ///
    /// assert_eq!(mref.compute("hits", |old| Some(old.map_or(1, |v| v + 1))), (Some(&1), true));
    /// assert_eq!(mref.compute("hits", |old| Some(old.map_or(1, |v| v + 1))), (Some(&2), true));
    /// assert_eq!(mref.compute("hits", |_| None), (Some(&2), false));
    /// assert_eq!(mref.get("hits"), None);
    /// ```
    pub fn compute<'g, F>(
        &'g self,
        key: K,
        remapping_function: F,
        guard: &'g Guard<'_>,
    ) -> (Option<&'g V>, bool)
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        self.check_guard(guard);
        self.compute_inner(
            key,
            |current| ComputeOp::from(remapping_function(current)),
            guard,
        )
        .into_result()
    }

    /// Atomically inspects the entry for `key` and updates it, deletes it, or leaves it
    /// alone.
    ///
    /// Works like [`HashMap::compute`], except that the function returns a [`ComputeOp`],
    /// which can also say that nothing should be written.
    ///
    /// Returns:
    ///
    ///  - for [`ComputeOp::Update`], the new value and `true`;
    ///  - for [`ComputeOp::Delete`], the removed value (if there was one) and `false`;
    ///  - for [`ComputeOp::Noop`], the current value (if there is one) and whether there is
    ///    one.
    ///
    /// # Examples
    ///
    /// ```
    /// use compute_map::{ComputeOp, HashMap};
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    ///
    /// let (v, present) = map.compute_v2("k", |_| ComputeOp::Update(42), &guard);
    /// assert_eq!((v, present), (Some(&42), true));
    ///
    /// let (v, present) = map.compute_v2("k", |old| match old {
    ///     Some(&old) => ComputeOp::Update(old + 42),
    ///     None => ComputeOp::Noop,
    /// }, &guard);
    /// assert_eq!((v, present), (Some(&84), true));
    ///
    /// let (v, present) = map.compute_v2("k", |_| ComputeOp::Delete, &guard);
    /// assert_eq!((v, present), (Some(&84), false));
    /// assert!(!map.contains_key("k", &guard));
    /// ```
    pub fn compute_v2<'g, F>(&'g self, key: K, f: F, guard: &'g Guard<'_>) -> (Option<&'g V>, bool)
    where
        F: FnOnce(Option<&V>) -> ComputeOp<V>,
    {
        self.check_guard(guard);
        self.compute_inner(key, f, guard).into_result()
    }

    /// Allocates a node for `key`, returning it with a reference to its value.
    fn new_node<'g>(&self, hash: u64, key: K, value: V) -> (Shared<'g, BinEntry<K, V>>, &'g V) {
        let value = Shared::boxed(value, &self.collector);
        let node = Shared::boxed(BinEntry::Node(Node::new(hash, key, value)), &self.collector);
        (node, value_ref(value))
    }

    fn compute_inner<'g, F>(
        &'g self,
        mut key: K,
        mut f: F,
        guard: &'g Guard<'_>,
    ) -> Computed<'g, V>
    where
        F: FnOnce(Option<&V>) -> ComputeOp<V>,
    {
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            let Some(t) = live(table) else {
                table = self.init_table(guard);
                continue;
            };
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                match self.compute_in_empty_bin(t, bini, hash, key, f, guard) {
                    Ok(computed) => return computed,
                    Err(returned) => {
                        (key, f) = returned;
                        continue;
                    }
                }
            }

            match *head_of(bin) {
                BinEntry::Moved => table = self.help_transfer(table, guard),
                // another compute is deciding what goes here
                BinEntry::Reserved(ref lock) => drop(lock.lock()),
                BinEntry::Node(ref head) => {
                    let Some(held) = t.lock_if_head(bini, bin, &head.lock, guard) else {
                        continue;
                    };
                    let spot = seek(bin, hash, &key, guard);
                    // safety: see `seek`
                    let node = unsafe { spot.at.node() };

                    let computed = if spot.found {
                        let value = node.value.load(Ordering::SeqCst, guard);
                        let current = value_ref(value);
                        match f(Some(current)) {
                            ComputeOp::Update(new) => {
                                let new = Shared::boxed(new, &self.collector);
                                let replaced = node.value.swap(new, Ordering::SeqCst, guard);
                                // safety: the node no longer points at the replaced value,
                                // and readers that loaded it hold guards.
                                unsafe { guard.retire_shared(replaced) };
                                Computed {
                                    old: Some(current),
                                    new: Some(value_ref(new)),
                                }
                            }
                            ComputeOp::Delete => {
                                unlink(t, bini, &spot, value, guard);
                                Computed {
                                    old: Some(current),
                                    new: None,
                                }
                            }
                            ComputeOp::Noop => Computed {
                                old: Some(current),
                                new: Some(current),
                            },
                        }
                    } else {
                        match f(None) {
                            ComputeOp::Update(new) => {
                                let (appended, new) = self.new_node(hash, key, new);
                                node.next.store(appended, Ordering::SeqCst);
                                Computed {
                                    old: None,
                                    new: Some(new),
                                }
                            }
                            ComputeOp::Delete | ComputeOp::Noop => Computed {
                                old: None,
                                new: None,
                            },
                        }
                    };
                    drop(held);

                    match computed.count_delta() {
                        1 => self.entry_added(guard),
                        -1 => self.entries_removed(1),
                        _ => {}
                    }
                    return computed;
                }
            }
        }
    }

    /// Runs `f` for a key whose bin `bini` of `t` is empty, holding the bin with a locked
    /// reservation until the outcome is in place.
    ///
    /// Hands `key` and `f` back, unused, if another thread fills the bin first.
    #[allow(clippy::type_complexity)]
    fn compute_in_empty_bin<'g, F>(
        &'g self,
        t: &'g Table<K, V>,
        bini: usize,
        hash: u64,
        key: K,
        f: F,
        guard: &'g Guard<'_>,
    ) -> Result<Computed<'g, V>, (K, F)>
    where
        F: FnOnce(Option<&V>) -> ComputeOp<V>,
    {
        let reservation = Shared::boxed(BinEntry::Reserved(Mutex::new(())), &self.collector);
        // safety: not yet published, so nobody else can free it
        let Some(lock) = unsafe { reservation.deref() }.lock() else {
            unreachable!("reservations carry a lock");
        };
        let held = lock.lock();
        if let Err(lost) = t.cas_bin(bini, Shared::null(), reservation, guard) {
            drop(held);
            // safety: the reservation never became visible to other threads
            drop(unsafe { lost.new.into_box() });
            return Err((key, f));
        }
        let reserved = ReservedBin {
            table: t,
            index: bini,
            reservation,
            guard,
        };

        let new = match f(None) {
            ComputeOp::Update(value) => {
                let (node, value) = self.new_node(hash, key, value);
                t.store_bin(bini, node);
                Some(value)
            }
            // dropping `reserved` empties the bin again
            ComputeOp::Delete | ComputeOp::Noop => None,
        };
        drop(reserved);
        drop(held);

        if new.is_some() {
            self.entry_added(guard);
        }
        Ok(Computed { old: None, new })
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.guarded_eq(other, &self.guard(), &other.guard())
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: every reference the map hands out borrows it, so with `&mut self` nothing
        // can still point into the tables.
        let pending = unsafe { self.next_table.load_unprotected(Ordering::SeqCst) };
        assert!(pending.is_null(), "map dropped in the middle of a resize");

        let table = unsafe { self.table.load_unprotected(Ordering::SeqCst) };
        self.table.store(Shared::null(), Ordering::SeqCst);
        if table.is_null() {
            return;
        }
        // safety: as above, and the current table is owned by the map alone
        let mut table = unsafe { table.into_box() };
        table.drop_bins();
        // anything retired earlier is freed along with `collector`
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let iter = iter.into_iter();
        // duplicates in the input or keys already present would make the full hint an
        // overestimate once the map has entries
        let (hint, _) = iter.size_hint();
        let expected = if self.is_empty() { hint } else { hint.div_ceil(2) };

        let guard = self.guard();
        self.reserve(expected, &guard);
        for (key, value) in iter {
            self.insert(key, value, &guard);
        }
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for &HashMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Eq,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        self.extend(iter.into_iter().map(|(&key, &value)| (key, value)));
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let map = Self::with_capacity_and_hasher(iter.size_hint().0, S::default());
        {
            let guard = map.guard();
            for (key, value) in iter {
                map.insert(key, value, &guard);
            }
        }
        map
    }
}

impl<'a, K, V, S> FromIterator<(&'a K, &'a V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Eq,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (&'a K, &'a V)>>(iter: T) -> Self {
        iter.into_iter().map(|(&key, &value)| (key, value)).collect()
    }
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send + Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> HashMap<K, V, S> {
        let copy = Self::with_capacity_and_hasher(self.len(), self.build_hasher.clone());
        {
            let ours = self.guard();
            let theirs = copy.guard();
            for (key, value) in self.iter(&ours) {
                copy.insert(key.clone(), value.clone(), &theirs);
            }
        }
        copy
    }
}

/// Physical cores, looked up once.
#[cfg(not(miri))]
fn num_cpus() -> usize {
    static CPUS: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *CPUS.get_or_init(num_cpus::get_physical)
}

#[cfg(miri)]
const fn num_cpus() -> usize {
    1
}
