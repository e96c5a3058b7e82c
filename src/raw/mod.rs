use crate::node::{BinEntry, Node};
use crate::reclaim::{self, Atomic, Collector, Guard, Shared};
use parking_lot::{Mutex, MutexGuard};
use std::borrow::Borrow;
use std::sync::atomic::Ordering;

/// One generation of the map's bins.
#[derive(Debug)]
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,

    /// The forwarding entry every moved bin of this table points at. One instance is enough
    /// since a `Moved` carries no data.
    moved: Atomic<BinEntry<K, V>>,

    /// Where moved bins went. Set by the first `get_moved` of a resize.
    ///
    /// Reading it is sound through any table that was itself loaded under a guard still held:
    /// the table it names is retired only after a later resize has replaced it as the map's
    /// table, and that retirement happens after the guard was taken.
    next_table: Atomic<Table<K, V>>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn from(bins: Vec<Atomic<BinEntry<K, V>>>, collector: &Collector) -> Self {
        Self {
            bins: bins.into_boxed_slice(),
            moved: Atomic::from(Shared::boxed(BinEntry::Moved, collector)),
            next_table: Atomic::null(),
        }
    }

    pub(crate) fn new(bins: usize, collector: &Collector) -> Self {
        Self::from((0..bins).map(|_| Atomic::null()).collect(), collector)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    /// Returns this table's forwarding entry, after recording `for_table` as the table it
    /// forwards to.
    pub(crate) fn get_moved<'g>(
        &'g self,
        for_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BinEntry<K, V>> {
        let recorded = self.next_table(guard);
        if recorded.is_null() {
            if let Err(raced) = self.next_table.compare_exchange(
                Shared::null(),
                for_table,
                Ordering::SeqCst,
                Ordering::Relaxed,
                guard,
            ) {
                // another mover of the same resize got here first
                assert_eq!(raced.current, for_table);
            }
        } else {
            assert_eq!(recorded, for_table, "one table resized into two");
        }
        self.moved.load(Ordering::SeqCst, guard)
    }

    /// Finds the node for `key` in the bin headed by `bin`, chasing forwarding entries into
    /// newer tables.
    pub(crate) fn find<'g, Q>(
        &'g self,
        bin: &'g BinEntry<K, V>,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        match *bin {
            BinEntry::Node(ref head) => {
                let mut node = head;
                while node.hash != hash || node.key.borrow() != key {
                    let next = node.next.load(Ordering::SeqCst, guard);
                    if next.is_null() {
                        return None;
                    }
                    // safety: a node is retired only after being unlinked, which did not
                    // happen before our guard was taken
                    node = unsafe { next.node() };
                }
                Some(node)
            }
            // nothing is committed to a reserved bin yet
            BinEntry::Reserved(_) => None,
            BinEntry::Moved => {
                // safety: see `next_table`
                let next = unsafe { self.next_table(guard).deref() };
                let bin = next.bin(next.bini(hash), guard);
                if bin.is_null() {
                    return None;
                }
                // safety: the bin was loaded from a table our guard protects
                next.find(unsafe { bin.deref() }, hash, key, guard)
            }
        }
    }

    /// Locks `lock` and hands the lock back only if `head` still heads bin `i`.
    ///
    /// A `None` means the bin changed while we waited, and the caller should read it again.
    pub(crate) fn lock_if_head<'l>(
        &self,
        i: usize,
        head: Shared<'_, BinEntry<K, V>>,
        lock: &'l Mutex<()>,
        guard: &Guard<'_>,
    ) -> Option<MutexGuard<'l, ()>> {
        let held = lock.lock();
        (self.bin(i, guard) == head).then_some(held)
    }

    /// Frees every node and value still stored in this table.
    pub(crate) fn drop_bins(&mut self) {
        let bins = std::mem::take(&mut self.bins);
        for bin in bins.iter() {
            // safety (for the unprotected loads and frees below): with &mut self, and every
            // reference the map hands out tied to a borrow of it, nothing else can reach these
            // entries any more. each node is in exactly one chain.
            let mut p = unsafe { bin.load_unprotected(Ordering::SeqCst) };
            if p.is_null() {
                continue;
            }
            match **unsafe { p.deref() } {
                // freed together with the table
                BinEntry::Moved => continue,
                BinEntry::Reserved(_) => {
                    drop(unsafe { p.into_box() });
                    continue;
                }
                BinEntry::Node(_) => {}
            }

            while !p.is_null() {
                let entry = unsafe { p.into_box() };
                let Some(node) = entry.as_node() else {
                    unreachable!("only nodes are chained");
                };
                p = unsafe { node.next.load_unprotected(Ordering::SeqCst) };
                let value = unsafe { node.value.load_unprotected(Ordering::SeqCst) };
                drop(unsafe { value.into_box() });
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // a dropped table has been emptied by drop_bins or fully forwarded by a resize
        if cfg!(debug_assertions) {
            for bin in self.bins.iter() {
                // safety: &mut self
                let bin = unsafe { bin.load_unprotected(Ordering::SeqCst) };
                let forwarded =
                    bin.is_null() || matches!(**unsafe { bin.deref() }, BinEntry::Moved);
                assert!(forwarded, "dropped table with non-empty bin");
            }
        }

        // no bin may point at `moved` once it is freed
        drop(std::mem::take(&mut self.bins));

        // safety: &mut self, and the forwarding entry belongs to this table alone
        let moved = unsafe { self.moved.load_unprotected(Ordering::SeqCst) };
        assert!(!moved.is_null(), "tables are built with a forwarding entry");
        drop(unsafe { moved.into_box() });

        // `next_table` is owned by the map, not by us
    }
}

impl<K, V> Table<K, V> {
    #[inline]
    pub(crate) fn bini(&self, hash: u64) -> usize {
        let mask = self.bins.len() as u64 - 1;
        (hash & mask) as usize
    }

    #[inline]
    pub(crate) fn bin<'g>(&'g self, i: usize, guard: &'g Guard<'_>) -> Shared<'g, BinEntry<K, V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bin<'g>(
        &'g self,
        i: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Result<Shared<'g, BinEntry<K, V>>, reclaim::CompareExchangeError<'g, BinEntry<K, V>>> {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn store_bin(&self, i: usize, new: Shared<'_, BinEntry<K, V>>) {
        self.bins[i].store(new, Ordering::Release)
    }

    #[inline]
    pub(crate) fn next_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        self.next_table.load(Ordering::SeqCst, guard)
    }
}
