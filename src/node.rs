use crate::reclaim::{Atomic, Shared};
use parking_lot::Mutex;

/// The head of a bin, or an entry further down its chain.
///
/// Only the head of a bin can be anything other than `Node`; every `next` pointer leads to
/// another `Node`.
#[derive(Debug)]
pub(crate) enum BinEntry<K, V> {
    Node(Node<K, V>),
    /// Placeholder for an empty bin whose contents a `compute` is currently deciding.
    ///
    /// The reserving thread holds this lock from before the reservation becomes visible until
    /// after the bin has been replaced with the outcome, so anyone who locks it afterwards
    /// finds a different bin head.
    Reserved(Mutex<()>),
    /// The bin has been transferred to the table's `next_table`.
    Moved,
}

impl<K, V> BinEntry<K, V> {
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        if let BinEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    /// The lock that serialises writers to the bin headed by this entry.
    pub(crate) fn lock(&self) -> Option<&Mutex<()>> {
        match *self {
            BinEntry::Node(ref n) => Some(&n.lock),
            BinEntry::Reserved(ref lock) => Some(lock),
            BinEntry::Moved => None,
        }
    }
}

/// Key-value entry.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
    /// Only meaningful while this node heads its bin.
    pub(crate) lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new<AV>(hash: u64, key: K, value: AV) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        Node::with_next(hash, key, value, Atomic::null())
    }

    pub(crate) fn with_next<AV>(hash: u64, key: K, value: AV, next: Atomic<BinEntry<K, V>>) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        Node {
            hash,
            key,
            value: value.into(),
            next,
            lock: Mutex::new(()),
        }
    }
}

impl<'g, K, V> Shared<'g, BinEntry<K, V>> {
    /// Views a bin entry known to be a `Node`.
    ///
    /// # Safety
    ///
    /// The pointer must be valid for `'g` (i.e., loaded under a guard that outlives `'g`).
    pub(crate) unsafe fn node(&self) -> &'g Node<K, V> {
        unsafe { self.deref() }
            .as_node()
            .expect("entries past the head of a bin are always nodes")
    }
}
