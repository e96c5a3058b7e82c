mod traverser;
pub(crate) use traverser::NodeIter;

use crate::node::Node;
use crate::reclaim::Guard;
use std::sync::atomic::Ordering;

fn value_of<'g, K, V>(node: &'g Node<K, V>, guard: &'g Guard<'_>) -> &'g V {
    let value = node.value.load(Ordering::SeqCst, guard);
    // safety: a value is retired only once it has been overwritten or its node unlinked, and
    // it cannot be reclaimed while `guard` is alive
    &**unsafe { value.deref() }
}

/// Entries of a [`HashMap`](crate::HashMap), from [`HashMap::iter`](crate::HashMap::iter).
///
/// No key is yielded twice, resizes included. Whether writes made after the iterator was
/// created show up is unspecified.
#[derive(Debug)]
pub struct Iter<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<(&'g K, &'g V)> {
        self.node_iter
            .next()
            .map(|node| (&node.key, value_of(node, self.guard)))
    }
}

/// Keys of a [`HashMap`](crate::HashMap), from [`HashMap::keys`](crate::HashMap::keys).
#[derive(Debug)]
pub struct Keys<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;

    fn next(&mut self) -> Option<&'g K> {
        self.node_iter.next().map(|node| &node.key)
    }
}

/// Values of a [`HashMap`](crate::HashMap), from [`HashMap::values`](crate::HashMap::values).
#[derive(Debug)]
pub struct Values<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;

    fn next(&mut self) -> Option<&'g V> {
        let guard = self.guard;
        self.node_iter.next().map(|node| value_of(node, guard))
    }
}
