use crate::node::{BinEntry, Node};
use crate::raw::Table;
use crate::reclaim::{Guard, Shared};
use std::sync::atomic::Ordering;

/// Walks every node of a table, following bins that a resize has moved forward.
///
/// Bin `i` of a table with `n` bins is split into bins `i` and `i + n` of the next table. When
/// the walk meets a moved bin it remembers where it was, visits both halves in the next table
/// (descending again if they have moved too), and then returns to the table it came from. A
/// key is therefore yielded at most once no matter how many resizes run during the walk.
#[derive(Debug)]
pub(crate) struct NodeIter<'g, K, V> {
    /// The table the walk is currently reading bins from.
    table: Option<&'g Table<K, V>>,
    /// Tables the walk descended from, innermost last.
    stack: Vec<Frame<'g, K, V>>,
    /// Node yielded last; the walk continues down its chain.
    prev: Option<&'g Node<K, V>>,
    /// Bin to read next in `table`.
    index: usize,
    /// Bin of the first table whose pieces are being visited.
    base_index: usize,
    base_limit: usize,
    base_size: usize,
    guard: &'g Guard<'g>,
}

#[derive(Debug)]
struct Frame<'g, K, V> {
    table: &'g Table<K, V>,
    length: usize,
    index: usize,
}

impl<'g, K, V> NodeIter<'g, K, V> {
    pub(crate) fn new(table: Shared<'g, Table<K, V>>, guard: &'g Guard<'_>) -> Self {
        // safety: a table read under a guard is only reclaimed after that guard is dropped
        let table = unsafe { table.as_ref() }.map(|t| &**t);
        let size = table.map_or(0, Table::len);
        NodeIter {
            table,
            stack: Vec::new(),
            prev: None,
            index: 0,
            base_index: 0,
            base_limit: size,
            base_size: size,
            guard,
        }
    }

    /// Moves on from bin `self.index` of a table with `n` bins.
    fn advance(&mut self, mut n: usize) {
        while let Some(frame) = self.stack.last() {
            if self.index + frame.length < n {
                // the upper half of the split bin is still to come
                self.index += frame.length;
                return;
            }
            n = frame.length;
            self.index = frame.index;
            self.table = Some(frame.table);
            self.stack.pop();
        }

        self.index += self.base_size;
        if self.index >= n {
            self.base_index += 1;
            self.index = self.base_index;
        }
    }
}

impl<'g, K, V> Iterator for NodeIter<'g, K, V> {
    type Item = &'g Node<K, V>;

    fn next(&mut self) -> Option<&'g Node<K, V>> {
        if let Some(prev) = self.prev.take() {
            let next = prev.next.load(Ordering::SeqCst, self.guard);
            if !next.is_null() {
                // safety: nodes are retired only after they are unlinked, and reclaimed only
                // after every guard that could have reached them, ours included, is gone
                let node = unsafe { next.node() };
                self.prev = Some(node);
                return Some(node);
            }
        }

        loop {
            let t = self
                .table
                .filter(|t| self.base_index < self.base_limit && self.index < t.len())?;
            let n = t.len();
            let bin = t.bin(self.index, self.guard);

            let mut head = None;
            if !bin.is_null() {
                // safety: as above
                match **unsafe { bin.deref() } {
                    BinEntry::Moved => {
                        // safety: a table reachable through a Moved entry is retired no
                        // earlier than the table holding that entry
                        let next = unsafe { t.next_table(self.guard).deref() };
                        self.stack.push(Frame {
                            table: t,
                            length: n,
                            index: self.index,
                        });
                        self.table = Some(&**next);
                        continue;
                    }
                    BinEntry::Node(ref node) => head = Some(node),
                    // still empty as far as readers are concerned
                    BinEntry::Reserved(_) => {}
                }
            }

            self.advance(n);
            if head.is_some() {
                self.prev = head;
                return head;
            }
        }
    }
}
