use slab::Slab;
use std::iter;

struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A doubly linked list of keys in least-recently-unused order.
///
/// The front holds the key that has been unused the longest.
/// Every entry is addressed by the position returned from `push_back`, which stays valid
/// until the entry is removed.
pub(crate) struct LruList<K> {
    nodes: Slab<Node<K>>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K> Default for LruList<K> {
    fn default() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }
}

impl<K: Copy> LruList<K> {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn push_back(&mut self, key: K) -> usize {
        let position = self.nodes.insert(Node {
            key,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(position),
            None => self.head = Some(position),
        }

        self.tail = Some(position);
        position
    }

    pub(crate) fn remove(&mut self, position: usize) -> K {
        let node = self.nodes.remove(position);

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }

        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }

        node.key
    }

    #[cfg(test)]
    pub(crate) fn pop_front(&mut self) -> Option<K> {
        self.head.map(|head| self.remove(head))
    }

    /// Iterates over `(position, key)` from the least to the most recently unused entry.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, K)> + '_ {
        iter::successors(self.head, |&position| self.nodes[position].next)
            .map(|position| (position, self.nodes[position].key))
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }
}
