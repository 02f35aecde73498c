//! Mutation-tolerant lists with parked iterators.
//!
//! A [`Klist`] holds the device and driver registries of a bus and the
//! device list of every driver. Its iterators stay valid while other threads
//! insert and remove entries: an iterator holds its own reference to the node
//! it is parked on, and removing a node an iterator is parked on only marks
//! it dead. The node is physically unlinked when the last parked iterator
//! moves off it, and every iterator skips dead nodes.
//!
//! The list lock is only held while a cursor moves, never while the caller
//! looks at the item it was handed.


use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hadron_core::kwarn_on;
use hadron_core::sync::SpinLock;

/// Hook invoked with the item when a node is linked or finally unlinked.
pub type KlistHook<T> = fn(&T);

struct NodeInner<T> {
    item: T,
    dead: AtomicBool,
    /// Number of iterators parked on this node. Only changed under the list lock.
    parked: AtomicUsize,
}

/// Handle to an entry linked into a [`Klist`].
///
/// Needed to remove the entry again and to start an iteration after it.
pub struct KlistNode<T> {
    inner: Arc<NodeInner<T>>,
}

impl<T> KlistNode<T> {
    /// Returns the item stored in this node.
    pub fn item(&self) -> &T {
        &self.inner.item
    }

    /// Returns `true` while the node has not been removed from its list.
    pub fn is_attached(&self) -> bool {
        !self.inner.dead.load(Ordering::Acquire)
    }
}

impl<T> Clone for KlistNode<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for KlistNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlistNode")
            .field("item", &self.inner.item)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// A list whose iterators tolerate concurrent insertion and removal.
pub struct Klist<T> {
    nodes: SpinLock<Vec<Arc<NodeInner<T>>>>,
    get: Option<KlistHook<T>>,
    put: Option<KlistHook<T>>,
}

impl<T> Klist<T> {
    /// Creates an empty list without hooks.
    pub const fn new() -> Self {
        Self {
            nodes: SpinLock::named("klist", Vec::new()),
            get: None,
            put: None,
        }
    }

    /// Creates an empty list whose nodes call `get` when linked and `put`
    /// once they are physically unlinked.
    pub const fn with_hooks(get: KlistHook<T>, put: KlistHook<T>) -> Self {
        Self {
            nodes: SpinLock::named("klist", Vec::new()),
            get: Some(get),
            put: Some(put),
        }
    }

    fn new_node(&self, item: T) -> Arc<NodeInner<T>> {
        if let Some(get) = self.get {
            get(&item);
        }
        Arc::new(NodeInner {
            item,
            dead: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
        })
    }

    /// Links `item` at the tail of the list.
    pub fn add_tail(&self, item: T) -> KlistNode<T> {
        let inner = self.new_node(item);
        self.nodes.lock().push(Arc::clone(&inner));
        KlistNode { inner }
    }

    /// Links `item` at the head of the list.
    pub fn add_head(&self, item: T) -> KlistNode<T> {
        let inner = self.new_node(item);
        self.nodes.lock().insert(0, Arc::clone(&inner));
        KlistNode { inner }
    }

    /// Removes `node` from the list.
    ///
    /// Iterators skip the node from now on. If an iterator is parked on it,
    /// the physical unlink (and the `put` hook) is left to that iterator.
    pub fn del(&self, node: &KlistNode<T>) {
        let unlinked = {
            let mut nodes = self.nodes.lock();
            if kwarn_on!(
                node.inner.dead.swap(true, Ordering::AcqRel),
                "klist: node removed twice"
            ) {
                return;
            }
            if node.inner.parked.load(Ordering::Relaxed) == 0 {
                Self::unlink(&mut nodes, &node.inner)
            } else {
                None
            }
        };
        self.finish_unlink(unlinked);
    }

    /// Returns `true` if no live node is linked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes
            .lock()
            .iter()
            .filter(|n| !n.dead.load(Ordering::Relaxed))
            .count()
    }

    fn unlink(
        nodes: &mut Vec<Arc<NodeInner<T>>>,
        target: &Arc<NodeInner<T>>,
    ) -> Option<Arc<NodeInner<T>>> {
        let pos = nodes.iter().position(|n| Arc::ptr_eq(n, target))?;
        Some(nodes.remove(pos))
    }

    fn finish_unlink(&self, unlinked: Option<Arc<NodeInner<T>>>) {
        if let (Some(node), Some(put)) = (unlinked, self.put) {
            put(&node.item);
        }
    }
}

impl<T: Clone> Klist<T> {
    /// Returns the most recently linked live item.
    pub fn last(&self) -> Option<T> {
        self.nodes
            .lock()
            .iter()
            .rev()
            .find(|n| !n.dead.load(Ordering::Relaxed))
            .map(|n| n.item.clone())
    }

    /// Returns an iterator over the live items, starting at the head.
    pub fn iter(&self) -> KlistIter<'_, T> {
        KlistIter::new(self)
    }

    /// Returns a snapshot of the live items in list order.
    pub fn snapshot(&self) -> Vec<T> {
        self.nodes
            .lock()
            .iter()
            .filter(|n| !n.dead.load(Ordering::Relaxed))
            .map(|n| n.item.clone())
            .collect()
    }
}

impl<T> Default for Klist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Klist<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Klist").field("len", &self.len()).finish()
    }
}

/// Cursor over a [`Klist`].
///
/// Holds a reference to the node it is parked on, so the node cannot be
/// physically unlinked underneath it. Dropping the iterator releases that
/// reference.
pub struct KlistIter<'a, T> {
    list: &'a Klist<T>,
    cur: Option<Arc<NodeInner<T>>>,
}

impl<'a, T: Clone> KlistIter<'a, T> {
    /// Starts an iteration at the head of `list`.
    pub fn new(list: &'a Klist<T>) -> Self {
        Self { list, cur: None }
    }

    /// Starts an iteration that resumes after `start`.
    ///
    /// If `start` is `None` the iteration begins at the head. A `start` that
    /// was removed but is still linked because another iterator is parked on
    /// it resumes after it. One that is already unlinked has no position
    /// left, so the iteration begins at the head.
    pub fn new_at(list: &'a Klist<T>, start: Option<&KlistNode<T>>) -> Self {
        let cur = start.and_then(|node| {
            let nodes = list.nodes.lock();
            let linked = nodes.iter().any(|n| Arc::ptr_eq(n, &node.inner));
            linked.then(|| {
                node.inner.parked.fetch_add(1, Ordering::Relaxed);
                Arc::clone(&node.inner)
            })
        });
        Self { list, cur }
    }

    /// Releases the parked node, unlinking it if it died meanwhile.
    fn unpark(
        nodes: &mut Vec<Arc<NodeInner<T>>>,
        node: &Arc<NodeInner<T>>,
    ) -> Option<Arc<NodeInner<T>>> {
        let remaining = node.parked.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 && node.dead.load(Ordering::Acquire) {
            Klist::unlink(nodes, node)
        } else {
            None
        }
    }
}

impl<T: Clone> Iterator for KlistIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let (item, unlinked) = {
            let mut nodes = self.list.nodes.lock();
            let from = match &self.cur {
                // A parked node is never unlinked, so it is still present.
                Some(cur) => nodes
                    .iter()
                    .position(|n| Arc::ptr_eq(n, cur))
                    .map_or(nodes.len(), |pos| pos + 1),
                None => 0,
            };
            let next = nodes[from..]
                .iter()
                .find(|n| !n.dead.load(Ordering::Acquire))
                .cloned();
            if let Some(next) = &next {
                next.parked.fetch_add(1, Ordering::Relaxed);
            }
            let unlinked = match self.cur.take() {
                Some(old) => Self::unpark(&mut nodes, &old),
                None => None,
            };
            let item = next.as_ref().map(|n| n.item.clone());
            self.cur = next;
            (item, unlinked)
        };
        self.list.finish_unlink(unlinked);
        item
    }
}

impl<T> Drop for KlistIter<'_, T> {
    fn drop(&mut self) {
        let Some(cur) = self.cur.take() else {
            return;
        };
        let unlinked = {
            let mut nodes = self.list.nodes.lock();
            let remaining = cur.parked.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining == 0 && cur.dead.load(Ordering::Acquire) {
                Klist::unlink(&mut nodes, &cur)
            } else {
                None
            }
        };
        self.list.finish_unlink(unlinked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn add_and_iterate_in_order() {
        let list = Klist::new();
        list.add_tail(2);
        list.add_tail(3);
        list.add_head(1);
        assert_eq!(list.iter().collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.last(), Some(3));
    }

    #[test]
    fn del_hides_node() {
        let list = Klist::new();
        let a = list.add_tail('a');
        list.add_tail('b');
        list.del(&a);
        assert!(!a.is_attached());
        assert_eq!(list.snapshot(), ['b']);
    }

    #[test]
    fn removing_parked_node_keeps_cursor_valid() {
        let list = Klist::new();
        let a = list.add_tail(1);
        let b = list.add_tail(2);
        list.add_tail(3);

        let mut iter = list.iter();
        assert_eq!(iter.next(), Some(1));
        // The cursor is parked on `a`; deleting it and its successor must
        // not lose the rest of the walk.
        list.del(&a);
        list.del(&b);
        assert_eq!(iter.next(), Some(3));
        assert_eq!(iter.next(), None);
        drop(iter);
        assert_eq!(list.snapshot(), [3]);
    }

    #[test]
    fn insertion_during_walk_is_seen() {
        let list = Klist::new();
        list.add_tail(1);
        let mut iter = list.iter();
        assert_eq!(iter.next(), Some(1));
        list.add_tail(2);
        assert_eq!(iter.next(), Some(2));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn new_at_resumes_after_start() {
        let list = Klist::new();
        list.add_tail(1);
        let two = list.add_tail(2);
        list.add_tail(3);
        let rest: Vec<_> = KlistIter::new_at(&list, Some(&two)).collect();
        assert_eq!(rest, [3]);
    }

    #[test]
    fn new_at_unlinked_start_begins_at_head() {
        let list = Klist::new();
        let one = list.add_tail(1);
        list.add_tail(2);
        list.add_tail(3);

        list.del(&one);
        let rest: Vec<_> = KlistIter::new_at(&list, Some(&one)).collect();
        assert_eq!(rest, [2, 3]);

        let mid = Klist::new();
        mid.add_tail(1);
        let two = mid.add_tail(2);
        mid.add_tail(3);
        mid.del(&two);
        let all: Vec<_> = KlistIter::new_at(&mid, Some(&two)).collect();
        assert_eq!(all, [1, 3]);
    }

    #[test]
    fn new_at_removed_but_parked_start_resumes_after_it() {
        let list = Klist::new();
        list.add_tail(1);
        let two = list.add_tail(2);
        list.add_tail(3);

        let mut holder = list.iter();
        assert_eq!(holder.next(), Some(1));
        assert_eq!(holder.next(), Some(2));
        list.del(&two);
        let rest: Vec<_> = KlistIter::new_at(&list, Some(&two)).collect();
        assert_eq!(rest, [3]);
        drop(holder);
        assert_eq!(list.snapshot(), [1, 3]);
    }

    static GETS: AtomicUsize = AtomicUsize::new(0);
    static PUTS: AtomicUsize = AtomicUsize::new(0);

    fn count_get(_: &u32) {
        GETS.fetch_add(1, Ordering::SeqCst);
    }

    fn count_put(_: &u32) {
        PUTS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn put_hook_runs_after_last_iterator_leaves() {
        let list = Klist::with_hooks(count_get, count_put);
        let node = list.add_tail(7);
        list.add_tail(8);
        assert_eq!(GETS.load(Ordering::SeqCst), 2);

        let mut iter = list.iter();
        assert_eq!(iter.next(), Some(7));
        list.del(&node);
        // Still parked: not unlinked yet.
        assert_eq!(PUTS.load(Ordering::SeqCst), 0);
        drop(iter);
        assert_eq!(PUTS.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "removed twice")]
    fn double_del_is_reported() {
        let list = Klist::new();
        let node = list.add_tail(0);
        list.del(&node);
        list.del(&node);
    }
}
