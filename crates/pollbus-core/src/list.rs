//! [`IntrusiveList`] – lockable doubly linked list over an arena of nodes.
//!
//! Node memory and node linkage are separate concerns. [`ListCore::alloc`]
//! places a value in the arena and returns a stable, generation-checked
//! [`NodeId`]; the node starts *unlinked*. Linking operations
//! (`add_tail`, `add_head`, `insert_before`, `insert_after`) and
//! [`ListCore::remove`] only rewrite `prev`/`next` links, so removal from the
//! middle is O(1) and a removed node can be linked again later without
//! reallocating. [`ListCore::release`] frees the node (unlinking it first).
//!
//! # Locking
//!
//! [`IntrusiveList`] wraps the core in a mutex. Its methods take the lock for
//! the duration of a single operation. For batch work (iterate, then mutate
//! several nodes) call [`IntrusiveList::lock`] and use the [`ListCore`]
//! methods on the guard; nobody else can relink nodes while it is held.
//!
//! # Iteration
//!
//! Iteration follows links: read the current node's successor *before*
//! acting on the current node. An unlinked node has no successor, so a
//! removed node is never reached again. Removing a node that has not been
//! visited yet is safe; removing the node a cursor currently sits on ends
//! that cursor's walk and is the caller's responsibility.
//!
//! # Example
//!
//! ```
//! use pollbus_core::list::IntrusiveList;
//!
//! let list = IntrusiveList::new();
//! let a = list.alloc("a").unwrap();
//! let b = list.alloc("b").unwrap();
//! list.add_tail(a).unwrap();
//! list.add_head(b).unwrap();
//!
//! let guard = list.lock();
//! let order: Vec<_> = guard.iter().map(|(_, v)| *v).collect();
//! assert_eq!(order, ["b", "a"]);
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use pollbus_types::BusError;

static NEXT_LIST_ID: AtomicU32 = AtomicU32::new(1);

/// Stable handle to a node in a list's arena.
///
/// The generation makes handles to freed slots detectably stale instead of
/// silently aliasing whatever node reuses the slot. The owner stamp does the
/// same for handles presented to a list other than the one that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    owner: u32,
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<NodeId>,
    next: Option<NodeId>,
    linked: bool,
}

struct Node<T> {
    value: T,
    link: Link,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// The unlocked list: arena plus head/tail/count.
///
/// Obtained through [`IntrusiveList::lock`]; every method assumes the caller
/// holds the list's lock.
pub struct ListCore<T> {
    id: u32,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    count: usize,
}

impl<T> Default for ListCore<T> {
    fn default() -> Self {
        Self {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            count: 0,
        }
    }
}

impl<T> ListCore<T> {
    // ── Arena ───────────────────────────────────────────────────────────────

    /// Store `value` in a fresh, unlinked node.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] when the arena cannot grow.
    pub fn alloc(&mut self, value: T) -> Result<NodeId, BusError> {
        let node = Node {
            value,
            link: Link::default(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return Ok(NodeId {
                owner: self.id,
                index,
                generation: slot.generation,
            });
        }
        let index = u32::try_from(self.slots.len())
            .map_err(|_| BusError::OutOfMemory("list arena index space exhausted".to_string()))?;
        self.slots
            .try_reserve(1)
            .map_err(|e| BusError::OutOfMemory(format!("list arena: {e}")))?;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        Ok(NodeId {
            owner: self.id,
            index,
            generation: 0,
        })
    }

    /// Free the node behind `id`, unlinking it first if needed.
    ///
    /// # Errors
    ///
    /// [`BusError::StaleNode`] when `id` does not name a live node.
    pub fn release(&mut self, id: NodeId) -> Result<T, BusError> {
        if self.node(id)?.link.linked {
            self.remove(id)?;
        }
        let slot = &mut self.slots[id.index as usize];
        let node = slot.node.take().ok_or(BusError::StaleNode)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(node.value)
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id).ok().map(|n| &n.value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.node_mut(id).ok().map(|n| &mut n.value)
    }

    /// Whether `id` names a live node (linked or not).
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    pub fn is_linked(&self, id: NodeId) -> bool {
        self.node(id).is_ok_and(|n| n.link.linked)
    }

    /// Number of live nodes in the arena, linked or not.
    pub fn allocated(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    // ── Linking ─────────────────────────────────────────────────────────────

    /// Link `id` at the tail.
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyLinked`] if the node is already in the list,
    /// [`BusError::StaleNode`] for an unknown handle.
    pub fn add_tail(&mut self, id: NodeId) -> Result<(), BusError> {
        self.ensure_unlinked(id)?;
        let old_tail = self.tail;
        self.set_link(id, Link {
            prev: old_tail,
            next: None,
            linked: true,
        })?;
        match old_tail {
            Some(t) => self.link_of(t)?.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.count += 1;
        Ok(())
    }

    /// Link `id` at the head.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ListCore::add_tail`].
    pub fn add_head(&mut self, id: NodeId) -> Result<(), BusError> {
        self.ensure_unlinked(id)?;
        let old_head = self.head;
        self.set_link(id, Link {
            prev: None,
            next: old_head,
            linked: true,
        })?;
        match old_head {
            Some(h) => self.link_of(h)?.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.count += 1;
        Ok(())
    }

    /// Link `id` immediately before `next`.
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyLinked`] if `id` is linked, [`BusError::NotLinked`]
    /// if `next` is not, [`BusError::StaleNode`] for unknown handles.
    pub fn insert_before(&mut self, id: NodeId, next: NodeId) -> Result<(), BusError> {
        self.ensure_unlinked(id)?;
        self.ensure_linked(next)?;
        let prev = self.link_of(next)?.prev;
        self.set_link(id, Link {
            prev,
            next: Some(next),
            linked: true,
        })?;
        self.link_of(next)?.prev = Some(id);
        match prev {
            Some(p) => self.link_of(p)?.next = Some(id),
            None => self.head = Some(id),
        }
        self.count += 1;
        Ok(())
    }

    /// Link `id` immediately after `prev`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ListCore::insert_before`].
    pub fn insert_after(&mut self, id: NodeId, prev: NodeId) -> Result<(), BusError> {
        self.ensure_unlinked(id)?;
        self.ensure_linked(prev)?;
        let next = self.link_of(prev)?.next;
        self.set_link(id, Link {
            prev: Some(prev),
            next,
            linked: true,
        })?;
        self.link_of(prev)?.next = Some(id);
        match next {
            Some(n) => self.link_of(n)?.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.count += 1;
        Ok(())
    }

    /// Unlink `id`. The node stays allocated and can be linked again.
    ///
    /// # Errors
    ///
    /// [`BusError::NotLinked`] if the node is not in the list.
    pub fn remove(&mut self, id: NodeId) -> Result<(), BusError> {
        self.ensure_linked(id)?;
        let Link { prev, next, .. } = *self.link_of(id)?;
        match prev {
            Some(p) => self.link_of(p)?.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.link_of(n)?.prev = prev,
            None => self.tail = prev,
        }
        self.set_link(id, Link::default())?;
        self.count -= 1;
        Ok(())
    }

    // ── Navigation ──────────────────────────────────────────────────────────

    pub fn first(&self) -> Option<NodeId> {
        self.head
    }

    pub fn last(&self) -> Option<NodeId> {
        self.tail
    }

    /// Successor of `id`; `None` at the tail or when `id` is unlinked.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).ok().filter(|n| n.link.linked).and_then(|n| n.link.next)
    }

    /// Predecessor of `id`; `None` at the head or when `id` is unlinked.
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).ok().filter(|n| n.link.linked).and_then(|n| n.link.prev)
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Linked nodes from head to tail.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            core: self,
            cursor: self.head,
        }
    }

    /// Snapshot of the linked handles, head to tail.
    pub fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Every live node, linked or not, in arena order.
    pub fn allocated_ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .zip(0u32..)
            .filter(|(slot, _)| slot.node.is_some())
            .map(|(slot, index)| NodeId {
                owner: self.id,
                index,
                generation: slot.generation,
            })
            .collect()
    }

    // ── Internal helpers ────────────────────────────────────────────────────

    fn node(&self, id: NodeId) -> Result<&Node<T>, BusError> {
        if id.owner != self.id {
            return Err(BusError::StaleNode);
        }
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
            .ok_or(BusError::StaleNode)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<T>, BusError> {
        if id.owner != self.id {
            return Err(BusError::StaleNode);
        }
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
            .ok_or(BusError::StaleNode)
    }

    fn ensure_unlinked(&self, id: NodeId) -> Result<(), BusError> {
        if self.node(id)?.link.linked {
            return Err(BusError::AlreadyLinked);
        }
        Ok(())
    }

    fn ensure_linked(&self, id: NodeId) -> Result<(), BusError> {
        if !self.node(id)?.link.linked {
            return Err(BusError::NotLinked);
        }
        Ok(())
    }

    fn link_of(&mut self, id: NodeId) -> Result<&mut Link, BusError> {
        self.node_mut(id).map(|n| &mut n.link)
    }

    fn set_link(&mut self, id: NodeId, link: Link) -> Result<(), BusError> {
        *self.link_of(id)? = link;
        Ok(())
    }
}

/// Head-to-tail iterator over a [`ListCore`].
pub struct Iter<'a, T> {
    core: &'a ListCore<T>,
    cursor: Option<NodeId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = self.core.node(id).ok()?;
        self.cursor = node.link.next;
        Some((id, &node.value))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Locked wrapper
// ────────────────────────────────────────────────────────────────────────────

/// A [`ListCore`] behind a mutex. Each method locks for one operation.
pub struct IntrusiveList<T> {
    core: Mutex<ListCore<T>>,
}

impl<T> Default for IntrusiveList<T> {
    fn default() -> Self {
        Self {
            core: Mutex::new(ListCore::default()),
        }
    }
}

impl<T> IntrusiveList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the list lock for a batch of [`ListCore`] operations.
    pub fn lock(&self) -> MutexGuard<'_, ListCore<T>> {
        self.core.lock()
    }

    /// See [`ListCore::alloc`].
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] when the arena cannot grow.
    pub fn alloc(&self, value: T) -> Result<NodeId, BusError> {
        self.core.lock().alloc(value)
    }

    /// See [`ListCore::release`].
    ///
    /// # Errors
    ///
    /// [`BusError::StaleNode`] for unknown handles.
    pub fn release(&self, id: NodeId) -> Result<T, BusError> {
        self.core.lock().release(id)
    }

    /// See [`ListCore::add_tail`].
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyLinked`] or [`BusError::StaleNode`].
    pub fn add_tail(&self, id: NodeId) -> Result<(), BusError> {
        self.core.lock().add_tail(id)
    }

    /// See [`ListCore::add_head`].
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyLinked`] or [`BusError::StaleNode`].
    pub fn add_head(&self, id: NodeId) -> Result<(), BusError> {
        self.core.lock().add_head(id)
    }

    /// See [`ListCore::insert_before`].
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyLinked`], [`BusError::NotLinked`] or
    /// [`BusError::StaleNode`].
    pub fn insert_before(&self, id: NodeId, next: NodeId) -> Result<(), BusError> {
        self.core.lock().insert_before(id, next)
    }

    /// See [`ListCore::insert_after`].
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyLinked`], [`BusError::NotLinked`] or
    /// [`BusError::StaleNode`].
    pub fn insert_after(&self, id: NodeId, prev: NodeId) -> Result<(), BusError> {
        self.core.lock().insert_after(id, prev)
    }

    /// See [`ListCore::remove`].
    ///
    /// # Errors
    ///
    /// [`BusError::NotLinked`] or [`BusError::StaleNode`].
    pub fn remove(&self, id: NodeId) -> Result<(), BusError> {
        self.core.lock().remove(id)
    }

    pub fn first(&self) -> Option<NodeId> {
        self.core.lock().first()
    }

    pub fn last(&self) -> Option<NodeId> {
        self.core.lock().last()
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.core.lock().next(id)
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.core.lock().prev(id)
    }

    pub fn len(&self) -> usize {
        self.core.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().is_empty()
    }

    pub fn is_linked(&self, id: NodeId) -> bool {
        self.core.lock().is_linked(id)
    }

    /// Run `f` on the value behind `id` under the lock.
    pub fn with<R>(&self, id: NodeId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.core.lock().get(id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn values(list: &IntrusiveList<u32>) -> Vec<u32> {
        list.lock().iter().map(|(_, v)| *v).collect()
    }

    fn values_backwards(list: &IntrusiveList<u32>) -> Vec<u32> {
        let core = list.lock();
        let mut out = Vec::new();
        let mut cursor = core.last();
        while let Some(id) = cursor {
            out.push(*core.get(id).unwrap());
            cursor = core.prev(id);
        }
        out
    }

    #[test]
    fn empty_list_has_no_head_or_tail() {
        let list: IntrusiveList<u32> = IntrusiveList::new();
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        assert_eq!(list.last(), None);
    }

    #[test]
    fn insert_before_and_after_keep_links_consistent() {
        let list = IntrusiveList::new();
        let ids: Vec<_> = (0..4).map(|v| list.alloc(v).unwrap()).collect();
        list.add_tail(ids[0]).unwrap();
        list.add_tail(ids[3]).unwrap();
        list.insert_before(ids[1], ids[3]).unwrap();
        list.insert_after(ids[2], ids[1]).unwrap();

        assert_eq!(values(&list), vec![0, 1, 2, 3]);
        assert_eq!(values_backwards(&list), vec![3, 2, 1, 0]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn insert_before_head_and_after_tail_move_ends() {
        let list = IntrusiveList::new();
        let mid = list.alloc(1).unwrap();
        let front = list.alloc(0).unwrap();
        let back = list.alloc(2).unwrap();
        list.add_tail(mid).unwrap();
        list.insert_before(front, mid).unwrap();
        list.insert_after(back, mid).unwrap();
        assert_eq!(list.first(), Some(front));
        assert_eq!(list.last(), Some(back));
    }

    #[test]
    fn linking_a_linked_node_fails_without_mutation() {
        let list = IntrusiveList::new();
        let a = list.alloc(1).unwrap();
        let b = list.alloc(2).unwrap();
        list.add_tail(a).unwrap();
        list.add_tail(b).unwrap();

        assert_eq!(list.add_tail(a), Err(BusError::AlreadyLinked));
        assert_eq!(list.add_head(b), Err(BusError::AlreadyLinked));
        assert_eq!(list.insert_before(a, b), Err(BusError::AlreadyLinked));
        assert_eq!(values(&list), vec![1, 2]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn removing_an_unlinked_node_fails() {
        let list = IntrusiveList::new();
        let a = list.alloc(1).unwrap();
        assert_eq!(list.remove(a), Err(BusError::NotLinked));
        let b = list.alloc(2).unwrap();
        assert_eq!(list.insert_after(b, a), Err(BusError::NotLinked));
    }

    #[test]
    fn removed_node_can_be_relinked() {
        let list = IntrusiveList::new();
        let a = list.alloc(1).unwrap();
        let b = list.alloc(2).unwrap();
        list.add_tail(a).unwrap();
        list.add_tail(b).unwrap();
        list.remove(a).unwrap();
        assert!(!list.is_linked(a));
        assert_eq!(list.next(a), None);
        list.add_tail(a).unwrap();
        assert_eq!(values(&list), vec![2, 1]);
    }

    #[test]
    fn released_handle_becomes_stale() {
        let list = IntrusiveList::new();
        let a = list.alloc(7).unwrap();
        list.add_tail(a).unwrap();
        assert_eq!(list.release(a), Ok(7));
        assert!(list.is_empty());
        assert_eq!(list.add_tail(a), Err(BusError::StaleNode));

        // The slot is reused under a new generation.
        let b = list.alloc(8).unwrap();
        assert_ne!(a, b);
        assert_eq!(list.with(a, |v| *v), None);
        assert_eq!(list.with(b, |v| *v), Some(8));
    }

    #[test]
    fn handle_from_another_list_is_rejected() {
        let one = IntrusiveList::new();
        let two = IntrusiveList::new();
        let a = one.alloc(1).unwrap();
        let b = two.alloc(2).unwrap();
        two.add_tail(b).unwrap();

        // Same index and generation, different owner.
        assert_eq!(two.add_tail(a), Err(BusError::StaleNode));
        assert_eq!(two.remove(a), Err(BusError::StaleNode));
        assert_eq!(two.release(a), Err(BusError::StaleNode));
        assert_eq!(two.with(a, |v| *v), None);
        assert!(!two.is_linked(a));
        assert_eq!(two.len(), 1);
        assert_eq!(one.with(a, |v| *v), Some(1));
    }

    #[test]
    fn concurrent_add_and_remove_keep_links_consistent() {
        let list = IntrusiveList::new();
        std::thread::scope(|scope| {
            for t in 0..4u32 {
                let list = &list;
                scope.spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..200u32 {
                        let id = list.alloc(t * 1000 + i).unwrap();
                        if i % 2 == 0 {
                            list.add_tail(id).unwrap();
                        } else {
                            list.add_head(id).unwrap();
                        }
                        mine.push(id);
                        if i % 3 == 0 {
                            let victim = mine.remove(0);
                            list.remove(victim).unwrap();
                            list.release(victim).unwrap();
                        }
                    }
                });
            }
        });

        // 200 adds and 67 removals per thread.
        assert_eq!(list.len(), 4 * 133);
        assert_eq!(list.lock().allocated(), 4 * 133);
        let mut forward = values(&list);
        let mut backward = values_backwards(&list);
        assert_eq!(forward.len(), list.len());
        backward.reverse();
        assert_eq!(forward, backward);
        forward.sort_unstable();
        forward.dedup();
        assert_eq!(forward.len(), list.len());
    }

    #[test]
    fn cursor_walk_skips_nodes_removed_ahead_of_it() {
        let list = IntrusiveList::new();
        let ids: Vec<_> = (0..5).map(|v| list.alloc(v).unwrap()).collect();
        for id in &ids {
            list.add_tail(*id).unwrap();
        }

        let mut visited = Vec::new();
        let mut cursor = list.first();
        while let Some(id) = cursor {
            visited.push(list.with(id, |v| *v).unwrap());
            if visited.len() == 1 {
                // Remove a node the walk has not reached yet.
                list.remove(ids[2]).unwrap();
            }
            cursor = list.next(id);
        }
        assert_eq!(visited, vec![0, 1, 3, 4]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        AddTail(u32),
        AddHead(u32),
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u32>().prop_map(Op::AddTail),
            any::<u32>().prop_map(Op::AddHead),
            any::<usize>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn count_matches_adds_minus_removes(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let list = IntrusiveList::new();
            let mut model: VecDeque<(NodeId, u32)> = VecDeque::new();
            let (mut adds, mut removes) = (0usize, 0usize);

            for op in ops {
                match op {
                    Op::AddTail(v) => {
                        let id = list.alloc(v).unwrap();
                        list.add_tail(id).unwrap();
                        model.push_back((id, v));
                        adds += 1;
                    }
                    Op::AddHead(v) => {
                        let id = list.alloc(v).unwrap();
                        list.add_head(id).unwrap();
                        model.push_front((id, v));
                        adds += 1;
                    }
                    Op::Remove(i) if !model.is_empty() => {
                        let (id, _) = model.remove(i % model.len()).unwrap();
                        list.remove(id).unwrap();
                        removes += 1;
                    }
                    Op::Remove(_) => {}
                }
            }

            prop_assert_eq!(list.len(), adds - removes);
            let forward = values(&list);
            let expected: Vec<u32> = model.iter().map(|(_, v)| *v).collect();
            prop_assert_eq!(&forward, &expected);
            let mut backward = values_backwards(&list);
            backward.reverse();
            prop_assert_eq!(backward, expected);
            prop_assert_eq!(list.first().is_none(), list.is_empty());
            prop_assert_eq!(list.last().is_none(), list.is_empty());
        }
    }
}
