//! Cost-weighted LRU list
//!
//! Intrusive doubly-linked list over an arena of slots. The head is the most
//! recently used node, the tail the least recently used one.

use std::fmt;

use tracing::{debug, trace, warn};

/// A value that can be charged against an [`LruList`] budget.
pub trait Weighted {
    /// Cost of the value while it is linked into the list.
    fn cost(&self) -> usize;
}

/// Handle to a node linked into an [`LruList`].
///
/// Ids are generation checked: once a node is removed or evicted its id
/// never resolves again, even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: usize,
    generation: u32,
}

/// Budget of an [`LruList`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruLimits {
    /// Total cost that triggers an eviction pass once exceeded
    pub max_total_cost: usize,
    /// Total cost an eviction pass shrinks the list down to
    pub target_cost: usize,
    /// Largest admissible cost of a single node (`None` = unlimited)
    pub max_node_cost: Option<usize>,
    /// Report a collection hint after every eviction pass
    pub force_gc: bool,
}

impl LruLimits {
    /// Limits with the given maximum and target, no per-node cap
    pub fn new(max_total_cost: usize, target_cost: usize) -> Self {
        Self {
            max_total_cost,
            target_cost,
            max_node_cost: None,
            force_gc: false,
        }
    }

    /// Cap the cost of a single node
    pub fn with_max_node_cost(mut self, max_node_cost: usize) -> Self {
        self.max_node_cost = Some(max_node_cost);
        self
    }

    /// Enable the collection hint after eviction passes
    pub fn with_force_gc(mut self, force_gc: bool) -> Self {
        self.force_gc = force_gc;
        self
    }
}

/// Outcome of [`LruList::add`]
#[derive(Debug)]
pub enum Admission<T> {
    /// The value was linked at the most recent end.
    ///
    /// `evicted` holds every node dropped by the eviction pass this insertion
    /// triggered, least recent first. It may include the new node itself when
    /// its cost alone exceeds the target, so callers should check
    /// [`LruList::contains`] before publishing `id`.
    Admitted {
        /// Handle of the new node
        id: NodeId,
        /// Nodes evicted to get back under budget
        evicted: Vec<(NodeId, T)>,
    },
    /// The value costs more than the per-node cap and was not linked
    Rejected(T),
}

/// Node in the LRU doubly-linked list
struct Node<T> {
    value: T,
    cost: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// LRU list bounded by the summed cost of its nodes
pub struct LruList<T> {
    slots: Vec<Slot<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    len: usize,
    total_cost: usize,
    limits: LruLimits,
}

impl<T: Weighted> LruList<T> {
    /// Create an empty list with the given budget
    pub fn new(limits: LruLimits) -> Self {
        assert!(limits.max_total_cost > 0, "Maximum cost must be greater than 0");
        assert!(
            limits.target_cost < limits.max_total_cost,
            "Target cost must be below the maximum cost"
        );

        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            len: 0,
            total_cost: 0,
            limits,
        }
    }

    /// Link a value at the most recent end
    pub fn add(&mut self, value: T) -> Admission<T> {
        let cost = value.cost();
        if let Some(max) = self.limits.max_node_cost {
            if cost > max {
                warn!(cost, max, "refusing to cache object above the per-object cost limit");
                return Admission::Rejected(value);
            }
        }

        let idx = self.alloc_slot();
        self.slots[idx].node = Some(Node {
            value,
            cost,
            prev: None,
            next: self.head,
        });

        if let Some(head_idx) = self.head {
            if let Some(head) = self.slots[head_idx].node.as_mut() {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }

        self.len += 1;
        self.total_cost += cost;
        trace!(index = idx, cost, total_cost = self.total_cost, "linked lru node");

        let id = NodeId {
            index: idx,
            generation: self.slots[idx].generation,
        };

        let evicted = if self.total_cost > self.limits.max_total_cost {
            self.shrink()
        } else {
            Vec::new()
        };

        Admission::Admitted { id, evicted }
    }

    /// Mark a node as most recently used
    ///
    /// Returns `false` if the id no longer refers to a linked node.
    pub fn touch(&mut self, id: NodeId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.move_to_front(id.index);
        true
    }

    /// Unlink a node and hand its value back
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        self.unlink(id.index);
        self.release(id.index).map(|node| node.value)
    }

    /// Borrow the value behind an id
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .map(|node| &node.value)
    }

    /// Mutably borrow the value behind an id
    ///
    /// The cost charged for the node is the one computed at insertion.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .map(|node| &mut node.value)
    }

    /// Check whether an id still refers to a linked node
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of linked nodes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Summed cost of all linked nodes
    pub fn total_cost(&self) -> usize {
        self.total_cost
    }

    /// Budget of this list
    pub fn limits(&self) -> LruLimits {
        self.limits
    }

    /// Iterate from the most to the least recently used node
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Unlink every node, least recent first
    pub fn clear(&mut self) -> Vec<(NodeId, T)> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(entry) = self.pop_tail() {
            drained.push(entry);
        }
        self.report_gc();
        drained
    }

    /// Unlink the least recently used node
    pub fn pop_lru(&mut self) -> Option<(NodeId, T)> {
        self.pop_tail()
    }

    /// Evict from the cold end until the total cost is back at the target
    fn shrink(&mut self) -> Vec<(NodeId, T)> {
        let mut evicted = Vec::new();
        while self.total_cost > self.limits.target_cost {
            match self.pop_tail() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        debug!(
            evicted = evicted.len(),
            total_cost = self.total_cost,
            target_cost = self.limits.target_cost,
            "lru eviction pass"
        );
        self.report_gc();
        evicted
    }

    fn report_gc(&self) {
        // Memory is reclaimed on drop, the flag only leaves a trace.
        if self.limits.force_gc {
            debug!("collection hint after lru shrink");
        }
    }

    fn pop_tail(&mut self) -> Option<(NodeId, T)> {
        let tail_idx = self.tail?;
        let generation = self.slots[tail_idx].generation;
        self.unlink(tail_idx);
        self.release(tail_idx).map(|node| {
            (
                NodeId {
                    index: tail_idx,
                    generation,
                },
                node.value,
            )
        })
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return; // Already at front
        }

        self.unlink(idx);

        if let Some(node) = self.slots[idx].node.as_mut() {
            node.prev = None;
            node.next = self.head;
        }

        if let Some(head_idx) = self.head {
            if let Some(head) = self.slots[head_idx].node.as_mut() {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].node.as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = self.slots[prev_idx].node.as_mut() {
                    prev_node.next = next;
                }
            }
            None => {
                self.head = next;
            }
        }

        match next {
            Some(next_idx) => {
                if let Some(next_node) = self.slots[next_idx].node.as_mut() {
                    next_node.prev = prev;
                }
            }
            None => {
                self.tail = prev;
            }
        }
    }

    /// Take the node out of an already unlinked slot and recycle the slot
    fn release(&mut self, idx: usize) -> Option<Node<T>> {
        let slot = &mut self.slots[idx];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(idx);
        self.len -= 1;
        self.total_cost -= node.cost;
        trace!(index = idx, cost = node.cost, total_cost = self.total_cost, "unlinked lru node");
        Some(node)
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.slots.len();
            self.slots.push(Slot {
                generation: 0,
                node: None,
            });
            idx
        }
    }
}

impl<T> fmt::Display for LruList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "max. cache costs of all cached objects: {}", self.limits.max_total_cost)?;
        writeln!(f, "target cache costs after eviction: {}", self.limits.target_cost)?;
        match self.limits.max_node_cost {
            Some(max) => writeln!(f, "max. cache costs per object: {}", max)?,
            None => writeln!(f, "max. cache costs per object: unlimited")?,
        }
        writeln!(f, "costs of all cached objects: {}", self.total_cost)?;
        writeln!(f, "sum of all cached objects: {}", self.len)?;
        if !self.limits.force_gc {
            write!(f, "no ")?;
        }
        write!(f, "collection hint is given during clean up")
    }
}

/// Iterator over an [`LruList`], most recent first
pub struct Iter<'a, T> {
    list: &'a LruList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let slot = &self.list.slots[idx];
        let node = slot.node.as_ref()?;
        self.cursor = node.next;
        Some((
            NodeId {
                index: idx,
                generation: slot.generation,
            },
            &node.value,
        ))
    }
}
