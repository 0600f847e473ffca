use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::StreamId;

/// Maximum legal HTTP/2 priority weight (RFC 7540 §5.3.2 encodes weight-1
/// on the wire in a single octet; this is the decoded value). Used as the
/// numerator in the weighted virtual-time step so that a stream of weight
/// `w` is scheduled `256/w` times as often as the reference weight-256
/// stream.
const MAX_WEIGHT: u64 = 256;

/// A single stream's entry in the priority tree.
///
/// `parent` and the members of `children` are stream ids, not references:
/// the tree is an id-indexed arena (`PriorityTree::streams`), so any
/// cross-node mutation (attaching/detaching a child, the scheduling
/// recursion's read of a child's weight) is orchestrated by
/// [`PriorityTree`](crate::PriorityTree) rather than by `Node` reaching
/// into another `Node` directly.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) stream_id: StreamId,
    pub(crate) weight: u32,
    pub(crate) active: bool,
    pub(crate) parent: Option<StreamId>,
    pub(crate) children: HashSet<StreamId>,
    /// `(virtual_time, child_id)` pairs, one per current child. Ordered
    /// ascending by virtual time, ties broken by ascending stream id —
    /// `Reverse` turns `BinaryHeap`'s max-heap into the min-heap this
    /// needs, and tuple ordering gives the tie-break for free.
    child_queue: BinaryHeap<Reverse<(u64, StreamId)>>,
    /// Virtual time charged to the most recently scheduled child. New
    /// children are enqueued at this cursor so they enter scheduling on
    /// the next round instead of being starved by time already spent.
    pub(crate) last_weight: u64,
    /// This node's own share of the integer-division remainder carried
    /// from its parent's last weighted step, applied the next time this
    /// node is scheduled by its parent.
    pub(crate) deficit: u64,
}

impl Node {
    pub(crate) fn new(stream_id: StreamId, weight: u32) -> Self {
        Node {
            stream_id,
            weight,
            active: true,
            parent: None,
            children: HashSet::new(),
            child_queue: BinaryHeap::new(),
            last_weight: 0,
            deficit: 0,
        }
    }

    /// Enqueues `child_id` at this node's current virtual-time cursor.
    /// Does not touch `children`; callers add to that set separately so
    /// that membership and queue contents can be asserted to agree.
    pub(crate) fn enqueue_child(&mut self, child_id: StreamId) {
        self.child_queue.push(Reverse((self.last_weight, child_id)));
    }

    /// Drops every queued child and resets the virtual-time cursor, as
    /// part of an exclusive insertion or a full rebuild.
    pub(crate) fn reset_queue(&mut self) {
        self.children.clear();
        self.child_queue.clear();
        self.last_weight = 0;
    }

    /// Pops the least-virtual-time child, if any.
    pub(crate) fn pop_candidate(&mut self) -> Option<(u64, StreamId)> {
        self.child_queue.pop().map(|Reverse(pair)| pair)
    }

    /// Rebuilds the queue with `removed` filtered out, preserving the
    /// relative virtual-time ordering of the survivors. `remove_child` is
    /// infrequent relative to `schedule`, so a drain/filter/reinsert is
    /// an acceptable cost against a decrease-key-capable heap.
    pub(crate) fn rebuild_without(&mut self, removed: StreamId) {
        let old = std::mem::take(&mut self.child_queue);
        self.child_queue = old
            .into_iter()
            .filter(|Reverse((_, id))| *id != removed)
            .collect();
    }

    /// Re-enqueues `child_id` after it was popped at virtual time `vt`,
    /// advancing this node's cursor and the child's own deficit. `weight`
    /// and `deficit` belong to the child node, so the caller (the arena
    /// holding both nodes) passes them in and writes the updated deficit
    /// back; `Node` has no way to reach another `Node` on its own.
    pub(crate) fn requeue_child(
        &mut self,
        vt: u64,
        child_id: StreamId,
        child_weight: u32,
        child_deficit: &mut u64,
    ) {
        self.last_weight = vt;
        let numerator = MAX_WEIGHT + *child_deficit;
        let step = numerator / child_weight as u64;
        *child_deficit = numerator % child_weight as u64;
        self.child_queue.push(Reverse((vt + step, child_id)));
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.child_queue.len()
    }
}
