use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::node::Node;
use crate::{Error, StreamId, DEFAULT_WEIGHT, ROOT_STREAM_ID};

/// The connection-wide HTTP/2 stream priority tree.
///
/// Owns every [`Node`] by stream id, including the synthetic root (stream
/// 0: always inactive, weight 1, never removed). A connection driver
/// mutates the tree out of band as PRIORITY/HEADERS frames arrive and as
/// streams become writable or drained (`insert_stream`, `reprioritise`,
/// `remove_stream`, `block`, `unblock`), and calls `next_stream` whenever
/// it wants the next stream id to write to.
///
/// Not internally synchronized: a single thread, or a single mutex
/// guarding every call including `next_stream`, owns the tree.
#[derive(Debug, Clone)]
pub struct PriorityTree {
    streams: HashMap<StreamId, Node>,
}

impl Default for PriorityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityTree {
    /// Creates a tree containing only the synthetic, inactive root.
    pub fn new() -> Self {
        let mut streams = HashMap::new();
        streams.insert(ROOT_STREAM_ID, Node::new(ROOT_STREAM_ID, 1));
        // The root is never schedulable.
        streams.get_mut(&ROOT_STREAM_ID).unwrap().active = false;
        PriorityTree { streams }
    }

    /// Number of streams in the tree, including the root.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when only the root remains.
    pub fn is_empty(&self) -> bool {
        self.streams.len() == 1
    }

    /// Whether `stream_id` is currently present in the tree.
    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Inserts a new stream into the tree.
    ///
    /// `depends_on` is the id of the stream this one depends on; `None`
    /// (or, per RFC 7540, an explicit `0`) means it depends directly on
    /// the root. `weight` is accepted as given — policing the legal
    /// `1..=256` range is the caller's responsibility (this mirrors
    /// HTTP/2 semantics that tolerate any encoded value on the wire).
    ///
    /// Fails with [`Error::DuplicateStream`] if `stream_id` is already
    /// present, or [`Error::MissingStream`] if `depends_on` names an
    /// unknown stream. Neither failure mutates the tree.
    pub fn insert_stream(
        &mut self,
        stream_id: StreamId,
        depends_on: Option<StreamId>,
        weight: u32,
        exclusive: bool,
    ) -> Result<(), Error> {
        if self.streams.contains_key(&stream_id) {
            return Err(Error::DuplicateStream(stream_id));
        }
        let parent_id = depends_on.unwrap_or(ROOT_STREAM_ID);
        if !self.streams.contains_key(&parent_id) {
            return Err(Error::MissingStream(parent_id));
        }

        debug!(
            "insert stream {} under {} (weight={}, exclusive={})",
            stream_id, parent_id, weight, exclusive
        );
        self.streams.insert(stream_id, Node::new(stream_id, weight));
        if exclusive {
            self.add_child_exclusive(parent_id, stream_id);
        } else {
            self.add_child(parent_id, stream_id);
        }
        Ok(())
    }

    /// Convenience wrapper over [`insert_stream`](Self::insert_stream)
    /// using the RFC 7540 §5.3.2 default weight of 16 and no dependency.
    pub fn insert_stream_default(&mut self, stream_id: StreamId) -> Result<(), Error> {
        self.insert_stream(stream_id, None, DEFAULT_WEIGHT, false)
    }

    /// Updates the priority of a stream already in the tree: its weight,
    /// its dependency parent, and whether that dependency is exclusive.
    ///
    /// Implements RFC 7540 §5.3.3's reprioritisation and cycle-breaking
    /// rule: if `depends_on` names a descendant of `stream_id` (which
    /// would otherwise create a cycle), that descendant is first pulled
    /// up to `stream_id`'s current parent before `stream_id` is placed
    /// beneath it.
    pub fn reprioritise(
        &mut self,
        stream_id: StreamId,
        depends_on: Option<StreamId>,
        weight: u32,
        exclusive: bool,
    ) -> Result<(), Error> {
        if !self.streams.contains_key(&stream_id) {
            return Err(Error::MissingStream(stream_id));
        }
        let new_parent_id = depends_on.unwrap_or(ROOT_STREAM_ID);
        if !self.streams.contains_key(&new_parent_id) {
            return Err(Error::MissingStream(new_parent_id));
        }
        // A stream cannot depend on itself; treat it as the degenerate
        // one-hop cycle it is rather than corrupting the tree.
        if new_parent_id == stream_id {
            return Err(Error::PriorityLoop(stream_id));
        }

        let cycle = if new_parent_id != ROOT_STREAM_ID {
            self.creates_cycle(new_parent_id, stream_id)?
        } else {
            false
        };

        // Weight is updated before any restructuring.
        self.streams.get_mut(&stream_id).unwrap().weight = weight;

        if cycle {
            trace!(
                "reprioritise {}: {} is a descendant, repairing cycle",
                stream_id, new_parent_id
            );
            let new_parent_parent = self.streams[&new_parent_id]
                .parent
                .expect("non-root stream always has a parent");
            // RFC 7540 §5.3.3: the new parent keeps its own subtree when
            // relocated (see DESIGN.md's Open Question decision).
            self.remove_child(new_parent_parent, new_parent_id, false);
            let current_parent = self.streams[&stream_id]
                .parent
                .expect("non-root stream always has a parent");
            self.add_child(current_parent, new_parent_id);
        }

        let current_parent = self.streams[&stream_id]
            .parent
            .expect("non-root stream always has a parent");
        self.remove_child(current_parent, stream_id, false);

        if exclusive {
            self.add_child_exclusive(new_parent_id, stream_id);
        } else {
            self.add_child(new_parent_id, stream_id);
        }

        debug!(
            "reprioritised stream {} under {} (weight={}, exclusive={})",
            stream_id, new_parent_id, weight, exclusive
        );
        Ok(())
    }

    /// Removes a stream from the tree. Its children are re-homed onto its
    /// parent, matching the HTTP/2 rule that dependents of a closed
    /// stream move up to their grandparent.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Result<(), Error> {
        // Stream 0 names the root, not a real, independently removable
        // stream; treat it the same as any other unaddressable id.
        if stream_id == ROOT_STREAM_ID || !self.streams.contains_key(&stream_id) {
            return Err(Error::MissingStream(stream_id));
        }

        debug!("removing stream {}", stream_id);
        let parent_id = self.streams[&stream_id]
            .parent
            .expect("non-root stream always has a parent");
        self.remove_child(parent_id, stream_id, true);
        self.streams.remove(&stream_id);
        Ok(())
    }

    /// Marks a stream as having no data ready to send. Idempotent.
    pub fn block(&mut self, stream_id: StreamId) -> Result<(), Error> {
        self.set_active(stream_id, false)
    }

    /// Marks a stream as having data ready to send. Idempotent.
    pub fn unblock(&mut self, stream_id: StreamId) -> Result<(), Error> {
        self.set_active(stream_id, true)
    }

    fn set_active(&mut self, stream_id: StreamId, active: bool) -> Result<(), Error> {
        if stream_id == ROOT_STREAM_ID {
            return Err(Error::MissingStream(stream_id));
        }
        let node = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::MissingStream(stream_id))?;
        node.active = active;
        trace!("stream {} active={}", stream_id, active);
        Ok(())
    }

    /// Returns the id of the next stream to schedule, or
    /// [`Error::Deadlock`] if every stream is either absent or blocked.
    pub fn next_stream(&mut self) -> Result<StreamId, Error> {
        match self.schedule_node(ROOT_STREAM_ID) {
            Some(id) => {
                trace!("scheduling stream {}", id);
                Ok(id)
            }
            None => {
                warn!("deadlock: no active stream under the root");
                Err(Error::Deadlock)
            }
        }
    }

    /// Reports whether `new_parent_id` is a descendant of `current_id`,
    /// i.e. whether making `current_id` depend on `new_parent_id` would
    /// create a cycle. Walks `new_parent_id`'s ancestor chain upward,
    /// bounded by the current number of streams in the tree (the
    /// maximum possible tree depth) rather than a fixed constant, so
    /// large connections cannot spuriously trip the guard.
    fn creates_cycle(&self, new_parent_id: StreamId, current_id: StreamId) -> Result<bool, Error> {
        let bound = self.streams.len();
        let mut ancestor_id = new_parent_id;
        for _ in 0..bound {
            ancestor_id = self.streams[&ancestor_id]
                .parent
                .expect("non-root stream always has a parent");
            if ancestor_id == current_id {
                return Ok(true);
            }
            if ancestor_id == ROOT_STREAM_ID {
                return Ok(false);
            }
        }
        Err(Error::PriorityLoop(new_parent_id))
    }

    /// Attaches `child_id` as a plain (non-exclusive) child of
    /// `parent_id`. Both ids must already be present; this is only ever
    /// called after existence has been validated by a public operation.
    fn add_child(&mut self, parent_id: StreamId, child_id: StreamId) {
        {
            let parent = self
                .streams
                .get_mut(&parent_id)
                .expect("parent must exist");
            parent.children.insert(child_id);
            parent.enqueue_child(child_id);
        }
        let child = self.streams.get_mut(&child_id).expect("child must exist");
        child.parent = Some(parent_id);
    }

    /// Attaches `child_id` as the sole, exclusive child of `parent_id`:
    /// `parent_id`'s existing children become children of `child_id`.
    fn add_child_exclusive(&mut self, parent_id: StreamId, child_id: StreamId) {
        let mut old_children: Vec<StreamId> = self.streams[&parent_id]
            .children
            .iter()
            .copied()
            .collect();
        // Deterministic order: siblings have no required ordering
        // (invariant 3 only cares about queue/set membership), but a
        // stable order keeps behavior reproducible across runs.
        old_children.sort_unstable();

        self.streams
            .get_mut(&parent_id)
            .expect("parent must exist")
            .reset_queue();
        self.add_child(parent_id, child_id);

        for old_child in old_children {
            self.add_child(child_id, old_child);
        }
    }

    /// Detaches `child_id` from `parent_id`. If `strip_children`,
    /// `child_id`'s own children are transplanted onto `parent_id`,
    /// entering its queue at `parent_id`'s current virtual-time cursor.
    fn remove_child(&mut self, parent_id: StreamId, child_id: StreamId, strip_children: bool) {
        let grandchildren: Vec<StreamId> = if strip_children {
            self.streams[&child_id].children.iter().copied().collect()
        } else {
            Vec::new()
        };

        {
            let parent = self
                .streams
                .get_mut(&parent_id)
                .expect("parent must exist");
            parent.children.remove(&child_id);
            parent.rebuild_without(child_id);
        }

        for grandchild in grandchildren {
            self.add_child(parent_id, grandchild);
        }
    }

    /// The recursive scheduling step (§4.1 `schedule()`). `id`'s node
    /// must be inactive (true of the root, and of every node reached by
    /// recursion, since a call only recurses into an inactive child).
    /// Returns `None` ("queue empty") if no active descendant exists
    /// beneath `id`.
    fn schedule_node(&mut self, id: StreamId) -> Option<StreamId> {
        let mut popped: Vec<(u64, StreamId)> = Vec::new();
        let mut result = None;

        loop {
            let candidate = self
                .streams
                .get_mut(&id)
                .expect("node must exist")
                .pop_candidate();
            let (vt, child_id) = match candidate {
                Some(pair) => pair,
                None => break,
            };
            popped.push((vt, child_id));

            if self.streams[&child_id].active {
                result = Some(child_id);
                break;
            }
            match self.schedule_node(child_id) {
                Some(found) => {
                    result = Some(found);
                    break;
                }
                None => continue,
            }
        }

        // Every popped entry is re-enqueued with an advanced virtual
        // time, regardless of whether scheduling succeeded.
        for (vt, child_id) in popped {
            let child_weight = self.streams[&child_id].weight;
            let mut child_deficit = self.streams[&child_id].deficit;
            self.streams
                .get_mut(&id)
                .expect("node must exist")
                .requeue_child(vt, child_id, child_weight, &mut child_deficit);
            self.streams.get_mut(&child_id).expect("child must exist").deficit = child_deficit;
        }

        result
    }
}

/// Iterator form of [`next_stream`](PriorityTree::next_stream). Each call
/// performs exactly one scheduling decision and never terminates the
/// sequence on its own: a deadlock is reported as
/// `Some(Err(Error::Deadlock))`, not `None`, since the tree may become
/// schedulable again after a subsequent `unblock`.
impl Iterator for PriorityTree {
    type Item = Result<StreamId, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn tree_with(pairs: &[(StreamId, Option<StreamId>, u32)]) -> PriorityTree {
        let mut tree = PriorityTree::new();
        for &(id, parent, weight) in pairs {
            tree.insert_stream(id, parent, weight, false).unwrap();
        }
        tree
    }

    #[test]
    fn root_is_present_inactive_and_unremovable() {
        let mut tree = PriorityTree::new();
        assert!(tree.contains(ROOT_STREAM_ID));
        assert_eq!(tree.remove_stream(ROOT_STREAM_ID), Err(Error::MissingStream(0)));
        assert_eq!(tree.block(ROOT_STREAM_ID), Err(Error::MissingStream(0)));
    }

    #[test]
    fn fresh_tree_is_just_the_root_and_deadlocks() {
        let mut tree = PriorityTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.next_stream(), Err(Error::Deadlock));
    }

    #[test]
    fn insert_then_schedule_returns_only_active_leaves() {
        let mut tree = tree_with(&[(1, None, 16)]);
        assert_eq!(tree.next_stream(), Ok(1));
        tree.block(1).unwrap();
        assert_eq!(tree.next_stream(), Err(Error::Deadlock));
    }

    #[test]
    fn duplicate_insert_is_rejected_and_tree_is_unchanged() {
        let mut tree = tree_with(&[(1, None, 16)]);
        let before = tree.len();
        assert_eq!(
            tree.insert_stream(1, None, 16, false),
            Err(Error::DuplicateStream(1))
        );
        assert_eq!(tree.len(), before);
    }

    #[test]
    fn insert_with_unknown_parent_is_rejected() {
        let mut tree = PriorityTree::new();
        assert_eq!(
            tree.insert_stream(1, Some(99), 16, false),
            Err(Error::MissingStream(99))
        );
        assert!(!tree.contains(1));
    }

    #[test]
    fn operations_on_unknown_stream_are_missing() {
        let mut tree = PriorityTree::new();
        assert_eq!(tree.block(5), Err(Error::MissingStream(5)));
        assert_eq!(tree.unblock(5), Err(Error::MissingStream(5)));
        assert_eq!(tree.remove_stream(5), Err(Error::MissingStream(5)));
        assert_eq!(
            tree.reprioritise(5, None, 16, false),
            Err(Error::MissingStream(5))
        );
    }

    // Scenario 1: linear reprioritise to descendant (RFC 7540 figure-5).
    #[test]
    fn reprioritise_onto_descendant_pulls_it_up_first() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(3, Some(1), 16, false).unwrap();
        tree.insert_stream(5, Some(3), 16, false).unwrap();
        tree.insert_stream(7, Some(5), 16, false).unwrap();

        tree.reprioritise(1, Some(7), 16, false).unwrap();

        // Expected: 0 -> 7 -> 1 -> 3 -> 5
        assert_eq!(tree.streams[&7].parent, Some(0));
        assert_eq!(tree.streams[&1].parent, Some(7));
        assert_eq!(tree.streams[&3].parent, Some(1));
        assert_eq!(tree.streams[&5].parent, Some(3));
        assert!(tree.streams[&0].children.contains(&7));
        assert!(tree.streams[&7].children.contains(&1));
        assert!(tree.streams[&1].children.contains(&3));
        assert!(tree.streams[&3].children.contains(&5));
    }

    // Scenario 2: weighted sharing.
    #[test]
    fn weighted_sharing_matches_ratio_over_48_calls() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(3, None, 32, false).unwrap();

        let mut counts: StdHashMap<StreamId, u32> = StdHashMap::new();
        for _ in 0..48 {
            let id = tree.next_stream().unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }

        assert_eq!(counts[&1], 16);
        assert_eq!(counts[&3], 32);
    }

    #[test]
    fn weighted_sharing_converges_over_a_long_run() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 10, false).unwrap();
        tree.insert_stream(3, None, 30, false).unwrap();

        let mut counts: StdHashMap<StreamId, u32> = StdHashMap::new();
        let total = 4_000;
        for _ in 0..total {
            let id = tree.next_stream().unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }

        let ratio = counts[&3] as f64 / counts[&1] as f64;
        assert!((ratio - 3.0).abs() < 0.05, "ratio was {}", ratio);
    }

    // Scenario 3: blocking skips subtree.
    #[test]
    fn blocking_skips_subtree_until_unblocked() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(3, Some(1), 16, false).unwrap();
        tree.block(1).unwrap();
        tree.block(3).unwrap();

        assert_eq!(tree.next_stream(), Err(Error::Deadlock));

        tree.unblock(3).unwrap();
        assert_eq!(tree.next_stream(), Ok(3));
    }

    // Scenario 4: exclusive insertion.
    #[test]
    fn exclusive_insertion_adopts_siblings() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(3, None, 16, false).unwrap();
        tree.insert_stream(5, None, 16, true).unwrap();

        assert_eq!(tree.streams[&0].children.len(), 1);
        assert!(tree.streams[&0].children.contains(&5));
        assert_eq!(tree.streams[&5].children.len(), 2);
        assert!(tree.streams[&5].children.contains(&1));
        assert!(tree.streams[&5].children.contains(&3));
        assert_eq!(tree.streams[&1].parent, Some(5));
        assert_eq!(tree.streams[&3].parent, Some(5));
    }

    // Scenario 5: remove with transplant.
    #[test]
    fn remove_transplants_children_to_grandparent() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(3, Some(1), 16, false).unwrap();
        tree.insert_stream(5, Some(3), 16, false).unwrap();

        tree.remove_stream(3).unwrap();

        assert!(!tree.contains(3));
        assert_eq!(tree.streams[&5].parent, Some(1));
        assert!(tree.streams[&1].children.contains(&5));
    }

    // Scenario 6: duplicate rejection (covered above;
    // `duplicate_insert_is_rejected_and_tree_is_unchanged`).

    // Law: insert/remove round trip.
    #[test]
    fn insert_remove_round_trip_restores_subtree() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        let before_children: Vec<StreamId> = {
            let mut v: Vec<_> = tree.streams[&0].children.iter().copied().collect();
            v.sort_unstable();
            v
        };

        tree.insert_stream(3, Some(1), 16, false).unwrap();
        tree.remove_stream(3).unwrap();

        assert!(!tree.contains(3));
        let after_children: Vec<StreamId> = {
            let mut v: Vec<_> = tree.streams[&0].children.iter().copied().collect();
            v.sort_unstable();
            v
        };
        assert_eq!(before_children, after_children);
        assert!(tree.streams[&1].children.is_empty());
    }

    #[test]
    fn round_trip_reparents_children_added_in_between() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(9, Some(1), 16, false).unwrap();

        tree.insert_stream(3, Some(9), 16, false).unwrap();
        tree.remove_stream(9).unwrap();

        // 3 was added beneath 9 after 9 was inserted; once 9 is removed,
        // 3 should be reparented onto 1.
        assert_eq!(tree.streams[&3].parent, Some(1));
    }

    // Law: block/unblock idempotence.
    #[test]
    fn block_and_unblock_are_idempotent() {
        let mut tree = tree_with(&[(1, None, 16)]);
        tree.block(1).unwrap();
        tree.block(1).unwrap();
        assert!(!tree.streams[&1].active);

        tree.unblock(1).unwrap();
        tree.unblock(1).unwrap();
        assert!(tree.streams[&1].active);
    }

    #[test]
    fn cyclic_reprioritisation_is_repaired_not_rejected() {
        // 1 -> 2 -> 3, then try to make 1 depend on 3 (a -> d in the
        // original test vocabulary): 3 should be pulled up under 1's
        // former parent (root) and 1 placed beneath it.
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(2, Some(1), 16, false).unwrap();
        tree.insert_stream(3, Some(2), 16, false).unwrap();

        tree.reprioritise(1, Some(3), 16, false).unwrap();

        assert_eq!(tree.streams[&3].parent, Some(0));
        assert_eq!(tree.streams[&1].parent, Some(3));
        assert_eq!(tree.streams[&2].parent, Some(1));
    }

    #[test]
    fn self_dependency_is_a_priority_loop() {
        let mut tree = tree_with(&[(1, None, 16)]);
        assert_eq!(
            tree.reprioritise(1, Some(1), 16, false),
            Err(Error::PriorityLoop(1))
        );
    }

    #[test]
    fn reprioritise_to_root_is_always_legal() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(3, Some(1), 16, false).unwrap();

        tree.reprioritise(3, None, 32, false).unwrap();
        assert_eq!(tree.streams[&3].parent, Some(0));
        assert_eq!(tree.streams[&3].weight, 32);
    }

    #[test]
    fn iterator_reports_deadlock_without_stopping() {
        let mut tree = tree_with(&[(1, None, 16)]);
        tree.block(1).unwrap();
        assert_eq!(tree.next(), Some(Err(Error::Deadlock)));
        tree.unblock(1).unwrap();
        assert_eq!(tree.next(), Some(Ok(1)));
    }

    #[test]
    fn never_schedules_root_or_inactive_streams() {
        let mut tree = PriorityTree::new();
        tree.insert_stream(1, None, 16, false).unwrap();
        tree.insert_stream(3, Some(1), 16, false).unwrap();
        tree.block(1).unwrap();

        // 1 is blocked but has an active descendant (3); the scheduler
        // must route through it.
        let scheduled = tree.next_stream().unwrap();
        assert_eq!(scheduled, 3);
        assert_ne!(scheduled, ROOT_STREAM_ID);
    }
}
