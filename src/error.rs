use crate::StreamId;

/// Errors produced by the public operations of a [`PriorityTree`](crate::PriorityTree).
///
/// Every variant corresponds to one of the externally-observable failure
/// outcomes of the tree: none of these are internal recovery steps. No
/// partial mutation ever precedes an error — validation happens before any
/// restructuring in `insert_stream` and `reprioritise`, so the tree is left
/// exactly as it was before the call.
#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
pub enum Error {
    /// `insert_stream` was called with an id already present in the tree.
    #[error("stream {0} already exists in the priority tree")]
    DuplicateStream(StreamId),

    /// An operation referenced a stream id (target or dependency parent)
    /// that is not present in the tree.
    #[error("stream {0} is not present in the priority tree")]
    MissingStream(StreamId),

    /// Cycle detection during `reprioritise` exhausted its ancestor-walk
    /// bound without reaching the root. This indicates the tree invariant
    /// (no cycles) has already been violated and is not recoverable by
    /// retrying the call.
    #[error("stream {0} is in a priority loop")]
    PriorityLoop(StreamId),

    /// `next_stream` found no active stream anywhere under the root.
    /// Every leaf is either absent or blocked; the caller should await
    /// further `unblock` calls before retrying.
    #[error("no stream is ready to be scheduled")]
    Deadlock,
}
