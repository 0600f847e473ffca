//! HTTP/2 stream priority tree.
//!
//! This crate tracks the set of open streams multiplexed over a single
//! HTTP/2 connection, the dependency relationships between them (as
//! established by HEADERS/PRIORITY frames, RFC 7540 §5.3), and the
//! relative weights that decide how a sender should share outbound
//! bandwidth among the streams that currently have data ready to go.
//!
//! The crate's only public responsibility is: given the dependency graph,
//! the active/blocked state of each stream, and the weights, hand back an
//! ordered, weighted, fair sequence of stream ids to service next. Frame
//! parsing, flow control, writing bytes to the wire, and connection state
//! are all out of scope — this is a pure, synchronous, in-memory data
//! structure that a connection driver calls into as frames arrive and as
//! streams become writable or drained.
//!
//! # Example
//!
//! ```
//! use h2_priority::PriorityTree;
//!
//! let mut tree = PriorityTree::new();
//! tree.insert_stream(1, None, 16, false).unwrap();
//! tree.insert_stream(3, None, 32, false).unwrap();
//!
//! // Both streams are active by default.
//! let first = tree.next_stream().unwrap();
//! assert!(first == 1 || first == 3);
//! ```

mod error;
mod node;
mod tree;

pub use error::Error;
pub use tree::PriorityTree;

/// A stream identifier. HTTP/2 stream ids are 31-bit unsigned integers on
/// the wire; stream 0 is reserved for the connection itself and, in this
/// crate, names the synthetic root of the priority tree.
pub type StreamId = u32;

/// The id reserved for the tree's synthetic root. Never a real stream.
pub const ROOT_STREAM_ID: StreamId = 0;

/// Default weight assigned to a stream when the caller does not specify
/// one, per RFC 7540 §5.3.2.
pub const DEFAULT_WEIGHT: u32 = 16;
