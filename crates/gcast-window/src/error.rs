//! Error types for the window crate.

use gcast_types::{MemberId, Seqno};

/// A window's internal state violated one of its invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    /// The counters are out of order.
    #[error(
        "window for {sender} has unordered counters: low={low} delivered={delivered} contiguous={contiguous} received={received}"
    )]
    Counters {
        /// Owner of the window.
        sender: MemberId,
        /// Garbage-collection watermark.
        low: Seqno,
        /// Highest delivered seqno.
        delivered: Seqno,
        /// Highest contiguous seqno.
        contiguous: Seqno,
        /// Highest received seqno.
        received: Seqno,
    },

    /// A message that must be buffered is absent.
    #[error("window for {sender} lost buffered message {seqno}")]
    MissingBuffered {
        /// Owner of the window.
        sender: MemberId,
        /// The absent seqno.
        seqno: Seqno,
    },

    /// A buffered message lies outside `[low, received]`.
    #[error("window for {sender} buffers out-of-range message {seqno}")]
    OutOfRange {
        /// Owner of the window.
        sender: MemberId,
        /// The stray seqno.
        seqno: Seqno,
    },
}
