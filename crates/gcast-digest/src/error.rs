//! Error types for digest decoding.

use gcast_types::IdDecodeError;

/// Errors produced while decoding a [`Digest`](crate::Digest).
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// The buffer ended before the announced entries were read.
    #[error("truncated digest: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish the current field.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A member identity could not be decoded.
    #[error("invalid member id: {0}")]
    Member(#[from] IdDecodeError),

    /// A seqno field was negative.
    #[error("negative seqno {value} in entry for {field}")]
    NegativeSeqno {
        /// Which field held the value.
        field: &'static str,
        /// The decoded value.
        value: i64,
    },

    /// A seqno is too large for the signed wire field.
    #[error("seqno {value} in field {field} does not fit the wire format")]
    SeqnoOverflow {
        /// Which field held the value.
        field: &'static str,
        /// The seqno.
        value: u64,
    },

    /// More entries than the count header can announce.
    #[error("digest has {0} entries, more than the wire format allows")]
    TooManyEntries(usize),

    /// The same member appeared twice.
    #[error("duplicate entry for member {0}")]
    DuplicateMember(gcast_types::MemberId),

    /// Bytes were left over after the last entry.
    #[error("{0} trailing bytes after digest")]
    TrailingBytes(usize),
}
