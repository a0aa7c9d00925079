//! Error types for network operations.

use gcast_types::MemberId;

/// Errors that can occur while sending or receiving group messages.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The destination has no endpoint (never registered or crashed).
    #[error("member {0} is unreachable")]
    Unreachable(MemberId),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The local endpoint has been shut down.
    #[error("endpoint closed")]
    Closed,
}
