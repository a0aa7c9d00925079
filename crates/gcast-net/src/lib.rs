//! Wire protocol and transports for gcast.
//!
//! This crate implements the boundary between the group core and the
//! network:
//!
//! - [`GroupMessage`]: the wire protocol (postcard-serialized).
//! - [`Transport`]: the outbound seam the core sends through.
//! - [`MemoryNetwork`]: an in-process datagram network with link
//!   blocking, partitions and crashes, used by tests and the simulator.

mod error;
mod memory;
mod message;

pub use error::NetError;
pub use memory::{Frame, Inbound, MemoryNetwork, MemoryTransport};
pub use message::{Envelope, FlushId, GroupMessage};

use gcast_types::MemberId;

/// Trait abstracting the outbound network operations used by the group core.
///
/// Delivery is best effort: a successful send means the message left this
/// member, not that it arrived. Reliability is the core's job.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// The identity of the local member.
    fn local(&self) -> MemberId;

    /// Send a message to one member (may be the local member).
    async fn send_to(&self, dest: MemberId, msg: &GroupMessage) -> Result<(), NetError>;

    /// Send a message to each destination. Returns the failed destinations.
    async fn broadcast(&self, dests: &[MemberId], msg: &GroupMessage) -> Vec<(MemberId, NetError)> {
        let mut failed = Vec::new();
        for dest in dests {
            if let Err(e) = self.send_to(*dest, msg).await {
                failed.push((*dest, e));
            }
        }
        failed
    }
}
