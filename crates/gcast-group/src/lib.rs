//! Virtually synchronous process groups.
//!
//! A [`GroupNode`] is one member of a group. It multicasts with per-sender
//! FIFO reliability, installs views through a flush so that every member
//! delivers the same messages in a view before moving to the next one, and
//! merges subgroups after a network partition heals.
//!
//! The protocol is a small pipeline of stages, from the network up:
//!
//! - [`NakStage`]: sequence numbers, gap detection, retransmission, stability.
//! - [`FlushCoordinator`]: the block/drain barrier.
//! - [`Gms`]: joins, leaves, exclusions and two-phase view installs.
//! - [`MergeReconciler`]: partition healing.
//! - [`StateTransfer`]: handing application state to a member.
//!
//! Failure detection and discovery are external: feed them in through
//! [`GroupNode::on_member_crashed`], [`GroupNode::on_member_suspected`] and
//! [`GroupNode::on_coordinators_detected`].

pub mod app;
mod context;
pub mod error;
pub mod flush;
pub mod gms;
pub mod merge;
pub mod nak;
pub mod node;
pub mod stage;
pub mod state;
pub mod view;

pub use app::{Application, ChannelApplication, Poll, UpcallReceiver};
pub use error::GroupError;
pub use flush::{FlushCoordinator, FlushOutcome, FlushState, reconcile};
pub use gms::Gms;
pub use merge::{MergeOutcome, MergeReconciler, SubgroupState, merge_members};
pub use nak::NakStage;
pub use node::GroupNode;
pub use stage::{Event, Pipeline, Stage};
pub use state::{StateOutcome, StateTransfer, choose_provider};
pub use view::{ViewManager, Window};

#[cfg(test)]
mod tests;
