//! Error types for group operations.

use gcast_types::{MemberId, ViewId};

/// Errors that can occur while running a group member.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// Network transport error.
    #[error("network error: {0}")]
    Net(#[from] gcast_net::NetError),

    /// A window failed its consistency check.
    #[error("window error: {0}")]
    Window(#[from] gcast_window::WindowError),

    /// A send was refused because the local member is flushed.
    #[error("member is flushed, sends are rejected until unblock")]
    Flushed,

    /// The local member is not part of its current view.
    #[error("member {0} is not in the current view")]
    NotMember(MemberId),

    /// The flush behind a view change did not complete.
    #[error("flush failed: {0}")]
    FlushFailed(String),

    /// Another flush started by this member covers the same members.
    #[error("a flush started by this member is still active")]
    FlushInProgress,

    /// A proposed view is not newer than the installed one.
    #[error("stale view {proposed}, current view is {current}")]
    StaleView {
        /// The rejected proposal.
        proposed: ViewId,
        /// The installed view.
        current: ViewId,
    },

    /// A two-phase view install was aborted.
    #[error("view {view_id} was not installed: {reason}")]
    ViewInstall {
        /// The aborted view.
        view_id: ViewId,
        /// Why it was aborted.
        reason: String,
    },

    /// No view containing this member arrived in time.
    #[error("join through {0} timed out")]
    JoinTimeout(MemberId),

    /// The coordinator did not confirm the leave in time.
    #[error("leave timed out")]
    LeaveTimeout,

    /// No subgroup could be reconciled.
    #[error("merge failed: {0}")]
    MergeFailed(String),

    /// Application state could not be fetched.
    #[error("state transfer failed: {0}")]
    StateTransfer(String),

    /// The member has been shut down.
    #[error("member is shut down")]
    Shutdown,
}
