//! Protocol messages exchanged between group members.
//!
//! All messages are serialized with postcard. A digest embedded in a
//! message keeps its own binary layout (see `gcast_digest::codec`).

use std::fmt;

use bytes::Bytes;
use gcast_digest::Digest;
use gcast_types::{MemberId, Seqno, View, ViewId};
use gcast_window::SeqRange;
use serde::{Deserialize, Serialize};

use crate::NetError;

/// Identifies one flush attempt: the initiator plus a per-initiator counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlushId {
    /// Member that started the flush.
    pub initiator: MemberId,
    /// Increases with every attempt by this initiator.
    pub counter: u64,
}

impl FlushId {
    /// Create a flush identifier.
    pub fn new(initiator: MemberId, counter: u64) -> Self {
        Self { initiator, counter }
    }
}

impl fmt::Display for FlushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.initiator, self.counter)
    }
}

impl fmt::Debug for FlushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlushId({self})")
    }
}

/// Protocol messages exchanged between members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// A multicast message, original or retransmitted.
    Data {
        /// Original sender; differs from the envelope source on retransmission.
        sender: MemberId,
        /// Sender-assigned sequence number.
        seqno: Seqno,
        /// Application payload.
        payload: Bytes,
        /// Whether this copy answers a retransmission request.
        retransmit: bool,
    },

    /// Ask the receiver to resend messages of `sender`.
    XmitRequest {
        /// Original sender of the missing messages.
        sender: MemberId,
        /// Missing ranges.
        ranges: Vec<SeqRange>,
    },

    /// Periodic `(low, delivered, received)` report used for garbage collection.
    StableGossip {
        /// View the report belongs to.
        view_id: ViewId,
        /// One entry per sender window of the reporter.
        digest: Digest,
    },

    /// Flush phase 1: block and report window state.
    FlushRequest {
        /// The flush attempt.
        flush_id: FlushId,
        /// Members covered by the flush.
        members: Vec<MemberId>,
        /// Whether this is a total flush.
        total: bool,
    },

    /// Flush phase 1 reply: the participant is blocked; its window snapshots.
    FlushDigest {
        /// The flush attempt.
        flush_id: FlushId,
        /// Snapshot of every window of the participant.
        digest: Digest,
    },

    /// Flush phase 1 refusal: the participant is engaged in another flush.
    FlushReject {
        /// The refused flush attempt.
        flush_id: FlushId,
        /// The flush the participant is engaged in.
        engaged: FlushId,
    },

    /// Flush phase 2: drain every window up to the reconciled digest.
    FlushReconcile {
        /// The flush attempt.
        flush_id: FlushId,
        /// Target positions per sender.
        digest: Digest,
    },

    /// Flush phase 2 reply: the participant drained to the reconciled digest.
    FlushOk {
        /// The flush attempt.
        flush_id: FlushId,
        /// Snapshot after draining.
        digest: Digest,
    },

    /// Release the barrier of a flush.
    FlushStop {
        /// The flush attempt.
        flush_id: FlushId,
    },

    /// A member asks the coordinator to be added to the view.
    JoinRequest,

    /// A member asks the coordinator to be removed from the view.
    LeaveRequest,

    /// The coordinator confirms a leave; the leaver is out of the view.
    LeaveAck {
        /// The view installed without the leaver.
        view_id: ViewId,
    },

    /// View install phase 1.
    PrepareView {
        /// The proposed view.
        view: View,
        /// Reconciled digest the windows start from.
        digest: Digest,
    },

    /// View install phase 1 reply.
    ViewAck {
        /// The proposed view.
        view_id: ViewId,
        /// Whether the member staged the view.
        accepted: bool,
    },

    /// View install phase 2: make the staged view current.
    CommitView {
        /// The staged view.
        view_id: ViewId,
    },

    /// Drop a staged view.
    AbortView {
        /// The staged view.
        view_id: ViewId,
    },

    /// Merge leader asks a subgroup coordinator for its view and digest.
    MergeRequest {
        /// Merge attempt, chosen by the leader.
        merge_id: u64,
    },

    /// Subgroup coordinator's answer to a [`GroupMessage::MergeRequest`].
    MergeResponse {
        /// Merge attempt being answered.
        merge_id: u64,
        /// The subgroup's current view.
        view: View,
        /// The subgroup's window snapshots.
        digest: Digest,
    },

    /// A member asks the receiver for its application state. Sent while a
    /// flush holds the group.
    StateRequest {
        /// Transfer attempt, chosen by the requester.
        request_id: u64,
    },

    /// Answer to a [`GroupMessage::StateRequest`].
    StateResponse {
        /// Transfer attempt being answered.
        request_id: u64,
        /// Delivery positions the state corresponds to.
        digest: Digest,
        /// The provider's application state; `None` if it has none.
        state: Option<Bytes>,
    },
}

impl GroupMessage {
    /// Serialize with postcard.
    pub fn encode(&self) -> Result<Bytes, NetError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| NetError::Serialization(e.to_string()))
    }

    /// Deserialize a postcard frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        postcard::from_bytes(bytes).map_err(|e| NetError::Serialization(e.to_string()))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data { .. } => "data",
            Self::XmitRequest { .. } => "xmit-request",
            Self::StableGossip { .. } => "stable-gossip",
            Self::FlushRequest { .. } => "flush-request",
            Self::FlushDigest { .. } => "flush-digest",
            Self::FlushReject { .. } => "flush-reject",
            Self::FlushReconcile { .. } => "flush-reconcile",
            Self::FlushOk { .. } => "flush-ok",
            Self::FlushStop { .. } => "flush-stop",
            Self::JoinRequest => "join-request",
            Self::LeaveRequest => "leave-request",
            Self::LeaveAck { .. } => "leave-ack",
            Self::PrepareView { .. } => "prepare-view",
            Self::ViewAck { .. } => "view-ack",
            Self::CommitView { .. } => "commit-view",
            Self::AbortView { .. } => "abort-view",
            Self::MergeRequest { .. } => "merge-request",
            Self::MergeResponse { .. } => "merge-response",
            Self::StateRequest { .. } => "state-request",
            Self::StateResponse { .. } => "state-response",
        }
    }
}

/// A decoded message together with the member it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Immediate source of the message.
    pub from: MemberId,
    /// The message.
    pub message: GroupMessage,
}
