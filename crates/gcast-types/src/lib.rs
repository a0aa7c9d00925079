//! Shared types and identifiers for gcast.
//!
//! This crate defines the core types used across the gcast workspace:
//! member identity ([`MemberId`], [`Seqno`]), group membership
//! ([`ViewId`], [`View`], [`ViewDelta`]) and the group tuning knobs
//! ([`GroupConfig`], [`SendPolicy`]).

pub mod events;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Per-sender message sequence number. Seqnos start at 1; 0 means "nothing yet".
pub type Seqno = u64;

// ---------------------------------------------------------------------------
// Member identity
// ---------------------------------------------------------------------------

/// Address tag for an IPv4 member in the binary encoding.
const TAG_V4: u8 = 4;
/// Address tag for an IPv6 member in the binary encoding.
const TAG_V6: u8 = 6;

/// Errors decoding a [`MemberId`] from its binary form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdDecodeError {
    /// The buffer ended before the address was complete.
    #[error("truncated member id: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// The leading address tag is neither IPv4 nor IPv6.
    #[error("unknown address tag {0}")]
    UnknownTag(u8),
}

/// Identity of a group member: the address and port it is reachable on.
///
/// Ordering is by address then port. The lowest member of a set wins
/// coordinator and merge-leader elections.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(SocketAddr);

impl MemberId {
    /// Create a member identity from a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// A member on the IPv4 loopback address. Used by in-process clusters.
    pub fn loopback(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// The underlying socket address.
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    /// Length of the binary encoding written by [`MemberId::encode`].
    pub fn encoded_len(&self) -> usize {
        match self.0.ip() {
            IpAddr::V4(_) => 1 + 4 + 2,
            IpAddr::V6(_) => 1 + 16 + 2,
        }
    }

    /// Write the variable-length binary form: `tag:u8`, address bytes, `port:u16`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(TAG_V4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(TAG_V6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16(self.0.port());
    }

    /// Read a member written by [`MemberId::encode`].
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, IdDecodeError> {
        ensure(buf, 1)?;
        let ip = match buf.get_u8() {
            TAG_V4 => {
                ensure(buf, 4 + 2)?;
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            TAG_V6 => {
                ensure(buf, 16 + 2)?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            tag => return Err(IdDecodeError::UnknownTag(tag)),
        };
        let port = buf.get_u16();
        Ok(Self(SocketAddr::new(ip, port)))
    }
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), IdDecodeError> {
    if buf.remaining() < needed {
        return Err(IdDecodeError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

impl From<SocketAddr> for MemberId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Identifier of an installed view.
///
/// Views are ordered by counter first, so a view created by any coordinator
/// with a higher counter supersedes one with a lower counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId {
    /// Strictly increasing along a coordinator lineage.
    pub counter: u64,
    /// The coordinator that created the view.
    pub creator: MemberId,
}

impl ViewId {
    /// Create a view identifier.
    pub fn new(creator: MemberId, counter: u64) -> Self {
        Self { counter, creator }
    }

    /// The identifier of the next view created by `creator`.
    pub fn next(&self, creator: MemberId) -> Self {
        Self {
            counter: self.counter + 1,
            creator,
        }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}]", self.creator, self.counter)
    }
}

impl fmt::Debug for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewId{self}")
    }
}

/// An installed group membership. Immutable once created.
///
/// The first member is the coordinator. A merge view additionally carries
/// the subgroup views it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    id: ViewId,
    members: Vec<MemberId>,
    subgroups: Vec<View>,
}

/// Membership difference between two consecutive views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDelta {
    /// Members present in the new view but not the old one.
    pub joined: Vec<MemberId>,
    /// Members present in the old view but not the new one.
    pub left: Vec<MemberId>,
}

impl View {
    /// Create a regular view. `members` must be non-empty; order is preserved.
    pub fn new(id: ViewId, members: Vec<MemberId>) -> Self {
        Self {
            id,
            members,
            subgroups: Vec::new(),
        }
    }

    /// Create a merge view from the subgroup views it reconciles.
    pub fn new_merge(id: ViewId, members: Vec<MemberId>, subgroups: Vec<View>) -> Self {
        Self {
            id,
            members,
            subgroups,
        }
    }

    /// The view identifier.
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// The coordinator (first member).
    pub fn coordinator(&self) -> Option<MemberId> {
        self.members.first().copied()
    }

    /// Ordered members.
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether `member` belongs to this view.
    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    /// Whether this view was produced by a merge.
    pub fn is_merge_view(&self) -> bool {
        !self.subgroups.is_empty()
    }

    /// Subgroup views of a merge view (empty for regular views).
    pub fn subgroups(&self) -> &[View] {
        &self.subgroups
    }

    /// Members that joined and left relative to `previous`.
    pub fn diff(&self, previous: &View) -> ViewDelta {
        ViewDelta {
            joined: self
                .members
                .iter()
                .filter(|m| !previous.contains(m))
                .copied()
                .collect(),
            left: previous
                .members
                .iter()
                .filter(|m| !self.contains(m))
                .copied()
                .collect(),
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.id)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{m}")?;
        }
        write!(f, ")")?;
        if self.is_merge_view() {
            write!(f, " merged from {} subgroups", self.subgroups.len())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What `multicast` does while the local member is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendPolicy {
    /// Wait until the flush is stopped.
    Block,
    /// Fail immediately with a "flushed" error.
    Reject,
}

/// Tuning knobs for a group member, passed into the core at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// Deadline for collecting every flush acknowledgement.
    pub flush_timeout: Duration,
    /// Period between stability gossip rounds.
    pub stability_interval: Duration,
    /// Delays between retransmission requests for one gap. The last value repeats.
    pub retransmit_backoff: Vec<Duration>,
    /// Deadline for collecting subgroup views and digests during a merge.
    pub merge_timeout: Duration,
    /// Deadline for view acknowledgements during a two-phase install.
    pub view_ack_timeout: Duration,
    /// Behaviour of application sends during a flush.
    pub send_policy: SendPolicy,
    /// Capacity of the bounded inbound message channel.
    pub inbound_capacity: usize,
    /// How long the last stability report of a departed member keeps
    /// holding back garbage collection, so a merge can still retransmit.
    pub departed_retention: Duration,
    /// Deadline for a state provider to answer once the group is flushed.
    pub state_timeout: Duration,
}

impl GroupConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            flush_timeout: Duration::from_secs(2),
            stability_interval: Duration::from_millis(100),
            retransmit_backoff: [20, 40, 80, 160]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            merge_timeout: Duration::from_secs(1),
            view_ack_timeout: Duration::from_secs(1),
            send_policy: SendPolicy::Block,
            inbound_capacity: 1024,
            departed_retention: Duration::from_secs(10),
            state_timeout: Duration::from_secs(1),
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            flush_timeout: Duration::from_secs(4),
            stability_interval: Duration::from_secs(1),
            retransmit_backoff: [100, 200, 400, 800, 1600]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            merge_timeout: Duration::from_secs(5),
            view_ack_timeout: Duration::from_secs(2),
            send_policy: SendPolicy::Block,
            inbound_capacity: 4096,
            departed_retention: Duration::from_secs(60),
            state_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
