//! In-process datagram network.
//!
//! Every registered member gets a bounded inbound channel of encoded
//! frames. Sends behave like UDP: a blocked link or a full channel drops
//! the frame without telling the sender. Links are directional, so a test
//! can make B deaf to C while C still hears B.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use gcast_types::MemberId;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace, warn};

use crate::{Envelope, GroupMessage, NetError, Transport};

/// An encoded message and the member it came from.
pub type Frame = (MemberId, Bytes);

struct NetworkInner {
    capacity: usize,
    endpoints: RwLock<HashMap<MemberId, mpsc::Sender<Frame>>>,
    blocked: RwLock<HashSet<(MemberId, MemberId)>>,
    dropped: AtomicU64,
}

/// Shared in-memory network. Cheap to clone.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create a network whose inbound channels hold `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                capacity,
                endpoints: RwLock::new(HashMap::new()),
                blocked: RwLock::new(HashSet::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach `member`, replacing any previous endpoint it had.
    pub async fn register(&self, member: MemberId) -> (Arc<MemoryTransport>, Inbound) {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.endpoints.write().await.insert(member, tx);
        debug!(%member, "registered endpoint");

        let transport = Arc::new(MemoryTransport {
            local: member,
            network: self.clone(),
        });
        (transport, Inbound::new(member, rx))
    }

    /// Detach `member`: its inbound stream ends, sends to it fail and its own
    /// sends are dropped.
    pub async fn crash(&self, member: MemberId) {
        self.inner.endpoints.write().await.remove(&member);
        debug!(%member, "endpoint crashed");
    }

    /// Drop every frame travelling from `from` to `to`.
    pub async fn block(&self, from: MemberId, to: MemberId) {
        self.inner.blocked.write().await.insert((from, to));
    }

    /// Restore the link from `from` to `to`.
    pub async fn unblock(&self, from: MemberId, to: MemberId) {
        self.inner.blocked.write().await.remove(&(from, to));
    }

    /// Split the members into groups that cannot reach each other.
    pub async fn partition(&self, groups: &[&[MemberId]]) {
        let mut blocked = self.inner.blocked.write().await;
        for (i, left) in groups.iter().enumerate() {
            for (j, right) in groups.iter().enumerate() {
                if i == j {
                    continue;
                }
                for a in left.iter() {
                    for b in right.iter() {
                        blocked.insert((*a, *b));
                    }
                }
            }
        }
        debug!(groups = groups.len(), links = blocked.len(), "network partitioned");
    }

    /// Restore every link.
    pub async fn heal(&self) {
        self.inner.blocked.write().await.clear();
        debug!("network healed");
    }

    /// Whether frames from `from` to `to` are dropped.
    pub async fn is_blocked(&self, from: MemberId, to: MemberId) -> bool {
        self.inner.blocked.read().await.contains(&(from, to))
    }

    /// Frames dropped so far because of blocked links or full channels.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    async fn deliver(&self, from: MemberId, to: MemberId, frame: Bytes) -> Result<(), NetError> {
        if from != to && self.is_blocked(from, to).await {
            trace!(%from, %to, "link blocked, dropping frame");
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let tx = {
            let endpoints = self.inner.endpoints.read().await;
            if !endpoints.contains_key(&from) {
                trace!(%from, %to, "sender crashed, dropping frame");
                return Ok(());
            }
            endpoints.get(&to).cloned()
        };
        let Some(tx) = tx else {
            return Err(NetError::Unreachable(to));
        };

        match tx.try_send((from, frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%from, %to, "inbound channel full, dropping frame");
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetError::Unreachable(to)),
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A member's outbound side of a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: MemberId,
    network: MemoryNetwork,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local(&self) -> MemberId {
        self.local
    }

    async fn send_to(&self, dest: MemberId, msg: &GroupMessage) -> Result<(), NetError> {
        let frame = msg.encode()?;
        self.network.deliver(self.local, dest, frame).await
    }

    async fn broadcast(&self, dests: &[MemberId], msg: &GroupMessage) -> Vec<(MemberId, NetError)> {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%e, kind = msg.kind(), "failed to encode broadcast");
                return dests
                    .iter()
                    .map(|dest| (*dest, NetError::Serialization(e.to_string())))
                    .collect();
            }
        };
        let mut failed = Vec::new();
        for dest in dests {
            if let Err(e) = self.network.deliver(self.local, *dest, frame.clone()).await {
                failed.push((*dest, e));
            }
        }
        failed
    }
}

/// A member's stream of inbound messages.
pub struct Inbound {
    local: MemberId,
    rx: mpsc::Receiver<Frame>,
}

impl Inbound {
    /// Wrap a channel of encoded frames addressed to `local`.
    pub fn new(local: MemberId, rx: mpsc::Receiver<Frame>) -> Self {
        Self { local, rx }
    }

    /// Wait for the next decodable message. `None` once the endpoint is gone.
    ///
    /// Frames that fail to decode are logged and skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let (from, frame) = self.rx.recv().await?;
            match GroupMessage::decode(&frame) {
                Ok(message) => return Some(Envelope { from, message }),
                Err(e) => warn!(local = %self.local, %from, %e, "dropping undecodable frame"),
            }
        }
    }

    /// The member this stream belongs to.
    pub fn local(&self) -> MemberId {
        self.local
    }
}
