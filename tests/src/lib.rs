//! Shared test harness for gcast integration tests.
//!
//! Provides [`IntegrationGroup`]: N members over one [`MemoryNetwork`], each
//! with its own upcall receiver, plus failure injection (link blocks,
//! partitions, crashes) and helpers for waiting on convergence.

use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use gcast_group::{ChannelApplication, GroupNode, Poll, UpcallReceiver};
use gcast_net::MemoryNetwork;
use gcast_types::{GroupConfig, MemberId, View, ViewId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Default deadline for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// First port of the loopback identities handed to members.
const BASE_PORT: u16 = 9100;

static LOGGING: Once = Once::new();

/// Route `tracing` output through the test writer, filtered by `RUST_LOG`.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Identity of member `i`.
pub fn member_id(i: usize) -> MemberId {
    MemberId::loopback(BASE_PORT + i as u16)
}

/// Payload bytes for `s`.
pub fn payload(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

// =========================================================================
// IntegrationGroup
// =========================================================================

/// A group of in-process members sharing one network.
pub struct IntegrationGroup {
    net: MemoryNetwork,
    config: GroupConfig,
    nodes: Vec<GroupNode>,
    upcalls: Vec<Mutex<UpcallReceiver>>,
}

impl IntegrationGroup {
    /// `n` members that all start in the same view, coordinated by member 0.
    pub async fn new(n: usize) -> Self {
        Self::with_config(n, GroupConfig::test_config()).await
    }

    /// Like [`IntegrationGroup::new`] with a custom config.
    pub async fn with_config(n: usize, config: GroupConfig) -> Self {
        init_logging();
        let ids: Vec<_> = (0..n).map(member_id).collect();
        let view = View::new(ViewId::new(ids[0], 1), ids.clone());

        let net = MemoryNetwork::new(config.inbound_capacity);
        let mut nodes = Vec::with_capacity(n);
        let mut upcalls = Vec::with_capacity(n);
        for id in ids {
            let (transport, inbound) = net.register(id).await;
            let (app, rx) = ChannelApplication::new();
            nodes.push(GroupNode::start_in_view(config.clone(), transport, inbound, Arc::new(app), view.clone()));
            upcalls.push(Mutex::new(rx));
        }
        info!(members = n, "static group started");

        Self {
            net,
            config,
            nodes,
            upcalls,
        }
    }

    /// `n` members that start alone and join member 0 one after another.
    pub async fn formed_by_joins(n: usize) -> Self {
        init_logging();
        let config = GroupConfig::test_config();
        let net = MemoryNetwork::new(config.inbound_capacity);
        let mut nodes: Vec<GroupNode> = Vec::with_capacity(n);
        let mut upcalls = Vec::with_capacity(n);
        for i in 0..n {
            let (transport, inbound) = net.register(member_id(i)).await;
            let (app, rx) = ChannelApplication::new();
            let node = GroupNode::start(config.clone(), transport, inbound, Arc::new(app));
            if i > 0 {
                node.join(member_id(0)).await.expect("join failed");
            }
            nodes.push(node);
            upcalls.push(Mutex::new(rx));
        }
        info!(members = n, "group formed by joins");

        Self {
            net,
            config,
            nodes,
            upcalls,
        }
    }

    /// Start one more member and join it through member 0. Returns its index.
    pub async fn add_member(&mut self) -> usize {
        let i = self.nodes.len();
        let (transport, inbound) = self.net.register(member_id(i)).await;
        let (app, rx) = ChannelApplication::new();
        let node = GroupNode::start(self.config.clone(), transport, inbound, Arc::new(app));
        node.join(self.id(0)).await.expect("join failed");
        self.nodes.push(node);
        self.upcalls.push(Mutex::new(rx));
        i
    }

    /// Member `i`.
    pub fn node(&self, i: usize) -> &GroupNode {
        &self.nodes[i]
    }

    /// Identity of member `i`.
    pub fn id(&self, i: usize) -> MemberId {
        self.nodes[i].local()
    }

    /// Identities of the members at `indices`.
    pub fn ids(&self, indices: impl IntoIterator<Item = usize>) -> Vec<MemberId> {
        indices.into_iter().map(|i| self.id(i)).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The shared network, for link-level failure injection.
    pub fn network(&self) -> &MemoryNetwork {
        &self.net
    }

    /// Crash member `i`: detach it from the network and stop its tasks.
    pub async fn kill(&self, i: usize) {
        self.net.crash(self.id(i)).await;
        self.nodes[i].shutdown().await;
        info!(member = %self.id(i), "member killed");
    }

    /// Tell every member at `survivors` that `gone` crashed.
    pub async fn report_crash(&self, survivors: &[usize], gone: MemberId) {
        for &i in survivors {
            self.nodes[i].on_member_crashed(gone).await;
        }
    }

    /// Partition the network into `sides` and let each side exclude the rest.
    pub async fn split(&self, sides: &[&[usize]]) {
        let ids: Vec<Vec<MemberId>> = sides.iter().map(|side| self.ids(side.iter().copied())).collect();
        let groups: Vec<&[MemberId]> = ids.iter().map(Vec::as_slice).collect();
        self.net.partition(&groups).await;

        for (s, side) in sides.iter().enumerate() {
            for (o, others) in ids.iter().enumerate() {
                if s == o {
                    continue;
                }
                for gone in others {
                    self.report_crash(side, *gone).await;
                }
            }
        }
        for (side, members) in sides.iter().zip(&ids) {
            assert!(
                self.wait_for_members(side, members).await,
                "side {members:?} did not settle"
            );
        }
    }

    /// Wait until every member at `indices` has a view of exactly `members`.
    pub async fn wait_for_members(&self, indices: &[usize], members: &[MemberId]) -> bool {
        let mut wanted = members.to_vec();
        wanted.sort();
        eventually(WAIT, || {
            indices.iter().all(|&i| {
                let mut got = self.nodes[i].view().members().to_vec();
                got.sort();
                got == wanted
            })
        })
        .await
    }

    /// Wait until every member at `indices` has installed view `id`.
    pub async fn wait_for_view(&self, indices: &[usize], id: ViewId) -> bool {
        eventually(WAIT, || indices.iter().all(|&i| self.nodes[i].view().id() == id)).await
    }

    /// Collect `count` deliveries at member `i`, skipping other upcalls.
    pub async fn deliveries(&self, i: usize, count: usize) -> Vec<(MemberId, Bytes)> {
        self.upcalls[i].lock().await.deliveries(count, WAIT).await
    }

    /// Collect `count` payloads from `sender` at member `i`, skipping every
    /// other upcall, within [`WAIT`].
    pub async fn payloads_from(&self, i: usize, sender: MemberId, count: usize) -> Vec<Bytes> {
        let mut rx = self.upcalls[i].lock().await;
        let deadline = Instant::now() + WAIT;
        let mut got = Vec::with_capacity(count);
        while got.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.poll(remaining).await {
                Poll::Delivered { sender: s, payload } if s == sender => got.push(payload),
                Poll::TimedOut | Poll::Closed => break,
                _ => {}
            }
        }
        got
    }

    /// Deliveries already queued at member `i`, without waiting.
    pub async fn drain_deliveries(&self, i: usize) -> Vec<(MemberId, Bytes)> {
        let mut rx = self.upcalls[i].lock().await;
        let mut delivered = Vec::new();
        while let Some(upcall) = rx.try_poll() {
            if let Poll::Delivered { sender, payload } = upcall {
                delivered.push((sender, payload));
            }
        }
        delivered
    }

    /// Every upcall at member `i` up to and including its next view change.
    pub async fn upcalls_until_view(&self, i: usize) -> Vec<Poll> {
        let mut rx = self.upcalls[i].lock().await;
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            let upcall = rx.poll(deadline.saturating_duration_since(Instant::now())).await;
            let done = matches!(upcall, Poll::ViewChanged(_) | Poll::TimedOut | Poll::Closed);
            seen.push(upcall);
            if done {
                return seen;
            }
        }
    }

    /// Stop every member still running.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Payloads from `sender` in the order they appear in `delivered`.
pub fn from_sender(delivered: &[(MemberId, Bytes)], sender: MemberId) -> Vec<Bytes> {
    delivered
        .iter()
        .filter(|(s, _)| *s == sender)
        .map(|(_, p)| p.clone())
        .collect()
}

/// Payloads delivered in `upcalls`, with their senders.
pub fn delivered_in(upcalls: &[Poll]) -> Vec<(MemberId, Bytes)> {
    upcalls
        .iter()
        .filter_map(|p| match p {
            Poll::Delivered { sender, payload } => Some((*sender, payload.clone())),
            _ => None,
        })
        .collect()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
