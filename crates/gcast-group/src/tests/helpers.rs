//! Shared test utilities for gcast-group tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gcast_net::MemoryNetwork;
use gcast_types::{GroupConfig, MemberId, View, ViewId};
use tokio::time::Instant;

use crate::app::{ChannelApplication, Poll, UpcallReceiver};
use crate::node::GroupNode;

pub const WAIT: Duration = Duration::from_secs(3);

/// A running member and the receiver of its upcalls.
pub struct TestMember {
    pub id: MemberId,
    pub node: GroupNode,
    pub upcalls: UpcallReceiver,
}

pub fn member(i: u16) -> MemberId {
    MemberId::loopback(7800 + i)
}

pub fn members(n: u16) -> Vec<MemberId> {
    (0..n).map(member).collect()
}

/// Start `n` members that all begin in the same view, coordinated by the first.
pub async fn static_group(net: &MemoryNetwork, n: u16, config: GroupConfig) -> Vec<TestMember> {
    let ids = members(n);
    let view = View::new(ViewId::new(ids[0], 1), ids.clone());
    let mut group = Vec::with_capacity(ids.len());
    for id in ids {
        let (transport, inbound) = net.register(id).await;
        let (app, upcalls) = ChannelApplication::new();
        let node = GroupNode::start_in_view(config.clone(), transport, inbound, Arc::new(app), view.clone());
        group.push(TestMember { id, node, upcalls });
    }
    group
}

/// Start one member alone in its own view.
pub async fn lone_member(net: &MemoryNetwork, i: u16, config: GroupConfig) -> TestMember {
    let id = member(i);
    let (transport, inbound) = net.register(id).await;
    let (app, upcalls) = ChannelApplication::new();
    let node = GroupNode::start(config, transport, inbound, Arc::new(app));
    TestMember { id, node, upcalls }
}

/// Shut every member down.
pub async fn shutdown(group: &[TestMember]) {
    for m in group {
        m.node.shutdown().await;
    }
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

/// Payloads delivered from `sender`, collected until `count` arrived or `WAIT` passed.
pub async fn payloads_from(upcalls: &mut UpcallReceiver, sender: MemberId, count: usize) -> Vec<Bytes> {
    let deadline = Instant::now() + WAIT;
    let mut got = Vec::with_capacity(count);
    while got.len() < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match upcalls.poll(remaining).await {
            Poll::Delivered { sender: s, payload } if s == sender => got.push(payload),
            Poll::TimedOut | Poll::Closed => break,
            _ => {}
        }
    }
    got
}

/// Every upcall up to and including the next view change.
pub async fn upcalls_until_view(upcalls: &mut UpcallReceiver) -> Vec<Poll> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let upcall = upcalls.poll(remaining).await;
        let done = matches!(upcall, Poll::ViewChanged(_) | Poll::TimedOut | Poll::Closed);
        seen.push(upcall);
        if done {
            return seen;
        }
    }
}

pub fn msg(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}
