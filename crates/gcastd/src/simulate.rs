//! In-process group simulation.
//!
//! Forms a group over a [`MemoryNetwork`], multicasts round-robin from every
//! member and optionally splits the group in two, lets each side carry on,
//! then heals the network and merges the sides back together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use gcast_group::{Application, GroupNode, MergeOutcome};
use gcast_net::MemoryNetwork;
use gcast_types::{GroupConfig, MemberId, View, ViewId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// First port of the loopback identities handed to simulated members.
const BASE_PORT: u16 = 7800;

/// How long the simulation waits for the group to converge at each step.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Parameters of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub members: u16,
    pub messages: usize,
    pub partition: bool,
}

/// Per-member outcome.
#[derive(Debug, Clone)]
pub struct MemberReport {
    pub member: MemberId,
    pub delivered: u64,
    pub blocks: u64,
    pub view_changes: u64,
    pub view: ViewId,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub members: Vec<MemberReport>,
    /// Deliveries every member should have seen.
    pub expected: u64,
    /// Whether a partition was healed by a merge view.
    pub merged: bool,
    /// Frames the network dropped (blocked links included).
    pub dropped: u64,
}

impl SimulationReport {
    /// Every member delivered every message and ended in the same view.
    pub fn converged(&self) -> bool {
        let Some(first) = self.members.first() else {
            return false;
        };
        self.members
            .iter()
            .all(|m| m.delivered == self.expected && m.view == first.view)
    }
}

/// Application that only counts upcalls.
#[derive(Default)]
struct CountingApp {
    delivered: AtomicU64,
    blocks: AtomicU64,
    view_changes: AtomicU64,
}

impl Application for CountingApp {
    fn deliver(&self, sender: MemberId, payload: Bytes) {
        debug!(%sender, len = payload.len(), "delivered");
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    fn view_changed(&self, view: &View) {
        debug!(%view, "view changed");
        self.view_changes.fetch_add(1, Ordering::Relaxed);
    }
}

struct SimMember {
    node: GroupNode,
    app: Arc<CountingApp>,
}

/// Run a simulation to completion and shut every member down.
pub async fn run(config: GroupConfig, options: &SimulationOptions) -> Result<SimulationReport> {
    if options.members == 0 {
        bail!("a simulation needs at least one member");
    }

    let net = MemoryNetwork::new(config.inbound_capacity);
    let mut group = Vec::with_capacity(options.members as usize);
    for i in 0..options.members {
        let id = MemberId::loopback(BASE_PORT + i);
        let (transport, inbound) = net.register(id).await;
        let app = Arc::new(CountingApp::default());
        let node = GroupNode::start(config.clone(), transport, inbound, app.clone());
        group.push(SimMember { node, app });
    }

    let result = drive(&net, &group, options).await;

    for m in &group {
        m.node.shutdown().await;
    }

    let (expected, merged) = result?;
    let members = group
        .iter()
        .map(|m| MemberReport {
            member: m.node.local(),
            delivered: m.app.delivered.load(Ordering::Relaxed),
            blocks: m.app.blocks.load(Ordering::Relaxed),
            view_changes: m.app.view_changes.load(Ordering::Relaxed),
            view: m.node.view().id(),
        })
        .collect();

    Ok(SimulationReport {
        members,
        expected,
        merged,
        dropped: net.dropped(),
    })
}

async fn drive(net: &MemoryNetwork, group: &[SimMember], options: &SimulationOptions) -> Result<(u64, bool)> {
    let coordinator = group[0].node.local();
    for m in &group[1..] {
        let view = m
            .node
            .join(coordinator)
            .await
            .with_context(|| format!("{} failed to join", m.node.local()))?;
        info!(member = %m.node.local(), view = %view, "joined");
    }
    let everyone: Vec<_> = group.iter().collect();
    settle_views(&everyone).await?;

    for i in 0..options.messages {
        let sender = &group[i % group.len()].node;
        sender
            .multicast(format!("message-{i}"))
            .await
            .with_context(|| format!("multicast {i} from {} failed", sender.local()))?;
    }
    let mut expected = options.messages as u64;
    settle_deliveries(group, expected).await;

    if !options.partition {
        return Ok((expected, false));
    }
    if group.len() < 2 {
        warn!("a single member cannot be partitioned");
        return Ok((expected, false));
    }

    let (left, right) = group.split_at(group.len() / 2);
    let left_ids: Vec<_> = left.iter().map(|m| m.node.local()).collect();
    let right_ids: Vec<_> = right.iter().map(|m| m.node.local()).collect();
    net.partition(&[left_ids.as_slice(), right_ids.as_slice()]).await;
    info!(left = left_ids.len(), right = right_ids.len(), "network partitioned");

    // The views still span the split, so the right side only gets this
    // one through the merge.
    left[0].node.multicast("across the split").await?;
    exclude(left, &right_ids).await;
    exclude(right, &left_ids).await;
    settle_views(&left.iter().collect::<Vec<_>>()).await?;
    settle_views(&right.iter().collect::<Vec<_>>()).await?;

    left[0].node.multicast("from the left side").await?;
    right[0].node.multicast("from the right side").await?;
    expected += 3;

    net.heal().await;
    info!("network healed");

    let coordinators = [left[0].node.local(), right[0].node.local()];
    let merged = merge(group, &coordinators).await?;
    info!(view = %merged, "merge view installed");
    settle_views(&everyone).await?;
    settle_deliveries(group, expected).await;

    Ok((expected, true))
}

/// Report every member of `gone` as crashed to every member of `side`.
async fn exclude(side: &[SimMember], gone: &[MemberId]) {
    for m in side {
        for member in gone {
            m.node.on_member_crashed(*member).await;
        }
    }
}

/// Ask the coordinators to merge, following a redirect to the merge leader.
async fn merge(group: &[SimMember], coordinators: &[MemberId]) -> Result<Arc<View>> {
    let mut asked = coordinators[0];
    for _ in 0..coordinators.len() {
        let node = group
            .iter()
            .find(|m| m.node.local() == asked)
            .map(|m| &m.node)
            .context("merge leader is not part of the simulation")?;
        match node.on_coordinators_detected(coordinators).await? {
            MergeOutcome::Merged(view) => return Ok(view),
            MergeOutcome::NotLeader(leader) => asked = leader,
            other => bail!("merge did not happen: {other:?}"),
        }
    }
    bail!("no coordinator accepted the merge")
}

/// Wait until every member of `side` has installed the same view of exactly `side`.
async fn settle_views(side: &[&SimMember]) -> Result<()> {
    let expected: Vec<_> = side.iter().map(|m| m.node.local()).collect();
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let views: Vec<_> = side.iter().map(|m| m.node.view()).collect();
        let agreed = views.iter().all(|v| v.id() == views[0].id());
        let mut members = views[0].members().to_vec();
        members.sort();
        let mut wanted = expected.clone();
        wanted.sort();
        if agreed && members == wanted {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("views did not converge on {} members", expected.len());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until every member delivered `expected` messages. Stragglers are logged.
async fn settle_deliveries(group: &[SimMember], expected: u64) {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let behind: Vec<_> = group
            .iter()
            .filter(|m| m.app.delivered.load(Ordering::Relaxed) < expected)
            .map(|m| m.node.local())
            .collect();
        if behind.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            warn!(expected, behind = ?behind, "members still missing deliveries");
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ntest::timeout(30000)]
    async fn test_simulation_delivers_everything() {
        let options = SimulationOptions {
            members: 3,
            messages: 12,
            partition: false,
        };
        let report = run(GroupConfig::test_config(), &options).await.unwrap();

        assert_eq!(report.members.len(), 3);
        assert_eq!(report.expected, 12);
        assert!(!report.merged);
        assert!(report.converged(), "{report:?}");
        assert!(report.members.iter().all(|m| m.view.counter == 3));
    }

    #[tokio::test]
    #[ntest::timeout(30000)]
    async fn test_simulation_with_partition_merges() {
        let options = SimulationOptions {
            members: 4,
            messages: 8,
            partition: true,
        };
        let report = run(GroupConfig::test_config(), &options).await.unwrap();

        assert!(report.merged);
        assert_eq!(report.expected, 11);
        assert!(report.converged(), "{report:?}");
        // The multicast sent across the split lost both frames to the right side.
        assert!(report.dropped >= 2, "{report:?}");
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_single_member_partition_is_skipped() {
        let options = SimulationOptions {
            members: 1,
            messages: 3,
            partition: true,
        };
        let report = run(GroupConfig::test_config(), &options).await.unwrap();
        assert!(!report.merged);
        assert_eq!(report.members[0].delivered, 3);
    }

    #[tokio::test]
    async fn test_empty_simulation_is_rejected() {
        let options = SimulationOptions {
            members: 0,
            messages: 1,
            partition: false,
        };
        assert!(run(GroupConfig::test_config(), &options).await.is_err());
    }
}
