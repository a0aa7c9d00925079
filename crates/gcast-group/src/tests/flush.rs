//! Flush barrier: blocking, draining, contention and failures.

use std::time::Duration;

use gcast_digest::{Digest, DigestEntry};
use gcast_net::MemoryNetwork;
use gcast_types::events::{FlushAborted, FlushCompleted, FlushStarted};
use gcast_types::{GroupConfig, SendPolicy};

use crate::app::Poll;
use crate::error::GroupError;
use crate::flush::{FlushOutcome, FlushState, reconcile};

use super::helpers::{WAIT, eventually, member, msg, payloads_from, shutdown, static_group};

// -----------------------------------------------------------------------
// Reconciliation
// -----------------------------------------------------------------------

#[test]
fn test_reconcile_prefers_own_report() {
    let (a, b) = (member(0), member(1));
    let mut from_a = Digest::new();
    from_a.add(a, 0, 5, 5);
    from_a.add(b, 0, 2, 2);
    let mut from_b = Digest::new();
    from_b.add(a, 0, 3, 4);
    from_b.add(b, 0, 4, 4);

    let digest = reconcile(&[(a, from_a), (b, from_b)], &[a, b]);
    assert_eq!(digest.get(&a), Some(DigestEntry::new(0, 5, 5)));
    assert_eq!(digest.get(&b), Some(DigestEntry::new(0, 4, 4)));
}

#[test]
fn test_reconcile_takes_highest_for_silent_sender() {
    let (a, b, c) = (member(0), member(1), member(2));
    let mut from_a = Digest::new();
    from_a.add(a, 0, 1, 1);
    from_a.add(c, 0, 2, 3);
    let mut from_b = Digest::new();
    from_b.add(b, 0, 1, 1);
    from_b.add(c, 1, 3, 3);

    let digest = reconcile(&[(a, from_a), (b, from_b)], &[a, b, c]);
    assert_eq!(digest.get(&c), Some(DigestEntry::new(1, 3, 3)));
    assert_eq!(digest.len(), 3);
}

#[test]
fn test_reconcile_keeps_crashed_sender() {
    let (a, b, c) = (member(0), member(1), member(2));
    // C crashed and never reports; B has all five of its messages, A none.
    let mut from_a = Digest::new();
    from_a.add(a, 0, 1, 1);
    from_a.add(c, 0, 0, 0);
    let mut from_b = Digest::new();
    from_b.add(b, 0, 1, 1);
    from_b.add(c, 0, 5, 5);

    let digest = reconcile(&[(a, from_a), (b, from_b)], &[a, b, c]);
    assert_eq!(digest.get(&c), Some(DigestEntry::new(0, 5, 5)));
}

#[test]
fn test_reconcile_drops_senders_outside_scope() {
    let (a, d) = (member(0), member(3));
    let mut from_a = Digest::new();
    from_a.add(a, 0, 1, 1);
    from_a.add(d, 0, 7, 7);

    let digest = reconcile(&[(a, from_a)], &[a]);
    assert!(digest.contains(&a));
    assert!(!digest.contains(&d));
}

// -----------------------------------------------------------------------
// Barrier
// -----------------------------------------------------------------------

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_flush_blocks_until_stopped() {
    let net = MemoryNetwork::default();
    let mut group = static_group(&net, 3, GroupConfig::test_config()).await;
    let mut started = group[0].node.events().subscribe::<FlushStarted>();
    let mut completed = group[0].node.events().subscribe::<FlushCompleted>();

    let outcome = group[0].node.start_flush(None).await.unwrap();
    let FlushOutcome::Flushed { digest, members, .. } = outcome else {
        panic!("expected a completed flush, got {outcome:?}");
    };
    let mut all: Vec<_> = group.iter().map(|m| m.id).collect();
    all.sort();
    assert_eq!(members, all);
    assert_eq!(digest.len(), 3);
    assert_eq!(group[0].node.last_flush_digest(), Some(digest));
    assert_eq!(group[0].node.flush_state(), FlushState::Flushed);

    assert!(started.try_recv().unwrap().total);
    assert_eq!(completed.try_recv().unwrap().members.len(), 3);

    for m in group.iter_mut() {
        assert!(m.node.is_blocked());
        assert_eq!(m.upcalls.poll(WAIT).await, Poll::Blocked);
    }

    assert_eq!(group[0].node.stop_flush(None).await, 1);
    assert_eq!(group[0].node.flush_state(), FlushState::Idle);
    for m in group.iter_mut() {
        assert_eq!(m.upcalls.poll(WAIT).await, Poll::Unblocked);
        assert!(!m.node.is_blocked());
    }

    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_flush_digest_covers_every_sent_message() {
    let net = MemoryNetwork::default();
    let group = static_group(&net, 3, GroupConfig::test_config()).await;
    let (a, c) = (group[0].id, group[2].id);

    for i in 0..3 {
        group[0].node.multicast(format!("a{i}")).await.unwrap();
    }
    for i in 0..2 {
        group[2].node.multicast(format!("c{i}")).await.unwrap();
    }

    let outcome = group[1].node.start_flush(None).await.unwrap();
    let digest = outcome.digest().unwrap();
    assert_eq!(digest.high_seqno_at(&a), Some(3));
    assert_eq!(digest.high_seqno_at(&c), Some(2));

    // Every member delivered up to the digest before confirming.
    for m in &group {
        assert_eq!(m.node.window_counters(&a).unwrap().high_delivered, 3);
        assert_eq!(m.node.window_counters(&c).unwrap().high_delivered, 2);
    }

    group[1].node.stop_flush(None).await;
    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_flush_drains_member_that_missed_messages() {
    let net = MemoryNetwork::default();
    let mut group = static_group(&net, 3, GroupConfig::test_config()).await;
    let (b, c) = (group[1].id, group[2].id);

    // B cannot hear C at all; A relays through retransmission.
    net.block(c, b).await;
    for i in 1..=3 {
        group[2].node.multicast(format!("c{i}")).await.unwrap();
    }

    let outcome = group[0].node.start_flush(None).await.unwrap();
    let FlushOutcome::Flushed { members, .. } = &outcome else {
        panic!("expected a completed flush, got {outcome:?}");
    };
    assert!(members.contains(&b));
    assert!(group[1].node.window_counters(&c).unwrap().high_delivered >= 3);

    let got = payloads_from(&mut group[1].upcalls, c, 3).await;
    assert_eq!(got, vec![msg("c1"), msg("c2"), msg("c3")]);

    group[0].node.stop_flush(None).await;
    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_send_waits_for_unblock() {
    let net = MemoryNetwork::default();
    let mut group = static_group(&net, 2, GroupConfig::test_config()).await;
    let b = group[1].id;

    assert!(group[0].node.start_flush(None).await.unwrap().succeeded());

    let node = group[1].node.clone();
    let held = tokio::spawn(async move { node.multicast("held").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!held.is_finished());

    group[0].node.stop_flush(None).await;
    assert_eq!(held.await.unwrap().unwrap(), 1);
    assert_eq!(payloads_from(&mut group[0].upcalls, b, 1).await, vec![msg("held")]);

    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_send_rejected_while_flushed() {
    let net = MemoryNetwork::default();
    let mut config = GroupConfig::test_config();
    config.send_policy = SendPolicy::Reject;
    let group = static_group(&net, 2, config).await;

    assert!(group[0].node.start_flush(None).await.unwrap().succeeded());
    let err = group[1].node.multicast("early").await.unwrap_err();
    assert!(matches!(err, GroupError::Flushed));

    group[0].node.stop_flush(None).await;
    let node = group[1].node.clone();
    assert!(eventually(WAIT, || !node.is_blocked()).await);
    assert_eq!(group[1].node.multicast("late").await.unwrap(), 1);

    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_empty_scope_is_an_error() {
    let net = MemoryNetwork::default();
    let group = static_group(&net, 2, GroupConfig::test_config()).await;

    let err = group[0].node.start_flush(Some(&[][..])).await.unwrap_err();
    assert!(matches!(err, GroupError::FlushFailed(_)));
    assert_eq!(group[0].node.stop_flush(None).await, 0);

    shutdown(&group).await;
}

// -----------------------------------------------------------------------
// Contention
// -----------------------------------------------------------------------

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_overlapping_flush_from_same_member() {
    let net = MemoryNetwork::default();
    let group = static_group(&net, 3, GroupConfig::test_config()).await;
    let (a, b, c) = (group[0].id, group[1].id, group[2].id);

    assert!(group[0].node.start_flush(Some([a, b].as_slice())).await.unwrap().digest().is_some());
    let second = group[0].node.start_flush(Some([b, c].as_slice())).await.unwrap();
    assert_eq!(second, FlushOutcome::AlreadyFlushing);
    assert!(!group[2].node.is_blocked());

    assert_eq!(group[0].node.stop_flush(Some([b].as_slice())).await, 1);
    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_disjoint_flushes_hold_together() {
    let net = MemoryNetwork::default();
    let group = static_group(&net, 4, GroupConfig::test_config()).await;
    let ids: Vec<_> = group.iter().map(|m| m.id).collect();

    let left = group[0].node.start_flush(Some(&ids[..2])).await.unwrap();
    let right = group[3].node.start_flush(Some(&ids[2..])).await.unwrap();
    assert!(left.digest().is_some());
    assert!(right.digest().is_some());
    assert!(group.iter().all(|m| m.node.is_blocked()));

    group[0].node.stop_flush(None).await;
    let node = group[1].node.clone();
    assert!(eventually(WAIT, || !node.is_blocked()).await);
    assert!(group[2].node.is_blocked());

    group[3].node.stop_flush(None).await;
    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(15000)]
async fn test_overlapping_flushes_serialize() {
    let net = MemoryNetwork::default();
    let group = static_group(&net, 3, GroupConfig::test_config()).await;
    let (a, b, c) = (group[0].id, group[1].id, group[2].id);

    let mut runs = Vec::new();
    for (node, scope) in [(group[0].node.clone(), vec![a, b]), (group[2].node.clone(), vec![b, c])] {
        runs.push(tokio::spawn(async move {
            let outcome = node.start_flush(Some(scope.as_slice())).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            node.stop_flush(None).await;
            outcome
        }));
    }
    for run in runs {
        let outcome = run.await.unwrap().unwrap();
        assert!(outcome.digest().is_some(), "flush did not complete: {outcome:?}");
    }

    let node = group[1].node.clone();
    assert!(eventually(WAIT, || !node.is_blocked()).await);
    shutdown(&group).await;
}

// -----------------------------------------------------------------------
// Failures
// -----------------------------------------------------------------------

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_flush_times_out_on_silent_member() {
    let net = MemoryNetwork::default();
    let mut group = static_group(&net, 3, GroupConfig::test_config()).await;
    let mut aborted = group[0].node.events().subscribe::<FlushAborted>();

    // C is gone but nobody was told.
    net.crash(group[2].id).await;

    let outcome = group[0]
        .node
        .start_flush_with_timeout(None, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(outcome, FlushOutcome::TimedOut);
    assert!(!outcome.succeeded());
    assert!(aborted.try_recv().is_some());
    assert_eq!(group[0].node.flush_state(), FlushState::Idle);
    assert!(group[0].node.last_flush_digest().is_none());

    // Whoever blocked was released again.
    for m in group[..2].iter_mut() {
        let node = m.node.clone();
        assert!(eventually(WAIT, || !node.is_blocked()).await);
        assert_eq!(m.upcalls.poll(WAIT).await, Poll::Blocked);
        assert_eq!(m.upcalls.poll(WAIT).await, Poll::Unblocked);
    }

    shutdown(&group).await;
}

#[tokio::test]
#[ntest::timeout(15000)]
async fn test_crash_during_flush_completes_without_member() {
    let net = MemoryNetwork::default();
    let group = static_group(&net, 3, GroupConfig::test_config()).await;
    let (a, b, c) = (group[0].id, group[1].id, group[2].id);

    net.crash(c).await;
    group[2].node.shutdown().await;

    let node = group[0].node.clone();
    let flush = tokio::spawn(async move { node.start_flush(None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    group[0].node.on_member_crashed(c).await;

    let outcome = flush.await.unwrap().unwrap();
    let FlushOutcome::Flushed { members, .. } = outcome else {
        panic!("expected a completed flush, got {outcome:?}");
    };
    assert_eq!(members, vec![a, b]);

    // The exclusion waits for the barrier, then goes through.
    group[0].node.stop_flush(None).await;
    let node = group[1].node.clone();
    assert!(eventually(WAIT, || node.view().members() == [a, b]).await);

    shutdown(&group[..2]).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_participant_released_when_initiator_crashes() {
    let net = MemoryNetwork::default();
    let mut group = static_group(&net, 3, GroupConfig::test_config()).await;
    let c = group[2].id;

    assert!(group[2].node.start_flush(None).await.unwrap().succeeded());
    assert!(group[1].node.is_blocked());

    net.crash(c).await;
    group[2].node.shutdown().await;
    group[1].node.on_member_crashed(c).await;

    assert!(!group[1].node.is_blocked());
    assert_eq!(group[1].upcalls.poll(WAIT).await, Poll::Blocked);
    assert_eq!(group[1].upcalls.poll(WAIT).await, Poll::Unblocked);

    shutdown(&group[..2]).await;
}
