//! Integration test: virtual synchrony across view changes.
//!
//! Members that survive into a new view must have delivered the same set of
//! messages from the old view before the new view is announced.

use std::collections::BTreeSet;
use std::time::Duration;

use gcast_group::{FlushOutcome, Poll};
use gcast_integration_tests::{IntegrationGroup, WAIT, delivered_in, from_sender, payload};
use gcast_types::events::FlushCompleted;

/// C's messages reached A and B but not D before C crashed. The flush that
/// excludes C makes D deliver them before the new view.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_partially_received_messages_reach_all_survivors() {
    let g = IntegrationGroup::new(4).await;
    let (c, d) = (g.id(2), g.id(3));

    g.network().block(c, d).await;
    for n in 0..5 {
        g.node(2).multicast(format!("last words {n}")).await.unwrap();
    }
    for r in [0, 1] {
        assert_eq!(from_sender(&g.deliveries(r, 5).await, c).len(), 5);
    }

    g.kill(2).await;
    g.report_crash(&[0, 1, 3], c).await;

    let seen = g.upcalls_until_view(3).await;
    let expected: Vec<_> = (0..5).map(|n| payload(&format!("last words {n}"))).collect();
    assert_eq!(from_sender(&delivered_in(&seen), c), expected);
    assert!(matches!(seen.last(), Some(Poll::ViewChanged(v)) if !v.contains(&c) && v.contains(&d)));

    let survivors = g.ids([0, 1, 3]);
    assert!(g.wait_for_members(&[0, 1, 3], &survivors).await);

    g.shutdown().await;
}

/// Every old member delivers the same messages before a join installs the
/// next view, even with traffic in flight while the join runs.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_same_delivery_set_before_view_change() {
    let mut g = IntegrationGroup::new(3).await;

    let senders: Vec<_> = (0..3).map(|i| g.node(i).clone()).collect();
    let traffic = tokio::spawn(async move {
        for n in 0..20 {
            for (i, node) in senders.iter().enumerate() {
                // Sends during the flush block until it is released.
                node.multicast(format!("{i}/{n}")).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    g.add_member().await;

    let mut sets = Vec::new();
    for r in 0..3 {
        let seen = g.upcalls_until_view(r).await;
        assert!(matches!(seen.last(), Some(Poll::ViewChanged(v)) if v.size() == 4), "member {r}");
        let set: BTreeSet<_> = delivered_in(&seen).into_iter().collect();
        sets.push(set);
    }
    assert!(!sets[0].is_empty());
    assert_eq!(sets[0], sets[1]);
    assert_eq!(sets[1], sets[2]);

    traffic.await.unwrap();
    g.shutdown().await;
}

/// An application flush is a barrier: nothing is delivered while it holds,
/// and the recorded digest matches what every member delivered.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_application_flush_is_a_barrier() {
    let g = IntegrationGroup::new(3).await;
    let mut completed = g.node(0).events().subscribe::<FlushCompleted>();

    for i in 0..3 {
        g.node(i).multicast(format!("pre {i}")).await.unwrap();
    }

    let outcome = g.node(0).start_flush(None).await.unwrap();
    let FlushOutcome::Flushed { digest, members, .. } = outcome else {
        panic!("expected a completed flush, got {outcome:?}");
    };
    assert_eq!(members.len(), 3);
    let event = tokio::time::timeout(WAIT, completed.recv()).await.unwrap().unwrap();
    assert_eq!(event.members.len(), 3);
    assert_eq!(g.node(0).last_flush_digest(), Some(digest.clone()));

    // Everyone delivered exactly what the digest records.
    for s in 0..3 {
        assert_eq!(digest.get(&g.id(s)).map(|e| e.high), Some(1));
    }
    for r in 0..3 {
        assert!(g.node(r).is_blocked(), "member {r} is not blocked");
        for s in 0..3 {
            let counters = g.node(r).window_counters(&g.id(s)).unwrap();
            assert_eq!(counters.high_delivered, 1, "member {r}, sender {s}");
        }
    }

    // A send issued under the barrier completes only after it is released.
    let node = g.node(1).clone();
    let pending = tokio::spawn(async move { node.multicast("post").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    assert_eq!(g.node(0).stop_flush(None).await, 1);
    assert_eq!(pending.await.unwrap().unwrap(), 2);
    let got = g.deliveries(2, 4).await;
    assert_eq!(from_sender(&got, g.id(1)), vec![payload("pre 1"), payload("post")]);

    g.shutdown().await;
}

/// A member crashing in the middle of a flush is dropped from it and then
/// excluded from the view.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_crash_during_flush() {
    let g = IntegrationGroup::new(4).await;
    let d = g.id(3);

    // D is deaf, so the flush waits on it.
    for i in 0..3 {
        g.network().block(g.id(i), d).await;
    }
    let node = g.node(0).clone();
    let flush = tokio::spawn(async move { node.start_flush(None).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    g.kill(3).await;
    g.report_crash(&[0, 1, 2], d).await;

    let outcome = flush.await.unwrap().unwrap();
    let FlushOutcome::Flushed { members, .. } = outcome else {
        panic!("expected a completed flush, got {outcome:?}");
    };
    assert_eq!(members, g.ids(0..3));

    g.node(0).stop_flush(None).await;
    let survivors = g.ids(0..3);
    assert!(g.wait_for_members(&[0, 1, 2], &survivors).await);
    for r in 0..3 {
        assert!(!g.node(r).is_blocked());
    }

    g.shutdown().await;
}
