//! Chaos test: network partitions healed by merges.
//!
//! The group splits, each side keeps working in its own view, and after the
//! network heals the coordinators merge the sides back into one view.

use gcast_group::MergeOutcome;
use gcast_integration_tests::{IntegrationGroup, WAIT, from_sender, payload};
use gcast_types::MemberId;
use gcast_types::events::MergeCompleted;

/// Run the merge from `coordinators`, following a redirect to the leader.
async fn merge(g: &IntegrationGroup, coordinators: &[MemberId]) -> gcast_types::View {
    let mut asked = coordinators[0];
    for _ in 0..coordinators.len() {
        let i = (0..g.len()).find(|&i| g.id(i) == asked).unwrap();
        match g.node(i).on_coordinators_detected(coordinators).await.unwrap() {
            MergeOutcome::Merged(view) => return (*view).clone(),
            MergeOutcome::NotLeader(leader) => asked = leader,
            other => panic!("merge did not happen: {other:?}"),
        }
    }
    panic!("no coordinator accepted the merge");
}

/// Six members split 3/3. Messages sent on each side while apart reach the
/// other side after the merge, in sender order.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_partition_and_merge_keeps_both_sides_traffic() {
    let g = IntegrationGroup::new(6).await;
    let mut merged = g.node(0).events().subscribe::<MergeCompleted>();

    // Let stability reports from the full view circulate first.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    g.split(&[&[0, 1, 2], &[3, 4, 5]]).await;

    for n in 0..10 {
        g.node(1).multicast(format!("left {n}")).await.unwrap();
        g.node(4).multicast(format!("right {n}")).await.unwrap();
    }
    let left: Vec<_> = (0..10).map(|n| payload(&format!("left {n}"))).collect();
    let right: Vec<_> = (0..10).map(|n| payload(&format!("right {n}"))).collect();
    for r in 0..3 {
        assert_eq!(from_sender(&g.deliveries(r, 10).await, g.id(1)), left, "member {r}");
    }
    for r in 3..6 {
        assert_eq!(from_sender(&g.deliveries(r, 10).await, g.id(4)), right, "member {r}");
    }

    g.network().heal().await;
    let view = merge(&g, &[g.id(0), g.id(3)]).await;
    assert!(view.is_merge_view());
    assert_eq!(view.size(), 6);
    assert_eq!(view.subgroups().len(), 2);

    let event = tokio::time::timeout(WAIT, merged.recv()).await.unwrap().unwrap();
    assert_eq!(event.view_id, view.id());
    assert!(g.wait_for_view(&[0, 1, 2, 3, 4, 5], view.id()).await);

    // Each side catches up with the other side's partition traffic.
    for r in 0..3 {
        assert_eq!(from_sender(&g.deliveries(r, 10).await, g.id(4)), right, "member {r}");
    }
    for r in 3..6 {
        assert_eq!(from_sender(&g.deliveries(r, 10).await, g.id(1)), left, "member {r}");
    }

    // And the merged view carries new traffic to everyone.
    g.node(5).multicast("together").await.unwrap();
    for r in 0..6 {
        assert_eq!(from_sender(&g.deliveries(r, 1).await, g.id(5)), vec![payload("together")]);
    }

    g.shutdown().await;
}

/// Three-way split merged in one step.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_three_way_partition_merges_at_once() {
    let g = IntegrationGroup::new(6).await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    g.split(&[&[0, 1], &[2, 3], &[4, 5]]).await;

    g.network().heal().await;
    let view = merge(&g, &[g.id(0), g.id(2), g.id(4)]).await;
    assert_eq!(view.size(), 6);
    assert_eq!(view.subgroups().len(), 3);
    assert_eq!(view.coordinator(), Some(g.id(0)));
    assert!(g.wait_for_view(&[0, 1, 2, 3, 4, 5], view.id()).await);

    g.node(3).multicast("one group again").await.unwrap();
    for r in 0..6 {
        assert_eq!(
            from_sender(&g.deliveries(r, 1).await, g.id(3)),
            vec![payload("one group again")]
        );
    }

    g.shutdown().await;
}

/// Split and merge twice; view ids keep growing and traffic keeps flowing.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_repeated_partitions() {
    let g = IntegrationGroup::new(4).await;
    let mut last = g.node(0).view().id();

    for round in 0..2 {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        g.split(&[&[0, 1], &[2, 3]]).await;
        g.network().heal().await;

        let view = merge(&g, &[g.id(0), g.id(2)]).await;
        assert!(view.id() > last, "round {round}: view id went backwards");
        assert!(g.wait_for_view(&[0, 1, 2, 3], view.id()).await);
        last = view.id();

        g.node(2).multicast(format!("round {round}")).await.unwrap();
        for r in 0..4 {
            let got = g.deliveries(r, 1).await;
            assert_eq!(got, vec![(g.id(2), payload(&format!("round {round}")))], "member {r}");
        }
    }

    g.shutdown().await;
}
