//! Integration test: group formation.
//!
//! Members join one at a time through the coordinator, and every member ends
//! up in the same view with working multicast.

use gcast_integration_tests::{IntegrationGroup, WAIT, from_sender, payload};
use gcast_types::events::ViewInstalled;

/// Five members join member 0 in turn; views grow by one each time.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_5_member_group_formation() {
    let g = IntegrationGroup::formed_by_joins(5).await;

    let final_id = g.node(0).view().id();
    assert_eq!(final_id.counter, 5, "one view per join");
    assert_eq!(final_id.creator, g.id(0));
    assert!(g.wait_for_view(&[0, 1, 2, 3, 4], final_id).await);

    // Every member lists the group in join order.
    let expected = g.ids(0..5);
    for i in 0..5 {
        assert_eq!(g.node(i).view().members(), expected.as_slice(), "member {i}");
    }

    g.shutdown().await;
}

/// Traffic from the newest member reaches the oldest and vice versa.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_traffic_after_formation() {
    let g = IntegrationGroup::formed_by_joins(4).await;
    let id = g.node(0).view().id();
    assert!(g.wait_for_view(&[0, 1, 2, 3], id).await);

    g.node(0).multicast("from the first").await.unwrap();
    g.node(3).multicast("from the last").await.unwrap();

    for i in 0..4 {
        let got = g.deliveries(i, 2).await;
        assert_eq!(from_sender(&got, g.id(0)), vec![payload("from the first")]);
        assert_eq!(from_sender(&got, g.id(3)), vec![payload("from the last")]);
    }

    g.shutdown().await;
}

/// Messages sent before a join are not replayed to the joiner.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_joiner_starts_at_current_position() {
    let mut g = IntegrationGroup::formed_by_joins(2).await;
    for i in 0..5 {
        g.node(0).multicast(format!("early-{i}")).await.unwrap();
    }
    assert_eq!(g.deliveries(1, 5).await.len(), 5);

    let mut installed = g.node(0).events().subscribe::<ViewInstalled>();
    let late = g.add_member().await;
    let event = tokio::time::timeout(WAIT, installed.recv()).await.unwrap().unwrap();
    assert_eq!(event.view.size(), 3);

    // The joiner's window for member 0 begins where member 0 stood.
    let counters = g.node(late).window_counters(&g.id(0)).unwrap();
    assert_eq!(counters.high_delivered, 5);

    g.node(0).multicast("later").await.unwrap();
    let got = g.deliveries(late, 1).await;
    assert_eq!(got, vec![(g.id(0), payload("later"))]);

    g.shutdown().await;
}
