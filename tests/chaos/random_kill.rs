//! Chaos test: random member kills under load.
//!
//! Background senders multicast continuously while members are killed one at
//! a time. Survivors must agree on the view after each kill and must have
//! delivered identical per-sender prefixes from every sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use gcast_group::GroupError;
use gcast_integration_tests::{IntegrationGroup, WAIT, eventually};
use gcast_types::MemberId;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::time;

/// Seven members, three kills, continuous traffic from every member.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(90000)]
async fn test_random_kills_keep_survivors_consistent() {
    let g = Arc::new(IntegrationGroup::new(7).await);
    let stop = Arc::new(AtomicBool::new(false));

    // --- Background senders (one per member) ---
    let mut handles = Vec::new();
    for i in 0..g.len() {
        let node = g.node(i).clone();
        let stop = stop.clone();
        handles.push(tokio::spawn(async move {
            let mut n = 0u32;
            while !stop.load(Ordering::Relaxed) {
                match node.multicast(format!("{i}:{n}")).await {
                    Ok(_) => n += 1,
                    // The member was killed.
                    Err(GroupError::Shutdown) => break,
                    Err(_) => time::sleep(Duration::from_millis(20)).await,
                }
                let pause = rand::rng().random_range(2..10);
                time::sleep(Duration::from_millis(pause)).await;
            }
        }));
    }

    // --- Chaos: kill three random non-coordinator members ---
    let mut alive: Vec<usize> = (0..g.len()).collect();
    let mut victims: Vec<usize> = (1..g.len()).collect();
    victims.shuffle(&mut rand::rng());
    for &victim in victims.iter().take(3) {
        time::sleep(Duration::from_millis(300)).await;
        alive.retain(|&i| i != victim);
        g.kill(victim).await;
        g.report_crash(&alive, g.id(victim)).await;

        let members = g.ids(alive.iter().copied());
        assert!(
            g.wait_for_members(&alive, &members).await,
            "survivors did not exclude member {victim}"
        );
    }

    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.await.unwrap();
    }

    // --- Verification: survivors agree on what every sender said ---
    let id = g.node(alive[0]).view().id();
    assert!(g.wait_for_view(&alive, id).await);

    let node = g.node(alive[0]).clone();
    let senders: Vec<MemberId> = g.ids(0..g.len());
    let mut stable = false;
    for _ in 0..3 {
        // Quiesce, then compare what each survivor delivered so far.
        time::sleep(Duration::from_millis(300)).await;
        let reference: HashMap<MemberId, u64> = senders
            .iter()
            .filter_map(|s| node.window_counters(s).map(|c| (*s, c.high_delivered)))
            .collect();
        stable = eventually(WAIT, || {
            alive.iter().all(|&r| {
                reference
                    .iter()
                    .all(|(s, hd)| g.node(r).window_counters(s).is_some_and(|c| c.high_delivered == *hd))
            })
        })
        .await;
        if stable {
            break;
        }
    }
    assert!(stable, "survivors delivered different prefixes");

    // Delivered payloads are well-formed per-sender sequences.
    for &r in &alive {
        let mut next: HashMap<MemberId, u32> = HashMap::new();
        let delivered = g.drain_deliveries(r).await;
        assert!(!delivered.is_empty());
        for (sender, body) in delivered {
            let (i, n) = parse(&body);
            assert_eq!(sender, g.id(i));
            let expected = next.entry(sender).or_insert(0);
            assert_eq!(n, *expected, "member {r} skipped a message from {sender}");
            *expected += 1;
        }
    }

    g.shutdown().await;
}

fn parse(body: &Bytes) -> (usize, u32) {
    let text = std::str::from_utf8(body).unwrap();
    let (i, n) = text.split_once(':').unwrap();
    (i.parse().unwrap(), n.parse().unwrap())
}
