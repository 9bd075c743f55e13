//! Integration tests for the discovery mesh.
//!
//! These tests run real nodes on loopback sockets and verify the
//! end-to-end properties: multi-node convergence, deregistration with
//! tombstones, deterministic conflict resolution, partition healing via
//! reconciliation, and peer failure detection.
use shoal::{ConflictStrategy, DiscoveryConfig, DiscoveryNode, PeerState, ServiceId, ServiceStatus};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Config tuned for fast test cadence on loopback.
fn fast_config() -> DiscoveryConfig {
    let mut config = DiscoveryConfig::new()
        .bind_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .gossip_interval(Duration::from_millis(100))
        .anti_entropy_interval(Duration::from_millis(500));
    config.reconciliation_timeout = Duration::from_secs(2);
    config.network_timeout = Duration::from_millis(500);
    config.max_retries = 1;
    config
}

/// Poll a condition until it holds or the deadline passes.
async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    condition()
}

async fn started(config: DiscoveryConfig) -> DiscoveryNode {
    let node = DiscoveryNode::new(config);
    node.start().await.unwrap();
    node
}

fn addr_of(node: &DiscoveryNode) -> SocketAddr {
    node.local_addr().expect("node not started")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_convergence_and_deregistration() {
    let a = started(fast_config()).await;
    let b = started(fast_config().bootstrap([addr_of(&a)])).await;
    let c = started(fast_config().bootstrap([addr_of(&a)])).await;

    // Let the bootstrap reconciliations introduce everyone.
    assert!(
        wait_for(Duration::from_secs(5), || {
            !b.peers().is_empty() && !c.peers().is_empty()
        })
        .await,
        "bootstrap join did not complete"
    );

    // A advertises one file-sharing endpoint.
    a.register_service("file-sharing", "svc1", "127.0.0.1", 9000, HashMap::new())
        .unwrap();

    let converged = wait_for(Duration::from_secs(10), || {
        let on_b = b.discover_services("file-sharing");
        let on_c = c.discover_services("file-sharing");
        on_b.len() == 1
            && on_c.len() == 1
            && on_b[0].service_id == ServiceId::new("svc1")
            && on_c[0].service_id == ServiceId::new("svc1")
    })
    .await;
    assert!(converged, "svc1 did not reach all nodes");

    // Deregistration propagates as a version-2 tombstone.
    assert!(a.deregister_service(&ServiceId::new("svc1")).unwrap());

    let emptied = wait_for(Duration::from_secs(10), || {
        b.discover_services("file-sharing").is_empty()
            && c.discover_services("file-sharing").is_empty()
    })
    .await;
    assert!(emptied, "deregistration did not reach all nodes");

    for node in [&b, &c] {
        let entry = node
            .service_entry(&ServiceId::new("svc1"))
            .expect("tombstone should be retained");
        assert_eq!(entry.status, ServiceStatus::Tombstoned);
        assert_eq!(entry.version, 2);
    }

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    c.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timestamp_strategy_converges_on_the_later_writer() {
    // Start mutually unaware so each node registers its own replica of
    // the same service id, then connect them and watch the strategy pick
    // one winner everywhere.
    let config = fast_config().conflict_resolution(ConflictStrategy::Timestamp);
    let a = started(config.clone()).await;
    let b = started(config).await;

    a.register_service("file-sharing", "dup", "10.0.0.1", 9000, HashMap::new())
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    b.register_service("file-sharing", "dup", "10.0.0.2", 9001, HashMap::new())
        .unwrap();

    b.join(addr_of(&a)).await.unwrap();

    let winner = b.node_id();
    let converged = wait_for(Duration::from_secs(10), || {
        let on_a = a.service_entry(&ServiceId::new("dup"));
        let on_b = b.service_entry(&ServiceId::new("dup"));
        match (on_a, on_b) {
            (Some(x), Some(y)) => {
                x.origin_node_id == winner && y.origin_node_id == winner && x.host == "10.0.0.2"
            }
            _ => false,
        }
    })
    .await;
    assert!(converged, "nodes did not agree on the later registration");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_registrations_heal_on_join() {
    // No bootstrap: A and B start mutually unaware, as if partitioned.
    let mut isolated = fast_config();
    isolated.anti_entropy_interval = Duration::from_secs(60);
    let a = started(isolated.clone()).await;
    let b = started(isolated).await;

    a.register_service("file-sharing", "svc_a", "10.0.0.1", 9000, HashMap::new())
        .unwrap();
    b.register_service("file-sharing", "svc_b", "10.0.0.2", 9000, HashMap::new())
        .unwrap();

    sleep(Duration::from_millis(400)).await;
    assert!(b.discover_services("file-sharing").len() == 1, "still partitioned");

    // Heal: one reconciliation exchange carries both directions.
    b.join(addr_of(&a)).await.unwrap();

    let healed = wait_for(Duration::from_secs(5), || {
        a.discover_services("file-sharing").len() == 2
            && b.discover_services("file-sharing").len() == 2
    })
    .await;
    assert!(healed, "reconciliation did not merge both registries");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_peer_is_failed_and_its_services_suspected() {
    let mut config = fast_config();
    config.suspect_threshold = 2;
    config.failed_threshold = 3;
    // Keep the breaker out of the way so every round exercises the
    // network path and feeds the detector.
    config.failure_threshold = 100;

    let a = started(config.clone()).await;
    let b = started(config.bootstrap([addr_of(&a)])).await;
    let b_id = b.node_id();

    b.register_service("file-sharing", "svc_b", "10.0.0.2", 9000, HashMap::new())
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            a.is_service_healthy(&ServiceId::new("svc_b"))
        })
        .await,
        "svc_b never reached A"
    );

    // Kill B. A's gossip keeps dialing it (opportunistic repair keeps the
    // rounds non-empty) and the failure detector accrues.
    b.stop().await.unwrap();

    let detected = wait_for(Duration::from_secs(15), || {
        a.peers()
            .iter()
            .any(|peer| peer.node_id == b_id && peer.state == PeerState::Failed)
    })
    .await;
    assert!(detected, "A never marked B as FAILED");

    // Everything B originated is demoted immediately.
    let entry = a.service_entry(&ServiceId::new("svc_b")).unwrap();
    assert_eq!(entry.status, ServiceStatus::Suspect);
    assert!(!a.is_service_healthy(&ServiceId::new("svc_b")));

    a.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscription_sees_remote_registrations() {
    let a = started(fast_config()).await;
    let b = started(fast_config().bootstrap([addr_of(&a)])).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _handle = b
        .subscribe("file-sharing", move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

    a.register_service("file-sharing", "svc1", "10.0.0.1", 9000, HashMap::new())
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no subscription event arrived")
        .expect("dispatcher closed");
    assert_eq!(event.service.service_id, ServiceId::new("svc1"));
    assert_eq!(event.transition, shoal::ServiceTransition::Up);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metadata_predicate_discovery_across_nodes() {
    let a = started(fast_config()).await;
    let b = started(fast_config().bootstrap([addr_of(&a)])).await;

    let mut flac = HashMap::new();
    flac.insert("filename".to_string(), "album.flac".to_string());
    flac.insert("size".to_string(), "52428800".to_string());
    a.register_service("file-sharing", "share-flac", "10.0.0.1", 9000, flac)
        .unwrap();
    a.register_service("file-sharing", "share-other", "10.0.0.1", 9001, HashMap::new())
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            b.discover_services("file-sharing").len() == 2
        })
        .await,
        "entries did not replicate"
    );

    let hits = b.discover_services_where("file-sharing", |meta| {
        meta.get("filename").map(String::as_str) == Some("album.flac")
    });
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].service_id, ServiceId::new("share-flac"));
    assert_eq!(hits[0].metadata.get("size").map(String::as_str), Some("52428800"));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
