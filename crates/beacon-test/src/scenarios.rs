//! End-to-end scenarios over in-process clusters

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use beacon_core::{ChangeNotification, InstanceInfo, InstanceStatus, Interest, Origin};
use beacon_registry::RegistryReader;
use beacon_replication::{ReplicationHelloReply, ReplicationMessage};
use beacon_runtime::NodeConfig;

use crate::cluster::{registration_addr, replication_addr, wait_until, within, ClusterHarness};
use crate::flapping::{FlapSchedule, FlappingClient};

fn template(self_preservation_percent: Option<u8>) -> NodeConfig {
    NodeConfig {
        eviction_timeout: Duration::from_secs(5),
        self_preservation_percent,
        reconnect_delay: Duration::from_millis(200),
        ack_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..NodeConfig::default()
    }
}

fn info(id: &str, status: InstanceStatus) -> InstanceInfo {
    InstanceInfo::builder(id)
        .app("web")
        .vip_address("web.vip")
        .status(status)
        .build()
        .unwrap()
}

fn origin_at(cluster: &ClusterHarness, node: usize, id: &str) -> Option<Origin> {
    cluster
        .node(node)
        .registry()
        .get_sourced(id)
        .map(|(_, source)| source.origin())
}

const SETTLE: Duration = Duration::from_secs(3);

#[tokio::test(start_paused = true)]
async fn test_two_peer_replication() {
    let cluster = ClusterHarness::start(2, &template(None)).unwrap();

    cluster.node(0).register(info("i-1", InstanceStatus::Starting)).unwrap();
    cluster.node(1).register(info("i-2", InstanceStatus::Up)).unwrap();
    assert!(wait_until(SETTLE, || cluster.converged_at(2)).await);

    assert_eq!(origin_at(&cluster, 0, "i-1"), Some(Origin::Local));
    assert_eq!(origin_at(&cluster, 1, "i-1"), Some(Origin::Replicated));
    assert_eq!(origin_at(&cluster, 0, "i-2"), Some(Origin::Replicated));

    cluster.node(0).register(info("i-1", InstanceStatus::Up)).unwrap();
    assert!(
        wait_until(SETTLE, || {
            cluster
                .node(1)
                .get_instance("web", "i-1")
                .is_some_and(|i| i.status() == InstanceStatus::Up)
        })
        .await
    );

    cluster.node(0).unregister("i-1").unwrap();
    assert!(wait_until(SETTLE, || cluster.converged_at(1)).await);
    assert!(cluster.node(1).get_instance("web", "i-1").is_none());
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_vanished_client_evicted_everywhere() {
    let cluster = ClusterHarness::start(2, &template(None)).unwrap();
    let client = cluster.connect_client(0, Duration::from_secs(1)).await.unwrap();
    client.register(info("i-1", InstanceStatus::Up)).await.unwrap();
    assert!(wait_until(SETTLE, || cluster.converged_at(1)).await);

    client.disconnect();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(cluster.converged_at(1));

    assert!(wait_until(Duration::from_secs(4), || cluster.converged_at(0)).await);
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_partition_evicts_replicated_copies() {
    let cluster = ClusterHarness::start(2, &template(None)).unwrap();
    for i in 1..=3 {
        cluster.node(0).register(info(&format!("i-{i}"), InstanceStatus::Up)).unwrap();
    }
    assert!(wait_until(SETTLE, || cluster.node(1).size() == 3).await);

    assert!(cluster.partition(1) > 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cluster.node(1).size(), 3);
    assert_eq!(cluster.node(1).pending_evictions(), 3);

    assert!(wait_until(Duration::from_secs(5), || cluster.node(1).size() == 0).await);
    assert_eq!(cluster.node(0).size(), 3);

    cluster.heal(1);
    assert!(wait_until(SETTLE, || cluster.node(1).size() == 3).await);
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_before_expiry_keeps_copies() {
    let cluster = ClusterHarness::start(2, &template(None)).unwrap();
    for i in 1..=3 {
        cluster.node(0).register(info(&format!("i-{i}"), InstanceStatus::Up)).unwrap();
    }
    assert!(wait_until(SETTLE, || cluster.node(1).size() == 3).await);

    assert!(cluster.sever(1) > 0);
    for _ in 0..80 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.node(1).size(), 3);
    }
    assert_eq!(cluster.node(1).pending_evictions(), 0);
    assert_eq!(origin_at(&cluster, 1, "i-1"), Some(Origin::Replicated));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_self_preservation_halts_mass_eviction() {
    let cluster = ClusterHarness::start(2, &template(Some(20))).unwrap();
    for i in 1..=5 {
        cluster.node(0).register(info(&format!("i-{i}"), InstanceStatus::Up)).unwrap();
    }
    assert!(wait_until(SETTLE, || cluster.node(1).size() == 5).await);

    cluster.partition(1);
    assert!(wait_until(Duration::from_secs(8), || cluster.node(1).is_in_self_preservation()).await);

    // 20% of 5 tolerates one missing entry, checked before each removal
    assert_eq!(cluster.node(1).size(), 3);
    assert_eq!(cluster.node(1).pending_evictions(), 3);
    assert!(!cluster.node(0).is_in_self_preservation());
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_subscription_handoff() {
    let cluster = ClusterHarness::start(2, &template(None)).unwrap();
    for i in 1..=3 {
        cluster.node(0).register(info(&format!("i-{i}"), InstanceStatus::Up)).unwrap();
    }
    assert!(wait_until(SETTLE, || cluster.node(1).size() == 3).await);

    let mut stream = cluster.node(1).for_interest(&Interest::for_vip("web.vip"));
    cluster.node(0).register(info("i-4", InstanceStatus::Up)).unwrap();

    let mut adds: HashMap<String, usize> = HashMap::new();
    while adds.len() < 4 {
        let notification = within(SETTLE, stream.next()).await.flatten().unwrap();
        if let ChangeNotification::Add { data, .. } = notification {
            *adds.entry(data.id().to_string()).or_default() += 1;
        }
    }
    assert!(adds.values().all(|count| *count == 1));

    while let Some(extra) = within(Duration::from_secs(1), stream.next()).await.flatten() {
        assert!(!extra.is_data(), "unexpected {extra:?}");
    }
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_replication_to_self_is_abandoned() {
    let cluster = ClusterHarness::start_isolated(1, &template(None)).unwrap();
    let node = cluster.node(0);
    node.register(info("i-1", InstanceStatus::Up)).unwrap();

    node.add_peer(replication_addr(0));
    assert!(wait_until(SETTLE, || node.peers().is_empty()).await);

    assert_eq!(node.size(), 1);
    let holders = node.holders();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].copies, 1);
    assert_eq!(origin_at(&cluster, 0, "i-1"), Some(Origin::Local));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_copy_forces_reconnect() {
    let cluster = ClusterHarness::start_isolated(1, &template(None)).unwrap();
    cluster.node(0).register(info("i-1", InstanceStatus::Up)).unwrap();

    // acknowledges the handshake, never a copy
    let stalled: SocketAddr = "127.0.0.1:7100".parse().unwrap();
    let mut listener = cluster.networks().replication.bind(stalled).unwrap();
    let (hellos_tx, mut hellos) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(conn) = listener.accept().await {
            let hellos_tx = hellos_tx.clone();
            tokio::spawn(async move {
                while let Some(incoming) = conn.recv().await {
                    if let ReplicationMessage::Hello(hello) = incoming.body {
                        let _ = conn.submit(ReplicationMessage::HelloReply(ReplicationHelloReply {
                            source_id: "stalled".into(),
                            seed_request: false,
                        }));
                        if let Some(correlation) = incoming.correlation {
                            let _ = conn.acknowledge(correlation);
                        }
                        let _ = hellos_tx.send(hello.sender_id);
                    }
                }
            });
        }
    });

    cluster.node(0).add_peer(stalled);
    for _ in 0..2 {
        let sender = within(Duration::from_secs(10), hellos.recv()).await.flatten();
        assert_eq!(sender.as_deref(), Some("node-0"));
    }
    assert_eq!(cluster.node(0).peers(), vec![stalled]);
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_flapping_client_never_disappears() {
    let cluster = ClusterHarness::start(2, &template(None)).unwrap();
    let flapping = FlappingClient::start(
        cluster.networks().registration.clone(),
        registration_addr(0),
        info("i-1", InstanceStatus::Up),
        FlapSchedule::default(),
        7,
    );
    assert!(wait_until(SETTLE, || cluster.converged_at(1)).await);

    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cluster.converged_at(1));
    }
    assert!(flapping.cycles() >= 10);
    assert_eq!(flapping.failures(), 0);

    flapping.stop();
    assert!(wait_until(Duration::from_secs(8), || cluster.converged_at(0)).await);
    cluster.shutdown();
}
