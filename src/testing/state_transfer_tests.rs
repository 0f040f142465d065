//! State Transfer Scenario Tests
//!
//! Multi-node tests of segment movement over the in-memory network.
//!
//! # Test Cases
//!
//! | Test ID   | Scenario                          | Verification                         |
//! |-----------|-----------------------------------|--------------------------------------|
//! | TC_ST_01  | Node joins                        | Joiner receives its segments         |
//! | TC_ST_02  | Node killed                       | Surviving owners restore redundancy  |
//! | TC_ST_03  | Source unreachable from joiner    | Segments fetched from next owner     |
//! | TC_ST_04  | Chunk from superseded topology    | Chunk dropped, nothing written       |
//! | TC_ST_05  | Destination unreachable           | Outbound transfer abandoned          |
//! | TC_ST_06  | Cluster listeners                 | Joiner installs them before state    |
//! | TC_ST_07  | Owners leave with data loss off   | Rebalance fails, segments reported   |
//! | TC_ST_08  | Owner ahead of the writer         | Write retried, every owner updated   |

#[cfg(test)]
mod tests {
    use crate::config::{GridConfig, StateTransferConfig};
    use crate::error::Error;
    use crate::statetransfer::{SegmentState, StateChunk, TransferMode};
    use crate::testing::TestCluster;
    use crate::transport::{Command, Envelope, Reply};
    use crate::types::{CacheEntry, NodeId, SegmentSet};
    use bytes::Bytes;
    use std::time::Duration;
    use test_log::test;
    use tracing::info;

    const KEYS: usize = 100;

    fn template() -> GridConfig {
        GridConfig::default()
            .with_num_segments(32)
            .with_num_owners(2)
            .with_state_transfer(
                StateTransferConfig::default()
                    .with_chunk_size(4)
                    .with_transfer_timeout(Duration::from_secs(5))
                    .with_topology_wait_timeout(Duration::from_secs(2))
                    .with_rebalance_timeout(Duration::from_secs(10)),
            )
    }

    fn key(i: usize) -> Bytes {
        Bytes::from(format!("key-{i:03}"))
    }

    fn value(i: usize) -> Bytes {
        Bytes::from(format!("value-{i}"))
    }

    async fn load(cluster: &TestCluster, writer: NodeId) {
        let node = cluster.node(writer).unwrap();
        for i in 0..KEYS {
            node.put(key(i), value(i)).await.unwrap();
        }
    }

    /// Every key reads back from every live node, and every owner holds its
    /// segments' keys locally.
    async fn assert_all_readable(cluster: &TestCluster) {
        for node in cluster.nodes() {
            for i in 0..KEYS {
                let entry = node.get(&key(i)).await.unwrap();
                assert_eq!(
                    entry.map(|e| e.value),
                    Some(value(i)),
                    "node {} lost {:?}",
                    node.node_id(),
                    key(i)
                );
            }
        }

        for node in cluster.nodes() {
            let topology = node.topology().unwrap();
            for i in 0..KEYS {
                let segment = node.segment_of(&key(i));
                if topology.read_ch().is_owner(node.node_id(), segment) {
                    assert!(
                        node.container().get(segment, &key(i)).is_some(),
                        "owner {} has no local copy of {:?}",
                        node.node_id(),
                        key(i)
                    );
                }
            }
        }
    }

    // =========================================================================
    // TC_ST_01: Join
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_01_join_moves_segments_to_new_node() {
        let mut cluster = TestCluster::start(3, template()).await.unwrap();
        load(&cluster, 1).await;

        let topology = cluster.join(4).await.unwrap();
        assert_eq!(topology.members.len(), 4);
        assert!(!topology.is_rebalancing());
        assert!(cluster.await_stable(Duration::from_secs(5)).await);

        let joiner = cluster.node(4).unwrap();
        let gained = topology.read_ch().segments_owned_by(4);
        assert!(!gained.is_empty());
        for segment in &gained {
            assert_eq!(joiner.consumer().segment_state(*segment), SegmentState::Owned);
        }
        assert!(joiner.metrics().chunks_applied.get() > 0);
        assert_eq!(joiner.metrics().chunks_discarded_stale.get(), 0);

        // Segments a node stopped owning are dropped from its container.
        for node in cluster.nodes() {
            let owned = topology.read_ch().segments_owned_by(node.node_id());
            assert!(node.container().segments().is_subset(&owned));
        }

        assert_all_readable(&cluster).await;

        let coordinator = cluster.coordinator().unwrap();
        let operations = coordinator.coordinator().operations();
        let last = operations.last().unwrap();
        assert_eq!(last.topology_id, topology.id);
        assert!(last.error.is_none());
        info!("TC_ST_01 PASSED: {} segments moved to node 4", gained.len());
    }

    // =========================================================================
    // TC_ST_02: Leave
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_02_kill_restores_owner_count() {
        let mut cluster = TestCluster::start(4, template()).await.unwrap();
        load(&cluster, 2).await;

        let topology = cluster.kill(4).await.unwrap();
        assert_eq!(topology.members, vec![1, 2, 3]);
        assert!(cluster.await_stable(Duration::from_secs(5)).await);

        for segment in 0..topology.num_segments() {
            let owners = topology.read_ch().owners_of(segment);
            assert_eq!(owners.len(), 2, "segment {segment} owners {owners:?}");
            assert!(!owners.contains(&4));
        }
        assert_all_readable(&cluster).await;
        info!("TC_ST_02 PASSED: all keys survived losing node 4");
    }

    // =========================================================================
    // TC_ST_03: Source failover
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_03_unreachable_source_falls_back_to_next_owner() {
        let mut cluster = TestCluster::start(3, template()).await.unwrap();
        load(&cluster, 1).await;

        cluster.network.cut(4, 2);
        cluster.join(4).await.unwrap();

        let joiner = cluster.node(4).unwrap();
        assert!(joiner.metrics().transfer_retries.get() > 0);
        assert!(joiner.consumer().unavailable_segments().is_empty());

        cluster.network.heal();
        assert!(cluster.await_stable(Duration::from_secs(5)).await);
        assert_all_readable(&cluster).await;
        info!(
            "TC_ST_03 PASSED: {} segment requests re-routed",
            joiner.metrics().transfer_retries.get()
        );
    }

    // =========================================================================
    // TC_ST_04: Stale chunks
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_04_chunk_from_old_topology_is_discarded() {
        let mut cluster = TestCluster::start(3, template()).await.unwrap();
        cluster.join(4).await.unwrap();

        let node = cluster.node(4).unwrap();
        let current = node.tracker().topology_id();
        assert!(current > 1);

        let stale_key = Bytes::from("stale");
        let segment = node.segment_of(&stale_key);
        let chunk = StateChunk::new(segment, 0, vec![CacheEntry::new(stale_key.clone(), "old")], true);

        let before = node.metrics().chunks_discarded_stale.get();
        node.consumer().apply_state(2, 1, vec![chunk.clone()]).await.unwrap();
        assert_eq!(node.metrics().chunks_discarded_stale.get(), before + 1);
        assert!(node.container().get(segment, &stale_key).is_none());

        // A current topology id without a live transfer record is dropped too.
        node.consumer().apply_state(2, current, vec![chunk]).await.unwrap();
        assert_eq!(node.metrics().chunks_discarded_stale.get(), before + 2);
        assert!(node.container().get(segment, &stale_key).is_none());
    }

    // =========================================================================
    // TC_ST_05: Abandoned outbound transfer
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_05_unreachable_destination_abandons_transfer() {
        let cluster = TestCluster::start(2, template().with_num_owners(1)).await.unwrap();
        load(&cluster, 1).await;

        let node = cluster.node(1).unwrap();
        let held = node.container().segments();
        let segment = *held.iter().next().unwrap();
        let not_held: SegmentSet = (0..32).filter(|s| !held.contains(s)).take(1).collect();
        let mut requested = not_held.clone();
        requested.insert(segment);

        let missing = node
            .provider()
            .start_outbound_transfer(99, node.tracker().topology_id(), requested, TransferMode::ConflictResolution)
            .await
            .unwrap();
        assert_eq!(missing, not_held);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while node.provider().active_transfers() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.provider().active_transfers(), 0);
        assert_eq!(node.metrics().transfers_abandoned.get(), 1);
    }

    // =========================================================================
    // TC_ST_06: Cluster listeners
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_06_joiner_installs_cluster_listeners() {
        let mut cluster = TestCluster::start(2, template()).await.unwrap();
        let listener = cluster.node(1).unwrap().add_cluster_listener("audit");

        cluster.join(3).await.unwrap();

        let installed = cluster.node(3).unwrap().cluster_listeners();
        assert_eq!(installed, vec![listener]);
    }

    // =========================================================================
    // TC_ST_07: Unavailable segments
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_07_losing_every_owner_fails_rebalance() {
        let template = template().with_num_owners(1);
        let mut cluster = TestCluster::start(2, template).await.unwrap();
        load(&cluster, 1).await;
        let lost = cluster.node(1).unwrap().topology().unwrap().read_ch().segments_owned_by(2);

        let err = cluster.kill(2).await.unwrap_err();
        match err {
            Error::SegmentUnavailable(segments) => assert_eq!(segments, lost),
            other => panic!("expected SegmentUnavailable, got {other:?}"),
        }

        // The pending assignment is dropped; lost segments stay ownerless.
        let node = cluster.node(1).unwrap();
        let topology = node.topology().unwrap();
        assert!(!topology.is_rebalancing());
        for segment in &lost {
            assert!(topology.read_ch().owners_of(*segment).is_empty());
        }

        let (i, k) = (0..KEYS)
            .map(|i| (i, key(i)))
            .find(|(_, k)| lost.contains(&node.segment_of(k)))
            .unwrap();
        assert!(matches!(node.get(&k).await, Err(Error::SegmentUnavailable(_))), "key {i}");
        let survivor = (0..KEYS).map(key).find(|k| !lost.contains(&node.segment_of(k))).unwrap();
        assert!(node.get(&survivor).await.unwrap().is_some());
    }

    // =========================================================================
    // TC_ST_08: Writer behind an owner
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn tc_st_08_write_rejected_as_stale_is_retried_on_newer_topology() {
        let cluster = TestCluster::start(2, template()).await.unwrap();
        let writer = cluster.node(1).unwrap();
        let owner = cluster.node(2).unwrap();

        let topology = writer.topology().unwrap();
        let newer = topology.without_pending();
        owner.tracker().install(newer.clone()).unwrap();
        assert_eq!(writer.tracker().topology_id(), topology.id);

        let k = Bytes::from("k");
        let segment = writer.segment_of(&k);
        assert_eq!(topology.write_ch().owners_of(segment).len(), 2);

        let entry = writer.put(k.clone(), "v").await.unwrap();
        assert_eq!(writer.tracker().topology_id(), newer.id);
        for node in [writer, owner] {
            let stored = node.container().get(segment, &k).unwrap();
            assert_eq!(stored.value, Bytes::from("v"));
            assert_eq!(stored.version(), entry.version());
        }

        // Both owners move ahead again; the removal reaches both of them.
        let newest = newer.without_pending();
        owner.tracker().install(newest.clone()).unwrap();
        writer.remove(&k).await.unwrap();
        assert_eq!(writer.tracker().topology_id(), newest.id);
        assert!(writer.container().get(segment, &k).is_none());
        assert!(owner.container().get(segment, &k).is_none());

        // A late broadcast of a topology already pulled is ignored.
        let reply = writer
            .receive(Envelope::new(
                writer.config().cache_name.clone(),
                2,
                newest.id,
                Command::TopologyUpdate { topology: newest },
            ))
            .await;
        assert_eq!(reply, Reply::Ack);
        info!("TC_ST_08 PASSED: stale writes re-sent on the owner's topology");
    }
}
