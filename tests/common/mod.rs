// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared harness for cross-node scenarios: an in-memory cluster with one
//! node runtime per node and one replicated operation spanning them.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lockstep::collective::ReplicaContext;
use lockstep::config::LockstepConfig;
use lockstep::event::EventHandle;
use lockstep::identity::{NodeId, ReplicationId, ShardId, ShardMapping};
use lockstep::manager::{ShardLaunch, ShardManager, ShardSpawner};
use lockstep::runtime::NodeRuntime;
use lockstep::transport::memory::MemoryCluster;
use tokio::time::timeout;

/// Long enough for any in-memory exchange, short enough to fail fast.
pub const DEADLINE: Duration = Duration::from_secs(5);

/// Settling time for asserting that something has NOT happened yet.
pub const TICK: Duration = Duration::from_millis(50);

/// Spawner that hands every launched shard context back to the test.
pub struct CollectingSpawner {
    tx: flume::Sender<(ShardId, Arc<ReplicaContext>)>,
}

impl ShardSpawner for CollectingSpawner {
    fn spawn_shard(&self, ctx: Arc<ReplicaContext>, launch: ShardLaunch) {
        let _ = self.tx.send((launch.shard(), ctx));
    }
}

pub fn collecting_spawner() -> (
    Arc<CollectingSpawner>,
    flume::Receiver<(ShardId, Arc<ReplicaContext>)>,
) {
    let (tx, rx) = flume::unbounded();
    (Arc::new(CollectingSpawner { tx }), rx)
}

pub struct TestCluster {
    pub cluster: MemoryCluster,
    pub runtimes: Vec<Arc<NodeRuntime>>,
    pub replication: ReplicationId,
    /// One context per shard, indexed by shard id.
    pub contexts: Vec<Arc<ReplicaContext>>,
}

impl TestCluster {
    /// Builds a runtime for every node named in `placement` (plus node 0,
    /// which owns the operation), distributes one launch per shard, and
    /// waits until every shard has been spawned. `placement[shard]` is the
    /// node hosting that shard.
    pub async fn spin_up(replication: u64, placement: &[u32]) -> TestCluster {
        Self::spin_up_with(replication, placement, LockstepConfig::default()).await
    }

    pub async fn spin_up_with(
        replication: u64,
        placement: &[u32],
        config: LockstepConfig,
    ) -> TestCluster {
        lockstep::logging::init();
        let cluster = MemoryCluster::new();
        let (tx, rx) = flume::unbounded();

        let mut nodes: BTreeSet<u32> = placement.iter().copied().collect();
        nodes.insert(0);
        let mut runtimes = Vec::new();
        for node in nodes {
            let (link, receiver) = cluster.join(NodeId::new(node));
            let runtime =
                NodeRuntime::new(link, receiver, config.clone()).expect("runtime");
            runtime.set_shard_spawner(Arc::new(CollectingSpawner { tx: tx.clone() }));
            runtimes.push(runtime);
        }

        let replication = ReplicationId::new(replication);
        let mapping = Arc::new(ShardMapping::new(
            placement.iter().map(|node| NodeId::new(*node)).collect(),
        ));
        let manager = runtimes[0]
            .create_replication(replication, mapping)
            .expect("replication");
        let launches = (0..placement.len() as u32)
            .map(|shard| {
                ShardLaunch::builder()
                    .shard(ShardId::new(shard))
                    .build()
                    .expect("launch")
            })
            .collect();
        manager.distribute_shards(launches).expect("distribute");

        let mut collected: Vec<Option<Arc<ReplicaContext>>> = vec![None; placement.len()];
        for _ in 0..placement.len() {
            let (shard, ctx) = timeout(DEADLINE, rx.recv_async())
                .await
                .expect("shard spawned in time")
                .expect("spawner channel open");
            collected[shard.as_u32() as usize] = Some(ctx);
        }
        let contexts = collected
            .into_iter()
            .map(|ctx| ctx.expect("every shard spawned"))
            .collect();

        TestCluster {
            cluster,
            runtimes,
            replication,
            contexts,
        }
    }

    pub fn runtime(&self, node: u32) -> &Arc<NodeRuntime> {
        self.runtimes
            .iter()
            .find(|runtime| runtime.node() == NodeId::new(node))
            .expect("node exists")
    }

    /// Manager of the replicated operation on `node`.
    pub fn manager_on(&self, node: u32) -> Arc<ShardManager> {
        self.runtime(node)
            .manager(self.replication)
            .expect("manager exists")
    }

    /// Waits for `handle` on the event system of the node hosting `shard`.
    pub async fn wait_on(&self, shard: u32, handle: EventHandle) -> anyhow::Result<()> {
        timeout(
            DEADLINE,
            self.contexts[shard as usize].events().wait(handle),
        )
        .await
        .expect("event completed in time")
    }
}
