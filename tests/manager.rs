// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Manager-level scenarios: milestone accounting, named barriers, request
//! routing, and startup ordering across real runtimes.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use lockstep::collective::{RequestHandler, ShardRequest};
use lockstep::config::LockstepConfig;
use lockstep::event::barrier::BarrierReduction;
use lockstep::identity::{
    DistributedId, DomainPoint, NodeId, ReplicationId, ShardId, ShardMapping, ShardingId,
};
use lockstep::manager::sharding::{CYCLIC_SHARDING_ID, ShardingFunctor};
use lockstep::manager::{
    BarrierKind, MilestoneKind, OwnerObserver, ReplicationError, ReplicationState, ShardLaunch,
};
use lockstep::runtime::NodeRuntime;
use lockstep::transport::memory::MemoryCluster;
use lockstep::transport::{Envelope, Message};
use tokio::time::{sleep, timeout};

use common::{DEADLINE, TICK, TestCluster, collecting_spawner};

struct ChannelObserver {
    tx: flume::Sender<(MilestoneKind, Option<Bytes>)>,
}

impl OwnerObserver for ChannelObserver {
    fn milestone_reached(&self, kind: MilestoneKind, result: Option<Bytes>) {
        let _ = self.tx.send((kind, result));
    }
}

fn channel_observer() -> (
    Arc<ChannelObserver>,
    flume::Receiver<(MilestoneKind, Option<Bytes>)>,
) {
    let (tx, rx) = flume::unbounded();
    (Arc::new(ChannelObserver { tx }), rx)
}

struct RecordingHandler {
    tx: flume::Sender<(ShardRequest, Bytes)>,
}

impl RequestHandler for RecordingHandler {
    fn handle_request(&self, request: ShardRequest, payload: Bytes) {
        let _ = self.tx.send((request, payload));
    }
}

#[tokio::test]
async fn milestone_waits_for_local_and_remote_shards() {
    let cluster = TestCluster::spin_up(20, &[0, 0, 1, 2]).await;
    let owner = cluster.manager_on(0);
    let (observer, fired) = channel_observer();
    owner.set_owner_observer(observer).expect("observer");

    owner.handle_post_mapped(ShardId::new(0)).expect("report");
    owner.handle_post_mapped(ShardId::new(1)).expect("report");
    cluster
        .manager_on(1)
        .handle_post_mapped(ShardId::new(2))
        .expect("report");
    sleep(TICK).await;
    assert!(fired.try_recv().is_err(), "one shard is still mapping");

    cluster
        .manager_on(2)
        .handle_post_mapped(ShardId::new(3))
        .expect("report");
    let (kind, result) = timeout(DEADLINE, fired.recv_async())
        .await
        .expect("milestone in time")
        .expect("observer alive");
    assert_eq!(kind, MilestoneKind::Mapped);
    assert_eq!(result, None);
    assert!(fired.try_recv().is_err(), "milestones fire exactly once");

    let mapped = owner.milestone_event(MilestoneKind::Mapped).expect("event");
    timeout(DEADLINE, cluster.runtime(0).events().wait(mapped))
        .await
        .expect("event in time")
        .expect("no poison");
    assert_eq!(owner.state(), ReplicationState::Executing);

    let err = cluster
        .manager_on(1)
        .milestone_event(MilestoneKind::Mapped)
        .expect_err("milestone events are owner state");
    assert!(format!("{err:#}").contains("owner"));
}

#[tokio::test]
async fn single_node_milestone_counts_every_local_shard() {
    let cluster = TestCluster::spin_up(21, &[0, 0, 0]).await;
    let owner = cluster.manager_on(0);
    let (observer, fired) = channel_observer();
    owner.set_owner_observer(observer).expect("observer");

    owner.handle_post_execution(ShardId::new(0)).expect("report");
    owner.handle_post_execution(ShardId::new(2)).expect("report");
    sleep(TICK).await;
    assert!(fired.try_recv().is_err(), "one task body still running");

    owner.handle_post_execution(ShardId::new(1)).expect("report");
    let (kind, result) = timeout(DEADLINE, fired.recv_async())
        .await
        .expect("milestone in time")
        .expect("observer alive");
    assert_eq!(kind, MilestoneKind::Executed);
    assert_eq!(result, None);
    assert_eq!(owner.state(), ReplicationState::Completing);
}

#[tokio::test]
async fn late_observer_replays_fired_milestones() {
    let cluster = TestCluster::spin_up(22, &[0, 1]).await;
    let owner = cluster.manager_on(0);

    owner.handle_post_mapped(ShardId::new(0)).expect("report");
    cluster
        .manager_on(1)
        .handle_post_mapped(ShardId::new(1))
        .expect("report");
    let mapped = owner.milestone_event(MilestoneKind::Mapped).expect("event");
    timeout(DEADLINE, cluster.runtime(0).events().wait(mapped))
        .await
        .expect("event in time")
        .expect("no poison");

    let (observer, fired) = channel_observer();
    owner.set_owner_observer(observer).expect("observer");
    let (kind, result) = timeout(DEADLINE, fired.recv_async())
        .await
        .expect("replay in time")
        .expect("observer alive");
    assert_eq!(kind, MilestoneKind::Mapped);
    assert_eq!(result, None);
}

#[tokio::test]
async fn completion_holds_for_effects_and_carries_the_result() {
    let cluster = TestCluster::spin_up(23, &[0, 1]).await;
    let owner = cluster.manager_on(0);
    let (observer, fired) = channel_observer();
    owner.set_owner_observer(observer).expect("observer");
    let complete = owner
        .milestone_event(MilestoneKind::Complete)
        .expect("event");

    let result = Bytes::from_static(b"all-reduce value");
    let effect0 = cluster.runtime(0).events().new_event().expect("effect");
    let effect1 = cluster.runtime(1).events().new_event().expect("effect");
    owner
        .trigger_task_complete(ShardId::new(0), Some(result.clone()), effect0.handle())
        .expect("report");
    cluster
        .manager_on(1)
        .trigger_task_complete(ShardId::new(1), Some(result.clone()), effect1.handle())
        .expect("report");

    sleep(TICK).await;
    assert!(
        !cluster.runtime(0).events().has_triggered(complete),
        "effects are still outstanding"
    );

    effect0.trigger().expect("trigger");
    sleep(TICK).await;
    assert!(fired.try_recv().is_err(), "the remote effect is pending");

    effect1.trigger().expect("trigger");
    let (kind, reported) = timeout(DEADLINE, fired.recv_async())
        .await
        .expect("milestone in time")
        .expect("observer alive");
    assert_eq!(kind, MilestoneKind::Complete);
    assert_eq!(reported, Some(result));
    timeout(DEADLINE, cluster.runtime(0).events().wait(complete))
        .await
        .expect("event in time")
        .expect("no poison");
}

struct SumReduction;

impl BarrierReduction for SumReduction {
    fn identity(&self) -> Bytes {
        encode_sum(0)
    }

    fn fold(&self, accumulator: Bytes, arrival: Bytes) -> anyhow::Result<Bytes> {
        let acc: u64 = rmp_serde::from_slice(&accumulator)?;
        let add: u64 = rmp_serde::from_slice(&arrival)?;
        Ok(encode_sum(acc + add))
    }
}

fn encode_sum(value: u64) -> Bytes {
    Bytes::from(rmp_serde::to_vec(&value).expect("encode"))
}

#[tokio::test]
async fn barrier_reduction_folds_arrivals_across_nodes() {
    let cluster = TestCluster::spin_up(24, &[0, 1]).await;
    let owner = cluster.manager_on(0);
    let remote = cluster.manager_on(1);

    owner
        .attach_barrier_reduction(BarrierKind::FutureMap, Arc::new(SumReduction))
        .expect("attach");
    let err = remote
        .attach_barrier_reduction(BarrierKind::FutureMap, Arc::new(SumReduction))
        .expect_err("reductions live with the barrier state");
    assert!(format!("{err:#}").contains("owner"));

    let owner_done = owner.barrier_wait(BarrierKind::FutureMap, 0).expect("wait");
    let remote_done = remote
        .barrier_wait(BarrierKind::FutureMap, 0)
        .expect("wait");
    owner
        .barrier_arrive(BarrierKind::FutureMap, 0, 1, Some(encode_sum(2)))
        .expect("arrive");
    remote
        .barrier_arrive(BarrierKind::FutureMap, 0, 1, Some(encode_sum(40)))
        .expect("arrive");

    timeout(DEADLINE, cluster.runtime(0).events().wait(owner_done))
        .await
        .expect("owner side in time")
        .expect("no poison");
    timeout(DEADLINE, cluster.runtime(1).events().wait(remote_done))
        .await
        .expect("remote side in time")
        .expect("no poison");
    assert_eq!(
        owner.barrier_reduced(BarrierKind::FutureMap, 0),
        Some(encode_sum(42))
    );
    assert_eq!(
        remote.barrier_reduced(BarrierKind::FutureMap, 0),
        Some(encode_sum(42))
    );
}

#[tokio::test]
async fn reductions_only_attach_to_untouched_barriers() {
    let cluster = TestCluster::spin_up(29, &[0, 1]).await;
    let owner = cluster.manager_on(0);

    let _done = owner.barrier_wait(BarrierKind::Creation, 0).expect("wait");
    let err = owner
        .attach_barrier_reduction(BarrierKind::Creation, Arc::new(SumReduction))
        .expect_err("a handed-out wait event pins the barrier");
    assert!(format!("{err:#}").contains("already in use"));

    owner
        .barrier_arrive(BarrierKind::Deletion, 0, 1, None)
        .expect("arrive");
    let err = owner
        .attach_barrier_reduction(BarrierKind::Deletion, Arc::new(SumReduction))
        .expect_err("an arrival pins the barrier");
    assert!(format!("{err:#}").contains("already in use"));

    // Untouched barriers still take one.
    owner
        .attach_barrier_reduction(BarrierKind::ExternalResource, Arc::new(SumReduction))
        .expect("attach");
}

#[tokio::test]
async fn early_requests_buffer_until_the_handler_arrives() {
    lockstep::logging::init();
    let cluster = MemoryCluster::new();
    let (link0, recv0) = cluster.join(NodeId::new(0));
    let runtime0 = NodeRuntime::new(link0, recv0, LockstepConfig::default()).expect("runtime");
    let (link1, recv1) = cluster.join(NodeId::new(1));
    let runtime1 = NodeRuntime::new(link1, recv1, LockstepConfig::default()).expect("runtime");
    let (spawner, spawned) = collecting_spawner();
    runtime1.set_shard_spawner(spawner);

    // A peer's request races ahead of the startup message.
    let replication = ReplicationId::new(25);
    let header = Envelope::new(
        replication,
        Message::FutureMapRequest {
            target: ShardId::new(0),
        },
    )
    .encode();
    runtime0
        .link()
        .send(NodeId::new(1), header, Bytes::from_static(b"early map probe"))
        .expect("send");

    let mapping = Arc::new(ShardMapping::new(vec![NodeId::new(1)]));
    let manager = runtime0
        .create_replication(replication, mapping)
        .expect("create");
    let launch = ShardLaunch::builder()
        .shard(ShardId::new(0))
        .build()
        .expect("launch");
    manager.distribute_shards(vec![launch]).expect("distribute");

    let (shard, ctx) = timeout(DEADLINE, spawned.recv_async())
        .await
        .expect("spawned in time")
        .expect("spawner alive");
    assert_eq!(shard, ShardId::new(0));

    // The handler shows up last and still sees the buffered request.
    let (tx, requests) = flume::unbounded();
    ctx.set_request_handler(Arc::new(RecordingHandler { tx }));
    let (request, payload) = timeout(DEADLINE, requests.recv_async())
        .await
        .expect("request in time")
        .expect("handler alive");
    assert!(matches!(
        request,
        ShardRequest::FutureMap { source } if source == NodeId::new(0)
    ));
    assert_eq!(payload.as_ref(), b"early map probe");
}

struct LastShardFunctor;

impl ShardingFunctor for LastShardFunctor {
    fn shard(&self, _point: &DomainPoint, total_shards: u32) -> ShardId {
        ShardId::new(total_shards - 1)
    }
}

#[tokio::test]
async fn sharding_functions_resolve_through_the_registry() {
    let cluster = TestCluster::spin_up(26, &[0, 1]).await;
    let owner = cluster.manager_on(0);
    cluster
        .runtime(0)
        .register_functor(ShardingId::new(77), Arc::new(LastShardFunctor))
        .expect("register");

    let function = owner.sharding_function(ShardingId::new(77)).expect("lookup");
    assert_eq!(function.id(), ShardingId::new(77));
    assert_eq!(function.shard(&DomainPoint::from(0i64)), ShardId::new(1));

    let cyclic = owner.sharding_function(CYCLIC_SHARDING_ID).expect("builtin");
    assert_eq!(cyclic.shard(&DomainPoint::from(3i64)), ShardId::new(1));

    let err = owner
        .sharding_function(ShardingId::new(404))
        .expect_err("nobody registered 404");
    assert!(matches!(
        err.downcast_ref::<ReplicationError>(),
        Some(ReplicationError::UnknownFunctor(id)) if *id == ShardingId::new(404)
    ));
}

#[tokio::test]
async fn top_view_requests_route_to_a_hosting_node() {
    // The owner hosts no shards at all; instance views must hop.
    let cluster = TestCluster::spin_up(27, &[1, 1]).await;
    let mut inboxes = Vec::new();
    for ctx in &cluster.contexts {
        let (tx, rx) = flume::unbounded();
        ctx.set_request_handler(Arc::new(RecordingHandler { tx }));
        inboxes.push(rx);
    }

    let instance = DistributedId::new(5);
    cluster
        .manager_on(0)
        .create_instance_top_view(instance, ShardId::new(0), Bytes::from_static(b"layout"))
        .expect("route");

    // 5 % 2 picks the second hosted shard.
    let (request, payload) = timeout(DEADLINE, inboxes[1].recv_async())
        .await
        .expect("request in time")
        .expect("handler alive");
    assert!(matches!(
        request,
        ShardRequest::TopView { instance: got, requestor }
            if got == instance && requestor == ShardId::new(0)
    ));
    assert_eq!(payload.as_ref(), b"layout");
    sleep(TICK).await;
    assert!(inboxes[0].try_recv().is_err(), "exactly one shard answers");
}

#[tokio::test]
async fn only_the_owner_distributes_shards() {
    let cluster = TestCluster::spin_up(28, &[0, 1]).await;
    let err = cluster
        .manager_on(1)
        .distribute_shards(Vec::new())
        .expect_err("distribution is an owner act");
    assert!(format!("{err:#}").contains("only the owner"));
    assert_eq!(cluster.manager_on(0).state(), ReplicationState::Mapping);
}
