// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Event distribution and synchronization over the collective tree.
//!
//! [`ShardEventTree`] ships one event handle from an origin shard to every
//! other shard. [`ShardSyncTree`] goes the other way: every shard supplies
//! a local precondition, and the origin's done event triggers once every
//! precondition in the tree has. Poison on any precondition flows up the
//! same edges.

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

use crate::collective::broadcast::Broadcast;
use crate::collective::{
    BroadcastPayload, CollectiveId, CollectiveInbox, CollectiveLocation, CollectivePayload,
    CollectiveTopology, PayloadKind, ReplicaContext, Stage, verify,
};
use crate::event::{EventHandle, LocalEvent};
use crate::exchange;
use crate::identity::ShardId;

#[derive(Serialize, Deserialize)]
struct TreeEvent {
    event: EventHandle,
}

impl Default for TreeEvent {
    fn default() -> Self {
        Self {
            event: EventHandle::NONE,
        }
    }
}

impl CollectivePayload for TreeEvent {
    const KIND: PayloadKind = PayloadKind::ShardEventTree;
}

impl BroadcastPayload for TreeEvent {
    fn pack_broadcast(&mut self) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_broadcast(&mut self, bytes: Bytes) -> Result<()> {
        let incoming: TreeEvent = exchange::decode(&bytes)?;
        self.event = incoming.event;
        Ok(())
    }
}

/// Broadcast of one event handle from the origin to every shard.
pub struct ShardEventTree {
    broadcast: Arc<Broadcast<TreeEvent>>,
}

impl ShardEventTree {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("shard_event_tree");

    pub fn new(ctx: &Arc<ReplicaContext>, origin: ShardId) -> Result<Self> {
        Ok(Self {
            broadcast: Broadcast::new(ctx, origin, Self::LOCATION)?,
        })
    }

    /// Origin side: distribute the handle.
    pub fn broadcast(&self, event: EventHandle) -> Result<()> {
        self.broadcast.broadcast(TreeEvent { event })
    }

    pub fn done(&self) -> EventHandle {
        self.broadcast.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.broadcast.wait().await
    }

    pub fn extract(&self) -> EventHandle {
        self.broadcast.take().event
    }
}

struct SyncState {
    /// Local contribution, recorded by [`ShardSyncTree::sync`].
    precondition: Option<EventHandle>,
    /// Event this shard must complete for its parent.
    parent_edge: Option<EventHandle>,
    armed: bool,
    launched: bool,
}

struct LaunchPlan {
    sends: Vec<(ShardId, Bytes)>,
    merged_inputs: Vec<EventHandle>,
    parent_edge: Option<EventHandle>,
}

/// All-to-origin synchronization over the collective tree.
///
/// Each shard calls [`sync`](Self::sync) once with a local precondition.
/// Interior shards receive a fresh edge event from their parent, mint one
/// per child, and complete the parent's edge once the merge of their
/// precondition and all child edges fires. The origin's done event is the
/// whole-tree synchronization point; a non-origin shard's done event only
/// covers its own subtree.
pub struct ShardSyncTree {
    ctx: Weak<ReplicaContext>,
    topology: Arc<CollectiveTopology>,
    id: CollectiveId,
    origin: ShardId,
    index: u32,
    done: LocalEvent,
    state: ParkingMutex<SyncState>,
}

impl ShardSyncTree {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("shard_sync_tree");

    pub fn new(ctx: &Arc<ReplicaContext>, origin: ShardId) -> Result<Arc<Self>> {
        let id = ctx.allocate(Self::LOCATION);
        let done = ctx.events().new_event()?;
        let tree = Arc::new(Self {
            ctx: Arc::downgrade(ctx),
            topology: ctx.topology(),
            id,
            origin,
            index: ctx.relative_index(origin),
            done,
            state: ParkingMutex::new(SyncState {
                precondition: None,
                parent_edge: None,
                armed: false,
                launched: false,
            }),
        });
        ctx.register(id, tree.clone());
        Ok(tree)
    }

    pub fn id(&self) -> CollectiveId {
        self.id
    }

    /// On the origin: triggers once every shard's precondition has. On any
    /// other shard: covers that shard's subtree only.
    pub fn done(&self) -> EventHandle {
        self.done.handle()
    }

    pub async fn wait(&self) -> Result<()> {
        self.done.waiter().await.map_err(anyhow::Error::new)
    }

    /// Record this shard's precondition. Must be called exactly once on
    /// every shard; [`EventHandle::NONE`] contributes nothing to the merge.
    pub fn sync(&self, precondition: EventHandle) -> Result<()> {
        let ctx = self.ctx()?;
        let plan = {
            let mut state = self.state.lock();
            if state.armed {
                bail!("{}: sync called twice", self.id);
            }
            state.armed = true;
            state.precondition = Some(precondition);
            self.plan_launch(&ctx, &mut state)?
        };
        self.execute(&ctx, plan)
    }

    fn handle(&self, ctx: &Arc<ReplicaContext>, stage: Stage, sealed: Bytes) -> Result<()> {
        if stage != Stage::Tree {
            bail!("{}: unexpected {stage} on a sync tree", self.id);
        }
        if self.index == 0 {
            bail!("{}: origin received sync tree traffic", self.id);
        }
        let bytes = verify::open(PayloadKind::ShardSyncTree, sealed, ctx.config().verify_collectives)?;
        let edge: EventHandle = exchange::decode(&bytes)?;
        let plan = {
            let mut state = self.state.lock();
            if state.parent_edge.is_some() {
                bail!("{}: parent edge delivered twice", self.id);
            }
            state.parent_edge = Some(edge);
            self.plan_launch(ctx, &mut state)?
        };
        self.execute(ctx, plan)
    }

    /// Launches once both the local precondition and, off-origin, the
    /// parent's edge are in hand.
    fn plan_launch(
        &self,
        ctx: &Arc<ReplicaContext>,
        state: &mut SyncState,
    ) -> Result<Option<LaunchPlan>> {
        if state.launched || !state.armed || (self.index != 0 && state.parent_edge.is_none()) {
            return Ok(None);
        }
        state.launched = true;

        let mut sends = Vec::new();
        let mut merged_inputs = Vec::new();
        if let Some(precondition) = state.precondition {
            merged_inputs.push(precondition);
        }
        for child in self.topology.tree_children(self.index) {
            let edge = ctx.events().new_event()?;
            merged_inputs.push(edge.handle());
            let frame = exchange::encode(&edge.handle())?;
            sends.push((ctx.absolute_shard(child, self.origin), frame));
        }
        Ok(Some(LaunchPlan {
            sends,
            merged_inputs,
            parent_edge: state.parent_edge,
        }))
    }

    fn execute(&self, ctx: &Arc<ReplicaContext>, plan: Option<LaunchPlan>) -> Result<()> {
        let Some(plan) = plan else {
            return Ok(());
        };
        let enabled = ctx.config().verify_collectives;
        for (target, bytes) in plan.sends {
            let sealed = verify::seal(PayloadKind::ShardSyncTree, bytes, enabled);
            ctx.send_stage(target, self.id, Stage::Tree, sealed)?;
        }
        let merged = ctx.events().merge_events(plan.merged_inputs)?;
        ctx.unregister(self.id);
        self.watch(ctx, merged, plan.parent_edge)?;
        Ok(())
    }

    /// Completes the parent's edge and the local done event once the merge
    /// fires.
    fn watch(
        &self,
        ctx: &Arc<ReplicaContext>,
        merged: EventHandle,
        parent_edge: Option<EventHandle>,
    ) -> Result<()> {
        let waiter = ctx.events().waiter(merged)?;
        let done = self.done.clone();
        let weak = self.ctx.clone();
        let id = self.id;
        ctx.events().task_tracker().spawn(async move {
            let poison = waiter.await.err().map(|p| p.to_string());
            if let Some(edge) = parent_edge {
                let completed = match weak.upgrade() {
                    Some(ctx) => ctx.complete_event(edge, poison.clone()),
                    None => Err(anyhow!("replication context dropped")),
                };
                if let Err(err) = completed {
                    error!(collective = %id, "failed to complete parent edge {edge}: {err}");
                }
            }
            let completed = match poison {
                None => done.trigger(),
                Some(reason) => done.poison(reason),
            };
            if let Err(err) = completed {
                trace!(collective = %id, "secondary completion failure: {err}");
            }
        });
        Ok(())
    }

    fn ctx(&self) -> Result<Arc<ReplicaContext>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| anyhow!("{}: replication context dropped", self.id))
    }

    fn fail(&self, reason: String) {
        error!(collective = %self.id, "{reason}");
        let parent_edge = self.state.lock().parent_edge;
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.unregister(self.id);
            if let Some(edge) = parent_edge {
                if let Err(err) = ctx.complete_event(edge, Some(reason.clone())) {
                    trace!(collective = %self.id, "failed to poison parent edge: {err}");
                }
            }
        }
        if let Err(err) = self.done.poison(reason) {
            trace!(collective = %self.id, "secondary failure: {err}");
        }
    }
}

impl CollectiveInbox for ShardSyncTree {
    fn handle_stage(&self, stage: Stage, payload: Bytes) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        if let Err(err) = self.handle(&ctx, stage, payload) {
            self.fail(err.to_string());
        }
    }

    fn poison(&self, reason: String) {
        self.fail(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::CollectiveTopology;
    use crate::config::LockstepConfig;
    use crate::event::{EventStatus, LocalEventSystem};
    use crate::identity::{NodeId, ReplicationId};

    fn context(shard: u32, total: u32) -> Arc<ReplicaContext> {
        let config = Arc::new(LockstepConfig::default());
        ReplicaContext::new(
            ReplicationId::new(1),
            ShardId::new(shard),
            Weak::new(),
            LocalEventSystem::new(NodeId::new(0)),
            config.clone(),
            Arc::new(CollectiveTopology::new(total, config.collective_radix)),
        )
    }

    #[test]
    fn event_tree_payload_roundtrips() {
        let handle = EventHandle::from_raw((3u128 << 64) | 0x0000_0005_0000_0002);
        let mut seed = TreeEvent { event: handle };
        let frame = seed.pack_broadcast().expect("pack");
        let mut out = TreeEvent::default();
        out.unpack_broadcast(frame).expect("unpack");
        assert_eq!(out.event, handle);
    }

    #[test]
    fn event_tree_leaf_receives_the_handle() {
        let ctx = context(3, 4);
        let tree = ShardEventTree::new(&ctx, ShardId::new(0)).expect("new");

        let handle = EventHandle::from_raw((9u128 << 64) | 0x0000_0001_0000_0001);
        let mut seed = TreeEvent { event: handle };
        let frame = seed.pack_broadcast().expect("pack");
        let sealed = verify::seal(TreeEvent::KIND, frame, ctx.config().verify_collectives);
        ctx.deliver_collective(tree.broadcast.id(), Stage::Tree, sealed);

        assert_eq!(ctx.events().poll(tree.done()).unwrap(), EventStatus::Ready);
        assert_eq!(tree.extract(), handle);
    }

    #[tokio::test]
    async fn single_shard_sync_follows_its_precondition() {
        let ctx = context(0, 1);
        let tree = ShardSyncTree::new(&ctx, ShardId::new(0)).expect("new");

        let precondition = ctx.events().new_event().expect("event");
        tree.sync(precondition.handle()).expect("sync");
        assert_eq!(ctx.events().poll(tree.done()).unwrap(), EventStatus::Pending);

        precondition.trigger().expect("trigger");
        tree.wait().await.expect("done");
    }

    #[tokio::test]
    async fn leaf_completes_the_parent_edge() {
        // Shard 1 of 2 is a leaf child of the origin.
        let ctx = context(1, 2);
        let tree = ShardSyncTree::new(&ctx, ShardId::new(0)).expect("new");

        tree.sync(EventHandle::NONE).expect("sync");

        // The edge event lives in the same event system, so completion
        // takes the local path.
        let edge = ctx.events().new_event().expect("edge");
        let frame = exchange::encode(&edge.handle()).expect("encode");
        let sealed = verify::seal(
            PayloadKind::ShardSyncTree,
            frame,
            ctx.config().verify_collectives,
        );
        ctx.deliver_collective(tree.id(), Stage::Tree, sealed);

        ctx.events().wait(edge.handle()).await.expect("edge");
        tree.wait().await.expect("done");
    }

    #[tokio::test]
    async fn parent_edge_arriving_first_waits_for_sync() {
        let ctx = context(1, 2);
        let tree = ShardSyncTree::new(&ctx, ShardId::new(0)).expect("new");

        let edge = ctx.events().new_event().expect("edge");
        let frame = exchange::encode(&edge.handle()).expect("encode");
        let sealed = verify::seal(
            PayloadKind::ShardSyncTree,
            frame,
            ctx.config().verify_collectives,
        );
        ctx.deliver_collective(tree.id(), Stage::Tree, sealed);
        assert_eq!(
            ctx.events().poll(edge.handle()).unwrap(),
            EventStatus::Pending
        );

        tree.sync(EventHandle::NONE).expect("sync");
        ctx.events().wait(edge.handle()).await.expect("edge");
    }

    #[tokio::test]
    async fn poisoned_precondition_poisons_the_edge_and_done() {
        let ctx = context(1, 2);
        let tree = ShardSyncTree::new(&ctx, ShardId::new(0)).expect("new");

        let precondition = ctx.events().new_event().expect("event");
        precondition.poison("mapper exploded").expect("poison");
        tree.sync(precondition.handle()).expect("sync");

        let edge = ctx.events().new_event().expect("edge");
        let frame = exchange::encode(&edge.handle()).expect("encode");
        let sealed = verify::seal(
            PayloadKind::ShardSyncTree,
            frame,
            ctx.config().verify_collectives,
        );
        ctx.deliver_collective(tree.id(), Stage::Tree, sealed);

        let err = ctx.events().wait(edge.handle()).await.expect_err("poisoned");
        assert!(err.to_string().contains("mapper exploded"));
        tree.wait().await.expect_err("done poisoned");
    }
}
