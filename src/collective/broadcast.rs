// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-to-all broadcast over a radix-R tree.
//!
//! In the relabeled index space rooted at the origin, the children of index
//! `i` are `i*R + r` for `r = 1..=R`, skipped once they reach the shard
//! count. The origin packs and sends once; every receiver unpacks, forwards
//! to its children, and then triggers its local done event. Each shard
//! receives exactly one message and the tree is `ceil(log_R(total))` deep.

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use std::sync::{Arc, Weak};
use tracing::{error, trace};

use crate::collective::{
    BroadcastPayload, CollectiveId, CollectiveInbox, CollectiveLocation, CollectiveTopology,
    ReplicaContext, Stage, verify,
};
use crate::event::{EventHandle, LocalEvent};
use crate::identity::ShardId;

struct BroadcastState<P> {
    payload: P,
    finished: bool,
}

/// Tree broadcast engine, generic over the payload it distributes.
pub struct Broadcast<P> {
    ctx: Weak<ReplicaContext>,
    topology: Arc<CollectiveTopology>,
    id: CollectiveId,
    origin: ShardId,
    index: u32,
    done: LocalEvent,
    state: ParkingMutex<BroadcastState<P>>,
}

impl<P: BroadcastPayload> Broadcast<P> {
    pub fn new(
        ctx: &Arc<ReplicaContext>,
        origin: ShardId,
        location: CollectiveLocation,
    ) -> Result<Arc<Self>> {
        let id = ctx.allocate(location);
        let done = ctx.events().new_event()?;
        let engine = Arc::new(Self {
            ctx: Arc::downgrade(ctx),
            topology: ctx.topology(),
            id,
            origin,
            index: ctx.relative_index(origin),
            done,
            state: ParkingMutex::new(BroadcastState {
                payload: P::default(),
                finished: false,
            }),
        });
        ctx.register(id, engine.clone());
        Ok(engine)
    }

    pub fn id(&self) -> CollectiveId {
        self.id
    }

    pub fn origin(&self) -> ShardId {
        self.origin
    }

    /// Event that triggers once this shard holds the broadcast value.
    pub fn done(&self) -> EventHandle {
        self.done.handle()
    }

    pub async fn wait(&self) -> Result<()> {
        self.done.waiter().await.map_err(anyhow::Error::new)
    }

    /// Extract the delivered value. Call after the done event triggered.
    pub fn take(&self) -> P {
        let mut state = self.state.lock();
        debug_assert!(state.finished);
        std::mem::take(&mut state.payload)
    }

    /// Origin entry point: seed the value and fan it out.
    pub fn broadcast(&self, payload: P) -> Result<()> {
        debug_assert_eq!(self.index, 0, "broadcast called off-origin");
        let ctx = self.ctx()?;
        let sends = {
            let mut state = self.state.lock();
            debug_assert!(!state.finished);
            state.payload = payload;
            let sends = self.pack_for_children(&ctx, &mut state.payload)?;
            state.finished = true;
            sends
        };
        self.dispatch(&ctx, sends)?;
        ctx.unregister(self.id);
        self.done.trigger()
    }

    fn handle(&self, ctx: &Arc<ReplicaContext>, stage: Stage, sealed: Bytes) -> Result<()> {
        if stage != Stage::Tree {
            bail!("{}: unexpected {stage} on a broadcast", self.id);
        }
        if self.index == 0 {
            bail!("{}: origin received broadcast traffic", self.id);
        }
        let bytes = verify::open(P::KIND, sealed, ctx.config().verify_collectives)?;
        let sends = {
            let mut state = self.state.lock();
            if state.finished {
                debug_assert!(false, "{} delivered twice", self.id);
                return Ok(());
            }
            state.payload.unpack_broadcast(bytes)?;
            let sends = self.pack_for_children(ctx, &mut state.payload)?;
            state.finished = true;
            sends
        };
        self.dispatch(ctx, sends)?;
        ctx.unregister(self.id);
        self.done.trigger()
    }

    /// Packs one fresh frame per child edge.
    fn pack_for_children(
        &self,
        ctx: &Arc<ReplicaContext>,
        payload: &mut P,
    ) -> Result<Vec<(ShardId, Bytes)>> {
        let mut sends = Vec::new();
        for child in self.topology.tree_children(self.index) {
            let bytes = payload.pack_broadcast()?;
            sends.push((ctx.absolute_shard(child, self.origin), bytes));
        }
        Ok(sends)
    }

    fn dispatch(&self, ctx: &Arc<ReplicaContext>, sends: Vec<(ShardId, Bytes)>) -> Result<()> {
        let enabled = ctx.config().verify_collectives;
        for (target, bytes) in sends {
            let sealed = verify::seal(P::KIND, bytes, enabled);
            ctx.send_stage(target, self.id, Stage::Tree, sealed)?;
        }
        Ok(())
    }

    fn ctx(&self) -> Result<Arc<ReplicaContext>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| anyhow!("{}: replication context dropped", self.id))
    }

    fn fail(&self, reason: String) {
        error!(collective = %self.id, "{reason}");
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.unregister(self.id);
        }
        if let Err(err) = self.done.poison(reason) {
            trace!(collective = %self.id, "secondary failure: {err}");
        }
    }
}

impl<P: BroadcastPayload> CollectiveInbox for Broadcast<P> {
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
    use crate::collective::{CollectivePayload, PayloadKind};
    use crate::config::LockstepConfig;
    use crate::event::{EventStatus, LocalEventSystem};
    use crate::identity::{NodeId, ReplicationId};

    #[derive(Default)]
    struct ProbeValue {
        value: u64,
    }

    impl CollectivePayload for ProbeValue {
        const KIND: PayloadKind = PayloadKind::Probe;
    }

    impl BroadcastPayload for ProbeValue {
        fn pack_broadcast(&mut self) -> Result<Bytes> {
            Ok(Bytes::from(rmp_serde::to_vec(&self.value)?))
        }

        fn unpack_broadcast(&mut self, bytes: Bytes) -> Result<()> {
            self.value = rmp_serde::from_slice(&bytes)?;
            Ok(())
        }
    }

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
    fn single_shard_broadcast_completes_immediately() {
        let ctx = context(0, 1);
        let broadcast =
            Broadcast::<ProbeValue>::new(&ctx, ShardId::new(0), CollectiveLocation::new("probe"))
                .expect("new");
        broadcast.broadcast(ProbeValue { value: 11 }).expect("broadcast");
        assert_eq!(
            ctx.events().poll(broadcast.done()).unwrap(),
            EventStatus::Ready
        );
        assert_eq!(broadcast.take().value, 11);
    }

    #[test]
    fn leaf_receiver_unpacks_and_completes() {
        // Shard 3 of 4 with radix 4 is a leaf of any tree.
        let ctx = context(3, 4);
        let broadcast =
            Broadcast::<ProbeValue>::new(&ctx, ShardId::new(0), CollectiveLocation::new("probe"))
                .expect("new");

        let mut seed = ProbeValue { value: 29 };
        let frame = seed.pack_broadcast().expect("pack");
        let sealed = verify::seal(ProbeValue::KIND, frame, ctx.config().verify_collectives);
        ctx.deliver_collective(broadcast.id(), Stage::Tree, sealed);

        assert_eq!(
            ctx.events().poll(broadcast.done()).unwrap(),
            EventStatus::Ready
        );
        assert_eq!(broadcast.take().value, 29);
    }

    #[test]
    fn wrong_kind_seal_poisons_the_collective() {
        let ctx = context(3, 4);
        let broadcast =
            Broadcast::<ProbeValue>::new(&ctx, ShardId::new(0), CollectiveLocation::new("probe"))
                .expect("new");

        let sealed = verify::seal(
            PayloadKind::FutureExchange,
            Bytes::from_static(b"x"),
            true,
        );
        ctx.deliver_collective(broadcast.id(), Stage::Tree, sealed);
        assert_eq!(
            ctx.events().poll(broadcast.done()).unwrap(),
            EventStatus::Poisoned
        );
    }
}
