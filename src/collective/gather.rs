// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! All-to-one gather over the inverse radix-R tree.
//!
//! Contributions flow leaf-to-root in the index space rooted at the target.
//! Each shard expects `1 (itself) + |children|` inputs; once they are all
//! merged it either forwards the merged state to its parent `(i-1)/R` or,
//! at the target, completes with the full result. A shard's done event
//! triggers as soon as its own part is handed off, not when the whole
//! gather finishes.

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use std::sync::{Arc, Weak};
use tracing::{error, trace};

use crate::collective::{
    CollectiveId, CollectiveInbox, CollectiveLocation, CollectiveTopology, GatherPayload,
    ReplicaContext, Stage, verify,
};
use crate::event::{EventHandle, LocalEvent};
use crate::identity::ShardId;

struct GatherState<P> {
    payload: P,
    received: u32,
    contributed: bool,
    finished: bool,
}

enum Completion {
    NotYet,
    AtTarget,
    Forward(ShardId, Bytes),
}

/// Inverse-tree gather engine, generic over the payload it merges.
pub struct Gather<P> {
    ctx: Weak<ReplicaContext>,
    topology: Arc<CollectiveTopology>,
    id: CollectiveId,
    target: ShardId,
    index: u32,
    expected: u32,
    done: LocalEvent,
    state: ParkingMutex<GatherState<P>>,
}

impl<P: GatherPayload> Gather<P> {
    pub fn new(
        ctx: &Arc<ReplicaContext>,
        target: ShardId,
        location: CollectiveLocation,
    ) -> Result<Arc<Self>> {
        let id = ctx.allocate(location);
        let done = ctx.events().new_event()?;
        let topology = ctx.topology();
        let index = ctx.relative_index(target);
        let expected = 1 + topology.tree_children(index).len() as u32;
        let engine = Arc::new(Self {
            ctx: Arc::downgrade(ctx),
            topology,
            id,
            target,
            index,
            expected,
            done,
            state: ParkingMutex::new(GatherState {
                payload: P::default(),
                received: 0,
                contributed: false,
                finished: false,
            }),
        });
        ctx.register(id, engine.clone());
        Ok(engine)
    }

    pub fn id(&self) -> CollectiveId {
        self.id
    }

    pub fn target(&self) -> ShardId {
        self.target
    }

    pub fn done(&self) -> EventHandle {
        self.done.handle()
    }

    pub async fn wait(&self) -> Result<()> {
        self.done.waiter().await.map_err(anyhow::Error::new)
    }

    /// Extract the merged result at the target after completion.
    pub fn take(&self) -> P {
        let mut state = self.state.lock();
        debug_assert!(state.finished);
        std::mem::take(&mut state.payload)
    }

    /// Add this shard's contribution. Exactly one call per shard.
    pub fn contribute(&self, fill: impl FnOnce(&mut P)) -> Result<()> {
        let ctx = self.ctx()?;
        let completion = {
            let mut state = self.state.lock();
            debug_assert!(!state.contributed, "{} contributed twice", self.id);
            fill(&mut state.payload);
            state.contributed = true;
            state.received += 1;
            self.completion(&ctx, &mut state)?
        };
        self.resolve(&ctx, completion)
    }

    /// Complete without contributing or sending. Every shard of the
    /// operation must take the same branch.
    pub fn elide(&self) -> Result<()> {
        let ctx = self.ctx()?;
        {
            let mut state = self.state.lock();
            debug_assert!(!state.contributed && state.received == 0);
            state.finished = true;
        }
        ctx.unregister(self.id);
        self.done.trigger()
    }

    fn handle(&self, ctx: &Arc<ReplicaContext>, stage: Stage, sealed: Bytes) -> Result<()> {
        if stage != Stage::Tree {
            bail!("{}: unexpected {stage} on a gather", self.id);
        }
        let bytes = verify::open(P::KIND, sealed, ctx.config().verify_collectives)?;
        let completion = {
            let mut state = self.state.lock();
            state.payload.unpack_gather(bytes)?;
            state.received += 1;
            debug_assert!(state.received <= self.expected, "{} over-received", self.id);
            self.completion(ctx, &mut state)?
        };
        self.resolve(ctx, completion)
    }

    fn completion(
        &self,
        ctx: &Arc<ReplicaContext>,
        state: &mut GatherState<P>,
    ) -> Result<Completion> {
        if state.finished || state.received < self.expected {
            return Ok(Completion::NotYet);
        }
        state.finished = true;
        if self.index == 0 {
            return Ok(Completion::AtTarget);
        }
        // Parent index is never absent for index > 0.
        let parent = self.topology.tree_parent(self.index).unwrap_or(0);
        let bytes = state.payload.pack_gather()?;
        Ok(Completion::Forward(
            ctx.absolute_shard(parent, self.target),
            bytes,
        ))
    }

    fn resolve(&self, ctx: &Arc<ReplicaContext>, completion: Completion) -> Result<()> {
        match completion {
            Completion::NotYet => Ok(()),
            Completion::AtTarget => {
                trace!(collective = %self.id, "gather complete at target");
                ctx.unregister(self.id);
                self.done.trigger()
            }
            Completion::Forward(parent, bytes) => {
                let sealed = verify::seal(P::KIND, bytes, ctx.config().verify_collectives);
                ctx.send_stage(parent, self.id, Stage::Tree, sealed)?;
                ctx.unregister(self.id);
                self.done.trigger()
            }
        }
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

impl<P: GatherPayload> CollectiveInbox for Gather<P> {
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
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct ProbeSet {
        values: BTreeSet<u32>,
    }

    impl CollectivePayload for ProbeSet {
        const KIND: PayloadKind = PayloadKind::Probe;
    }

    impl GatherPayload for ProbeSet {
        fn pack_gather(&self) -> Result<Bytes> {
            Ok(Bytes::from(rmp_serde::to_vec(&self.values)?))
        }

        fn unpack_gather(&mut self, bytes: Bytes) -> Result<()> {
            let incoming: BTreeSet<u32> = rmp_serde::from_slice(&bytes)?;
            self.values.extend(incoming);
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

    fn child_frame(ctx: &Arc<ReplicaContext>, values: &[u32]) -> Bytes {
        let payload = ProbeSet {
            values: values.iter().copied().collect(),
        };
        let bytes = payload.pack_gather().expect("pack");
        verify::seal(ProbeSet::KIND, bytes, ctx.config().verify_collectives)
    }

    #[test]
    fn single_shard_gather_is_local() {
        let ctx = context(0, 1);
        let gather =
            Gather::<ProbeSet>::new(&ctx, ShardId::new(0), CollectiveLocation::new("probe"))
                .expect("new");
        gather
            .contribute(|set| {
                set.values.insert(0);
            })
            .expect("contribute");
        assert_eq!(ctx.events().poll(gather.done()).unwrap(), EventStatus::Ready);
        assert_eq!(gather.take().values, BTreeSet::from([0]));
    }

    #[test]
    fn target_merges_children_and_own_contribution() {
        // Shard 0 of 3 with radix 4: children are shards 1 and 2.
        let ctx = context(0, 3);
        let gather =
            Gather::<ProbeSet>::new(&ctx, ShardId::new(0), CollectiveLocation::new("probe"))
                .expect("new");

        ctx.deliver_collective(gather.id(), Stage::Tree, child_frame(&ctx, &[1]));
        gather
            .contribute(|set| {
                set.values.insert(0);
            })
            .expect("contribute");
        assert_eq!(
            ctx.events().poll(gather.done()).unwrap(),
            EventStatus::Pending
        );

        ctx.deliver_collective(gather.id(), Stage::Tree, child_frame(&ctx, &[2]));
        assert_eq!(ctx.events().poll(gather.done()).unwrap(), EventStatus::Ready);
        assert_eq!(gather.take().values, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn elide_completes_without_contributing() {
        let ctx = context(0, 3);
        let gather =
            Gather::<ProbeSet>::new(&ctx, ShardId::new(0), CollectiveLocation::new("probe"))
                .expect("new");
        gather.elide().expect("elide");
        assert_eq!(ctx.events().poll(gather.done()).unwrap(), EventStatus::Ready);
    }

    #[test]
    fn malformed_contribution_poisons() {
        let ctx = context(0, 3);
        let gather =
            Gather::<ProbeSet>::new(&ctx, ShardId::new(0), CollectiveLocation::new("probe"))
                .expect("new");
        let sealed = verify::seal(
            ProbeSet::KIND,
            Bytes::from_static(b"\xff\xff"),
            ctx.config().verify_collectives,
        );
        ctx.deliver_collective(gather.id(), Stage::Tree, sealed);
        assert_eq!(
            ctx.events().poll(gather.done()).unwrap(),
            EventStatus::Poisoned
        );
    }
}
