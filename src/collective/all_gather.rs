// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! All-to-all exchange by recursive doubling.
//!
//! The largest power-of-two prefix of the shards runs a butterfly: at stage
//! `s`, shard `i` exchanges its full accumulated state with `i XOR (r <<
//! s*log2(radix))` for each `r` below the stage radix. The leftover shards
//! ("remainder" shards, `index >= participating`) hand their contribution
//! to their partner `index - participating` before stage 0 and receive the
//! complete result from the same partner after the last stage.
//!
//! Sends are strictly stage ordered: stage `s + 1` leaves a shard only
//! once every stage-`s` partner message has been merged. Receipt is not
//! ordered; payload merges are commutative and idempotent, so a fast
//! partner's later-stage traffic merges immediately and just bumps the
//! stage counter.

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use std::sync::{Arc, Weak};
use tracing::{error, trace};

use crate::collective::{
    CollectiveId, CollectiveInbox, CollectiveLocation, CollectiveTopology, ExchangePayload,
    ReplicaContext, Stage, verify,
};
use crate::event::{EventHandle, LocalEvent};
use crate::identity::ShardId;

struct ExchangeState<P> {
    payload: P,
    started: bool,
    /// Pre-stage contribution from the paired remainder shard arrived.
    pre_received: bool,
    /// Stage frames this shard has already sent.
    sent: Vec<bool>,
    /// Partner frames merged per stage. A stage is fully received at
    /// `stage_radix(stage) - 1`.
    notifications: Vec<u32>,
    finished: bool,
}

/// Butterfly all-gather engine, generic over the exchanged payload.
pub struct AllGather<P> {
    ctx: Weak<ReplicaContext>,
    topology: Arc<CollectiveTopology>,
    id: CollectiveId,
    index: u32,
    /// Participant half of a remainder pairing: expects the pre-stage
    /// contribution of `index + participating` and owes it the result.
    paired: bool,
    done: LocalEvent,
    state: ParkingMutex<ExchangeState<P>>,
}

impl<P: ExchangePayload> AllGather<P> {
    pub fn new(ctx: &Arc<ReplicaContext>, location: CollectiveLocation) -> Result<Arc<Self>> {
        let id = ctx.allocate(location);
        let done = ctx.events().new_event()?;
        let topology = ctx.topology();
        let index = ctx.shard().as_u32();
        let participant = topology.is_participant(index);
        let paired = participant && topology.expects_remainder(index);
        let stages = if participant {
            topology.stage_count() as usize
        } else {
            0
        };
        let engine = Arc::new(Self {
            ctx: Arc::downgrade(ctx),
            topology,
            id,
            index,
            paired,
            done,
            state: ParkingMutex::new(ExchangeState {
                payload: P::default(),
                started: false,
                pre_received: false,
                sent: vec![false; stages],
                notifications: vec![0; stages],
                finished: false,
            }),
        });
        ctx.register(id, engine.clone());
        Ok(engine)
    }

    pub fn id(&self) -> CollectiveId {
        self.id
    }

    pub fn done(&self) -> EventHandle {
        self.done.handle()
    }

    pub async fn wait(&self) -> Result<()> {
        self.done.waiter().await.map_err(anyhow::Error::new)
    }

    /// Extract the full accumulated state after completion.
    pub fn take(&self) -> P {
        let mut state = self.state.lock();
        debug_assert!(state.finished);
        std::mem::take(&mut state.payload)
    }

    /// Seed this shard's contribution and start exchanging.
    pub fn start(&self, contribute: impl FnOnce(&mut P)) -> Result<()> {
        let ctx = self.ctx()?;
        {
            let mut state = self.state.lock();
            debug_assert!(!state.started, "{} started twice", self.id);
            contribute(&mut state.payload);
            state.started = true;
        }
        if self.topology.is_participant(self.index) {
            self.advance(&ctx)
        } else {
            self.send_remainder_contribution(&ctx)
        }
    }

    /// Complete without exchanging anything. Every shard of the operation
    /// must take the same branch; no message is sent or expected.
    pub fn elide(&self) -> Result<()> {
        let ctx = self.ctx()?;
        {
            let mut state = self.state.lock();
            debug_assert!(!state.started && !state.finished);
            state.started = true;
            state.finished = true;
        }
        ctx.unregister(self.id);
        self.done.trigger()
    }

    /// Sends every stage whose predecessor is fully merged, in order, then
    /// completes the exchange if nothing is outstanding.
    fn advance(&self, ctx: &Arc<ReplicaContext>) -> Result<()> {
        let enabled = ctx.config().verify_collectives;
        let mut stage = 0;
        while stage < self.topology.stage_count() {
            let frame = {
                let mut state = self.state.lock();
                if !state.started || state.finished {
                    return Ok(());
                }
                if state.sent[stage as usize] {
                    stage += 1;
                    continue;
                }
                let ready = if stage == 0 {
                    !self.paired || state.pre_received
                } else {
                    state.notifications[stage as usize - 1]
                        == self.topology.stage_radix(stage - 1) - 1
                };
                if !ready {
                    return Ok(());
                }
                state.sent[stage as usize] = true;
                state.payload.pack_stage(Stage::Butterfly(stage))?
            };
            let sealed = verify::seal(P::KIND, frame, enabled);
            for partner in self.topology.stage_partners(self.index, stage) {
                ctx.send_stage(
                    ShardId::new(partner),
                    self.id,
                    Stage::Butterfly(stage),
                    sealed.clone(),
                )?;
            }
            stage += 1;
        }
        self.finish_if_complete(ctx)
    }

    fn finish_if_complete(&self, ctx: &Arc<ReplicaContext>) -> Result<()> {
        let result_frame = {
            let mut state = self.state.lock();
            if state.finished || !self.stages_done(&state) {
                return Ok(());
            }
            state.finished = true;
            if self.paired {
                Some(state.payload.pack_stage(Stage::Remainder)?)
            } else {
                None
            }
        };
        if let Some(frame) = result_frame {
            // The paired remainder shard receives the complete result.
            let target = ShardId::new(self.index + self.topology.participating());
            let sealed = verify::seal(P::KIND, frame, ctx.config().verify_collectives);
            ctx.send_stage(target, self.id, Stage::Remainder, sealed)?;
        }
        trace!(collective = %self.id, "exchange complete");
        ctx.unregister(self.id);
        self.done.trigger()
    }

    fn stages_done(&self, state: &ExchangeState<P>) -> bool {
        if !state.started {
            return false;
        }
        let stages = self.topology.stage_count();
        if stages == 0 {
            return true;
        }
        if !state.sent.iter().all(|sent| *sent) {
            return false;
        }
        state.notifications[stages as usize - 1] == self.topology.stage_radix(stages - 1) - 1
    }

    fn send_remainder_contribution(&self, ctx: &Arc<ReplicaContext>) -> Result<()> {
        let frame = {
            let state = self.state.lock();
            state.payload.pack_stage(Stage::Remainder)?
        };
        let target = ShardId::new(self.topology.remainder_partner(self.index));
        let sealed = verify::seal(P::KIND, frame, ctx.config().verify_collectives);
        ctx.send_stage(target, self.id, Stage::Remainder, sealed)
    }

    fn handle(&self, ctx: &Arc<ReplicaContext>, stage: Stage, sealed: Bytes) -> Result<()> {
        let bytes = verify::open(P::KIND, sealed, ctx.config().verify_collectives)?;
        let participant = self.topology.is_participant(self.index);
        match stage {
            Stage::Butterfly(number) => {
                if !participant || number >= self.topology.stage_count() {
                    bail!("{}: unexpected {stage}", self.id);
                }
                {
                    let mut state = self.state.lock();
                    state.payload.unpack_stage(stage, bytes)?;
                    state.notifications[number as usize] += 1;
                    debug_assert!(
                        state.notifications[number as usize]
                            <= self.topology.stage_radix(number) - 1,
                        "{} over-notified at {stage}",
                        self.id
                    );
                }
                self.advance(ctx)
            }
            Stage::Remainder if participant => {
                if !self.paired {
                    bail!("{}: remainder contribution without a pairing", self.id);
                }
                {
                    let mut state = self.state.lock();
                    debug_assert!(!state.pre_received, "{} double remainder", self.id);
                    state.payload.unpack_stage(stage, bytes)?;
                    state.pre_received = true;
                }
                self.advance(ctx)
            }
            Stage::Remainder => {
                // The complete result from the butterfly partner.
                {
                    let mut state = self.state.lock();
                    debug_assert!(state.started, "{} result before contribution", self.id);
                    state.payload.unpack_stage(stage, bytes)?;
                    state.finished = true;
                }
                ctx.unregister(self.id);
                self.done.trigger()
            }
            Stage::Tree => bail!("{}: unexpected {stage} on an all-gather", self.id),
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

impl<P: ExchangePayload> CollectiveInbox for AllGather<P> {
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
