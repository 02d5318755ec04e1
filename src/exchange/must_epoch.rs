// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collectives backing replicated must-epoch launches.
//!
//! A must-epoch launch maps a group of tasks that synchronize with each
//! other, so every shard has to agree on processor placement and on the
//! instances satisfying each mapping constraint before any task runs. Two
//! strategies exist: one shard maps everything and broadcasts the decision
//! ([`MustEpochMappingBroadcast`]), or every shard maps its own tasks and
//! the decisions are combined by weight ([`MustEpochMappingExchange`]).
//! The dependence and completion exchanges then union the events that order
//! the epoch against the rest of the execution.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::collective::all_gather::AllGather;
use crate::collective::broadcast::Broadcast;
use crate::collective::{
    BroadcastPayload, CollectiveLocation, CollectivePayload, ExchangePayload, PayloadKind,
    ReplicaContext, Stage,
};
use crate::event::{EventHandle, LocalEventSystem};
use crate::exchange;
use crate::identity::{DistributedId, DomainPoint, ProcessorId, ShardId};

/// One shard's candidate mapping for one constraint, ranked by mapper
/// weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintMapping {
    pub weight: u64,
    pub origin: ShardId,
    pub instances: Vec<DistributedId>,
}

impl ConstraintMapping {
    /// Highest weight wins; ties go to the lowest origin shard so every
    /// shard picks the same candidate.
    fn beats(&self, other: &ConstraintMapping) -> bool {
        (self.weight, std::cmp::Reverse(self.origin))
            > (other.weight, std::cmp::Reverse(other.origin))
    }
}

#[derive(Default, Serialize, Deserialize)]
struct MustEpochMapping {
    processors: BTreeMap<DomainPoint, ProcessorId>,
    constraints: BTreeMap<u32, Vec<DistributedId>>,
}

impl CollectivePayload for MustEpochMapping {
    const KIND: PayloadKind = PayloadKind::MustEpochMappingBroadcast;
}

impl BroadcastPayload for MustEpochMapping {
    fn pack_broadcast(&mut self) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_broadcast(&mut self, bytes: Bytes) -> Result<()> {
        let incoming: MustEpochMapping = exchange::decode(&bytes)?;
        self.processors = incoming.processors;
        self.constraints = incoming.constraints;
        Ok(())
    }
}

/// Broadcast of one shard's complete must-epoch mapping decision.
pub struct MustEpochMappingBroadcast {
    broadcast: Arc<Broadcast<MustEpochMapping>>,
}

impl MustEpochMappingBroadcast {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("must_epoch_mapping_broadcast");

    pub fn new(ctx: &Arc<ReplicaContext>, origin: ShardId) -> Result<Self> {
        Ok(Self {
            broadcast: Broadcast::new(ctx, origin, Self::LOCATION)?,
        })
    }

    pub fn broadcast(
        &self,
        processors: BTreeMap<DomainPoint, ProcessorId>,
        constraints: BTreeMap<u32, Vec<DistributedId>>,
    ) -> Result<()> {
        self.broadcast.broadcast(MustEpochMapping {
            processors,
            constraints,
        })
    }

    pub fn done(&self) -> EventHandle {
        self.broadcast.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.broadcast.wait().await
    }

    pub fn extract(&self) -> (BTreeMap<DomainPoint, ProcessorId>, BTreeMap<u32, Vec<DistributedId>>) {
        let state = self.broadcast.take();
        (state.processors, state.constraints)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct WeightedMappings {
    processors: BTreeMap<DomainPoint, ProcessorId>,
    constraints: BTreeMap<u32, ConstraintMapping>,
}

impl WeightedMappings {
    fn absorb(&mut self, incoming: WeightedMappings) {
        self.processors.extend(incoming.processors);
        for (index, candidate) in incoming.constraints {
            match self.constraints.get(&index) {
                Some(held) if !candidate.beats(held) => {}
                _ => {
                    self.constraints.insert(index, candidate);
                }
            }
        }
    }
}

impl CollectivePayload for WeightedMappings {
    const KIND: PayloadKind = PayloadKind::MustEpochMappingExchange;
}

impl ExchangePayload for WeightedMappings {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        self.absorb(exchange::decode(&bytes)?);
        Ok(())
    }
}

/// All-gather of per-shard must-epoch mapping candidates.
pub struct MustEpochMappingExchange {
    shard: ShardId,
    exchange: Arc<AllGather<WeightedMappings>>,
}

impl MustEpochMappingExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("must_epoch_mapping_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            shard: ctx.shard(),
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    /// Contribute the placements this shard mapped and its weighted
    /// candidate for each constraint it considered.
    pub fn exchange(
        &self,
        processors: BTreeMap<DomainPoint, ProcessorId>,
        constraints: BTreeMap<u32, (u64, Vec<DistributedId>)>,
    ) -> Result<()> {
        let origin = self.shard;
        self.exchange.start(move |state| {
            let incoming = WeightedMappings {
                processors,
                constraints: constraints
                    .into_iter()
                    .map(|(index, (weight, instances))| {
                        (index, ConstraintMapping { weight, origin, instances })
                    })
                    .collect(),
            };
            state.absorb(incoming);
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    /// The agreed placements and the winning candidate per constraint.
    pub fn extract(&self) -> (BTreeMap<DomainPoint, ProcessorId>, BTreeMap<u32, ConstraintMapping>) {
        let state = self.exchange.take();
        (state.processors, state.constraints)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct DependenceEvents {
    dependences: BTreeMap<DomainPoint, EventHandle>,
}

impl CollectivePayload for DependenceEvents {
    const KIND: PayloadKind = PayloadKind::MustEpochDependenceExchange;
}

impl ExchangePayload for DependenceEvents {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        let incoming: DependenceEvents = exchange::decode(&bytes)?;
        self.dependences.extend(incoming.dependences);
        Ok(())
    }
}

/// All-gather of per-point dependence events for a must-epoch launch.
pub struct MustEpochDependenceExchange {
    exchange: Arc<AllGather<DependenceEvents>>,
}

impl MustEpochDependenceExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("must_epoch_dependence_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    pub fn exchange(&self, dependences: BTreeMap<DomainPoint, EventHandle>) -> Result<()> {
        self.exchange.start(move |state| {
            state.dependences.extend(dependences);
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    pub fn extract(&self) -> BTreeMap<DomainPoint, EventHandle> {
        self.exchange.take().dependences
    }
}

#[derive(Default, Serialize, Deserialize)]
struct CompletionEvents {
    mapped: BTreeSet<EventHandle>,
    complete: BTreeSet<EventHandle>,
}

impl CollectivePayload for CompletionEvents {
    const KIND: PayloadKind = PayloadKind::MustEpochCompletionExchange;
}

impl ExchangePayload for CompletionEvents {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        let incoming: CompletionEvents = exchange::decode(&bytes)?;
        self.mapped.extend(incoming.mapped);
        self.complete.extend(incoming.complete);
        Ok(())
    }
}

/// All-gather of the mapped and completion events of every shard's epoch
/// tasks.
pub struct MustEpochCompletionExchange {
    events: Arc<LocalEventSystem>,
    exchange: Arc<AllGather<CompletionEvents>>,
}

impl MustEpochCompletionExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("must_epoch_completion_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            events: ctx.events().clone(),
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    pub fn exchange(&self, mapped: EventHandle, complete: EventHandle) -> Result<()> {
        self.exchange.start(move |state| {
            if mapped.exists() {
                state.mapped.insert(mapped);
            }
            if complete.exists() {
                state.complete.insert(complete);
            }
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    /// One event for "every shard's tasks mapped" and one for "every
    /// shard's tasks complete".
    pub fn extract(&self) -> Result<(EventHandle, EventHandle)> {
        let state = self.exchange.take();
        let mapped = self.events.merge_events(state.mapped.into_iter().collect())?;
        let complete = self
            .events
            .merge_events(state.complete.into_iter().collect())?;
        Ok((mapped, complete))
    }
}
