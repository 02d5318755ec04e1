// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exchanges of field descriptors for externally attached data.
//!
//! When shards attach external resources, each shard holds descriptors for
//! the fields it attached locally plus an event that fires once the backing
//! memory is valid. Dependent operations need the union of the descriptors
//! and a single precondition covering every contributor, either on all
//! shards ([`FieldDescriptorExchange`]) or on one collecting shard
//! ([`FieldDescriptorGather`]).

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::collective::all_gather::AllGather;
use crate::collective::gather::Gather;
use crate::collective::{
    CollectiveLocation, CollectivePayload, ExchangePayload, GatherPayload, PayloadKind,
    ReplicaContext, Stage,
};
use crate::event::{EventHandle, LocalEventSystem};
use crate::exchange;
use crate::identity::{DistributedId, FieldId, IndexSpaceId, ShardId};

/// One field of one external instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub space: IndexSpaceId,
    pub field: FieldId,
    pub instance: DistributedId,
}

#[derive(Default, Serialize, Deserialize)]
struct FieldDescriptorSet {
    ready: BTreeSet<EventHandle>,
    // Keyed by contributing shard so redundant butterfly deliveries stay
    // idempotent.
    descriptors: BTreeMap<ShardId, Vec<FieldDescriptor>>,
}

impl FieldDescriptorSet {
    fn absorb(&mut self, incoming: FieldDescriptorSet) {
        self.ready.extend(incoming.ready);
        self.descriptors.extend(incoming.descriptors);
    }

    fn finish(self, events: &Arc<LocalEventSystem>) -> Result<(Vec<FieldDescriptor>, EventHandle)> {
        let merged = events.merge_events(self.ready.into_iter().collect())?;
        let descriptors = self
            .descriptors
            .into_values()
            .flatten()
            .collect();
        Ok((descriptors, merged))
    }
}

impl CollectivePayload for FieldDescriptorSet {
    const KIND: PayloadKind = PayloadKind::FieldDescriptorExchange;
}

impl ExchangePayload for FieldDescriptorSet {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        self.absorb(exchange::decode(&bytes)?);
        Ok(())
    }
}

// The gather reuses the same frame layout under its own kind byte.
#[derive(Default, Serialize, Deserialize)]
#[serde(transparent)]
struct GatheredDescriptors(FieldDescriptorSet);

impl CollectivePayload for GatheredDescriptors {
    const KIND: PayloadKind = PayloadKind::FieldDescriptorGather;
}

impl GatherPayload for GatheredDescriptors {
    fn pack_gather(&self) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_gather(&mut self, bytes: Bytes) -> Result<()> {
        let incoming: GatheredDescriptors = exchange::decode(&bytes)?;
        self.0.absorb(incoming.0);
        Ok(())
    }
}

/// All-gather of field descriptors; every shard extracts the union.
pub struct FieldDescriptorExchange {
    shard: ShardId,
    events: Arc<LocalEventSystem>,
    exchange: Arc<AllGather<FieldDescriptorSet>>,
}

impl FieldDescriptorExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("field_descriptor_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            shard: ctx.shard(),
            events: ctx.events().clone(),
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    /// Contribute this shard's descriptors and their readiness event.
    pub fn exchange(&self, descriptors: Vec<FieldDescriptor>, ready: EventHandle) -> Result<()> {
        let shard = self.shard;
        self.exchange.start(move |state| {
            if ready.exists() {
                state.ready.insert(ready);
            }
            state.descriptors.insert(shard, descriptors);
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    /// The union of all descriptors and one event covering every `ready`.
    pub fn extract(&self) -> Result<(Vec<FieldDescriptor>, EventHandle)> {
        self.exchange.take().finish(&self.events)
    }
}

/// Gather of field descriptors to one collecting shard.
pub struct FieldDescriptorGather {
    shard: ShardId,
    events: Arc<LocalEventSystem>,
    gather: Arc<Gather<GatheredDescriptors>>,
}

impl FieldDescriptorGather {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("field_descriptor_gather");

    pub fn new(ctx: &Arc<ReplicaContext>, target: ShardId) -> Result<Self> {
        Ok(Self {
            shard: ctx.shard(),
            events: ctx.events().clone(),
            gather: Gather::new(ctx, target, Self::LOCATION)?,
        })
    }

    pub fn contribute(&self, descriptors: Vec<FieldDescriptor>, ready: EventHandle) -> Result<()> {
        let shard = self.shard;
        self.gather.contribute(move |state| {
            if ready.exists() {
                state.0.ready.insert(ready);
            }
            state.0.descriptors.insert(shard, descriptors);
        })
    }

    /// Skip this collective; shards that attached nothing still have to
    /// participate in the tree unless every shard elides together.
    pub fn elide(&self) -> Result<()> {
        self.gather.elide()
    }

    pub fn done(&self) -> EventHandle {
        self.gather.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.gather.wait().await
    }

    pub fn extract(&self) -> Result<(Vec<FieldDescriptor>, EventHandle)> {
        self.gather.take().0.finish(&self.events)
    }
}
