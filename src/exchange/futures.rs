// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collectives that move future values and future-map names between shards.
//!
//! Future payloads are opaque byte buffers. [`FutureBroadcast`] ships one
//! shard's value to everyone, [`FutureExchange`] all-gathers every shard's
//! value so each shard can fold them into one deterministic result, and
//! [`FutureNameExchange`] unions the distributed ids backing a replicated
//! future map.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collective::all_gather::AllGather;
use crate::collective::broadcast::Broadcast;
use crate::collective::{
    BroadcastPayload, CollectiveLocation, CollectivePayload, ExchangePayload, PayloadKind,
    ReplicaContext, Stage,
};
use crate::event::EventHandle;
use crate::exchange;
use crate::identity::{DistributedId, DomainPoint, ShardId};

#[derive(Default, Serialize, Deserialize)]
struct FutureValue {
    value: Option<ByteBuf>,
}

impl CollectivePayload for FutureValue {
    const KIND: PayloadKind = PayloadKind::FutureBroadcast;
}

impl BroadcastPayload for FutureValue {
    fn pack_broadcast(&mut self) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_broadcast(&mut self, bytes: Bytes) -> Result<()> {
        let incoming: FutureValue = exchange::decode(&bytes)?;
        self.value = incoming.value;
        Ok(())
    }
}

/// Broadcast of one shard's future value to every shard.
pub struct FutureBroadcast {
    broadcast: Arc<Broadcast<FutureValue>>,
}

impl FutureBroadcast {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("future_broadcast");

    pub fn new(ctx: &Arc<ReplicaContext>, origin: ShardId) -> Result<Self> {
        Ok(Self {
            broadcast: Broadcast::new(ctx, origin, Self::LOCATION)?,
        })
    }

    /// Origin side: publish the value. `None` is a completed but empty
    /// future.
    pub fn broadcast(&self, value: Option<Bytes>) -> Result<()> {
        self.broadcast.broadcast(FutureValue {
            value: value.map(|b| ByteBuf::from(b.to_vec())),
        })
    }

    pub fn done(&self) -> EventHandle {
        self.broadcast.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.broadcast.wait().await
    }

    pub fn extract(&self) -> Option<Bytes> {
        self.broadcast
            .take()
            .value
            .map(|b| Bytes::from(b.into_vec()))
    }
}

#[derive(Default, Serialize, Deserialize)]
struct FutureValues {
    values: BTreeMap<ShardId, ByteBuf>,
}

impl CollectivePayload for FutureValues {
    const KIND: PayloadKind = PayloadKind::FutureExchange;
}

impl ExchangePayload for FutureValues {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        let incoming: FutureValues = exchange::decode(&bytes)?;
        self.values.extend(incoming.values);
        Ok(())
    }
}

/// All-gather of every shard's future value, typically for an all-reduce of
/// task results.
pub struct FutureExchange {
    shard: ShardId,
    exchange: Arc<AllGather<FutureValues>>,
}

impl FutureExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("future_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            shard: ctx.shard(),
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    /// Contribute this shard's locally produced value.
    pub fn exchange(&self, value: Bytes) -> Result<()> {
        let shard = self.shard;
        self.exchange.start(move |state| {
            state.values.insert(shard, ByteBuf::from(value.to_vec()));
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    /// Every contributed value, keyed by shard.
    pub fn extract(&self) -> BTreeMap<ShardId, Bytes> {
        self.exchange
            .take()
            .values
            .into_iter()
            .map(|(shard, buf)| (shard, Bytes::from(buf.into_vec())))
            .collect()
    }

    /// Fold the contributed values in ascending shard order. Every shard
    /// folds in the same order, so a deterministic `fold` yields bitwise
    /// identical results everywhere.
    pub fn reduce(
        &self,
        mut fold: impl FnMut(Bytes, Bytes) -> Result<Bytes>,
    ) -> Result<Option<Bytes>> {
        let mut acc: Option<Bytes> = None;
        for (_, value) in self.extract() {
            acc = Some(match acc {
                None => value,
                Some(acc) => fold(acc, value)?,
            });
        }
        Ok(acc)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct FutureNames {
    names: BTreeMap<DomainPoint, DistributedId>,
}

impl FutureNames {
    fn absorb(&mut self, incoming: FutureNames) {
        for (point, id) in incoming.names {
            // A real id always beats the "no future here" placeholder.
            match self.names.get(&point) {
                Some(existing) if !existing.is_none() => {}
                _ => {
                    self.names.insert(point, id);
                }
            }
        }
    }
}

impl CollectivePayload for FutureNames {
    const KIND: PayloadKind = PayloadKind::FutureNameExchange;
}

impl ExchangePayload for FutureNames {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        self.absorb(exchange::decode(&bytes)?);
        Ok(())
    }
}

/// All-gather of the distributed ids backing a replicated future map.
pub struct FutureNameExchange {
    exchange: Arc<AllGather<FutureNames>>,
}

impl FutureNameExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("future_name_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    /// Contribute the ids of the futures this shard created.
    /// [`DistributedId::NONE`] marks a point whose future was never made.
    pub fn exchange(&self, names: BTreeMap<DomainPoint, DistributedId>) -> Result<()> {
        self.exchange.start(move |state| {
            state.absorb(FutureNames { names });
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    pub fn extract(&self) -> BTreeMap<DomainPoint, DistributedId> {
        self.exchange.take().names
    }
}
