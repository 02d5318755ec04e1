// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exchange of application barrier windows.
//!
//! Shards pre-allocate barriers in windows: shard `s` creates the barriers
//! at window indices `i` with `i % total == s`, then all shards exchange
//! their slices so everyone holds the full window. Shards disagreeing on
//! the window size is a configuration divergence and fails the exchange.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collective::all_gather::AllGather;
use crate::collective::{CollectiveLocation, CollectivePayload, ExchangePayload, PayloadKind,
    ReplicaContext, Stage};
use crate::event::EventHandle;
use crate::event::barrier::BarrierDescriptor;
use crate::exchange;
use crate::identity::ShardId;
use crate::manager::ReplicationError;

#[derive(Default, Serialize, Deserialize)]
struct BarrierWindow {
    windows: BTreeMap<ShardId, u64>,
    slots: BTreeMap<u64, BarrierDescriptor>,
}

impl CollectivePayload for BarrierWindow {
    const KIND: PayloadKind = PayloadKind::BarrierExchange;
}

impl ExchangePayload for BarrierWindow {
    fn pack_stage(&self, _stage: Stage) -> Result<bytes::Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: bytes::Bytes) -> Result<()> {
        let incoming: BarrierWindow = exchange::decode(&bytes)?;
        self.windows.extend(incoming.windows);
        self.slots.extend(incoming.slots);
        Ok(())
    }
}

/// All-gather of one window of barrier descriptors.
pub struct BarrierExchange {
    shard: ShardId,
    exchange: Arc<AllGather<BarrierWindow>>,
}

impl BarrierExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("barrier_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            shard: ctx.shard(),
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    /// Window indices `shard` is responsible for creating.
    pub fn owned_indices(
        shard: ShardId,
        total: u32,
        window: u64,
    ) -> impl Iterator<Item = u64> {
        (0..window).filter(move |index| index % total as u64 == shard.as_u32() as u64)
    }

    /// Contribute this shard's slice of the window.
    pub fn exchange(
        &self,
        window: u64,
        slice: BTreeMap<u64, BarrierDescriptor>,
    ) -> Result<()> {
        let shard = self.shard;
        self.exchange.start(move |state| {
            state.windows.insert(shard, window);
            state.slots.extend(slice);
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    /// The complete window. Fails when shards exchanged different window
    /// sizes.
    pub fn extract(&self) -> Result<BTreeMap<u64, BarrierDescriptor>> {
        let state = self.exchange.take();
        validate_windows(&state.windows)?;
        debug_assert_eq!(
            state.slots.len() as u64,
            state.windows.values().next().copied().unwrap_or(0)
        );
        Ok(state.slots)
    }
}

fn validate_windows(windows: &BTreeMap<ShardId, u64>) -> Result<(), ReplicationError> {
    let mut windows = windows.iter();
    if let Some((&shard_a, &size_a)) = windows.next() {
        for (&shard_b, &size_b) in windows {
            if size_b != size_a {
                return Err(ReplicationError::BarrierWindowMismatch {
                    shard_a,
                    size_a,
                    shard_b,
                    size_b,
                });
            }
        }
    }
    Ok(())
}
