// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exchange of non-empty cross-product partitions.
//!
//! Each shard computes a subset of the cross product and contributes the
//! index spaces for which its piece turned out non-empty, mapped to the
//! partition it created. The union tells every shard which subspaces exist
//! at all, without shipping the subspaces themselves.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collective::all_gather::AllGather;
use crate::collective::{
    CollectiveLocation, CollectivePayload, ExchangePayload, PayloadKind, ReplicaContext, Stage,
};
use crate::event::EventHandle;
use crate::exchange;
use crate::identity::{IndexPartitionId, IndexSpaceId};

#[derive(Default, Serialize, Deserialize)]
struct NonEmptyPieces {
    pieces: BTreeMap<IndexSpaceId, IndexPartitionId>,
}

impl CollectivePayload for NonEmptyPieces {
    const KIND: PayloadKind = PayloadKind::CrossProduct;
}

impl ExchangePayload for NonEmptyPieces {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        let incoming: NonEmptyPieces = exchange::decode(&bytes)?;
        self.pieces.extend(incoming.pieces);
        Ok(())
    }
}

/// All-gather of the non-empty pieces of a cross-product partition.
pub struct CrossProductExchange {
    exchange: Arc<AllGather<NonEmptyPieces>>,
}

impl CrossProductExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("cross_product_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    /// Contribute the locally non-empty pieces. An empty map is a valid
    /// contribution for shards whose slice produced nothing.
    pub fn exchange(&self, local: BTreeMap<IndexSpaceId, IndexPartitionId>) -> Result<()> {
        self.exchange.start(move |state| {
            state.pieces.extend(local);
        })
    }

    pub fn done(&self) -> EventHandle {
        self.exchange.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.exchange.wait().await
    }

    pub fn extract(&self) -> BTreeMap<IndexSpaceId, IndexPartitionId> {
        self.exchange.take().pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_keeps_all_contributors() {
        let mut a = NonEmptyPieces::default();
        a.pieces
            .insert(IndexSpaceId::new(1), IndexPartitionId::new(100));

        let mut b = NonEmptyPieces::default();
        b.pieces
            .insert(IndexSpaceId::new(2), IndexPartitionId::new(200));
        b.pieces
            .insert(IndexSpaceId::new(3), IndexPartitionId::new(300));

        let frame = a.pack_stage(Stage::Butterfly(0)).expect("pack");
        b.unpack_stage(Stage::Butterfly(0), frame).expect("unpack");
        assert_eq!(b.pieces.len(), 3);
        assert_eq!(b.pieces[&IndexSpaceId::new(1)], IndexPartitionId::new(100));

        // Merging the same frame twice is a no-op.
        let again = a.pack_stage(Stage::Butterfly(1)).expect("pack");
        b.unpack_stage(Stage::Butterfly(1), again).expect("unpack");
        assert_eq!(b.pieces.len(), 3);
    }

    #[test]
    fn empty_contribution_roundtrips() {
        let empty = NonEmptyPieces::default();
        let frame = empty.pack_stage(Stage::Butterfly(0)).expect("pack");
        let mut other = NonEmptyPieces::default();
        other
            .pieces
            .insert(IndexSpaceId::new(9), IndexPartitionId::new(90));
        other.unpack_stage(Stage::Butterfly(0), frame).expect("unpack");
        assert_eq!(other.pieces.len(), 1);
    }
}
