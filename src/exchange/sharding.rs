// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gather of per-shard sharding functor choices.
//!
//! Every shard asks its mapper which sharding functor to use for one
//! operation and reports the answer to the target shard. The mappers must
//! agree; the target validates that all collected choices are identical and
//! names the first disagreeing pair when they are not.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collective::gather::Gather;
use crate::collective::{
    CollectiveLocation, CollectivePayload, GatherPayload, PayloadKind, ReplicaContext,
};
use crate::event::EventHandle;
use crate::exchange;
use crate::identity::{ShardId, ShardingId};
use crate::manager::ReplicationError;

#[derive(Default, Serialize, Deserialize)]
struct ShardingChoices {
    choices: BTreeMap<ShardId, ShardingId>,
}

impl CollectivePayload for ShardingChoices {
    const KIND: PayloadKind = PayloadKind::ShardingGather;
}

impl GatherPayload for ShardingChoices {
    fn pack_gather(&self) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_gather(&mut self, bytes: Bytes) -> Result<()> {
        let incoming: ShardingChoices = exchange::decode(&bytes)?;
        self.choices.extend(incoming.choices);
        Ok(())
    }
}

/// Gather of sharding functor choices to one validating target.
pub struct ShardingGather {
    shard: ShardId,
    gather: Arc<Gather<ShardingChoices>>,
}

impl ShardingGather {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("sharding_gather");

    pub fn new(ctx: &Arc<ReplicaContext>, target: ShardId) -> Result<Self> {
        Ok(Self {
            shard: ctx.shard(),
            gather: Gather::new(ctx, target, Self::LOCATION)?,
        })
    }

    /// Report this shard's mapper choice.
    pub fn contribute(&self, choice: ShardingId) -> Result<()> {
        let shard = self.shard;
        self.gather.contribute(move |state| {
            state.choices.insert(shard, choice);
        })
    }

    pub fn done(&self) -> EventHandle {
        self.gather.done()
    }

    pub async fn wait(&self) -> Result<()> {
        self.gather.wait().await
    }

    /// Target side: the agreed functor, or the fatal mismatch.
    pub fn extract_validated(&self) -> Result<ShardingId> {
        let state = self.gather.take();
        validate_choices(&state.choices)
    }
}

fn validate_choices(choices: &BTreeMap<ShardId, ShardingId>) -> Result<ShardingId> {
    let mut choices = choices.iter();
    let Some((&shard_a, &functor_a)) = choices.next() else {
        anyhow::bail!("sharding gather completed without any choices");
    };
    for (&shard_b, &functor_b) in choices {
        if functor_b != functor_a {
            return Err(ReplicationError::ShardingMismatch {
                shard_a,
                functor_a,
                shard_b,
                functor_b,
            }
            .into());
        }
    }
    Ok(functor_a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_yields_the_functor() {
        let mut choices = BTreeMap::new();
        for shard in 0..4 {
            choices.insert(ShardId::new(shard), ShardingId::new(7));
        }
        assert_eq!(validate_choices(&choices).expect("agree"), ShardingId::new(7));
    }

    #[test]
    fn disagreement_names_both_shards() {
        let mut choices = BTreeMap::new();
        choices.insert(ShardId::new(0), ShardingId::new(7));
        choices.insert(ShardId::new(1), ShardingId::new(7));
        choices.insert(ShardId::new(2), ShardingId::new(9));

        let err = validate_choices(&choices).expect_err("mismatch");
        let err = err.downcast_ref::<ReplicationError>().expect("replication error");
        assert!(matches!(
            err,
            ReplicationError::ShardingMismatch {
                shard_a,
                shard_b,
                functor_b,
                ..
            } if *shard_a == ShardId::new(0)
                && *shard_b == ShardId::new(2)
                && *functor_b == ShardingId::new(9)
        ));
    }

    #[test]
    fn choices_roundtrip() {
        let mut a = ShardingChoices::default();
        a.choices.insert(ShardId::new(0), ShardingId::new(3));
        let frame = a.pack_gather().expect("pack");

        let mut b = ShardingChoices::default();
        b.choices.insert(ShardId::new(1), ShardingId::new(3));
        b.unpack_gather(frame).expect("unpack");
        assert_eq!(b.choices.len(), 2);
    }
}
