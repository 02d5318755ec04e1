// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exchange of inline-mapping decisions.
//!
//! Shards that inline-map a replicated region advertise which instance they
//! mapped and which fields of it they touch. With
//! [`check_mappings`](crate::config::LockstepConfig::check_mappings) set,
//! extraction additionally proves that no two shards claim overlapping
//! fields of one instance, which would be a silent data race.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::collective::all_gather::AllGather;
use crate::collective::{
    CollectiveLocation, CollectivePayload, ExchangePayload, PayloadKind, ReplicaContext, Stage,
};
use crate::event::EventHandle;
use crate::exchange;
use crate::identity::{DistributedId, FieldId, ShardId};
use crate::manager::ReplicationError;

/// Set of fields of one instance, one bit per field index. Only field ids
/// below [`FieldMask::BITS`] are representable; wider ids are rejected when
/// the mask is built, never folded onto low bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask(u64);

impl FieldMask {
    /// Field ids a mask can hold.
    pub const BITS: u32 = u64::BITS;

    pub const EMPTY: FieldMask = FieldMask(0);

    /// A mask of just `field`.
    pub fn single(field: FieldId) -> Result<Self, ReplicationError> {
        if field.as_u32() >= Self::BITS {
            return Err(ReplicationError::FieldOutOfRange(field));
        }
        Ok(Self(1 << field.as_u32()))
    }

    /// Folds `fields` into one mask, rejecting any id that does not fit.
    pub fn from_fields<I>(fields: I) -> Result<Self, ReplicationError>
    where
        I: IntoIterator<Item = FieldId>,
    {
        fields.into_iter().try_fold(Self::EMPTY, |mask, field| {
            Ok(mask.union(Self::single(field)?))
        })
    }

    pub fn union(self, other: FieldMask) -> Self {
        Self(self.0 | other.0)
    }

    pub fn overlaps(self, other: FieldMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct MappingClaims {
    claims: BTreeMap<DistributedId, BTreeMap<ShardId, FieldMask>>,
}

impl MappingClaims {
    fn absorb(&mut self, incoming: MappingClaims) {
        for (instance, shards) in incoming.claims {
            let held = self.claims.entry(instance).or_default();
            for (shard, mask) in shards {
                let entry = held.entry(shard).or_default();
                *entry = entry.union(mask);
            }
        }
    }
}

impl CollectivePayload for MappingClaims {
    const KIND: PayloadKind = PayloadKind::InlineMapping;
}

impl ExchangePayload for MappingClaims {
    fn pack_stage(&self, _stage: Stage) -> Result<Bytes> {
        exchange::encode(self)
    }

    fn unpack_stage(&mut self, _stage: Stage, bytes: Bytes) -> Result<()> {
        self.absorb(exchange::decode(&bytes)?);
        Ok(())
    }
}

/// All-gather of which instance fields each shard inline-mapped.
pub struct InlineMappingExchange {
    shard: ShardId,
    check_mappings: bool,
    exchange: Arc<AllGather<MappingClaims>>,
}

impl InlineMappingExchange {
    pub const LOCATION: CollectiveLocation = CollectiveLocation::new("inline_mapping_exchange");

    pub fn new(ctx: &Arc<ReplicaContext>) -> Result<Self> {
        Ok(Self {
            shard: ctx.shard(),
            check_mappings: ctx.config().check_mappings,
            exchange: AllGather::new(ctx, Self::LOCATION)?,
        })
    }

    /// Contribute the fields this shard mapped, per instance.
    pub fn exchange(&self, mappings: BTreeMap<DistributedId, FieldMask>) -> Result<()> {
        let shard = self.shard;
        self.exchange.start(move |state| {
            let incoming = MappingClaims {
                claims: mappings
                    .into_iter()
                    .map(|(instance, mask)| (instance, BTreeMap::from([(shard, mask)])))
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

    /// All claims, validated against cross-shard field overlap when
    /// `check_mappings` is on.
    pub fn extract(&self) -> Result<BTreeMap<DistributedId, BTreeMap<ShardId, FieldMask>>> {
        let state = self.exchange.take();
        if self.check_mappings {
            check_for_overlap(&state.claims)?;
        }
        Ok(state.claims)
    }
}

fn check_for_overlap(
    claims: &BTreeMap<DistributedId, BTreeMap<ShardId, FieldMask>>,
) -> Result<(), ReplicationError> {
    for (&instance, shards) in claims {
        let mut seen: Vec<(ShardId, FieldMask)> = Vec::with_capacity(shards.len());
        for (&shard_b, &mask) in shards {
            if let Some(&(shard_a, _)) = seen.iter().find(|(_, held)| held.overlaps(mask)) {
                return Err(ReplicationError::OverlappingFields {
                    instance,
                    shard_a,
                    shard_b,
                });
            }
            seen.push((shard_b, mask));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(fields: &[u32]) -> FieldMask {
        FieldMask::from_fields(fields.iter().map(|&f| FieldId::new(f))).expect("fields fit")
    }

    #[test]
    fn masks_union_and_overlap() {
        let a = mask(&[0, 3]);
        let b = mask(&[3, 5]);
        let c = mask(&[1, 2]);
        assert!(a.overlaps(b));
        assert!(!a.overlaps(c));
        assert_eq!(a.union(c), mask(&[0, 1, 2, 3]));
        assert!(FieldMask::EMPTY.is_empty());
        assert!(!FieldMask::EMPTY.overlaps(a));
    }

    #[test]
    fn fields_beyond_the_mask_width_are_rejected() {
        let err = FieldMask::single(FieldId::new(64)).expect_err("too wide");
        assert!(matches!(err, ReplicationError::FieldOutOfRange(f) if f == FieldId::new(64)));

        let fields = [FieldId::new(63), FieldId::new(64)];
        assert!(FieldMask::from_fields(fields).is_err());

        // The last representable field sets its own bit, nobody else's.
        let edge = FieldMask::single(FieldId::new(63)).expect("fits");
        assert!(!edge.overlaps(mask(&[0])));
    }

    #[test]
    fn disjoint_claims_pass_validation() {
        let mut claims = BTreeMap::new();
        claims.insert(
            DistributedId::new(10),
            BTreeMap::from([
                (ShardId::new(0), mask(&[0, 1])),
                (ShardId::new(1), mask(&[2, 3])),
            ]),
        );
        check_for_overlap(&claims).expect("disjoint");
    }

    #[test]
    fn overlap_names_instance_and_shards() {
        let mut claims = BTreeMap::new();
        claims.insert(
            DistributedId::new(10),
            BTreeMap::from([(ShardId::new(0), mask(&[0, 1]))]),
        );
        claims.insert(
            DistributedId::new(11),
            BTreeMap::from([
                (ShardId::new(0), mask(&[4])),
                (ShardId::new(2), mask(&[5])),
                (ShardId::new(3), mask(&[5, 6])),
            ]),
        );

        let err = check_for_overlap(&claims).expect_err("overlap");
        assert!(matches!(
            err,
            ReplicationError::OverlappingFields { instance, shard_a, shard_b }
                if instance == DistributedId::new(11)
                    && shard_a == ShardId::new(2)
                    && shard_b == ShardId::new(3)
        ));
    }

    #[test]
    fn claims_union_across_stages() {
        let mut state = MappingClaims::default();
        let mut frame = MappingClaims::default();
        frame.claims.insert(
            DistributedId::new(5),
            BTreeMap::from([(ShardId::new(1), mask(&[0]))]),
        );
        let bytes = frame.pack_stage(Stage::Butterfly(0)).expect("pack");
        state
            .unpack_stage(Stage::Butterfly(0), bytes.clone())
            .expect("unpack");
        state
            .unpack_stage(Stage::Butterfly(1), bytes)
            .expect("unpack again");

        let mut other = MappingClaims::default();
        other.claims.insert(
            DistributedId::new(5),
            BTreeMap::from([(ShardId::new(2), mask(&[1]))]),
        );
        let bytes = other.pack_stage(Stage::Butterfly(0)).expect("pack");
        state.unpack_stage(Stage::Butterfly(0), bytes).expect("unpack");

        assert_eq!(state.claims[&DistributedId::new(5)].len(), 2);
    }
}
