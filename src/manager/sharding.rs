// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sharding functors: the pluggable map from index-space points to shards.
//!
//! Functors are registered once per node in a [`ShardingRegistry`] and are
//! pure: every shard evaluating the same functor over the same point must
//! get the same answer, which is what [`ShardingGather`]
//! (`crate::exchange::sharding::ShardingGather`) validates. Each manager
//! caches the functions it constructs so the registry lock is off the hot
//! path.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::identity::{DomainPoint, ShardId, ShardingId};

/// Registered by default under [`CYCLIC_SHARDING_ID`].
pub const CYCLIC_SHARDING_ID: ShardingId = ShardingId::new(0);

/// Maps points of a launch domain onto shards.
pub trait ShardingFunctor: Send + Sync + 'static {
    fn shard(&self, point: &DomainPoint, total_shards: u32) -> ShardId;
}

/// A functor bound to one replicated operation's shard count.
#[derive(Clone)]
pub struct ShardingFunction {
    id: ShardingId,
    total_shards: u32,
    functor: Arc<dyn ShardingFunctor>,
}

impl ShardingFunction {
    fn new(id: ShardingId, total_shards: u32, functor: Arc<dyn ShardingFunctor>) -> Self {
        Self {
            id,
            total_shards,
            functor,
        }
    }

    pub fn id(&self) -> ShardingId {
        self.id
    }

    pub fn shard(&self, point: &DomainPoint) -> ShardId {
        let shard = self.functor.shard(point, self.total_shards);
        debug_assert!(shard.as_u32() < self.total_shards);
        shard
    }
}

impl fmt::Debug for ShardingFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardingFunction")
            .field("id", &self.id)
            .field("total_shards", &self.total_shards)
            .finish_non_exhaustive()
    }
}

/// Round-robin assignment by point linearization.
///
/// Coordinates are folded row-major with a fixed 2^32 extent per dimension,
/// so the answer depends only on the point itself and is identical on every
/// shard.
pub struct CyclicShardingFunctor;

impl ShardingFunctor for CyclicShardingFunctor {
    fn shard(&self, point: &DomainPoint, total_shards: u32) -> ShardId {
        let linear = point
            .coords()
            .iter()
            .fold(0i128, |acc, &c| (acc << 32).wrapping_add(c as i128));
        ShardId::new(linear.rem_euclid(total_shards.max(1) as i128) as u32)
    }
}

/// Per-node table of registered functors.
pub struct ShardingRegistry {
    functors: RwLock<HashMap<ShardingId, Arc<dyn ShardingFunctor>>>,
}

impl Default for ShardingRegistry {
    fn default() -> Self {
        let registry = Self {
            functors: RwLock::new(HashMap::new()),
        };
        registry
            .functors
            .write()
            .insert(CYCLIC_SHARDING_ID, Arc::new(CyclicShardingFunctor));
        registry
    }
}

impl ShardingRegistry {
    /// Registers a functor. Ids must be unique and must be registered with
    /// the same semantics on every node.
    pub fn register(&self, id: ShardingId, functor: Arc<dyn ShardingFunctor>) -> Result<()> {
        let mut functors = self.functors.write();
        if functors.contains_key(&id) {
            anyhow::bail!("sharding functor {id} already registered");
        }
        functors.insert(id, functor);
        Ok(())
    }

    pub fn lookup(&self, id: ShardingId) -> Option<Arc<dyn ShardingFunctor>> {
        self.functors.read().get(&id).cloned()
    }
}

/// Double-checked per-manager cache of constructed sharding functions.
pub(crate) struct ShardingCache {
    total_shards: u32,
    functions: RwLock<HashMap<ShardingId, ShardingFunction>>,
}

impl ShardingCache {
    pub(crate) fn new(total_shards: u32) -> Self {
        Self {
            total_shards,
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Optimistic read; on miss, re-check under the write lock before
    /// constructing so concurrent misses build the function once.
    pub(crate) fn get_or_build(
        &self,
        id: ShardingId,
        lookup: impl FnOnce() -> Result<Arc<dyn ShardingFunctor>>,
    ) -> Result<ShardingFunction> {
        if let Some(function) = self.functions.read().get(&id) {
            return Ok(function.clone());
        }
        let mut functions = self.functions.write();
        if let Some(function) = functions.get(&id) {
            return Ok(function.clone());
        }
        let function = ShardingFunction::new(id, self.total_shards, lookup()?);
        functions.insert(id, function.clone());
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn cyclic_covers_shards_evenly() {
        let functor = CyclicShardingFunctor;
        let mut counts = [0u32; 4];
        for i in 0..64 {
            let shard = functor.shard(&DomainPoint::from(i), 4);
            counts[shard.as_u32() as usize] += 1;
        }
        assert_eq!(counts, [16; 4]);
    }

    #[test]
    fn cyclic_handles_negative_and_multidim_points() {
        let functor = CyclicShardingFunctor;
        let shard = functor.shard(&DomainPoint::from(-1), 4);
        assert!(shard.as_u32() < 4);

        let a = functor.shard(&DomainPoint::from([2, 5]), 3);
        let b = functor.shard(&DomainPoint::from([2, 5]), 3);
        assert_eq!(a, b);
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let registry = ShardingRegistry::default();
        assert!(registry.lookup(CYCLIC_SHARDING_ID).is_some());
        assert!(
            registry
                .register(CYCLIC_SHARDING_ID, Arc::new(CyclicShardingFunctor))
                .is_err()
        );

        registry
            .register(ShardingId::new(7), Arc::new(CyclicShardingFunctor))
            .expect("fresh id");
        assert!(registry.lookup(ShardingId::new(7)).is_some());
    }

    #[test]
    fn cache_builds_each_function_once() {
        let cache = ShardingCache::new(8);
        let builds = AtomicU32::new(0);
        for _ in 0..3 {
            let function = cache
                .get_or_build(ShardingId::new(2), || {
                    builds.fetch_add(1, Ordering::Relaxed);
                    Ok(Arc::new(CyclicShardingFunctor) as Arc<dyn ShardingFunctor>)
                })
                .expect("build");
            assert_eq!(function.id(), ShardingId::new(2));
            assert_eq!(function.shard(&DomainPoint::from(11)), ShardId::new(3));
        }
        assert_eq!(builds.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn function_debug_elides_the_functor() {
        let cache = ShardingCache::new(4);
        let function = cache
            .get_or_build(CYCLIC_SHARDING_ID, || {
                Ok(Arc::new(CyclicShardingFunctor) as Arc<dyn ShardingFunctor>)
            })
            .expect("build");
        let shown = format!("{function:?}");
        assert!(shown.starts_with("ShardingFunction"));
        assert!(shown.contains("total_shards: 4"));
        assert!(shown.ends_with(".. }"));
    }

    #[test]
    fn cache_propagates_lookup_failures() {
        let cache = ShardingCache::new(2);
        let err = cache
            .get_or_build(ShardingId::new(9), || anyhow::bail!("no such functor"))
            .expect_err("missing");
        assert!(err.to_string().contains("no such functor"));
    }
}
