// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identity types shared across the crate.
//!
//! Everything here is a small, copyable value that can travel on the wire:
//! shard and node identifiers, the id of one replicated execution, and the
//! immutable shard-to-node placement table published by the owner.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($repr:ty), $as_fn:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            pub const fn $as_fn(&self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype! {
    /// Zero-based index of one shard within a replicated execution,
    /// in `[0, total_shards)`.
    ShardId(u32), as_u32
}

id_newtype! {
    /// Identifies one participating node (address space) in the cluster.
    NodeId(u32), as_u32
}

id_newtype! {
    /// Process-unique identifier of one replicated operation. All traffic
    /// belonging to that operation carries this id. The value 0 is reserved
    /// for node-level control messages.
    ReplicationId(u64), as_u64
}

id_newtype! {
    /// Identifier of a registered sharding functor.
    ShardingId(u64), as_u64
}

id_newtype! {
    /// Identifier of a field within a field space.
    FieldId(u32), as_u32
}

id_newtype! {
    /// Identifier of an index space.
    IndexSpaceId(u64), as_u64
}

id_newtype! {
    /// Identifier of an index partition.
    IndexPartitionId(u64), as_u64
}

id_newtype! {
    /// Identifier of a named barrier, unique within one replicated
    /// operation.
    BarrierId(u64), as_u64
}

id_newtype! {
    /// Identifier of a processor a point task can be assigned to.
    ProcessorId(u64), as_u64
}

/// Cluster-unique identifier of a distributed object (instance, future,
/// view). The value 0 encodes "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributedId(u64);

impl DistributedId {
    pub const NONE: DistributedId = DistributedId(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DistributedId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A point in an index-space domain. Dimensionality is carried by the
/// coordinate vector; points of different dimensionality never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainPoint(Vec<i64>);

impl DomainPoint {
    pub fn new(coords: Vec<i64>) -> Self {
        Self(coords)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn coords(&self) -> &[i64] {
        &self.0
    }
}

impl From<i64> for DomainPoint {
    fn from(c: i64) -> Self {
        Self(vec![c])
    }
}

impl<const N: usize> From<[i64; N]> for DomainPoint {
    fn from(coords: [i64; N]) -> Self {
        Self(coords.to_vec())
    }
}

impl fmt::Display for DomainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}

/// Immutable table mapping every shard of a replicated execution to the node
/// that hosts it. Published once by the owner, shipped to every constituent
/// node, and shared by reference from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMapping {
    nodes: Vec<NodeId>,
}

impl ShardMapping {
    /// Build a mapping from a dense `ShardId -> NodeId` table. Index `i` of
    /// the slice is the placement of shard `i`.
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self { nodes }
    }

    pub fn total_shards(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn node_of(&self, shard: ShardId) -> NodeId {
        debug_assert!((shard.as_u32() as usize) < self.nodes.len());
        self.nodes[shard.as_u32() as usize]
    }

    /// Shards hosted on `node`, in ascending shard order.
    pub fn shards_on(&self, node: NodeId) -> Vec<ShardId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == node)
            .map(|(i, _)| ShardId::new(i as u32))
            .collect()
    }

    /// Distinct nodes hosting at least one shard, in ascending node order.
    pub fn constituent_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.nodes.clone();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Constituent nodes other than `node`.
    pub fn remote_nodes(&self, node: NodeId) -> Vec<NodeId> {
        self.constituent_nodes()
            .into_iter()
            .filter(|n| *n != node)
            .collect()
    }

    pub fn hosts_shards(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}
