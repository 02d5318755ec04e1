// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-replication coordination for sharded task execution.
//!
//! A replicated operation runs one shard per slice of the machine, every
//! shard executing the same control logic. This crate keeps those shards in
//! lockstep: collective engines exchange what each shard contributed
//! ([`collective`], [`exchange`]), generational events order work across
//! nodes ([`event`]), and a per-node runtime with one shard manager per
//! operation routes all of it over a pluggable transport ([`runtime`],
//! [`manager`], [`transport`]).
//!
//! The single requirement on embedding code is that every shard of an
//! operation makes the same collective calls in the same order. Divergence
//! is detected and surfaced as [`manager::ReplicationError`] instead of
//! silent corruption.

pub use anyhow::{Error, Result};

pub mod collective;
pub mod config;
pub use config::LockstepConfig;
pub mod event;
pub mod exchange;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod runtime;
pub mod transport;

pub use collective::ReplicaContext;
pub use event::EventHandle;
pub use identity::{NodeId, ReplicationId, ShardId, ShardMapping};
pub use manager::{
    BarrierKind, MilestoneKind, OwnerObserver, ReplicationError, ShardLaunch, ShardManager,
    ShardSpawner,
};
pub use runtime::NodeRuntime;
pub use tokio_util::sync::CancellationToken;
