// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collective coordination core.
//!
//! Shards of a replicated operation run the same program and construct the
//! same collectives in the same order. That call order is the only identity
//! a collective has: the n-th collective constructed on every shard is the
//! same logical collective, and its wire traffic carries the allocation
//! index plus a location tag so that call-order divergence across shards is
//! detected instead of silently corrupting an unrelated collective.
//!
//! This module holds the pieces shared by every collective engine:
//!
//! - [`CollectiveId`] / [`CollectiveLocation`]: call-order identity + tags.
//! - [`Stage`]: wire labels for tree hops, butterfly stages and the
//!   remainder exchange.
//! - [`CollectiveTopology`]: tree and butterfly math, computed once per
//!   context and shared by every collective in it.
//! - The payload capability traits ([`BroadcastPayload`], [`GatherPayload`],
//!   [`ExchangePayload`]) that the engines in [`broadcast`], [`gather`] and
//!   [`all_gather`] are generic over.
//! - [`ReplicaContext`]: per-shard registration, buffering of early
//!   arrivals, and delivery.

pub mod all_gather;
pub mod broadcast;
pub mod gather;
pub mod verify;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex as ParkingMutex;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::LockstepConfig;
use crate::event::{EventHandle, LocalEventSystem};
use crate::identity::{DistributedId, NodeId, ReplicationId, ShardId};
use crate::manager::ShardManager;

/// Allocation-site label of a collective. Two shards allocating their n-th
/// collective from different locations have diverged; the tag derived from
/// this label travels on the wire so the receiver can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveLocation {
    label: &'static str,
}

impl CollectiveLocation {
    pub const fn new(label: &'static str) -> Self {
        Self { label }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn tag(&self) -> u32 {
        xxh3_64(self.label.as_bytes()) as u32
    }
}

impl Display for CollectiveLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

/// Identity of one collective within one replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectiveId {
    /// Position in the context's allocation order. Identical on every shard
    /// for the same logical collective.
    pub index: u64,
    /// Tag of the allocation site, see [`CollectiveLocation`].
    pub tag: u32,
}

impl Display for CollectiveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "collective(index={}, tag={:#010x})", self.index, self.tag)
    }
}

/// Wire label of one hop of collective traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Broadcast or gather tree hop.
    Tree,
    /// Pre- or post-stage remainder hop of an all-gather.
    Remainder,
    /// Numbered butterfly stage of an all-gather.
    Butterfly(u32),
}

impl Stage {
    pub(crate) fn encode(self) -> i32 {
        match self {
            Stage::Tree => -2,
            Stage::Remainder => -1,
            Stage::Butterfly(stage) => stage as i32,
        }
    }

    pub(crate) fn decode(raw: i32) -> Option<Self> {
        match raw {
            -2 => Some(Stage::Tree),
            -1 => Some(Stage::Remainder),
            stage if stage >= 0 => Some(Stage::Butterfly(stage as u32)),
            _ => None,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Tree => f.write_str("tree"),
            Stage::Remainder => f.write_str("remainder"),
            Stage::Butterfly(stage) => write!(f, "stage {stage}"),
        }
    }
}

/// Discriminant of a collective payload, sealed into stage traffic by the
/// [`verify`] layer so that diverged shards fail loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    BarrierExchange = 0,
    ShardEventTree = 1,
    ShardSyncTree = 2,
    CrossProduct = 3,
    ShardingGather = 4,
    FieldDescriptorExchange = 5,
    FieldDescriptorGather = 6,
    FutureBroadcast = 7,
    FutureExchange = 8,
    FutureNameExchange = 9,
    MustEpochMappingBroadcast = 10,
    MustEpochMappingExchange = 11,
    MustEpochDependenceExchange = 12,
    MustEpochCompletionExchange = 13,
    InlineMapping = 14,
    /// Test-only payloads.
    Probe = 15,
}

impl PayloadKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::BarrierExchange),
            1 => Some(Self::ShardEventTree),
            2 => Some(Self::ShardSyncTree),
            3 => Some(Self::CrossProduct),
            4 => Some(Self::ShardingGather),
            5 => Some(Self::FieldDescriptorExchange),
            6 => Some(Self::FieldDescriptorGather),
            7 => Some(Self::FutureBroadcast),
            8 => Some(Self::FutureExchange),
            9 => Some(Self::FutureNameExchange),
            10 => Some(Self::MustEpochMappingBroadcast),
            11 => Some(Self::MustEpochMappingExchange),
            12 => Some(Self::MustEpochDependenceExchange),
            13 => Some(Self::MustEpochCompletionExchange),
            14 => Some(Self::InlineMapping),
            15 => Some(Self::Probe),
            _ => None,
        }
    }
}

/// Base capability of every collective payload.
pub trait CollectivePayload: Default + Send + 'static {
    const KIND: PayloadKind;
}

/// State that travels down a broadcast tree.
pub trait BroadcastPayload: CollectivePayload {
    /// Serialize the state to forward along one tree edge. Takes `&mut
    /// self` so payloads that mint a fresh value per edge can do so.
    fn pack_broadcast(&mut self) -> Result<Bytes>;

    fn unpack_broadcast(&mut self, bytes: Bytes) -> Result<()>;
}

/// State that flows up a gather tree.
pub trait GatherPayload: CollectivePayload {
    fn pack_gather(&self) -> Result<Bytes>;

    /// Merge one contribution into the local state. Must be an idempotent
    /// union.
    fn unpack_gather(&mut self, bytes: Bytes) -> Result<()>;
}

/// State exchanged through the all-gather butterfly.
pub trait ExchangePayload: CollectivePayload {
    /// Serialize the full accumulated state for one stage.
    fn pack_stage(&self, stage: Stage) -> Result<Bytes>;

    /// Merge a partner's accumulated state. Must be commutative and
    /// idempotent: stages of an asynchronous butterfly overlap, and the
    /// same contribution can arrive through several partners.
    fn unpack_stage(&mut self, stage: Stage, bytes: Bytes) -> Result<()>;
}

/// Tree and butterfly shape shared by every collective of one replicated
/// operation. All quantities are in relabeled index space.
#[derive(Debug, Clone)]
pub struct CollectiveTopology {
    total: u32,
    radix: u32,
    exchange_radix: u32,
    log_radix: u32,
    participating: u32,
    stages: u32,
    last_radix: u32,
}

impl CollectiveTopology {
    pub fn new(total: u32, radix: u32) -> Self {
        debug_assert!(total >= 1);
        debug_assert!(radix >= 2);
        // Butterfly stages partner by XOR, so the exchange radix is the
        // configured radix rounded down to a power of two.
        let exchange_radix = (1u32 << (31 - radix.leading_zeros())).max(2);
        let log_radix = exchange_radix.trailing_zeros();
        let participating = 1u32 << (31 - total.leading_zeros());
        let log_total = participating.trailing_zeros();
        let stages = log_total.div_ceil(log_radix);
        let last_radix = if stages == 0 {
            0
        } else {
            participating >> ((stages - 1) * log_radix)
        };
        Self {
            total,
            radix,
            exchange_radix,
            log_radix,
            participating,
            stages,
            last_radix,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn radix(&self) -> u32 {
        self.radix
    }

    /// Largest power of two not above `total`; indices below it run the
    /// butterfly, indices at or above it are remainder shards.
    pub fn participating(&self) -> u32 {
        self.participating
    }

    pub fn stage_count(&self) -> u32 {
        self.stages
    }

    pub fn is_participant(&self, index: u32) -> bool {
        index < self.participating
    }

    /// Number of shards in each partner group of `stage`. The final stage
    /// covers whatever bits the earlier stages left over.
    pub fn stage_radix(&self, stage: u32) -> u32 {
        debug_assert!(stage < self.stages);
        if stage + 1 == self.stages {
            self.last_radix
        } else {
            self.exchange_radix
        }
    }

    /// Butterfly partners of `index` at `stage`.
    pub fn stage_partners(&self, index: u32, stage: u32) -> Vec<u32> {
        debug_assert!(self.is_participant(index));
        (1..self.stage_radix(stage))
            .map(|r| index ^ (r << (stage * self.log_radix)))
            .collect()
    }

    /// Whether participant `index` pairs with a remainder shard.
    pub fn expects_remainder(&self, index: u32) -> bool {
        debug_assert!(self.is_participant(index));
        (index as u64 + self.participating as u64) < self.total as u64
    }

    /// The participant a remainder shard exchanges with.
    pub fn remainder_partner(&self, index: u32) -> u32 {
        debug_assert!(!self.is_participant(index));
        index - self.participating
    }

    pub fn tree_parent(&self, index: u32) -> Option<u32> {
        (index != 0).then(|| (index - 1) / self.radix)
    }

    pub fn tree_children(&self, index: u32) -> Vec<u32> {
        let mut children = Vec::new();
        for r in 1..=self.radix as u64 {
            let child = index as u64 * self.radix as u64 + r;
            if child >= self.total as u64 {
                break;
            }
            children.push(child as u32);
        }
        children
    }
}

/// Receiving side of a registered collective.
pub(crate) trait CollectiveInbox: Send + Sync + 'static {
    fn handle_stage(&self, stage: Stage, payload: Bytes);

    /// Fatal divergence detected outside the collective's own protocol.
    fn poison(&self, reason: String);
}

/// Requests routed to a shard that are answered by the embedding task
/// system rather than by a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRequest {
    FutureMap { source: NodeId },
    EquivalenceSet { source: NodeId },
    TopView { instance: DistributedId, requestor: ShardId },
}

pub trait RequestHandler: Send + Sync + 'static {
    fn handle_request(&self, request: ShardRequest, payload: Bytes);
}

struct InboxEntry {
    tag: u32,
    inbox: Arc<dyn CollectiveInbox>,
}

struct PendingStage {
    tag: u32,
    stage: Stage,
    payload: Bytes,
}

#[derive(Default)]
struct RequestSlot {
    handler: Option<Arc<dyn RequestHandler>>,
    pending: Vec<(ShardRequest, Bytes)>,
}

/// Per-shard collective context.
///
/// Owns the monotone collective allocation counter, the inbox registry and
/// the buffer for traffic that arrives before its collective is
/// constructed. One exists per local shard of each replicated operation.
pub struct ReplicaContext {
    replication: ReplicationId,
    shard: ShardId,
    manager: Weak<ShardManager>,
    events: Arc<LocalEventSystem>,
    config: Arc<LockstepConfig>,
    topology: Arc<CollectiveTopology>,
    next_index: AtomicU64,
    inboxes: DashMap<u64, InboxEntry>,
    pending: ParkingMutex<HashMap<u64, Vec<PendingStage>>>,
    requests: ParkingMutex<RequestSlot>,
}

impl ReplicaContext {
    pub(crate) fn new(
        replication: ReplicationId,
        shard: ShardId,
        manager: Weak<ShardManager>,
        events: Arc<LocalEventSystem>,
        config: Arc<LockstepConfig>,
        topology: Arc<CollectiveTopology>,
    ) -> Arc<Self> {
        Arc::new(Self {
            replication,
            shard,
            manager,
            events,
            config,
            topology,
            next_index: AtomicU64::new(0),
            inboxes: DashMap::new(),
            pending: ParkingMutex::new(HashMap::new()),
            requests: ParkingMutex::new(RequestSlot::default()),
        })
    }

    pub fn replication(&self) -> ReplicationId {
        self.replication
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn total_shards(&self) -> u32 {
        self.topology.total()
    }

    pub fn topology(&self) -> Arc<CollectiveTopology> {
        self.topology.clone()
    }

    pub fn events(&self) -> &Arc<LocalEventSystem> {
        &self.events
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    /// This shard's index in the relabeled space rooted at `origin`.
    pub fn relative_index(&self, origin: ShardId) -> u32 {
        let total = self.topology.total() as u64;
        ((self.shard.as_u32() as u64 + total - origin.as_u32() as u64) % total) as u32
    }

    /// Inverse of [`relative_index`](Self::relative_index).
    pub fn absolute_shard(&self, index: u32, origin: ShardId) -> ShardId {
        let total = self.topology.total() as u64;
        ShardId::new(((index as u64 + origin.as_u32() as u64) % total) as u32)
    }

    /// Allocates the next collective id. Shards of one operation must call
    /// this in the same order; the location tag lets receivers detect when
    /// they have not.
    pub fn allocate(&self, location: CollectiveLocation) -> CollectiveId {
        CollectiveId {
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            tag: location.tag(),
        }
    }

    pub(crate) fn register(&self, id: CollectiveId, inbox: Arc<dyn CollectiveInbox>) {
        let replaced = self
            .inboxes
            .insert(
                id.index,
                InboxEntry {
                    tag: id.tag,
                    inbox: inbox.clone(),
                },
            )
            .is_some();
        debug_assert!(!replaced, "{id} registered twice");

        let buffered = self.pending.lock().remove(&id.index).unwrap_or_default();
        for stage in buffered {
            if stage.tag != id.tag {
                self.report_tag_divergence(id, stage.tag, &inbox);
                continue;
            }
            inbox.handle_stage(stage.stage, stage.payload);
        }
    }

    pub(crate) fn unregister(&self, id: CollectiveId) {
        self.inboxes.remove(&id.index);
    }

    /// Hands one stage of traffic to its collective, buffering it when the
    /// collective has not been constructed yet.
    pub(crate) fn deliver_collective(&self, id: CollectiveId, stage: Stage, payload: Bytes) {
        let registered = self
            .inboxes
            .get(&id.index)
            .map(|entry| (entry.inbox.clone(), entry.tag));
        // The registry guard is released before dispatching: handlers send
        // and may construct further collectives on this context.
        match registered {
            Some((inbox, local_tag)) if local_tag == id.tag => {
                inbox.handle_stage(stage, payload);
            }
            Some((inbox, local_tag)) => {
                self.report_tag_divergence(
                    CollectiveId {
                        index: id.index,
                        tag: local_tag,
                    },
                    id.tag,
                    &inbox,
                );
            }
            None => {
                trace!(
                    repl = %self.replication,
                    shard = %self.shard,
                    collective = %id,
                    %stage,
                    "buffering stage for unconstructed collective"
                );
                self.pending.lock().entry(id.index).or_default().push(PendingStage {
                    tag: id.tag,
                    stage,
                    payload,
                });
            }
        }
    }

    fn report_tag_divergence(
        &self,
        local: CollectiveId,
        remote_tag: u32,
        inbox: &Arc<dyn CollectiveInbox>,
    ) {
        let error = crate::manager::ReplicationError::TagDivergence {
            index: local.index,
            local_tag: local.tag,
            remote_tag,
        };
        error!(
            repl = %self.replication,
            shard = %self.shard,
            "{error}"
        );
        inbox.poison(error.to_string());
    }

    /// Sends one stage of traffic to another shard of the same operation.
    pub(crate) fn send_stage(
        &self,
        target: ShardId,
        id: CollectiveId,
        stage: Stage,
        payload: Bytes,
    ) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow!("replication {} already destroyed", self.replication))?;
        trace!(
            repl = %self.replication,
            shard = %self.shard,
            collective = %id,
            %stage,
            %target,
            "sending collective stage"
        );
        manager.route_collective(target, id, stage, payload)
    }

    /// Completes an event whose owner may be another node. Local owners are
    /// completed directly; remote owners go through the manager's link.
    pub(crate) fn complete_event(&self, handle: EventHandle, poison: Option<String>) -> Result<()> {
        if handle.owner() == self.events.node() {
            return match poison {
                None => self.events.trigger(handle),
                Some(reason) => self.events.poison(handle, reason),
            };
        }
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow!("replication {} already destroyed", self.replication))?;
        manager.complete_remote_event(handle, poison)
    }

    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        let drained = {
            let mut slot = self.requests.lock();
            slot.handler = Some(handler.clone());
            std::mem::take(&mut slot.pending)
        };
        for (request, payload) in drained {
            handler.handle_request(request, payload);
        }
    }

    pub(crate) fn deliver_request(&self, request: ShardRequest, payload: Bytes) {
        let handler = {
            let mut slot = self.requests.lock();
            match slot.handler.clone() {
                Some(handler) => Some(handler),
                None => {
                    slot.pending.push((request, payload.clone()));
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler.handle_request(request, payload);
        }
    }
}
