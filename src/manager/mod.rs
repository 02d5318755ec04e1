// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The shard manager: one instance per replicated operation per node.
//!
//! The manager owns the node-local view of a replicated execution. It holds
//! the shard-to-node mapping, a [`ReplicaContext`] for every local shard,
//! the named barrier set, and the milestone accounting that aggregates
//! per-shard lifecycle reports into whole-operation transitions. All
//! cross-node traffic of the operation funnels through here in both
//! directions: outbound through the [`NodeLink`], inbound from the node
//! runtime's dispatch loop.
//!
//! Exactly one node owns each replicated operation. The owner allocates the
//! barriers, counts remote milestone reports, and is the only place the
//! milestone events and the [`OwnerObserver`] callback fire.

pub mod sharding;

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use derive_builder::Builder;
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

use crate::collective::{
    CollectiveId, CollectiveTopology, PayloadKind, ReplicaContext, ShardRequest, Stage,
};
use crate::event::barrier::{BarrierDescriptor, BarrierReduction, ShardBarrier};
use crate::event::{EventHandle, Generation, LocalEvent, LocalEventSystem};
use crate::exchange;
use crate::identity::{
    BarrierId, DistributedId, FieldId, NodeId, ReplicationId, ShardId, ShardMapping, ShardingId,
};
use crate::runtime::NodeRuntime;
use crate::transport::{Envelope, Message, NodeLink};

use sharding::{ShardingCache, ShardingFunction};

/// A divergence between shards that should have acted identically, or
/// between a shard and the cluster-wide tables. Every variant is fatal for
/// the replicated operation: control replication only works while all
/// shards make the same calls in the same order.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error(
        "collective {index} allocated from diverging call sites \
         (local tag {local_tag:#010x}, remote tag {remote_tag:#010x})"
    )]
    TagDivergence {
        index: u64,
        local_tag: u32,
        remote_tag: u32,
    },

    #[error("collective stage sealed as kind {found} where {expected:?} was expected")]
    KindDivergence { expected: PayloadKind, found: u8 },

    #[error("collective stage checksum {computed:#018x} does not match recorded {recorded:#018x}")]
    ChecksumDivergence { recorded: u64, computed: u64 },

    #[error("sealed frame of {len} bytes is too short to carry a {expected:?} stage")]
    SealTruncated { expected: PayloadKind, len: usize },

    #[error(
        "shards disagree on the sharding functor: \
         shard {shard_a} chose {functor_a}, shard {shard_b} chose {functor_b}"
    )]
    ShardingMismatch {
        shard_a: ShardId,
        functor_a: ShardingId,
        shard_b: ShardId,
        functor_b: ShardingId,
    },

    #[error(
        "shards disagree on the barrier window size: \
         shard {shard_a} advertises {size_a}, shard {shard_b} advertises {size_b}"
    )]
    BarrierWindowMismatch {
        shard_a: ShardId,
        size_a: u64,
        shard_b: ShardId,
        size_b: u64,
    },

    #[error("shards {shard_a} and {shard_b} both mapped fields of instance {instance}")]
    OverlappingFields {
        instance: DistributedId,
        shard_a: ShardId,
        shard_b: ShardId,
    },

    #[error("field {0} does not fit a 64-bit mapping claim mask")]
    FieldOutOfRange(FieldId),

    #[error("no sharding functor registered under id {0}")]
    UnknownFunctor(ShardingId),
}

/// Lifecycle milestones a shard reports to its manager. Each one fires for
/// the whole operation once every shard has reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MilestoneKind {
    /// All point tasks of the shard are mapped.
    Mapped = 0,
    /// The shard's task body has finished running.
    Executed = 1,
    /// The shard's effects are complete and its result is known.
    Complete = 2,
    /// The shard has committed and can be reclaimed.
    Commit = 3,
}

impl MilestoneKind {
    pub const ALL: [MilestoneKind; 4] = [
        MilestoneKind::Mapped,
        MilestoneKind::Executed,
        MilestoneKind::Complete,
        MilestoneKind::Commit,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Mapped),
            1 => Some(Self::Executed),
            2 => Some(Self::Complete),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

impl fmt::Display for MilestoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MilestoneKind::Mapped => "mapped",
            MilestoneKind::Executed => "executed",
            MilestoneKind::Complete => "complete",
            MilestoneKind::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Coarse lifecycle of one replicated operation on one node. Advances
/// monotonically; milestone completion drives the later transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReplicationState {
    Constructing,
    Launching,
    Mapping,
    Executing,
    Completing,
    Committing,
    Destroyed,
}

/// The named barriers every replicated operation carries. Each serializes
/// one class of side effect across all shards; all have one arrival per
/// shard per generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    /// All shards constructed and ready to map.
    Startup,
    /// Deferred partition operations flushed.
    PendingPartition,
    /// Future map entries visible on every shard.
    FutureMap,
    /// Resource creation visible everywhere.
    Creation,
    /// Resource deletion safe everywhere.
    Deletion,
    /// Inline mapping claims exchanged.
    InlineMapping,
    /// External resource attach/detach ordered.
    ExternalResource,
    /// Fence between mapping epochs.
    MappingFence,
    /// Fence between execution epochs.
    ExecutionFence,
}

impl BarrierKind {
    pub const ALL: [BarrierKind; 9] = [
        BarrierKind::Startup,
        BarrierKind::PendingPartition,
        BarrierKind::FutureMap,
        BarrierKind::Creation,
        BarrierKind::Deletion,
        BarrierKind::InlineMapping,
        BarrierKind::ExternalResource,
        BarrierKind::MappingFence,
        BarrierKind::ExecutionFence,
    ];
}

impl fmt::Display for BarrierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BarrierKind::Startup => "startup",
            BarrierKind::PendingPartition => "pending_partition",
            BarrierKind::FutureMap => "future_map",
            BarrierKind::Creation => "creation",
            BarrierKind::Deletion => "deletion",
            BarrierKind::InlineMapping => "inline_mapping",
            BarrierKind::ExternalResource => "external_resource",
            BarrierKind::MappingFence => "mapping_fence",
            BarrierKind::ExecutionFence => "execution_fence",
        };
        f.write_str(name)
    }
}

/// Descriptors of the full barrier set, allocated by the owner and shipped
/// to every constituent node in the startup payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierDescriptors {
    startup: BarrierDescriptor,
    pending_partition: BarrierDescriptor,
    future_map: BarrierDescriptor,
    creation: BarrierDescriptor,
    deletion: BarrierDescriptor,
    inline_mapping: BarrierDescriptor,
    external_resource: BarrierDescriptor,
    mapping_fence: BarrierDescriptor,
    execution_fence: BarrierDescriptor,
}

impl BarrierDescriptors {
    fn allocate(owner: NodeId, arrivals: u32) -> Self {
        let mut next = 0u64;
        let mut descriptor = || {
            next += 1;
            BarrierDescriptor {
                id: BarrierId::new(next),
                owner,
                arrivals,
            }
        };
        Self {
            startup: descriptor(),
            pending_partition: descriptor(),
            future_map: descriptor(),
            creation: descriptor(),
            deletion: descriptor(),
            inline_mapping: descriptor(),
            external_resource: descriptor(),
            mapping_fence: descriptor(),
            execution_fence: descriptor(),
        }
    }

    pub fn get(&self, kind: BarrierKind) -> BarrierDescriptor {
        match kind {
            BarrierKind::Startup => self.startup,
            BarrierKind::PendingPartition => self.pending_partition,
            BarrierKind::FutureMap => self.future_map,
            BarrierKind::Creation => self.creation,
            BarrierKind::Deletion => self.deletion,
            BarrierKind::InlineMapping => self.inline_mapping,
            BarrierKind::ExternalResource => self.external_resource,
            BarrierKind::MappingFence => self.mapping_fence,
            BarrierKind::ExecutionFence => self.execution_fence,
        }
    }
}

/// Instructions for bringing one shard up. The owner builds one per shard
/// and hands the whole set to [`ShardManager::distribute_shards`].
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(pattern = "owned")]
pub struct ShardLaunch {
    /// Shard this launch instantiates.
    shard: ShardId,

    /// Event that must trigger before the shard is spawned.
    /// [`EventHandle::NONE`] launches immediately.
    #[builder(default = "EventHandle::NONE")]
    precondition: EventHandle,

    /// Opaque task arguments, handed to the spawner untouched.
    #[builder(default)]
    args: ByteBuf,
}

impl ShardLaunch {
    pub fn builder() -> ShardLaunchBuilder {
        ShardLaunchBuilder::default()
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn precondition(&self) -> EventHandle {
        self.precondition
    }

    pub fn args(&self) -> &[u8] {
        &self.args
    }
}

/// Brings shard tasks to life. Registered once per node runtime; called on
/// a runtime worker after the launch precondition has triggered.
pub trait ShardSpawner: Send + Sync + 'static {
    fn spawn_shard(&self, ctx: Arc<ReplicaContext>, launch: ShardLaunch);
}

/// Owner-side callback invoked exactly once per milestone, after every
/// shard of the operation has reported it. `result` is only ever `Some`
/// for [`MilestoneKind::Complete`].
pub trait OwnerObserver: Send + Sync + 'static {
    fn milestone_reached(&self, kind: MilestoneKind, result: Option<Bytes>);
}

/// Everything a remote node needs to construct its manager: the mapping,
/// the barrier descriptors, and the launches for its local shards.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StartupPayload {
    pub mapping: ShardMapping,
    pub barriers: BarrierDescriptors,
    pub launches: Vec<ShardLaunch>,
}

/// Extra payload of a `Complete` milestone report from a constituent node.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CompletionReport {
    result: Option<ByteBuf>,
    effects: Vec<EventHandle>,
}

/// Payload of a `BarrierTriggered` message.
#[derive(Debug, Serialize, Deserialize)]
struct BarrierCompletion {
    value: Option<ByteBuf>,
    poison: Option<String>,
}

struct LocalShard {
    shard: ShardId,
    ctx: Arc<ReplicaContext>,
}

/// Barrier state of one manager. Non-owner nodes only hold the descriptors;
/// the live [`ShardBarrier`] instances exist on the owner.
struct BarrierSet {
    descriptors: BarrierDescriptors,
    owned: HashMap<BarrierId, Arc<ShardBarrier>>,
}

impl BarrierSet {
    fn owned(owner: NodeId, arrivals: u32, events: &Arc<LocalEventSystem>) -> Self {
        let descriptors = BarrierDescriptors::allocate(owner, arrivals);
        let mut owned = HashMap::new();
        for kind in BarrierKind::ALL {
            let descriptor = descriptors.get(kind);
            owned.insert(descriptor.id, ShardBarrier::new(descriptor, None, events.clone()));
        }
        Self { descriptors, owned }
    }

    fn adopted(descriptors: BarrierDescriptors) -> Self {
        Self {
            descriptors,
            owned: HashMap::new(),
        }
    }
}

/// Local stand-in for one remotely owned barrier generation.
struct BarrierProxy {
    event: LocalEvent,
    value: Option<Bytes>,
}

struct MilestoneState {
    /// Local shards that reported this milestone.
    local: u32,
    /// Remote nodes whose report arrived. Owner only.
    remote: BTreeSet<NodeId>,
    fired: bool,
    /// Triggered when the milestone fires. Owner only.
    event: Option<LocalEvent>,
    /// First task result seen. `Complete` only.
    result: Option<Bytes>,
    /// Effect events still outstanding when shards completed. `Complete`
    /// only; remote handles enter as subscription proxies.
    effects: Vec<EventHandle>,
}

impl MilestoneState {
    fn new(event: Option<LocalEvent>) -> Self {
        Self {
            local: 0,
            remote: BTreeSet::new(),
            fired: false,
            event,
            result: None,
            effects: Vec::new(),
        }
    }
}

/// Carried out of the milestone lock when a milestone fires.
struct MilestoneOutcome {
    event: Option<LocalEvent>,
    result: Option<Bytes>,
    effects: Vec<EventHandle>,
}

#[derive(Default)]
struct ObserverSlot {
    observer: Option<Arc<dyn OwnerObserver>>,
    /// Milestones that fired before an observer was registered.
    fired: Vec<(MilestoneKind, Option<Bytes>)>,
}

/// Node-local manager of one replicated operation.
pub struct ShardManager {
    replication: ReplicationId,
    node: NodeId,
    owner: NodeId,
    mapping: Arc<ShardMapping>,
    runtime: Weak<NodeRuntime>,
    link: Arc<dyn NodeLink>,
    events: Arc<LocalEventSystem>,
    topology: Arc<CollectiveTopology>,
    /// Sorted by shard id; looked up by linear scan, the per-node count is
    /// small.
    local_shards: Vec<LocalShard>,
    barriers: ParkingMutex<BarrierSet>,
    /// Proxies for remotely owned barrier generations, keyed by
    /// (barrier, generation).
    subscriptions: ParkingMutex<HashMap<(BarrierId, Generation), BarrierProxy>>,
    state: ParkingMutex<ReplicationState>,
    milestones: ParkingMutex<[MilestoneState; 4]>,
    observer: ParkingMutex<ObserverSlot>,
    sharding: ShardingCache,
}

impl ShardManager {
    /// Constructs the owning manager. The caller becomes the owner node;
    /// barriers and milestone events are allocated here.
    pub(crate) fn new_owner(
        runtime: &Arc<NodeRuntime>,
        replication: ReplicationId,
        mapping: Arc<ShardMapping>,
    ) -> Result<Arc<Self>> {
        let owner = runtime.node();
        let barriers = BarrierSet::owned(owner, mapping.total_shards(), runtime.events());
        Self::construct(runtime, replication, owner, mapping, barriers)
    }

    /// Constructs a constituent manager from an owner's startup payload.
    /// The pending launches come back to the caller: a spawned shard may
    /// look the manager up immediately, so it must be registered with the
    /// node runtime before anything launches.
    pub(crate) fn from_startup(
        runtime: &Arc<NodeRuntime>,
        replication: ReplicationId,
        owner: NodeId,
        payload: StartupPayload,
    ) -> Result<(Arc<Self>, Vec<ShardLaunch>)> {
        let mapping = Arc::new(payload.mapping);
        let barriers = BarrierSet::adopted(payload.barriers);
        let manager = Self::construct(runtime, replication, owner, mapping, barriers)?;
        manager.advance(ReplicationState::Mapping);
        Ok((manager, payload.launches))
    }

    fn construct(
        runtime: &Arc<NodeRuntime>,
        replication: ReplicationId,
        owner: NodeId,
        mapping: Arc<ShardMapping>,
        barriers: BarrierSet,
    ) -> Result<Arc<Self>> {
        let node = runtime.node();
        let events = runtime.events().clone();
        let config = runtime.config().clone();
        let link = runtime.link().clone();
        let topology = Arc::new(CollectiveTopology::new(
            mapping.total_shards(),
            config.collective_radix,
        ));
        let milestones = if node == owner {
            let state = || -> Result<MilestoneState> {
                Ok(MilestoneState::new(Some(events.new_event()?)))
            };
            [state()?, state()?, state()?, state()?]
        } else {
            [
                MilestoneState::new(None),
                MilestoneState::new(None),
                MilestoneState::new(None),
                MilestoneState::new(None),
            ]
        };
        let sharding = ShardingCache::new(mapping.total_shards());
        let manager = Arc::new_cyclic(|weak: &Weak<ShardManager>| {
            let local_shards = mapping
                .shards_on(node)
                .into_iter()
                .map(|shard| LocalShard {
                    shard,
                    ctx: ReplicaContext::new(
                        replication,
                        shard,
                        weak.clone(),
                        events.clone(),
                        config.clone(),
                        topology.clone(),
                    ),
                })
                .collect();
            ShardManager {
                replication,
                node,
                owner,
                mapping: mapping.clone(),
                runtime: Arc::downgrade(runtime),
                link,
                events,
                topology,
                local_shards,
                barriers: ParkingMutex::new(barriers),
                subscriptions: ParkingMutex::new(HashMap::new()),
                state: ParkingMutex::new(ReplicationState::Constructing),
                milestones: ParkingMutex::new(milestones),
                observer: ParkingMutex::new(ObserverSlot::default()),
                sharding,
            }
        });
        debug!(
            repl = %replication,
            node = %node,
            owner = %owner,
            shards = manager.local_shards.len(),
            "shard manager constructed"
        );
        Ok(manager)
    }

    pub fn replication(&self) -> ReplicationId {
        self.replication
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        self.node == self.owner
    }

    pub fn mapping(&self) -> &Arc<ShardMapping> {
        &self.mapping
    }

    pub fn total_shards(&self) -> u32 {
        self.mapping.total_shards()
    }

    pub fn topology(&self) -> &Arc<CollectiveTopology> {
        &self.topology
    }

    pub fn state(&self) -> ReplicationState {
        *self.state.lock()
    }

    /// Shard ids hosted on this node, ascending.
    pub fn local_shards(&self) -> Vec<ShardId> {
        self.local_shards.iter().map(|s| s.shard).collect()
    }

    /// Context of a local shard, for embedding code that drives shards
    /// directly.
    pub fn local_context(&self, shard: ShardId) -> Result<Arc<ReplicaContext>> {
        self.context_for(shard)
    }

    fn context_for(&self, shard: ShardId) -> Result<Arc<ReplicaContext>> {
        self.local_shards
            .iter()
            .find(|s| s.shard == shard)
            .map(|s| s.ctx.clone())
            .ok_or_else(|| anyhow!("shard {shard} is not hosted on node {}", self.node))
    }

    fn runtime(&self) -> Result<Arc<NodeRuntime>> {
        self.runtime
            .upgrade()
            .ok_or_else(|| anyhow!("node runtime has shut down"))
    }

    fn advance(&self, to: ReplicationState) {
        let mut state = self.state.lock();
        debug_assert!(
            to >= *state,
            "replication state moved backward: {:?} -> {to:?}",
            *state
        );
        if to > *state {
            trace!(repl = %self.replication, from = ?*state, to = ?to, "state advance");
            *state = to;
        }
    }

    // ------------------------------------------------------------------
    // Launch
    // ------------------------------------------------------------------

    /// Owner entry point: sends every remote node its startup payload and
    /// launches the local shards. One launch per shard of the operation.
    pub fn distribute_shards(self: &Arc<Self>, launches: Vec<ShardLaunch>) -> Result<()> {
        if !self.is_owner() {
            bail!("only the owner node distributes shards");
        }
        debug_assert_eq!(launches.len() as u32, self.total_shards());
        self.advance(ReplicationState::Launching);

        let mut local = Vec::new();
        let mut remote: BTreeMap<NodeId, Vec<ShardLaunch>> = BTreeMap::new();
        for launch in launches {
            let target = self.mapping.node_of(launch.shard());
            if target == self.node {
                local.push(launch);
            } else {
                remote.entry(target).or_default().push(launch);
            }
        }

        let descriptors = self.barriers.lock().descriptors;
        for (target, launches) in remote {
            let payload = StartupPayload {
                mapping: (*self.mapping).clone(),
                barriers: descriptors,
                launches,
            };
            let header = Envelope::new(self.replication, Message::Startup).encode();
            self.link.send(target, header, exchange::encode(&payload)?)?;
        }
        for launch in local {
            self.launch_local(launch)?;
        }
        self.advance(ReplicationState::Mapping);
        Ok(())
    }

    /// Spawns one local shard, deferring until its precondition triggers.
    pub(crate) fn launch_local(self: &Arc<Self>, launch: ShardLaunch) -> Result<()> {
        let ctx = self.context_for(launch.shard())?;
        let precondition = launch.precondition();
        if !precondition.exists() {
            return self.spawn_shard(ctx, launch);
        }
        let resolved = self.resolve_event(precondition)?;
        if self.events.has_triggered(resolved) {
            return self.spawn_shard(ctx, launch);
        }
        let waiter = self.events.waiter(resolved)?;
        let manager = self.clone();
        self.events.task_tracker().spawn(async move {
            if let Err(poison) = waiter.await {
                error!(shard = %launch.shard(), "not launching shard: {poison}");
                return;
            }
            if let Err(err) = manager.spawn_shard(ctx, launch) {
                error!("deferred shard launch failed: {err}");
            }
        });
        Ok(())
    }

    fn spawn_shard(&self, ctx: Arc<ReplicaContext>, launch: ShardLaunch) -> Result<()> {
        let runtime = self.runtime()?;
        let spawner = runtime
            .shard_spawner()
            .ok_or_else(|| anyhow!("no shard spawner registered on node {}", self.node))?;
        debug!(repl = %self.replication, shard = %launch.shard(), "launching shard");
        spawner.spawn_shard(ctx, launch);
        Ok(())
    }

    /// Maps a possibly remote event handle onto one waitable on this node.
    fn resolve_event(&self, handle: EventHandle) -> Result<EventHandle> {
        if handle.owner() == self.node {
            return Ok(handle);
        }
        self.runtime()?.subscribe_event(handle)
    }

    // ------------------------------------------------------------------
    // Collective and request routing
    // ------------------------------------------------------------------

    /// Routes one collective stage to the node hosting `target`.
    pub(crate) fn route_collective(
        &self,
        target: ShardId,
        collective: CollectiveId,
        stage: Stage,
        payload: Bytes,
    ) -> Result<()> {
        let node = self.mapping.node_of(target);
        if node == self.node {
            let ctx = self.context_for(target)?;
            ctx.deliver_collective(collective, stage, payload);
            return Ok(());
        }
        let header = Envelope::new(
            self.replication,
            Message::Collective {
                target,
                collective,
                stage,
            },
        )
        .encode();
        self.link.send(node, header, payload)?;
        Ok(())
    }

    /// Asks `target` for future map entries. Answered by the shard's
    /// registered request handler.
    pub fn request_future_map(&self, target: ShardId, payload: Bytes) -> Result<()> {
        self.route_request(
            target,
            Message::FutureMapRequest { target },
            ShardRequest::FutureMap { source: self.node },
            payload,
        )
    }

    /// Asks `target` for the canonical equivalence sets of a region.
    pub fn request_equivalence_set(&self, target: ShardId, payload: Bytes) -> Result<()> {
        self.route_request(
            target,
            Message::EquivalenceSetRequest { target },
            ShardRequest::EquivalenceSet { source: self.node },
            payload,
        )
    }

    fn route_request(
        &self,
        target: ShardId,
        message: Message,
        local: ShardRequest,
        payload: Bytes,
    ) -> Result<()> {
        let node = self.mapping.node_of(target);
        if node == self.node {
            self.context_for(target)?.deliver_request(local, payload);
            return Ok(());
        }
        let header = Envelope::new(self.replication, message).encode();
        self.link.send(node, header, payload)?;
        Ok(())
    }

    /// Hands the top-view request for `instance` to a deterministic shard.
    /// Nodes without local shards forward; every node picks the same shard
    /// for the same instance, so requests from anywhere converge.
    pub fn create_instance_top_view(
        &self,
        instance: DistributedId,
        requestor: ShardId,
        payload: Bytes,
    ) -> Result<()> {
        if !self.local_shards.is_empty() {
            let pick = (instance.as_u64() % self.local_shards.len() as u64) as usize;
            self.local_shards[pick]
                .ctx
                .deliver_request(ShardRequest::TopView { instance, requestor }, payload);
            return Ok(());
        }
        let target = if self.mapping.hosts_shards(self.owner) {
            self.owner
        } else {
            let constituents = self.mapping.constituent_nodes();
            constituents[(instance.as_u64() % constituents.len() as u64) as usize]
        };
        let header =
            Envelope::new(self.replication, Message::TopView { instance, requestor }).encode();
        self.link.send(target, header, payload)?;
        Ok(())
    }

    /// Completes an event owned by another node: triggers locally when the
    /// handle turns out to be ours, otherwise notifies the owner.
    pub(crate) fn complete_remote_event(
        &self,
        handle: EventHandle,
        poison: Option<String>,
    ) -> Result<()> {
        if handle.owner() == self.node {
            return match poison {
                None => self.events.trigger(handle),
                Some(reason) => self.events.poison(handle, reason),
            };
        }
        let payload = exchange::encode(&poison)?;
        let header = Envelope::node_control(Message::EventTriggered { event: handle }).encode();
        self.link.send(handle.owner(), header, payload)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    pub fn barrier_descriptor(&self, kind: BarrierKind) -> BarrierDescriptor {
        self.barriers.lock().descriptors.get(kind)
    }

    /// Replaces a barrier's reduction. Owner only, and only while the
    /// barrier is untouched: no arrival registered, no wait event handed
    /// out.
    pub fn attach_barrier_reduction(
        &self,
        kind: BarrierKind,
        reduction: Arc<dyn BarrierReduction>,
    ) -> Result<()> {
        let mut barriers = self.barriers.lock();
        let descriptor = barriers.descriptors.get(kind);
        if descriptor.owner != self.node {
            bail!("barrier reductions are attached on the owner node");
        }
        let engaged = barriers
            .owned
            .get(&descriptor.id)
            .is_some_and(|barrier| barrier.has_generations());
        if engaged {
            bail!("{kind} barrier is already in use; attach reductions before any arrive or wait");
        }
        barriers.owned.insert(
            descriptor.id,
            ShardBarrier::new(descriptor, Some(reduction), self.events.clone()),
        );
        Ok(())
    }

    /// Registers `count` arrivals at a named barrier, forwarding to the
    /// owner when the barrier lives elsewhere.
    pub fn barrier_arrive(
        &self,
        kind: BarrierKind,
        generation: Generation,
        count: u32,
        payload: Option<Bytes>,
    ) -> Result<()> {
        let descriptor = self.barrier_descriptor(kind);
        if descriptor.owner == self.node {
            let barrier = self.owned_barrier(descriptor.id)?;
            return barrier.arrive(generation, count, payload);
        }
        let header = Envelope::new(
            self.replication,
            Message::BarrierArrive {
                barrier: descriptor.id,
                generation,
                count,
            },
        )
        .encode();
        self.link
            .send(descriptor.owner, header, payload.unwrap_or_default())?;
        Ok(())
    }

    /// Event that triggers when a barrier generation completes. On
    /// non-owner nodes the first wait subscribes with the owner and later
    /// waits share the proxy.
    pub fn barrier_wait(&self, kind: BarrierKind, generation: Generation) -> Result<EventHandle> {
        let descriptor = self.barrier_descriptor(kind);
        if descriptor.owner == self.node {
            return self.owned_barrier(descriptor.id)?.wait(generation);
        }
        let (handle, subscribe) = {
            let mut subscriptions = self.subscriptions.lock();
            match subscriptions.get(&(descriptor.id, generation)) {
                Some(proxy) => (proxy.event.handle(), false),
                None => {
                    let event = self.events.new_event()?;
                    let handle = event.handle();
                    subscriptions
                        .insert((descriptor.id, generation), BarrierProxy { event, value: None });
                    (handle, true)
                }
            }
        };
        if subscribe {
            let header = Envelope::new(
                self.replication,
                Message::BarrierSubscribe {
                    barrier: descriptor.id,
                    generation,
                    node: self.node,
                },
            )
            .encode();
            self.link.send(descriptor.owner, header, Bytes::new())?;
        }
        Ok(handle)
    }

    /// Reduced value of a completed barrier generation. `None` until the
    /// generation completes (or, on non-owner nodes, until the completion
    /// report arrives), and for barriers without a reduction.
    pub fn barrier_reduced(&self, kind: BarrierKind, generation: Generation) -> Option<Bytes> {
        let descriptor = self.barrier_descriptor(kind);
        if descriptor.owner == self.node {
            return self.owned_barrier(descriptor.id).ok()?.reduced(generation);
        }
        let subscriptions = self.subscriptions.lock();
        subscriptions
            .get(&(descriptor.id, generation))
            .and_then(|proxy| proxy.value.clone())
    }

    fn owned_barrier(&self, barrier: BarrierId) -> Result<Arc<ShardBarrier>> {
        self.barriers
            .lock()
            .owned
            .get(&barrier)
            .cloned()
            .ok_or_else(|| anyhow!("barrier {barrier} is not owned by node {}", self.node))
    }

    /// Owner side of a remote [`ShardManager::barrier_wait`]: report back
    /// when the generation completes.
    fn subscribe_owned_barrier(
        &self,
        barrier: BarrierId,
        generation: Generation,
        subscriber: NodeId,
    ) -> Result<()> {
        let shard_barrier = self.owned_barrier(barrier)?;
        let done = shard_barrier.wait(generation)?;
        let waiter = self.events.waiter(done)?;
        let replication = self.replication;
        let link = self.link.clone();
        self.events.task_tracker().spawn(async move {
            let poison = waiter.await.err().map(|p| p.to_string());
            let completion = BarrierCompletion {
                value: shard_barrier
                    .reduced(generation)
                    .map(|value| ByteBuf::from(value.to_vec())),
                poison,
            };
            let payload = match exchange::encode(&completion) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("failed to encode barrier completion: {err}");
                    return;
                }
            };
            let header = Envelope::new(
                replication,
                Message::BarrierTriggered { barrier, generation },
            )
            .encode();
            if let Err(err) = link.send(subscriber, header, payload) {
                error!(node = %subscriber, "failed to report barrier completion: {err}");
            }
        });
        Ok(())
    }

    /// Subscriber side: completes the local proxy for a remotely owned
    /// generation.
    fn complete_barrier_subscription(
        &self,
        barrier: BarrierId,
        generation: Generation,
        payload: Bytes,
    ) -> Result<()> {
        let completion: BarrierCompletion = exchange::decode(&payload)?;
        let event = {
            let mut subscriptions = self.subscriptions.lock();
            let proxy = subscriptions
                .get_mut(&(barrier, generation))
                .ok_or_else(|| {
                    anyhow!("completion for unsubscribed barrier {barrier} generation {generation}")
                })?;
            proxy.value = completion.value.map(|value| Bytes::from(value.into_vec()));
            proxy.event.clone()
        };
        match completion.poison {
            None => event.trigger(),
            Some(reason) => event.poison(reason),
        }
    }

    // ------------------------------------------------------------------
    // Milestones
    // ------------------------------------------------------------------

    /// Reports that one local shard finished mapping.
    pub fn handle_post_mapped(self: &Arc<Self>, shard: ShardId) -> Result<()> {
        self.record_local_milestone(MilestoneKind::Mapped, shard, None, EventHandle::NONE)
    }

    /// Reports that one local shard's task body returned.
    pub fn handle_post_execution(self: &Arc<Self>, shard: ShardId) -> Result<()> {
        self.record_local_milestone(MilestoneKind::Executed, shard, None, EventHandle::NONE)
    }

    /// Reports one local shard complete. All shards pass a bitwise
    /// identical `result`; `effects` is an event covering whatever the
    /// shard still has outstanding, NONE when nothing is.
    pub fn trigger_task_complete(
        self: &Arc<Self>,
        shard: ShardId,
        result: Option<Bytes>,
        effects: EventHandle,
    ) -> Result<()> {
        self.record_local_milestone(MilestoneKind::Complete, shard, result, effects)
    }

    /// Reports one local shard committed.
    pub fn trigger_task_commit(self: &Arc<Self>, shard: ShardId) -> Result<()> {
        self.record_local_milestone(MilestoneKind::Commit, shard, None, EventHandle::NONE)
    }

    /// Handle of the event that triggers when a milestone fires for the
    /// whole operation. Owner only.
    pub fn milestone_event(&self, kind: MilestoneKind) -> Result<EventHandle> {
        let milestones = self.milestones.lock();
        milestones[kind.as_u8() as usize]
            .event
            .as_ref()
            .map(|event| event.handle())
            .ok_or_else(|| anyhow!("milestone events live on the owner node"))
    }

    /// Registers the owner-side milestone callback. Milestones that fired
    /// before registration are replayed immediately.
    pub fn set_owner_observer(&self, observer: Arc<dyn OwnerObserver>) -> Result<()> {
        if !self.is_owner() {
            bail!("milestone observers are owner-side only");
        }
        let replay = {
            let mut slot = self.observer.lock();
            slot.observer = Some(observer.clone());
            std::mem::take(&mut slot.fired)
        };
        for (kind, result) in replay {
            observer.milestone_reached(kind, result);
        }
        Ok(())
    }

    fn record_local_milestone(
        self: &Arc<Self>,
        kind: MilestoneKind,
        shard: ShardId,
        result: Option<Bytes>,
        effects: EventHandle,
    ) -> Result<()> {
        debug_assert!(
            self.local_shards.iter().any(|s| s.shard == shard),
            "shard {shard} is not local"
        );
        trace!(repl = %self.replication, %shard, milestone = %kind, "shard milestone");
        let outcome = {
            let mut milestones = self.milestones.lock();
            let state = &mut milestones[kind.as_u8() as usize];
            state.local += 1;
            debug_assert!(
                state.local <= self.local_shards.len() as u32,
                "more {kind} reports than local shards"
            );
            if kind == MilestoneKind::Complete {
                Self::keep_result(state, result);
                if effects.exists() {
                    state.effects.push(effects);
                }
            }
            self.check_reached(kind, state)
        };
        self.finish_milestone(kind, outcome)
    }

    /// Records a constituent node's milestone report. Owner only.
    fn handle_remote_milestone(
        self: &Arc<Self>,
        kind: MilestoneKind,
        node: NodeId,
        payload: Bytes,
    ) -> Result<()> {
        if !self.is_owner() {
            bail!("milestone report routed to non-owner node {}", self.node);
        }
        // Remote effect handles become local proxies before the accounting
        // lock is taken.
        let mut result = None;
        let mut proxies = Vec::new();
        if kind == MilestoneKind::Complete {
            let report: CompletionReport = exchange::decode(&payload)?;
            result = report.result.map(|value| Bytes::from(value.into_vec()));
            let runtime = self.runtime()?;
            for handle in report.effects {
                proxies.push(runtime.subscribe_event(handle)?);
            }
        }
        let outcome = {
            let mut milestones = self.milestones.lock();
            let state = &mut milestones[kind.as_u8() as usize];
            let first = state.remote.insert(node);
            debug_assert!(first, "node {node} reported {kind} twice");
            if kind == MilestoneKind::Complete {
                Self::keep_result(state, result);
                state.effects.extend(proxies);
            }
            self.check_reached(kind, state)
        };
        self.finish_milestone(kind, outcome)
    }

    fn keep_result(state: &mut MilestoneState, result: Option<Bytes>) {
        match (&state.result, result) {
            (None, Some(bytes)) => state.result = Some(bytes),
            (Some(kept), Some(bytes)) => {
                debug_assert_eq!(kept, &bytes, "shards produced diverging task results");
            }
            _ => {}
        }
    }

    /// Fire check, under the milestone lock. The milestone fires when all
    /// local shards have reported and, on the owner, every remote
    /// constituent node has too.
    fn check_reached(
        &self,
        kind: MilestoneKind,
        state: &mut MilestoneState,
    ) -> Option<MilestoneOutcome> {
        if state.fired {
            return None;
        }
        let expected_remote = if self.is_owner() {
            self.mapping.remote_nodes(self.node).len()
        } else {
            0
        };
        if state.local != self.local_shards.len() as u32 || state.remote.len() != expected_remote {
            return None;
        }
        state.fired = true;
        trace!(repl = %self.replication, milestone = %kind, "milestone fired");
        Some(MilestoneOutcome {
            event: state.event.clone(),
            result: state.result.clone(),
            effects: std::mem::take(&mut state.effects),
        })
    }

    fn finish_milestone(
        self: &Arc<Self>,
        kind: MilestoneKind,
        outcome: Option<MilestoneOutcome>,
    ) -> Result<()> {
        let Some(outcome) = outcome else {
            return Ok(());
        };
        self.advance(match kind {
            MilestoneKind::Mapped => ReplicationState::Executing,
            MilestoneKind::Executed => ReplicationState::Completing,
            MilestoneKind::Complete => ReplicationState::Committing,
            MilestoneKind::Commit => ReplicationState::Destroyed,
        });
        if !self.is_owner() {
            return self.report_milestone(kind, outcome);
        }
        if kind == MilestoneKind::Complete && !outcome.effects.is_empty() {
            // Complete only counts once the outstanding effects have
            // settled; the event and callback wait for the merge.
            let merged = self.events.merge_events(outcome.effects)?;
            let waiter = self.events.waiter(merged)?;
            let manager = self.clone();
            self.events.task_tracker().spawn(async move {
                let poison = waiter.await.err().map(|p| p.to_string());
                if let Err(err) =
                    manager.complete_owner_milestone(kind, outcome.event, outcome.result, poison)
                {
                    error!("failed to complete milestone {kind}: {err}");
                }
            });
            return Ok(());
        }
        self.complete_owner_milestone(kind, outcome.event, outcome.result, None)
    }

    /// Sends this node's aggregate report to the owner.
    fn report_milestone(&self, kind: MilestoneKind, outcome: MilestoneOutcome) -> Result<()> {
        let payload = if kind == MilestoneKind::Complete {
            exchange::encode(&CompletionReport {
                result: outcome.result.map(|bytes| ByteBuf::from(bytes.to_vec())),
                effects: outcome.effects,
            })?
        } else {
            Bytes::new()
        };
        let header = Envelope::new(
            self.replication,
            Message::Milestone {
                kind,
                node: self.node,
            },
        )
        .encode();
        self.link.send(self.owner, header, payload)?;
        Ok(())
    }

    fn complete_owner_milestone(
        &self,
        kind: MilestoneKind,
        event: Option<LocalEvent>,
        result: Option<Bytes>,
        poison: Option<String>,
    ) -> Result<()> {
        debug!(repl = %self.replication, milestone = %kind, "milestone reached");
        if let Some(event) = event {
            match &poison {
                None => event.trigger()?,
                Some(reason) => event.poison(reason.clone())?,
            }
        }
        if let Some(reason) = poison {
            error!(repl = %self.replication, milestone = %kind, "milestone poisoned: {reason}");
            return Ok(());
        }
        let observer = {
            let mut slot = self.observer.lock();
            match slot.observer.clone() {
                Some(observer) => Some(observer),
                None => {
                    slot.fired.push((kind, result.clone()));
                    None
                }
            }
        };
        if let Some(observer) = observer {
            observer.milestone_reached(kind, result);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sharding functions
    // ------------------------------------------------------------------

    /// Sharding function for `id`, bound to this operation's shard count.
    /// Built from the node registry on first use and cached.
    pub fn sharding_function(&self, id: ShardingId) -> Result<ShardingFunction> {
        self.sharding.get_or_build(id, || {
            let runtime = self.runtime()?;
            runtime
                .sharding_registry()
                .lookup(id)
                .ok_or_else(|| ReplicationError::UnknownFunctor(id).into())
        })
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Entry point for the runtime's dispatch loop. Failures are logged
    /// rather than propagated: one bad message must not take down the
    /// loop.
    pub(crate) fn handle_message(self: &Arc<Self>, source: NodeId, message: Message, payload: Bytes) {
        let described = format!("{message:?}");
        if let Err(err) = self.dispatch_message(source, message, payload) {
            error!(
                repl = %self.replication,
                from = %source,
                message = %described,
                "message handling failed: {err:#}"
            );
        }
    }

    fn dispatch_message(
        self: &Arc<Self>,
        source: NodeId,
        message: Message,
        payload: Bytes,
    ) -> Result<()> {
        match message {
            Message::Startup => bail!("startup for an already constructed manager"),
            Message::Collective {
                target,
                collective,
                stage,
            } => {
                self.context_for(target)?
                    .deliver_collective(collective, stage, payload);
            }
            Message::FutureMapRequest { target } => {
                self.context_for(target)?
                    .deliver_request(ShardRequest::FutureMap { source }, payload);
            }
            Message::EquivalenceSetRequest { target } => {
                self.context_for(target)?
                    .deliver_request(ShardRequest::EquivalenceSet { source }, payload);
            }
            Message::BarrierArrive {
                barrier,
                generation,
                count,
            } => {
                let contribution = if payload.is_empty() { None } else { Some(payload) };
                self.owned_barrier(barrier)?
                    .arrive(generation, count, contribution)?;
            }
            Message::BarrierSubscribe {
                barrier,
                generation,
                node,
            } => self.subscribe_owned_barrier(barrier, generation, node)?,
            Message::BarrierTriggered { barrier, generation } => {
                self.complete_barrier_subscription(barrier, generation, payload)?;
            }
            Message::Milestone { kind, node } => {
                self.handle_remote_milestone(kind, node, payload)?;
            }
            Message::TopView { instance, requestor } => {
                self.create_instance_top_view(instance, requestor, payload)?;
            }
            Message::EventSubscribe { .. } | Message::EventTriggered { .. } => {
                bail!("event bridge traffic addressed to a manager");
            }
        }
        Ok(())
    }

    /// Marks the operation dead. Later sends fail upward; the event system
    /// poisons whatever is still pending at node shutdown.
    pub(crate) fn destroy(&self) {
        self.advance(ReplicationState::Destroyed);
    }
}

impl fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardManager")
            .field("replication", &self.replication)
            .field("node", &self.node)
            .field("owner", &self.owner)
            .field("local_shards", &self.local_shards.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
