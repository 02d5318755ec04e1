// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node-wide runtime: inbound dispatch and cross-node event bridging.
//!
//! One [`NodeRuntime`] exists per participating node. It drains the node's
//! inbound queue and routes each message to the [`ShardManager`] of its
//! replicated operation, buffering traffic that arrives before the
//! operation's startup message. It also bridges event completion between
//! nodes: [`NodeRuntime::subscribe_event`] turns a remote event handle into
//! a local proxy that triggers (or carries poison) when the owning node
//! reports completion.

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex as ParkingMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

use crate::config::LockstepConfig;
use crate::event::{EventHandle, LocalEvent, LocalEventSystem};
use crate::exchange;
use crate::identity::{NodeId, ReplicationId, ShardMapping, ShardingId};
use crate::manager::sharding::{ShardingFunctor, ShardingRegistry};
use crate::manager::{ShardManager, ShardSpawner, StartupPayload};
use crate::transport::{Envelope, Inbound, Message, NodeLink};

/// Per-node runtime shared by every replicated operation the node takes
/// part in.
pub struct NodeRuntime {
    node: NodeId,
    link: Arc<dyn NodeLink>,
    events: Arc<LocalEventSystem>,
    config: Arc<LockstepConfig>,
    sharding: Arc<ShardingRegistry>,
    spawner: ParkingMutex<Option<Arc<dyn ShardSpawner>>>,
    managers: DashMap<u64, Arc<ShardManager>>,
    /// Messages for replications whose startup has not arrived yet.
    pending: ParkingMutex<HashMap<u64, Vec<(NodeId, Message, Bytes)>>>,
    /// Local proxies for remote events, keyed by the remote handle's raw
    /// value. One proxy and one subscribe message per remote handle.
    proxies: DashMap<u128, LocalEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl NodeRuntime {
    /// Starts the runtime and its dispatch loop. Must be called from
    /// within a tokio runtime.
    pub fn new(
        link: Arc<dyn NodeLink>,
        receiver: flume::Receiver<Inbound>,
        config: LockstepConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node = link.node();
        let runtime = Arc::new(Self {
            node,
            link,
            events: LocalEventSystem::new(node),
            config: Arc::new(config),
            sharding: Arc::new(ShardingRegistry::default()),
            spawner: ParkingMutex::new(None),
            managers: DashMap::new(),
            pending: ParkingMutex::new(HashMap::new()),
            proxies: DashMap::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        let dispatcher = runtime.clone();
        runtime
            .tracker
            .spawn(async move { dispatcher.dispatch_loop(receiver).await });
        debug!(node = %node, "node runtime started");
        Ok(runtime)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn events(&self) -> &Arc<LocalEventSystem> {
        &self.events
    }

    pub fn config(&self) -> &Arc<LockstepConfig> {
        &self.config
    }

    pub fn link(&self) -> &Arc<dyn NodeLink> {
        &self.link
    }

    pub fn sharding_registry(&self) -> &Arc<ShardingRegistry> {
        &self.sharding
    }

    pub fn manager(&self, replication: ReplicationId) -> Option<Arc<ShardManager>> {
        self.managers
            .get(&replication.as_u64())
            .map(|entry| entry.clone())
    }

    /// Registers the spawner that brings shard tasks to life. Must happen
    /// before this node creates or receives any replicated operation.
    pub fn set_shard_spawner(&self, spawner: Arc<dyn ShardSpawner>) {
        *self.spawner.lock() = Some(spawner);
    }

    pub(crate) fn shard_spawner(&self) -> Option<Arc<dyn ShardSpawner>> {
        self.spawner.lock().clone()
    }

    /// Registers a sharding functor under `id` on this node. Every node
    /// must register the same functors; ids are resolved lazily per
    /// operation.
    pub fn register_functor(&self, id: ShardingId, functor: Arc<dyn ShardingFunctor>) -> Result<()> {
        self.sharding.register(id, functor)
    }

    /// Creates a replicated operation owned by this node. The returned
    /// manager is ready for [`ShardManager::distribute_shards`].
    pub fn create_replication(
        self: &Arc<Self>,
        replication: ReplicationId,
        mapping: Arc<ShardMapping>,
    ) -> Result<Arc<ShardManager>> {
        if replication.as_u64() == 0 {
            bail!("replication id 0 is reserved for node control traffic");
        }
        let manager = ShardManager::new_owner(self, replication, mapping)?;
        match self.managers.entry(replication.as_u64()) {
            Entry::Occupied(_) => {
                bail!("replication {replication} already exists on node {}", self.node)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(manager.clone());
            }
        }
        Ok(manager)
    }

    /// Local waitable handle for `handle`. Remote handles get a proxy event
    /// that completes when the owning node reports; local handles come back
    /// unchanged.
    pub fn subscribe_event(self: &Arc<Self>, handle: EventHandle) -> Result<EventHandle> {
        if !handle.exists() || handle.owner() == self.node {
            return Ok(handle);
        }
        let mut subscribe = false;
        let proxy_handle = match self.proxies.entry(handle.raw()) {
            Entry::Occupied(occupied) => occupied.get().handle(),
            Entry::Vacant(vacant) => {
                let proxy = self.events.new_event()?;
                let proxy_handle = proxy.handle();
                vacant.insert(proxy);
                subscribe = true;
                proxy_handle
            }
        };
        if subscribe {
            let header = Envelope::node_control(Message::EventSubscribe {
                event: handle,
                node: self.node,
            })
            .encode();
            self.link.send(handle.owner(), header, Bytes::new())?;
        }
        Ok(proxy_handle)
    }

    /// Stops dispatch, poisons whatever is still pending, and waits for
    /// background tasks to drain. Idempotent.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(node = %self.node, "node runtime shutting down: {reason}");
        self.cancel.cancel();
        for entry in self.managers.iter() {
            entry.value().destroy();
        }
        self.events.force_shutdown(reason);
        self.tracker.close();
        self.tracker.wait().await;
        let event_tasks = self.events.task_tracker();
        event_tasks.close();
        event_tasks.wait().await;
    }

    async fn dispatch_loop(self: Arc<Self>, receiver: flume::Receiver<Inbound>) {
        loop {
            let inbound = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = receiver.recv_async() => match received {
                    Ok(inbound) => inbound,
                    Err(_) => break,
                },
            };
            self.dispatch(inbound);
        }
        trace!(node = %self.node, "dispatch loop stopped");
    }

    fn dispatch(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            source,
            header,
            payload,
        } = inbound;
        let envelope = match Envelope::decode(&header) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(from = %source, "dropping undecodable envelope: {err}");
                return;
            }
        };
        // Replication id 0 carries node-level control traffic.
        if envelope.replication.as_u64() == 0 {
            self.dispatch_control(source, envelope.message, payload);
            return;
        }
        let replication = envelope.replication;
        if matches!(envelope.message, Message::Startup) {
            self.handle_startup(source, replication, payload);
            return;
        }
        let manager = self
            .managers
            .get(&replication.as_u64())
            .map(|entry| entry.clone());
        match manager {
            Some(manager) => manager.handle_message(source, envelope.message, payload),
            None => {
                trace!(repl = %replication, from = %source, "buffering pre-startup message");
                self.pending
                    .lock()
                    .entry(replication.as_u64())
                    .or_default()
                    .push((source, envelope.message, payload));
            }
        }
    }

    fn dispatch_control(&self, source: NodeId, message: Message, payload: Bytes) {
        match message {
            Message::EventSubscribe { event, node } => self.watch_for_subscriber(event, node),
            Message::EventTriggered { event } => self.complete_event_bridge(event, payload),
            other => error!(from = %source, "unexpected control message: {other:?}"),
        }
    }

    fn handle_startup(self: &Arc<Self>, source: NodeId, replication: ReplicationId, payload: Bytes) {
        if self.managers.contains_key(&replication.as_u64()) {
            error!(repl = %replication, from = %source, "duplicate startup ignored");
            return;
        }
        let startup: StartupPayload = match exchange::decode(&payload) {
            Ok(startup) => startup,
            Err(err) => {
                error!(repl = %replication, from = %source, "undecodable startup: {err}");
                return;
            }
        };
        let (manager, launches) = match ShardManager::from_startup(self, replication, source, startup)
        {
            Ok(constructed) => constructed,
            Err(err) => {
                error!(repl = %replication, "failed to construct shard manager: {err:#}");
                return;
            }
        };
        self.managers.insert(replication.as_u64(), manager.clone());
        for launch in launches {
            if let Err(err) = manager.launch_local(launch) {
                error!(repl = %replication, "failed to launch shard: {err:#}");
            }
        }
        let buffered = self
            .pending
            .lock()
            .remove(&replication.as_u64())
            .unwrap_or_default();
        for (from, message, payload) in buffered {
            manager.handle_message(from, message, payload);
        }
    }

    /// Owner side of the event bridge: watch a local event and report its
    /// completion to the subscribed node.
    fn watch_for_subscriber(&self, event: EventHandle, subscriber: NodeId) {
        if event.owner() != self.node {
            error!(%event, "subscription for an event this node does not own");
            return;
        }
        let waiter = match self.events.waiter(event) {
            Ok(waiter) => waiter,
            Err(err) => {
                error!(%event, node = %subscriber, "cannot watch event: {err}");
                return;
            }
        };
        let link = self.link.clone();
        self.tracker.spawn(async move {
            let poison = waiter.await.err().map(|p| p.to_string());
            let payload = match exchange::encode(&poison) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("failed to encode event completion: {err}");
                    return;
                }
            };
            let header = Envelope::node_control(Message::EventTriggered { event }).encode();
            if let Err(err) = link.send(subscriber, header, payload) {
                error!(node = %subscriber, "failed to report event completion: {err}");
            }
        });
    }

    /// Subscriber and owner sides both receive `EventTriggered`: for an
    /// event this node owns it is a remote completion request, otherwise it
    /// resolves one of our subscription proxies.
    fn complete_event_bridge(&self, event: EventHandle, payload: Bytes) {
        let poison: Option<String> = match exchange::decode(&payload) {
            Ok(poison) => poison,
            Err(err) => {
                error!(%event, "dropping undecodable event completion: {err}");
                return;
            }
        };
        let outcome = if event.owner() == self.node {
            match poison {
                None => self.events.trigger(event),
                Some(reason) => self.events.poison(event, reason),
            }
        } else {
            match self.proxies.remove(&event.raw()) {
                Some((_, proxy)) => match poison {
                    None => proxy.trigger(),
                    Some(reason) => proxy.poison(reason),
                },
                None => Err(anyhow!("completion for an event this node never subscribed to")),
            }
        };
        if let Err(err) = outcome {
            error!(%event, "event completion failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryCluster;
    use std::time::Duration;
    use tokio::time::timeout;

    fn runtime_on(cluster: &MemoryCluster, node: u32) -> Arc<NodeRuntime> {
        let (link, receiver) = cluster.join(NodeId::new(node));
        NodeRuntime::new(link, receiver, LockstepConfig::default()).expect("runtime")
    }

    #[tokio::test]
    async fn remote_completion_reaches_the_subscriber() {
        let cluster = MemoryCluster::new();
        let owner = runtime_on(&cluster, 0);
        let subscriber = runtime_on(&cluster, 1);

        let event = owner.events().new_event().expect("event");
        let proxy = subscriber
            .subscribe_event(event.handle())
            .expect("subscribe");
        assert_ne!(proxy, event.handle());
        assert_eq!(proxy.owner(), NodeId::new(1));

        event.trigger().expect("trigger");
        timeout(Duration::from_secs(5), subscriber.events().wait(proxy))
            .await
            .expect("completion arrived")
            .expect("triggered");
    }

    #[tokio::test]
    async fn poison_crosses_the_bridge() {
        let cluster = MemoryCluster::new();
        let owner = runtime_on(&cluster, 0);
        let subscriber = runtime_on(&cluster, 1);

        let event = owner.events().new_event().expect("event");
        let proxy = subscriber
            .subscribe_event(event.handle())
            .expect("subscribe");

        event.poison("mapper exploded").expect("poison");
        let err = timeout(Duration::from_secs(5), subscriber.events().wait(proxy))
            .await
            .expect("completion arrived")
            .expect_err("poisoned");
        assert!(err.to_string().contains("mapper exploded"));
    }

    #[tokio::test]
    async fn subscriptions_are_deduplicated() {
        let cluster = MemoryCluster::new();
        let owner = runtime_on(&cluster, 0);
        let subscriber = runtime_on(&cluster, 1);

        let event = owner.events().new_event().expect("event");
        let first = subscriber
            .subscribe_event(event.handle())
            .expect("subscribe");
        let second = subscriber
            .subscribe_event(event.handle())
            .expect("subscribe");
        assert_eq!(first, second);
        assert_eq!(cluster.messages_sent(NodeId::new(1)), 1);
    }

    #[tokio::test]
    async fn local_handles_pass_through() {
        let cluster = MemoryCluster::new();
        let runtime = runtime_on(&cluster, 0);

        let event = runtime.events().new_event().expect("event");
        let resolved = runtime.subscribe_event(event.handle()).expect("local");
        assert_eq!(resolved, event.handle());

        let none = runtime.subscribe_event(EventHandle::NONE).expect("none");
        assert_eq!(none, EventHandle::NONE);
        assert_eq!(cluster.messages_sent(NodeId::new(0)), 0);
    }

    #[tokio::test]
    async fn replication_zero_is_reserved() {
        let cluster = MemoryCluster::new();
        let runtime = runtime_on(&cluster, 0);
        let mapping = Arc::new(ShardMapping::new(vec![NodeId::new(0)]));

        let err = runtime
            .create_replication(ReplicationId::new(0), mapping.clone())
            .expect_err("reserved");
        assert!(err.to_string().contains("reserved"));

        runtime
            .create_replication(ReplicationId::new(7), mapping.clone())
            .expect("first");
        let err = runtime
            .create_replication(ReplicationId::new(7), mapping)
            .expect_err("duplicate");
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn shutdown_poisons_pending_events() {
        let cluster = MemoryCluster::new();
        let runtime = runtime_on(&cluster, 0);
        let event = runtime.events().new_event().expect("event");

        runtime.shutdown("test over").await;
        let err = runtime
            .events()
            .wait(event.handle())
            .await
            .expect_err("poisoned");
        assert!(err.to_string().contains("test over"));
    }
}
