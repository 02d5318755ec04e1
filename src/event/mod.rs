// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generational completion events.
//!
//! Every collective and every manager milestone completes through one of
//! these events: a single writer triggers (or poisons) the event exactly
//! once, any number of waiters observe it. Slots are recycled across
//! generations, so a stale handle held after its generation completed still
//! reads `Ready` instead of aliasing the next user of the slot.
//!
//! Handles pack `(owner node, slot index, generation)` into a `u128` and can
//! travel on the wire; only the owning node can trigger or wait on a handle
//! directly, remote observers go through the runtime's event bridge.

pub mod barrier;

use anyhow::{Result, anyhow, bail};
use dashmap::DashMap;
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll, Waker};
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::identity::NodeId;

/// Alias for event generation counters.
pub type Generation = u32;

const OWNER_BITS: u32 = 64;
const LOCAL_BITS: u32 = 32;
const GENERATION_BITS: u32 = 32;

const LOCAL_SHIFT: u32 = GENERATION_BITS;
const OWNER_SHIFT: u32 = LOCAL_SHIFT + LOCAL_BITS;

const OWNER_MASK: u128 = ((1u128 << OWNER_BITS) - 1) << OWNER_SHIFT;
const LOCAL_MASK: u128 = ((1u128 << LOCAL_BITS) - 1) << LOCAL_SHIFT;
const GENERATION_MASK: u128 = (1u128 << GENERATION_BITS) - 1;
const MAX_GENERATION: Generation = u32::MAX;
const MAX_LOCAL_INDEX: u32 = u32::MAX;

/// Public event handle encoded in a single u128 value.
///
/// Generations start at 1, so the all-zero handle can serve as the
/// distinguished [`EventHandle::NONE`]: an event that is always ready and
/// never carries poison.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "RawEventHandle", from = "RawEventHandle")]
pub struct EventHandle(u128);

/// Wire form of [`EventHandle`]. MessagePack has no native 128-bit integers,
/// so handles serialize as a (hi, lo) pair of u64 words.
#[derive(Serialize, Deserialize)]
struct RawEventHandle(u64, u64);

impl From<EventHandle> for RawEventHandle {
    fn from(handle: EventHandle) -> Self {
        RawEventHandle((handle.0 >> 64) as u64, handle.0 as u64)
    }
}

impl From<RawEventHandle> for EventHandle {
    fn from(raw: RawEventHandle) -> Self {
        EventHandle(((raw.0 as u128) << 64) | raw.1 as u128)
    }
}

impl EventHandle {
    /// The always-ready event. Waiting on it completes immediately.
    pub const NONE: EventHandle = EventHandle(0);

    pub(crate) fn new(owner: NodeId, local_index: u32, generation: Generation) -> Self {
        let raw = ((owner.as_u32() as u128) << OWNER_SHIFT)
            | ((local_index as u128) << LOCAL_SHIFT)
            | (generation as u128);
        Self(raw)
    }

    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u128 {
        self.0
    }

    pub fn owner(&self) -> NodeId {
        NodeId::new(((self.0 & OWNER_MASK) >> OWNER_SHIFT) as u32)
    }

    pub fn local_index(&self) -> u32 {
        ((self.0 & LOCAL_MASK) >> LOCAL_SHIFT) as u32
    }

    pub fn generation(&self) -> Generation {
        (self.0 & GENERATION_MASK) as Generation
    }

    /// False only for [`EventHandle::NONE`].
    pub fn exists(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for EventHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if !self.exists() {
            return write!(f, "Event(none)");
        }
        write!(
            f,
            "Event(owner={}, local={}, gen={})",
            self.owner(),
            self.local_index(),
            self.generation()
        )
    }
}

/// Status returned from non-blocking event queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Ready,
    Poisoned,
}

/// Describes a poisoned event generation.
#[derive(Clone, Debug)]
pub struct EventPoison {
    handle: EventHandle,
    reason: Arc<str>,
}

impl EventPoison {
    pub fn new(handle: EventHandle, reason: impl Into<String>) -> Self {
        Self {
            handle,
            reason: Arc::<str>::from(reason.into()),
        }
    }

    fn from_shared(handle: EventHandle, reason: Arc<str>) -> Self {
        Self { handle, reason }
    }

    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl Display for EventPoison {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} poisoned: {}", self.handle, self.reason)
    }
}

impl std::error::Error for EventPoison {}

#[derive(Clone)]
enum CompletionKind {
    Triggered,
    Poisoned(Arc<EventPoison>),
}

struct SlotState {
    generation: Generation,
    completion: Option<CompletionKind>,
    wakers: Vec<Waker>,
}

struct EventSlot {
    index: u32,
    state: ParkingMutex<SlotState>,
}

impl EventSlot {
    fn status_for(&self, generation: Generation) -> EventStatus {
        let state = self.state.lock();
        if state.generation > generation {
            // Only triggered generations are recycled, so an older
            // generation always completed successfully.
            return EventStatus::Ready;
        }
        if state.generation < generation {
            return EventStatus::Pending;
        }
        match &state.completion {
            None => EventStatus::Pending,
            Some(CompletionKind::Triggered) => EventStatus::Ready,
            Some(CompletionKind::Poisoned(_)) => EventStatus::Poisoned,
        }
    }
}

/// Local event handle with the ability to trigger exactly once.
#[derive(Clone)]
pub struct LocalEvent {
    inner: Arc<LocalEventInner>,
}

struct LocalEventInner {
    system: Arc<LocalEventSystem>,
    slot: Arc<EventSlot>,
    handle: EventHandle,
    triggered: AtomicBool,
}

impl LocalEvent {
    pub fn handle(&self) -> EventHandle {
        self.inner.handle
    }

    /// Future for this event's completion, without going through the
    /// system-wide lookup.
    pub fn waiter(&self) -> EventWaiter {
        EventWaiter {
            slot: Some(self.inner.slot.clone()),
            generation: self.inner.handle.generation(),
            immediate: None,
        }
    }

    pub fn trigger(&self) -> Result<()> {
        if self
            .inner
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("{} already triggered", self.inner.handle);
        }
        self.inner.system.complete_slot(
            &self.inner.slot,
            self.inner.handle,
            CompletionKind::Triggered,
        )
    }

    pub fn poison(&self, reason: impl Into<String>) -> Result<()> {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let poison = Arc::new(EventPoison::new(self.inner.handle, reason));
        self.inner.system.complete_slot(
            &self.inner.slot,
            self.inner.handle,
            CompletionKind::Poisoned(poison),
        )
    }
}

/// Per-node event system with reusable event slots.
pub struct LocalEventSystem {
    node: NodeId,
    slots: DashMap<u32, Arc<EventSlot>>,
    free: ParkingMutex<VecDeque<Arc<EventSlot>>>,
    next_index: AtomicU32,
    tasks: TaskTracker,
    shutdown: AtomicBool,
}

impl LocalEventSystem {
    pub fn new(node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            node,
            slots: DashMap::new(),
            free: ParkingMutex::new(VecDeque::new()),
            next_index: AtomicU32::new(0),
            tasks: TaskTracker::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn task_tracker(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn new_event(self: &Arc<Self>) -> Result<LocalEvent> {
        if self.is_shutdown() {
            bail!("Event system shutdown in progress");
        }
        let (slot, generation) = self.allocate_slot()?;
        let handle = EventHandle::new(self.node, slot.index, generation);
        Ok(LocalEvent {
            inner: Arc::new(LocalEventInner {
                system: self.clone(),
                slot,
                handle,
                triggered: AtomicBool::new(false),
            }),
        })
    }

    pub fn trigger(&self, handle: EventHandle) -> Result<()> {
        let slot = self.lookup(handle)?;
        self.complete_slot(&slot, handle, CompletionKind::Triggered)
    }

    pub fn poison(&self, handle: EventHandle, reason: impl Into<String>) -> Result<()> {
        let slot = self.lookup(handle)?;
        match slot.status_for(handle.generation()) {
            EventStatus::Poisoned => return Ok(()),
            EventStatus::Ready => bail!("{} already completed successfully", handle),
            EventStatus::Pending => {}
        }
        let poison = Arc::new(EventPoison::new(handle, reason));
        self.complete_slot(&slot, handle, CompletionKind::Poisoned(poison))
    }

    /// Non-blocking status query. [`EventHandle::NONE`] is always `Ready`.
    pub fn poll(&self, handle: EventHandle) -> Result<EventStatus> {
        if !handle.exists() {
            return Ok(EventStatus::Ready);
        }
        let slot = self.lookup(handle)?;
        Ok(slot.status_for(handle.generation()))
    }

    pub fn has_triggered(&self, handle: EventHandle) -> bool {
        matches!(self.poll(handle), Ok(EventStatus::Ready))
    }

    /// Returns a future that completes when the event does.
    ///
    /// The future is cancellation safe: dropping it before completion leaves
    /// at most a stale waker behind, which is woken and discarded when the
    /// event completes.
    pub fn waiter(&self, handle: EventHandle) -> Result<EventWaiter> {
        if !handle.exists() {
            return Ok(EventWaiter {
                slot: None,
                generation: 0,
                immediate: Some(CompletionKind::Triggered),
            });
        }
        let slot = self.lookup(handle)?;
        Ok(EventWaiter {
            slot: Some(slot),
            generation: handle.generation(),
            immediate: None,
        })
    }

    /// Wait for the event, surfacing poison as an [`EventPoison`] error.
    pub async fn wait(&self, handle: EventHandle) -> Result<()> {
        self.waiter(handle)?.await.map_err(anyhow::Error::new)
    }

    /// Produce an event that triggers once every input has. Inputs equal to
    /// [`EventHandle::NONE`] are ignored; merging nothing yields `NONE`, and
    /// merging a single pending event returns it unchanged. If any input is
    /// poisoned the merged event is poisoned with the combined reasons.
    pub fn merge_events(self: &Arc<Self>, inputs: Vec<EventHandle>) -> Result<EventHandle> {
        let mut pending: Vec<EventHandle> = inputs.into_iter().filter(|e| e.exists()).collect();
        pending.retain(|e| !self.has_triggered(*e));
        match pending.len() {
            0 => return Ok(EventHandle::NONE),
            1 => return Ok(pending[0]),
            _ => {}
        }

        let merged = self.new_event()?;
        let handle = merged.handle();
        let system = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut reasons: Vec<String> = Vec::new();
            for dependency in pending {
                let result = match system.waiter(dependency) {
                    Ok(waiter) => waiter.await.map_err(anyhow::Error::new),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    reasons.push(format!("merge dependency {dependency} failed: {err}"));
                }
            }
            let result = if reasons.is_empty() {
                merged.trigger()
            } else {
                merged.poison(reasons.join("\n"))
            };
            if let Err(err) = result {
                error!("failed to complete merged event {handle}: {err}");
            }
        });
        Ok(handle)
    }

    /// Poison every pending generation. Used on node shutdown so waiters
    /// observe a typed failure instead of hanging.
    pub fn force_shutdown(&self, reason: impl Into<String>) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason: Arc<str> = Arc::from(reason.into());

        let mut pending = Vec::new();
        for entry in self.slots.iter() {
            let slot = entry.value();
            let generation = {
                let state = slot.state.lock();
                match state.completion {
                    None => state.generation,
                    Some(_) => continue,
                }
            };
            pending.push((slot.clone(), generation));
        }

        for (slot, generation) in pending {
            let handle = EventHandle::new(self.node, slot.index, generation);
            let poison = Arc::new(EventPoison::from_shared(handle, Arc::clone(&reason)));
            if let Err(err) = self.complete_slot(&slot, handle, CompletionKind::Poisoned(poison)) {
                error!("force_shutdown: failed to poison {handle}: {err}");
            }
        }

        self.free.lock().clear();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn lookup(&self, handle: EventHandle) -> Result<Arc<EventSlot>> {
        if handle.owner() != self.node {
            bail!("{} does not belong to node {}", handle, self.node);
        }
        self.slots
            .get(&handle.local_index())
            .map(|guard| guard.clone())
            .ok_or_else(|| anyhow!("Unknown local event {}", handle))
    }

    fn allocate_slot(self: &Arc<Self>) -> Result<(Arc<EventSlot>, Generation)> {
        if let Some(slot) = self.free.lock().pop_front() {
            let mut state = slot.state.lock();
            if state.completion.is_none() {
                bail!("event slot {} recycled while still active", slot.index);
            }
            state.generation += 1;
            state.completion = None;
            state.wakers.clear();
            let generation = state.generation;
            drop(state);
            return Ok((slot, generation));
        }

        let index = self
            .next_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < MAX_LOCAL_INDEX).then_some(current + 1)
            })
            .map_err(|_| anyhow!("Local event index space exhausted"))?;
        let slot = Arc::new(EventSlot {
            index,
            state: ParkingMutex::new(SlotState {
                generation: 1,
                completion: None,
                wakers: Vec::new(),
            }),
        });
        self.slots.insert(index, slot.clone());
        Ok((slot, 1))
    }

    fn complete_slot(
        &self,
        slot: &Arc<EventSlot>,
        handle: EventHandle,
        completion: CompletionKind,
    ) -> Result<()> {
        let wakers = {
            let mut state = slot.state.lock();
            if state.generation != handle.generation() {
                bail!("{} already recycled", handle);
            }
            if state.completion.is_some() {
                bail!("{} already completed", handle);
            }
            state.completion = Some(completion.clone());
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        // Poisoned generations keep their slot so late observers still see
        // the poison; generation exhaustion retires the slot entirely.
        if matches!(completion, CompletionKind::Triggered)
            && handle.generation() < MAX_GENERATION
            && !self.is_shutdown()
        {
            self.free.lock().push_back(slot.clone());
        }
        Ok(())
    }
}

/// Future returned by [`LocalEventSystem::waiter`].
pub struct EventWaiter {
    slot: Option<Arc<EventSlot>>,
    generation: Generation,
    immediate: Option<CompletionKind>,
}

impl Future for EventWaiter {
    type Output = Result<(), EventPoison>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(kind) = this.immediate.take() {
            return Poll::Ready(completion_result(kind));
        }
        let Some(slot) = this.slot.as_ref() else {
            return Poll::Ready(Ok(()));
        };
        let mut state = slot.state.lock();
        if state.generation > this.generation {
            return Poll::Ready(Ok(()));
        }
        debug_assert_eq!(state.generation, this.generation);
        if let Some(kind) = state.completion.clone() {
            return Poll::Ready(completion_result(kind));
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

fn completion_result(kind: CompletionKind) -> Result<(), EventPoison> {
    match kind {
        CompletionKind::Triggered => Ok(()),
        CompletionKind::Poisoned(poison) => Err((*poison).clone()),
    }
}
