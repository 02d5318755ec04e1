// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named arrival barriers.
//!
//! A barrier completes one generation when a fixed number of arrivals has
//! been registered for it. Generations are explicit: shards may arrive at
//! generation `g + 1` before `g` has completed, and each generation
//! completes its own event. An optional [`BarrierReduction`] folds arrival
//! payloads into a single value that is published with the completion.
//!
//! Barrier state lives on the owning node; remote shards arrive and
//! subscribe through the manager's message routing.

use anyhow::{Result, bail};
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use crate::event::{EventHandle, Generation, LocalEvent, LocalEventSystem};
use crate::identity::{BarrierId, NodeId};

/// Folds arrival payloads into one value per barrier generation.
pub trait BarrierReduction: Send + Sync + 'static {
    /// Accumulator before any arrival has contributed.
    fn identity(&self) -> Bytes;

    /// Folds one arrival payload into the accumulator. Must be associative
    /// and commutative so that arrival order cannot change the result.
    fn fold(&self, accumulator: Bytes, arrival: Bytes) -> Result<Bytes>;
}

/// Wire description of a barrier: enough for any shard to arrive at it and
/// wait on it, wherever its state lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierDescriptor {
    pub id: BarrierId,
    pub owner: NodeId,
    /// Arrivals required to complete one generation.
    pub arrivals: u32,
}

struct GenerationState {
    count: u32,
    event: LocalEvent,
    value: Option<Bytes>,
    done: bool,
}

/// Owner-side barrier state.
pub struct ShardBarrier {
    descriptor: BarrierDescriptor,
    reduction: Option<Arc<dyn BarrierReduction>>,
    events: Arc<LocalEventSystem>,
    generations: ParkingMutex<BTreeMap<Generation, GenerationState>>,
}

impl ShardBarrier {
    pub fn new(
        descriptor: BarrierDescriptor,
        reduction: Option<Arc<dyn BarrierReduction>>,
        events: Arc<LocalEventSystem>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            reduction,
            events,
            generations: ParkingMutex::new(BTreeMap::new()),
        })
    }

    pub fn descriptor(&self) -> BarrierDescriptor {
        self.descriptor
    }

    pub fn id(&self) -> BarrierId {
        self.descriptor.id
    }

    pub fn arrivals(&self) -> u32 {
        self.descriptor.arrivals
    }

    /// True once any generation has seen an arrival or handed out a wait
    /// event.
    pub fn has_generations(&self) -> bool {
        !self.generations.lock().is_empty()
    }

    /// Registers `count` arrivals at one generation. A payload is folded
    /// into the generation's reduction exactly once per call, independent of
    /// `count`. Completing the generation triggers its event.
    pub fn arrive(&self, generation: Generation, count: u32, payload: Option<Bytes>) -> Result<()> {
        debug_assert!(count > 0);
        let completed = {
            let mut generations = self.generations.lock();
            let state = Self::generation_entry(&self.events, &mut generations, generation)?;
            if state.done || state.count + count > self.descriptor.arrivals {
                bail!(
                    "barrier {} generation {generation} over-arrived ({} + {count} of {})",
                    self.descriptor.id,
                    state.count,
                    self.descriptor.arrivals
                );
            }
            state.count += count;

            if let (Some(reduction), Some(arrival)) = (self.reduction.as_ref(), payload) {
                let accumulator = match state.value.take() {
                    Some(acc) => acc,
                    None => reduction.identity(),
                };
                match reduction.fold(accumulator, arrival) {
                    Ok(folded) => state.value = Some(folded),
                    Err(err) => {
                        state.done = true;
                        let event = state.event.clone();
                        drop(generations);
                        event.poison(format!(
                            "barrier {} reduction failed: {err}",
                            self.descriptor.id
                        ))?;
                        return Err(err);
                    }
                }
            }

            if state.count == self.descriptor.arrivals {
                state.done = true;
                if let (Some(reduction), None) = (self.reduction.as_ref(), state.value.as_ref()) {
                    // No arrival carried a payload this generation.
                    state.value = Some(reduction.identity());
                }
                Some(state.event.clone())
            } else {
                None
            }
        };
        if let Some(event) = completed {
            event.trigger()?;
        }
        Ok(())
    }

    /// Event that triggers when the generation completes. May be requested
    /// before any arrival.
    pub fn wait(&self, generation: Generation) -> Result<EventHandle> {
        let mut generations = self.generations.lock();
        let state = Self::generation_entry(&self.events, &mut generations, generation)?;
        Ok(state.event.handle())
    }

    /// Reduced value of a completed generation, if the barrier carries a
    /// reduction. `None` while the generation is still collecting arrivals.
    pub fn reduced(&self, generation: Generation) -> Option<Bytes> {
        let generations = self.generations.lock();
        generations
            .get(&generation)
            .filter(|state| state.done)
            .and_then(|state| state.value.clone())
    }

    fn generation_entry<'a>(
        events: &Arc<LocalEventSystem>,
        generations: &'a mut BTreeMap<Generation, GenerationState>,
        generation: Generation,
    ) -> Result<&'a mut GenerationState> {
        match generations.entry(generation) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(vacant) => {
                let event = events.new_event()?;
                Ok(vacant.insert(GenerationState {
                    count: 0,
                    event,
                    value: None,
                    done: false,
                }))
            }
        }
    }
}
