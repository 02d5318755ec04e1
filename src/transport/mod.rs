// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node-to-node transport abstraction and wire format.
//!
//! Every message between nodes is a fixed-layout header ([`Envelope`]) plus
//! an opaque payload. Headers route: they name the replicated operation and
//! the message kind, and carry just enough addressing for the receiver to
//! hand the payload to the right recipient. Payload contents are encoded by
//! the layers above (MessagePack for structured state).
//!
//! The [`NodeLink`] trait is the only thing the rest of the crate knows
//! about delivery. [`memory`] provides the in-process implementation used by
//! tests and single-process deployments.

pub mod memory;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::collective::{CollectiveId, Stage};
use crate::event::{EventHandle, Generation};
use crate::identity::{BarrierId, DistributedId, NodeId, ReplicationId, ShardId};
use crate::manager::MilestoneKind;

/// Errors surfaced by a [`NodeLink`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to node {0}")]
    UnknownNode(NodeId),

    #[error("link to node {0} is closed")]
    Closed(NodeId),
}

/// Errors produced while decoding an [`Envelope`] header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("header truncated: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("invalid collective stage encoding: {0}")]
    InvalidStage(i32),

    #[error("unknown milestone kind: {0}")]
    UnknownMilestone(u8),
}

/// Outbound half of a node's connectivity.
///
/// `send` must not block: implementations queue the message for delivery and
/// return. Messages between the same pair of nodes are delivered in send
/// order.
pub trait NodeLink: Send + Sync + 'static {
    /// Node this link sends from.
    fn node(&self) -> NodeId;

    fn send(&self, target: NodeId, header: Bytes, payload: Bytes) -> Result<(), TransportError>;
}

/// A received message, as handed to the node's dispatch loop.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub source: NodeId,
    pub header: Bytes,
    pub payload: Bytes,
}

/// Wire kind discriminant. One byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageKind {
    Startup = 0,
    Collective = 1,
    FutureMapRequest = 2,
    EquivalenceSetRequest = 3,
    BarrierArrive = 4,
    BarrierSubscribe = 5,
    BarrierTriggered = 6,
    Milestone = 7,
    TopView = 8,
    EventSubscribe = 9,
    EventTriggered = 10,
}

impl MessageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Startup),
            1 => Some(Self::Collective),
            2 => Some(Self::FutureMapRequest),
            3 => Some(Self::EquivalenceSetRequest),
            4 => Some(Self::BarrierArrive),
            5 => Some(Self::BarrierSubscribe),
            6 => Some(Self::BarrierTriggered),
            7 => Some(Self::Milestone),
            8 => Some(Self::TopView),
            9 => Some(Self::EventSubscribe),
            10 => Some(Self::EventTriggered),
            _ => None,
        }
    }
}

/// Routed message header.
///
/// The layout is `[replication: u64][kind: u8][fields...]`, all integers
/// little endian. `replication == 0` addresses the node runtime itself
/// (event bridge traffic); everything else is routed to the manager of that
/// replicated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub replication: ReplicationId,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Payload: MessagePack `StartupPayload`. Sent once per remote
    /// constituent node by the owner of a replicated operation.
    Startup,

    /// One hop of a collective. Payload: collective-specific MessagePack.
    Collective {
        target: ShardId,
        collective: CollectiveId,
        stage: Stage,
    },

    /// Ask `target` to respond with its future map view. Payload: request
    /// specific.
    FutureMapRequest { target: ShardId },

    /// Ask `target` to respond with equivalence set ownership. Payload:
    /// request specific.
    EquivalenceSetRequest { target: ShardId },

    /// Arrive at a barrier owned by the destination node. Payload: optional
    /// reduction contribution (empty when none).
    BarrierArrive {
        barrier: BarrierId,
        generation: Generation,
        count: u32,
    },

    /// Ask the barrier owner to report completion of a generation back to
    /// `node`. No payload.
    BarrierSubscribe {
        barrier: BarrierId,
        generation: Generation,
        node: NodeId,
    },

    /// Completion report for a subscribed barrier generation. Payload:
    /// MessagePack completion carrying the reduced value or a poison
    /// reason.
    BarrierTriggered {
        barrier: BarrierId,
        generation: Generation,
    },

    /// A constituent node reports that all of its local shards reached a
    /// milestone. Payload: per-kind MessagePack extras.
    Milestone { kind: MilestoneKind, node: NodeId },

    /// Request for the top view of a distributed instance. Payload: request
    /// specific.
    TopView {
        instance: DistributedId,
        requestor: ShardId,
    },

    /// Ask the owner of `event` to report its completion back to `node`.
    /// Sent with `replication == 0`. No payload.
    EventSubscribe { event: EventHandle, node: NodeId },

    /// Completion report for a subscribed event. Payload: MessagePack
    /// `Option<String>` poison reason.
    EventTriggered { event: EventHandle },
}

impl Envelope {
    pub fn new(replication: ReplicationId, message: Message) -> Self {
        Self {
            replication,
            message,
        }
    }

    /// Header addressed to the node runtime rather than any operation.
    pub fn node_control(message: Message) -> Self {
        Self::new(ReplicationId::new(0), message)
    }

    fn encoded_len(&self) -> usize {
        // replication + kind
        let fixed = 8 + 1;
        let fields = match &self.message {
            Message::Startup => 0,
            Message::Collective { .. } => 4 + 8 + 4 + 4,
            Message::FutureMapRequest { .. } => 4,
            Message::EquivalenceSetRequest { .. } => 4,
            Message::BarrierArrive { .. } => 8 + 4 + 4,
            Message::BarrierSubscribe { .. } => 8 + 4 + 4,
            Message::BarrierTriggered { .. } => 8 + 4,
            Message::Milestone { .. } => 1 + 4,
            Message::TopView { .. } => 8 + 4,
            Message::EventSubscribe { .. } => 16 + 4,
            Message::EventTriggered { .. } => 16,
        };
        fixed + fields
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u64_le(self.replication.as_u64());
        match &self.message {
            Message::Startup => {
                buf.put_u8(MessageKind::Startup as u8);
            }
            Message::Collective {
                target,
                collective,
                stage,
            } => {
                buf.put_u8(MessageKind::Collective as u8);
                buf.put_u32_le(target.as_u32());
                buf.put_u64_le(collective.index);
                buf.put_u32_le(collective.tag);
                buf.put_i32_le(stage.encode());
            }
            Message::FutureMapRequest { target } => {
                buf.put_u8(MessageKind::FutureMapRequest as u8);
                buf.put_u32_le(target.as_u32());
            }
            Message::EquivalenceSetRequest { target } => {
                buf.put_u8(MessageKind::EquivalenceSetRequest as u8);
                buf.put_u32_le(target.as_u32());
            }
            Message::BarrierArrive {
                barrier,
                generation,
                count,
            } => {
                buf.put_u8(MessageKind::BarrierArrive as u8);
                buf.put_u64_le(barrier.as_u64());
                buf.put_u32_le(*generation);
                buf.put_u32_le(*count);
            }
            Message::BarrierSubscribe {
                barrier,
                generation,
                node,
            } => {
                buf.put_u8(MessageKind::BarrierSubscribe as u8);
                buf.put_u64_le(barrier.as_u64());
                buf.put_u32_le(*generation);
                buf.put_u32_le(node.as_u32());
            }
            Message::BarrierTriggered {
                barrier,
                generation,
            } => {
                buf.put_u8(MessageKind::BarrierTriggered as u8);
                buf.put_u64_le(barrier.as_u64());
                buf.put_u32_le(*generation);
            }
            Message::Milestone { kind, node } => {
                buf.put_u8(MessageKind::Milestone as u8);
                buf.put_u8(kind.as_u8());
                buf.put_u32_le(node.as_u32());
            }
            Message::TopView {
                instance,
                requestor,
            } => {
                buf.put_u8(MessageKind::TopView as u8);
                buf.put_u64_le(instance.as_u64());
                buf.put_u32_le(requestor.as_u32());
            }
            Message::EventSubscribe { event, node } => {
                buf.put_u8(MessageKind::EventSubscribe as u8);
                buf.put_u128_le(event.raw());
                buf.put_u32_le(node.as_u32());
            }
            Message::EventTriggered { event } => {
                buf.put_u8(MessageKind::EventTriggered as u8);
                buf.put_u128_le(event.raw());
            }
        }
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf.freeze()
    }

    pub fn decode(header: &[u8]) -> Result<Self, EnvelopeError> {
        let mut buf = header;
        let replication = ReplicationId::new(take(&mut buf, 8)?.get_u64_le());
        let kind_byte = take(&mut buf, 1)?.get_u8();
        let kind = MessageKind::from_u8(kind_byte).ok_or(EnvelopeError::UnknownKind(kind_byte))?;
        let message = match kind {
            MessageKind::Startup => Message::Startup,
            MessageKind::Collective => {
                let target = ShardId::new(take(&mut buf, 4)?.get_u32_le());
                let index = take(&mut buf, 8)?.get_u64_le();
                let tag = take(&mut buf, 4)?.get_u32_le();
                let raw_stage = take(&mut buf, 4)?.get_i32_le();
                let stage =
                    Stage::decode(raw_stage).ok_or(EnvelopeError::InvalidStage(raw_stage))?;
                Message::Collective {
                    target,
                    collective: CollectiveId { index, tag },
                    stage,
                }
            }
            MessageKind::FutureMapRequest => Message::FutureMapRequest {
                target: ShardId::new(take(&mut buf, 4)?.get_u32_le()),
            },
            MessageKind::EquivalenceSetRequest => Message::EquivalenceSetRequest {
                target: ShardId::new(take(&mut buf, 4)?.get_u32_le()),
            },
            MessageKind::BarrierArrive => Message::BarrierArrive {
                barrier: BarrierId::new(take(&mut buf, 8)?.get_u64_le()),
                generation: take(&mut buf, 4)?.get_u32_le(),
                count: take(&mut buf, 4)?.get_u32_le(),
            },
            MessageKind::BarrierSubscribe => Message::BarrierSubscribe {
                barrier: BarrierId::new(take(&mut buf, 8)?.get_u64_le()),
                generation: take(&mut buf, 4)?.get_u32_le(),
                node: NodeId::new(take(&mut buf, 4)?.get_u32_le()),
            },
            MessageKind::BarrierTriggered => Message::BarrierTriggered {
                barrier: BarrierId::new(take(&mut buf, 8)?.get_u64_le()),
                generation: take(&mut buf, 4)?.get_u32_le(),
            },
            MessageKind::Milestone => {
                let kind_byte = take(&mut buf, 1)?.get_u8();
                let kind = MilestoneKind::from_u8(kind_byte)
                    .ok_or(EnvelopeError::UnknownMilestone(kind_byte))?;
                Message::Milestone {
                    kind,
                    node: NodeId::new(take(&mut buf, 4)?.get_u32_le()),
                }
            }
            MessageKind::TopView => Message::TopView {
                instance: DistributedId::new(take(&mut buf, 8)?.get_u64_le()),
                requestor: ShardId::new(take(&mut buf, 4)?.get_u32_le()),
            },
            MessageKind::EventSubscribe => Message::EventSubscribe {
                event: EventHandle::from_raw(take(&mut buf, 16)?.get_u128_le()),
                node: NodeId::new(take(&mut buf, 4)?.get_u32_le()),
            },
            MessageKind::EventTriggered => Message::EventTriggered {
                event: EventHandle::from_raw(take(&mut buf, 16)?.get_u128_le()),
            },
        };
        Ok(Self {
            replication,
            message,
        })
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], EnvelopeError> {
    if buf.remaining() < len {
        return Err(EnvelopeError::Truncated {
            needed: len - buf.remaining(),
            remaining: buf.remaining(),
        });
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) {
        let encoded = envelope.encode();
        let decoded = Envelope::decode(&encoded).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn roundtrip_all_kinds() {
        let repl = ReplicationId::new(42);
        roundtrip(Envelope::new(repl, Message::Startup));
        roundtrip(Envelope::new(
            repl,
            Message::Collective {
                target: ShardId::new(3),
                collective: CollectiveId {
                    index: 17,
                    tag: 0xdead_beef,
                },
                stage: Stage::Butterfly(2),
            },
        ));
        roundtrip(Envelope::new(
            repl,
            Message::FutureMapRequest {
                target: ShardId::new(9),
            },
        ));
        roundtrip(Envelope::new(
            repl,
            Message::EquivalenceSetRequest {
                target: ShardId::new(1),
            },
        ));
        roundtrip(Envelope::new(
            repl,
            Message::BarrierArrive {
                barrier: BarrierId::new(5),
                generation: 2,
                count: 1,
            },
        ));
        roundtrip(Envelope::new(
            repl,
            Message::BarrierSubscribe {
                barrier: BarrierId::new(5),
                generation: 2,
                node: NodeId::new(1),
            },
        ));
        roundtrip(Envelope::new(
            repl,
            Message::BarrierTriggered {
                barrier: BarrierId::new(5),
                generation: 2,
            },
        ));
        roundtrip(Envelope::new(
            repl,
            Message::Milestone {
                kind: MilestoneKind::Executed,
                node: NodeId::new(2),
            },
        ));
        roundtrip(Envelope::new(
            repl,
            Message::TopView {
                instance: DistributedId::new(77),
                requestor: ShardId::new(0),
            },
        ));
        roundtrip(Envelope::node_control(Message::EventSubscribe {
            event: EventHandle::from_raw(0x1234_5678_9abc_def0_1111_2222_3333_4444),
            node: NodeId::new(4),
        }));
        roundtrip(Envelope::node_control(Message::EventTriggered {
            event: EventHandle::from_raw(1),
        }));
    }

    #[test]
    fn stage_encodings_roundtrip() {
        for stage in [
            Stage::Tree,
            Stage::Remainder,
            Stage::Butterfly(0),
            Stage::Butterfly(31),
        ] {
            roundtrip(Envelope::new(
                ReplicationId::new(1),
                Message::Collective {
                    target: ShardId::new(0),
                    collective: CollectiveId { index: 1, tag: 2 },
                    stage,
                },
            ));
        }
    }

    #[test]
    fn truncated_header_is_rejected() {
        let encoded = Envelope::new(
            ReplicationId::new(1),
            Message::BarrierArrive {
                barrier: BarrierId::new(5),
                generation: 0,
                count: 1,
            },
        )
        .encode();
        for len in 0..encoded.len() {
            assert!(matches!(
                Envelope::decode(&encoded[..len]),
                Err(EnvelopeError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u64_le(1);
        raw.put_u8(0xff);
        assert_eq!(
            Envelope::decode(&raw),
            Err(EnvelopeError::UnknownKind(0xff))
        );
    }

    #[test]
    fn invalid_stage_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u64_le(1);
        raw.put_u8(MessageKind::Collective as u8);
        raw.put_u32_le(0);
        raw.put_u64_le(1);
        raw.put_u32_le(2);
        raw.put_i32_le(-7);
        assert_eq!(Envelope::decode(&raw), Err(EnvelopeError::InvalidStage(-7)));
    }
}
