// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! Connects any number of nodes through unbounded channels. Delivery is
//! ordered per sender/receiver pair and never blocks the sender. Each link
//! counts the messages it has sent, which lets tests assert that elided
//! collectives stay off the wire.

use bytes::Bytes;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::identity::NodeId;
use crate::transport::{Inbound, NodeLink, TransportError};

/// Shared wiring for a set of in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    routes: Arc<DashMap<NodeId, Sender<Inbound>>>,
    sent: Arc<DashMap<NodeId, Arc<AtomicU64>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its outbound link plus the queue its inbound
    /// traffic arrives on.
    pub fn join(&self, node: NodeId) -> (Arc<MemoryLink>, Receiver<Inbound>) {
        let (tx, rx) = flume::unbounded();
        self.routes.insert(node, tx);
        let counter = Arc::new(AtomicU64::new(0));
        self.sent.insert(node, counter.clone());
        let link = Arc::new(MemoryLink {
            node,
            routes: self.routes.clone(),
            counter,
        });
        (link, rx)
    }

    /// Number of messages `node` has sent so far.
    pub fn messages_sent(&self, node: NodeId) -> u64 {
        self.sent
            .get(&node)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Total messages sent by every node.
    pub fn total_messages(&self) -> u64 {
        self.sent
            .iter()
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }
}

/// Outbound link of one in-process node.
pub struct MemoryLink {
    node: NodeId,
    routes: Arc<DashMap<NodeId, Sender<Inbound>>>,
    counter: Arc<AtomicU64>,
}

impl NodeLink for MemoryLink {
    fn node(&self) -> NodeId {
        self.node
    }

    fn send(&self, target: NodeId, header: Bytes, payload: Bytes) -> Result<(), TransportError> {
        let route = self
            .routes
            .get(&target)
            .ok_or(TransportError::UnknownNode(target))?;
        route
            .send(Inbound {
                source: self.node,
                header,
                payload,
            })
            .map_err(|_| TransportError::Closed(target))?;
        self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_send_order_with_source() {
        let cluster = MemoryCluster::new();
        let (a, _a_rx) = cluster.join(NodeId::new(0));
        let (_b, b_rx) = cluster.join(NodeId::new(1));

        a.send(NodeId::new(1), Bytes::from_static(b"h1"), Bytes::new())
            .expect("send");
        a.send(NodeId::new(1), Bytes::from_static(b"h2"), Bytes::new())
            .expect("send");

        let first = b_rx.recv().expect("recv");
        let second = b_rx.recv().expect("recv");
        assert_eq!(first.source, NodeId::new(0));
        assert_eq!(&first.header[..], b"h1");
        assert_eq!(&second.header[..], b"h2");
        assert_eq!(cluster.messages_sent(NodeId::new(0)), 2);
        assert_eq!(cluster.messages_sent(NodeId::new(1)), 0);
    }

    #[test]
    fn unknown_target_is_an_error() {
        let cluster = MemoryCluster::new();
        let (a, _rx) = cluster.join(NodeId::new(0));
        let err = a
            .send(NodeId::new(9), Bytes::new(), Bytes::new())
            .expect_err("unknown");
        assert!(matches!(err, TransportError::UnknownNode(node) if node == NodeId::new(9)));
    }

    #[test]
    fn dropped_receiver_closes_the_route() {
        let cluster = MemoryCluster::new();
        let (a, _a_rx) = cluster.join(NodeId::new(0));
        let (_b, b_rx) = cluster.join(NodeId::new(1));
        drop(b_rx);
        let err = a
            .send(NodeId::new(1), Bytes::new(), Bytes::new())
            .expect_err("closed");
        assert!(matches!(err, TransportError::Closed(_)));
    }
}
