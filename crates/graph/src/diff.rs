//! The per-commit change set.
//!
//! A [GraphDiff] is a pure function of (previous committed snapshot,
//! requested mutations): replaying the same mutations produces the same
//! diff once, and a commit with nothing pending produces an empty diff.
//! Command order is fixed — destroys, creates, disconnects, connects,
//! resizes, values, messages — so the simulation layer and tests can
//! assert on it.

use util::collections::Map;

use crate::topology::{EdgeId, EdgeTag, Node, PortId, Topology};

/// Pending buffer resizes are keyed by the byte offset of the field's
/// (ptr, len) pair. Fields in the kernel-data record use [STATE_PORT].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ResizeKey {
    pub node: Node,
    pub port: PortId,
    pub offset: usize,
}

/// Sentinel port id addressing buffer fields of the kernel-data record.
pub const STATE_PORT: PortId = PortId::MAX;

#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    NodeDestroyed {
        node: Node,
    },
    NodeCreated {
        node: Node,
    },
    Disconnected {
        edge: EdgeId,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: u16,
        tag: EdgeTag,
    },
    Connected {
        edge: EdgeId,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: u16,
        tag: EdgeTag,
    },
    BufferResized {
        node: Node,
        port: PortId,
        field_offset: usize,
        len: usize,
        elem_size: usize,
    },
    ValueWritten {
        node: Node,
        port: PortId,
        index: u16,
    },
    Message {
        node: Node,
        port: PortId,
        bytes: Box<[u8]>,
    },
}

/// The ordered change set produced by one commit, returned to the caller
/// for diagnostics and testing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphDiff {
    pub changes: Vec<Change>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

pub(crate) struct PendingValue {
    pub node: Node,
    pub port: PortId,
    pub index: u16,
    pub bytes: Box<[u8]>,
}

pub(crate) struct PendingMessage {
    pub node: Node,
    pub port: PortId,
    pub bytes: Box<[u8]>,
}

pub(crate) struct PendingDeferred {
    pub node: Node,
    pub port: PortId,
    pub index: u16,
    pub bytes: Box<[u8]>,
}

/// Mutations that carry data rather than structure, validated when
/// requested and folded into the diff at commit.
#[derive(Default)]
pub(crate) struct PendingData {
    pub resizes: Map<ResizeKey, (usize, usize)>, // -> (len, elem_size)
    pub resize_order: Vec<ResizeKey>,
    pub values: Vec<PendingValue>,
    pub messages: Vec<PendingMessage>,
    pub deferred: Vec<PendingDeferred>,
}

impl PendingData {
    /// Record a resize request. Re-requesting the pending size is a no-op.
    pub fn request_resize(&mut self, key: ResizeKey, len: usize, elem_size: usize) {
        match self.resizes.get(&key) {
            Some(&(pending, _)) if pending == len => {}
            Some(_) => {
                self.resizes.insert(key, (len, elem_size));
            }
            None => {
                self.resizes.insert(key, (len, elem_size));
                self.resize_order.push(key);
            }
        }
    }

    /// Cancel a pending resize (the "empty request" form of the command).
    pub fn cancel_resize(&mut self, key: ResizeKey) {
        self.resizes.remove(&key);
    }

    /// Destroying a node cancels everything pending against it, leaving the
    /// rest of the diff intact.
    pub fn cancel_node(&mut self, node: Node) {
        self.resizes.retain(|key, _| key.node != node);
        self.values.retain(|value| value.node != node);
        self.messages.retain(|message| message.node != node);
        self.deferred.retain(|deferred| deferred.node != node);
    }

    pub fn clear(&mut self) {
        self.resizes.clear();
        self.resize_order.clear();
        self.values.clear();
        self.messages.clear();
        self.deferred.clear();
    }
}

/// Compare the last committed snapshot against the live graph and fold the
/// pending data mutations in.
pub(crate) fn build(committed: &Topology, live: &Topology, pending: &PendingData) -> GraphDiff {
    let mut changes = Vec::new();

    let mut destroyed: Vec<_> = committed
        .nodes
        .iter()
        .filter(|(handle, _)| !live.nodes.contains(*handle))
        .map(|(handle, record)| (record.seq, Node(handle)))
        .collect();
    destroyed.sort_unstable();
    changes.extend(
        destroyed
            .into_iter()
            .map(|(_, node)| Change::NodeDestroyed { node }),
    );

    let mut created: Vec<_> = live
        .nodes
        .iter()
        .filter(|(handle, _)| !committed.nodes.contains(*handle))
        .map(|(handle, record)| (record.seq, Node(handle)))
        .collect();
    created.sort_unstable();
    changes.extend(
        created
            .into_iter()
            .map(|(_, node)| Change::NodeCreated { node }),
    );

    for (id, record) in committed.live_edges() {
        if live.edge(id).is_none() {
            changes.push(Change::Disconnected {
                edge: id,
                source: record.source,
                source_port: record.source_port,
                dest: record.dest,
                dest_port: record.dest_port,
                dest_index: record.dest_index,
                tag: record.tag,
            });
        }
    }

    for (id, record) in live.live_edges() {
        if committed.edge(id).is_none() {
            changes.push(Change::Connected {
                edge: id,
                source: record.source,
                source_port: record.source_port,
                dest: record.dest,
                dest_port: record.dest_port,
                dest_index: record.dest_index,
                tag: record.tag,
            });
        }
    }

    for key in &pending.resize_order {
        let Some(&(len, elem_size)) = pending.resizes.get(key) else {
            continue; // cancelled
        };
        changes.push(Change::BufferResized {
            node: key.node,
            port: key.port,
            field_offset: key.offset,
            len,
            elem_size,
        });
    }

    changes.extend(pending.values.iter().map(|value| Change::ValueWritten {
        node: value.node,
        port: value.port,
        index: value.index,
    }));

    changes.extend(pending.messages.iter().map(|message| Change::Message {
        node: message.node,
        port: message.port,
        bytes: message.bytes.clone(),
    }));

    GraphDiff { changes }
}
