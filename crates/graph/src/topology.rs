//! The logical connection graph: a directed multigraph over versioned node
//! handles, with edge slots recycled through a free list.
//!
//! All structural validation happens here, eagerly, at the mutating call:
//! duplicate edges, occupied inputs, bad array indices, and cycles of
//! `Normal` edges are rejected before anything is recorded. Removing an
//! edge returns its slot to the free list and bumps the slot version, so an
//! [EdgeId] held across a tick boundary detects staleness instead of
//! reading a recycled record.

use kernel::{Direction, KernelType, Port};
use util::collections::{BitSet, Map};
use util::slot;

use crate::error::{Error, Result};

/// An opaque, versioned node handle. Destroying the node permanently
/// invalidates every copy of the handle, even if the slot is reused.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Node(pub(crate) slot::Handle);

/// A versioned edge handle.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EdgeId {
    pub(crate) index: u32,
    pub(crate) version: u32,
}

/// Port ids index a kernel type's declared port list.
pub type PortId = u16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EdgeTag {
    /// Imposes producer-before-consumer ordering within a tick.
    Normal,
    /// No ordering constraint; the consumer reads the previous tick's
    /// value. The only legal way to close a cycle.
    Feedback,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct EdgeRecord {
    pub source: Node,
    pub source_port: PortId,
    pub dest: Node,
    pub dest_port: PortId,
    pub dest_index: u16,
    pub tag: EdgeTag,
    /// False for message-kind connections, which carry no data dependency.
    pub data: bool,
}

#[derive(Clone)]
pub(crate) struct EdgeSlot {
    pub version: u32,
    pub record: Option<EdgeRecord>,
}

#[derive(Clone)]
pub(crate) struct NodeRecord {
    pub kernel: Option<&'static KernelType>,
    /// Monotonic creation sequence, the scheduler's tie-break.
    pub seq: u64,
    /// Per input port, per array slot: the edge feeding it.
    pub incoming: Vec<Box<[Option<EdgeId>]>>,
    /// Per output port: edges leaving it.
    pub outgoing: Vec<Vec<EdgeId>>,
    /// Logical port-array lengths (<= declared capacity).
    pub array_len: Vec<u16>,
    /// Origin port -> next hop of the forwarding chain.
    pub forwards: Map<PortId, (Node, PortId)>,
}

#[derive(Clone)]
pub(crate) struct Topology {
    pub nodes: slot::Table<NodeRecord>,
    pub edges: Vec<EdgeSlot>,
    pub free_edges: Vec<u32>,
    next_seq: u64,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            nodes: slot::Table::new(),
            edges: Vec::new(),
            free_edges: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn add_node(&mut self, kernel: Option<&'static KernelType>) -> Node {
        let ports = kernel.map(|k| k.ports).unwrap_or(&[]);
        let incoming = ports
            .iter()
            .map(|port| vec![None; port.slots()].into_boxed_slice())
            .collect();
        let outgoing = ports.iter().map(|_| Vec::new()).collect();
        let array_len = ports
            .iter()
            .map(|port| port.array.unwrap_or(1))
            .collect();
        let seq = self.next_seq;
        self.next_seq += 1;
        Node(self.nodes.insert(NodeRecord {
            kernel,
            seq,
            incoming,
            outgoing,
            array_len,
            forwards: Map::default(),
        }))
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, node: Node) -> Result<()> {
        let record = self.nodes.get(node.0).ok_or(Error::InvalidHandle)?;
        let mut edges: Vec<EdgeId> = record
            .outgoing
            .iter()
            .flatten()
            .copied()
            .chain(record.incoming.iter().flat_map(|slots| slots.iter().flatten().copied()))
            .collect();
        edges.sort_unstable();
        edges.dedup();
        for edge in edges {
            self.disconnect(edge)?;
        }
        self.nodes.remove(node.0);
        Ok(())
    }

    pub fn contains(&self, node: Node) -> bool {
        self.nodes.contains(node.0)
    }

    pub fn node(&self, node: Node) -> Result<&NodeRecord> {
        self.nodes.get(node.0).ok_or(Error::InvalidHandle)
    }

    fn node_mut(&mut self, node: Node) -> Result<&mut NodeRecord> {
        self.nodes.get_mut(node.0).ok_or(Error::InvalidHandle)
    }

    /// A node's declared port descriptor.
    pub fn port(&self, node: Node, port: PortId) -> Result<&'static Port> {
        let record = self.node(node)?;
        let kernel = record.kernel.ok_or(Error::InvalidPort)?;
        kernel.ports.get(port as usize).ok_or(Error::InvalidPort)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&EdgeRecord> {
        let slot = self.edges.get(id.index as usize)?;
        if slot.version != id.version {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn live_edges(&self) -> impl Iterator<Item = (EdgeId, &EdgeRecord)> {
        self.edges.iter().enumerate().filter_map(|(index, slot)| {
            let record = slot.record.as_ref()?;
            Some((
                EdgeId {
                    index: index as u32,
                    version: slot.version,
                },
                record,
            ))
        })
    }

    pub fn connect(
        &mut self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: Option<u16>,
        tag: EdgeTag,
    ) -> Result<EdgeId> {
        let src_desc = self.port(source, source_port)?;
        let dst_desc = self.port(dest, dest_port)?;
        if src_desc.direction != Direction::Output || dst_desc.direction != Direction::Input {
            return Err(Error::InvalidPort);
        }
        if src_desc.kind != dst_desc.kind {
            return Err(Error::KindMismatch);
        }
        let data = src_desc.kind.is_data();
        if !data && tag == EdgeTag::Feedback {
            // A message edge never carries a previous-tick value.
            return Err(Error::KindMismatch);
        }

        let dest_record = self.node(dest)?;
        let index = match (dst_desc.array, dest_index) {
            (None, None) => 0,
            (None, Some(_)) => return Err(Error::PortIndexOutOfRange),
            (Some(_), index) => {
                let index = index.unwrap_or(0);
                if index >= dest_record.array_len[dest_port as usize] {
                    return Err(Error::PortIndexOutOfRange);
                }
                index
            }
        };

        let occupant = dest_record.incoming[dest_port as usize][index as usize];
        if let Some(existing) = occupant {
            let record = self.edge(existing).expect("binding references dead edge");
            if record.source == source && record.source_port == source_port && record.tag == tag {
                return Err(Error::DuplicateConnection);
            }
            return Err(Error::PortOccupied);
        }

        if data && tag == EdgeTag::Normal && self.reaches(dest, source) {
            return Err(Error::CycleDetected);
        }

        let record = EdgeRecord {
            source,
            source_port,
            dest,
            dest_port,
            dest_index: index,
            tag,
            data,
        };
        let id = self.store_edge(record);
        self.node_mut(source)?.outgoing[source_port as usize].push(id);
        self.node_mut(dest)?.incoming[dest_port as usize][index as usize] = Some(id);
        Ok(id)
    }

    pub fn disconnect(&mut self, id: EdgeId) -> Result<()> {
        let slot = self
            .edges
            .get_mut(id.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.version != id.version {
            return Err(Error::InvalidHandle);
        }
        let record = slot.record.take().ok_or(Error::InvalidHandle)?;
        slot.version = slot.version.wrapping_add(1);
        self.free_edges.push(id.index);

        if let Ok(source) = self.node_mut(record.source) {
            source.outgoing[record.source_port as usize].retain(|edge| *edge != id);
        }
        if let Ok(dest) = self.node_mut(record.dest) {
            dest.incoming[record.dest_port as usize][record.dest_index as usize] = None;
        }
        Ok(())
    }

    /// Find the edge between two concrete ports. Removing an array-port
    /// connection requires the exact index.
    pub fn find_edge(
        &self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: Option<u16>,
    ) -> Result<EdgeId> {
        let record = self.node(dest)?;
        let slots = record
            .incoming
            .get(dest_port as usize)
            .ok_or(Error::InvalidPort)?;
        let index = dest_index.unwrap_or(0) as usize;
        let id = slots
            .get(index)
            .copied()
            .ok_or(Error::PortIndexOutOfRange)?
            .ok_or(Error::InvalidHandle)?;
        let edge = self.edge(id).ok_or(Error::InvalidHandle)?;
        if edge.source != source || edge.source_port != source_port {
            return Err(Error::InvalidHandle);
        }
        Ok(id)
    }

    /// Shrink or grow a port array's logical length. Shrinking below the
    /// highest connected index is rejected until that connection is removed,
    /// so no edge is ever left dangling.
    pub fn set_array_len(&mut self, node: Node, port: PortId, len: u16) -> Result<()> {
        let desc = self.port(node, port)?;
        let capacity = desc.array.ok_or(Error::InvalidPort)?;
        if len > capacity {
            return Err(Error::PortIndexOutOfRange);
        }
        let record = self.node_mut(node)?;
        let highest = record.incoming[port as usize]
            .iter()
            .rposition(|slot| slot.is_some());
        if let Some(highest) = highest {
            if (len as usize) <= highest {
                return Err(Error::PortArrayInUse);
            }
        }
        record.array_len[port as usize] = len;
        Ok(())
    }

    /// Would `to` be reachable from `from` along `Normal` data edges?
    fn reaches(&self, from: Node, to: Node) -> bool {
        if from == to {
            return true;
        }
        let mut visited = BitSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if visited.get(node.0.index()) {
                continue;
            }
            visited.set(node.0.index());
            let Some(record) = self.nodes.get(node.0) else {
                continue;
            };
            for edge in record.outgoing.iter().flatten() {
                let Some(record) = self.edge(*edge) else {
                    continue;
                };
                if record.tag == EdgeTag::Normal && record.data {
                    stack.push(record.dest);
                }
            }
        }
        false
    }

    fn store_edge(&mut self, record: EdgeRecord) -> EdgeId {
        if let Some(index) = self.free_edges.pop() {
            let slot = &mut self.edges[index as usize];
            debug_assert!(slot.record.is_none());
            slot.record = Some(record);
            return EdgeId {
                index,
                version: slot.version,
            };
        }
        let index = self.edges.len() as u32;
        self.edges.push(EdgeSlot {
            version: 0,
            record: Some(record),
        });
        EdgeId { index, version: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::{port, Invoke, Kernel, Status};

    #[derive(Default)]
    struct Pipe;

    impl Kernel for Pipe {
        const NAME: &'static str = "pipe";
        const PORTS: &'static [Port] = &[
            Port::input("in", port::F32),
            Port::output("out", port::F32),
        ];

        fn invoke(&mut self, _cx: &mut Invoke<'_>) -> Status {
            Status::Ok
        }
    }

    #[derive(Default)]
    struct Merge;

    impl Kernel for Merge {
        const NAME: &'static str = "merge";
        const PORTS: &'static [Port] = &[
            Port::input("in", port::F32).array(4),
            Port::output("out", port::F32),
        ];

        fn invoke(&mut self, _cx: &mut Invoke<'_>) -> Status {
            Status::Ok
        }
    }

    fn pipe(topo: &mut Topology) -> Node {
        topo.add_node(Some(KernelType::of::<Pipe>()))
    }

    #[test]
    fn duplicate_and_occupied_are_distinct() {
        let mut topo = Topology::new();
        let a = pipe(&mut topo);
        let b = pipe(&mut topo);
        let c = pipe(&mut topo);
        topo.connect(a, 1, c, 0, None, EdgeTag::Normal).unwrap();
        assert_eq!(
            topo.connect(a, 1, c, 0, None, EdgeTag::Normal),
            Err(Error::DuplicateConnection)
        );
        assert_eq!(
            topo.connect(b, 1, c, 0, None, EdgeTag::Normal),
            Err(Error::PortOccupied)
        );
    }

    #[test]
    fn normal_cycles_rejected_feedback_allowed() {
        let mut topo = Topology::new();
        let a = pipe(&mut topo);
        let b = pipe(&mut topo);
        topo.connect(a, 1, b, 0, None, EdgeTag::Normal).unwrap();
        assert_eq!(
            topo.connect(b, 1, a, 0, None, EdgeTag::Normal),
            Err(Error::CycleDetected)
        );
        topo.connect(b, 1, a, 0, None, EdgeTag::Feedback).unwrap();
        // Self-edges follow the same rule.
        let c = pipe(&mut topo);
        assert_eq!(
            topo.connect(c, 1, c, 0, None, EdgeTag::Normal),
            Err(Error::CycleDetected)
        );
    }

    #[test]
    fn disconnect_bumps_edge_version() {
        let mut topo = Topology::new();
        let a = pipe(&mut topo);
        let b = pipe(&mut topo);
        let edge = topo.connect(a, 1, b, 0, None, EdgeTag::Normal).unwrap();
        topo.disconnect(edge).unwrap();
        assert!(topo.edge(edge).is_none());
        assert_eq!(topo.disconnect(edge), Err(Error::InvalidHandle));

        // The slot is reused with a fresh version.
        let again = topo.connect(a, 1, b, 0, None, EdgeTag::Normal).unwrap();
        assert_eq!(again.index, edge.index);
        assert_ne!(again.version, edge.version);
    }

    #[test]
    fn destroyed_node_handles_stay_dead() {
        let mut topo = Topology::new();
        let a = pipe(&mut topo);
        let b = pipe(&mut topo);
        topo.connect(a, 1, b, 0, None, EdgeTag::Normal).unwrap();
        topo.remove_node(a).unwrap();
        assert!(!topo.contains(a));
        assert_eq!(topo.remove_node(a), Err(Error::InvalidHandle));
        // The peer's input binding was cleared with the edge.
        assert!(topo.node(b).unwrap().incoming[0][0].is_none());

        let reused = pipe(&mut topo);
        assert_eq!(reused.0.index(), a.0.index());
        assert!(!topo.contains(a));
    }

    #[test]
    fn array_ports_enforce_indices() {
        let mut topo = Topology::new();
        let merge = topo.add_node(Some(KernelType::of::<Merge>()));
        let a = pipe(&mut topo);
        let b = pipe(&mut topo);
        topo.connect(a, 1, merge, 0, Some(2), EdgeTag::Normal).unwrap();
        topo.connect(b, 1, merge, 0, Some(0), EdgeTag::Normal).unwrap();
        assert_eq!(
            topo.connect(b, 1, merge, 0, Some(4), EdgeTag::Normal),
            Err(Error::PortIndexOutOfRange)
        );
        // Shrinking past the highest connected slot is refused...
        assert_eq!(topo.set_array_len(merge, 0, 2), Err(Error::PortArrayInUse));
        // ...until that connection is removed.
        let edge = topo.find_edge(a, 1, merge, 0, Some(2)).unwrap();
        topo.disconnect(edge).unwrap();
        topo.set_array_len(merge, 0, 2).unwrap();
        assert_eq!(
            topo.connect(a, 1, merge, 0, Some(3), EdgeTag::Normal),
            Err(Error::PortIndexOutOfRange)
        );
    }
}
