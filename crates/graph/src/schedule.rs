//! Plan construction: a deterministic topological order over `Normal` data
//! edges.
//!
//! Ties between independent nodes break on node creation order (lowest
//! sequence first). That choice only affects scheduling fairness, never
//! correctness, but it is fixed and tested so plans are reproducible.
//! `Feedback` edges contribute no constraint — their consumers read the
//! previous tick — and nodes without kernels are not scheduled at all.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use util::collections::Map;

use crate::topology::{EdgeTag, Node, Topology};

pub(crate) struct Plan {
    /// Kernel nodes in execution order.
    pub order: Vec<Node>,
    /// Per position: number of `Normal` data edges feeding the node.
    pub indegree: Vec<usize>,
    /// Per position: positions unblocked when this node completes, one
    /// entry per edge.
    pub successors: Vec<Box<[usize]>>,
}

pub(crate) fn build(topo: &Topology) -> Plan {
    let mut remaining: Map<Node, usize> = Map::default();
    let mut ready = BinaryHeap::new();

    for (handle, record) in topo.nodes.iter() {
        if record.kernel.is_none() {
            continue;
        }
        let node = Node(handle);
        let indegree = record
            .incoming
            .iter()
            .flat_map(|slots| slots.iter().flatten())
            .filter(|edge| scheduled(topo, **edge))
            .count();
        if indegree == 0 {
            ready.push(Reverse((record.seq, node)));
        } else {
            remaining.insert(node, indegree);
        }
    }

    let mut order = Vec::with_capacity(remaining.len() + ready.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        let record = topo.node(node).expect("scheduled node disappeared");
        for edge in record.outgoing.iter().flatten() {
            if !scheduled(topo, *edge) {
                continue;
            }
            let dest = topo.edge(*edge).expect("dangling edge in plan").dest;
            let count = remaining
                .get_mut(&dest)
                .expect("successor missing from worklist");
            *count -= 1;
            if *count == 0 {
                remaining.remove(&dest);
                let seq = topo.node(dest).expect("dangling node in plan").seq;
                ready.push(Reverse((seq, dest)));
            }
        }
    }
    // Connection-time cycle rejection makes a leftover impossible.
    debug_assert!(remaining.is_empty(), "normal-edge cycle reached the plan");

    let position: Map<Node, usize> = order
        .iter()
        .enumerate()
        .map(|(index, node)| (*node, index))
        .collect();

    let mut indegree = vec![0usize; order.len()];
    let mut successors = Vec::with_capacity(order.len());
    for node in &order {
        let record = topo.node(*node).expect("scheduled node disappeared");
        let mut out = Vec::new();
        for edge in record.outgoing.iter().flatten() {
            if !scheduled(topo, *edge) {
                continue;
            }
            let dest = topo.edge(*edge).expect("dangling edge in plan").dest;
            let dest = position[&dest];
            indegree[dest] += 1;
            out.push(dest);
        }
        successors.push(out.into_boxed_slice());
    }

    Plan {
        order,
        indegree,
        successors,
    }
}

fn scheduled(topo: &Topology, edge: crate::topology::EdgeId) -> bool {
    topo.edge(edge)
        .is_some_and(|record| record.tag == EdgeTag::Normal && record.data)
}
