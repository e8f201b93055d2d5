//! The public graph surface: mutation API, commit, and host readback.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::queue::ArrayQueue;

use arena::{Block, Latch};
use kernel::{Direction, Kind, KernelType, RawBuf};
use util::collections::Map;
use util::IsSendSync;

use crate::diff::{
    self, GraphDiff, PendingData, PendingDeferred, PendingMessage, PendingValue, ResizeKey,
    STATE_PORT,
};
use crate::error::{Error, Result};
use crate::executor::{
    ExecNode, Executor, LatchCell, LatchOp, NodeSlot, State, TickEvent, ValueOp,
};
use crate::resolve::{GraphValue, Resolver, ValueRegistry};
use crate::scope::{ArenaView, ScopeManager};
use crate::schedule;
use crate::topology::{EdgeId, EdgeTag, Node, PortId, Topology};

const EVENT_CAPACITY: usize = 256;

pub struct Options {
    /// Worker threads for the execution phase. Zero runs the plan on the
    /// ticking thread.
    pub num_workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { num_workers: 0 }
    }
}

/// The render graph: a logical topology mutated between ticks, compiled
/// into an execution state at [Graph::commit], and executed by the
/// [Executor] checked out of it.
pub struct Graph {
    live: Topology,
    committed: Topology,
    pending: PendingData,
    slots: Map<Node, Arc<NodeSlot>>,
    latches: Map<EdgeId, Arc<LatchCell>>,
    values: ValueRegistry,
    scope: Arc<ScopeManager>,
    events: Arc<ArrayQueue<TickEvent>>,
    tables: Arc<ArcSwapOption<crate::resolve::ValueTable>>,
    sender: triple_buffer::Input<State>,
    executor: Option<Executor>,
    commits: u64,
}

impl Graph {
    pub fn new(options: Options) -> Self {
        let scope = Arc::new(ScopeManager::new());
        let events = Arc::new(ArrayQueue::new(EVENT_CAPACITY));
        let tables: Arc<ArcSwapOption<crate::resolve::ValueTable>> =
            Arc::new(ArcSwapOption::from(None));
        let (sender, receiver) = triple_buffer::triple_buffer(&State::new());
        let executor = Executor::new(
            options.num_workers,
            receiver,
            scope.clone(),
            events.clone(),
            tables.clone(),
        );
        Self {
            live: Topology::new(),
            committed: Topology::new(),
            pending: PendingData::default(),
            slots: Map::default(),
            latches: Map::default(),
            values: ValueRegistry::default(),
            scope,
            events,
            tables,
            sender,
            executor: Some(executor),
            commits: 0,
        }
    }

    /// Check out the executor. There is only one; it is not returned.
    pub fn executor(&mut self) -> Option<Executor> {
        self.executor.take()
    }

    /// Create a node backed by a kernel type.
    pub fn create_node(&mut self, kernel: &'static KernelType) -> Node {
        let node = self.live.add_node(Some(kernel));
        self.slots.insert(node, Arc::new(NodeSlot::new(kernel)));
        node
    }

    /// Create a kernel-less node: a simulation-layer endpoint that can own
    /// forwarded ports and receive messages but is never scheduled.
    pub fn create_message_node(&mut self) -> Node {
        self.live.add_node(None)
    }

    /// Destroy a node. Its handle is permanently invalid from this call;
    /// the node is excluded from execution starting at the next commit, and
    /// its pending resizes are cancelled without touching the rest of the
    /// diff.
    pub fn destroy_node(&mut self, node: Node) -> Result<()> {
        self.live.remove_node(node)?;
        self.pending.cancel_node(node);
        self.slots.remove(&node);
        Ok(())
    }

    pub fn is_valid(&self, node: Node) -> bool {
        self.live.contains(node)
    }

    /// Enumerate the edges feeding a node's input ports.
    pub fn inputs(&self, node: Node) -> Result<Vec<EdgeId>> {
        let record = self.live.node(node)?;
        Ok(record
            .incoming
            .iter()
            .flat_map(|slots| slots.iter().flatten().copied())
            .collect())
    }

    /// Enumerate the edges leaving a node's output ports.
    pub fn outputs(&self, node: Node) -> Result<Vec<EdgeId>> {
        let record = self.live.node(node)?;
        Ok(record.outgoing.iter().flatten().copied().collect())
    }

    /// Endpoints of a live edge, or None if the handle is stale.
    pub fn edge_endpoints(&self, edge: EdgeId) -> Option<((Node, PortId), (Node, PortId))> {
        let record = self.live.edge(edge)?;
        Some((
            (record.source, record.source_port),
            (record.dest, record.dest_port),
        ))
    }

    pub fn connect(
        &mut self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        tag: EdgeTag,
    ) -> Result<EdgeId> {
        self.connect_inner(source, source_port, dest, dest_port, None, tag)
    }

    /// Connect into a specific slot of a port array.
    pub fn connect_index(
        &mut self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: u16,
        tag: EdgeTag,
    ) -> Result<EdgeId> {
        self.connect_inner(source, source_port, dest, dest_port, Some(dest_index), tag)
    }

    fn connect_inner(
        &mut self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: Option<u16>,
        tag: EdgeTag,
    ) -> Result<EdgeId> {
        // Forwarded ports are collapsed before anything is recorded: the
        // committed graph only ever holds concrete node-to-node edges.
        let (source, source_port) = self.live.resolve_forward(source, source_port)?;
        let (dest, dest_port) = self.live.resolve_forward(dest, dest_port)?;
        self.live
            .connect(source, source_port, dest, dest_port, dest_index, tag)
    }

    pub fn disconnect(&mut self, edge: EdgeId) -> Result<()> {
        self.live.disconnect(edge)
    }

    pub fn disconnect_ports(
        &mut self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
    ) -> Result<()> {
        self.disconnect_ports_inner(source, source_port, dest, dest_port, None)
    }

    /// Disconnecting an array slot requires the exact index.
    pub fn disconnect_ports_index(
        &mut self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: u16,
    ) -> Result<()> {
        self.disconnect_ports_inner(source, source_port, dest, dest_port, Some(dest_index))
    }

    fn disconnect_ports_inner(
        &mut self,
        source: Node,
        source_port: PortId,
        dest: Node,
        dest_port: PortId,
        dest_index: Option<u16>,
    ) -> Result<()> {
        let (source, source_port) = self.live.resolve_forward(source, source_port)?;
        let (dest, dest_port) = self.live.resolve_forward(dest, dest_port)?;
        let edge = self
            .live
            .find_edge(source, source_port, dest, dest_port, dest_index)?;
        self.live.disconnect(edge)
    }

    pub fn set_port_array_len(&mut self, node: Node, port: PortId, len: u16) -> Result<()> {
        let (node, port) = self.live.resolve_forward(node, port)?;
        self.live.set_array_len(node, port, len)
    }

    /// Declare that `port` on `node` is an alias for `child_port` on
    /// `child`.
    pub fn forward_port(
        &mut self,
        node: Node,
        port: PortId,
        child: Node,
        child_port: PortId,
    ) -> Result<()> {
        self.live.forward_port(node, port, child, child_port)
    }

    /// Request a resize of a buffer output port. The request is pending
    /// until the next commit; re-requesting the same length is a no-op.
    pub fn set_buffer_size(&mut self, node: Node, port: PortId, len: usize) -> Result<()> {
        let (key, elem_size) = self.buffer_field(node, port, None)?;
        self.pending.request_resize(key, len, elem_size);
        Ok(())
    }

    /// Request a resize of a buffer field nested in an aggregate output, by
    /// its declared byte offset within the aggregate.
    pub fn set_buffer_size_at(
        &mut self,
        node: Node,
        port: PortId,
        field_offset: usize,
        len: usize,
    ) -> Result<()> {
        let (key, elem_size) = self.buffer_field(node, port, Some(field_offset))?;
        self.pending.request_resize(key, len, elem_size);
        Ok(())
    }

    /// Cancel a pending resize request.
    pub fn cancel_buffer_resize(&mut self, node: Node, port: PortId) -> Result<()> {
        let (key, _) = self.buffer_field(node, port, None)?;
        self.pending.cancel_resize(key);
        Ok(())
    }

    pub fn cancel_buffer_resize_at(
        &mut self,
        node: Node,
        port: PortId,
        field_offset: usize,
    ) -> Result<()> {
        let (key, _) = self.buffer_field(node, port, Some(field_offset))?;
        self.pending.cancel_resize(key);
        Ok(())
    }

    /// Request a resize of a buffer field embedded in the kernel's own
    /// state record.
    pub fn set_state_buffer_size(&mut self, node: Node, field: usize, len: usize) -> Result<()> {
        let record = self.live.node(node)?;
        let kernel = record.kernel.ok_or(Error::InvalidPort)?;
        let desc = kernel.state_fields.get(field).ok_or(Error::InvalidPort)?;
        self.pending.request_resize(
            ResizeKey {
                node,
                port: STATE_PORT,
                offset: desc.offset,
            },
            len,
            desc.elem_size,
        );
        Ok(())
    }

    /// Assign a value directly to an unconnected scalar or aggregate input.
    pub fn set_value<T: Copy>(&mut self, node: Node, port: PortId, value: T) -> Result<()> {
        self.set_value_index(node, port, 0, value)
    }

    pub fn set_value_index<T: Copy>(
        &mut self,
        node: Node,
        port: PortId,
        index: u16,
        value: T,
    ) -> Result<()> {
        let (node, port) = self.live.resolve_forward(node, port)?;
        let desc = self.live.port(node, port)?;
        if desc.direction != Direction::Input {
            return Err(Error::InvalidPort);
        }
        let expected = match &desc.kind {
            Kind::Scalar(s) => s.size,
            Kind::Aggregate(a) => a.size,
            Kind::Buffer(_) | Kind::Message(_) => return Err(Error::KindMismatch),
        };
        if size_of::<T>() != expected {
            return Err(Error::KindMismatch);
        }
        if index as usize >= desc.slots() {
            return Err(Error::PortIndexOutOfRange);
        }
        let bytes = unsafe {
            std::slice::from_raw_parts((&value as *const T).cast::<u8>(), size_of::<T>())
        }
        .to_vec()
        .into_boxed_slice();
        self.pending.values.push(PendingValue {
            node,
            port,
            index,
            bytes,
        });
        Ok(())
    }

    /// Queue a message for the simulation layer; the engine only records it
    /// in the diff, delivery happens between ticks outside the engine.
    pub fn send_message(&mut self, node: Node, port: PortId, bytes: &[u8]) -> Result<()> {
        let (node, port) = self.live.resolve_forward(node, port)?;
        let record = self.live.node(node)?;
        if let Some(kernel) = record.kernel {
            let desc = kernel.ports.get(port as usize).ok_or(Error::InvalidPort)?;
            if !matches!(desc.kind, Kind::Message(_)) {
                return Err(Error::KindMismatch);
            }
        }
        self.pending.messages.push(PendingMessage {
            node,
            port,
            bytes: bytes.to_vec().into_boxed_slice(),
        });
        Ok(())
    }

    /// Attach externally produced memory as an input source for the next
    /// tick. The batch lives exactly until the following commit repatches
    /// the input.
    pub fn submit_deferred_input(
        &mut self,
        node: Node,
        port: PortId,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let (node, port) = self.live.resolve_forward(node, port)?;
        let desc = self.live.port(node, port)?;
        if desc.direction != Direction::Input {
            return Err(Error::InvalidPort);
        }
        match &desc.kind {
            Kind::Buffer(b) => {
                if b.elem_size != 0 && bytes.len() % b.elem_size != 0 {
                    return Err(Error::KindMismatch);
                }
            }
            Kind::Scalar(s) => {
                if bytes.len() != s.size {
                    return Err(Error::KindMismatch);
                }
            }
            Kind::Aggregate(a) => {
                if bytes.len() != a.size {
                    return Err(Error::KindMismatch);
                }
            }
            Kind::Message(_) => return Err(Error::KindMismatch),
        }
        self.pending.deferred.push(PendingDeferred {
            node,
            port,
            index: 0,
            bytes: bytes.into_boxed_slice(),
        });
        Ok(())
    }

    /// Register a readback handle for a (node, output port) pair.
    pub fn create_value(&mut self, node: Node, port: PortId) -> Result<GraphValue> {
        let (node, port) = self.live.resolve_forward(node, port)?;
        let desc = self.live.port(node, port)?;
        if desc.direction != Direction::Output || !desc.kind.is_data() {
            return Err(Error::InvalidPort);
        }
        let born = self.tables.load().as_ref().map(|t| t.epoch).unwrap_or(0);
        Ok(self.values.create(node, port, born))
    }

    /// Release a readback handle. It still resolves against the window in
    /// flight when it was released, and is disposed afterwards.
    pub fn release_value(&mut self, value: GraphValue) -> Result<()> {
        self.values.release(value)
    }

    /// A resolver pinned to the latest completed tick's snapshot.
    pub fn resolver(&self) -> Result<Resolver> {
        let table = self.tables.load_full().ok_or(Error::NotYetValid)?;
        Ok(Resolver::new(table, self.tables.clone()))
    }

    /// Fenced host readback of an output port's committed storage. The view
    /// dies the moment the next execution window opens.
    pub fn peek_output(&self, node: Node, port: PortId) -> Result<ArenaView> {
        if self.scope.is_open() {
            return Err(Error::UnfencedAccess);
        }
        let (node, port) = self.live.resolve_forward(node, port)?;
        let desc = self.live.port(node, port)?;
        if desc.direction != Direction::Output {
            return Err(Error::InvalidPort);
        }
        let slot = self.slots.get(&node).ok_or(Error::InvalidHandle)?;
        let (ptr, bytes) = output_bytes(slot, port).ok_or(Error::InvalidPort)?;
        Ok(ArenaView::new(
            ptr,
            bytes,
            self.scope.last_closed(),
            self.scope.clone(),
        ))
    }

    /// Diff the live graph against the last committed snapshot, apply the
    /// memory effects, compile the execution state, and publish it.
    ///
    /// Refused while an execution window is open: committing repatches
    /// memory the in-flight workers own.
    pub fn commit(&mut self) -> Result<GraphDiff> {
        if self.scope.is_open() {
            return Err(Error::UnfencedAccess);
        }
        self.drain_events();

        let diff = diff::build(&self.committed, &self.live, &self.pending);

        // Buffer resizes: fresh zeroed blocks, pairs repatched in place.
        for key in &self.pending.resize_order {
            let Some(&(len, _)) = self.pending.resizes.get(key) else {
                continue;
            };
            let Some(slot) = self.slots.get(&key.node) else {
                continue;
            };
            let storage = unsafe { &mut *slot.storage.get() };
            if key.port == STATE_PORT {
                let index = slot
                    .kernel
                    .state_fields
                    .iter()
                    .position(|field| field.offset == key.offset)
                    .expect("resize request validated against state fields");
                storage.resize_state_field(index, len);
            } else {
                let (index, _) = slot
                    .kernel
                    .record()
                    .field_at(key.offset)
                    .expect("resize request validated against record layout");
                storage.resize_field(index, len);
            }
        }

        // Direct value assignments land in the input's default storage.
        for value in &self.pending.values {
            if let Some(slot) = self.slots.get(&value.node) {
                let storage = unsafe { &mut *slot.storage.get() };
                let wrote = storage.write_default(value.port, value.index, &value.bytes);
                debug_assert!(wrote, "value assignment validated at request time");
            }
        }

        self.patch_inputs();
        let deferred = self.patch_deferred();

        // Drop latches whose edges are gone.
        let live = &self.live;
        self.latches.retain(|edge, _| live.edge(*edge).is_some());

        // Prune the value registry; the in-flight table keeps dropped
        // values resolvable for one more tick.
        self.values.prune(&self.live);

        let latches = self.latch_ops();
        let values = self.value_ops();

        let plan = schedule::build(&self.live);
        let nodes: Vec<ExecNode> = plan
            .order
            .iter()
            .enumerate()
            .map(|(position, node)| ExecNode {
                slot: self.slots[node].clone(),
                node: *node,
                indegree: plan.indegree[position],
                remaining: AtomicUsize::new(0),
                successors: plan.successors[position].clone(),
                status: AtomicU32::new(0),
            })
            .collect();
        let sources = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.indegree == 0)
            .map(|(position, _)| position)
            .collect();

        let scheduled = nodes.len();
        let state = State {
            queue: ArrayQueue::new(scheduled.max(1)),
            nodes,
            sources,
            completed: AtomicUsize::new(0),
            commit: self.commits + 1,
            latches,
            values,
            _deferred: deferred,
        };
        self.sender.write(state);

        self.committed = self.live.clone();
        self.pending.clear();
        self.commits += 1;
        tracing::debug!(
            commit = self.commits,
            changes = diff.len(),
            scheduled,
            "committed render graph"
        );
        Ok(diff)
    }

    /// Re-resolve every input slot of every live kernel node against the
    /// current topology. Stale addresses from the previous commit are
    /// overwritten wholesale; nothing resolved in tick N survives into
    /// tick N+1.
    fn patch_inputs(&mut self) {
        let live = &self.live;
        let slots = &self.slots;
        let latches = &mut self.latches;

        for (handle, record) in live.nodes.iter() {
            let Some(kernel) = record.kernel else {
                continue;
            };
            let node = Node(handle);
            let layout = kernel.record();
            let dest_slot = &slots[&node];

            unsafe { (*dest_slot.storage.get()).patch_own() };

            for (port_index, port) in kernel.ports.iter().enumerate() {
                if port.direction != Direction::Input || !port.kind.is_data() {
                    continue;
                }
                let port_id = port_index as u16;
                for index in 0..record.incoming[port_index].len() {
                    let offset = layout.slot_offset(port_id, index as u16);
                    let binding = record.incoming[port_index][index]
                        .and_then(|id| live.edge(id).map(|edge| (id, *edge)));

                    match binding {
                        Some((_, edge)) if edge.tag == EdgeTag::Normal => {
                            let src_slot = &slots[&edge.source];
                            match &port.kind {
                                Kind::Buffer(_) => {
                                    let raw = unsafe {
                                        (*src_slot.storage.get()).read_pair(
                                            src_slot
                                                .kernel
                                                .record()
                                                .slot_offset(edge.source_port, 0),
                                        )
                                    };
                                    unsafe {
                                        (*dest_slot.storage.get()).write_pair(offset, raw)
                                    };
                                }
                                Kind::Scalar(_) | Kind::Aggregate(_) => {
                                    let ptr = unsafe {
                                        (*src_slot.storage.get())
                                            .output_ptr(edge.source_port, 0)
                                    };
                                    unsafe {
                                        (*dest_slot.storage.get()).write_input_ptr(offset, ptr)
                                    };
                                }
                                Kind::Message(_) => {}
                            }
                        }
                        Some((id, edge)) => {
                            // Feedback: the consumer reads the latch, sized
                            // to the producer's committed field.
                            let src_slot = &slots[&edge.source];
                            let (_, bytes) = output_bytes(src_slot, edge.source_port)
                                .expect("feedback source is a data output");
                            let latch = latches.entry(id).or_insert_with(|| {
                                Arc::new(IsSendSync::new(UnsafeCell::new(Latch::new(
                                    size_of::<usize>(),
                                ))))
                            });
                            let latch = unsafe { &mut *latch.get() };
                            latch.ensure(bytes);
                            match &port.kind {
                                Kind::Buffer(b) => {
                                    let raw = latch.raw(b.elem_size);
                                    unsafe {
                                        (*dest_slot.storage.get()).write_pair(offset, raw)
                                    };
                                }
                                Kind::Scalar(_) | Kind::Aggregate(_) => {
                                    let ptr = latch.as_ptr();
                                    unsafe {
                                        (*dest_slot.storage.get()).write_input_ptr(offset, ptr)
                                    };
                                }
                                Kind::Message(_) => {}
                            }
                        }
                        None => match &port.kind {
                            Kind::Buffer(_) => unsafe {
                                (*dest_slot.storage.get()).write_pair(offset, RawBuf::empty());
                            },
                            Kind::Scalar(_) | Kind::Aggregate(_) => {
                                let storage = unsafe { &mut *dest_slot.storage.get() };
                                let ptr = storage
                                    .default_ptr(port_id, index as u16)
                                    .expect("data inputs carry default storage");
                                unsafe { storage.write_input_ptr(offset, ptr) };
                            }
                            Kind::Message(_) => {}
                        },
                    }
                }
            }
        }
    }

    /// Copy externally submitted batches into engine-owned blocks and point
    /// the target inputs at them for exactly one committed state.
    fn patch_deferred(&mut self) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(self.pending.deferred.len());
        for deferred in &self.pending.deferred {
            let Some(slot) = self.slots.get(&deferred.node) else {
                continue;
            };
            let layout = slot.kernel.record();
            let desc = &slot.kernel.ports[deferred.port as usize];
            let offset = layout.slot_offset(deferred.port, deferred.index);
            let block = Block::zeroed(deferred.bytes.len(), size_of::<usize>());
            unsafe {
                std::ptr::copy_nonoverlapping(
                    deferred.bytes.as_ptr(),
                    block.as_ptr(),
                    deferred.bytes.len(),
                );
            }
            match &desc.kind {
                Kind::Buffer(b) => {
                    let raw = RawBuf {
                        ptr: block.as_ptr(),
                        len: deferred.bytes.len() / b.elem_size.max(1),
                    };
                    unsafe { (*slot.storage.get()).write_pair(offset, raw) };
                }
                Kind::Scalar(_) | Kind::Aggregate(_) => unsafe {
                    (*slot.storage.get()).write_input_ptr(offset, block.as_ptr());
                },
                Kind::Message(_) => {}
            }
            blocks.push(block);
        }
        blocks
    }

    fn latch_ops(&self) -> Vec<LatchOp> {
        let mut ops = Vec::new();
        for (id, edge) in self.live.live_edges() {
            if edge.tag != EdgeTag::Feedback || !edge.data {
                continue;
            }
            let src_slot = &self.slots[&edge.source];
            let (src, bytes) =
                output_bytes(src_slot, edge.source_port).expect("feedback source is a data output");
            ops.push(LatchOp {
                src,
                bytes,
                latch: self.latches[&id].clone(),
            });
        }
        ops
    }

    fn value_ops(&self) -> Vec<ValueOp> {
        let mut ops: Vec<ValueOp> = self
            .values
            .iter()
            .filter_map(|(id, entry)| {
                let slot = self.slots.get(&entry.node)?;
                let (src, bytes) = output_bytes(slot, entry.port)?;
                Some(ValueOp {
                    id: *id,
                    src,
                    bytes,
                })
            })
            .collect();
        ops.sort_unstable_by_key(|op| op.id);
        ops
    }

    /// Every address range owned by live node storage, for aliasing audits:
    /// no two live output regions may ever overlap.
    pub fn storage_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        for slot in self.slots.values() {
            let storage = unsafe { &*slot.storage.get() };
            ranges.extend(storage.ranges());
        }
        ranges
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.events.pop() {
            match event {
                TickEvent::KernelFault { node, status } => {
                    tracing::warn!(?node, ?status, "kernel reported a fault");
                }
                TickEvent::Completed { epoch } => {
                    tracing::trace!(epoch, "tick completed");
                }
            }
        }
    }

    fn buffer_field(
        &self,
        node: Node,
        port: PortId,
        field_offset: Option<usize>,
    ) -> Result<(ResizeKey, usize)> {
        let (node, port) = self.live.resolve_forward(node, port)?;
        let desc = self.live.port(node, port)?;
        if desc.direction != Direction::Output {
            return Err(Error::InvalidPort);
        }
        let record = self.live.node(node)?;
        let kernel = record.kernel.ok_or(Error::InvalidPort)?;
        let layout = kernel.record();
        let placed = match (&desc.kind, field_offset) {
            (Kind::Buffer(_), None) => {
                layout
                    .fields_of(port)
                    .find(|(_, field)| field.slot == 0)
                    .ok_or(Error::InvalidPort)?
                    .1
            }
            (Kind::Aggregate(_), Some(relative)) => {
                let base = layout.slot_offset(port, 0);
                let (_, placed) = layout.field_at(base + relative).ok_or(Error::InvalidPort)?;
                if placed.port != port {
                    return Err(Error::InvalidPort);
                }
                placed
            }
            _ => return Err(Error::InvalidPort),
        };
        Ok((
            ResizeKey {
                node,
                port,
                offset: placed.offset,
            },
            placed.elem_size,
        ))
    }
}

/// Resolve an output port to (address, byte length) of its committed
/// storage. Buffer ports resolve through their patched pair.
fn output_bytes(slot: &Arc<NodeSlot>, port: PortId) -> Option<(*const u8, usize)> {
    let desc = slot.kernel.ports.get(port as usize)?;
    let layout = slot.kernel.record();
    let storage = unsafe { &*slot.storage.get() };
    match &desc.kind {
        Kind::Scalar(s) => Some((storage.output_ptr(port, 0), s.size)),
        Kind::Aggregate(a) => Some((storage.output_ptr(port, 0), a.size)),
        Kind::Buffer(b) => {
            let raw = storage.read_pair(layout.slot_offset(port, 0));
            Some((raw.ptr.cast_const(), raw.len * b.elem_size))
        }
        Kind::Message(_) => None,
    }
}
