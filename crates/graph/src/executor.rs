//! Tick execution.
//!
//! The commit phase compiles a [State] — topologically ordered nodes with
//! dependency counters, latch copies, and value snapshots — and ships it
//! through a triple buffer. [Executor::tick] opens the safety scope, seeds
//! the ready queue with the plan's sources, and works the queue alongside
//! the worker threads until every scheduled node has run. Only after the
//! fence do latch copies and value snapshots happen, then the scope closes.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use arc_swap::ArcSwapOption;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;

use arena::{Block, Latch, NodeStorage};
use kernel::{Invoke, KernelType, Status};
use util::collections::Map;
use util::IsSendSync;

use crate::error::Result;
use crate::resolve::ValueTable;
use crate::scope::ScopeManager;
use crate::topology::Node;

const WORKER_EXIT: usize = 0;
const WORKER_PARK: usize = 1;
const WORKER_WORK: usize = 2;

/// Shared ownership of one node's arena memory. The graph patches it during
/// commit; exactly one worker dereferences it per tick.
pub(crate) struct NodeSlot {
    pub storage: IsSendSync<UnsafeCell<NodeStorage>>,
    pub kernel: &'static KernelType,
}

impl NodeSlot {
    pub fn new(kernel: &'static KernelType) -> Self {
        Self {
            storage: IsSendSync::new(UnsafeCell::new(NodeStorage::new(kernel))),
            kernel,
        }
    }
}

pub(crate) type LatchCell = IsSendSync<UnsafeCell<Latch>>;

/// Engine-to-host notifications, drained at the next commit.
#[derive(Copy, Clone, Debug)]
pub(crate) enum TickEvent {
    KernelFault { node: Node, status: Status },
    Completed { epoch: u64 },
}

pub(crate) struct ExecNode {
    pub slot: Arc<NodeSlot>,
    pub node: Node,
    pub indegree: usize,
    pub remaining: AtomicUsize,
    pub successors: Box<[usize]>,
    pub status: AtomicU32,
}

/// Copy a producing field into its feedback latch after the fence.
pub(crate) struct LatchOp {
    pub src: *const u8,
    pub bytes: usize,
    pub latch: Arc<LatchCell>,
}

/// Snapshot a registered value's bytes after the fence.
pub(crate) struct ValueOp {
    pub id: u64,
    pub src: *const u8,
    pub bytes: usize,
}

pub(crate) struct State {
    pub queue: ArrayQueue<usize>,
    pub nodes: Vec<ExecNode>,
    pub sources: Vec<usize>,
    pub completed: AtomicUsize,
    pub commit: u64,
    pub latches: Vec<LatchOp>,
    pub values: Vec<ValueOp>,
    /// One-tick keep-alive for externally submitted input batches.
    pub _deferred: Vec<Block>,
}

impl State {
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::new(1),
            nodes: Vec::new(),
            sources: Vec::new(),
            completed: AtomicUsize::new(0),
            commit: 0,
            latches: Vec::new(),
            values: Vec::new(),
            _deferred: Vec::new(),
        }
    }
}

// The triple buffer needs Clone for its initial fill; states are never
// duplicated, so a fresh empty state is the only correct "copy".
impl Clone for State {
    fn clone(&self) -> Self {
        Self::new()
    }
}

unsafe impl Send for State {}

impl ExecNode {
    unsafe fn invoke(&self) {
        let storage = &mut *self.slot.storage.get();
        let mut cx = Invoke::from_raw(storage.record_ptr(), self.slot.kernel);
        let status = (self.slot.kernel.vtable.invoke)(storage.data_ptr(), &mut cx);
        if status != Status::Ok {
            self.status.store(status.encode(), Ordering::Relaxed);
        }
    }

    unsafe fn run(&self, nodes: &[ExecNode], queue: &ArrayQueue<usize>, completed: &AtomicUsize) {
        self.invoke();
        completed.fetch_add(1, Ordering::AcqRel);
        for &next in self.successors.iter() {
            if nodes[next].remaining.fetch_sub(1, Ordering::AcqRel) == 1
                && queue.push(next).is_err()
            {
                util::rt_error("weft: ready queue overflow");
            }
        }
    }
}

/// Drives committed states. At most one executor exists per graph; it is
/// Send but deliberately not Sync — ticks are serialized by construction,
/// and a second caller racing `tick` is rejected by the scope manager.
pub struct Executor {
    inner: Arc<Inner>,
    _p: PhantomData<*mut ()>,
}

pub(crate) struct Inner {
    state: IsSendSync<UnsafeCell<triple_buffer::Output<State>>>,
    scope: Arc<ScopeManager>,
    events: Arc<ArrayQueue<TickEvent>>,
    tables: Arc<ArcSwapOption<ValueTable>>,
    num_workers: usize,
    worker_state: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub(crate) fn new(
        num_workers: usize,
        receiver: triple_buffer::Output<State>,
        scope: Arc<ScopeManager>,
        events: Arc<ArrayQueue<TickEvent>>,
        tables: Arc<ArcSwapOption<ValueTable>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: IsSendSync::new(UnsafeCell::new(receiver)),
            scope,
            events,
            tables,
            num_workers,
            worker_state: AtomicUsize::new(WORKER_PARK),
            workers: Mutex::new(Vec::new()),
        });
        let threads = (0..num_workers)
            .map(|_| {
                let inner = inner.clone();
                std::thread::spawn(move || inner.worker())
            })
            .collect();
        *inner.workers.lock().unwrap() = threads;
        Self {
            inner,
            _p: PhantomData,
        }
    }

    /// Run one tick of the latest committed state. Returns the window epoch
    /// the tick executed under.
    pub fn tick(&mut self) -> Result<u64> {
        let epoch = self.inner.scope.open()?;

        unsafe {
            let output = &mut *self.inner.state.get();
            output.update();
            let state = output.peek_output_buffer();
            tracing::trace!(
                epoch,
                commit = state.commit,
                scheduled = state.nodes.len(),
                "tick dispatched"
            );

            for node in &state.nodes {
                node.remaining.store(node.indegree, Ordering::Relaxed);
                node.status.store(0, Ordering::Relaxed);
            }
            state.completed.store(0, Ordering::Relaxed);

            if self.inner.num_workers == 0 {
                // The plan order is already topological.
                for node in &state.nodes {
                    node.invoke();
                }
            } else {
                for source in &state.sources {
                    state.queue.push(*source).ok();
                }
                self.inner.worker_state.store(WORKER_WORK, Ordering::Release);
                self.inner.unpark_workers();

                // Work alongside the workers until everything has run.
                let backoff = Backoff::new();
                while state.completed.load(Ordering::Acquire) < state.nodes.len() {
                    match state.queue.pop() {
                        Some(index) => {
                            backoff.reset();
                            state.nodes[index].run(&state.nodes, &state.queue, &state.completed);
                        }
                        None => backoff.snooze(),
                    }
                }
                self.inner.worker_state.store(WORKER_PARK, Ordering::Release);
            }

            // Fenced: capture feedback latches from the just-written outputs.
            for op in &state.latches {
                (*op.latch.get()).capture(op.src, op.bytes);
            }

            // Snapshot registered values and publish the table.
            let mut entries = Map::default();
            for op in &state.values {
                let bytes = if op.bytes == 0 {
                    Box::default()
                } else {
                    std::slice::from_raw_parts(op.src, op.bytes)
                        .to_vec()
                        .into_boxed_slice()
                };
                entries.insert(op.id, bytes);
            }
            self.inner
                .tables
                .store(Some(Arc::new(ValueTable { epoch, entries })));

            for node in &state.nodes {
                let status = Status::decode(node.status.load(Ordering::Relaxed));
                if status != Status::Ok {
                    self.inner
                        .events
                        .push(TickEvent::KernelFault {
                            node: node.node,
                            status,
                        })
                        .ok();
                }
            }
            self.inner.events.push(TickEvent::Completed { epoch }).ok();
        }

        self.inner.scope.close();
        Ok(epoch)
    }

    /// Reset every scheduled kernel's state. Refused while a window is open.
    pub fn reset(&mut self) -> Result<()> {
        if self.inner.scope.is_open() {
            return Err(crate::error::Error::UnfencedAccess);
        }
        unsafe {
            let output = &mut *self.inner.state.get();
            output.update();
            let state = output.peek_output_buffer();
            for node in &state.nodes {
                let storage = &*node.slot.storage.get();
                (node.slot.kernel.vtable.reset)(storage.data_ptr());
            }
        }
        Ok(())
    }
}

unsafe impl Send for Executor {}

impl Inner {
    fn worker(&self) {
        let backoff = Backoff::new();
        loop {
            match self.worker_state.load(Ordering::Acquire) {
                WORKER_EXIT => break,
                WORKER_PARK => std::thread::park(),
                WORKER_WORK => unsafe {
                    let state = (*self.state.get()).peek_output_buffer();
                    match state.queue.pop() {
                        Some(index) => {
                            backoff.reset();
                            state.nodes[index].run(&state.nodes, &state.queue, &state.completed);
                        }
                        None => backoff.snooze(),
                    }
                },
                _ => unreachable!(),
            }
        }
    }

    fn unpark_workers(&self) {
        let workers = self.workers.lock().unwrap();
        for worker in workers.iter() {
            worker.thread().unpark();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.worker_state.store(WORKER_EXIT, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        while let Some(worker) = workers.pop() {
            worker.thread().unpark();
            worker.join().ok();
        }
    }
}
