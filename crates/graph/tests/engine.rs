//! End-to-end engine scenarios: commit/tick round trips, resizes, feedback,
//! value lifetimes, and safety-scope staleness.

use kernel::{port, Invoke, Kernel, KernelType, Port, Status};
use weft_graph::{Change, EdgeTag, Error, Graph, Options};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------- kernels

/// Emits two buffers filled with 1..=n.
#[derive(Default)]
struct Ramp;

mod ramp {
    pub const A: u16 = 0;
    pub const B: u16 = 1;
}

impl Kernel for Ramp {
    const NAME: &'static str = "ramp";
    const PORTS: &'static [Port] = &[
        Port::output("a", port::F64_BUFFER),
        Port::output("b", port::F64_BUFFER),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        for port in [ramp::A, ramp::B] {
            for (index, sample) in cx.buffer_out::<f64>(port).iter_mut().enumerate() {
                *sample = (index + 1) as f64;
            }
        }
        Status::Ok
    }
}

/// Sums every element of four buffer inputs into one scalar.
#[derive(Default)]
struct SumFour;

mod sum {
    pub const IN: [u16; 4] = [0, 1, 2, 3];
    pub const TOTAL: u16 = 4;
}

impl Kernel for SumFour {
    const NAME: &'static str = "sum-four";
    const PORTS: &'static [Port] = &[
        Port::input("in0", port::F64_BUFFER),
        Port::input("in1", port::F64_BUFFER),
        Port::input("in2", port::F64_BUFFER),
        Port::input("in3", port::F64_BUFFER),
        Port::output("total", port::F64),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        let mut total = 0.0;
        for input in sum::IN {
            total += cx.buffer_in::<f64>(input).iter().sum::<f64>();
        }
        *cx.scalar_out::<f64>(sum::TOTAL) = total;
        Status::Ok
    }
}

/// out = max(in, fb).
#[derive(Default)]
struct Max;

mod max {
    pub const IN: u16 = 0;
    pub const FB: u16 = 1;
    pub const OUT: u16 = 2;
}

impl Kernel for Max {
    const NAME: &'static str = "max";
    const PORTS: &'static [Port] = &[
        Port::input("in", port::F64),
        Port::input("fb", port::F64),
        Port::output("out", port::F64),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        let a: f64 = cx.scalar_in(max::IN);
        let b: f64 = cx.scalar_in(max::FB);
        *cx.scalar_out(max::OUT) = a.max(b);
        Status::Ok
    }
}

/// out = in.
#[derive(Default)]
struct Relay;

mod relay {
    pub const IN: u16 = 0;
    pub const OUT: u16 = 1;
}

impl Kernel for Relay {
    const NAME: &'static str = "relay";
    const PORTS: &'static [Port] = &[
        Port::input("in", port::F64),
        Port::output("out", port::F64),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        let value: f64 = cx.scalar_in(relay::IN);
        *cx.scalar_out(relay::OUT) = value;
        Status::Ok
    }
}

/// out[i] = fb[i] + 1, with out fed back into fb.
#[derive(Default)]
struct Accumulate;

mod acc {
    pub const FB: u16 = 0;
    pub const OUT: u16 = 1;
}

impl Kernel for Accumulate {
    const NAME: &'static str = "accumulate";
    const PORTS: &'static [Port] = &[
        Port::input("fb", port::F64_BUFFER),
        Port::output("out", port::F64_BUFFER),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        let len = cx.buffer_out::<f64>(acc::OUT).len();
        for index in 0..len {
            let previous = cx.buffer_in::<f64>(acc::FB).get(index).copied().unwrap_or(0.0);
            cx.buffer_out::<f64>(acc::OUT)[index] = previous + 1.0;
        }
        Status::Ok
    }
}

/// Reads one element of its input buffer; reports its own bounds check
/// through an output flag and the invocation status, never by unwinding.
#[derive(Default)]
struct Probe {
    element: usize,
}

mod probe {
    pub const IN: u16 = 0;
    pub const VALUE: u16 = 1;
    pub const OK: u16 = 2;
}

impl Kernel for Probe {
    const NAME: &'static str = "probe";
    const PORTS: &'static [Port] = &[
        Port::input("in", port::F64_BUFFER),
        Port::output("value", port::F64),
        Port::output("ok", port::U64),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        match cx.try_read::<f64>(probe::IN, self.element) {
            Some(value) => {
                *cx.scalar_out(probe::VALUE) = value;
                *cx.scalar_out(probe::OK) = 1u64;
                Status::Ok
            }
            None => {
                *cx.scalar_out(probe::VALUE) = 0.0;
                *cx.scalar_out(probe::OK) = 0u64;
                Status::OutOfRange
            }
        }
    }
}

/// Carries a resizable scratch buffer inside its own state record and
/// reports how many elements the engine committed for it.
#[derive(Default)]
struct Scratchpad {
    scratch: kernel::RawBuf,
}

impl Kernel for Scratchpad {
    const NAME: &'static str = "scratchpad";
    const PORTS: &'static [Port] = &[Port::output("len", port::U64)];
    const STATE_FIELDS: &'static [kernel::Field] = &[kernel::Field {
        offset: std::mem::offset_of!(Scratchpad, scratch),
        elem_size: size_of::<u64>(),
        elem_align: align_of::<u64>(),
    }];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        let scratch = unsafe { self.scratch.as_mut_slice::<u64>() };
        for (index, slot) in scratch.iter_mut().enumerate() {
            *slot = index as u64;
        }
        *cx.scalar_out::<u64>(0) = scratch.len() as u64;
        Status::Ok
    }
}

/// Writes the length of its input buffer out as a scalar.
#[derive(Default)]
struct LenOf;

impl Kernel for LenOf {
    const NAME: &'static str = "len-of";
    const PORTS: &'static [Port] = &[
        Port::input("in", port::F64_BUFFER),
        Port::output("len", port::U64),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        *cx.scalar_out::<u64>(1) = cx.buffer_in::<f64>(0).len() as u64;
        Status::Ok
    }
}

// ---------------------------------------------------------------- helpers

fn ty<K: Kernel>() -> &'static KernelType {
    KernelType::of::<K>()
}

fn sum_graph(num_workers: usize) -> (Graph, weft_graph::Executor, [weft_graph::Node; 3]) {
    let mut graph = Graph::new(Options { num_workers });
    let executor = graph.executor().unwrap();
    let p1 = graph.create_node(ty::<Ramp>());
    let p2 = graph.create_node(ty::<Ramp>());
    let consumer = graph.create_node(ty::<SumFour>());
    graph
        .connect(p1, ramp::A, consumer, sum::IN[0], EdgeTag::Normal)
        .unwrap();
    graph
        .connect(p1, ramp::B, consumer, sum::IN[1], EdgeTag::Normal)
        .unwrap();
    graph
        .connect(p2, ramp::A, consumer, sum::IN[2], EdgeTag::Normal)
        .unwrap();
    graph
        .connect(p2, ramp::B, consumer, sum::IN[3], EdgeTag::Normal)
        .unwrap();
    (graph, executor, [p1, p2, consumer])
}

// ------------------------------------------------------------------ tests

#[test]
fn two_producers_sum_over_resizes() {
    init_tracing();
    let (mut graph, mut executor, [p1, p2, consumer]) = sum_graph(2);
    let total = graph.create_value(consumer, sum::TOTAL).unwrap();

    for n in [0usize, 1, 5, 20, 100, 50000] {
        for port in [ramp::A, ramp::B] {
            graph.set_buffer_size(p1, port, n).unwrap();
            graph.set_buffer_size(p2, port, n).unwrap();
        }
        graph.commit().unwrap();
        executor.tick().unwrap();

        let expected = 4.0 * (n * (n + 1) / 2) as f64;
        let resolved = graph.resolver().unwrap().resolve(&total).unwrap();
        assert_eq!(resolved.read::<f64>(), Ok(expected), "n = {n}");
    }
}

#[test]
fn resolved_buffer_length_matches_request_exactly() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let ramp = graph.create_node(ty::<Ramp>());
    let len_of = graph.create_node(ty::<LenOf>());
    graph.connect(ramp, ramp::A, len_of, 0, EdgeTag::Normal).unwrap();
    let len = graph.create_value(len_of, 1).unwrap();

    for n in [0usize, 1, 17, 4096] {
        graph.set_buffer_size(ramp, ramp::A, n).unwrap();
        graph.commit().unwrap();
        executor.tick().unwrap();
        let resolved = graph.resolver().unwrap().resolve(&len).unwrap();
        assert_eq!(resolved.read::<u64>(), Ok(n as u64));
    }
}

#[test]
fn live_storage_never_aliases() {
    let (mut graph, mut executor, [p1, p2, _]) = sum_graph(0);
    for port in [ramp::A, ramp::B] {
        graph.set_buffer_size(p1, port, 64).unwrap();
        graph.set_buffer_size(p2, port, 128).unwrap();
    }
    graph.commit().unwrap();
    executor.tick().unwrap();

    let mut ranges = graph.storage_ranges();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "overlapping storage ranges: {pair:?}"
        );
    }
}

#[test]
fn connect_disconnect_connect_restores_topology() {
    let (mut graph, mut executor, [p1, _, consumer]) = sum_graph(0);
    for port in [ramp::A, ramp::B] {
        graph.set_buffer_size(p1, port, 10).unwrap();
    }
    let total = graph.create_value(consumer, sum::TOTAL).unwrap();
    graph.commit().unwrap();
    executor.tick().unwrap();
    let before = graph
        .resolver()
        .unwrap()
        .resolve(&total)
        .unwrap()
        .read::<f64>()
        .unwrap();

    graph
        .disconnect_ports(p1, ramp::A, consumer, sum::IN[0])
        .unwrap();
    assert_eq!(graph.inputs(consumer).unwrap().len(), 3);
    let edge = graph
        .connect(p1, ramp::A, consumer, sum::IN[0], EdgeTag::Normal)
        .unwrap();
    assert_eq!(graph.inputs(consumer).unwrap().len(), 4);
    assert_eq!(
        graph.edge_endpoints(edge),
        Some(((p1, ramp::A), (consumer, sum::IN[0])))
    );
    let diff = graph.commit().unwrap();
    assert!(diff
        .changes
        .iter()
        .any(|change| matches!(change, Change::Disconnected { .. })));
    assert!(diff
        .changes
        .iter()
        .any(|change| matches!(change, Change::Connected { .. })));

    executor.tick().unwrap();
    let after = graph
        .resolver()
        .unwrap()
        .resolve(&total)
        .unwrap()
        .read::<f64>()
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn feedback_chain_stabilizes_under_unrelated_edits() {
    init_tracing();
    let mut graph = Graph::new(Options { num_workers: 2 });
    let mut executor = graph.executor().unwrap();

    // P -> A -> B -> C -> D, with D feeding back into A: a cycle of length
    // four, legal because the closing edge is tagged Feedback.
    let p = graph.create_node(ty::<Relay>());
    let a = graph.create_node(ty::<Max>());
    let b = graph.create_node(ty::<Relay>());
    let c = graph.create_node(ty::<Relay>());
    let d = graph.create_node(ty::<Relay>());
    graph.set_value(p, relay::IN, 42.0f64).unwrap();
    graph.connect(p, relay::OUT, a, max::IN, EdgeTag::Normal).unwrap();
    graph.connect(a, max::OUT, b, relay::IN, EdgeTag::Normal).unwrap();
    graph.connect(b, relay::OUT, c, relay::IN, EdgeTag::Normal).unwrap();
    graph.connect(c, relay::OUT, d, relay::IN, EdgeTag::Normal).unwrap();
    // Closing the loop with a Normal edge is refused outright.
    assert_eq!(
        graph.connect(d, relay::OUT, a, max::FB, EdgeTag::Normal),
        Err(Error::CycleDetected)
    );
    graph.connect(d, relay::OUT, a, max::FB, EdgeTag::Feedback).unwrap();

    let out = graph.create_value(d, relay::OUT).unwrap();
    graph.commit().unwrap();
    executor.tick().unwrap();

    for _ in 0..5 {
        // An unrelated edit interleaved every tick must not disturb the
        // stabilized loop.
        let noise = graph.create_node(ty::<Relay>());
        graph.commit().unwrap();
        executor.tick().unwrap();
        let resolved = graph.resolver().unwrap().resolve(&out).unwrap();
        assert_eq!(resolved.read::<f64>(), Ok(42.0));
        graph.destroy_node(noise).unwrap();
    }
}

#[test]
fn feedback_buffer_reads_previous_tick() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let node = graph.create_node(ty::<Accumulate>());
    graph
        .connect(node, acc::OUT, node, acc::FB, EdgeTag::Feedback)
        .unwrap();
    graph.set_buffer_size(node, acc::OUT, 8).unwrap();
    let out = graph.create_value(node, acc::OUT).unwrap();
    graph.commit().unwrap();

    // Tick k observes k-1 in the latch, so every element counts the ticks.
    for tick in 1..=4u64 {
        executor.tick().unwrap();
        let resolved = graph.resolver().unwrap().resolve(&out).unwrap();
        assert_eq!(resolved.count::<f64>(), 8);
        for index in 0..8 {
            assert_eq!(resolved.read_at::<f64>(index), Ok(tick as f64));
        }
    }
}

#[test]
fn value_survives_destroy_for_exactly_one_tick() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let node = graph.create_node(ty::<Relay>());
    graph.set_value(node, relay::IN, 7.0f64).unwrap();
    let value = graph.create_value(node, relay::OUT).unwrap();
    graph.commit().unwrap();
    executor.tick().unwrap();

    // Destroy and release in the same tick; the window already in flight
    // still resolves.
    graph.destroy_node(node).unwrap();
    graph.release_value(value).unwrap();
    assert!(!graph.is_valid(node));
    let resolver = graph.resolver().unwrap();
    assert_eq!(resolver.resolve(&value).unwrap().read::<f64>(), Ok(7.0));

    // One more commit+tick and both the old and a fresh resolver refuse.
    graph.commit().unwrap();
    executor.tick().unwrap();
    assert_eq!(resolver.resolve(&value).err(), Some(Error::Disposed));
    let fresh = graph.resolver().unwrap();
    assert_eq!(fresh.resolve(&value).err(), Some(Error::Disposed));
}

#[test]
fn values_before_first_tick_are_not_yet_valid() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let node = graph.create_node(ty::<Relay>());
    let _value = graph.create_value(node, relay::OUT).unwrap();
    assert_eq!(graph.resolver().err(), Some(Error::NotYetValid));

    graph.commit().unwrap();
    executor.tick().unwrap();
    assert!(graph.resolver().is_ok());

    // A value registered after a completed tick reads NotYetValid until the
    // next tick includes it, not Disposed.
    let late = graph.create_value(node, relay::OUT).unwrap();
    assert_eq!(
        graph.resolver().unwrap().resolve(&late).err(),
        Some(Error::NotYetValid)
    );
    graph.commit().unwrap();
    executor.tick().unwrap();
    assert!(graph.resolver().unwrap().resolve(&late).is_ok());
}

#[test]
fn peeked_views_die_with_their_window() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let node = graph.create_node(ty::<Relay>());
    graph.set_value(node, relay::IN, 3.5f64).unwrap();
    graph.commit().unwrap();
    executor.tick().unwrap();

    let view = graph.peek_output(node, relay::OUT).unwrap();
    assert_eq!(view.read::<f64>(), Ok(3.5));

    // The next window invalidates the view: a deterministic error, not
    // garbage.
    graph.commit().unwrap();
    executor.tick().unwrap();
    assert_eq!(view.read::<f64>(), Err(Error::StaleView));
}

#[test]
fn destroying_cancels_only_that_nodes_pending_resizes() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let doomed = graph.create_node(ty::<Ramp>());
    let kept = graph.create_node(ty::<Ramp>());
    graph.commit().unwrap();

    graph.set_buffer_size(doomed, ramp::A, 1000).unwrap();
    graph.set_buffer_size(kept, ramp::A, 24).unwrap();
    graph.destroy_node(doomed).unwrap();

    let diff = graph.commit().unwrap();
    let resized: Vec<Change> = diff
        .changes
        .iter()
        .filter(|change| matches!(change, Change::BufferResized { .. }))
        .cloned()
        .collect();
    assert_eq!(resized.len(), 1);
    assert!(
        matches!(&resized[0], Change::BufferResized { node, len: 24, .. } if *node == kept)
    );

    executor.tick().unwrap();
    let view = graph.peek_output(kept, ramp::A).unwrap();
    assert_eq!(view.bytes().unwrap().len(), 24 * size_of::<f64>());
}

#[test]
fn kernel_bounds_errors_are_data_not_faults() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let ramp = graph.create_node(ty::<Ramp>());
    let probe = graph.create_node(ty::<Probe>());
    graph.connect(ramp, ramp::A, probe, probe::IN, EdgeTag::Normal).unwrap();
    graph.set_buffer_size(ramp, ramp::A, 4).unwrap();
    let ok = graph.create_value(probe, probe::OK).unwrap();
    let value = graph.create_value(probe, probe::VALUE).unwrap();

    // Probe::element defaults to 0, which is in range.
    graph.commit().unwrap();
    executor.tick().unwrap();
    let resolver = graph.resolver().unwrap();
    assert_eq!(resolver.resolve(&ok).unwrap().read::<u64>(), Ok(1));
    assert_eq!(resolver.resolve(&value).unwrap().read::<f64>(), Ok(1.0));

    // Shrink the buffer to zero: the kernel's own bounds check reports
    // through its output flag and the engine keeps ticking.
    graph.set_buffer_size(ramp, ramp::A, 0).unwrap();
    graph.commit().unwrap();
    executor.tick().unwrap();
    let resolver = graph.resolver().unwrap();
    assert_eq!(resolver.resolve(&ok).unwrap().read::<u64>(), Ok(0));
    graph.commit().unwrap();
    executor.tick().unwrap();
}

#[test]
fn state_record_buffers_resize_like_port_buffers() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let node = graph.create_node(ty::<Scratchpad>());
    let len = graph.create_value(node, 0).unwrap();

    for n in [5usize, 9, 0, 3] {
        graph.set_state_buffer_size(node, 0, n).unwrap();
        graph.commit().unwrap();
        executor.tick().unwrap();
        let resolved = graph.resolver().unwrap().resolve(&len).unwrap();
        assert_eq!(resolved.read::<u64>(), Ok(n as u64));
    }
}

#[test]
fn deferred_inputs_last_one_tick() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let consumer = graph.create_node(ty::<SumFour>());
    let total = graph.create_value(consumer, sum::TOTAL).unwrap();

    let host_data: Vec<f64> = vec![1.5, 2.5, 6.0];
    let bytes: Vec<u8> = host_data
        .iter()
        .flat_map(|value| value.to_ne_bytes())
        .collect();
    graph
        .submit_deferred_input(consumer, sum::IN[0], bytes)
        .unwrap();
    graph.commit().unwrap();
    executor.tick().unwrap();
    let resolved = graph.resolver().unwrap().resolve(&total).unwrap();
    assert_eq!(resolved.read::<f64>(), Ok(10.0));

    // Not resubmitted: the next commit repatches the input away from the
    // external memory.
    graph.commit().unwrap();
    executor.tick().unwrap();
    let resolved = graph.resolver().unwrap().resolve(&total).unwrap();
    assert_eq!(resolved.read::<f64>(), Ok(0.0));
}

#[test]
fn forwarded_ports_record_concrete_edges() {
    let mut graph = Graph::new(Options::default());
    let mut executor = graph.executor().unwrap();
    let shell = graph.create_message_node();
    let inner = graph.create_node(ty::<Relay>());
    let sink = graph.create_node(ty::<Relay>());
    graph.forward_port(shell, 0, inner, relay::OUT).unwrap();
    graph.set_value(inner, relay::IN, 9.0f64).unwrap();

    // Connecting from the shell's forwarded port lands on the inner node
    // in the committed graph.
    graph.connect(shell, 0, sink, relay::IN, EdgeTag::Normal).unwrap();
    let diff = graph.commit().unwrap();
    assert!(diff.changes.iter().any(|change| matches!(
        change,
        Change::Connected { source, .. } if *source == inner
    )));

    executor.tick().unwrap();
    let view = graph.peek_output(sink, relay::OUT).unwrap();
    assert_eq!(view.read::<f64>(), Ok(9.0));
}

#[test]
fn repeated_commits_without_mutations_are_empty() {
    let (mut graph, mut executor, _) = sum_graph(0);
    let first = graph.commit().unwrap();
    assert!(!first.is_empty());
    let second = graph.commit().unwrap();
    assert!(second.is_empty(), "unexpected changes: {second:?}");
    executor.tick().unwrap();
    let third = graph.commit().unwrap();
    assert!(third.is_empty());
}
