//! Property tests over the public mutation surface.

use kernel::{port, Invoke, Kernel, KernelType, Port, Status};
use proptest::prelude::*;
use weft_graph::{EdgeTag, Graph, Options};

#[derive(Default)]
struct Relay;

impl Kernel for Relay {
    const NAME: &'static str = "relay-props";
    const PORTS: &'static [Port] = &[
        Port::input("in", port::F64),
        Port::output("out", port::F64),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        let value: f64 = cx.scalar_in(0);
        *cx.scalar_out(1) = value;
        Status::Ok
    }
}

#[derive(Default)]
struct Ramp;

impl Kernel for Ramp {
    const NAME: &'static str = "ramp-props";
    const PORTS: &'static [Port] = &[Port::output("out", port::F64_BUFFER)];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        for (index, sample) in cx.buffer_out::<f64>(0).iter_mut().enumerate() {
            *sample = index as f64;
        }
        Status::Ok
    }
}

#[derive(Default)]
struct LenOf;

impl Kernel for LenOf {
    const NAME: &'static str = "len-of-props";
    const PORTS: &'static [Port] = &[
        Port::input("in", port::F64_BUFFER),
        Port::output("len", port::U64),
    ];

    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status {
        *cx.scalar_out::<u64>(1) = cx.buffer_in::<f64>(0).len() as u64;
        Status::Ok
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every committed resize resolves to exactly the requested length.
    #[test]
    fn resize_requests_resolve_exactly(sizes in prop::collection::vec(0usize..512, 1..8)) {
        let mut graph = Graph::new(Options::default());
        let mut executor = graph.executor().unwrap();
        let ramp = graph.create_node(KernelType::of::<Ramp>());
        let len_of = graph.create_node(KernelType::of::<LenOf>());
        graph.connect(ramp, 0, len_of, 0, EdgeTag::Normal).unwrap();
        let len = graph.create_value(len_of, 1).unwrap();

        for n in sizes {
            graph.set_buffer_size(ramp, 0, n).unwrap();
            graph.commit().unwrap();
            executor.tick().unwrap();
            let resolved = graph.resolver().unwrap().resolve(&len).unwrap();
            prop_assert_eq!(resolved.read::<u64>(), Ok(n as u64));
        }
    }

    /// Connects that are fully undone before the commit leave no trace in
    /// the diff.
    #[test]
    fn netted_out_mutations_produce_empty_diffs(
        pairs in prop::collection::vec((0usize..5, 0usize..5), 0..16)
    ) {
        let mut graph = Graph::new(Options::default());
        let relays: Vec<_> = (0..5)
            .map(|_| graph.create_node(KernelType::of::<Relay>()))
            .collect();
        graph.commit().unwrap();

        let mut edges = Vec::new();
        for (i, j) in pairs {
            // Self-loops, duplicates, occupied inputs, and cycles are
            // rejected without corrupting anything.
            if let Ok(edge) = graph.connect(relays[i], 1, relays[j], 0, EdgeTag::Normal) {
                edges.push(edge);
            }
        }
        for edge in edges {
            graph.disconnect(edge).unwrap();
        }
        let diff = graph.commit().unwrap();
        prop_assert!(diff.is_empty(), "leftover changes: {:?}", diff);
    }
}
