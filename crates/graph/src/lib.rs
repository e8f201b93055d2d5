//! ## Usage
//!
//! ```rs
//! use weft_graph as graph;
//!
//! let mut graph = graph::Graph::new(graph::Options { num_workers: 4 });
//! let mut executor = graph.executor().unwrap();
//!
//! // Assemble a topology.
//! let source = graph.create_node(kernel::KernelType::of::<Ramp>());
//! let sink = graph.create_node(kernel::KernelType::of::<Sum>());
//! graph.connect(source, OUT, sink, IN, graph::EdgeTag::Normal)?;
//! graph.set_buffer_size(source, OUT, 1024)?;
//! let total = graph.create_value(sink, TOTAL)?;
//!
//! // Compile and run one tick, then read the result back.
//! graph.commit()?;
//! executor.tick()?;
//! let sum: f32 = graph.resolver()?.resolve(&total)?.read()?;
//! ```
//!
//! Each tick is one single-threaded diff/compile phase followed by one
//! parallel execution phase over the compiled plan. Structural mutations
//! are validated when requested; `commit` turns them into a [GraphDiff],
//! repatches the arena, and publishes the next execution state.
pub mod diff;
pub mod error;
pub mod graph;
pub mod resolve;
pub mod scope;

mod executor;
mod forward;
mod schedule;
mod topology;

pub use diff::{Change, GraphDiff};
pub use error::{Error, Result};
pub use executor::Executor;
pub use graph::{Graph, Options};
pub use resolve::{GraphValue, Resolver, ValueView};
pub use scope::{ArenaView, ScopeManager};
pub use topology::{EdgeId, EdgeTag, Node, PortId};
