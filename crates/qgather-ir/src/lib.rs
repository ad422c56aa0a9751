//! qgather intermediate representation.
//!
//! An arena-based dataflow graph for inference models: nodes carry a closed
//! [`Op`] kind and statically typed output ports, and every port tracks the
//! input slots that read it. Passes mutate the graph through a small set of
//! primitives ([`Graph::replace_all_uses`], [`Graph::remove_node`]) that keep
//! those back-references consistent.

pub mod arena;
mod display;
mod error;
pub mod graph;
mod op;
mod types;

pub use arena::{Arena, Handle};
pub use display::dump_graph;
pub use error::IrError;
pub use graph::{Graph, Input, Node, NodeId, Output, OutputPort};
pub use op::{ConstantData, GatherCompressedAttrs, Granularity, Op};
pub use types::{Bits, Dimension, Scalar, ScalarKind, TensorInfo, TensorShape};
