//! Error types for the qgather IR.

use crate::graph::{Input, NodeId, Output};

/// Errors that can occur when constructing, mutating or validating a graph.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A handle names a node that does not exist (or was removed).
    #[error("node {0:?} does not exist")]
    UnknownNode(NodeId),

    /// A port index is out of range for its node.
    #[error("node {node:?} has {count} output(s), port {index} requested")]
    BadOutputIndex { node: NodeId, index: u32, count: usize },

    /// A constant payload does not match its declared type and shape.
    #[error("constant '{name}' holds {found} bytes, {expected} expected")]
    ConstantSize {
        name: String,
        expected: usize,
        found: usize,
    },

    /// A constant was declared with a partially dynamic shape.
    #[error("constant '{0}' must have a static shape")]
    DynamicConstant(String),

    /// Removing the node would leave dangling consumers.
    #[error("node '{name}' still has {consumers} consumer(s)")]
    NodeInUse { name: String, consumers: usize },

    /// Rewiring between ports of different type or shape.
    #[error("cannot redirect {from:?} to {to:?}: output descriptions differ")]
    IncompatibleRewire { from: Output, to: Output },

    /// The graph is not a DAG.
    #[error("graph contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle { visited: usize, total: usize },

    /// A consumer reads from a port that does not exist.
    #[error("input {input:?} reads missing port {port:?}")]
    DanglingInput { input: Input, port: Output },

    /// Consumer back-references disagree with input lists.
    #[error("consumer set of {0:?} does not mirror its readers")]
    ConsumerMismatch(Output),
}
