//! Graph validation pass.
//!
//! Checks structural invariants of the graph and logs warnings for
//! problems found. This pass never modifies the graph.

use qgather_ir::{Graph, Op};

use crate::Pass;

/// Validates graph structural invariants. Returns `false` (never modifies the graph).
#[derive(Debug)]
pub struct GraphValidation;

impl Pass for GraphValidation {
    fn name(&self) -> &str {
        "graph-validation"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        validate_graph(graph);
        false
    }
}

/// Returns the number of problems found.
fn validate_graph(graph: &Graph) -> usize {
    let mut problems = 0;

    if let Err(err) = graph.validate() {
        log::warn!("graph edges are inconsistent: {err}");
        problems += 1;
    }
    if let Err(err) = graph.topological_order() {
        log::warn!("graph is not a DAG: {err}");
        problems += 1;
    }

    for (id, node) in graph.iter() {
        let arity = node.inputs().len();
        let expected = match node.op {
            Op::Parameter | Op::Constant(_) => 0..=0,
            Op::Convert | Op::Result => 1..=1,
            Op::Subtract | Op::Multiply | Op::Reshape { .. } => 2..=2,
            Op::Gather { .. } => 3..=3,
            Op::GatherCompressed(_) => 4..=5,
            Op::Custom { .. } => continue,
        };
        if !expected.contains(&arity) {
            log::warn!(
                "node '{}' ({id:?}, {}) has {arity} inputs, expected {:?}",
                node.name,
                node.op.type_name(),
                expected
            );
            problems += 1;
        }
    }

    problems
}
