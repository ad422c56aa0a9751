//! Dead code elimination pass.
//!
//! Removes nodes none of whose outputs are read. Graph inputs and outputs
//! (`Parameter`, `Result`) are roots and always survive.

use qgather_ir::{Graph, NodeId, Op};

use crate::Pass;

/// Removes nodes whose results are never used.
#[derive(Debug)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dce"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut worklist: Vec<NodeId> = graph
            .iter()
            .filter(|(_, node)| is_dead(node))
            .map(|(id, _)| id)
            .collect();

        let mut removed = 0;
        while let Some(id) = worklist.pop() {
            // Already removed, or revived by an earlier pop.
            if !graph.try_node(id).is_some_and(is_dead) {
                continue;
            }
            let Ok(node) = graph.remove_node(id) else {
                continue;
            };
            removed += 1;
            // Producers may have lost their last reader.
            worklist.extend(node.inputs().iter().map(|src| src.node));
        }

        if removed > 0 {
            log::debug!("dce removed {removed} nodes");
        }
        removed > 0
    }
}

fn is_dead(node: &qgather_ir::Node) -> bool {
    !matches!(node.op, Op::Parameter | Op::Result) && node.is_unused()
}
