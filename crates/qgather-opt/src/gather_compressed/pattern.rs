//! Structural matching of embedding lookups over decompressed constants.
//!
//! Recognized chains, read from the gather's data input backward:
//!
//! ```text
//! Gather(data, indices, axis=0)
//!   data = [Convert]? ( [Reshape(_, Const)]? Multiply(x, Const scale) )
//!        | Convert(Const weight)
//!   x    = Subtract(Convert(Const weight), Const zp | Convert(Const zp))
//!        | Convert(Const weight)
//! ```
//!
//! Matching is purely structural; element types, shapes and sharing are
//! checked by [`validate`](super::validate).

use qgather_ir::{Graph, Node, NodeId, Op, Output};

/// Zero-point operand of the dequantizing `Subtract`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZeroPoint {
    /// The zero-point constant.
    pub constant: NodeId,
    /// Optional conversion of the constant to the decompression type.
    pub convert: Option<NodeId>,
}

/// `Subtract(Convert(weight), zero_point)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shift {
    pub subtract: NodeId,
    pub zero_point: ZeroPoint,
}

/// `Multiply(x, scale)` with an optional zero-point shift feeding `x`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dequant {
    pub multiply: NodeId,
    pub scale: NodeId,
    pub shift: Option<Shift>,
}

/// A structurally matched compressed-gather subgraph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// The anchoring `Gather`.
    pub gather: NodeId,
    /// Indices operand, passed through unchanged.
    pub indices: Output,
    /// The axis constant.
    pub axis: NodeId,
    /// Axis as written in the constant (possibly negative).
    pub axis_value: i64,
    /// Compressed weight table.
    pub weight: NodeId,
    /// `Convert` decompressing the weight table.
    pub convert: NodeId,
    /// Scale (and zero-point) arithmetic; `None` for a bare `Convert`.
    pub dequant: Option<Dequant>,
    /// Reshape flattening grouped weights into rows.
    pub reshape: Option<NodeId>,
    /// Trailing float-to-float `Convert` in front of the gather.
    pub output_convert: Option<NodeId>,
}

impl Candidate {
    /// The node feeding the gather's data input.
    pub fn chain_top(&self) -> NodeId {
        self.output_convert
            .or(self.reshape)
            .or(self.dequant.map(|d| d.multiply))
            .unwrap_or(self.convert)
    }

    /// Non-constant nodes between the weight table and the gather, ordered
    /// from the gather toward the weight (a valid removal order).
    pub fn intermediates(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::with_capacity(6);
        nodes.extend(self.output_convert);
        nodes.extend(self.reshape);
        if let Some(dq) = &self.dequant {
            nodes.push(dq.multiply);
            if let Some(shift) = &dq.shift {
                nodes.push(shift.subtract);
                nodes.extend(shift.zero_point.convert);
            }
        }
        nodes.push(self.convert);
        nodes
    }

    /// Returns `true` if every matched node still exists and the gather still
    /// reads the chain top.
    pub fn is_live(&self, graph: &Graph) -> bool {
        let Some(gather) = graph.try_node(self.gather) else {
            return false;
        };
        matches!(gather.op, Op::Gather { .. })
            && gather.input(0) == Some(Output::of(self.chain_top()))
            && gather.input(1) == Some(self.indices)
            && [self.axis, self.weight]
                .into_iter()
                .chain(self.intermediates())
                .all(|id| graph.contains(id))
    }
}

/// Lazily matches every `Gather` in the graph, in handle order.
pub fn matches(graph: &Graph) -> impl Iterator<Item = Candidate> + '_ {
    graph.iter().filter_map(move |(id, node)| match node.op {
        Op::Gather { .. } => match_gather(graph, id),
        _ => None,
    })
}

/// Matches a single `Gather` node.
pub fn match_gather(graph: &Graph, gather: NodeId) -> Option<Candidate> {
    let node = graph.try_node(gather)?;
    let Op::Gather { batch_dims } = node.op else {
        return None;
    };
    let [data, indices, axis] = node.inputs() else {
        return None;
    };
    if batch_dims != 0 {
        log::trace!("gather '{}': batch_dims={batch_dims}, not fusible", node.name);
        return None;
    }

    let axis_value = match graph.constant_i64(*axis).as_deref() {
        Some(&[value]) => value,
        _ => {
            log::trace!("gather '{}': axis is not a constant scalar", node.name);
            return None;
        }
    };
    let data_rank = graph.output_info(*data)?.shape.rank() as i64;
    let resolved = if axis_value < 0 { axis_value + data_rank } else { axis_value };
    if resolved != 0 {
        log::trace!("gather '{}': axis {axis_value} is not the table axis", node.name);
        return None;
    }

    if data.index != 0 {
        return None;
    }
    let chain = walk_chain(graph, data.node)?;

    log::trace!("gather '{}': matched compressed table '{}'", node.name, graph.node(chain.weight).name);
    Some(Candidate {
        gather,
        indices: *indices,
        axis: axis.node,
        axis_value,
        weight: chain.weight,
        convert: chain.convert,
        dequant: chain.dequant,
        reshape: chain.reshape,
        output_convert: chain.output_convert,
    })
}

struct Chain {
    weight: NodeId,
    convert: NodeId,
    dequant: Option<Dequant>,
    reshape: Option<NodeId>,
    output_convert: Option<NodeId>,
}

fn walk_chain(graph: &Graph, top: NodeId) -> Option<Chain> {
    let mut cursor = top;
    let mut output_convert = None;
    let mut reshape = None;

    if let Op::Convert = graph.node(cursor).op {
        if let Some(weight) = decompressed_constant(graph, cursor) {
            return Some(Chain {
                weight,
                convert: cursor,
                dequant: None,
                reshape: None,
                output_convert: None,
            });
        }
        output_convert = Some(cursor);
        cursor = sole_operand(graph.node(cursor))?;
    }

    if let Op::Reshape { .. } = graph.node(cursor).op {
        let node = graph.node(cursor);
        let [data, target] = node.inputs() else {
            return None;
        };
        graph.constant(*target)?;
        if data.index != 0 {
            return None;
        }
        reshape = Some(cursor);
        cursor = data.node;
    }

    let multiply = graph.node(cursor);
    let Op::Multiply = multiply.op else {
        return None;
    };
    let [lhs, rhs] = multiply.inputs() else {
        return None;
    };
    // Multiply is commutative: accept the scale on either side.
    let (convert, weight, scale, shift) =
        match_scaled(graph, *lhs, *rhs).or_else(|| match_scaled(graph, *rhs, *lhs))?;

    Some(Chain {
        weight,
        convert,
        dequant: Some(Dequant {
            multiply: cursor,
            scale,
            shift,
        }),
        reshape,
        output_convert,
    })
}

/// Matches `x * scale` where `scale` is constant and `x` is either the
/// decompressed weight or the zero-point shifted weight.
fn match_scaled(
    graph: &Graph,
    x: Output,
    scale: Output,
) -> Option<(NodeId, NodeId, NodeId, Option<Shift>)> {
    if x.index != 0 || scale.index != 0 {
        return None;
    }
    graph.constant(scale)?;

    let node = graph.node(x.node);
    match node.op {
        Op::Convert => {
            let weight = decompressed_constant(graph, x.node)?;
            Some((x.node, weight, scale.node, None))
        }
        Op::Subtract => {
            let [minuend, zp] = node.inputs() else {
                return None;
            };
            if minuend.index != 0 || zp.index != 0 {
                return None;
            }
            let weight = decompressed_constant(graph, minuend.node)?;
            let zero_point = match_zero_point(graph, *zp)?;
            Some((
                minuend.node,
                weight,
                scale.node,
                Some(Shift {
                    subtract: x.node,
                    zero_point,
                }),
            ))
        }
        _ => None,
    }
}

fn match_zero_point(graph: &Graph, zp: Output) -> Option<ZeroPoint> {
    if graph.constant(zp).is_some() {
        return Some(ZeroPoint {
            constant: zp.node,
            convert: None,
        });
    }
    if let Op::Convert = graph.node(zp.node).op {
        let constant = decompressed_constant(graph, zp.node)?;
        return Some(ZeroPoint {
            constant,
            convert: Some(zp.node),
        });
    }
    None
}

/// If `convert` is `Convert(Constant)`, returns the constant.
fn decompressed_constant(graph: &Graph, convert: NodeId) -> Option<NodeId> {
    let node = graph.node(convert);
    if !matches!(node.op, Op::Convert) {
        return None;
    }
    let src = sole_operand_port(node)?;
    graph.constant(src).map(|_| src.node)
}

fn sole_operand_port(node: &Node) -> Option<Output> {
    match node.inputs() {
        [src] if src.index == 0 => Some(*src),
        _ => None,
    }
}

fn sole_operand(node: &Node) -> Option<NodeId> {
    sole_operand_port(node).map(|src| src.node)
}
