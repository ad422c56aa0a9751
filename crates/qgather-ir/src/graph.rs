//! Computation graph: nodes in a slot arena, edges as producer ports with
//! consumer back-references.
//!
//! Every edge is owned by the graph. A node refers to its producers through
//! [`Output`] handles and each [`OutputPort`] records the [`Input`] slots that
//! read it, so "who reads this value" is answered without scanning the graph
//! and removing a node never leaves a dangling pointer.

use std::collections::BTreeSet;

use crate::arena::{Arena, Handle};
use crate::error::IrError;
use crate::op::{ConstantData, Op};
use crate::types::TensorInfo;

/// A unique identifier for a node in the computation graph.
pub type NodeId = Handle<Node>;

/// One output port of a producer node.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Output {
    pub node: NodeId,
    pub index: u32,
}

impl Output {
    pub fn new(node: NodeId, index: u32) -> Self {
        Self { node, index }
    }

    /// The first (usually only) output of `node`.
    pub fn of(node: NodeId) -> Self {
        Self::new(node, 0)
    }
}

/// One input slot of a consumer node.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Input {
    pub node: NodeId,
    pub index: u32,
}

/// Static description of an output plus the slots that read it.
#[derive(Clone, Debug)]
pub struct OutputPort {
    pub info: TensorInfo,
    consumers: BTreeSet<Input>,
}

impl OutputPort {
    fn new(info: TensorInfo) -> Self {
        Self {
            info,
            consumers: BTreeSet::new(),
        }
    }

    /// Consumer slots, ordered by node handle then slot index.
    pub fn consumers(&self) -> &BTreeSet<Input> {
        &self.consumers
    }
}

/// A node in the computation graph.
#[derive(Clone, Debug)]
pub struct Node {
    /// Human-readable name for this node.
    pub name: String,
    /// The operation this node performs.
    pub op: Op,
    inputs: Vec<Output>,
    outputs: Vec<OutputPort>,
}

impl Node {
    /// Producer ports read by this node, in operand order.
    pub fn inputs(&self) -> &[Output] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Option<Output> {
        self.inputs.get(index).copied()
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    /// Type and shape of output `index`.
    pub fn output_info(&self, index: usize) -> Option<&TensorInfo> {
        self.outputs.get(index).map(|p| &p.info)
    }

    /// Returns `true` if no output of this node is read by anyone.
    pub fn is_unused(&self) -> bool {
        self.outputs.iter().all(|p| p.consumers.is_empty())
    }
}

/// A computation graph (DAG) of operations.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Arena<Node>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its id.
    ///
    /// Every input must name a live port. `Constant` payloads are checked
    /// against their declared type and shape.
    pub fn add_node(
        &mut self,
        op: Op,
        inputs: Vec<Output>,
        outputs: Vec<TensorInfo>,
        name: impl Into<String>,
    ) -> Result<NodeId, IrError> {
        let name = name.into();

        for &src in &inputs {
            self.port(src)?;
        }
        if let Op::Constant(data) = &op {
            check_constant(&name, data, &outputs)?;
        }

        let id = self.nodes.next_handle();
        for (slot, &src) in inputs.iter().enumerate() {
            self.port_mut(src)?.consumers.insert(Input {
                node: id,
                index: slot as u32,
            });
        }

        Ok(self.nodes.append(Node {
            name,
            op,
            inputs,
            outputs: outputs.into_iter().map(OutputPort::new).collect(),
        }))
    }

    /// Add a graph input.
    pub fn add_parameter(&mut self, name: impl Into<String>, info: TensorInfo) -> NodeId {
        self.nodes.append(Node {
            name: name.into(),
            op: Op::Parameter,
            inputs: Vec::new(),
            outputs: vec![OutputPort::new(info)],
        })
    }

    /// Add a constant tensor.
    pub fn add_constant(
        &mut self,
        name: impl Into<String>,
        info: TensorInfo,
        data: ConstantData,
    ) -> Result<NodeId, IrError> {
        self.add_node(Op::Constant(data), Vec::new(), vec![info], name)
    }

    /// Add a graph output reading `source`.
    pub fn add_result(
        &mut self,
        name: impl Into<String>,
        source: Output,
    ) -> Result<NodeId, IrError> {
        self.add_node(Op::Result, vec![source], Vec::new(), name)
    }

    /// Number of live nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    /// # Panics
    ///
    /// Panics if `id` does not name a live node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.try_get(id)
    }

    /// Iterates over live nodes in handle (creation) order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    /// Looks up a producer port.
    pub fn port(&self, output: Output) -> Result<&OutputPort, IrError> {
        let node = self
            .nodes
            .try_get(output.node)
            .ok_or(IrError::UnknownNode(output.node))?;
        node.outputs
            .get(output.index as usize)
            .ok_or(IrError::BadOutputIndex {
                node: output.node,
                index: output.index,
                count: node.outputs.len(),
            })
    }

    fn port_mut(&mut self, output: Output) -> Result<&mut OutputPort, IrError> {
        let node = self
            .nodes
            .try_get_mut(output.node)
            .ok_or(IrError::UnknownNode(output.node))?;
        let count = node.outputs.len();
        node.outputs
            .get_mut(output.index as usize)
            .ok_or(IrError::BadOutputIndex {
                node: output.node,
                index: output.index,
                count,
            })
    }

    /// Type and shape of a producer port.
    pub fn output_info(&self, output: Output) -> Option<&TensorInfo> {
        self.port(output).ok().map(|p| &p.info)
    }

    /// Slots reading `output`, ordered by consumer handle.
    pub fn consumers(&self, output: Output) -> impl Iterator<Item = Input> + '_ {
        self.port(output)
            .ok()
            .into_iter()
            .flat_map(|p| p.consumers.iter().copied())
    }

    pub fn consumer_count(&self, output: Output) -> usize {
        self.port(output).map_or(0, |p| p.consumers.len())
    }

    /// The producer port feeding an input slot.
    pub fn producer(&self, input: Input) -> Option<Output> {
        self.try_node(input.node)?.input(input.index as usize)
    }

    /// Payload and description of `output` if its producer is a `Constant`.
    pub fn constant(&self, output: Output) -> Option<(&ConstantData, &TensorInfo)> {
        let node = self.try_node(output.node)?;
        match &node.op {
            Op::Constant(data) => Some((data, node.output_info(output.index as usize)?)),
            _ => None,
        }
    }

    /// Integer values of a constant output.
    pub fn constant_i64(&self, output: Output) -> Option<Vec<i64>> {
        let (data, info) = self.constant(output)?;
        data.values_i64(info.scalar, info.shape.numel()?)
    }

    /// Values of a constant output widened to `f32`.
    pub fn constant_f32(&self, output: Output) -> Option<Vec<f32>> {
        let (data, info) = self.constant(output)?;
        data.values_f32(info.scalar, info.shape.numel()?)
    }

    /// Redirects every reader of `from` to read `to` instead.
    ///
    /// Both ports must carry identical type and shape, so the change is
    /// invisible to the redirected consumers. Returns the number of moved
    /// slots. The consumer set moves as a whole: the readers of `to` after
    /// the call are its previous readers plus exactly the readers of `from`.
    pub fn replace_all_uses(&mut self, from: Output, to: Output) -> Result<usize, IrError> {
        if self.port(from)?.info != self.port(to)?.info {
            return Err(IrError::IncompatibleRewire { from, to });
        }
        if from == to {
            return Ok(0);
        }

        let moved = std::mem::take(&mut self.port_mut(from)?.consumers);
        for input in &moved {
            let node = self
                .nodes
                .try_get_mut(input.node)
                .ok_or(IrError::UnknownNode(input.node))?;
            node.inputs[input.index as usize] = to;
        }
        let count = moved.len();
        self.port_mut(to)?.consumers.extend(moved);
        Ok(count)
    }

    /// Removes a node whose outputs are no longer read.
    ///
    /// The node is detached from the consumer sets of its producers.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, IrError> {
        let node = self.nodes.try_get(id).ok_or(IrError::UnknownNode(id))?;
        let consumers: usize = node.outputs.iter().map(|p| p.consumers.len()).sum();
        if consumers > 0 {
            return Err(IrError::NodeInUse {
                name: node.name.clone(),
                consumers,
            });
        }

        let node = self.nodes.remove(id).ok_or(IrError::UnknownNode(id))?;
        for (slot, &src) in node.inputs.iter().enumerate() {
            if let Ok(port) = self.port_mut(src) {
                port.consumers.remove(&Input {
                    node: id,
                    index: slot as u32,
                });
            }
        }
        Ok(node)
    }

    /// Returns node ids in topological order.
    ///
    /// The ordering is deterministic: among ready nodes, the one with the
    /// smaller [`NodeId`] is emitted first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, IrError> {
        let mut in_degree: Vec<usize> = vec![0; self.nodes.next_handle().index()];
        let mut ready: BTreeSet<NodeId> = BTreeSet::new();
        for (id, node) in self.nodes.iter() {
            in_degree[id.index()] = node.inputs.len();
            if node.inputs.is_empty() {
                ready.insert(id);
            }
        }

        let total = self.nodes.len();
        let mut result = Vec::with_capacity(total);

        while let Some(id) = ready.pop_first() {
            result.push(id);
            for port in &self.nodes[id].outputs {
                for consumer in &port.consumers {
                    let deg = &mut in_degree[consumer.node.index()];
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(consumer.node);
                    }
                }
            }
        }

        if result.len() != total {
            return Err(IrError::Cycle {
                visited: result.len(),
                total,
            });
        }
        Ok(result)
    }

    /// Checks structural invariants: every input names a live port, and
    /// every consumer set mirrors exactly the slots that read it.
    pub fn validate(&self) -> Result<(), IrError> {
        for (id, node) in self.nodes.iter() {
            for (slot, &src) in node.inputs.iter().enumerate() {
                let input = Input {
                    node: id,
                    index: slot as u32,
                };
                let port = self
                    .port(src)
                    .map_err(|_| IrError::DanglingInput { input, port: src })?;
                if !port.consumers.contains(&input) {
                    return Err(IrError::ConsumerMismatch(src));
                }
            }
            for (index, port) in node.outputs.iter().enumerate() {
                let output = Output::new(id, index as u32);
                for &consumer in &port.consumers {
                    if self.producer(consumer) != Some(output) {
                        return Err(IrError::ConsumerMismatch(output));
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_constant(name: &str, data: &ConstantData, outputs: &[TensorInfo]) -> Result<(), IrError> {
    let [info] = outputs else {
        return Err(IrError::ConstantSize {
            name: name.to_owned(),
            expected: 1,
            found: outputs.len(),
        });
    };
    let numel = info
        .shape
        .numel()
        .ok_or_else(|| IrError::DynamicConstant(name.to_owned()))?;
    let expected = info.scalar.byte_len(numel);
    if data.bytes.len() != expected {
        return Err(IrError::ConstantSize {
            name: name.to_owned(),
            expected,
            found: data.bytes.len(),
        });
    }
    Ok(())
}
