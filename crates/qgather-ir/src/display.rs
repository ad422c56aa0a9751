//! Display implementations and text dump for debugging.

use std::fmt;
use std::fmt::Write as _;

use crate::graph::{Graph, Output};
use crate::op::{Granularity, Op};
use crate::types::{Dimension, Scalar, ScalarKind, TensorInfo, TensorShape};

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Sint => write!(f, "sint"),
            Self::Uint => write!(f, "uint"),
            Self::Float => write!(f, "float"),
            Self::BFloat => write!(f, "bfloat"),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Bool => write!(f, "bool"),
            ScalarKind::Sint => write!(f, "i{}", self.bits),
            ScalarKind::Uint => write!(f, "u{}", self.bits),
            ScalarKind::Float => write!(f, "f{}", self.bits),
            ScalarKind::BFloat => write!(f, "bf{}", self.bits),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Dynamic(Some(name)) => write!(f, "{name}"),
            Self::Dynamic(None) => write!(f, "?"),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scalar, self.shape)
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            0 => write!(f, "%{}", self.node.index()),
            i => write!(f, "%{}.{i}", self.node.index()),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerTensor => write!(f, "per_tensor"),
            Self::PerChannel => write!(f, "per_channel"),
            Self::Grouped { group_size } => write!(f, "grouped({group_size})"),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())?;
        match self {
            Self::Reshape { special_zero } => write!(f, " {{special_zero={special_zero}}}"),
            Self::Gather { batch_dims } => write!(f, " {{batch_dims={batch_dims}}}"),
            Self::GatherCompressed(attrs) => write!(
                f,
                " {{granularity={}, batch_dims={}}}",
                attrs.granularity, attrs.batch_dims
            ),
            Self::Constant(data) => write!(f, " <{} bytes>", data.bytes.len()),
            Self::Parameter
            | Self::Convert
            | Self::Subtract
            | Self::Multiply
            | Self::Result
            | Self::Custom { .. } => Ok(()),
        }
    }
}

/// Dump a graph as human-readable text, one node per line in handle order.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();
    for (id, node) in graph.iter() {
        let args = node
            .inputs()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let results = node
            .outputs()
            .iter()
            .map(|p| p.info.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(out, "  %{} = {}({args})", id.index(), node.op);
        if !results.is_empty() {
            let _ = write!(out, " -> {results}");
        }
        let _ = writeln!(out, "  \"{}\"", node.name);
    }
    out
}
