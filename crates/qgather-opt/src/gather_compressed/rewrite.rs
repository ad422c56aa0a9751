//! Replaces a validated candidate with a single `GatherCompressed` node.

use qgather_ir::{
    ConstantData, Dimension, GatherCompressedAttrs, Graph, IrError, NodeId, Op, Output, Scalar,
    TensorInfo, TensorShape,
};

use super::pattern::Candidate;
use super::validate::QuantLayout;

/// Failure to apply a validated candidate.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("fused output {fused} is incompatible with gather output {gather}")]
    OutputMismatch { gather: TensorInfo, fused: TensorInfo },
    #[error("candidate no longer matches the graph")]
    Stale,
    #[error("no unit scale encoding for {0}")]
    UnitScale(Scalar),
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Rewires the gather's readers to a new fused node and drops the
/// decompression nodes nobody else reads.
///
/// The graph is not touched when an error other than [`RewriteError::Ir`]
/// is returned.
pub fn rewrite(
    graph: &mut Graph,
    candidate: &Candidate,
    layout: &QuantLayout,
) -> Result<NodeId, RewriteError> {
    if !candidate.is_live(graph) {
        return Err(RewriteError::Stale);
    }

    let gather = graph.node(candidate.gather);
    let name = gather.name.clone();
    let gather_info = gather.outputs()[0].info.clone();
    let fused_info = inferred_output(graph, candidate)?;
    if fused_info.scalar != gather_info.scalar || !fused_info.shape.is_compatible(&gather_info.shape)
    {
        return Err(RewriteError::OutputMismatch {
            gather: gather_info,
            fused: fused_info,
        });
    }

    let unit_scale = match candidate.dequant {
        Some(_) => None,
        None => {
            let float = graph.node(candidate.convert).outputs()[0].info.scalar;
            let one =
                ConstantData::from_floats(float, &[1.0]).ok_or(RewriteError::UnitScale(float))?;
            Some((float, one))
        }
    };

    let axis = if candidate.axis_value == 0 {
        Output::of(candidate.axis)
    } else {
        Output::of(graph.add_constant(
            format!("{name}/axis"),
            TensorInfo::fixed(Scalar::I64, &[]),
            ConstantData::from_i64(&[0]),
        )?)
    };

    let mut inputs = vec![Output::of(candidate.weight), candidate.indices, axis];
    if let Some(dq) = &candidate.dequant {
        inputs.push(Output::of(dq.scale));
        if let Some(shift) = &dq.shift {
            inputs.push(Output::of(shift.zero_point.constant));
        }
    }
    if let Some((float, one)) = unit_scale {
        let scale = graph.add_constant(
            format!("{name}/scale"),
            TensorInfo::new(float, TensorShape::scalar()),
            one,
        )?;
        inputs.push(Output::of(scale));
    }

    let fused = graph.add_node(
        Op::GatherCompressed(GatherCompressedAttrs {
            granularity: layout.granularity,
            batch_dims: 0,
        }),
        inputs,
        vec![gather_info],
        name,
    )?;

    graph.replace_all_uses(Output::of(candidate.gather), Output::of(fused))?;
    graph.remove_node(candidate.gather)?;
    for id in candidate.intermediates() {
        if graph.try_node(id).is_some_and(|node| node.is_unused()) {
            graph.remove_node(id)?;
        }
    }

    Ok(fused)
}

/// `indices.shape ++ row shape`, typed like the top of the decompression chain.
fn inferred_output(graph: &Graph, candidate: &Candidate) -> Result<TensorInfo, RewriteError> {
    let indices = &graph.port(candidate.indices)?.info;
    let data = &graph.port(Output::of(candidate.chain_top()))?.info;
    let mut dims: Vec<Dimension> = indices.shape.dims.clone();
    dims.extend(data.shape.dims.iter().skip(1).cloned());
    Ok(TensorInfo::new(data.scalar, TensorShape { dims }))
}
