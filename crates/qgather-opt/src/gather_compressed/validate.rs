//! Type, shape and sharing constraints on matched candidates.

use qgather_ir::{Dimension, Granularity, Graph, NodeId, Op, Output, Scalar, TensorInfo, TensorShape};

use super::FusionConfig;
use super::pattern::{Candidate, Dequant};

/// Why a structurally matched candidate was not fused.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("weight type {0} is not a supported compressed type")]
    UnsupportedWeightType(Scalar),
    #[error("indices type {0} is not an integer type")]
    NonIntegerIndices(Scalar),
    #[error("decompression produces non-float type {0}")]
    NonFloatDecompression(Scalar),
    #[error("{what} has type {found}, expected {expected}")]
    TypeMismatch {
        what: &'static str,
        expected: Scalar,
        found: Scalar,
    },
    #[error("weight rank {0} is not supported")]
    UnsupportedRank(usize),
    #[error("gather axis {0} does not select table rows")]
    UnsupportedAxis(i64),
    #[error("{what} has shape {found}, expected {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: TensorShape,
        found: TensorShape,
    },
    #[error("{what} shape {shape} matches no layout of weight {weight}")]
    UnrecognizedLayout {
        what: &'static str,
        shape: TensorShape,
        weight: TensorShape,
    },
    #[error("zero point granularity {zero_point} differs from scale granularity {scale}")]
    MixedGranularity {
        scale: Granularity,
        zero_point: Granularity,
    },
    #[error("row length {row_len} does not split into {groups} groups")]
    GroupSizeMismatch { row_len: u32, groups: u32 },
    #[error("reshape to {0} does not flatten table rows")]
    UnsupportedReshape(TensorShape),
    #[error("{0} is read outside the decompression chain")]
    SharedConstant(&'static str),
    #[error("skipped by configuration")]
    Skipped,
}

/// Whether the compressed values are shifted by a zero point.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Encoding {
    Symmetric,
    Asymmetric,
}

/// Quantization layout recovered from a valid candidate.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct QuantLayout {
    pub encoding: Encoding,
    /// Granularity of the scale.
    pub granularity: Granularity,
}

/// Checks a candidate against the fusion constraints.
///
/// Never mutates the graph. The first violated constraint is returned.
pub fn validate(
    graph: &Graph,
    candidate: &Candidate,
    config: &FusionConfig,
) -> Result<QuantLayout, Rejection> {
    let weight = info(graph, candidate.weight);
    let decompressed = info(graph, candidate.convert);
    let gather = info(graph, candidate.gather);
    let indices = &graph.node(candidate.indices.node).outputs()[candidate.indices.index as usize]
        .info;
    let top = info(graph, candidate.chain_top());

    // Element types.
    if !config.weight_types.contains(&weight.scalar) {
        return Err(Rejection::UnsupportedWeightType(weight.scalar));
    }
    if !indices.scalar.is_integer() {
        return Err(Rejection::NonIntegerIndices(indices.scalar));
    }
    if !decompressed.scalar.is_float() {
        return Err(Rejection::NonFloatDecompression(decompressed.scalar));
    }
    let float = decompressed.scalar;
    if let Some(dq) = &candidate.dequant {
        check_types(graph, dq, float)?;
    }
    if let Some(reshape) = candidate.reshape {
        expect_type(info(graph, reshape), "reshape", float)?;
    }
    if let Some(cvt) = candidate.output_convert {
        let found = info(graph, cvt).scalar;
        if !found.is_float() {
            return Err(Rejection::NonFloatDecompression(found));
        }
    }
    expect_type(top, "gather data", gather.scalar)?;

    // Rank and axis.
    let Some(w_dims) = weight.shape.static_dims() else {
        return Err(Rejection::UnsupportedRank(weight.shape.rank()));
    };
    if w_dims.len() < 2 {
        return Err(Rejection::UnsupportedRank(w_dims.len()));
    }
    let resolved = match candidate.axis_value {
        a if a < 0 => a + top.shape.rank() as i64,
        a => a,
    };
    if resolved != 0 {
        return Err(Rejection::UnsupportedAxis(candidate.axis_value));
    }
    expect_shape(decompressed, "weight conversion", &weight.shape)?;
    if let Some(dq) = &candidate.dequant {
        expect_shape(info(graph, dq.multiply), "multiply", &weight.shape)?;
        if let Some(shift) = &dq.shift {
            expect_shape(info(graph, shift.subtract), "subtract", &weight.shape)?;
        }
    }
    if let Some(cvt) = candidate.output_convert {
        let src = graph.node(cvt).input(0).map(|o| o.node).unwrap_or(cvt);
        expect_shape(info(graph, cvt), "output conversion", &info(graph, src).shape)?;
    }
    if top.shape.dims.first() != Some(&Dimension::Fixed(w_dims[0] as u32)) {
        return Err(Rejection::ShapeMismatch {
            what: "gather data",
            expected: weight.shape.clone(),
            found: top.shape.clone(),
        });
    }

    // Granularity.
    let grouped = candidate.reshape.is_some() && w_dims.len() == 3;
    let (granularity, encoding) = match &candidate.dequant {
        None => (Granularity::PerTensor, Encoding::Symmetric),
        Some(dq) => {
            let scale = info(graph, dq.scale);
            let scale_granularity = classify(&scale.shape, &w_dims, grouped).ok_or_else(|| {
                Rejection::UnrecognizedLayout {
                    what: "scale",
                    shape: scale.shape.clone(),
                    weight: weight.shape.clone(),
                }
            })?;
            let encoding = match &dq.shift {
                None => Encoding::Symmetric,
                Some(shift) => {
                    let zp = info(graph, shift.zero_point.constant);
                    let zp_granularity = classify(&zp.shape, &w_dims, grouped).ok_or_else(|| {
                        Rejection::UnrecognizedLayout {
                            what: "zero point",
                            shape: zp.shape.clone(),
                            weight: weight.shape.clone(),
                        }
                    })?;
                    if zp_granularity != Granularity::PerTensor
                        && zp_granularity != scale_granularity
                    {
                        return Err(Rejection::MixedGranularity {
                            scale: scale_granularity,
                            zero_point: zp_granularity,
                        });
                    }
                    Encoding::Asymmetric
                }
            };
            (scale_granularity, encoding)
        }
    };

    // Reshape and group size.
    let granularity = match candidate.reshape {
        None => granularity,
        Some(reshape) => check_reshape(info(graph, reshape), &w_dims, granularity)?,
    };

    // Sharing.
    if let Some(dq) = &candidate.dequant {
        check_sole_use(graph, dq)?;
    }

    if let Some(skip) = &config.skip
        && skip(graph.node(candidate.gather))
    {
        return Err(Rejection::Skipped);
    }

    Ok(QuantLayout {
        encoding,
        granularity,
    })
}

fn info(graph: &Graph, id: NodeId) -> &TensorInfo {
    &graph.node(id).outputs()[0].info
}

fn expect_type(info: &TensorInfo, what: &'static str, expected: Scalar) -> Result<(), Rejection> {
    if info.scalar == expected {
        Ok(())
    } else {
        Err(Rejection::TypeMismatch {
            what,
            expected,
            found: info.scalar,
        })
    }
}

fn expect_shape(
    info: &TensorInfo,
    what: &'static str,
    expected: &TensorShape,
) -> Result<(), Rejection> {
    if &info.shape == expected {
        Ok(())
    } else {
        Err(Rejection::ShapeMismatch {
            what,
            expected: expected.clone(),
            found: info.shape.clone(),
        })
    }
}

fn check_types(graph: &Graph, dq: &Dequant, float: Scalar) -> Result<(), Rejection> {
    expect_type(info(graph, dq.scale), "scale", float)?;
    expect_type(info(graph, dq.multiply), "multiply", float)?;
    if let Some(shift) = &dq.shift {
        expect_type(info(graph, shift.subtract), "subtract", float)?;
        let zp = shift.zero_point;
        match zp.convert {
            Some(cvt) => expect_type(info(graph, cvt), "zero point", float)?,
            None => expect_type(info(graph, zp.constant), "zero point", float)?,
        }
    }
    Ok(())
}

/// Classifies a scale or zero-point shape against the weight dims.
fn classify(shape: &TensorShape, weight: &[usize], grouped: bool) -> Option<Granularity> {
    let dims = shape.static_dims()?;
    if dims.iter().product::<usize>() == 1 && dims.len() <= weight.len() {
        return Some(Granularity::PerTensor);
    }
    if dims.len() != weight.len() || dims[0] != weight[0] {
        return None;
    }
    if dims[1..].iter().all(|&d| d == 1) {
        return Some(Granularity::PerChannel);
    }
    // [N, G, 1] against [N, G, S] with non-empty groups; the group size is
    // fixed by the reshape.
    if grouped && weight[1] > 0 && weight[2] > 0 && dims[1] == weight[1] && dims[2] == 1 {
        return Some(Granularity::Grouped {
            group_size: weight[2] as u32,
        });
    }
    None
}

/// The reshape must turn `[N, ...]` into `[N, K]`; for grouped layouts the
/// `K` columns must split evenly into the `G` groups of the weight.
fn check_reshape(
    reshaped: &TensorInfo,
    weight: &[usize],
    granularity: Granularity,
) -> Result<Granularity, Rejection> {
    let bad = || Rejection::UnsupportedReshape(reshaped.shape.clone());
    let dims = reshaped.shape.static_dims().ok_or_else(bad)?;
    let row_len: usize = weight[1..].iter().product();
    let [rows, k] = dims[..] else {
        return Err(bad());
    };
    if rows != weight[0] {
        return Err(bad());
    }

    match granularity {
        Granularity::Grouped { .. } => {
            let (groups, group_len) = (weight[1], weight[2]);
            if k.checked_rem(groups) != Some(0) {
                return Err(Rejection::GroupSizeMismatch {
                    row_len: k as u32,
                    groups: groups as u32,
                });
            }
            if k / groups != group_len {
                return Err(bad());
            }
            Ok(Granularity::Grouped {
                group_size: (k / groups) as u32,
            })
        }
        Granularity::PerTensor | Granularity::PerChannel if k == row_len => Ok(granularity),
        Granularity::PerTensor | Granularity::PerChannel => Err(bad()),
    }
}

/// Scale and zero-point producers may only feed this chain or fused
/// lookups created from a sibling chain.
fn check_sole_use(graph: &Graph, dq: &Dequant) -> Result<(), Rejection> {
    let private_to = |value: NodeId, reader: NodeId| {
        graph.consumers(Output::of(value)).all(|input| {
            input.node == reader
                || matches!(graph.node(input.node).op, Op::GatherCompressed(_))
        })
    };

    if !private_to(dq.scale, dq.multiply) {
        return Err(Rejection::SharedConstant("scale"));
    }
    if let Some(shift) = &dq.shift {
        let zp = shift.zero_point;
        let shared = match zp.convert {
            Some(cvt) => !private_to(zp.constant, cvt) || !private_to(cvt, shift.subtract),
            None => !private_to(zp.constant, shift.subtract),
        };
        if shared {
            return Err(Rejection::SharedConstant("zero point"));
        }
    }
    Ok(())
}
