//! Shared helpers: a reference evaluator and lookup-graph builders.

use std::collections::{BTreeMap, HashMap};

use half::{bf16, f16};
use ndarray::{ArrayD, Axis, IxDyn};
use qgather_ir::{ConstantData, Graph, NodeId, Op, Output, Scalar, ScalarKind, TensorInfo};

/// Rounds `x` to the precision of `scalar`.
#[allow(dead_code)]
pub fn round_to(scalar: Scalar, x: f32) -> f32 {
    match (scalar.kind, scalar.bits) {
        (ScalarKind::Float, 16) => f16::from_f32(x).to_f32(),
        (ScalarKind::BFloat, 16) => bf16::from_f32(x).to_f32(),
        _ if scalar.is_integer() => x.trunc(),
        _ => x,
    }
}

fn dims(info: &TensorInfo) -> Vec<usize> {
    info.shape.static_dims().expect("reference evaluation needs static shapes")
}

/// Evaluates every `Result` of `graph`, keyed by result name.
///
/// All tensors are carried as `f32` and rounded to each node's element type
/// after every operation. `inputs` maps parameter names to values.
#[allow(dead_code)]
pub fn evaluate(
    graph: &Graph,
    inputs: &HashMap<&str, ArrayD<f32>>,
) -> BTreeMap<String, ArrayD<f32>> {
    let mut values: HashMap<NodeId, ArrayD<f32>> = HashMap::new();
    let mut results = BTreeMap::new();

    for id in graph.topological_order().expect("graph has a cycle") {
        let node = graph.node(id);
        let arg = |i: usize| &values[&node.inputs()[i].node];
        let info = node.output_info(0);
        let round = |x: f32| round_to(info.map_or(Scalar::F32, |i| i.scalar), x);

        let value = match &node.op {
            Op::Parameter => inputs
                .get(node.name.as_str())
                .unwrap_or_else(|| panic!("missing input '{}'", node.name))
                .clone(),
            Op::Constant(_) => {
                let data = graph.constant_f32(Output::of(id)).unwrap();
                ArrayD::from_shape_vec(IxDyn(&dims(info.unwrap())), data).unwrap()
            }
            Op::Convert => arg(0).mapv(round),
            Op::Subtract => (arg(0) - arg(1)).mapv(round),
            Op::Multiply => (arg(0) * arg(1)).mapv(round),
            Op::Reshape { .. } => arg(0)
                .as_standard_layout()
                .to_owned()
                .into_shape_with_order(IxDyn(&dims(info.unwrap())))
                .unwrap(),
            Op::Gather { .. } => gather(arg(0), arg(1), arg(2), info.unwrap()),
            Op::GatherCompressed(_) => {
                let scale_type = graph.output_info(node.inputs()[3]).unwrap().scalar;
                gather_compressed(
                    arg(0),
                    arg(1),
                    arg(3),
                    node.input(4).map(|zp| &values[&zp.node]),
                    scale_type,
                    info.unwrap(),
                )
            }
            Op::Result => {
                results.insert(node.name.clone(), arg(0).clone());
                continue;
            }
            Op::Custom { op_type } => panic!("no reference for {op_type}"),
        };
        values.insert(id, value);
    }

    results
}

fn gather(
    data: &ArrayD<f32>,
    indices: &ArrayD<f32>,
    axis: &ArrayD<f32>,
    out: &TensorInfo,
) -> ArrayD<f32> {
    let axis = axis.iter().next().copied().unwrap() as i64;
    let axis = if axis < 0 { axis + data.ndim() as i64 } else { axis } as usize;
    let idx: Vec<usize> = indices.iter().map(|&i| i as usize).collect();
    data.select(Axis(axis), &idx)
        .into_shape_with_order(IxDyn(&dims(out)))
        .unwrap()
}

/// Reference lookup on a compressed table: for each index, the weight row
/// is shifted by the matching zero-point row and multiplied by the matching
/// scale row, computing in the scale's element type.
fn gather_compressed(
    weight: &ArrayD<f32>,
    indices: &ArrayD<f32>,
    scale: &ArrayD<f32>,
    zero_point: Option<&ArrayD<f32>>,
    compute: Scalar,
    out: &TensorInfo,
) -> ArrayD<f32> {
    let row_of = |param: &ArrayD<f32>, i: usize| {
        if param.len() > 1 && param.ndim() == weight.ndim() && param.shape()[0] == weight.shape()[0]
        {
            param.index_axis(Axis(0), i).to_owned()
        } else {
            param.clone()
        }
    };

    let mut values = Vec::new();
    for &i in indices {
        let i = i as usize;
        let mut row = weight.index_axis(Axis(0), i).mapv(|v| round_to(compute, v));
        if let Some(zp) = zero_point {
            let zp = row_of(zp, i).mapv(|v| round_to(compute, v));
            row = (&row - &zp).mapv(|v| round_to(compute, v));
        }
        row = (&row * &row_of(scale, i)).mapv(|v| round_to(compute, v));
        values.extend(row.iter().map(|&v| round_to(out.scalar, v)));
    }
    ArrayD::from_shape_vec(IxDyn(&dims(out)), values).unwrap()
}

/// Number of live nodes whose operation has the given type name.
#[allow(dead_code)]
pub fn count_ops(graph: &Graph, type_name: &str) -> usize {
    graph
        .iter()
        .filter(|(_, node)| node.op.type_name() == type_name)
        .count()
}

/// Zero-point constant of an asymmetric table.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct ZeroPointSpec {
    pub dims: Vec<u32>,
    pub values: Vec<i64>,
    /// Store in the weight type and `Convert`, instead of storing as float.
    pub converted: bool,
}

/// Description of a compressed embedding table and its decompression chain.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct TableSpec {
    pub weight_type: Scalar,
    pub dims: Vec<u32>,
    pub weights: Vec<i64>,
    /// Decompression element type.
    pub float: Scalar,
    /// Scale shape and values; `None` for a bare `Convert`.
    pub scale: Option<(Vec<u32>, Vec<f32>)>,
    pub zero_point: Option<ZeroPointSpec>,
    /// Flatten groups into rows before the lookup.
    pub reshape: Option<Vec<u32>>,
    /// Trailing float conversion before the lookup.
    pub output: Option<Scalar>,
}

impl TableSpec {
    /// A per-row scaled table with no zero point.
    #[allow(dead_code)]
    pub fn per_row(weight_type: Scalar, rows: u32, cols: u32) -> Self {
        let weights = (0..rows * cols)
            .map(|i| sample(weight_type, i as i64 * 7 + 3))
            .collect();
        let scale = (0..rows).map(|r| 0.01 * (r % 13 + 1) as f32).collect();
        Self {
            weight_type,
            dims: vec![rows, cols],
            weights,
            float: Scalar::F32,
            scale: Some((vec![rows, 1], scale)),
            zero_point: None,
            reshape: None,
            output: None,
        }
    }

    /// The shape the gather reads.
    pub fn data_dims(&self) -> Vec<u32> {
        self.reshape.clone().unwrap_or_else(|| self.dims.clone())
    }
}

/// Maps an arbitrary integer into the value range of `scalar`.
#[allow(dead_code)]
pub fn sample(scalar: Scalar, seed: i64) -> i64 {
    match (scalar.kind, scalar.bits) {
        (ScalarKind::Uint, 4) => seed.rem_euclid(16),
        (ScalarKind::Sint, 4) => seed.rem_euclid(16) - 8,
        (ScalarKind::Uint, 8) => seed.rem_euclid(256),
        (ScalarKind::Sint, 8) => seed.rem_euclid(256) - 128,
        _ => seed,
    }
}

fn encode_integers(scalar: Scalar, values: &[i64]) -> ConstantData {
    match (scalar.kind, scalar.bits) {
        (ScalarKind::Uint, 4) => {
            ConstantData::pack_u4(&values.iter().map(|&v| v as u8).collect::<Vec<_>>())
        }
        (ScalarKind::Sint, 4) => {
            ConstantData::pack_i4(&values.iter().map(|&v| v as i8).collect::<Vec<_>>())
        }
        (ScalarKind::Uint, 8) => {
            ConstantData::from_u8(&values.iter().map(|&v| v as u8).collect::<Vec<_>>())
        }
        (ScalarKind::Sint, 8) => {
            ConstantData::from_i8(&values.iter().map(|&v| v as i8).collect::<Vec<_>>())
        }
        (ScalarKind::Sint, 64) => ConstantData::from_i64(values),
        _ => {
            let floats: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            ConstantData::from_floats(scalar, &floats).expect("unsupported constant type")
        }
    }
}

/// Handles into a graph built by [`lookup_graph`].
#[allow(dead_code)]
pub struct Lookup {
    pub graph: Graph,
    pub weight: NodeId,
    pub scale: Option<NodeId>,
    pub multiply: Option<NodeId>,
    pub subtract: Option<NodeId>,
    pub chain_top: NodeId,
    pub gather: NodeId,
    pub result: NodeId,
}

/// Builds `Result(Gather(chain(table), Parameter "indices", axis))`.
#[allow(dead_code)]
pub fn lookup_graph(table: &TableSpec, indices_dims: &[u32], axis: i64) -> Lookup {
    let mut graph = Graph::new();
    let float_info = |dims: &[u32]| TensorInfo::fixed(table.float, dims);

    let weight = graph
        .add_constant(
            "weight",
            TensorInfo::fixed(table.weight_type, &table.dims),
            encode_integers(table.weight_type, &table.weights),
        )
        .unwrap();
    let convert = graph
        .add_node(
            Op::Convert,
            vec![Output::of(weight)],
            vec![float_info(&table.dims)],
            "weight/convert",
        )
        .unwrap();
    let mut top = convert;

    let mut subtract = None;
    if let Some(zp) = &table.zero_point {
        let zp_node = if zp.converted {
            let raw = graph
                .add_constant(
                    "zero_point",
                    TensorInfo::fixed(table.weight_type, &zp.dims),
                    encode_integers(table.weight_type, &zp.values),
                )
                .unwrap();
            graph
                .add_node(
                    Op::Convert,
                    vec![Output::of(raw)],
                    vec![float_info(&zp.dims)],
                    "zero_point/convert",
                )
                .unwrap()
        } else {
            graph
                .add_constant(
                    "zero_point",
                    float_info(&zp.dims),
                    encode_integers(table.float, &zp.values),
                )
                .unwrap()
        };
        let sub = graph
            .add_node(
                Op::Subtract,
                vec![Output::of(top), Output::of(zp_node)],
                vec![float_info(&table.dims)],
                "weight/subtract",
            )
            .unwrap();
        subtract = Some(sub);
        top = sub;
    }

    let mut scale = None;
    let mut multiply = None;
    if let Some((dims, values)) = &table.scale {
        let s = graph
            .add_constant(
                "scale",
                float_info(dims),
                ConstantData::from_floats(table.float, values).unwrap(),
            )
            .unwrap();
        let mul = graph
            .add_node(
                Op::Multiply,
                vec![Output::of(top), Output::of(s)],
                vec![float_info(&table.dims)],
                "weight/multiply",
            )
            .unwrap();
        scale = Some(s);
        multiply = Some(mul);
        top = mul;
    }

    if let Some(target) = &table.reshape {
        let shape = graph
            .add_constant(
                "reshape/target",
                TensorInfo::fixed(Scalar::I64, &[target.len() as u32]),
                ConstantData::from_i64(&target.iter().map(|&d| d as i64).collect::<Vec<_>>()),
            )
            .unwrap();
        top = graph
            .add_node(
                Op::Reshape {
                    special_zero: false,
                },
                vec![Output::of(top), Output::of(shape)],
                vec![float_info(target)],
                "weight/reshape",
            )
            .unwrap();
    }

    let mut out_type = table.float;
    if let Some(output) = table.output {
        top = graph
            .add_node(
                Op::Convert,
                vec![Output::of(top)],
                vec![TensorInfo::fixed(output, &table.data_dims())],
                "weight/output_convert",
            )
            .unwrap();
        out_type = output;
    }

    let data_dims = table.data_dims();
    let rank = data_dims.len() as i64;
    let resolved = if axis < 0 { axis + rank } else { axis } as usize;
    let mut out_dims: Vec<u32> = data_dims[..resolved].to_vec();
    out_dims.extend_from_slice(indices_dims);
    out_dims.extend_from_slice(&data_dims[resolved + 1..]);

    let indices = graph.add_parameter("indices", TensorInfo::fixed(Scalar::I64, indices_dims));
    let axis_node = graph
        .add_constant(
            "axis",
            TensorInfo::fixed(Scalar::I64, &[]),
            ConstantData::from_i64(&[axis]),
        )
        .unwrap();
    let gather = graph
        .add_node(
            Op::Gather { batch_dims: 0 },
            vec![Output::of(top), Output::of(indices), Output::of(axis_node)],
            vec![TensorInfo::fixed(out_type, &out_dims)],
            "embedding",
        )
        .unwrap();
    let result = graph.add_result("out", Output::of(gather)).unwrap();

    Lookup {
        graph,
        weight,
        scale,
        multiply,
        subtract,
        chain_top: top,
        gather,
        result,
    }
}

/// `indices` as an evaluator input.
#[allow(dead_code)]
pub fn indices_input(dims: &[u32], values: &[i64]) -> HashMap<&'static str, ArrayD<f32>> {
    let dims: Vec<usize> = dims.iter().map(|&d| d as usize).collect();
    let values = values.iter().map(|&v| v as f32).collect();
    HashMap::from([(
        "indices",
        ArrayD::from_shape_vec(IxDyn(&dims), values).unwrap(),
    )])
}
