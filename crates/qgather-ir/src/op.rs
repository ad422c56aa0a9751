//! Operation kinds and constant payloads.

use half::{bf16, f16};

use crate::types::{Scalar, ScalarKind};

/// Raw little-endian payload of a `Constant` node.
///
/// Element type and shape live on the node's output port; see
/// [`Graph::add_constant`](crate::Graph::add_constant).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantData {
    pub bytes: Vec<u8>,
}

impl ConstantData {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        Self::from_bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_f16(values: &[f32]) -> Self {
        Self::from_bytes(
            values
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                .collect(),
        )
    }

    /// Encodes `values` in the floating-point type `scalar`.
    ///
    /// Returns `None` if `scalar` is not f32, f16 or bf16.
    pub fn from_floats(scalar: Scalar, values: &[f32]) -> Option<Self> {
        match (scalar.kind, scalar.bits) {
            (ScalarKind::Float, 32) => Some(Self::from_f32(values)),
            (ScalarKind::Float, 16) => Some(Self::from_f16(values)),
            (ScalarKind::BFloat, 16) => Some(Self::from_bytes(
                values
                    .iter()
                    .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
                    .collect(),
            )),
            _ => None,
        }
    }

    pub fn from_i64(values: &[i64]) -> Self {
        Self::from_bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_i32(values: &[i32]) -> Self {
        Self::from_bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_u8(values: &[u8]) -> Self {
        Self::from_bytes(values.to_vec())
    }

    pub fn from_i8(values: &[i8]) -> Self {
        Self::from_bytes(values.iter().map(|&v| v as u8).collect())
    }

    /// Packs unsigned 4-bit values, two per byte, low nibble first.
    pub fn pack_u4(values: &[u8]) -> Self {
        Self::from_bytes(
            values
                .chunks(2)
                .map(|pair| (pair[0] & 0x0f) | (pair.get(1).map_or(0, |hi| hi & 0x0f) << 4))
                .collect(),
        )
    }

    /// Packs signed 4-bit values, two per byte, low nibble first.
    pub fn pack_i4(values: &[i8]) -> Self {
        let nibbles: Vec<u8> = values.iter().map(|&v| (v as u8) & 0x0f).collect();
        Self::pack_u4(&nibbles)
    }

    /// Decodes the first `numel` elements as integers.
    ///
    /// Returns `None` for floating-point payloads or a short buffer.
    pub fn values_i64(&self, scalar: Scalar, numel: usize) -> Option<Vec<i64>> {
        if self.bytes.len() < scalar.byte_len(numel) {
            return None;
        }
        let b = &self.bytes;
        let values = match (scalar.kind, scalar.bits) {
            (ScalarKind::Uint, 4) => (0..numel).map(|i| nibble(b, i) as i64).collect(),
            (ScalarKind::Sint, 4) => (0..numel)
                .map(|i| (((nibble(b, i) << 4) as i8) >> 4) as i64)
                .collect(),
            (ScalarKind::Uint | ScalarKind::Bool, 8) => {
                b[..numel].iter().map(|&v| v as i64).collect()
            }
            (ScalarKind::Sint, 8) => b[..numel].iter().map(|&v| v as i8 as i64).collect(),
            (ScalarKind::Sint, 32) => le_chunks::<4>(b, numel)
                .map(|c| i32::from_le_bytes(c) as i64)
                .collect(),
            (ScalarKind::Uint, 32) => le_chunks::<4>(b, numel)
                .map(|c| u32::from_le_bytes(c) as i64)
                .collect(),
            (ScalarKind::Sint, 64) => le_chunks::<8>(b, numel).map(i64::from_le_bytes).collect(),
            _ => return None,
        };
        Some(values)
    }

    /// Decodes the first `numel` elements, widening every type to `f32`.
    pub fn values_f32(&self, scalar: Scalar, numel: usize) -> Option<Vec<f32>> {
        if self.bytes.len() < scalar.byte_len(numel) {
            return None;
        }
        let b = &self.bytes;
        match (scalar.kind, scalar.bits) {
            (ScalarKind::Float, 32) => Some(
                le_chunks::<4>(b, numel)
                    .map(f32::from_le_bytes)
                    .collect(),
            ),
            (ScalarKind::Float, 16) => Some(
                le_chunks::<2>(b, numel)
                    .map(|c| f16::from_le_bytes(c).to_f32())
                    .collect(),
            ),
            (ScalarKind::BFloat, 16) => Some(
                le_chunks::<2>(b, numel)
                    .map(|c| bf16::from_le_bytes(c).to_f32())
                    .collect(),
            ),
            _ => self
                .values_i64(scalar, numel)
                .map(|v| v.into_iter().map(|x| x as f32).collect()),
        }
    }
}

fn nibble(bytes: &[u8], i: usize) -> u8 {
    let byte = bytes[i / 2];
    if i % 2 == 0 { byte & 0x0f } else { byte >> 4 }
}

fn le_chunks<const N: usize>(bytes: &[u8], numel: usize) -> impl Iterator<Item = [u8; N]> + '_ {
    bytes[..numel * N].chunks_exact(N).map(|c| {
        let mut out = [0u8; N];
        out.copy_from_slice(c);
        out
    })
}

/// How finely scale and zero-point vary across a compressed weight table.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Granularity {
    /// One value for the whole table.
    PerTensor,
    /// One value per table row.
    PerChannel,
    /// One value per contiguous block of `group_size` elements of a row.
    Grouped { group_size: u32 },
}

impl Granularity {
    /// Group size for grouped layouts, `None` otherwise.
    pub fn group_size(self) -> Option<u32> {
        match self {
            Self::Grouped { group_size } => Some(group_size),
            Self::PerTensor | Self::PerChannel => None,
        }
    }
}

/// Attributes of the fused [`Op::GatherCompressed`] operation.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct GatherCompressedAttrs {
    pub granularity: Granularity,
    pub batch_dims: i64,
}

/// The operation performed by a graph node.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Graph input.
    Parameter,
    /// Immutable tensor.
    Constant(ConstantData),
    /// Element type conversion to the node's output type.
    Convert,
    /// Broadcasting `a - b`.
    Subtract,
    /// Broadcasting `a * b`.
    Multiply,
    /// Reshape `[data, target_shape]`.
    Reshape { special_zero: bool },
    /// Table lookup `[data, indices, axis]`.
    Gather { batch_dims: i64 },
    /// Lookup on a compressed table `[weight, indices, axis, scale, zero_point?]`.
    GatherCompressed(GatherCompressedAttrs),
    /// Graph output.
    Result,
    /// Any operation this crate does not interpret.
    Custom { op_type: String },
}

impl Op {
    /// Operation identity string, as seen by a runtime.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Parameter => "Parameter",
            Self::Constant(_) => "Constant",
            Self::Convert => "Convert",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Reshape { .. } => "Reshape",
            Self::Gather { .. } => "Gather",
            Self::GatherCompressed(_) => "GatherCompressed",
            Self::Result => "Result",
            Self::Custom { op_type } => op_type,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_u8_and_i8() {
        let u = ConstantData::from_u8(&[0, 200, 255]);
        assert_eq!(u.values_i64(Scalar::U8, 3), Some(vec![0, 200, 255]));
        let i = ConstantData::from_i8(&[-128, -1, 7]);
        assert_eq!(i.values_i64(Scalar::I8, 3), Some(vec![-128, -1, 7]));
    }

    #[test]
    fn decode_packed_nibbles() {
        let u = ConstantData::pack_u4(&[1, 15, 7]);
        assert_eq!(u.bytes, vec![0xf1, 0x07]);
        assert_eq!(u.values_i64(Scalar::U4, 3), Some(vec![1, 15, 7]));

        let i = ConstantData::pack_i4(&[-8, 7, -1, 0]);
        assert_eq!(i.values_i64(Scalar::I4, 4), Some(vec![-8, 7, -1, 0]));
    }

    #[test]
    fn decode_floats() {
        let f = ConstantData::from_f32(&[0.5, -2.0]);
        assert_eq!(f.values_f32(Scalar::F32, 2), Some(vec![0.5, -2.0]));
        let h = ConstantData::from_f16(&[0.25, 3.0]);
        assert_eq!(h.values_f32(Scalar::F16, 2), Some(vec![0.25, 3.0]));
        assert_eq!(f.values_i64(Scalar::F32, 2), None);
    }

    #[test]
    fn encode_floats_by_type() {
        let b = ConstantData::from_floats(Scalar::BF16, &[1.0, -0.5]).unwrap();
        assert_eq!(b.values_f32(Scalar::BF16, 2), Some(vec![1.0, -0.5]));
        let h = ConstantData::from_floats(Scalar::F16, &[1.0]).unwrap();
        assert_eq!(h.bytes.len(), 2);
        assert!(ConstantData::from_floats(Scalar::U8, &[1.0]).is_none());
    }

    #[test]
    fn decode_wide_integers() {
        let d = ConstantData::from_i64(&[-3, 1 << 40]);
        assert_eq!(d.values_i64(Scalar::I64, 2), Some(vec![-3, 1 << 40]));
        let d = ConstantData::from_i32(&[-7]);
        assert_eq!(d.values_i64(Scalar::I32, 1), Some(vec![-7]));
        assert_eq!(d.values_f32(Scalar::I32, 1), Some(vec![-7.0]));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let d = ConstantData::from_u8(&[1, 2]);
        assert_eq!(d.values_i64(Scalar::U8, 3), None);
    }

    #[test]
    fn granularity_group_size() {
        assert_eq!(Granularity::Grouped { group_size: 32 }.group_size(), Some(32));
        assert_eq!(Granularity::PerChannel.group_size(), None);
    }

    #[test]
    fn op_type_names() {
        assert_eq!(Op::Gather { batch_dims: 0 }.type_name(), "Gather");
        let fused = Op::GatherCompressed(GatherCompressedAttrs {
            granularity: Granularity::PerTensor,
            batch_dims: 0,
        });
        assert_eq!(fused.type_name(), "GatherCompressed");
        assert_eq!(
            Op::Custom {
                op_type: "MatMul".into()
            }
            .type_name(),
            "MatMul"
        );
    }
}
