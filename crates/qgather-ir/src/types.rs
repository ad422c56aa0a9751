//! Element types and tensor shapes.

/// Width of a scalar type in bits.
pub type Bits = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
    /// Brain floating point.
    BFloat,
}

/// A scalar element type: kind + bit width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub bits: Bits,
}

impl Scalar {
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        bits: 8,
    };
    pub const I4: Self = Self {
        kind: ScalarKind::Sint,
        bits: 4,
    };
    pub const U4: Self = Self {
        kind: ScalarKind::Uint,
        bits: 4,
    };
    pub const I8: Self = Self {
        kind: ScalarKind::Sint,
        bits: 8,
    };
    pub const U8: Self = Self {
        kind: ScalarKind::Uint,
        bits: 8,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        bits: 32,
    };
    pub const U32: Self = Self {
        kind: ScalarKind::Uint,
        bits: 32,
    };
    pub const I64: Self = Self {
        kind: ScalarKind::Sint,
        bits: 64,
    };
    pub const F16: Self = Self {
        kind: ScalarKind::Float,
        bits: 16,
    };
    pub const BF16: Self = Self {
        kind: ScalarKind::BFloat,
        bits: 16,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        bits: 32,
    };

    /// Returns `true` for signed and unsigned integer types.
    pub fn is_integer(self) -> bool {
        matches!(self.kind, ScalarKind::Sint | ScalarKind::Uint)
    }

    /// Returns `true` for IEEE and brain floating-point types.
    pub fn is_float(self) -> bool {
        matches!(self.kind, ScalarKind::Float | ScalarKind::BFloat)
    }

    /// Number of bytes needed to store `numel` packed elements.
    ///
    /// Sub-byte types pack two elements per byte, low nibble first.
    pub fn byte_len(self, numel: usize) -> usize {
        (numel * self.bits as usize).div_ceil(8)
    }
}

/// A single tensor dimension.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Dimension {
    /// Statically known extent.
    Fixed(u32),
    /// Extent only known at runtime, optionally named (e.g. `"batch"`).
    Dynamic(Option<String>),
}

impl Dimension {
    /// Returns the extent if it is static.
    pub fn fixed(&self) -> Option<u32> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Dynamic(_) => None,
        }
    }

    /// Two dimensions are compatible if either is dynamic or both are equal.
    pub fn is_compatible(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
            _ => true,
        }
    }
}

/// Tensor shape, possibly partially dynamic.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct TensorShape {
    pub dims: Vec<Dimension>,
}

impl TensorShape {
    /// A fully static shape.
    pub fn fixed(dims: &[u32]) -> Self {
        Self {
            dims: dims.iter().map(|&d| Dimension::Fixed(d)).collect(),
        }
    }

    /// The rank-0 shape.
    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns all extents if every dimension is static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|d| d.fixed().map(|n| n as usize))
            .collect()
    }

    /// Total element count for a static shape.
    pub fn numel(&self) -> Option<usize> {
        self.static_dims().map(|dims| dims.iter().product())
    }

    /// Same rank and pairwise-compatible dimensions.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(&other.dims)
                .all(|(a, b)| a.is_compatible(b))
    }
}

impl From<&[u32]> for TensorShape {
    fn from(dims: &[u32]) -> Self {
        Self::fixed(dims)
    }
}

/// Element type and shape of one node output.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct TensorInfo {
    pub scalar: Scalar,
    pub shape: TensorShape,
}

impl TensorInfo {
    pub fn new(scalar: Scalar, shape: TensorShape) -> Self {
        Self { scalar, shape }
    }

    /// Shorthand for a fully static tensor.
    pub fn fixed(scalar: Scalar, dims: &[u32]) -> Self {
        Self::new(scalar, TensorShape::fixed(dims))
    }
}
