//! Element data types supported at the molten ABI boundary.
//!
//! Every value that crosses between host code and a compiled kernel (memref
//! elements, scalar attributes, custom-call views) carries one of these tags.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DType {
    Bool,

    Int8,
    Int16,
    Int32,
    Int64,

    UInt8,
    UInt16,
    UInt32,
    UInt64,

    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 4,
            Self::Int64 => 8,
            Self::UInt8 => 1,
            Self::UInt16 => 2,
            Self::UInt32 => 4,
            Self::UInt64 => 8,
            Self::Float16 => 2,
            Self::BFloat16 => 2,
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    /// The IR spelling of this element type (`i1`, `ui32`, `f32`, ...).
    ///
    /// Signless IR integers map to the signed variants; the unsigned variants
    /// use the explicit `ui` spelling.
    pub const fn ir_name(&self) -> &'static str {
        match self {
            Self::Bool => "i1",
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::UInt8 => "ui8",
            Self::UInt16 => "ui16",
            Self::UInt32 => "ui32",
            Self::UInt64 => "ui64",
            Self::Float16 => "f16",
            Self::BFloat16 => "bf16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
        }
    }

    /// Parse the IR spelling of an element type.
    pub fn from_ir_name(name: &str) -> Option<Self> {
        Some(match name {
            "i1" => Self::Bool,
            "i8" => Self::Int8,
            "i16" => Self::Int16,
            "i32" => Self::Int32,
            "i64" => Self::Int64,
            "ui8" => Self::UInt8,
            "ui16" => Self::UInt16,
            "ui32" => Self::UInt32,
            "ui64" => Self::UInt64,
            "f16" => Self::Float16,
            "bf16" => Self::BFloat16,
            "f32" => Self::Float32,
            "f64" => Self::Float64,
            _ => return None,
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ir_name())
    }
}

#[cfg(test)]
mod tests {
    use strum::VariantArray;

    use super::*;

    #[test]
    fn test_ir_name_round_trip() {
        for dtype in DType::VARIANTS {
            assert_eq!(DType::from_ir_name(dtype.ir_name()), Some(*dtype));
        }
    }

    #[test]
    fn test_bytes_match_width() {
        assert_eq!(DType::Bool.bytes(), 1);
        assert_eq!(DType::Int32.bytes(), 4);
        assert_eq!(DType::UInt64.bytes(), 8);
        assert_eq!(DType::Float32.bytes(), 4);
        assert_eq!(DType::BFloat16.bytes(), 2);
    }

    #[test]
    fn test_predicates_partition() {
        for dtype in DType::VARIANTS {
            let classes =
                [dtype.is_bool(), dtype.is_signed(), dtype.is_unsigned(), dtype.is_float()];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{dtype}");
        }
    }
}
