//! Run time reflection of the types supported at the compiled function boundary.
//!
//! Run time types decouple the executable from the IR infrastructure: after
//! compilation the runtime only needs to know how each entry point parameter
//! and result is laid out across the C ABI. The closed set of canonical types
//! covers the hot path; user extensions plug in through [`TypeExt`].

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use molten_dtype::DType;

use crate::error::{Error, Result, UnsupportedParameterSnafu, UnsupportedResultSnafu};

/// ABI contract for a type appearing as an entry point parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentAbi {
    /// Number of pointers the argument contributes to the packed args array.
    pub num_slots: usize,
}

/// ABI contract for a type appearing as an entry point result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultAbi {
    /// Number of bytes the result occupies in the results memory block.
    pub size_bytes: usize,
}

/// User extension point for types that are not part of the canonical set.
///
/// An extension type decides whether it can be passed or returned across the
/// ABI boundary and how it prints. Extensions that can be passed must have a
/// matching [`crate::arguments::ArgumentExt`] implementation that packs the
/// declared number of slots.
pub trait TypeExt: fmt::Debug + Send + Sync {
    fn as_argument(&self) -> Result<ArgumentAbi> {
        Err(Error::UnsupportedType { ty: self.print() })
    }

    fn as_result(&self) -> Result<ResultAbi> {
        Err(Error::UnsupportedType { ty: self.print() })
    }

    /// The IR spelling of this type.
    fn print(&self) -> String;
}

/// A dimension of a shaped type: `Some(n)` static, `None` dynamic (`?`).
pub type Dim = Option<i64>;

/// Run time representation of an entry point parameter or result type.
#[derive(Debug, Clone)]
pub enum Type {
    /// `!async.token` completion handle produced by asynchronous regions.
    AsyncToken,
    /// `!async.value<...>` deferred value produced by asynchronous regions.
    AsyncValue(Box<Type>),
    /// `memref<...>` strided buffer.
    Memref { dtype: DType, sizes: Vec<Dim> },
    /// `memref<*x...>` memref of unknown rank.
    UnrankedMemref { dtype: DType },
    /// `tensor<...>` value-typed tensor (pre-bufferization signatures).
    RankedTensor { dtype: DType, sizes: Vec<Dim> },
    /// `tensor<*x...>` tensor of unknown rank.
    UnrankedTensor { dtype: DType },
    /// `!rt.kernel_context` operand injected by the runtime calling convention.
    KernelContext,
    /// User extension type.
    Ext(Arc<dyn TypeExt>),
}

const PTR_BYTES: usize = size_of::<*mut ()>();
const INDEX_BYTES: usize = size_of::<i64>();

impl Type {
    /// ABI for this type as an entry point parameter.
    pub fn as_argument(&self) -> Result<ArgumentAbi> {
        match self {
            // Memrefs are unrolled: two base pointers, offset, sizes, strides.
            Self::Memref { sizes, .. } => Ok(ArgumentAbi { num_slots: 3 + 2 * sizes.len() }),
            // Kernel context is a single opaque pointer.
            Self::KernelContext => Ok(ArgumentAbi { num_slots: 1 }),
            Self::Ext(ext) => ext.as_argument(),
            _ => Err(Error::UnsupportedType { ty: self.to_string() }),
        }
    }

    /// ABI for this type as an entry point result.
    pub fn as_result(&self) -> Result<ResultAbi> {
        match self {
            // Async tokens and values are returned as pointers to the runtime
            // async objects.
            Self::AsyncToken | Self::AsyncValue(_) => Ok(ResultAbi { size_bytes: PTR_BYTES }),
            // Memrefs are returned as StridedMemref<T, rank>:
            //   base, data, offset, sizes[rank], strides[rank]
            Self::Memref { sizes, .. } => Ok(ResultAbi {
                size_bytes: 2 * PTR_BYTES + INDEX_BYTES + 2 * sizes.len() * INDEX_BYTES,
            }),
            Self::Ext(ext) => ext.as_result(),
            _ => Err(Error::UnsupportedType { ty: self.to_string() }),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::AsyncToken | Self::AsyncValue(_))
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::AsyncToken, Self::AsyncToken) => true,
            (Self::AsyncValue(a), Self::AsyncValue(b)) => a == b,
            (
                Self::Memref { dtype: a, sizes: x },
                Self::Memref { dtype: b, sizes: y },
            ) => a == b && x == y,
            (Self::UnrankedMemref { dtype: a }, Self::UnrankedMemref { dtype: b }) => a == b,
            (
                Self::RankedTensor { dtype: a, sizes: x },
                Self::RankedTensor { dtype: b, sizes: y },
            ) => a == b && x == y,
            (Self::UnrankedTensor { dtype: a }, Self::UnrankedTensor { dtype: b }) => a == b,
            (Self::KernelContext, Self::KernelContext) => true,
            (Self::Ext(a), Self::Ext(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn fmt_dims(f: &mut fmt::Formatter<'_>, sizes: &[Dim]) -> fmt::Result {
    for size in sizes {
        match size {
            Some(n) => write!(f, "{n}x")?,
            None => write!(f, "?x")?,
        }
    }
    Ok(())
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsyncToken => write!(f, "!async.token"),
            Self::AsyncValue(inner) => write!(f, "!async.value<{inner}>"),
            Self::Memref { dtype, sizes } => {
                write!(f, "memref<")?;
                fmt_dims(f, sizes)?;
                write!(f, "{dtype}>")
            }
            Self::UnrankedMemref { dtype } => write!(f, "memref<*x{dtype}>"),
            Self::RankedTensor { dtype, sizes } => {
                write!(f, "tensor<")?;
                fmt_dims(f, sizes)?;
                write!(f, "{dtype}>")
            }
            Self::UnrankedTensor { dtype } => write!(f, "tensor<*x{dtype}>"),
            Self::KernelContext => write!(f, "!rt.kernel_context"),
            Self::Ext(ext) => write!(f, "{}", ext.print()),
        }
    }
}

/// Signature of the entry point function in run time types.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionType {
    operands: Vec<Type>,
    results: Vec<Type>,
}

impl FunctionType {
    pub fn new(operands: Vec<Type>, results: Vec<Type>) -> Self {
        Self { operands, results }
    }

    pub fn operands(&self) -> &[Type] {
        &self.operands
    }

    pub fn results(&self) -> &[Type] {
        &self.results
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }
}

/// Conversion from IR types to run time types.
///
/// IR types are dispatched on their printed form, so conversions stay
/// independent of the compiler infrastructure and can be tested directly.
/// Canonical types are tried first; user conversions extend the mapping to
/// custom types.
#[derive(Clone, Default)]
pub struct TypeConverter {
    conversions: Vec<Arc<dyn Fn(&str) -> Option<Type> + Send + Sync>>,
}

impl fmt::Debug for TypeConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeConverter").field("conversions", &self.conversions.len()).finish()
    }
}

enum Shaped {
    Ranked(DType, Vec<Dim>),
    Unranked(DType),
}

/// Parse the body of a `memref<...>` or `tensor<...>` type.
///
/// Only the default layout is supported: a top level `,` means the type
/// carries a layout or memory space annotation and has no canonical run time
/// counterpart.
fn parse_shaped(body: &str) -> Option<Shaped> {
    let mut depth = 0usize;
    for c in body.chars() {
        match c {
            '<' | '(' | '[' | '{' => depth += 1,
            '>' | ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return None,
            _ => {}
        }
    }

    if let Some(element) = body.strip_prefix("*x") {
        return Some(Shaped::Unranked(DType::from_ir_name(element)?));
    }

    let mut parts: Vec<&str> = body.split('x').collect();
    let element = DType::from_ir_name(parts.pop()?)?;
    let mut sizes = Vec::with_capacity(parts.len());
    for part in parts {
        if part == "?" {
            sizes.push(None);
        } else {
            sizes.push(Some(part.parse::<i64>().ok()?));
        }
    }
    Some(Shaped::Ranked(element, sizes))
}

impl TypeConverter {
    /// Extend the conversion with a custom rule. Rules are consulted in
    /// registration order after the canonical types.
    pub fn add_conversion(
        &mut self,
        conversion: impl Fn(&str) -> Option<Type> + Send + Sync + 'static,
    ) {
        self.conversions.push(Arc::new(conversion));
    }

    fn convert_canonical(&self, ir_type: &str) -> Option<Type> {
        if ir_type == "!async.token" {
            return Some(Type::AsyncToken);
        }
        if ir_type == "!rt.kernel_context" {
            return Some(Type::KernelContext);
        }
        if let Some(inner) =
            ir_type.strip_prefix("!async.value<").and_then(|rest| rest.strip_suffix('>'))
        {
            return Some(Type::AsyncValue(Box::new(self.convert(inner).ok()?)));
        }
        if let Some(body) =
            ir_type.strip_prefix("memref<").and_then(|rest| rest.strip_suffix('>'))
        {
            return Some(match parse_shaped(body)? {
                Shaped::Ranked(dtype, sizes) => Type::Memref { dtype, sizes },
                Shaped::Unranked(dtype) => Type::UnrankedMemref { dtype },
            });
        }
        if let Some(body) =
            ir_type.strip_prefix("tensor<").and_then(|rest| rest.strip_suffix('>'))
        {
            return Some(match parse_shaped(body)? {
                Shaped::Ranked(dtype, sizes) => Type::RankedTensor { dtype, sizes },
                Shaped::Unranked(dtype) => Type::UnrankedTensor { dtype },
            });
        }
        None
    }

    /// Convert a printed IR type to its run time counterpart.
    pub fn convert(&self, ir_type: &str) -> Result<Type> {
        let ir_type = ir_type.trim();
        if let Some(converted) = self.convert_canonical(ir_type) {
            return Ok(converted);
        }
        for conversion in &self.conversions {
            if let Some(converted) = conversion(ir_type) {
                return Ok(converted);
            }
        }
        Err(Error::UnsupportedType { ty: ir_type.to_string() })
    }

    /// Convert a full entry point signature, reporting the offending position
    /// on failure.
    pub fn convert_function(&self, operands: &[String], results: &[String]) -> Result<FunctionType> {
        let mut converted_operands = Vec::with_capacity(operands.len());
        for (index, ty) in operands.iter().enumerate() {
            match self.convert(ty) {
                Ok(converted) => converted_operands.push(converted),
                Err(_) => return UnsupportedParameterSnafu { index, ty: ty.clone() }.fail(),
            }
        }

        let mut converted_results = Vec::with_capacity(results.len());
        for (index, ty) in results.iter().enumerate() {
            match self.convert(ty) {
                Ok(converted) => converted_results.push(converted),
                Err(_) => return UnsupportedResultSnafu { index, ty: ty.clone() }.fail(),
            }
        }

        Ok(FunctionType::new(converted_operands, converted_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_canonical_types() {
        let memref = Type::Memref { dtype: DType::Float32, sizes: vec![None, Some(4)] };
        assert_eq!(memref.to_string(), "memref<?x4xf32>");

        let token = Type::AsyncToken;
        assert_eq!(token.to_string(), "!async.token");

        let value = Type::AsyncValue(Box::new(Type::Memref {
            dtype: DType::Float32,
            sizes: vec![Some(2), Some(2)],
        }));
        assert_eq!(value.to_string(), "!async.value<memref<2x2xf32>>");

        let tensor = Type::UnrankedTensor { dtype: DType::Int32 };
        assert_eq!(tensor.to_string(), "tensor<*xi32>");

        assert_eq!(Type::KernelContext.to_string(), "!rt.kernel_context");
    }

    #[test]
    fn test_argument_abi_slots() {
        let rank2 = Type::Memref { dtype: DType::Float32, sizes: vec![None, None] };
        assert_eq!(rank2.as_argument().unwrap().num_slots, 7);

        let rank0 = Type::Memref { dtype: DType::Float32, sizes: vec![] };
        assert_eq!(rank0.as_argument().unwrap().num_slots, 3);

        assert_eq!(Type::KernelContext.as_argument().unwrap().num_slots, 1);

        assert!(Type::AsyncToken.as_argument().is_err());
        assert!(Type::RankedTensor { dtype: DType::Float32, sizes: vec![] }
            .as_argument()
            .is_err());
    }

    #[test]
    fn test_result_abi_sizes() {
        let ptr = size_of::<*mut ()>();

        assert_eq!(Type::AsyncToken.as_result().unwrap().size_bytes, ptr);

        let rank2 = Type::Memref { dtype: DType::Float32, sizes: vec![Some(2), Some(2)] };
        assert_eq!(rank2.as_result().unwrap().size_bytes, 2 * ptr + 8 + 32);

        assert!(Type::KernelContext.as_result().is_err());
    }

    #[test]
    fn test_convert_canonical() {
        let converter = TypeConverter::default();

        assert_eq!(
            converter.convert("memref<?x4xf32>").unwrap(),
            Type::Memref { dtype: DType::Float32, sizes: vec![None, Some(4)] }
        );
        assert_eq!(
            converter.convert("tensor<2xi32>").unwrap(),
            Type::RankedTensor { dtype: DType::Int32, sizes: vec![Some(2)] }
        );
        assert_eq!(
            converter.convert("memref<f64>").unwrap(),
            Type::Memref { dtype: DType::Float64, sizes: vec![] }
        );
        assert_eq!(
            converter.convert("memref<*xf32>").unwrap(),
            Type::UnrankedMemref { dtype: DType::Float32 }
        );
        assert_eq!(
            converter.convert("!async.value<memref<4xf32>>").unwrap(),
            Type::AsyncValue(Box::new(Type::Memref {
                dtype: DType::Float32,
                sizes: vec![Some(4)]
            }))
        );
    }

    #[test]
    fn test_convert_rejects_layouts_and_unknown() {
        let converter = TypeConverter::default();

        // Non-default layouts have no run time counterpart.
        assert!(converter.convert("memref<4x4xf32, strided<[8, 1]>>").is_err());
        assert!(converter.convert("memref<4xf32, 2>").is_err());
        assert!(converter.convert("!testlib.custom_arg").is_err());
        assert!(converter.convert("vector<4xf32>").is_err());
    }

    #[test]
    fn test_user_conversion_extends_mapping() {
        #[derive(Debug)]
        struct CustomTy;
        impl TypeExt for CustomTy {
            fn as_argument(&self) -> Result<ArgumentAbi> {
                Ok(ArgumentAbi { num_slots: 1 })
            }
            fn print(&self) -> String {
                "!testlib.custom_arg".to_string()
            }
        }

        let custom: Arc<dyn TypeExt> = Arc::new(CustomTy);
        let mut converter = TypeConverter::default();
        let registered = custom.clone();
        converter.add_conversion(move |ty| {
            (ty == "!testlib.custom_arg").then(|| Type::Ext(registered.clone()))
        });

        let converted = converter.convert("!testlib.custom_arg").unwrap();
        assert_eq!(converted.as_argument().unwrap().num_slots, 1);
        assert_eq!(converted.to_string(), "!testlib.custom_arg");
    }

    #[test]
    fn test_convert_function_reports_position() {
        let converter = TypeConverter::default();
        let err = converter
            .convert_function(
                &["memref<?xf32>".to_string(), "!weird.type".to_string()],
                &[],
            )
            .unwrap_err();
        assert!(err.to_string().contains("input #1"));

        let err = converter
            .convert_function(&[], &["!weird.type".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("result #0"));
    }
}
