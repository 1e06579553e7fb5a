//! Run time arguments for compiled kernels.
//!
//! The compiled function receives a flat `void**` array; every argument
//! contributes a fixed number of pointers determined by its type (see
//! [`crate::types::Type::as_argument`]). Packing writes pointers to storage
//! owned by the argument itself, so arguments must stay alive for the whole
//! call — the executable holds them by reference, which guarantees this.

use std::fmt;
use std::sync::Arc;

use molten_dtype::DType;
use smallvec::SmallVec;

use crate::error::{
    ArgumentMismatchSnafu, DTypeMismatchSnafu, RankMismatchSnafu, Result, ShapeMismatchSnafu,
};
use crate::types::{Dim, Type};

/// User extension point for argument kinds outside the canonical set.
///
/// The implementation contract mirrors the canonical arguments: `verify` must
/// accept exactly the types whose `as_argument` ABI it satisfies, and `pack`
/// must write that many pointers and return the advanced offset.
pub trait ArgumentExt: fmt::Debug + Send + Sync {
    fn verify(&self, index: usize, ty: &Type) -> Result<()>;

    fn pack(&self, args: &mut [*mut ()], offset: usize) -> usize;

    fn print(&self) -> String;
}

/// A single run time argument.
#[derive(Debug, Clone)]
pub enum Argument {
    /// An opaque pointer (`!llvm.ptr` parameters, custom argument payloads).
    OpaquePtr(OpaqueArg),
    /// A strided buffer descriptor for `memref` parameters.
    Memref(MemrefDesc),
    /// User extension.
    Ext(Arc<dyn ArgumentExt>),
}

impl Argument {
    /// Verify that the argument matches the expected parameter type.
    pub fn verify(&self, index: usize, ty: &Type) -> Result<()> {
        match self {
            Self::OpaquePtr(arg) => arg.verify(index, ty),
            Self::Memref(desc) => desc.verify(index, ty),
            Self::Ext(ext) => ext.verify(index, ty),
        }
    }

    /// Pack the argument into `args` starting at `offset`; returns the offset
    /// for the next argument.
    pub fn pack(&self, args: &mut [*mut ()], offset: usize) -> usize {
        match self {
            Self::OpaquePtr(arg) => arg.pack(args, offset),
            Self::Memref(desc) => desc.pack(args, offset),
            Self::Ext(ext) => ext.pack(args, offset),
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpaquePtr(arg) => write!(f, "{arg}"),
            Self::Memref(desc) => write!(f, "{desc}"),
            Self::Ext(ext) => write!(f, "{}", ext.print()),
        }
    }
}

impl From<OpaqueArg> for Argument {
    fn from(arg: OpaqueArg) -> Self {
        Self::OpaquePtr(arg)
    }
}

impl From<MemrefDesc> for Argument {
    fn from(desc: MemrefDesc) -> Self {
        Self::Memref(desc)
    }
}

/// An opaque pointer argument. One ABI slot holding a pointer to the stored
/// pointer value.
#[derive(Debug, Clone)]
pub struct OpaqueArg {
    ptr: *mut (),
}

// SAFETY: the argument only stores the pointer; what it points to is managed
// by the caller, who is responsible for cross-thread use of the payload.
unsafe impl Send for OpaqueArg {}
unsafe impl Sync for OpaqueArg {}

impl OpaqueArg {
    pub fn new(ptr: *mut ()) -> Self {
        Self { ptr }
    }

    pub fn ptr(&self) -> *mut () {
        self.ptr
    }

    fn verify(&self, index: usize, ty: &Type) -> Result<()> {
        let ok = match ty {
            Type::KernelContext => true,
            // Any extension type that is passed as a single opaque pointer.
            Type::Ext(ext) => ext.as_argument().map(|abi| abi.num_slots == 1).unwrap_or(false),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            ArgumentMismatchSnafu {
                index,
                expected: ty.to_string(),
                actual: "opaque pointer".to_string(),
            }
            .fail()
        }
    }

    fn pack(&self, args: &mut [*mut ()], offset: usize) -> usize {
        // The ABI expects a pointer to the argument value, not the value.
        args[offset] = (&raw const self.ptr) as *mut ();
        offset + 1
    }
}

impl fmt::Display for OpaqueArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueArg: {:p}", self.ptr)
    }
}

/// A strided memref descriptor: base data pointer, element offset, and one
/// size and stride per dimension.
#[derive(Debug, Clone)]
pub struct MemrefDesc {
    rank: usize,
    dtype: DType,
    data: *mut (),
    offset: i64,
    // Sizes and strides share one container to keep higher ranks to a single
    // allocation.
    sizes_and_strides: SmallVec<[i64; 8]>,
}

// SAFETY: same rationale as OpaqueArg; the descriptor does not own the buffer.
unsafe impl Send for MemrefDesc {}
unsafe impl Sync for MemrefDesc {}

impl MemrefDesc {
    pub fn new(dtype: DType, data: *mut (), offset: i64, sizes: &[i64], strides: &[i64]) -> Self {
        assert_eq!(sizes.len(), strides.len(), "invalid sizes and strides pair");
        let mut sizes_and_strides = SmallVec::with_capacity(2 * sizes.len());
        sizes_and_strides.extend_from_slice(sizes);
        sizes_and_strides.extend_from_slice(strides);
        Self { rank: sizes.len(), dtype, data, offset, sizes_and_strides }
    }

    /// Contiguous row major memref over `data` with the given shape.
    pub fn contiguous(dtype: DType, data: *mut (), sizes: &[i64]) -> Self {
        let mut strides: SmallVec<[i64; 4]> = SmallVec::with_capacity(sizes.len());
        let mut stride = 1i64;
        for size in sizes.iter().rev() {
            strides.push(stride);
            stride *= *size;
        }
        strides.reverse();
        Self::new(dtype, data, 0, sizes, &strides)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> *mut () {
        self.data
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes_and_strides[..self.rank]
    }

    pub fn strides(&self) -> &[i64] {
        &self.sizes_and_strides[self.rank..]
    }

    pub fn size(&self, dim: usize) -> i64 {
        self.sizes_and_strides[dim]
    }

    pub fn stride(&self, dim: usize) -> i64 {
        self.sizes_and_strides[self.rank + dim]
    }

    /// Check the operand against a shaped parameter type: rank must match and
    /// every static dimension must agree (dynamic dimensions accept any size).
    fn verify_shaped(&self, index: usize, dtype: DType, sizes: &[Dim]) -> Result<()> {
        if self.dtype != dtype {
            return DTypeMismatchSnafu { index, actual: self.dtype, expected: dtype }.fail();
        }
        if self.rank != sizes.len() {
            return RankMismatchSnafu { index, actual: self.rank, expected: sizes.len() }.fail();
        }
        for (dim, (actual, expected)) in self.sizes().iter().zip(sizes).enumerate() {
            if let Some(expected) = expected
                && actual != expected
            {
                return ShapeMismatchSnafu { index, dim, actual: *actual, expected: *expected }
                    .fail();
            }
        }
        Ok(())
    }

    fn verify(&self, index: usize, ty: &Type) -> Result<()> {
        match ty {
            Type::Memref { dtype, sizes } => self.verify_shaped(index, *dtype, sizes),
            // Tensors verify like memrefs: pre-bufferization signatures carry
            // tensor types for buffer operands.
            Type::RankedTensor { dtype, sizes } => self.verify_shaped(index, *dtype, sizes),
            Type::UnrankedMemref { dtype } | Type::UnrankedTensor { dtype } => {
                if self.dtype == *dtype {
                    Ok(())
                } else {
                    DTypeMismatchSnafu { index, actual: self.dtype, expected: *dtype }.fail()
                }
            }
            _ => ArgumentMismatchSnafu {
                index,
                expected: ty.to_string(),
                actual: format!("memref<{}>", self.dtype),
            }
            .fail(),
        }
    }

    fn pack(&self, args: &mut [*mut ()], offset: usize) -> usize {
        // Memref layout: base, data, offset, sizes[rank], strides[rank]. The
        // lowered convention carries both an allocation and an aligned
        // pointer, hence the data pointer twice.
        let mut slot = offset;
        let mut push = |ptr: *mut ()| {
            args[slot] = ptr;
            slot += 1;
        };

        push((&raw const self.data) as *mut ());
        push((&raw const self.data) as *mut ());
        push((&raw const self.offset) as *mut ());
        for value in &self.sizes_and_strides {
            push((value as *const i64) as *mut ());
        }
        slot
    }
}

impl fmt::Display for MemrefDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemrefDesc: dtype: {} offset: {} sizes: {:?} strides: {:?}",
            self.dtype,
            self.offset,
            self.sizes(),
            self.strides()
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;

    use super::*;

    fn f32_memref_type(sizes: Vec<Dim>) -> Type {
        Type::Memref { dtype: DType::Float32, sizes }
    }

    #[test]
    fn test_memref_pack_layout() {
        let mut data = [1.0f32, 2.0, 3.0, 4.0];
        let desc =
            MemrefDesc::new(DType::Float32, data.as_mut_ptr() as *mut (), 0, &[2, 2], &[2, 1]);

        let mut args = vec![std::ptr::null_mut(); 7];
        let next = desc.pack(&mut args, 0);
        assert_eq!(next, 7);

        // Two copies of the data pointer, then offset, sizes, strides.
        unsafe {
            assert_eq!(*(args[0] as *const *mut ()), data.as_mut_ptr() as *mut ());
            assert_eq!(args[0], args[1]);
            assert_eq!(*(args[2] as *const i64), 0);
            assert_eq!(*(args[3] as *const i64), 2);
            assert_eq!(*(args[4] as *const i64), 2);
            assert_eq!(*(args[5] as *const i64), 2);
            assert_eq!(*(args[6] as *const i64), 1);
        }
    }

    #[test]
    fn test_pack_at_offset_conserves_slots() {
        let mut data = [0.0f32; 4];
        let desc = MemrefDesc::contiguous(DType::Float32, data.as_mut_ptr() as *mut (), &[4]);
        let ty = f32_memref_type(vec![None]);
        let slots = ty.as_argument().unwrap().num_slots;

        let mut args = vec![std::ptr::null_mut(); 3 + slots];
        let next = desc.pack(&mut args, 3);
        assert_eq!(next, 3 + slots);
        assert!(args[..3].iter().all(|p| p.is_null()));
    }

    #[test]
    fn test_contiguous_strides() {
        let desc = MemrefDesc::contiguous(DType::Float32, std::ptr::null_mut(), &[2, 3, 4]);
        assert_eq!(desc.strides(), &[12, 4, 1]);
        assert_eq!(desc.sizes(), &[2, 3, 4]);
    }

    #[test]
    fn test_verify_accepts_matching_and_dynamic() {
        let desc = MemrefDesc::contiguous(DType::Float32, std::ptr::null_mut(), &[10, 11]);
        let arg = Argument::from(desc);

        arg.verify(0, &f32_memref_type(vec![Some(10), Some(11)])).unwrap();
        arg.verify(0, &f32_memref_type(vec![None, None])).unwrap();
        arg.verify(0, &f32_memref_type(vec![None, Some(11)])).unwrap();
        arg.verify(
            0,
            &Type::RankedTensor { dtype: DType::Float32, sizes: vec![None, None] },
        )
        .unwrap();
    }

    #[test]
    fn test_verify_rejects_rank_shape_dtype() {
        let desc = MemrefDesc::contiguous(DType::Float32, std::ptr::null_mut(), &[10, 11]);
        let arg = Argument::from(desc);

        let err = arg.verify(1, &f32_memref_type(vec![None])).unwrap_err();
        assert!(matches!(err, Error::RankMismatch { index: 1, actual: 2, expected: 1 }));

        let err = arg.verify(2, &f32_memref_type(vec![Some(10), Some(12)])).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch { index: 2, dim: 1, actual: 11, expected: 12 }
        ));

        let err = arg
            .verify(3, &Type::Memref { dtype: DType::Int32, sizes: vec![None, None] })
            .unwrap_err();
        assert!(matches!(err, Error::DTypeMismatch { index: 3, .. }));
    }

    #[test]
    fn test_opaque_pack_and_verify() {
        let mut payload = 42u64;
        let arg = OpaqueArg::new((&raw mut payload) as *mut ());

        let mut args = vec![std::ptr::null_mut(); 1];
        assert_eq!(arg.pack(&mut args, 0), 1);
        unsafe {
            assert_eq!(*(args[0] as *const *mut ()), (&raw mut payload) as *mut ());
        }

        arg.verify(0, &Type::KernelContext).unwrap();
        assert!(arg.verify(0, &f32_memref_type(vec![None])).is_err());
    }
}
