//! Results memory layout and conversion of returned values.
//!
//! Before codegen the runtime verifies that every entry point parameter and
//! result can cross the ABI boundary and computes the byte layout of the
//! results block inside the call frame. After the call, a
//! [`ReturnValueConverter`] interprets each result slot back into a host
//! value.

use std::any::Any;
use std::mem::size_of;
use std::sync::Arc;

use molten_dtype::DType;

use crate::async_runtime::{AsyncToken, AsyncTokenHandle, AsyncValue, AsyncValueHandle};
use crate::error::{Error, Result, UnsupportedParameterSnafu, UnsupportedResultSnafu};
use crate::types::{FunctionType, Type};

/// Byte layout of the results block of a call frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsMemoryLayout {
    /// True if any result is an async token or value.
    pub has_async_results: bool,
    /// Total size of the results block in bytes.
    pub size_bytes: usize,
    /// Byte offset of each result inside the block.
    pub offsets: Vec<usize>,
}

/// Verify that the signature is expressible across the ABI boundary and
/// compute the results memory layout.
///
/// Results are tightly packed in declaration order. The supported result
/// types of the canonical set are async tokens, async values of memrefs, and
/// ranked memrefs.
pub fn verify_entrypoint_signature(signature: &FunctionType) -> Result<ResultsMemoryLayout> {
    for (index, ty) in signature.operands().iter().enumerate() {
        if ty.as_argument().is_err() {
            return UnsupportedParameterSnafu { index, ty: ty.to_string() }.fail();
        }
    }

    let mut has_async_results = false;
    let mut size_bytes = 0usize;
    let mut offsets = Vec::with_capacity(signature.num_results());

    let mut allocate = |bytes: usize| {
        offsets.push(size_bytes);
        size_bytes += bytes;
    };

    for (index, ty) in signature.results().iter().enumerate() {
        match ty {
            Type::AsyncToken => {
                allocate(size_of::<*mut ()>());
                has_async_results = true;
            }
            Type::AsyncValue(inner) => {
                if !matches!(inner.as_ref(), Type::Memref { .. }) {
                    return UnsupportedResultSnafu { index, ty: ty.to_string() }.fail();
                }
                allocate(size_of::<*mut ()>());
                has_async_results = true;
            }
            Type::Memref { .. } => match ty.as_result() {
                Ok(abi) => allocate(abi.size_bytes),
                Err(_) => return UnsupportedResultSnafu { index, ty: ty.to_string() }.fail(),
            },
            Type::Ext(ext) => match ext.as_result() {
                Ok(abi) => allocate(abi.size_bytes),
                Err(_) => return UnsupportedResultSnafu { index, ty: ty.to_string() }.fail(),
            },
            _ => return UnsupportedResultSnafu { index, ty: ty.to_string() }.fail(),
        }
    }

    Ok(ResultsMemoryLayout { has_async_results, size_bytes, offsets })
}

// ---------------------------------------------------------------------------
// Returned values.
// ---------------------------------------------------------------------------

/// A host tensor backed by a buffer returned from compiled code.
///
/// The compiled code allocates result memrefs with `malloc`; the returned
/// tensor takes ownership of the allocation and frees it on drop.
#[derive(Debug)]
pub struct ReturnedMemref {
    dtype: DType,
    offset: i64,
    sizes: Vec<i64>,
    strides: Vec<i64>,
    data: *mut (),
    base: *mut (),
}

unsafe impl Send for ReturnedMemref {}
unsafe impl Sync for ReturnedMemref {}

impl ReturnedMemref {
    /// Read a `StridedMemref<T, rank>` descriptor from a result slot.
    ///
    /// # Safety
    ///
    /// `slot` must point to a descriptor of the given rank written by the
    /// compiled function. Takes ownership of the descriptor's allocation.
    pub unsafe fn from_result_slot(dtype: DType, rank: usize, slot: *const u8) -> Self {
        let mut cursor = slot;
        let mut read_ptr = || {
            let value = unsafe { (cursor as *const *mut ()).read_unaligned() };
            cursor = unsafe { cursor.add(size_of::<*mut ()>()) };
            value
        };
        let base = read_ptr();
        let data = read_ptr();

        let mut read_i64 = || {
            let value = unsafe { (cursor as *const i64).read_unaligned() };
            cursor = unsafe { cursor.add(size_of::<i64>()) };
            value
        };
        let offset = read_i64();
        let sizes: Vec<i64> = (0..rank).map(|_| read_i64()).collect();
        let strides: Vec<i64> = (0..rank).map(|_| read_i64()).collect();

        Self { dtype, offset, sizes, strides, data, base }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn num_elements(&self) -> usize {
        self.sizes.iter().product::<i64>().max(0) as usize
    }

    pub fn data(&self) -> *const u8 {
        self.data as *const u8
    }

    /// View the buffer as a slice of elements.
    ///
    /// # Safety
    ///
    /// `T` must match the element type and the buffer must be contiguous.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        debug_assert_eq!(size_of::<T>(), self.dtype.bytes());
        let data = (self.data as *const T).wrapping_offset(self.offset as isize);
        unsafe { std::slice::from_raw_parts(data, self.num_elements()) }
    }
}

impl Drop for ReturnedMemref {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe { libc::free(self.base as *mut libc::c_void) };
        }
    }
}

/// A deferred memref result: resolves to a [`ReturnedMemref`] once the
/// producing async region completes.
#[derive(Debug)]
pub struct AsyncReturnedMemref {
    handle: AsyncValueHandle,
    dtype: DType,
    rank: usize,
}

impl AsyncReturnedMemref {
    pub fn new(handle: AsyncValueHandle, dtype: DType, rank: usize) -> Self {
        Self { handle, dtype, rank }
    }

    /// Block until the value is available and unpack the descriptor.
    ///
    /// Consumes the deferred result: unpacking transfers ownership of the
    /// descriptor's allocation to the returned tensor, so it must happen at
    /// most once.
    pub fn wait(self) -> Result<ReturnedMemref> {
        let storage = self.handle.wait()?;
        Ok(unsafe { ReturnedMemref::from_result_slot(self.dtype, self.rank, storage) })
    }
}

/// One converted entry point result.
pub enum ReturnedValue {
    Memref(ReturnedMemref),
    AsyncToken(AsyncTokenHandle),
    AsyncMemref(AsyncReturnedMemref),
    /// The slot observed a failure; every consumer of the slot sees it.
    Error(Arc<Error>),
    /// Extension results produced by user conversions.
    Ext(Box<dyn Any + Send>),
}

impl std::fmt::Debug for ReturnedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memref(memref) => f.debug_tuple("Memref").field(memref).finish(),
            Self::AsyncToken(token) => f.debug_tuple("AsyncToken").field(token).finish(),
            Self::AsyncMemref(value) => f.debug_tuple("AsyncMemref").field(value).finish(),
            Self::Error(error) => f.debug_tuple("Error").field(error).finish(),
            Self::Ext(_) => f.write_str("Ext(..)"),
        }
    }
}

/// Per-call sink for converted results. Slots are write-once.
#[derive(Debug)]
pub struct ReturnedValues {
    slots: Vec<Option<ReturnedValue>>,
}

impl ReturnedValues {
    pub fn new(num_results: usize) -> Self {
        Self { slots: (0..num_results).map(|_| None).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store a converted value. The first write wins.
    pub fn set(&mut self, index: usize, value: ReturnedValue) {
        let slot = &mut self.slots[index];
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    pub fn get(&self, index: usize) -> Option<&ReturnedValue> {
        self.slots[index].as_ref()
    }

    pub fn take(&mut self, index: usize) -> Option<ReturnedValue> {
        self.slots[index].take()
    }

    /// Install `error` into every slot that has not been claimed yet, so that
    /// downstream consumers of async results observe the failure.
    pub fn emit_errors(&mut self, error: Arc<Error>) {
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(ReturnedValue::Error(error.clone()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Return value conversion.
// ---------------------------------------------------------------------------

/// A single conversion callback: returns true if it handled the value.
pub type ConversionFn =
    Box<dyn Fn(&mut ReturnedValues, usize, &Type, *const u8) -> bool + Send + Sync>;

/// Pluggable unpacking of result slots into host values.
///
/// Conversions are tried in reverse registration order, so the most recently
/// added conversion wins. The built-in fallback records an "unsupported
/// return type" error for the slot and reports failure.
pub struct ReturnValueConverter {
    conversions: Vec<ConversionFn>,
}

impl Default for ReturnValueConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReturnValueConverter {
    pub fn new() -> Self {
        let mut converter = Self { conversions: Vec::new() };
        converter.add_conversion(|values, index, ty, _ptr| {
            values.set(
                index,
                ReturnedValue::Error(Arc::new(Error::UnsupportedResult {
                    index,
                    ty: ty.to_string(),
                })),
            );
            false
        });
        converter
    }

    /// Converter with the canonical memref and async conversions installed.
    pub fn with_default_conversions() -> Self {
        let mut converter = Self::new();
        converter.add_conversion(convert_memref);
        converter.add_conversion(convert_async_token);
        converter.add_conversion(convert_async_memref);
        converter
    }

    pub fn add_conversion(
        &mut self,
        conversion: impl Fn(&mut ReturnedValues, usize, &Type, *const u8) -> bool
        + Send
        + Sync
        + 'static,
    ) {
        self.conversions.push(Box::new(conversion));
    }

    /// Convert the result at `index` from the slot at `ptr`.
    pub fn return_value(
        &self,
        values: &mut ReturnedValues,
        index: usize,
        ty: &Type,
        ptr: *const u8,
    ) -> bool {
        for conversion in self.conversions.iter().rev() {
            if conversion(values, index, ty, ptr) {
                return true;
            }
        }
        false
    }
}

impl std::fmt::Debug for ReturnValueConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReturnValueConverter")
            .field("conversions", &self.conversions.len())
            .finish()
    }
}

/// Canonical conversion: ranked memref result to [`ReturnedMemref`].
pub fn convert_memref(
    values: &mut ReturnedValues,
    index: usize,
    ty: &Type,
    ptr: *const u8,
) -> bool {
    let Type::Memref { dtype, sizes } = ty else {
        return false;
    };
    let memref = unsafe { ReturnedMemref::from_result_slot(*dtype, sizes.len(), ptr) };
    values.set(index, ReturnedValue::Memref(memref));
    true
}

/// Canonical conversion: `!async.token` result to a host token handle.
pub fn convert_async_token(
    values: &mut ReturnedValues,
    index: usize,
    ty: &Type,
    ptr: *const u8,
) -> bool {
    if !matches!(ty, Type::AsyncToken) {
        return false;
    }
    let token = unsafe { (ptr as *const *mut AsyncToken).read_unaligned() };
    if token.is_null() {
        return false;
    }
    let handle = unsafe { AsyncTokenHandle::from_raw(token) };
    values.set(index, ReturnedValue::AsyncToken(handle));
    true
}

/// Canonical conversion: `!async.value<memref<...>>` result to a deferred
/// host tensor.
pub fn convert_async_memref(
    values: &mut ReturnedValues,
    index: usize,
    ty: &Type,
    ptr: *const u8,
) -> bool {
    let Type::AsyncValue(inner) = ty else {
        return false;
    };
    let Type::Memref { dtype, sizes } = inner.as_ref() else {
        return false;
    };
    let value = unsafe { (ptr as *const *mut AsyncValue).read_unaligned() };
    if value.is_null() {
        return false;
    }
    let handle = unsafe { AsyncValueHandle::from_raw(value) };
    values.set(
        index,
        ReturnedValue::AsyncMemref(AsyncReturnedMemref::new(handle, *dtype, sizes.len())),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memref_ty(sizes: Vec<Option<i64>>) -> Type {
        Type::Memref { dtype: DType::Float32, sizes }
    }

    #[test]
    fn test_layout_totality_and_monotonicity() {
        let ptr = size_of::<*mut ()>();
        let signature = FunctionType::new(
            vec![memref_ty(vec![None])],
            vec![
                Type::AsyncToken,
                memref_ty(vec![Some(2), Some(2)]),
                Type::AsyncValue(Box::new(memref_ty(vec![None]))),
            ],
        );

        let layout = verify_entrypoint_signature(&signature).unwrap();
        assert!(layout.has_async_results);
        assert_eq!(layout.offsets, vec![0, ptr, ptr + 2 * ptr + 8 + 32]);
        assert_eq!(layout.size_bytes, ptr + (2 * ptr + 8 + 32) + ptr);
        assert!(layout.offsets.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_layout_empty_results() {
        let signature = FunctionType::new(vec![memref_ty(vec![None])], vec![]);
        let layout = verify_entrypoint_signature(&signature).unwrap();
        assert!(!layout.has_async_results);
        assert_eq!(layout.size_bytes, 0);
        assert!(layout.offsets.is_empty());
    }

    #[test]
    fn test_unsupported_parameter_and_result() {
        let signature = FunctionType::new(vec![Type::AsyncToken], vec![]);
        let err = verify_entrypoint_signature(&signature).unwrap_err();
        assert!(matches!(err, Error::UnsupportedParameter { index: 0, .. }));

        let signature = FunctionType::new(vec![], vec![Type::KernelContext]);
        let err = verify_entrypoint_signature(&signature).unwrap_err();
        assert!(matches!(err, Error::UnsupportedResult { index: 0, .. }));

        // Async value of a non-memref payload is not returnable.
        let signature =
            FunctionType::new(vec![], vec![Type::AsyncValue(Box::new(Type::AsyncToken))]);
        let err = verify_entrypoint_signature(&signature).unwrap_err();
        assert!(matches!(err, Error::UnsupportedResult { index: 0, .. }));
    }

    /// Build a rank-1 strided memref descriptor over a malloc'd buffer.
    fn fake_descriptor(values: &[f32]) -> Vec<u8> {
        let bytes = values.len() * size_of::<f32>();
        let base = unsafe { libc::malloc(bytes) } as *mut f32;
        unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), base, values.len()) };

        let mut descriptor = Vec::new();
        descriptor.extend_from_slice(&(base as usize).to_ne_bytes());
        descriptor.extend_from_slice(&(base as usize).to_ne_bytes());
        descriptor.extend_from_slice(&0i64.to_ne_bytes());
        descriptor.extend_from_slice(&(values.len() as i64).to_ne_bytes());
        descriptor.extend_from_slice(&1i64.to_ne_bytes());
        descriptor
    }

    #[test]
    fn test_convert_memref_takes_ownership() {
        let descriptor = fake_descriptor(&[1.0, 2.0, 3.0, 4.0]);
        let ty = memref_ty(vec![None]);

        let mut values = ReturnedValues::new(1);
        let converter = ReturnValueConverter::with_default_conversions();
        assert!(converter.return_value(&mut values, 0, &ty, descriptor.as_ptr()));

        match values.take(0) {
            Some(ReturnedValue::Memref(memref)) => {
                assert_eq!(memref.sizes(), &[4]);
                assert_eq!(memref.strides(), &[1]);
                assert_eq!(unsafe { memref.as_slice::<f32>() }, &[1.0, 2.0, 3.0, 4.0]);
            }
            other => panic!("expected memref result, got {other:?}"),
        }
    }

    #[test]
    fn test_convert_async_memref_transfers_ownership_once() {
        use crate::async_runtime::{create_value, emplace_value, get_value_storage};

        // A completed async value whose storage holds a rank-1 descriptor.
        let descriptor = fake_descriptor(&[5.0, 6.0]);
        let value = unsafe { create_value(descriptor.len() as i64) };
        unsafe {
            let storage = get_value_storage(value) as *mut u8;
            std::ptr::copy_nonoverlapping(descriptor.as_ptr(), storage, descriptor.len());
            emplace_value(value);
        }

        // The result slot holds a pointer to the runtime async value.
        let slot = (value as usize).to_ne_bytes();
        let ty = Type::AsyncValue(Box::new(memref_ty(vec![None])));

        let mut values = ReturnedValues::new(1);
        let converter = ReturnValueConverter::with_default_conversions();
        assert!(converter.return_value(&mut values, 0, &ty, slot.as_ptr()));

        match values.take(0) {
            Some(ReturnedValue::AsyncMemref(deferred)) => {
                // `wait` consumes the deferred result, so the descriptor's
                // allocation can only ever be claimed once.
                let memref = deferred.wait().unwrap();
                assert_eq!(memref.sizes(), &[2]);
                assert_eq!(unsafe { memref.as_slice::<f32>() }, &[5.0, 6.0]);
            }
            other => panic!("expected async memref result, got {other:?}"),
        }
    }

    #[test]
    fn test_later_registered_conversion_wins() {
        let ty = memref_ty(vec![None]);
        let descriptor = fake_descriptor(&[1.0]);

        let mut converter = ReturnValueConverter::with_default_conversions();
        converter.add_conversion(|values, index, ty, _ptr| {
            if !matches!(ty, Type::Memref { .. }) {
                return false;
            }
            values.set(index, ReturnedValue::Ext(Box::new("intercepted")));
            true
        });

        let mut values = ReturnedValues::new(1);
        assert!(converter.return_value(&mut values, 0, &ty, descriptor.as_ptr()));
        assert!(matches!(values.get(0), Some(ReturnedValue::Ext(_))));

        // The interceptor never unpacked the descriptor; free it by hand.
        let memref = unsafe { ReturnedMemref::from_result_slot(DType::Float32, 1, descriptor.as_ptr()) };
        drop(memref);
    }

    #[test]
    fn test_fallback_records_unsupported_return_type() {
        let converter = ReturnValueConverter::new();
        let mut values = ReturnedValues::new(1);

        let handled =
            converter.return_value(&mut values, 0, &Type::AsyncToken, std::ptr::null());
        assert!(!handled);
        match values.get(0) {
            Some(ReturnedValue::Error(err)) => {
                assert!(err.to_string().contains("!async.token"));
            }
            other => panic!("expected error slot, got {other:?}"),
        }
    }

    #[test]
    fn test_emit_errors_fills_unclaimed_slots() {
        let mut values = ReturnedValues::new(3);
        values.set(1, ReturnedValue::Ext(Box::new(7u32)));

        values.emit_errors(Arc::new(Error::AsyncCompletion));
        assert!(matches!(values.get(0), Some(ReturnedValue::Error(_))));
        assert!(matches!(values.get(1), Some(ReturnedValue::Ext(_))));
        assert!(matches!(values.get(2), Some(ReturnedValue::Error(_))));
    }

    #[test]
    fn test_write_once_slots() {
        let mut values = ReturnedValues::new(1);
        values.set(0, ReturnedValue::Ext(Box::new(1u32)));
        values.set(0, ReturnedValue::Ext(Box::new(2u32)));

        match values.take(0) {
            Some(ReturnedValue::Ext(value)) => {
                assert_eq!(*value.downcast::<u32>().unwrap(), 1);
            }
            other => panic!("expected ext value, got {other:?}"),
        }
    }
}
