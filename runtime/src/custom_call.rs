//! Custom calls: host intrinsics invokable from compiled code.
//!
//! A compiled module declares an intrinsic with the `rt.custom_call`
//! attribute; the bridge (see [`crate::bridge`]) rewrites the declaration
//! into a stub that encodes the positional arguments and calls the uniform
//! dispatch symbol registered with the execution engine. Dispatch looks the
//! callee up in the registry and decodes every argument by type identity.
//! A mismatch fails softly: the compiled code observes a failure indication,
//! the process never aborts.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use molten_dtype::DType;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{CustomCallSnafu, Error, Result};

/// Symbol name of the uniform dispatch function the bridge emits calls to.
pub const DISPATCH_SYMBOL: &str = "__molten_custom_call";

// ---------------------------------------------------------------------------
// Encoded argument layout shared with generated IR.
// ---------------------------------------------------------------------------

/// Type identity tag of an encoded argument. The values are baked into the
/// generated encoding stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ArgTag {
    Opaque = 0,
    I32 = 1,
    I64 = 2,
    F32 = 3,
    F64 = 4,
    Memref = 5,
}

impl ArgTag {
    pub fn from_i64(tag: i64) -> Option<Self> {
        Some(match tag {
            0 => Self::Opaque,
            1 => Self::I32,
            2 => Self::I64,
            3 => Self::F32,
            4 => Self::F64,
            5 => Self::Memref,
            _ => return None,
        })
    }
}

/// One positional argument as laid out by the encoding stub.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EncodedArg {
    pub tag: i64,
    pub value: *mut c_void,
}

/// Header of an encoded memref argument: rank, element type id (pointer
/// sized), and a pointer to the strided memref descriptor of that rank.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EncodedMemref {
    pub rank: i64,
    pub element: *mut c_void,
    pub descriptor: *mut c_void,
}

/// Element type id used inside [`EncodedMemref`]. f32 first: it is by far
/// the most common element type.
pub fn dtype_tag(dtype: DType) -> i64 {
    match dtype {
        DType::Float32 => 1,
        DType::Float64 => 2,
        DType::Bool => 3,
        DType::Int8 => 4,
        DType::Int16 => 5,
        DType::Int32 => 6,
        DType::Int64 => 7,
        DType::UInt8 => 8,
        DType::UInt16 => 9,
        DType::UInt32 => 10,
        DType::UInt64 => 11,
        DType::Float16 => 12,
        DType::BFloat16 => 13,
    }
}

pub fn dtype_from_tag(tag: i64) -> Option<DType> {
    Some(match tag {
        1 => DType::Float32,
        2 => DType::Float64,
        3 => DType::Bool,
        4 => DType::Int8,
        5 => DType::Int16,
        6 => DType::Int32,
        7 => DType::Int64,
        8 => DType::UInt8,
        9 => DType::UInt16,
        10 => DType::UInt32,
        11 => DType::UInt64,
        12 => DType::Float16,
        13 => DType::BFloat16,
        _ => return None,
    })
}

/// Highest memref rank the decoding dispatches on.
pub const MAX_MEMREF_RANK: i64 = 5;

// ---------------------------------------------------------------------------
// Decoded argument views.
// ---------------------------------------------------------------------------

/// Typed decoding of one encoded argument. Decoding must check the type
/// identity tag and return `None` on mismatch.
pub trait CustomCallArg: Sized + 'static {
    fn decode(arg: &EncodedArg) -> Option<Self>;
}

/// An opaque pointer payload.
#[derive(Debug, Clone, Copy)]
pub struct OpaqueView(pub *mut c_void);

impl CustomCallArg for OpaqueView {
    fn decode(arg: &EncodedArg) -> Option<Self> {
        (ArgTag::from_i64(arg.tag)? == ArgTag::Opaque).then_some(Self(arg.value))
    }
}

macro_rules! scalar_arg {
    ($ty:ty, $tag:ident) => {
        impl CustomCallArg for $ty {
            fn decode(arg: &EncodedArg) -> Option<Self> {
                if ArgTag::from_i64(arg.tag)? != ArgTag::$tag || arg.value.is_null() {
                    return None;
                }
                Some(unsafe { (arg.value as *const $ty).read_unaligned() })
            }
        }
    };
}

scalar_arg!(i32, I32);
scalar_arg!(i64, I64);
scalar_arg!(f32, F32);
scalar_arg!(f64, F64);

/// A non-owning view of a memref argument.
#[derive(Debug, Clone)]
pub struct MemrefView {
    pub dtype: DType,
    pub data: *mut c_void,
    pub offset: i64,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
}

/// Decode the strided descriptor of a given rank behind an [`EncodedMemref`].
unsafe fn decode_descriptor(encoded: &EncodedMemref) -> Option<(DType, *mut c_void, i64, Vec<i64>, Vec<i64>)> {
    // Ranks above the dispatch limit are not decodable.
    if encoded.rank < 0 || encoded.rank > MAX_MEMREF_RANK {
        return None;
    }
    let dtype = dtype_from_tag(encoded.element as i64)?;
    let rank = encoded.rank as usize;

    // StridedMemref<T, rank>: base, data, offset, sizes[rank], strides[rank].
    let descriptor = encoded.descriptor as *const u8;
    if descriptor.is_null() {
        return None;
    }
    let data = unsafe { (descriptor.add(size_of::<*mut ()>()) as *const *mut c_void).read_unaligned() };
    let tail = unsafe { descriptor.add(2 * size_of::<*mut ()>()) as *const i64 };
    let offset = unsafe { tail.read_unaligned() };
    let sizes = (0..rank).map(|d| unsafe { tail.add(1 + d).read_unaligned() }).collect();
    let strides = (0..rank).map(|d| unsafe { tail.add(1 + rank + d).read_unaligned() }).collect();

    Some((dtype, data, offset, sizes, strides))
}

impl CustomCallArg for MemrefView {
    fn decode(arg: &EncodedArg) -> Option<Self> {
        if ArgTag::from_i64(arg.tag)? != ArgTag::Memref || arg.value.is_null() {
            return None;
        }
        let encoded = unsafe { (arg.value as *const EncodedMemref).read_unaligned() };
        let (dtype, data, offset, sizes, strides) = unsafe { decode_descriptor(&encoded)? };
        Some(Self { dtype, data, offset, sizes, strides })
    }
}

impl fmt::Display for MemrefView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemrefView: dtype: {} offset: {} sizes: {:?} strides: {:?}",
            self.dtype, self.offset, self.sizes, self.strides
        )
    }
}

/// A memref argument flattened to its total byte size.
#[derive(Debug, Clone)]
pub struct FlatMemrefView {
    pub dtype: DType,
    pub data: *mut c_void,
    pub size_in_bytes: usize,
}

impl CustomCallArg for FlatMemrefView {
    fn decode(arg: &EncodedArg) -> Option<Self> {
        if ArgTag::from_i64(arg.tag)? != ArgTag::Memref || arg.value.is_null() {
            return None;
        }
        let encoded = unsafe { (arg.value as *const EncodedMemref).read_unaligned() };
        let (dtype, data, _offset, sizes, _strides) = unsafe { decode_descriptor(&encoded)? };
        let num_elements = sizes.iter().product::<i64>().max(0) as usize;
        Some(Self { dtype, data, size_in_bytes: dtype.bytes() * num_elements })
    }
}

impl fmt::Display for FlatMemrefView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlatMemrefView: dtype: {} size_in_bytes: {}", self.dtype, self.size_in_bytes)
    }
}

// ---------------------------------------------------------------------------
// Declared attributes.
// ---------------------------------------------------------------------------

/// A scalar or string attribute declared on the intrinsic.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
}

/// Typed extraction of a declared attribute value.
pub trait CustomCallAttr: Sized {
    fn from_attr(value: &AttrValue) -> Option<Self>;
}

impl CustomCallAttr for i32 {
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl CustomCallAttr for i64 {
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::I64(v) => Some(*v),
            _ => None,
        }
    }
}

impl CustomCallAttr for f32 {
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::F32(v) => Some(*v),
            _ => None,
        }
    }
}

impl CustomCallAttr for f64 {
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl CustomCallAttr for String {
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// User data.
// ---------------------------------------------------------------------------

/// Opaque host pointers passed to intrinsic handlers, retrieved by type
/// identity. Injected per call through the execute options; never stored in
/// the executable.
#[derive(Default)]
pub struct UserData<'a> {
    entries: HashMap<TypeId, *mut ()>,
    _lifetime: PhantomData<&'a mut ()>,
}

impl<'a> UserData<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: 'static>(&mut self, value: &'a mut T) {
        self.entries.insert(TypeId::of::<T>(), value as *mut T as *mut ());
    }

    pub fn get<T: 'static>(&self) -> Option<*mut T> {
        self.entries.get(&TypeId::of::<T>()).map(|ptr| *ptr as *mut T)
    }

    fn contains(&self, id: TypeId) -> bool {
        self.entries.contains_key(&id)
    }
}

impl fmt::Debug for UserData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData").field("entries", &self.entries.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Custom call binding and dispatch.
// ---------------------------------------------------------------------------

/// The decoded view of one dispatched call, handed to the handler.
pub struct CustomCallFrame<'call> {
    user_data: Option<&'call UserData<'call>>,
    args: &'call [EncodedArg],
    attrs: &'call [(String, AttrValue)],
}

impl CustomCallFrame<'_> {
    /// User data pointer of type `T`, as injected by the caller of `execute`.
    pub fn user_data<T: 'static>(&self) -> Option<*mut T> {
        self.user_data.and_then(|data| data.get::<T>())
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Decode positional argument `index` as `T`.
    pub fn arg<T: CustomCallArg>(&self, index: usize) -> Option<T> {
        T::decode(self.args.get(index)?)
    }

    /// Declared attribute `name` as `T`.
    pub fn attr<T: CustomCallAttr>(&self, name: &str) -> Option<T> {
        let (_, value) = self.attrs.iter().find(|(key, _)| key == name)?;
        T::from_attr(value)
    }
}

type ArgCheck = Box<dyn Fn(&EncodedArg) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(&CustomCallFrame<'_>) -> bool + Send + Sync>;

/// A host intrinsic bound to a name, with declared user data, positional
/// arguments and attributes.
pub struct CustomCall {
    name: String,
    user_data: Vec<(TypeId, &'static str)>,
    arg_checks: Vec<(ArgCheck, &'static str)>,
    attrs: Vec<(String, fn(&AttrValue) -> bool)>,
    handler: Handler,
}

impl CustomCall {
    /// Start declaring a custom call binding.
    pub fn bind(name: impl Into<String>) -> CustomCallBind {
        CustomCallBind {
            name: name.into(),
            user_data: Vec::new(),
            arg_checks: Vec::new(),
            attrs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch one invocation. Any binding mismatch is a soft failure.
    pub fn invoke(&self, user_data: Option<&UserData<'_>>, attrs: &[(String, AttrValue)], args: &[EncodedArg]) -> bool {
        if args.len() != self.arg_checks.len() {
            tracing::debug!(
                custom_call.name = %self.name,
                custom_call.expected = self.arg_checks.len(),
                custom_call.actual = args.len(),
                "custom call arity mismatch"
            );
            return false;
        }
        for (arg, (check, expected)) in args.iter().zip(&self.arg_checks) {
            if !check(arg) {
                tracing::debug!(
                    custom_call.name = %self.name,
                    custom_call.expected = expected,
                    custom_call.tag = arg.tag,
                    "custom call argument type mismatch"
                );
                return false;
            }
        }
        for (id, type_name) in &self.user_data {
            if !user_data.map(|data| data.contains(*id)).unwrap_or(false) {
                tracing::debug!(
                    custom_call.name = %self.name,
                    custom_call.user_data = type_name,
                    "custom call user data missing"
                );
                return false;
            }
        }
        for (name, check) in &self.attrs {
            let Some((_, value)) = attrs.iter().find(|(key, _)| key == name) else {
                tracing::debug!(
                    custom_call.name = %self.name,
                    custom_call.attr = %name,
                    "custom call attribute missing"
                );
                return false;
            };
            if !check(value) {
                tracing::debug!(
                    custom_call.name = %self.name,
                    custom_call.attr = %name,
                    "custom call attribute type mismatch"
                );
                return false;
            }
        }

        let frame = CustomCallFrame { user_data, args, attrs };
        (self.handler)(&frame)
    }
}

impl fmt::Debug for CustomCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCall")
            .field("name", &self.name)
            .field("num_args", &self.arg_checks.len())
            .finish()
    }
}

/// Builder collecting the declared bindings of a custom call.
pub struct CustomCallBind {
    name: String,
    user_data: Vec<(TypeId, &'static str)>,
    arg_checks: Vec<(ArgCheck, &'static str)>,
    attrs: Vec<(String, fn(&AttrValue) -> bool)>,
}

impl CustomCallBind {
    /// Declare a user data handle the handler requires.
    pub fn user_data<T: 'static>(mut self) -> Self {
        self.user_data.push((TypeId::of::<T>(), std::any::type_name::<T>()));
        self
    }

    /// Declare the next positional argument.
    pub fn arg<T: CustomCallArg>(mut self) -> Self {
        self.arg_checks
            .push((Box::new(|arg| T::decode(arg).is_some()), std::any::type_name::<T>()));
        self
    }

    /// Declare a named attribute.
    pub fn attr<T: CustomCallAttr>(mut self, name: impl Into<String>) -> Self {
        self.attrs.push((name.into(), |value| T::from_attr(value).is_some()));
        self
    }

    /// Finish the binding with the handler function.
    pub fn to(self, handler: impl Fn(&CustomCallFrame<'_>) -> bool + Send + Sync + 'static) -> CustomCall {
        CustomCall {
            name: self.name,
            user_data: self.user_data,
            arg_checks: self.arg_checks,
            attrs: self.attrs,
            handler: Box::new(handler),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry.
// ---------------------------------------------------------------------------

/// Named collection of custom calls consulted during compilation and
/// execution. Built once and injected through the compilation options;
/// read-only afterwards.
#[derive(Debug, Default)]
pub struct CustomCallRegistry {
    calls: HashMap<String, Arc<CustomCall>>,
}

impl CustomCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, call: CustomCall) -> Result<()> {
        let name = call.name.clone();
        if self.calls.contains_key(&name) {
            return CustomCallSnafu { callee: name, reason: "duplicate registration".to_string() }
                .fail();
        }
        self.calls.insert(name, Arc::new(call));
        Ok(())
    }

    pub fn find(&self, callee: &str) -> Option<Arc<CustomCall>> {
        self.calls.get(callee).cloned()
    }

    pub fn contains(&self, callee: &str) -> bool {
        self.calls.contains_key(callee)
    }
}

/// Registration function populating a registry.
pub type RegistrationFn = fn(&mut CustomCallRegistry);

static STATIC_REGISTRATIONS: Lazy<Mutex<Vec<RegistrationFn>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Add a registration function to the static aggregator.
pub fn add_static_custom_call_registration(registration: RegistrationFn) {
    STATIC_REGISTRATIONS.lock().push(registration);
}

/// Populate `registry` with every statically aggregated registration.
pub fn register_static_custom_calls(registry: &mut CustomCallRegistry) {
    for registration in STATIC_REGISTRATIONS.lock().iter() {
        registration(registry);
    }
}

// ---------------------------------------------------------------------------
// Dispatch from compiled code.
// ---------------------------------------------------------------------------

struct ScopeEntry {
    registry: Arc<CustomCallRegistry>,
    // Raw pointers into caller-owned state; valid for the duration of the
    // call the scope guards.
    user_data: Option<*const ()>,
    attrs: *const HashMap<String, Vec<(String, AttrValue)>>,
}

thread_local! {
    static DISPATCH_SCOPE: RefCell<Vec<ScopeEntry>> = const { RefCell::new(Vec::new()) };
}

/// Installs the dispatch state for one `execute` call; popped on drop.
pub struct CustomCallScope {
    _private: (),
}

impl CustomCallScope {
    pub(crate) fn install(
        registry: Arc<CustomCallRegistry>,
        attrs: &HashMap<String, Vec<(String, AttrValue)>>,
        user_data: Option<&UserData<'_>>,
    ) -> Self {
        DISPATCH_SCOPE.with(|scope| {
            scope.borrow_mut().push(ScopeEntry {
                registry,
                user_data: user_data.map(|data| data as *const UserData<'_> as *const ()),
                attrs: attrs as *const _,
            });
        });
        Self { _private: () }
    }
}

impl Drop for CustomCallScope {
    fn drop(&mut self) {
        DISPATCH_SCOPE.with(|scope| {
            scope.borrow_mut().pop();
        });
    }
}

/// The uniform dispatch entry registered with the execution engine under
/// [`DISPATCH_SYMBOL`]. Returns false on any failure.
pub unsafe extern "C" fn custom_call_dispatch(
    callee: *const c_char,
    args: *const EncodedArg,
    num_args: i64,
) -> bool {
    if callee.is_null() {
        return false;
    }
    let Ok(callee) = unsafe { CStr::from_ptr(callee) }.to_str() else {
        return false;
    };
    let args = if args.is_null() || num_args <= 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(args, num_args as usize) }
    };

    // Resolve the callee under the scope borrow, invoke outside of it so
    // that handlers may reenter the runtime.
    let resolved = DISPATCH_SCOPE.with(|scope| {
        let scope = scope.borrow();
        let entry = scope.last()?;
        Some((entry.registry.find(callee), entry.attrs, entry.user_data))
    });
    let Some((call, attrs_ptr, user_data_ptr)) = resolved else {
        tracing::debug!(custom_call.name = %callee, "custom call outside an execution scope");
        return false;
    };
    let Some(call) = call else {
        tracing::debug!(custom_call.name = %callee, "custom call not registered");
        return false;
    };

    static NO_ATTRS: Vec<(String, AttrValue)> = Vec::new();
    let attrs_map = unsafe { &*attrs_ptr };
    let attrs = attrs_map.get(callee).unwrap_or(&NO_ATTRS);
    let user_data = user_data_ptr.map(|ptr| unsafe { &*(ptr as *const UserData<'_>) });

    tracing::trace!(custom_call.name = %callee, custom_call.num_args = args.len(), "dispatching custom call");
    call.invoke(user_data, attrs, args)
}

/// A `custom_call_error` for reporting a failed intrinsic to the caller.
pub fn custom_call_error(callee: &str, reason: &str) -> Error {
    Error::CustomCall { callee: callee.to_string(), reason: reason.to_string() }
}
