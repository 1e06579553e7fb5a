//! Compiled executable: function pointer, signature and call frame handling.
//!
//! An [`Executable`] is immutable after construction and shareable across
//! threads: every invocation packs its arguments into a fresh [`CallFrame`],
//! so concurrent `execute` calls never share mutable state. The execution
//! engine (or the loaded library for ahead-of-time executables) owns the
//! native code and is dropped together with the executable.

use std::io::Write as _;
use std::process::Command;
use std::sync::Arc;

use melior::ExecutionEngine;
use melior::ir::Module;
use tracing::{debug, instrument};

use crate::arguments::Argument;
use crate::async_runtime::{self, AsyncRuntimeScope, AsyncTaskRunner};
use crate::bridge::CustomCallAttrs;
use crate::custom_call::{
    CustomCallRegistry, CustomCallScope, DISPATCH_SYMBOL, UserData, custom_call_dispatch,
};
use crate::error::{
    ArityMismatchSnafu, CodegenSnafu, Error, FunctionNotFoundSnafu, ObjFileSnafu, Result,
};
use crate::results::{
    ResultsMemoryLayout, ReturnValueConverter, ReturnedValues, verify_entrypoint_signature,
};
use crate::types::{FunctionType, Type};

/// Per-call options.
pub struct ExecuteOpts<'a> {
    /// Verify every argument against the entry signature. Disable on hot
    /// paths where the caller guarantees the operands.
    pub verify_arguments: bool,
    /// Work queue for tasks spawned by the compiled function.
    pub async_task_runner: Option<Arc<dyn AsyncTaskRunner>>,
    /// User data handles passed to custom call handlers.
    pub custom_call_data: Option<&'a UserData<'a>>,
}

impl Default for ExecuteOpts<'_> {
    fn default() -> Self {
        Self { verify_arguments: true, async_task_runner: None, custom_call_data: None }
    }
}

/// Opaque per-call context operand for runtime calling conventions that
/// expect one.
#[derive(Debug, Default)]
pub struct KernelContext {
    _reserved: usize,
}

/// Per-invocation scratch: the flat argument pointer array and the packed
/// results block. Lives for the duration of one call; the compiled function
/// unpacks everything it needs before returning, async regions only retain
/// pointers into per-result runtime objects.
pub struct CallFrame {
    args: Vec<*mut ()>,
    results: Vec<u8>,
    context: Box<KernelContext>,
    // Heap cell holding the context pointer; the ABI passes a pointer to it.
    context_ptr: Box<*mut KernelContext>,
}

impl Default for CallFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl CallFrame {
    pub fn new() -> Self {
        let mut context = Box::new(KernelContext::default());
        let context_ptr = Box::new(&mut *context as *mut KernelContext);
        Self { args: Vec::new(), results: Vec::new(), context, context_ptr }
    }

    pub fn args(&self) -> &[*mut ()] {
        &self.args
    }

    pub fn results(&self) -> &[u8] {
        &self.results
    }
}

/// Initialize a call frame for the given runtime signature.
///
/// Packs every argument, then appends one pointer per result addressing the
/// corresponding slot in the frame's results block. A leading kernel context
/// operand is packed by the runtime itself, the caller never passes it.
pub(crate) fn init_call_frame(
    rt_signature: &FunctionType,
    layout: &ResultsMemoryLayout,
    arguments: &[Argument],
    frame: &mut CallFrame,
    verify: bool,
) -> Result<()> {
    let operands = rt_signature.operands();
    let expects_context = matches!(operands.first(), Some(Type::KernelContext));
    let user_operands = if expects_context { &operands[1..] } else { operands };

    if arguments.len() != user_operands.len() {
        return ArityMismatchSnafu { actual: arguments.len(), expected: user_operands.len() }
            .fail();
    }

    if verify {
        for (index, (argument, ty)) in arguments.iter().zip(user_operands).enumerate() {
            argument.verify(index, ty)?;
        }
    }

    let mut num_slots = usize::from(expects_context);
    for ty in user_operands {
        num_slots += ty.as_argument()?.num_slots;
    }

    frame.args.clear();
    frame.args.resize(num_slots + layout.offsets.len(), std::ptr::null_mut());

    let mut offset = 0usize;
    if expects_context {
        frame.args[0] = &mut *frame.context_ptr as *mut *mut KernelContext as *mut ();
        offset = 1;
    }
    for argument in arguments {
        offset = argument.pack(&mut frame.args, offset);
    }
    debug_assert_eq!(offset, num_slots, "arguments packed a different number of slots");

    frame.results.clear();
    frame.results.resize(layout.size_bytes, 0);
    for (slot, result_offset) in layout.offsets.iter().enumerate() {
        frame.args[num_slots + slot] =
            unsafe { frame.results.as_mut_ptr().add(*result_offset) } as *mut ();
    }

    Ok(())
}

/// What keeps the native code mapped.
enum CodeOwner {
    /// JIT compiled: the execution engine owns the code.
    Jit(#[allow(dead_code)] ExecutionEngine),
    /// Loaded from an object file: the linked library and its directory.
    Aot {
        #[allow(dead_code)]
        library: libloading::Library,
        #[allow(dead_code)]
        dir: tempfile::TempDir,
    },
}

type EntryFn = unsafe extern "C" fn(*mut *mut ());

/// An immutable compiled entry point.
pub struct Executable {
    entry_name: String,
    signature: FunctionType,
    rt_signature: FunctionType,
    results_layout: ResultsMemoryLayout,
    fptr: EntryFn,
    obj_file: Option<Vec<u8>>,
    custom_call_attrs: CustomCallAttrs,
    custom_calls: Arc<CustomCallRegistry>,
    _owner: CodeOwner,
}

// SAFETY: the function pointer targets read-only compiled code kept alive by
// the owner; all remaining fields are immutable after construction.
unsafe impl Send for Executable {}
unsafe impl Sync for Executable {}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable")
            .field("entry_name", &self.entry_name)
            .field("num_operands", &self.rt_signature.num_operands())
            .field("num_results", &self.rt_signature.num_results())
            .finish()
    }
}

impl Executable {
    /// Generate native code for a module lowered to the LLVM dialect.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn codegen(
        module: &Module<'_>,
        entry_name: String,
        signature: FunctionType,
        rt_signature: FunctionType,
        results_layout: ResultsMemoryLayout,
        custom_call_attrs: CustomCallAttrs,
        custom_calls: Arc<CustomCallRegistry>,
        opt_level: usize,
        save_obj_file: bool,
    ) -> Result<Self> {
        let engine = ExecutionEngine::new(module, opt_level, &[], save_obj_file);

        // Bind the async runtime intrinsics and the custom call dispatcher
        // before the first symbol lookup.
        unsafe {
            for (name, ptr) in async_runtime::symbol_map() {
                engine.register_symbol(name, ptr);
            }
            engine.register_symbol(DISPATCH_SYMBOL, custom_call_dispatch as usize as *mut ());
        }

        // The packed interface wrapper takes the flat `void**` array.
        let packed_name = format!("_mlir_{entry_name}");
        let raw = engine.lookup(&packed_name);
        if raw.is_null() {
            return FunctionNotFoundSnafu { name: packed_name }.fail();
        }
        let fptr: EntryFn = unsafe { std::mem::transmute(raw) };

        let obj_file = if save_obj_file {
            Some(dump_object_file(&engine, &entry_name)?)
        } else {
            None
        };

        debug!(
            kernel.entry_point = %entry_name,
            kernel.num_results = results_layout.offsets.len(),
            "compiled executable"
        );

        Ok(Self {
            entry_name,
            signature,
            rt_signature,
            results_layout,
            fptr,
            obj_file,
            custom_call_attrs,
            custom_calls,
            _owner: CodeOwner::Jit(engine),
        })
    }

    /// Reconstruct an executable from a previously saved object file, the
    /// entry name and the declared signatures, without re-running the
    /// compilation pipeline.
    #[instrument(skip_all, fields(aot.name = name, aot.entry_point = entrypoint))]
    pub fn load_from_obj_file(
        name: &str,
        obj_file: &[u8],
        entrypoint: &str,
        signature: FunctionType,
        rt_signature: FunctionType,
        symbol_map: &[(&str, *mut ())],
        mem_region_tag: &str,
    ) -> Result<Self> {
        let results_layout = verify_entrypoint_signature(&rt_signature)?;

        let obj_error = |reason: String| ObjFileSnafu { name: name.to_string(), reason }.fail();

        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => return obj_error(format!("failed to create link directory: {err}")),
        };
        let obj_path = dir.path().join(format!("{mem_region_tag}.o"));
        let so_path = dir.path().join(format!("{mem_region_tag}.so"));

        let write_result = std::fs::File::create(&obj_path)
            .and_then(|mut file| file.write_all(obj_file));
        if let Err(err) = write_result {
            return obj_error(format!("failed to write object file: {err}"));
        }

        // Link the object into a shared library. Runtime symbols are bound to
        // their in-process addresses.
        let mut link = Command::new("cc");
        link.arg("-shared").arg("-o").arg(&so_path).arg(&obj_path);
        for (symbol, address) in symbol_map {
            link.arg(format!("-Wl,--defsym,{symbol}=0x{:x}", *address as usize));
        }
        match link.output() {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                return obj_error(format!(
                    "linking failed:\n{}",
                    String::from_utf8_lossy(&output.stderr)
                ));
            }
            Err(err) => return obj_error(format!("failed to run linker: {err}")),
        }

        let library = match unsafe { libloading::Library::new(&so_path) } {
            Ok(library) => library,
            Err(err) => return obj_error(format!("failed to load linked library: {err}")),
        };

        let packed_name = format!("_mlir_{entrypoint}");
        let fptr = unsafe {
            match library.get::<EntryFn>(packed_name.as_bytes()) {
                Ok(symbol) => *symbol,
                Err(_) => return FunctionNotFoundSnafu { name: packed_name }.fail(),
            }
        };

        Ok(Self {
            entry_name: entrypoint.to_string(),
            signature,
            rt_signature,
            results_layout,
            fptr,
            obj_file: Some(obj_file.to_vec()),
            custom_call_attrs: CustomCallAttrs::new(),
            custom_calls: Arc::new(CustomCallRegistry::new()),
            _owner: CodeOwner::Aot { library, dir },
        })
    }

    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }

    /// Signature of the entry as the client sees it.
    pub fn signature(&self) -> &FunctionType {
        &self.signature
    }

    /// Signature after the calling convention transform; determines the ABI.
    pub fn rt_signature(&self) -> &FunctionType {
        &self.rt_signature
    }

    pub fn results_layout(&self) -> &ResultsMemoryLayout {
        &self.results_layout
    }

    pub fn num_results(&self) -> usize {
        self.rt_signature.num_results()
    }

    /// The object file produced at codegen time, if it was requested.
    pub fn obj_file(&self) -> Option<&[u8]> {
        self.obj_file.as_deref()
    }

    /// Verify the arguments and pack them into the call frame.
    pub fn initialize_call_frame(
        &self,
        arguments: &[Argument],
        frame: &mut CallFrame,
        verify: bool,
    ) -> Result<()> {
        init_call_frame(&self.rt_signature, &self.results_layout, arguments, frame, verify)
    }

    /// Invoke the compiled entry point.
    ///
    /// On failure the error is returned synchronously and every unclaimed
    /// result slot is filled with an error value, so consumers of async
    /// results observe the failure as well.
    #[instrument(skip_all, fields(kernel.entry_point = %self.entry_name))]
    pub fn execute(
        &self,
        arguments: &[Argument],
        results: &mut ReturnedValues,
        converter: &ReturnValueConverter,
        opts: &ExecuteOpts<'_>,
    ) -> Result<()> {
        let mut frame = CallFrame::new();
        if let Err(err) = self.initialize_call_frame(arguments, &mut frame, opts.verify_arguments)
        {
            results.emit_errors(Arc::new(err.clone()));
            return Err(err);
        }

        // Scope the async runtime and custom call state to this call.
        let _async_scope = AsyncRuntimeScope::install(opts.async_task_runner.clone());
        let _custom_call_scope = CustomCallScope::install(
            self.custom_calls.clone(),
            &self.custom_call_attrs,
            opts.custom_call_data,
        );

        debug!(kernel.num_args = frame.args.len(), "invoking compiled function");
        unsafe { (self.fptr)(frame.args.as_mut_ptr()) };

        let mut first_failure = None;
        for (index, (ty, offset)) in self
            .rt_signature
            .results()
            .iter()
            .zip(&self.results_layout.offsets)
            .enumerate()
        {
            let slot = unsafe { frame.results.as_ptr().add(*offset) };
            if !converter.return_value(results, index, ty, slot) && first_failure.is_none() {
                first_failure = Some(index);
            }
        }

        if let Some(index) = first_failure {
            let err = Error::ResultConversion {
                reason: format!("result #{index} has no matching conversion"),
            };
            results.emit_errors(Arc::new(err.clone()));
            return Err(err);
        }
        Ok(())
    }
}

fn dump_object_file(engine: &ExecutionEngine, entry_name: &str) -> Result<Vec<u8>> {
    let codegen_error =
        |reason: String| CodegenSnafu { reason }.fail::<Vec<u8>>();

    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => return codegen_error(format!("failed to create dump directory: {err}")),
    };
    let path = dir.path().join(format!("{entry_name}.o"));
    let Some(path_str) = path.to_str() else {
        return codegen_error("object file path is not valid UTF-8".to_string());
    };
    engine.dump_to_object_file(path_str);
    match std::fs::read(&path) {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        Ok(_) => codegen_error("object file dump produced no data".to_string()),
        Err(err) => codegen_error(format!("failed to read dumped object file: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use molten_dtype::DType;

    use crate::arguments::MemrefDesc;

    use super::*;

    fn memref_ty(sizes: Vec<Option<i64>>) -> Type {
        Type::Memref { dtype: DType::Float32, sizes }
    }

    #[test]
    fn test_call_frame_layout() {
        let rt_signature = FunctionType::new(
            vec![memref_ty(vec![None]), memref_ty(vec![None])],
            vec![memref_ty(vec![Some(4)])],
        );
        let layout = verify_entrypoint_signature(&rt_signature).unwrap();

        let mut a = [1.0f32; 4];
        let mut b = [0.0f32; 4];
        let arguments = vec![
            Argument::from(MemrefDesc::contiguous(DType::Float32, a.as_mut_ptr() as *mut (), &[4])),
            Argument::from(MemrefDesc::contiguous(DType::Float32, b.as_mut_ptr() as *mut (), &[4])),
        ];

        let mut frame = CallFrame::new();
        init_call_frame(&rt_signature, &layout, &arguments, &mut frame, true).unwrap();

        // 5 slots per rank-1 memref argument, one pointer per result.
        assert_eq!(frame.args().len(), 11);
        assert_eq!(frame.results().len(), layout.size_bytes);
        // The result pointer addresses the frame's results block.
        assert_eq!(frame.args()[10], frame.results.as_ptr() as *mut ());
    }

    #[test]
    fn test_arity_mismatch_message_cites_counts() {
        let rt_signature =
            FunctionType::new(vec![memref_ty(vec![None]), memref_ty(vec![None])], vec![]);
        let layout = verify_entrypoint_signature(&rt_signature).unwrap();

        let mut a = [0.0f32; 4];
        let arguments = vec![Argument::from(MemrefDesc::contiguous(
            DType::Float32,
            a.as_mut_ptr() as *mut (),
            &[4],
        ))];

        let mut frame = CallFrame::new();
        let err =
            init_call_frame(&rt_signature, &layout, &arguments, &mut frame, true).unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { actual: 1, expected: 2 }));
        assert!(err.to_string().contains("1 vs 2"));
    }

    #[test]
    fn test_kernel_context_operand_is_packed_by_runtime() {
        let rt_signature =
            FunctionType::new(vec![Type::KernelContext, memref_ty(vec![None])], vec![]);
        let layout = verify_entrypoint_signature(&rt_signature).unwrap();

        let mut a = [0.0f32; 2];
        let arguments = vec![Argument::from(MemrefDesc::contiguous(
            DType::Float32,
            a.as_mut_ptr() as *mut (),
            &[2],
        ))];

        let mut frame = CallFrame::new();
        init_call_frame(&rt_signature, &layout, &arguments, &mut frame, true).unwrap();

        // Context slot plus 5 memref slots.
        assert_eq!(frame.args().len(), 6);
        let context = unsafe { *(frame.args()[0] as *const *mut KernelContext) };
        assert!(!context.is_null());
    }

    #[test]
    fn test_verification_can_be_skipped() {
        let rt_signature = FunctionType::new(vec![memref_ty(vec![Some(8)])], vec![]);
        let layout = verify_entrypoint_signature(&rt_signature).unwrap();

        // Wrong shape: strict verification rejects, the fast path accepts.
        let mut a = [0.0f32; 4];
        let arguments = vec![Argument::from(MemrefDesc::contiguous(
            DType::Float32,
            a.as_mut_ptr() as *mut (),
            &[4],
        ))];

        let mut frame = CallFrame::new();
        let err =
            init_call_frame(&rt_signature, &layout, &arguments, &mut frame, true).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        init_call_frame(&rt_signature, &layout, &arguments, &mut frame, false).unwrap();
    }
}
