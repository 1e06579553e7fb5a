//! One-shot JIT compilation context.
//!
//! A context takes a module from text to native code in two lowering stages.
//! Stage one is the client's pipeline and lowers whatever dialects the input
//! uses down to the core set the runtime understands; the entry point is
//! resolved and its signature verified at that boundary. Stage two is owned
//! by the runtime and lowers the core dialects to the LLVM dialect for code
//! generation. A context compiles exactly one executable and is consumed by
//! doing so.

use std::fmt;
use std::sync::Arc;

use melior::Context as IrContext;
use melior::dialect::DialectRegistry;
use melior::ir::Module;
use melior::pass::{self, PassManager};
use melior::utility::{register_all_dialects, register_all_llvm_translations};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

use crate::arguments::Argument;
use crate::bridge::{rewrite_alloc_alignment, rewrite_custom_calls, rewrite_custom_types};
use crate::custom_call::{CustomCallRegistry, register_static_custom_calls};
use crate::error::{LowerSnafu, ParseSnafu, Result};
use crate::executable::Executable;
use crate::scan::{ModuleInfo, scan_module};
use crate::specialize::{build_specialization_shim, insert_into_module};
use crate::types::TypeConverter;

/// When to specialize the entry point to concrete operand shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Specialization {
    /// Never specialize; always run the default executable.
    Disabled,
    /// Specialize when the module requires it.
    #[default]
    Enabled,
    /// Specialize for every distinct operand shape.
    Always,
}

/// Entry point signature in printed IR types.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IrSignature {
    pub operands: Vec<String>,
    pub results: Vec<String>,
}

pub type RegisterDialectsFn = Arc<dyn Fn(&DialectRegistry) + Send + Sync>;
pub type CompilationPipelineFn = Arc<dyn Fn(&PassManager<'_>) + Send + Sync>;
pub type CallingConventionFn = Arc<dyn Fn(&IrSignature) -> IrSignature + Send + Sync>;

/// Configuration of compilation and specialization.
#[derive(Clone)]
pub struct CompilationOptions {
    /// Specialization policy for dynamically shaped operands.
    pub specialization: Specialization,
    /// Minimum alignment forced on buffer allocations, 0 leaves them as-is.
    pub alignment: usize,
    /// Registers additional dialects with the parser.
    pub register_dialects: Option<RegisterDialectsFn>,
    /// Populates the stage one lowering pipeline. Absent means the input is
    /// already in the core dialects.
    pub create_compilation_pipeline: Option<CompilationPipelineFn>,
    /// Conversion from IR types to run time types.
    pub type_converter: TypeConverter,
    /// Transforms the entry signature into the ABI visible signature.
    pub calling_convention: Option<CallingConventionFn>,
    /// Code generation optimization level (0-3).
    pub jit_code_opt_level: usize,
    /// Host intrinsics available to the compiled module.
    pub custom_calls: Arc<CustomCallRegistry>,
    /// Printed-type substitutions applied before machine lowering, for
    /// custom types that lower to LLVM types.
    pub custom_type_lowerings: Vec<(String, String)>,
    /// Accept operations and types from unregistered dialects.
    pub allow_unregistered_dialects: bool,
    /// Upper bound on cached specializations, `None` is unbounded.
    pub max_specializations: Option<usize>,
    /// Capture the object file blob at code generation time.
    pub save_obj_file: bool,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            specialization: Specialization::default(),
            alignment: 0,
            register_dialects: None,
            create_compilation_pipeline: None,
            type_converter: TypeConverter::default(),
            calling_convention: None,
            jit_code_opt_level: 2,
            custom_calls: Arc::new(CustomCallRegistry::new()),
            custom_type_lowerings: Vec::new(),
            allow_unregistered_dialects: false,
            max_specializations: None,
            save_obj_file: false,
        }
    }
}

impl fmt::Debug for CompilationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationOptions")
            .field("specialization", &self.specialization)
            .field("alignment", &self.alignment)
            .field("jit_code_opt_level", &self.jit_code_opt_level)
            .field("max_specializations", &self.max_specializations)
            .field("save_obj_file", &self.save_obj_file)
            .finish_non_exhaustive()
    }
}

/// A custom call registry populated from the static registration aggregator.
pub fn default_custom_call_registry() -> Arc<CustomCallRegistry> {
    let mut registry = CustomCallRegistry::new();
    register_static_custom_calls(&mut registry);
    Arc::new(registry)
}

/// Captures the diagnostics emitted while parsing and lowering, so that
/// errors carry the full diagnostic stream.
#[derive(Clone, Default)]
struct DiagnosticsBuffer(Arc<Mutex<String>>);

impl DiagnosticsBuffer {
    fn attach(&self, context: &IrContext) {
        let buffer = self.clone();
        context.attach_diagnostic_handler(move |diagnostic| {
            use std::fmt::Write as _;
            let mut text = buffer.0.lock();
            let _ = writeln!(text, "{diagnostic}");
            // Diagnostics are fully handled by the capture.
            true
        });
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.0.lock())
    }
}

fn create_context(options: &CompilationOptions) -> IrContext {
    let registry = DialectRegistry::new();
    register_all_dialects(&registry);
    if let Some(register) = &options.register_dialects {
        register(&registry);
    }

    let context = IrContext::new();
    context.append_dialect_registry(&registry);
    context.load_all_available_dialects();
    register_all_llvm_translations(&context);
    if options.allow_unregistered_dialects {
        context.set_allow_unregistered_dialects(true);
    }
    context
}

/// The stage two pipeline: core dialects down to the LLVM dialect.
///
/// Inlining and canonicalization run first so that specialization shims fold
/// into the entry body before conversion.
fn build_machine_pipeline(pm: &PassManager<'_>) {
    pm.add_pass(pass::transform::create_inliner());
    pm.add_pass(pass::transform::create_canonicalizer());
    pm.add_pass(pass::transform::create_cse());

    pm.add_pass(pass::r#async::create_async_to_async_runtime());
    pm.add_pass(pass::r#async::create_async_runtime_ref_counting());
    pm.add_pass(pass::r#async::create_async_runtime_ref_counting_opt());

    pm.add_pass(pass::conversion::create_scf_to_control_flow());
    pm.add_pass(pass::conversion::create_async_to_llvm());
    pm.add_pass(pass::conversion::create_math_to_llvm());
    pm.add_pass(pass::conversion::create_arith_to_llvm());
    pm.add_pass(pass::conversion::create_index_to_llvm());
    pm.add_pass(pass::conversion::create_finalize_mem_ref_to_llvm());
    pm.add_pass(pass::conversion::create_control_flow_to_llvm());
    pm.add_pass(pass::conversion::create_func_to_llvm());
    pm.add_pass(pass::conversion::create_reconcile_unrealized_casts());
}

/// Manages parsing, specialization and compilation of one module.
///
/// The context normalizes the module to its canonical printed form at
/// instantiation; specialization and the bridge rewrites operate on that
/// form, and compilation parses it back for lowering and code generation.
pub struct JitCompilationContext {
    options: CompilationOptions,
    module_text: String,
    info: ModuleInfo,
    entrypoint_override: Option<String>,
}

impl JitCompilationContext {
    /// Parse and validate the module source.
    #[instrument(skip_all)]
    pub fn instantiate(options: CompilationOptions, source: &str) -> Result<Self> {
        let diagnostics = DiagnosticsBuffer::default();
        let context = create_context(&options);
        diagnostics.attach(&context);

        let Some(module) = Module::parse(&context, source) else {
            return ParseSnafu { diagnostics: diagnostics.take() }.fail();
        };
        let module_text = module.as_operation().to_string();
        let info = scan_module(&module_text);

        trace!(module = %module_text, "instantiated compilation context");
        Ok(Self { options, module_text, info, entrypoint_override: None })
    }

    pub fn options(&self) -> &CompilationOptions {
        &self.options
    }

    pub fn module_info(&self) -> &ModuleInfo {
        &self.info
    }

    /// Specialize the entry point to the concrete operand shapes and values.
    ///
    /// The number and order of parameters is unchanged; only shape and value
    /// refinements occur. Returns an error if the operands are incompatible
    /// with the entry signature.
    #[instrument(skip_all, fields(kernel.entry_point = entrypoint))]
    pub fn specialize(&mut self, operands: &[Argument], entrypoint: &str) -> Result<()> {
        let entry = self.info.resolve_entrypoint(entrypoint)?.clone();
        let shim_name = format!("__{}_specialized", entry.name);
        let shim = build_specialization_shim(&entry, &shim_name, operands)?;

        debug!(kernel.entry_point = %entry.name, shim = %shim_name, "specializing entry point");
        self.module_text = insert_into_module(&self.module_text, &shim);
        self.info = scan_module(&self.module_text);
        self.entrypoint_override = Some(shim_name);
        Ok(())
    }

    /// Compile the module into an executable. Consumes the context.
    #[instrument(skip_all, fields(kernel.entry_point = entrypoint))]
    pub fn compile(self, entrypoint: &str) -> Result<Executable> {
        let entrypoint = self.entrypoint_override.as_deref().unwrap_or(entrypoint);

        let diagnostics = DiagnosticsBuffer::default();
        let context = create_context(&self.options);
        diagnostics.attach(&context);

        // The canonical text was produced by the printer; parsing it again
        // in a fresh context cannot fail unless dialect registration changed.
        let Some(mut module) = Module::parse(&context, &self.module_text) else {
            return ParseSnafu { diagnostics: diagnostics.take() }.fail();
        };

        // Stage one: lower the input dialects to the core set.
        if let Some(pipeline) = &self.options.create_compilation_pipeline {
            let pm = PassManager::new(&context);
            pipeline(&pm);
            if pm.run(&mut module).is_err() {
                return LowerSnafu {
                    stage: "the runtime dialects".to_string(),
                    diagnostics: diagnostics.take(),
                }
                .fail();
            }
        }

        // The stage boundary is the verification point: resolve the entry
        // and check that its signature crosses the ABI.
        let lowered_text = module.as_operation().to_string();
        let info = scan_module(&lowered_text);
        let entry = info.resolve_entrypoint(entrypoint)?.clone();

        let ir_signature =
            IrSignature { operands: entry.operand_types(), results: entry.results.clone() };
        let rt_ir_signature = match &self.options.calling_convention {
            Some(convention) => convention(&ir_signature),
            None => ir_signature.clone(),
        };

        let signature = self
            .options
            .type_converter
            .convert_function(&ir_signature.operands, &ir_signature.results)?;
        let rt_signature = self
            .options
            .type_converter
            .convert_function(&rt_ir_signature.operands, &rt_ir_signature.results)?;
        let results_layout = crate::results::verify_entrypoint_signature(&rt_signature)?;

        // Bridge rewrites on the canonical form, then parse back. Custom
        // types are substituted first so intrinsic declarations are encoded
        // against their LLVM level types.
        let lowered_text = rewrite_custom_types(&lowered_text, &self.options.custom_type_lowerings);
        let (bridged, custom_call_attrs) =
            rewrite_custom_calls(&lowered_text, &self.options.custom_calls)?;
        let bridged = rewrite_alloc_alignment(&bridged, self.options.alignment);
        trace!(module = %bridged, "module before machine lowering");

        let Some(mut module) = Module::parse(&context, &bridged) else {
            return LowerSnafu {
                stage: "the runtime intrinsics".to_string(),
                diagnostics: diagnostics.take(),
            }
            .fail();
        };

        // Stage two: core dialects down to the LLVM dialect.
        let pm = PassManager::new(&context);
        build_machine_pipeline(&pm);
        if pm.run(&mut module).is_err() {
            return LowerSnafu {
                stage: "the llvm dialect".to_string(),
                diagnostics: diagnostics.take(),
            }
            .fail();
        }

        Executable::codegen(
            &module,
            entry.name,
            signature,
            rt_signature,
            results_layout,
            custom_call_attrs,
            self.options.custom_calls.clone(),
            self.options.jit_code_opt_level,
            self.options.save_obj_file,
        )
    }
}

impl fmt::Debug for JitCompilationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitCompilationContext")
            .field("functions", &self.info.functions.len())
            .field("entrypoint_override", &self.entrypoint_override)
            .finish_non_exhaustive()
    }
}
