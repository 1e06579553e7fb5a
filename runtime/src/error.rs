//! Error types for compilation and execution.

use molten_dtype::DType;
use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while compiling or executing a kernel module.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The input module could not be parsed.
    #[snafu(display("failed to parse the input module:\n{diagnostics}"))]
    Parse { diagnostics: String },

    /// One of the lowering stages failed.
    #[snafu(display("failed to lower module to {stage}:\n{diagnostics}"))]
    Lower { stage: String, diagnostics: String },

    /// Native code generation failed.
    #[snafu(display("code generation failed: {reason}"))]
    Codegen { reason: String },

    /// Entry point function is missing from the module.
    #[snafu(display("entry point function '{name}' not found"))]
    EntrypointNotFound { name: String },

    /// A symbol could not be resolved in the compiled module.
    #[snafu(display("function '{name}' not found in compiled module"))]
    FunctionNotFound { name: String },

    /// A parameter type cannot be passed across the ABI boundary.
    #[snafu(display("input #{index} type {ty} cannot be passed to the compiled function"))]
    UnsupportedParameter { index: usize, ty: String },

    /// A result type cannot be returned across the ABI boundary.
    #[snafu(display("result #{index} type {ty} cannot be returned from the compiled function"))]
    UnsupportedResult { index: usize, ty: String },

    /// A type has no runtime representation.
    #[snafu(display("can't convert type {ty} to a run time type"))]
    UnsupportedType { ty: String },

    /// Wrong number of arguments for the entry point.
    #[snafu(display(
        "number of arguments must match the number of inputs: {actual} vs {expected}"
    ))]
    ArityMismatch { actual: usize, expected: usize },

    /// Operand rank does not match the parameter type.
    #[snafu(display(
        "operand #{index} rank does not match expected input rank: {actual} vs {expected}"
    ))]
    RankMismatch { index: usize, actual: usize, expected: usize },

    /// Operand dimension does not match a static parameter dimension.
    #[snafu(display(
        "operand #{index} dimension #{dim} does not match expected input dimension: \
         {actual} vs {expected}"
    ))]
    ShapeMismatch { index: usize, dim: usize, actual: i64, expected: i64 },

    /// Operand element type does not match the parameter element type.
    #[snafu(display(
        "operand #{index} element type does not match expected input element type: \
         {actual} vs {expected}"
    ))]
    DTypeMismatch { index: usize, actual: DType, expected: DType },

    /// An argument kind is incompatible with the parameter type.
    #[snafu(display("operand #{index}: expected {expected}, got {actual}"))]
    ArgumentMismatch { index: usize, expected: String, actual: String },

    /// The module requires specialization but specialization is disabled.
    #[snafu(display(
        "module requires argument specialization, but specialization is disabled"
    ))]
    SpecializationRequired,

    /// Specialization of an operand failed.
    #[snafu(display("failed to specialize input #{index}: {reason}"))]
    Specialize { index: usize, reason: String },

    /// A memoized or fresh specialized compilation failed.
    #[snafu(display("compilation of specialized function failed: {reason}"))]
    SpecializedCompile { reason: String },

    /// A result converter rejected one of the returned values.
    #[snafu(display("failed to convert all returned values: {reason}"))]
    ResultConversion { reason: String },

    /// A returned async value reported an error state.
    #[snafu(display("async result completed with an error"))]
    AsyncCompletion,

    /// A host intrinsic invoked through the custom call bridge failed.
    #[snafu(display("custom call '{callee}' failed: {reason}"))]
    CustomCall { callee: String, reason: String },

    /// Loading an ahead-of-time compiled object file failed.
    #[snafu(display("failed to load object file '{name}': {reason}"))]
    ObjFile { name: String, reason: String },
}
