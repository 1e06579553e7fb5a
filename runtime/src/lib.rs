//! JIT compilation and execution runtime for MLIR compute kernels.
//!
//! Client code hands the runtime a textual module and an entry point name;
//! the runtime compiles it through a configurable lowering pipeline into
//! native code, verifies that the entry signature is expressible across the
//! C ABI, and exposes a reusable executable invokable with typed run time
//! arguments (strided memrefs first of all). A cache of per-shape
//! specializations sits in front of compilation so that dynamically shaped
//! kernels are recompiled for concrete operand shapes and reused.
//!
//! ```ignore
//! let jit = JitExecutable::instantiate(source, "compute", options)?;
//! let executable = jit.get_executable(&args)?;
//! let mut results = ReturnedValues::new(executable.num_results());
//! executable.execute(&args, &mut results, &converter, &ExecuteOpts::default())?;
//! ```

pub mod arguments;
pub mod async_runtime;
pub mod bridge;
pub mod compiler;
pub mod custom_call;
pub mod error;
pub mod executable;
pub mod jit;
pub mod results;
pub mod scan;
pub mod specialize;
pub mod types;


pub use arguments::*;
pub use compiler::*;
pub use custom_call::*;
pub use error::*;
pub use executable::*;
pub use jit::*;
pub use results::*;
pub use types::*;
