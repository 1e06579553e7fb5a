//! Lazily specialized compiled module.
//!
//! A [`JitExecutable`] retains the module source so it can recompile the
//! entry point for concrete operand shapes. Specializations are cached by a
//! fingerprint of the operand shapes; a pending placeholder guarantees that
//! concurrent callers of the same shape trigger exactly one compilation, and
//! failed compilations are memoized so repeated shapes fail cheaply.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument};

use crate::arguments::Argument;
use crate::compiler::{CompilationOptions, JitCompilationContext, Specialization};
use crate::error::{Result, SpecializationRequiredSnafu, SpecializedCompileSnafu};
use crate::executable::Executable;

/// Cache entry for one operand shape fingerprint. Entries are write-once:
/// `Pending` is replaced exactly once by the thread that claimed the key.
enum Entry {
    Pending,
    Compiled(Arc<Executable>),
    Failed(String),
}

#[derive(Default)]
struct Specializations {
    entries: Mutex<HashMap<u64, Entry>>,
    ready: Condvar,
}

/// Fingerprint of the operand shapes: operand count plus rank and sizes per
/// shaped operand. Strides are deliberately excluded, non-contiguous
/// operands are not specialization-distinct.
fn fingerprint(operands: &[Argument]) -> u64 {
    let mut hasher = DefaultHasher::new();
    operands.len().hash(&mut hasher);
    for operand in operands {
        match operand {
            Argument::Memref(desc) => {
                desc.rank().hash(&mut hasher);
                desc.sizes().hash(&mut hasher);
            }
            _ => u8::MAX.hash(&mut hasher),
        }
    }
    hasher.finish()
}

/// A compiled module plus its cache of shape specializations.
pub struct JitExecutable {
    source: String,
    entrypoint: String,
    options: CompilationOptions,
    default_executable: Option<Arc<Executable>>,
    specializations: Specializations,
}

impl JitExecutable {
    /// Compile the module source into a reusable executable.
    ///
    /// If the entry point requires specialization the default executable is
    /// skipped and compilation happens on first use; requiring specialization
    /// with the `Disabled` policy is an error.
    #[instrument(skip_all, fields(kernel.entry_point = entrypoint))]
    pub fn instantiate(
        source: &str,
        entrypoint: &str,
        options: CompilationOptions,
    ) -> Result<Self> {
        let context = JitCompilationContext::instantiate(options.clone(), source)?;
        let entry = context.module_info().resolve_entrypoint(entrypoint)?;
        let requires_specialization = entry.requires_specialization();

        if requires_specialization && options.specialization == Specialization::Disabled {
            return SpecializationRequiredSnafu.fail();
        }

        let default_executable =
            if requires_specialization || options.specialization == Specialization::Always {
                None
            } else {
                Some(Arc::new(context.compile(entrypoint)?))
            };

        Ok(Self {
            source: source.to_string(),
            entrypoint: entrypoint.to_string(),
            options,
            default_executable,
            specializations: Specializations::default(),
        })
    }

    /// The executable compiled from the unspecialized module, if any.
    pub fn default_executable(&self) -> Option<&Arc<Executable>> {
        self.default_executable.as_ref()
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    /// Number of cached specializations (compiled or failed).
    pub fn num_specializations(&self) -> usize {
        self.specializations.entries.lock().len()
    }

    /// Resolve an executable compatible with the given operands.
    ///
    /// With specialization disabled this is the default executable. Otherwise
    /// the specialization cache is consulted; at most one thread compiles any
    /// given shape, and everyone observes the first writer's outcome.
    #[instrument(skip_all, fields(kernel.entry_point = %self.entrypoint))]
    pub fn get_executable(&self, operands: &[Argument]) -> Result<Arc<Executable>> {
        if self.options.specialization == Specialization::Disabled {
            if let Some(default) = &self.default_executable {
                return Ok(default.clone());
            }
            return SpecializationRequiredSnafu.fail();
        }

        let key = fingerprint(operands);

        {
            let mut entries = self.specializations.entries.lock();
            loop {
                match entries.get(&key) {
                    Some(Entry::Compiled(executable)) => {
                        debug!(cache.key = key, "specialization cache hit");
                        return Ok(executable.clone());
                    }
                    Some(Entry::Failed(reason)) => {
                        debug!(cache.key = key, "memoized specialization failure");
                        return SpecializedCompileSnafu { reason: reason.clone() }.fail();
                    }
                    Some(Entry::Pending) => {
                        // Another thread is compiling this shape.
                        self.specializations.ready.wait(&mut entries);
                    }
                    None => break,
                }
            }

            if let Some(bound) = self.options.max_specializations
                && entries.len() >= bound
            {
                drop(entries);
                debug!(cache.bound = bound, "specialization cache full");
                if let Some(default) = &self.default_executable {
                    return Ok(default.clone());
                }
                // No default to fall back on: compile without growing the
                // cache.
                return self.compile_specialized(operands).map(Arc::new);
            }

            entries.insert(key, Entry::Pending);
        }

        // Compile outside the lock; the pending entry holds the claim.
        let compiled = self.compile_specialized(operands);

        let outcome = {
            let mut entries = self.specializations.entries.lock();
            match compiled {
                Ok(executable) => {
                    let executable = Arc::new(executable);
                    entries.insert(key, Entry::Compiled(executable.clone()));
                    Ok(executable)
                }
                Err(err) => {
                    let reason = err.to_string();
                    entries.insert(key, Entry::Failed(reason.clone()));
                    SpecializedCompileSnafu { reason }.fail()
                }
            }
        };
        self.specializations.ready.notify_all();
        outcome
    }

    fn compile_specialized(&self, operands: &[Argument]) -> Result<Executable> {
        debug!(kernel.entry_point = %self.entrypoint, "compiling specialization");
        let mut context = JitCompilationContext::instantiate(self.options.clone(), &self.source)?;
        context.specialize(operands, &self.entrypoint)?;
        context.compile(&self.entrypoint)
    }
}

impl std::fmt::Debug for JitExecutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitExecutable")
            .field("entrypoint", &self.entrypoint)
            .field("has_default", &self.default_executable.is_some())
            .field("specializations", &self.num_specializations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use molten_dtype::DType;

    use crate::arguments::MemrefDesc;

    use super::*;

    fn shaped(sizes: &[i64]) -> Argument {
        Argument::from(MemrefDesc::contiguous(DType::Float32, std::ptr::null_mut(), sizes))
    }

    #[test]
    fn test_fingerprint_keyed_by_shapes() {
        let a = fingerprint(&[shaped(&[10, 11]), shaped(&[16, 32])]);
        let b = fingerprint(&[shaped(&[10, 11]), shaped(&[16, 32])]);
        assert_eq!(a, b);

        let c = fingerprint(&[shaped(&[12, 13]), shaped(&[16, 32])]);
        assert_ne!(a, c);

        // Operand count matters.
        assert_ne!(fingerprint(&[shaped(&[4])]), fingerprint(&[shaped(&[4]), shaped(&[4])]));
        // Rank matters even when flattened sizes agree.
        assert_ne!(fingerprint(&[shaped(&[4, 1])]), fingerprint(&[shaped(&[4])]));
    }

    #[test]
    fn test_fingerprint_ignores_strides() {
        let mut data = [0.0f32; 8];
        let contiguous = Argument::from(MemrefDesc::contiguous(
            DType::Float32,
            data.as_mut_ptr() as *mut (),
            &[2, 4],
        ));
        let strided = Argument::from(MemrefDesc::new(
            DType::Float32,
            data.as_mut_ptr() as *mut (),
            0,
            &[2, 4],
            &[1, 2],
        ));
        assert_eq!(fingerprint(&[contiguous]), fingerprint(&[strided]));
    }
}
