#![warn(missing_docs)]
//! Backend interface of simtc.
//!
//! A [`Backend`] turns a validated [`Program`] into kernel source. Backends
//! share the kernel-language AST in [`clir`] and its [`printer`], report what
//! they produced through [`BackendOutput`], and are looked up by target name
//! in a [`BackendRegistry`].

#[allow(missing_docs)]
pub mod clir;
mod output;
#[allow(missing_docs)]
pub mod printer;
mod registry;

use std::fmt::{self, Debug};

use simtc_ir::{CompilationError, CoreConfig, Program};
use simtc_opt::PassOptions;

pub use output::{BackendOutput, Diagnostic, DiagnosticLevel, KernelMetadata, OutputFile, OutputKind};
pub use registry::{BackendRegistry, IrDumpBackend};

/// Code generator for one kernel language.
pub trait Backend: Debug + Send + Sync {
    /// Display name, e.g. "OpenCL C".
    fn name(&self) -> &str;

    /// Names accepted by `--target`.
    fn targets(&self) -> &[&str];

    /// Compiles `program`. Backends that run the pass pipeline work on their
    /// own copy and leave `program` untouched.
    fn compile(&self, program: &Program, opts: &BackendOptions)
    -> Result<BackendOutput, BackendError>;
}

/// Target core and pipeline options for one compilation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendOptions {
    /// Core the kernels are compiled for.
    pub core: CoreConfig,
    /// Pass pipeline options.
    pub passes: PassOptions,
}

impl fmt::Display for BackendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fp = if self.passes.unsafe_fp_math {
            "unsafe"
        } else {
            "strict"
        };
        write!(
            f,
            "O{} ({fp} fp), subgroup sizes {:?}, {} B registers, {} B local memory",
            self.passes.opt_level,
            self.core.subgroup_sizes,
            self.core.effective_register_space(),
            self.core.local_memory_size
        )
    }
}

/// Why a backend produced no output.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The pass pipeline or the emitter rejected the program.
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    /// The program has no kernels to emit.
    #[error("program contains no functions")]
    EmptyProgram,
    /// No registered backend handles the requested target.
    #[error("unknown target `{target}` (available: {})", available.join(", "))]
    UnknownTarget {
        /// Requested target name.
        target: String,
        /// Every target name the registry knows.
        available: Vec<String>,
    },
}
