//! OpenCL C backend for simtc.
//!
//! Runs the pass pipeline on a copy of the program, lowers every function to
//! an OpenCL C kernel and generates register-blocked device functions for the
//! BLAS instructions the kernels use.

use simtc_backend_core::{
    Backend, BackendError, BackendOptions, BackendOutput, Diagnostic, KernelMetadata, OutputFile,
    OutputKind,
};
use simtc_backend_core::printer::print_module;
use simtc_ir::{DiagnosticSink, NullSink, Program, report};
use simtc_opt::PassManager;

mod blas;
mod dope;
pub mod emit;
pub mod gemm;
mod session;
mod store;
mod tile;
mod types;

pub use emit::emit_program;
pub use gemm::{GemmConfig, generate_gemm};

/// Backend that compiles simtc IR into an OpenCL C translation unit.
#[derive(Debug)]
pub struct OpenClBackend;

impl Backend for OpenClBackend {
    fn name(&self) -> &str {
        "OpenCL C"
    }

    fn targets(&self) -> &[&str] {
        &["opencl", "cl"]
    }

    fn compile(
        &self,
        program: &Program,
        opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        self.compile_with_sink(program, opts, &mut NullSink)
    }
}

impl OpenClBackend {
    /// Compiles `program`, handing every compilation error to `sink` before
    /// returning it.
    pub fn compile_with_sink(
        &self,
        program: &Program,
        opts: &BackendOptions,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<BackendOutput, BackendError> {
        if program.functions.is_empty() {
            return Err(BackendError::EmptyProgram);
        }

        let mut program = program.clone();
        PassManager::for_options(&opts.core, &opts.passes).run_with_sink(&mut program, sink)?;
        let module = emit_program(&program, &opts.core).map_err(|e| report(sink, e))?;

        let kernels: Vec<_> = program
            .functions
            .iter()
            .map(|f| KernelMetadata {
                name: f.name.clone(),
                subgroup_size: f.subgroup_size,
                work_group_size: f.work_group_size,
                scratch_size: f.scratch_size,
            })
            .collect();
        let mut diagnostics: Vec<_> = kernels.iter().map(|k| Diagnostic::note(k.to_string())).collect();
        let helpers = module.functions.len() - kernels.len();
        if helpers > 0 {
            diagnostics.push(Diagnostic::note(format!(
                "{helpers} BLAS device function(s) generated"
            )));
        }
        log::info!(
            "emitted {} kernel(s) and {helpers} device function(s)",
            kernels.len()
        );

        Ok(BackendOutput {
            files: vec![OutputFile {
                name: "kernel.cl".into(),
                kind: OutputKind::KernelSource,
                text: print_module(&module),
            }],
            diagnostics,
            kernels,
        })
    }
}
