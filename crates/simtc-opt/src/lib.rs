//! Analysis, lowering and optimization passes for simtc IR.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] that runs an ordered pipeline
//! once, and the built-in passes: IR checking, the work-group size advisor,
//! foreach lowering, constant folding, dead code elimination, lifetime-stop
//! insertion, stack allocation and barrier insertion.

pub mod alias;
mod barrier;
mod check;
mod const_fold;
mod dce;
mod lifetime;
mod lower_foreach;
mod stack;
pub mod tiling;
mod work_group_size;

pub use barrier::InsertBarrier;
pub use check::CheckIr;
pub use const_fold::{ConstantFolding, Folded, fold_arith, fold_cast, fold_cmp, fold_operation, fold_unary};
pub use dce::DeadCodeElimination;
pub use lifetime::InsertLifetimeStop;
pub use lower_foreach::LowerForeach;
pub use stack::{Allocation, SetStackPtr, StackAllocator};
pub use work_group_size::WorkGroupSize;

use std::fmt::{self, Debug};
use std::str::FromStr;

use simtc_ir::{
    CompilationError, CoreConfig, DiagnosticSink, NullSink, Program, Result, Status, report,
};

/// A pass that transforms or checks a program.
pub trait Pass: Debug {
    /// Pipeline name of the pass (`constant-folding`, `set-stack-ptr`, ...).
    fn name(&self) -> &str;

    /// Run the pass. Returns `true` if anything was modified.
    fn run(&self, program: &mut Program) -> Result<bool, CompilationError>;
}

/// Optimization level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OptLevel {
    /// Lowering and allocation only.
    O0,
    /// Adds constant folding and dead code elimination.
    #[default]
    O1,
    /// Same as O1 for now.
    O2,
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::O0 => "0",
            Self::O1 => "1",
            Self::O2 => "2",
        })
    }
}

impl FromStr for OptLevel {
    type Err = CompilationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches(['O', 'o']) {
            "0" => Ok(Self::O0),
            "1" => Ok(Self::O1),
            "2" => Ok(Self::O2),
            _ => Err(CompilationError::new(Status::InvalidArguments)
                .with_extra(format!("unknown optimization level `{s}`"))),
        }
    }
}

/// Options shared by every pipeline built from them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassOptions {
    pub opt_level: OptLevel,
    /// Permit floating point rewrites that are wrong for NaN or infinity.
    pub unsafe_fp_math: bool,
}

/// Runs passes in sequence, each exactly once.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates the compilation pipeline for `core` and `options`.
    pub fn for_options(core: &CoreConfig, options: &PassOptions) -> Self {
        let mut pm = Self::new();
        pm.add_pass(Box::new(CheckIr));
        pm.add_pass(Box::new(WorkGroupSize::new(core.clone())));
        pm.add_pass(Box::new(LowerForeach));
        if options.opt_level != OptLevel::O0 {
            pm.add_pass(Box::new(ConstantFolding::new(options.unsafe_fp_math)));
            pm.add_pass(Box::new(DeadCodeElimination));
        }
        pm.add_pass(Box::new(InsertLifetimeStop));
        pm.add_pass(Box::new(SetStackPtr::new(core.local_memory_size)));
        pm.add_pass(Box::new(InsertBarrier));
        pm
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Names of the passes in pipeline order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass once, stopping at the first error.
    pub fn run(&self, program: &mut Program) -> Result<()> {
        self.run_with_sink(program, &mut NullSink)
    }

    /// Like [`PassManager::run`], handing the error to `sink` before returning it.
    pub fn run_with_sink(&self, program: &mut Program, sink: &mut dyn DiagnosticSink) -> Result<()> {
        for pass in &self.passes {
            match pass.run(program) {
                Ok(changed) => log::debug!("pass `{}` done (changed: {changed})", pass.name()),
                Err(e) => {
                    log::debug!("pass `{}` failed: {e}", pass.name());
                    return Err(report(sink, e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_ir::{CollectingSink, CorePreset, Function};

    #[test]
    fn empty_program_runs() {
        let core = CoreConfig::default();
        let pm = PassManager::for_options(&core, &PassOptions::default());
        let mut program = Program::new();
        pm.run(&mut program).unwrap();
        assert!(program.functions.is_empty());
    }

    #[test]
    fn pipeline_order() {
        let core = CoreConfig::preset(CorePreset::Pvc);
        let pm = PassManager::for_options(&core, &PassOptions::default());
        assert_eq!(
            pm.pass_names(),
            vec![
                "check-ir",
                "work-group-size",
                "lower-foreach",
                "constant-folding",
                "dead-code-elimination",
                "insert-lifetime-stop",
                "set-stack-ptr",
                "insert-barrier",
            ]
        );
    }

    #[test]
    fn o0_skips_folding_and_dce() {
        let options = PassOptions {
            opt_level: OptLevel::O0,
            unsafe_fp_math: false,
        };
        let pm = PassManager::for_options(&CoreConfig::default(), &options);
        let names = pm.pass_names();
        assert!(!names.contains(&"constant-folding"));
        assert!(!names.contains(&"dead-code-elimination"));
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn opt_level_parses() {
        assert_eq!("O2".parse::<OptLevel>().unwrap(), OptLevel::O2);
        assert_eq!("0".parse::<OptLevel>().unwrap(), OptLevel::O0);
        assert_eq!(
            "fast".parse::<OptLevel>().unwrap_err().status,
            Status::InvalidArguments
        );
    }

    #[test]
    fn errors_reach_the_sink() {
        let mut program = Program::new();
        let mut f = Function::new("k");
        f.subgroup_size = 7;
        f.work_group_size = [14, 1];
        program.functions.push(f);
        let pm = PassManager::for_options(&CoreConfig::default(), &PassOptions::default());
        let mut sink = CollectingSink::default();
        let err = pm.run_with_sink(&mut program, &mut sink).unwrap_err();
        assert_eq!(err.status, Status::UnsupportedSubgroupSize);
        assert_eq!(sink.reports.len(), 1);
    }
}
