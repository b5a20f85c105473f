//! Target-name dispatch.

use simtc_ir::Program;

use crate::{Backend, BackendError, BackendOptions, BackendOutput, OutputFile, OutputKind};

/// Backends known to the driver, searched in registration order.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the backends of this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(IrDumpBackend));
        registry
    }

    /// Adds `backend`. Earlier registrations win on target name clashes.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    /// The backend handling `target`.
    pub fn find(&self, target: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .map(|b| &**b)
            .find(|b| b.targets().contains(&target))
    }

    /// Like [`find`](Self::find), with an error naming the known targets.
    pub fn resolve(&self, target: &str) -> Result<&dyn Backend, BackendError> {
        self.find(target).ok_or_else(|| BackendError::UnknownTarget {
            target: target.to_owned(),
            available: self.targets().map(str::to_owned).collect(),
        })
    }

    /// Every target name, grouped by backend.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.backends
            .iter()
            .flat_map(|b| b.targets().iter().copied())
    }
}

/// Prints the program as IR text without running any pass.
#[derive(Debug)]
pub struct IrDumpBackend;

impl Backend for IrDumpBackend {
    fn name(&self) -> &str {
        "IR Dump"
    }

    fn targets(&self) -> &[&str] {
        &["ir-dump", "ir"]
    }

    fn compile(
        &self,
        program: &Program,
        _opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        Ok(BackendOutput {
            files: vec![OutputFile {
                name: "program.ir".into(),
                kind: OutputKind::IrDump,
                text: simtc_ir::dump_program(program),
            }],
            ..BackendOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_ir::Function;

    #[derive(Debug)]
    struct Shadow;

    impl Backend for Shadow {
        fn name(&self) -> &str {
            "shadow"
        }

        fn targets(&self) -> &[&str] {
            &["ir", "shadow"]
        }

        fn compile(
            &self,
            _program: &Program,
            _opts: &BackendOptions,
        ) -> Result<BackendOutput, BackendError> {
            Ok(BackendOutput::default())
        }
    }

    #[test]
    fn ir_dump_prints_functions() {
        let mut program = Program::new();
        program.add_function(Function::new("empty")).unwrap();
        let output = IrDumpBackend
            .compile(&program, &BackendOptions::default())
            .unwrap();
        assert_eq!(output.files[0].name, "program.ir");
        assert_eq!(output.files[0].kind, OutputKind::IrDump);
        assert!(output.text().unwrap().contains("func @empty()"));
        assert!(output.kernels.is_empty());
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = BackendRegistry::with_builtins();
        registry.register(Box::new(Shadow));
        assert_eq!(registry.find("ir").map(|b| b.name()), Some("IR Dump"));
        assert_eq!(registry.find("shadow").map(|b| b.name()), Some("shadow"));
        let targets: Vec<_> = registry.targets().collect();
        assert_eq!(targets, ["ir-dump", "ir", "ir", "shadow"]);
    }

    #[test]
    fn resolve_lists_known_targets() {
        let registry = BackendRegistry::with_builtins();
        match registry.resolve("ptx") {
            Err(BackendError::UnknownTarget { target, available }) => {
                assert_eq!(target, "ptx");
                assert_eq!(available, ["ir-dump", "ir"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(BackendRegistry::new().targets().next().is_none());
    }
}
