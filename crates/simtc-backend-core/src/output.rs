//! What a backend hands back: source files, launch metadata and notes.

use std::fmt;

/// Kind of an emitted file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// Kernel-language translation unit.
    KernelSource,
    /// Textual IR listing.
    IrDump,
}

/// One emitted file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFile {
    /// Suggested file name, e.g. `kernel.cl`.
    pub name: String,
    /// What the file contains.
    pub kind: OutputKind,
    /// File contents.
    pub text: String,
}

/// Launch requirements of one emitted kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelMetadata {
    /// Kernel name in the emitted source.
    pub name: String,
    /// Required subgroup size.
    pub subgroup_size: u32,
    /// Required work-group size; the third dimension is always 1.
    pub work_group_size: [u32; 2],
    /// Bytes of work-group local scratch.
    pub scratch_size: i64,
}

impl fmt::Display for KernelMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y] = self.work_group_size;
        write!(
            f,
            "{}: subgroup size {}, work-group size {x}x{y}, scratch {} B",
            self.name, self.subgroup_size, self.scratch_size
        )
    }
}

/// Severity of a [`Diagnostic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// Something the user may want to change.
    Warning,
    /// Informational.
    Note,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Note => "note",
        })
    }
}

/// Non-fatal message attached to a successful compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity.
    pub level: DiagnosticLevel,
    /// Message text.
    pub message: String,
}

impl Diagnostic {
    /// A [`DiagnosticLevel::Note`].
    pub fn note(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Note,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.message)
    }
}

/// Result of a successful compilation.
#[derive(Clone, Debug, Default)]
pub struct BackendOutput {
    /// Emitted files.
    pub files: Vec<OutputFile>,
    /// Notes and warnings.
    pub diagnostics: Vec<Diagnostic>,
    /// One entry per kernel, in program order.
    pub kernels: Vec<KernelMetadata>,
}

impl BackendOutput {
    /// Contents of the first file.
    pub fn text(&self) -> Option<&str> {
        self.files.first().map(|f| f.text.as_str())
    }

    /// Metadata of the kernel called `name`.
    pub fn kernel(&self, name: &str) -> Option<&KernelMetadata> {
        self.kernels.iter().find(|k| k.name == name)
    }
}
