//! Module-wide emission state: memoized device functions and extensions.

use std::collections::{BTreeSet, HashMap, HashSet};

use simtc_backend_core::clir::{self, DataType, Expr, Module, Stmt};
use simtc_ir::Result;
use simtc_opt::tiling::LocalTiling;

/// Key of a memoized device function: identifier, subgroup size and tiling.
type MemoKey = (String, u32, u32, u32);

/// State shared by all kernels of one module.
#[derive(Debug, Default)]
pub struct EmissionSession {
    reserved: HashSet<String>,
    memo: HashMap<MemoKey, String>,
    helpers: Vec<clir::Function>,
    extensions: BTreeSet<String>,
}

impl EmissionSession {
    /// Creates a session whose helper names avoid `reserved` (the kernel names).
    pub fn new<'a>(reserved: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            reserved: reserved.into_iter().map(str::to_owned).collect(),
            ..Self::default()
        }
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(name)
    }

    /// Requests an extension pragma.
    pub fn enable(&mut self, extension: &str) {
        self.extensions.insert(extension.to_owned());
    }

    /// Name of the device function for `identifier`, generating it on first use.
    ///
    /// A name taken by a kernel or by a function generated for a different
    /// subgroup size or tiling gets a numeric suffix.
    pub fn device_function<F>(
        &mut self,
        identifier: &str,
        subgroup_size: u32,
        tiling: LocalTiling,
        generate: F,
    ) -> Result<String>
    where
        F: FnOnce(&str) -> Result<clir::Function>,
    {
        let key = (
            identifier.to_owned(),
            subgroup_size,
            tiling.m_tiles,
            tiling.n_tiles,
        );
        if let Some(name) = self.memo.get(&key) {
            log::debug!("reusing device function {name}");
            return Ok(name.clone());
        }
        let mut name = identifier.to_owned();
        let mut suffix = 0;
        while self.reserved.contains(&name) {
            suffix += 1;
            name = format!("{identifier}{suffix}");
        }
        let func = generate(&name)?;
        log::debug!("generated device function {name}");
        self.reserved.insert(name.clone());
        self.helpers.push(func);
        self.memo.insert(key, name.clone());
        Ok(name)
    }

    /// Assembles the module: device functions first, then `kernels`.
    pub fn finish(self, kernels: Vec<clir::Function>) -> Module {
        let mut functions = self.helpers;
        functions.extend(kernels);
        let mut extensions = self.extensions;
        for func in &functions {
            scan_function(func, &mut extensions);
        }
        Module {
            extensions,
            functions,
        }
    }
}

fn scan_type(ty: &DataType, ext: &mut BTreeSet<String>) {
    match ty {
        DataType::Builtin(b) | DataType::Atomic(b) => {
            use clir::BuiltinType as B;
            match b.component() {
                B::Double => {
                    ext.insert("cl_khr_fp64".to_owned());
                }
                B::Half => {
                    ext.insert("cl_khr_fp16".to_owned());
                }
                _ => {}
            }
        }
        DataType::Pointer { pointee, .. } => scan_type(pointee, ext),
    }
}

fn scan_expr(expr: &Expr, ext: &mut BTreeSet<String>) {
    match expr {
        Expr::Float { ty, .. } => scan_type(&DataType::Builtin(*ty), ext),
        Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) => {}
        Expr::Unary(_, e) | Expr::Member(e, _) => scan_expr(e, ext),
        Expr::Cast(ty, e) => {
            scan_type(ty, ext);
            scan_expr(e, ext);
        }
        Expr::Binary(_, a, b) | Expr::Assign(_, a, b) | Expr::Index(a, b) => {
            scan_expr(a, ext);
            scan_expr(b, ext);
        }
        Expr::Ternary(c, a, b) => {
            scan_expr(c, ext);
            scan_expr(a, ext);
            scan_expr(b, ext);
        }
        Expr::Call(name, args) => {
            if name.starts_with("intel_convert_") {
                ext.insert("cl_intel_bfloat16_conversions".to_owned());
            }
            for arg in args {
                scan_expr(arg, ext);
            }
        }
        Expr::Vector(ty, args) => {
            scan_type(&DataType::Builtin(*ty), ext);
            for arg in args {
                scan_expr(arg, ext);
            }
        }
    }
}

fn scan_stmts(stmts: &[Stmt], ext: &mut BTreeSet<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Decl(decl) => {
                scan_type(&decl.ty, ext);
                if let Some(init) = &decl.init {
                    scan_expr(init, ext);
                }
            }
            Stmt::Expr(e) => scan_expr(e, ext),
            Stmt::Block(body) => scan_stmts(body, ext),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                scan_expr(cond, ext);
                scan_stmts(then, ext);
                scan_stmts(otherwise, ext);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                scan_stmts(std::slice::from_ref(&**init), ext);
                scan_expr(cond, ext);
                scan_expr(step, ext);
                scan_stmts(body, ext);
            }
            Stmt::DoWhile { body, cond } => {
                scan_stmts(body, ext);
                scan_expr(cond, ext);
            }
            Stmt::Return(value) => {
                if let Some(v) = value {
                    scan_expr(v, ext);
                }
            }
        }
    }
}

/// Adds the extensions required by the types and builtins `func` uses.
fn scan_function(func: &clir::Function, ext: &mut BTreeSet<String>) {
    scan_type(&func.ret, ext);
    for param in &func.params {
        scan_type(&param.ty, ext);
    }
    scan_stmts(&func.body, ext);
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_backend_core::clir::{Block, BuiltinType, Space};

    fn tiling() -> LocalTiling {
        LocalTiling {
            m_tiles: 2,
            n_tiles: 1,
        }
    }

    fn empty(name: &str) -> Result<clir::Function> {
        Ok(clir::Function::new(name))
    }

    #[test]
    fn memoizes_by_identifier() {
        let mut session = EmissionSession::new(["kernel_a"]);
        let mut calls = 0;
        for _ in 0..3 {
            let name = session
                .device_function("gemm_x", 16, tiling(), |n| {
                    calls += 1;
                    empty(n)
                })
                .unwrap();
            assert_eq!(name, "gemm_x");
        }
        assert_eq!(calls, 1);
        let module = session.finish(Vec::new());
        assert_eq!(module.functions.len(), 1);
    }

    #[test]
    fn collisions_get_a_numeric_suffix() {
        let mut session = EmissionSession::new(["gemm_x"]);
        let name = session.device_function("gemm_x", 16, tiling(), empty).unwrap();
        assert_eq!(name, "gemm_x1");
        let other = session.device_function("gemm_x", 32, tiling(), empty).unwrap();
        assert_eq!(other, "gemm_x2");
        assert!(session.is_reserved("gemm_x2"));
    }

    #[test]
    fn generator_errors_do_not_reserve() {
        let mut session = EmissionSession::new(std::iter::empty());
        let err = session.device_function("sum_x", 16, tiling(), |_| {
            Err(simtc_ir::CompilationError::internal("boom"))
        });
        assert!(err.is_err());
        assert!(!session.is_reserved("sum_x"));
    }

    #[test]
    fn extensions_follow_types() {
        let mut f = clir::Function::new("k");
        f.param(DataType::from(BuiltinType::Double).pointer(Space::Global), "A");
        let mut bb = Block::new();
        bb.declare_assign(
            BuiltinType::Float,
            "x",
            Expr::call("intel_convert_as_bfloat16_float", vec![Expr::var("y")]),
        );
        f.body = bb.into_stmts();
        let mut session = EmissionSession::new(["k"]);
        session.enable("cl_ext_float_atomics");
        let module = session.finish(vec![f]);
        let ext: Vec<_> = module.extensions.iter().map(String::as_str).collect();
        assert_eq!(
            ext,
            [
                "cl_ext_float_atomics",
                "cl_intel_bfloat16_conversions",
                "cl_khr_fp64"
            ]
        );
    }
}
