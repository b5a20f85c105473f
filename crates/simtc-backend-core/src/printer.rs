//! OpenCL C source printer for [`crate::clir`] trees.

use std::fmt::Write;

use crate::clir::{
    BuiltinType, DataType, Declaration, Expr, Function, Module, Space, Stmt, UnaryOp,
};

const INDENT: &str = "    ";

/// Prints a whole translation unit.
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    for ext in &module.extensions {
        let _ = writeln!(out, "#pragma OPENCL EXTENSION {ext} : enable");
    }
    for (i, func) in module.functions.iter().enumerate() {
        if i > 0 || !module.extensions.is_empty() {
            out.push('\n');
        }
        out.push_str(&print_function(func));
    }
    out
}

pub fn print_function(func: &Function) -> String {
    let mut out = String::new();
    if let Some(attrs) = func.kernel {
        let [x, y] = attrs.work_group_size;
        let _ = write!(
            out,
            "kernel __attribute__((reqd_work_group_size({x}, {y}, 1))) \
             __attribute__((intel_reqd_sub_group_size({}))) ",
            attrs.subgroup_size
        );
    }
    let params: Vec<_> = func
        .params
        .iter()
        .map(|p| format!("{} {}", print_type(&p.ty), p.name))
        .collect();
    let _ = writeln!(
        out,
        "{} {}({}) {{",
        print_type(&func.ret),
        func.name,
        params.join(", ")
    );
    for stmt in &func.body {
        print_stmt(&mut out, stmt, 1);
    }
    out.push_str("}\n");
    out
}

pub fn print_type(ty: &DataType) -> String {
    match ty {
        DataType::Builtin(b) => b.name().to_owned(),
        DataType::Atomic(b) => format!("atomic_{}", b.name()),
        DataType::Pointer {
            pointee,
            space,
            volatile,
        } => {
            let mut s = String::new();
            let nested = matches!(**pointee, DataType::Pointer { .. });
            if nested {
                s.push_str(&print_type(pointee));
                s.push(' ');
                push_qualifiers(&mut s, *volatile, *space);
                s.truncate(s.trim_end().len());
            } else {
                push_qualifiers(&mut s, *volatile, *space);
                s.push_str(&print_type(pointee));
            }
            s.push('*');
            s
        }
    }
}

fn push_qualifiers(s: &mut String, volatile: bool, space: Space) {
    if volatile {
        s.push_str("volatile ");
    }
    if space != Space::Private {
        s.push_str(space.keyword());
        s.push(' ');
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str(INDENT);
    }
}

fn declaration(decl: &Declaration) -> String {
    let mut s = String::new();
    if decl.space != Space::Private {
        s.push_str(decl.space.keyword());
        s.push(' ');
    }
    let _ = write!(s, "{} {}", print_type(&decl.ty), decl.name);
    if let Some(len) = decl.array {
        let _ = write!(s, "[{len}]");
    }
    if let Some(align) = decl.aligned {
        let _ = write!(s, " __attribute__((aligned({align})))");
    }
    if let Some(init) = &decl.init {
        let _ = write!(s, " = {}", print_expr(init));
    }
    s
}

fn print_body(out: &mut String, stmts: &[Stmt], level: usize) {
    for stmt in stmts {
        print_stmt(out, stmt, level + 1);
    }
    indent(out, level);
    out.push('}');
}

pub fn print_stmt(out: &mut String, stmt: &Stmt, level: usize) {
    indent(out, level);
    match stmt {
        Stmt::Decl(decl) => {
            let _ = writeln!(out, "{};", declaration(decl));
        }
        Stmt::Expr(e) => {
            let _ = writeln!(out, "{};", print_expr(e));
        }
        Stmt::Block(stmts) => {
            out.push_str("{\n");
            print_body(out, stmts, level);
            out.push('\n');
        }
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            let _ = writeln!(out, "if ({}) {{", print_expr(cond));
            print_body(out, then, level);
            if !otherwise.is_empty() {
                out.push_str(" else {\n");
                print_body(out, otherwise, level);
            }
            out.push('\n');
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
            unroll,
        } => {
            if let Some(factor) = unroll {
                let _ = writeln!(out, "__attribute__((opencl_unroll_hint({factor})))");
                indent(out, level);
            }
            let init = match &**init {
                Stmt::Decl(decl) => declaration(decl),
                Stmt::Expr(e) => print_expr(e),
                _ => String::new(),
            };
            let _ = writeln!(
                out,
                "for ({init}; {}; {}) {{",
                print_expr(cond),
                print_expr(step)
            );
            print_body(out, body, level);
            out.push('\n');
        }
        Stmt::DoWhile { body, cond } => {
            out.push_str("do {\n");
            print_body(out, body, level);
            let _ = writeln!(out, " while ({});", print_expr(cond));
        }
        Stmt::Return(value) => match value {
            Some(v) => {
                let _ = writeln!(out, "return {};", print_expr(v));
            }
            None => out.push_str("return;\n"),
        },
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

const PRIMARY: u8 = 1;
const UNARY: u8 = 2;
const TERNARY: u8 = 13;
const ASSIGN: u8 = 14;

fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::Int(v) if *v < 0 => UNARY,
        Expr::Float { value, .. } if value.is_sign_negative() => UNARY,
        Expr::Int(_)
        | Expr::Float { .. }
        | Expr::Bool(_)
        | Expr::Var(_)
        | Expr::Call(..)
        | Expr::Index(..)
        | Expr::Member(..) => PRIMARY,
        Expr::Unary(..) | Expr::Cast(..) | Expr::Vector(..) => UNARY,
        Expr::Binary(op, ..) => op.precedence(),
        Expr::Ternary(..) => TERNARY,
        Expr::Assign(..) => ASSIGN,
    }
}

pub fn print_expr(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr);
    out
}

fn write_operand(out: &mut String, expr: &Expr, max: u8) {
    if precedence(expr) > max {
        out.push('(');
        write_expr(out, expr);
        out.push(')');
    } else {
        write_expr(out, expr);
    }
}

fn write_expr(out: &mut String, expr: &Expr) {
    match expr {
        Expr::Int(v) => {
            let _ = write!(out, "{v}");
        }
        Expr::Float { value, ty } => out.push_str(&float_literal(*value, *ty)),
        Expr::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Expr::Var(name) => out.push_str(name),
        Expr::Unary(op, operand) => {
            out.push_str(match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "!",
                UnaryOp::BitNot => "~",
                UnaryOp::Deref => "*",
                UnaryOp::AddressOf => "&",
                UnaryOp::PreIncrement => "++",
            });
            let mut inner = String::new();
            write_operand(&mut inner, operand, UNARY);
            // `- -x`, not `--x`.
            if matches!(op, UnaryOp::Neg) && inner.starts_with('-') {
                out.push(' ');
            }
            out.push_str(&inner);
        }
        Expr::Binary(op, lhs, rhs) => {
            let p = op.precedence();
            write_operand(out, lhs, p);
            let _ = write!(out, " {} ", op.symbol());
            write_operand(out, rhs, p - 1);
        }
        Expr::Assign(op, lhs, rhs) => {
            write_operand(out, lhs, UNARY);
            let _ = write!(out, " {} ", op.symbol());
            write_operand(out, rhs, ASSIGN);
        }
        Expr::Ternary(cond, then, otherwise) => {
            write_operand(out, cond, TERNARY - 1);
            out.push_str(" ? ");
            write_operand(out, then, TERNARY);
            out.push_str(" : ");
            write_operand(out, otherwise, TERNARY);
        }
        Expr::Call(name, args) => {
            out.push_str(name);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_operand(out, arg, ASSIGN);
            }
            out.push(')');
        }
        Expr::Cast(ty, value) => {
            let _ = write!(out, "({})", print_type(ty));
            write_operand(out, value, UNARY);
        }
        Expr::Index(base, index) => {
            write_operand(out, base, PRIMARY);
            out.push('[');
            write_expr(out, index);
            out.push(']');
        }
        Expr::Member(base, component) => {
            write_operand(out, base, PRIMARY);
            out.push('.');
            out.push_str(component);
        }
        Expr::Vector(ty, components) => {
            let _ = write!(out, "({})(", ty.name());
            for (i, c) in components.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_operand(out, c, ASSIGN);
            }
            out.push(')');
        }
    }
}

fn float_literal(value: f64, ty: BuiltinType) -> String {
    if value.is_nan() {
        return "NAN".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INFINITY" } else { "-INFINITY" }.to_owned();
    }
    match ty.component() {
        BuiltinType::Double => format!("{value:?}"),
        BuiltinType::Half => format!("{:?}h", value as f32),
        _ => format!("{:?}f", value as f32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clir::{BinaryOp, Block, KernelAttributes};

    #[test]
    fn precedence_parenthesizes() {
        let a = Expr::var("a");
        let b = Expr::var("b");
        let c = Expr::var("c");
        let sum = Expr::binary(BinaryOp::Add, a.clone(), b.clone());
        let prod = Expr::binary(BinaryOp::Mul, sum.clone(), c.clone());
        assert_eq!(print_expr(&prod), "(a + b) * c");
        let diff = Expr::binary(BinaryOp::Sub, a.clone(), sum);
        assert_eq!(print_expr(&diff), "a - (a + b)");
        let idx = (a + b * c).deref();
        assert_eq!(print_expr(&idx), "*(a + b * c)");
    }

    #[test]
    fn literals() {
        assert_eq!(print_expr(&Expr::float(1.0, BuiltinType::Float)), "1.0f");
        assert_eq!(print_expr(&Expr::float(0.5, BuiltinType::Double)), "0.5");
        assert_eq!(print_expr(&Expr::float(2.0, BuiltinType::Half)), "2.0h");
        assert_eq!(print_expr(&Expr::float(f64::NAN, BuiltinType::Float)), "NAN");
        let v = Expr::vector(
            BuiltinType::Float2,
            vec![Expr::float(1.0, BuiltinType::Float), Expr::float(-2.0, BuiltinType::Float)],
        );
        assert_eq!(print_expr(&v), "(float2)(1.0f, -2.0f)");
        let neg = Expr::binary(BinaryOp::Mul, Expr::var("x"), Expr::Int(-3));
        assert_eq!(print_expr(&neg), "x * -3");
        let twice = Expr::unary(UnaryOp::Neg, Expr::Int(-3));
        assert_eq!(print_expr(&twice), "- -3");
    }

    #[test]
    fn pointer_types() {
        let p = DataType::Builtin(BuiltinType::Float).pointer(Space::Global);
        assert_eq!(print_type(&p), "global float*");
        let pp = p.pointer(Space::Global);
        assert_eq!(print_type(&pp), "global float* global*");
        let atomic = DataType::Atomic(BuiltinType::Int).volatile_pointer(Space::Local);
        assert_eq!(print_type(&atomic), "volatile local atomic_int*");
    }

    #[test]
    fn nested_pointer_qualifiers_hug_the_star() {
        let entry = DataType::Builtin(BuiltinType::Long).pointer(Space::Global);
        assert_eq!(print_type(&entry.clone().pointer(Space::Private)), "global long**");
        assert_eq!(
            print_type(&entry.volatile_pointer(Space::Local)),
            "global long* volatile local*"
        );
    }

    #[test]
    fn kernel_with_loop() {
        let mut f = Function::new("copy");
        let a = f.param(DataType::from(BuiltinType::Float).pointer(Space::Global), "A");
        f.kernel = Some(KernelAttributes {
            work_group_size: [32, 1],
            subgroup_size: 16,
        });
        let mut body = Block::new();
        let mut inner = Block::new();
        inner.assign(a.index(Expr::var("i")), Expr::float(0.0, BuiltinType::Float));
        body.for_loop(BuiltinType::Long, "i", Expr::Int(0), Expr::Int(4), Expr::Int(1), inner, None);
        f.body = body.into_stmts();
        let text = print_function(&f);
        assert_eq!(
            text,
            "kernel __attribute__((reqd_work_group_size(32, 1, 1))) \
             __attribute__((intel_reqd_sub_group_size(16))) void copy(global float* A) {\n\
             \x20   for (long i = 0; i < 4; ++i) {\n\
             \x20       A[i] = 0.0f;\n\
             \x20   }\n\
             }\n"
        );
    }

    #[test]
    fn module_prints_pragmas_first() {
        let mut module = Module::default();
        module.extensions.insert("cl_khr_fp64".to_owned());
        module.functions.push(Function::new("f"));
        let text = print_module(&module);
        assert!(text.starts_with("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n\nvoid f() {\n}"));
    }
}
