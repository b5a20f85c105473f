//! Display implementations and text dump for debugging.

use std::fmt::{self, Write as _};

use crate::Program;
use crate::arena::Handle;
use crate::func::Function;
use crate::inst::{Extent, Op, Slice, StoreFlag};
use crate::region::Region;
use crate::types::{AddressSpaces, Type, TypeContext, is_dynamic_value};
use crate::value::Value;

fn extent(v: i64) -> String {
    if is_dynamic_value(v) {
        "?".to_string()
    } else {
        v.to_string()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(v) => write!(f, "{v}"),
            Self::Dynamic => write!(f, "?"),
            Self::Infer => write!(f, "*"),
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(offset) => write!(f, "{offset}"),
            Self::Range { offset, size } => write!(f, "{offset}:{size}"),
        }
    }
}

impl fmt::Display for AddressSpaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.iter().map(|s| s.to_string()).collect();
        f.write_str(&names.join("|"))
    }
}

/// Formats a type in the textual IR syntax.
pub fn format_type(ty: &Type, types: &TypeContext) -> String {
    match ty {
        Type::Void => "void".to_string(),
        Type::Bool => "bool".to_string(),
        Type::Scalar(s) => s.to_string(),
        Type::Memref(mr) => {
            let mut out = format!("memref<{}", mr.element);
            for &s in &mr.shape {
                out.push('x');
                out.push_str(&extent(s));
            }
            if mr.stride != crate::types::MemrefType::canonical_stride(&mr.shape) {
                let strides: Vec<_> = mr.stride.iter().map(|&s| extent(s)).collect();
                out.push_str(&format!(",strided<{}>", strides.join(",")));
            }
            if mr.addrspace != crate::types::AddressSpace::Global {
                out.push_str(&format!(",{}", mr.addrspace));
            }
            out.push('>');
            out
        }
        Type::Group(g) => {
            let mut out = format!(
                "group<{}x{}",
                format_type(types.get(g.memref), types),
                extent(g.size)
            );
            if g.offset != 0 {
                out.push_str(&format!(", offset: {}", extent(g.offset)));
            }
            out.push('>');
            out
        }
        Type::CoopMatrix(cm) => format!(
            "coopmatrix<{}x{}x{},{}>",
            cm.component, cm.rows, cm.cols, cm.usage
        ),
    }
}

struct Printer<'a> {
    func: &'a Function,
    types: &'a TypeContext,
    out: String,
}

impl Printer<'_> {
    fn name(&self, value: Handle<Value>) -> String {
        match &self.func.value(value).name {
            Some(name) => format!("%{name}"),
            None => format!("%{}", value.index()),
        }
    }

    fn names(&self, values: &[Handle<Value>]) -> String {
        values
            .iter()
            .map(|&v| self.name(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn ty(&self, value: Handle<Value>) -> String {
        format_type(self.types.get(self.func.value_type(value)), self.types)
    }

    fn indent(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
    }

    fn region(&mut self, region: &Region, depth: usize) {
        for &inst in &region.insts {
            self.inst(inst, depth);
        }
    }

    fn inst(&mut self, handle: Handle<crate::inst::Inst>, depth: usize) {
        let func = self.func;
        let inst = func.inst(handle);
        self.indent(depth);
        if !inst.results().is_empty() {
            let results = self.names(inst.results());
            let _ = write!(self.out, "{results} = ");
        }
        let ops = inst.operands();
        let line = match &inst.op {
            Op::Constant(c) => format!("constant {c} : {}", self.ty(ops_result(inst))),
            Op::Cast => format!(
                "cast {} : {} -> {}",
                self.name(ops[0]),
                self.ty(ops[0]),
                self.ty(ops_result(inst))
            ),
            Op::Store(flag) => {
                let flag = match flag {
                    StoreFlag::Regular => "",
                    StoreFlag::Atomic => ".atomic",
                    StoreFlag::AtomicAdd => ".atomic_add",
                };
                format!(
                    "store{flag} {}, {}[{}]",
                    self.name(ops[0]),
                    self.name(ops[1]),
                    self.names(&ops[2..])
                )
            }
            Op::Load => format!(
                "load {}[{}] : {}",
                self.name(ops[0]),
                self.names(&ops[1..]),
                self.ty(ops_result(inst))
            ),
            Op::Subview { slices } => {
                let slices: Vec<_> = slices.iter().map(Slice::to_string).collect();
                format!(
                    "subview {}[{}] ({}) : {}",
                    self.name(ops[0]),
                    slices.join(","),
                    self.names(&ops[1..]),
                    self.ty(ops_result(inst))
                )
            }
            Op::Expand { mode, shape } => {
                let shape: Vec<_> = shape.iter().map(Extent::to_string).collect();
                format!(
                    "expand {}[{mode}->{}] ({}) : {}",
                    self.name(ops[0]),
                    shape.join("x"),
                    self.names(&ops[1..]),
                    self.ty(ops_result(inst))
                )
            }
            Op::Fuse { from, to } => format!(
                "fuse {}[{from},{to}] : {}",
                self.name(ops[0]),
                self.ty(ops_result(inst))
            ),
            Op::Size { mode } => format!("size {}[{mode}]", self.name(ops[0])),
            Op::Alloca { stack_ptr } => match stack_ptr {
                Some(ptr) => format!("alloca @{ptr} : {}", self.ty(ops_result(inst))),
                None => format!("alloca : {}", self.ty(ops_result(inst))),
            },
            Op::Barrier(fence) if fence.is_empty() => "barrier".to_string(),
            Op::Barrier(fence) => format!("barrier.{fence}"),
            Op::Gemm {
                atomic,
                trans_a,
                trans_b,
            } => format!(
                "gemm{}.{}.{} {}",
                atomic_suffix(*atomic),
                trans_a.mnemonic(),
                trans_b.mnemonic(),
                self.names(ops)
            ),
            Op::Axpby { atomic, trans_a }
            | Op::Gemv { atomic, trans_a }
            | Op::Sum { atomic, trans_a } => format!(
                "{}{}.{} {}",
                inst.op.mnemonic(),
                atomic_suffix(*atomic),
                trans_a.mnemonic(),
                self.names(ops)
            ),
            Op::Ger { atomic } | Op::Hadamard { atomic } => format!(
                "{}{} {}",
                inst.op.mnemonic(),
                atomic_suffix(*atomic),
                self.names(ops)
            ),
            Op::For { .. } => {
                let params = &inst.regions[0].params;
                let (from, to) = (ops[0], ops[1]);
                let step = inst.loop_bounds().and_then(|(_, _, step)| step);
                let mut line = format!(
                    "for {} = {}, {}",
                    self.name(params[0]),
                    self.name(from),
                    self.name(to)
                );
                if let Some(step) = step {
                    let _ = write!(line, ", {}", self.name(step));
                }
                let init = inst.loop_init();
                if !init.is_empty() {
                    let carried: Vec<_> = params[1..]
                        .iter()
                        .zip(init)
                        .map(|(&p, &i)| format!("{}={}", self.name(p), self.name(i)))
                        .collect();
                    let _ = write!(line, " init({})", carried.join(", "));
                }
                line
            }
            Op::Foreach { .. } => {
                let n = ops.len() / 2;
                format!(
                    "foreach ({}) = ({}), ({})",
                    self.names(&inst.regions[0].params),
                    self.names(&ops[..n]),
                    self.names(&ops[n..])
                )
            }
            op => {
                if ops.is_empty() {
                    op.mnemonic().to_string()
                } else {
                    format!("{} {}", op.mnemonic(), self.names(ops))
                }
            }
        };
        self.out.push_str(&line);
        if inst.regions.is_empty() {
            self.out.push('\n');
            return;
        }
        for (i, region) in inst.regions.iter().enumerate() {
            if i > 0 {
                self.out.push_str(" else");
            }
            self.out.push_str(" {\n");
            self.region(region, depth + 1);
            self.indent(depth);
            self.out.push('}');
        }
        self.out.push('\n');
    }
}

fn ops_result(inst: &crate::inst::Inst) -> Handle<Value> {
    inst.results()[0]
}

fn atomic_suffix(atomic: bool) -> &'static str {
    if atomic { ".atomic" } else { "" }
}

/// Dumps one function in the textual IR syntax.
pub fn dump_function(func: &Function, types: &TypeContext) -> String {
    let mut printer = Printer {
        func,
        types,
        out: String::new(),
    };
    let params: Vec<_> = func
        .params
        .iter()
        .map(|&p| format!("{}: {}", printer.name(p), printer.ty(p)))
        .collect();
    let _ = write!(printer.out, "func @{}({})", func.name, params.join(", "));
    if func.subgroup_size != 0 {
        let _ = write!(printer.out, " subgroup_size({})", func.subgroup_size);
    }
    if func.work_group_size != [0, 0] {
        let [x, y] = func.work_group_size;
        let _ = write!(printer.out, " work_group_size({x},{y})");
    }
    printer.out.push_str(" {\n");
    printer.region(&func.body, 1);
    printer.out.push_str("}\n");
    printer.out
}

/// Dumps every function of `program`.
pub fn dump_program(program: &Program) -> String {
    program
        .functions
        .iter()
        .map(|f| dump_function(f, &program.types))
        .collect::<Vec<_>>()
        .join("\n")
}
