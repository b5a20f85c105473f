//! Kernel-language AST.
//!
//! A small tree of OpenCL C types, expressions, statements and functions,
//! built by backends and turned into source text by [`crate::printer`].
//!
//! The arithmetic operators on [`Expr`] fold integer literals and the
//! additive and multiplicative identities. They are meant for index
//! arithmetic, where generated code for static shapes should come out as
//! plain numbers. Value arithmetic goes through [`Expr::binary`], which
//! never folds.

use std::collections::{BTreeSet, HashMap};
use std::ops;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Built-in OpenCL C scalar and vector types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinType {
    Void,
    Bool,
    Char,
    Uchar,
    Short,
    Ushort,
    Int,
    Uint,
    Long,
    Ulong,
    Half,
    Float,
    Double,
    Float2,
    Double2,
}

impl BuiltinType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Char => "char",
            Self::Uchar => "uchar",
            Self::Short => "short",
            Self::Ushort => "ushort",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Long => "long",
            Self::Ulong => "ulong",
            Self::Half => "half",
            Self::Float => "float",
            Self::Double => "double",
            Self::Float2 => "float2",
            Self::Double2 => "double2",
        }
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Self::Float2 | Self::Double2)
    }

    /// Component type of a vector type, the type itself otherwise.
    pub fn component(self) -> Self {
        match self {
            Self::Float2 => Self::Float,
            Self::Double2 => Self::Double,
            other => other,
        }
    }
}

/// OpenCL address space qualifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Space {
    #[default]
    Private,
    Global,
    Local,
}

impl Space {
    /// Qualifier keyword; empty for private memory.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Private => "",
            Self::Global => "global",
            Self::Local => "local",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Builtin(BuiltinType),
    /// `atomic_int`, `atomic_float`, ...
    Atomic(BuiltinType),
    Pointer {
        pointee: Box<DataType>,
        space: Space,
        volatile: bool,
    },
}

impl DataType {
    /// Pointer to `self` in `space`.
    pub fn pointer(self, space: Space) -> Self {
        Self::Pointer {
            pointee: Box::new(self),
            space,
            volatile: false,
        }
    }

    /// Volatile pointer to `self` in `space`, as taken by the atomic builtins.
    pub fn volatile_pointer(self, space: Space) -> Self {
        Self::Pointer {
            pointee: Box::new(self),
            space,
            volatile: true,
        }
    }

    pub fn as_builtin(&self) -> Option<BuiltinType> {
        match self {
            Self::Builtin(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<BuiltinType> for DataType {
    fn from(ty: BuiltinType) -> Self {
        Self::Builtin(ty)
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Deref,
    AddressOf,
    PreIncrement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::BitAnd => "&",
            Self::BitXor => "^",
            Self::BitOr => "|",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    /// C precedence level; lower binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Mul | Self::Div | Self::Rem => 3,
            Self::Add | Self::Sub => 4,
            Self::Shl | Self::Shr => 5,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 6,
            Self::Eq | Self::Ne => 7,
            Self::BitAnd => 8,
            Self::BitXor => 9,
            Self::BitOr => 10,
            Self::And => 11,
            Self::Or => 12,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Assign => "=",
            Self::Add => "+=",
            Self::Sub => "-=",
            Self::Mul => "*=",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Int(i64),
    Float { value: f64, ty: BuiltinType },
    Bool(bool),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Assign(AssignOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Cast(DataType, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    /// Vector component access (`.s0`, `.s1`).
    Member(Box<Expr>, &'static str),
    /// Vector literal `(float2)(a, b)`.
    Vector(BuiltinType, Vec<Expr>),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    pub fn float(value: f64, ty: BuiltinType) -> Self {
        Self::Float { value, ty }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::Call(name.into(), args)
    }

    pub fn cast(ty: impl Into<DataType>, value: Expr) -> Self {
        Self::Cast(ty.into(), Box::new(value))
    }

    /// Non-folding binary expression.
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Self::Unary(op, Box::new(operand))
    }

    pub fn ternary(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Self::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    pub fn vector(ty: BuiltinType, components: Vec<Expr>) -> Self {
        Self::Vector(ty, components)
    }

    /// Integer value if this is an integer literal.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn index(self, index: Expr) -> Self {
        Self::Index(Box::new(self), Box::new(index))
    }

    pub fn member(self, component: &'static str) -> Self {
        Self::Member(Box::new(self), component)
    }

    /// Real part of a complex value.
    pub fn re(self) -> Self {
        self.member("s0")
    }

    /// Imaginary part of a complex value.
    pub fn im(self) -> Self {
        self.member("s1")
    }

    pub fn deref(self) -> Self {
        match self {
            Self::Unary(UnaryOp::AddressOf, inner) => *inner,
            other => Self::unary(UnaryOp::Deref, other),
        }
    }

    pub fn address_of(self) -> Self {
        match self {
            Self::Unary(UnaryOp::Deref, inner) => *inner,
            other => Self::unary(UnaryOp::AddressOf, other),
        }
    }

    pub fn pre_increment(self) -> Self {
        Self::unary(UnaryOp::PreIncrement, self)
    }

    pub fn assign(self, value: Expr) -> Self {
        Self::Assign(AssignOp::Assign, Box::new(self), Box::new(value))
    }

    pub fn add_assign(self, value: Expr) -> Self {
        Self::Assign(AssignOp::Add, Box::new(self), Box::new(value))
    }

    pub fn mul_assign(self, value: Expr) -> Self {
        Self::Assign(AssignOp::Mul, Box::new(self), Box::new(value))
    }

    fn compare(self, op: BinaryOp, rhs: Expr, fold: fn(i64, i64) -> bool) -> Self {
        match (self.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => Self::Bool(fold(a, b)),
            _ => Self::binary(op, self, rhs),
        }
    }

    pub fn lt(self, rhs: Expr) -> Self {
        self.compare(BinaryOp::Lt, rhs, |a, b| a < b)
    }

    pub fn le(self, rhs: Expr) -> Self {
        self.compare(BinaryOp::Le, rhs, |a, b| a <= b)
    }

    pub fn gt(self, rhs: Expr) -> Self {
        self.compare(BinaryOp::Gt, rhs, |a, b| a > b)
    }

    pub fn ge(self, rhs: Expr) -> Self {
        self.compare(BinaryOp::Ge, rhs, |a, b| a >= b)
    }

    pub fn eq(self, rhs: Expr) -> Self {
        self.compare(BinaryOp::Eq, rhs, |a, b| a == b)
    }

    pub fn ne(self, rhs: Expr) -> Self {
        self.compare(BinaryOp::Ne, rhs, |a, b| a != b)
    }

    /// Logical and, folding boolean literals.
    pub fn and(self, rhs: Expr) -> Self {
        match (self.as_bool(), rhs.as_bool()) {
            (Some(false), _) | (_, Some(false)) => Self::Bool(false),
            (Some(true), _) => rhs,
            (_, Some(true)) => self,
            _ => Self::binary(BinaryOp::And, self, rhs),
        }
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        match (self.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => Expr::Int(a.wrapping_add(b)),
            (Some(0), _) => rhs,
            (_, Some(0)) => self,
            _ => Expr::binary(BinaryOp::Add, self, rhs),
        }
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        match (self.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => Expr::Int(a.wrapping_sub(b)),
            (_, Some(0)) => self,
            _ => Expr::binary(BinaryOp::Sub, self, rhs),
        }
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        match (self.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => Expr::Int(a.wrapping_mul(b)),
            (Some(0), _) | (_, Some(0)) => Expr::Int(0),
            (Some(1), _) => rhs,
            (_, Some(1)) => self,
            _ => Expr::binary(BinaryOp::Mul, self, rhs),
        }
    }
}

impl ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        match (self.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) if b != 0 => Expr::Int(a.wrapping_div(b)),
            (_, Some(1)) => self,
            _ => Expr::binary(BinaryOp::Div, self, rhs),
        }
    }
}

impl ops::Rem for Expr {
    type Output = Expr;

    fn rem(self, rhs: Expr) -> Expr {
        match (self.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) if b != 0 => Expr::Int(a.wrapping_rem(b)),
            (_, Some(1)) => Expr::Int(0),
            _ => Expr::binary(BinaryOp::Rem, self, rhs),
        }
    }
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        match self {
            Expr::Int(v) => Expr::Int(v.wrapping_neg()),
            Expr::Float { value, ty } => Expr::Float { value: -value, ty },
            other => Expr::unary(UnaryOp::Neg, other),
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Declaration {
    pub ty: DataType,
    pub name: String,
    /// Address space qualifier of the variable itself (`local uchar stack[...]`).
    pub space: Space,
    pub array: Option<i64>,
    pub init: Option<Expr>,
    pub aligned: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Decl(Declaration),
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    For {
        init: Box<Stmt>,
        cond: Expr,
        step: Expr,
        body: Vec<Stmt>,
        unroll: Option<u32>,
    },
    DoWhile {
        body: Vec<Stmt>,
        cond: Expr,
    },
    Return(Option<Expr>),
}

/// Statement list under construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    stmts: Vec<Stmt>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    pub fn extend(&mut self, stmts: impl IntoIterator<Item = Stmt>) {
        self.stmts.extend(stmts);
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// `ty name = init;`, returning the variable.
    pub fn declare_assign(&mut self, ty: impl Into<DataType>, name: impl Into<String>, init: Expr) -> Expr {
        let name = name.into();
        self.stmts.push(Stmt::Decl(Declaration {
            ty: ty.into(),
            name: name.clone(),
            space: Space::Private,
            array: None,
            init: Some(init),
            aligned: None,
        }));
        Expr::Var(name)
    }

    /// `ty name;`, returning the variable.
    pub fn declare(&mut self, ty: impl Into<DataType>, name: impl Into<String>) -> Expr {
        let name = name.into();
        self.stmts.push(Stmt::Decl(Declaration {
            ty: ty.into(),
            name: name.clone(),
            space: Space::Private,
            array: None,
            init: None,
            aligned: None,
        }));
        Expr::Var(name)
    }

    /// `ty name[len];`, returning the array variable.
    pub fn declare_array(&mut self, ty: impl Into<DataType>, name: impl Into<String>, len: i64) -> Expr {
        let name = name.into();
        self.stmts.push(Stmt::Decl(Declaration {
            ty: ty.into(),
            name: name.clone(),
            space: Space::Private,
            array: Some(len),
            init: None,
            aligned: None,
        }));
        Expr::Var(name)
    }

    pub fn expr(&mut self, expr: Expr) {
        self.stmts.push(Stmt::Expr(expr));
    }

    pub fn assign(&mut self, lhs: Expr, rhs: Expr) {
        self.expr(lhs.assign(rhs));
    }

    /// `if (cond) { then }`; a literal condition selects statically.
    pub fn if_then(&mut self, cond: Expr, then: Block) {
        self.if_else(cond, then, Block::new());
    }

    pub fn if_else(&mut self, cond: Expr, then: Block, otherwise: Block) {
        match cond.as_bool() {
            Some(true) => self.stmts.extend(then.stmts),
            Some(false) => self.stmts.extend(otherwise.stmts),
            None if then.is_empty() && otherwise.is_empty() => {}
            None => self.stmts.push(Stmt::If {
                cond,
                then: then.stmts,
                otherwise: otherwise.stmts,
            }),
        }
    }

    /// `for (ty var = from; var < to; step) { body }`.
    pub fn for_loop(
        &mut self,
        ty: impl Into<DataType>,
        var: &str,
        from: Expr,
        to: Expr,
        step: Expr,
        body: Block,
        unroll: Option<u32>,
    ) {
        if to.as_int().zip(from.as_int()).is_some_and(|(to, from)| to <= from) {
            return;
        }
        let iv = Expr::var(var);
        let step = match step.as_int() {
            Some(1) => iv.clone().pre_increment(),
            _ => iv.clone().add_assign(step),
        };
        self.stmts.push(Stmt::For {
            init: Box::new(Stmt::Decl(Declaration {
                ty: ty.into(),
                name: var.to_owned(),
                space: Space::Private,
                array: None,
                init: Some(from),
                aligned: None,
            })),
            cond: iv.lt(to),
            step,
            body: body.stmts,
            unroll,
        });
    }

    /// Wraps the statements in a nested `{ ... }` scope.
    pub fn scope(&mut self, inner: Block) {
        if !inner.is_empty() {
            self.stmts.push(Stmt::Block(inner.stmts));
        }
    }

    pub fn into_stmts(self) -> Vec<Stmt> {
        self.stmts
    }
}

// ---------------------------------------------------------------------------
// Functions and modules
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub ty: DataType,
    pub name: String,
}

/// Attributes that turn a function into a kernel entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelAttributes {
    pub work_group_size: [u32; 2],
    pub subgroup_size: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub ret: DataType,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub kernel: Option<KernelAttributes>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ret: DataType::Builtin(BuiltinType::Void),
            params: Vec::new(),
            body: Vec::new(),
            kernel: None,
        }
    }

    /// Appends a parameter and returns it as a variable.
    pub fn param(&mut self, ty: impl Into<DataType>, name: impl Into<String>) -> Expr {
        let name = name.into();
        self.params.push(Param {
            ty: ty.into(),
            name: name.clone(),
        });
        Expr::Var(name)
    }
}

/// A translation unit: extension pragmas and functions in definition order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub extensions: BTreeSet<String>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

const KEYWORDS: &[&str] = &[
    "bool", "break", "char", "const", "constant", "continue", "do", "double", "else", "float",
    "for", "global", "half", "if", "int", "kernel", "local", "long", "private", "return", "short",
    "uchar", "uint", "ulong", "ushort", "void", "volatile", "while",
];

/// Hands out identifiers unique within one function.
#[derive(Clone, Debug)]
pub struct Namer {
    used: HashMap<String, u32>,
}

impl Default for Namer {
    fn default() -> Self {
        Self::new()
    }
}

impl Namer {
    pub fn new() -> Self {
        Self {
            used: KEYWORDS.iter().map(|k| ((*k).to_owned(), 0)).collect(),
        }
    }

    /// A fresh identifier derived from `hint`: `hint`, `hint1`, `hint2`, ...
    pub fn fresh(&mut self, hint: &str) -> String {
        let base = sanitize(hint);
        if !self.used.contains_key(&base) {
            self.used.insert(base.clone(), 0);
            return base;
        }
        loop {
            let candidate = {
                let count = self.used.entry(base.clone()).or_insert(0);
                *count += 1;
                format!("{base}{count}")
            };
            if !self.used.contains_key(&candidate) {
                self.used.insert(candidate.clone(), 0);
                return candidate;
            }
        }
    }
}

/// Maps `hint` onto a valid C identifier.
pub fn sanitize(hint: &str) -> String {
    let mut name: String = hint
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert(0, 'x');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic_folds_literals() {
        let e = Expr::Int(4) * Expr::Int(3) + Expr::Int(2);
        assert_eq!(e, Expr::Int(14));
        let n = Expr::var("n");
        assert_eq!(n.clone() * Expr::Int(1), n);
        assert_eq!(n.clone() + Expr::Int(0), n);
        assert_eq!(n.clone() * Expr::Int(0), Expr::Int(0));
        assert_eq!(Expr::Int(37) % Expr::Int(16), Expr::Int(5));
    }

    #[test]
    fn comparisons_fold_to_bool() {
        assert_eq!(Expr::Int(2).lt(Expr::Int(3)), Expr::Bool(true));
        assert_eq!(Expr::Int(0).gt(Expr::Int(0)), Expr::Bool(false));
        assert!(matches!(
            Expr::var("m").lt(Expr::Int(5)),
            Expr::Binary(BinaryOp::Lt, ..)
        ));
        assert_eq!(
            Expr::Bool(true).and(Expr::var("x")),
            Expr::var("x")
        );
    }

    #[test]
    fn deref_of_address_cancels() {
        let p = Expr::var("p");
        assert_eq!(p.clone().address_of().deref(), p);
    }

    #[test]
    fn static_if_is_resolved() {
        let mut then = Block::new();
        then.expr(Expr::call("f", vec![]));
        let mut bb = Block::new();
        bb.if_then(Expr::Bool(false), then.clone());
        assert!(bb.is_empty());
        bb.if_then(Expr::Bool(true), then);
        assert_eq!(bb.into_stmts().len(), 1);
    }

    #[test]
    fn empty_static_loop_is_dropped() {
        let mut bb = Block::new();
        bb.for_loop(BuiltinType::Long, "i", Expr::Int(8), Expr::Int(8), Expr::Int(1), Block::new(), None);
        assert!(bb.is_empty());
    }

    #[test]
    fn namer_avoids_keywords_and_duplicates() {
        let mut namer = Namer::new();
        assert_eq!(namer.fresh("A"), "A");
        assert_eq!(namer.fresh("A"), "A1");
        assert_eq!(namer.fresh("float"), "float1");
        assert_eq!(namer.fresh("0tmp"), "x0tmp");
        assert_eq!(namer.fresh("a.b"), "a_b");
    }
}
