//! The compiler's input tree.
//!
//! The tree is produced by [`crate::parse`] from the ruff syntax tree. It is a
//! simplified form: `elif` chains are folded into nested `If` statements,
//! class-private names are already mangled, and every scope-introducing node
//! carries the [`ScopeId`] the scope analyzer and the compiler agree on.

use num_bigint::BigInt;

use crate::location::CodeRange;

/// Identifies a lexical scope. The module is always scope 0; nested scopes are
/// numbered in source order as the parser encounters them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const MODULE: Self = Self(0);

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A name together with the range it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub name: String,
    pub position: CodeRange,
}

impl Identifier {
    #[must_use]
    pub fn new(name: impl Into<String>, position: CodeRange) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }
}

/// A constant written directly in the source.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Ellipsis,
    None,
    Bool(bool),
    Int(i64),
    /// Integer literal that does not fit in an `i64`.
    BigInt(BigInt),
    Float(f64),
    /// Imaginary literal such as `2j`; `real` is always zero from the parser.
    Complex { real: f64, imag: f64 },
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    FloorDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Invert,
    UAdd,
    USub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

/// An expression and its source range.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprLoc {
    pub position: CodeRange,
    pub expr: Expr,
}

impl ExprLoc {
    #[must_use]
    pub fn new(position: CodeRange, expr: Expr) -> Self {
        Self { position, expr }
    }

    /// Whether the expression is a string literal, i.e. a docstring candidate.
    #[must_use]
    pub fn is_str_literal(&self) -> bool {
        matches!(self.expr, Expr::Literal(Literal::Str(_)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Name(String),
    /// `a and b and c`, kept flat.
    BoolOp {
        op: BoolOperator,
        values: Vec<ExprLoc>,
    },
    Op {
        left: Box<ExprLoc>,
        op: Operator,
        right: Box<ExprLoc>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<ExprLoc>,
    },
    /// `left op0 c0 op1 c1 ...`
    Compare {
        left: Box<ExprLoc>,
        comparisons: Vec<(CmpOperator, ExprLoc)>,
    },
    Call {
        func: Box<ExprLoc>,
        /// Positional arguments; `*xs` appears as `Expr::Starred`.
        args: Vec<ExprLoc>,
        keywords: Vec<Keyword>,
    },
    Attribute {
        value: Box<ExprLoc>,
        attr: String,
    },
    Subscript {
        value: Box<ExprLoc>,
        slice: Box<ExprLoc>,
    },
    Slice {
        lower: Option<Box<ExprLoc>>,
        upper: Option<Box<ExprLoc>>,
        step: Option<Box<ExprLoc>>,
    },
    Starred(Box<ExprLoc>),
    List(Vec<ExprLoc>),
    Tuple(Vec<ExprLoc>),
    Set(Vec<ExprLoc>),
    Dict(Vec<DictItem>),
    IfElse {
        test: Box<ExprLoc>,
        body: Box<ExprLoc>,
        orelse: Box<ExprLoc>,
    },
    /// `target := value`
    Named {
        target: Identifier,
        value: Box<ExprLoc>,
    },
    Lambda(Box<Lambda>),
    Comp(Box<Comp>),
}

/// One entry of a dict display; `key` is `None` for `**mapping`.
#[derive(Debug, Clone, PartialEq)]
pub struct DictItem {
    pub key: Option<ExprLoc>,
    pub value: ExprLoc,
}

/// A keyword argument; `arg` is `None` for `**mapping`.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub arg: Option<Identifier>,
    pub value: ExprLoc,
    pub position: CodeRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub scope: ScopeId,
    pub params: Parameters,
    pub body: ExprLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompKind {
    List,
    Set,
    Dict,
}

/// A list, set or dict comprehension. Each is compiled as its own code unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Comp {
    pub scope: ScopeId,
    pub kind: CompKind,
    /// The element, or the key for dict comprehensions.
    pub element: ExprLoc,
    /// The value, for dict comprehensions only.
    pub value: Option<ExprLoc>,
    /// At least one generator.
    pub generators: Vec<Comprehension>,
}

/// One `for target in iter if cond...` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub target: ExprLoc,
    pub iter: ExprLoc,
    pub ifs: Vec<ExprLoc>,
}

/// A parameter and its default value.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Identifier,
    pub default: Option<ExprLoc>,
}

/// A function or lambda signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    pub posonly: Vec<Param>,
    pub args: Vec<Param>,
    pub vararg: Option<Identifier>,
    pub kwonly: Vec<Param>,
    pub kwarg: Option<Identifier>,
}

impl Parameters {
    /// Parameter identifiers in slot order: posonly, args, `*args`, kwonly, `**kwargs`.
    pub fn identifiers(&self) -> impl Iterator<Item = &Identifier> {
        self.posonly
            .iter()
            .chain(&self.args)
            .map(|p| &p.name)
            .chain(self.vararg.iter())
            .chain(self.kwonly.iter().map(|p| &p.name))
            .chain(self.kwarg.iter())
    }

    /// Defaults of positional parameters, in order.
    pub fn positional_defaults(&self) -> impl Iterator<Item = &ExprLoc> {
        self.posonly.iter().chain(&self.args).filter_map(|p| p.default.as_ref())
    }

    /// Keyword-only parameters that have a default.
    pub fn kwonly_defaults(&self) -> impl Iterator<Item = (&Identifier, &ExprLoc)> {
        self.kwonly
            .iter()
            .filter_map(|p| p.default.as_ref().map(|default| (&p.name, default)))
    }
}

/// A statement and its source range.
#[derive(Debug, Clone, PartialEq)]
pub struct StmtLoc {
    pub position: CodeRange,
    pub stmt: Stmt,
}

impl StmtLoc {
    #[must_use]
    pub fn new(position: CodeRange, stmt: Stmt) -> Self {
        Self { position, stmt }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Pass,
    Break,
    Continue,
    Expr(ExprLoc),
    Return(Option<ExprLoc>),
    Raise {
        exc: Option<ExprLoc>,
        cause: Option<ExprLoc>,
    },
    Assert {
        test: ExprLoc,
        msg: Option<ExprLoc>,
    },
    /// `t0 = t1 = ... = value`
    Assign {
        targets: Vec<ExprLoc>,
        value: ExprLoc,
    },
    AugAssign {
        target: ExprLoc,
        op: Operator,
        value: ExprLoc,
    },
    Delete(Vec<ExprLoc>),
    For {
        target: ExprLoc,
        iter: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    While {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    If {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<StmtLoc>,
    },
    Try(Box<Try>),
    FunctionDef(Box<FunctionDef>),
    ClassDef(Box<ClassDef>),
    Global(Vec<Identifier>),
    Nonlocal(Vec<Identifier>),
    Import(Vec<Alias>),
    ImportFrom {
        /// `None` for `from . import x`.
        module: Option<String>,
        names: Vec<Alias>,
        level: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    pub context: ExprLoc,
    pub target: Option<ExprLoc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Try {
    pub body: Vec<StmtLoc>,
    pub handlers: Vec<ExceptHandler>,
    pub orelse: Vec<StmtLoc>,
    pub finalbody: Vec<StmtLoc>,
}

/// An `except [type [as name]]:` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub position: CodeRange,
    pub exc_type: Option<ExprLoc>,
    pub name: Option<Identifier>,
    pub body: Vec<StmtLoc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub scope: ScopeId,
    /// The name as written, used for `__name__`.
    pub name: String,
    /// The (possibly mangled) name the function is stored under.
    pub binding: Identifier,
    pub params: Parameters,
    pub body: Vec<StmtLoc>,
    pub decorators: Vec<ExprLoc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub scope: ScopeId,
    pub name: String,
    pub binding: Identifier,
    pub bases: Vec<ExprLoc>,
    pub keywords: Vec<Keyword>,
    pub body: Vec<StmtLoc>,
    pub decorators: Vec<ExprLoc>,
}

/// `name [as asname]` in an import statement. `name` may be dotted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
    pub position: CodeRange,
}

/// A parsed module.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub body: Vec<StmtLoc>,
    /// Number of scopes allocated, including the module itself.
    pub scope_count: u32,
    /// Range covering the whole source.
    pub position: CodeRange,
}
