//! AST Node Types
//!
//! Typed syntax tree produced by the parser. Every node carries the
//! source position it came from so the interpreter can report precise
//! runtime errors. Function bodies are `Rc`-shared: a closure keeps its
//! body alive after the program that defined it has been dropped.

use std::rc::Rc;

/// Source position of a token or node (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

impl Span {
    pub fn new(line: usize, col: usize) -> Self {
        Self { line, col }
    }
}

/// A parsed program: the statements plus the source name they came from.
#[derive(Debug)]
pub struct Program {
    pub source_name: Rc<str>,
    pub body: Vec<Stmt>,
}

pub type Block = Vec<Stmt>;

/// One function parameter, with an optional default expression.
#[derive(Debug)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// A function declaration shared by `fn` statements and `fn` literals.
#[derive(Debug)]
pub struct FuncDecl {
    pub name: Option<String>,
    pub params: Vec<Param>,
    /// Rest parameter (`...name`) collecting extra arguments as a list.
    pub rest: Option<String>,
    pub body: Rc<Block>,
    pub is_async: bool,
    pub is_generator: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Coalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

/// The left-hand side of an assignment statement.
#[derive(Debug)]
pub enum AssignTarget {
    Name(String),
    Index { target: Expr, index: Expr },
    Field { target: Expr, name: String },
}

/// Binding pattern for `let`/`const`.
#[derive(Debug)]
pub enum LetPattern {
    Name(String),
    /// `[a, b]` binds positionally from a list.
    List(Vec<String>),
    /// `{k, k2: local}` binds from map keys.
    Map(Vec<(String, String)>),
}

/// Pattern in a `match` arm.
#[derive(Debug)]
pub enum Pattern {
    /// Literal pattern compared with `==`.
    Literal(Expr),
    Wildcard,
    /// Binds the scrutinee to a name.
    Binding(String),
    /// `[a, b]` requires a list of exactly that length.
    List(Vec<Pattern>),
    /// `{k, k2: local}` requires a map containing the named keys.
    Map(Vec<(String, Pattern)>),
}

#[derive(Debug)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub value: Expr,
    pub span: Span,
}

/// One name in an `import { a, b as c }` list: (exported, local).
#[derive(Debug)]
pub struct ImportName {
    pub export: String,
    pub local: String,
}

#[derive(Debug)]
pub enum Expr {
    Int(i64, Span),
    Float(f64, Span),
    Str(Rc<str>, Span),
    Bool(bool, Span),
    Nil(Span),
    /// Interpolated string: literal parts and embedded expressions, in order.
    Interp { parts: Vec<Expr>, span: Span },
    Ident { name: String, span: Span },
    /// List literal; items may be `Spread`.
    List { items: Vec<Expr>, span: Span },
    /// Map literal with string keys in source order.
    MapLit { entries: Vec<(String, Expr)>, span: Span },
    /// `...expr` inside a list literal or call argument list.
    Spread { expr: Box<Expr>, span: Span },
    Unary { op: UnaryOp, expr: Box<Expr>, span: Span },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr>, span: Span },
    Range { start: Box<Expr>, end: Box<Expr>, inclusive: bool, span: Span },
    Ternary { cond: Box<Expr>, then_expr: Box<Expr>, else_expr: Box<Expr>, span: Span },
    Index { target: Box<Expr>, index: Box<Expr>, span: Span },
    /// `target.name`; `optional` is true for `?.`.
    Field { target: Box<Expr>, name: String, optional: bool, span: Span },
    /// `target.name(args)`; method dispatch is first-class.
    MethodCall { target: Box<Expr>, method: String, args: Vec<Expr>, span: Span },
    Call { callee: Box<Expr>, args: Vec<Expr>, span: Span },
    FuncLit { decl: Rc<FuncDecl>, span: Span },
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
        default: Option<Box<Expr>>,
        span: Span,
    },
    Await { expr: Box<Expr>, span: Span },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Int(_, s)
            | Expr::Float(_, s)
            | Expr::Str(_, s)
            | Expr::Bool(_, s)
            | Expr::Nil(s) => *s,
            Expr::Interp { span, .. }
            | Expr::Ident { span, .. }
            | Expr::List { span, .. }
            | Expr::MapLit { span, .. }
            | Expr::Spread { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Range { span, .. }
            | Expr::Ternary { span, .. }
            | Expr::Index { span, .. }
            | Expr::Field { span, .. }
            | Expr::MethodCall { span, .. }
            | Expr::Call { span, .. }
            | Expr::FuncLit { span, .. }
            | Expr::Match { span, .. }
            | Expr::Await { span, .. } => *span,
        }
    }
}

#[derive(Debug)]
pub enum Stmt {
    Expr(Expr),
    Let {
        pattern: LetPattern,
        init: Option<Expr>,
        is_const: bool,
        span: Span,
    },
    Assign {
        target: AssignTarget,
        op: AssignOp,
        value: Expr,
        span: Span,
    },
    Block(Block, Span),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    ForIn {
        /// Loop variable; with a second name, lists yield (index, value)
        /// and maps yield (key, value).
        name: String,
        name2: Option<String>,
        iterable: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    ForC {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        incr: Option<Box<Stmt>>,
        body: Box<Stmt>,
        span: Span,
    },
    Return { value: Option<Expr>, span: Span },
    Break(Span),
    Continue(Span),
    FnDef { decl: Rc<FuncDecl>, span: Span },
    Switch {
        scrutinee: Expr,
        cases: Vec<(Expr, Block)>,
        default: Option<Block>,
        span: Span,
    },
    Defer { stmt: Box<Stmt>, span: Span },
    Throw { value: Expr, span: Span },
    Try {
        body: Block,
        catch: Option<(String, Block)>,
        finally: Option<Block>,
        span: Span,
    },
    Import {
        /// `import name from path` binds the whole export map.
        default_name: Option<String>,
        names: Vec<ImportName>,
        path: Expr,
        span: Span,
    },
    Export { name: String, value: Expr, span: Span },
    /// `export { a as b, c }` re-exports existing bindings.
    ExportList { names: Vec<ImportName>, span: Span },
    Yield { value: Expr, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr(e) => e.span(),
            Stmt::Let { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::Block(_, span)
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::ForIn { span, .. }
            | Stmt::ForC { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Break(span)
            | Stmt::Continue(span)
            | Stmt::FnDef { span, .. }
            | Stmt::Switch { span, .. }
            | Stmt::Defer { span, .. }
            | Stmt::Throw { span, .. }
            | Stmt::Try { span, .. }
            | Stmt::Import { span, .. }
            | Stmt::Export { span, .. }
            | Stmt::ExportList { span, .. }
            | Stmt::Yield { span, .. } => *span,
        }
    }
}
