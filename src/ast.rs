//! The AST shape the core consumes. The lexer/parser that produces
//! this tree is out of scope; this module only defines the node and
//! signal-op vocabulary the Optimizer, Evaluator, and Bytecode Generator
//! walk.

use std::rc::Rc;

use crate::value::Value;

/// Operator/keyword vocabulary carried by `Node::Signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SignalOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Minus,
    Escape,
    AddAsi,
    SubAsi,
    MulAsi,
    DivAsi,
    ModAsi,
    PowAsi,
    Asi,
    Und,
    Abo,
    Ueq,
    Aeq,
    Equ,
    Neq,
    And,
    Or,
    Not,
    Dot,
    Arrow,
    TypeId,
    New,
    GcNew,
    FCall,
    Access,
    Choice,
    Pair,
    Inc,
    Dec,
    Lambda,
    Emb,
    VarDef,
}

/// A binary tree of tokens ("AST"). Every non-leaf operator uses its two
/// children as operands; a unary operator leaves one side `None`, which also
/// disambiguates prefix vs postfix for `Inc`/`Dec` and `new`/`minus`/`escape`.
#[derive(Debug, Clone)]
pub enum Node {
    Id(String),
    Value(Value),
    /// A parenthesized sub-expression, re-entrant for optimization purposes.
    Expr(Box<Node>),
    /// Element list for array/map literals.
    Array(Vec<Node>),
    /// Argument list for a call.
    ArgList(Vec<Node>),
    Signal { op: SignalOp, left: Option<Box<Node>>, right: Option<Box<Node>> },
    EndLine,
}

impl Node {
    pub fn signal(op: SignalOp, left: Option<Node>, right: Option<Node>) -> Self {
        Node::Signal { op, left: left.map(Box::new), right: right.map(Box::new) }
    }

    pub fn left(&self) -> Option<&Node> {
        match self {
            Node::Signal { left, .. } => left.as_deref(),
            _ => None,
        }
    }

    pub fn right(&self) -> Option<&Node> {
        match self {
            Node::Signal { right, .. } => right.as_deref(),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_value_owned(self) -> Option<Value> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<&str> {
        match self {
            Node::Id(s) => Some(s),
            _ => None,
        }
    }
}

/// Diagnostic anchor every statement carries, for error messages.
#[derive(Debug, Clone, Default)]
pub struct SourceLoc {
    pub file: Rc<str>,
    pub line: u32,
    pub raw_source: Rc<str>,
}

#[derive(Debug, Clone)]
pub struct ForSpec {
    pub var_name: String,
    pub start: Node,
    pub end: Node,
    pub step: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub value: Node,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub args: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    pub body: Vec<Stmt>,
}

/// Statement kinds produced by the parser.
#[derive(Debug, Clone)]
pub enum StmtKind {
    Expression(Node),
    VarDef { name: String, init: Node },
    Return(Option<Node>),
    Break,
    Continue,
    Block(Vec<Stmt>),
    Namespace { name: String, body: Vec<Stmt> },
    If { cond: Node, body: Vec<Stmt> },
    IfElse { cond: Node, then_body: Vec<Stmt>, else_body: Vec<Stmt> },
    Switch { scrutinee: Node, cases: Vec<SwitchCase>, default: Option<Vec<Stmt>> },
    While { cond: Node, body: Vec<Stmt> },
    /// Post-condition `do..until` loop (`loop`).
    Loop { cond: Node, body: Vec<Stmt> },
    For { spec: ForSpec, body: Vec<Stmt> },
    Foreach { var_name: String, iterable: Node, body: Vec<Stmt> },
    Try { body: Vec<Stmt>, catch_name: String, catch_body: Vec<Stmt> },
    Throw(Node),
    Function(FunctionDecl),
    Struct(StructDecl),
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLoc,
}

impl Stmt {
    pub fn new(kind: StmtKind, loc: SourceLoc) -> Self {
        Self { kind, loc }
    }
}
