// Block-structured JavaScript IR produced by the front end's lowering step.
// This IR is the input and output of the stack-instrumentation pass.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in an original (pre-lowering) source file. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column: None,
        }
    }

    /// Synthetic origin for nodes created by the compiler itself.
    /// Line 0 marks "unknown"; such nodes never get locations recorded.
    pub fn synthetic() -> Self {
        Self {
            file: String::new(),
            line: 0,
            column: None,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.line == 0
    }

    /// Strips off everything but the final path segment.
    pub fn base_name(&self) -> &str {
        match self.file.rfind(['/', '\\']) {
            Some(idx) => &self.file[idx + 1..],
            None => &self.file,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Identity of an expression node, unique within one program. Analysis
/// results are keyed by this instead of node addresses; expressions
/// synthesized after analysis get fresh ids and therefore never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExprId(pub u32);

/// An interned identifier. Each name knows the scope that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameId(pub u32);

/// A lexical scope: the unobfuscatable root scope, the program's global
/// scope, or one function's local scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
    pub const GLOBAL: ScopeId = ScopeId(1);
}

#[derive(Debug, Clone)]
struct NameData {
    long_ident: String,
    short_ident: String,
    scope: ScopeId,
}

/// Allocator for names, scopes and expression ids. Kept separate from the
/// statement tree so passes can rewrite a function body while still minting
/// fresh nodes (split borrow of [`JsProgram`]).
#[derive(Debug, Default)]
pub struct NodePool {
    names: RefCell<Vec<NameData>>,
    next_scope: Cell<u32>,
    next_expr: Cell<u32>,
}

/// Identifiers that pre-instrumentation code (the trace-collection support
/// library) may reference. They live in the root scope and get rebound to
/// locally declared, obfuscatable names by the pass.
pub const ROOT_IDENTS: [&str; 5] = [
    "$stack",
    "$stackDepth",
    "$stackDepthCap",
    "$location",
    "$newException",
];

impl NodePool {
    pub fn new() -> Self {
        let pool = Self {
            names: RefCell::new(Vec::new()),
            next_scope: Cell::new(2), // 0 = root, 1 = global
            next_expr: Cell::new(0),
        };
        for ident in ROOT_IDENTS {
            pool.declare_name(ScopeId::ROOT, ident, ident);
        }
        pool
    }

    pub fn new_scope(&self) -> ScopeId {
        let id = self.next_scope.get();
        self.next_scope.set(id + 1);
        ScopeId(id)
    }

    pub fn declare_name(
        &self,
        scope: ScopeId,
        long_ident: impl Into<String>,
        short_ident: impl Into<String>,
    ) -> NameId {
        let mut names = self.names.borrow_mut();
        names.push(NameData {
            long_ident: long_ident.into(),
            short_ident: short_ident.into(),
            scope,
        });
        NameId(names.len() as u32 - 1)
    }

    pub fn ident(&self, name: NameId) -> String {
        self.names.borrow()[name.0 as usize].short_ident.clone()
    }

    pub fn long_ident(&self, name: NameId) -> String {
        self.names.borrow()[name.0 as usize].long_ident.clone()
    }

    pub fn scope_of(&self, name: NameId) -> ScopeId {
        self.names.borrow()[name.0 as usize].scope
    }

    /// Finds a name by short identifier within one scope.
    pub fn find_in_scope(&self, scope: ScopeId, short_ident: &str) -> Option<NameId> {
        self.names
            .borrow()
            .iter()
            .position(|n| n.scope == scope && n.short_ident == short_ident)
            .map(|i| NameId(i as u32))
    }

    pub fn find_root(&self, ident: &str) -> Option<NameId> {
        self.find_in_scope(ScopeId::ROOT, ident)
    }

    fn next_expr_id(&self) -> ExprId {
        let id = self.next_expr.get();
        self.next_expr.set(id + 1);
        ExprId(id)
    }

    // -- expression constructors ------------------------------------------

    pub fn expr(&self, loc: SourceLocation, kind: JsExprKind) -> JsExpr {
        JsExpr {
            id: self.next_expr_id(),
            loc,
            kind,
        }
    }

    pub fn name_ref(&self, loc: SourceLocation, name: NameId) -> JsExpr {
        self.expr(
            loc,
            JsExprKind::NameRef {
                name,
                qualifier: None,
            },
        )
    }

    pub fn num(&self, loc: SourceLocation, value: f64) -> JsExpr {
        self.expr(loc, JsExprKind::Literal(JsLiteral::Num(value)))
    }

    pub fn str(&self, loc: SourceLocation, value: impl Into<String>) -> JsExpr {
        self.expr(loc, JsExprKind::Literal(JsLiteral::Str(value.into())))
    }

    pub fn null(&self, loc: SourceLocation) -> JsExpr {
        self.expr(loc, JsExprKind::Literal(JsLiteral::Null))
    }

    pub fn bool(&self, loc: SourceLocation, value: bool) -> JsExpr {
        self.expr(loc, JsExprKind::Literal(JsLiteral::Bool(value)))
    }

    pub fn binary(&self, loc: SourceLocation, op: BinaryOp, lhs: JsExpr, rhs: JsExpr) -> JsExpr {
        self.expr(
            loc,
            JsExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        )
    }

    pub fn assign(&self, loc: SourceLocation, lhs: JsExpr, rhs: JsExpr) -> JsExpr {
        self.binary(loc, BinaryOp::Assign, lhs, rhs)
    }

    pub fn comma(&self, loc: SourceLocation, lhs: JsExpr, rhs: JsExpr) -> JsExpr {
        self.binary(loc, BinaryOp::Comma, lhs, rhs)
    }

    pub fn prefix(&self, loc: SourceLocation, op: UnaryOp, arg: JsExpr) -> JsExpr {
        self.expr(
            loc,
            JsExprKind::Prefix {
                op,
                arg: Box::new(arg),
            },
        )
    }

    pub fn postfix(&self, loc: SourceLocation, op: UnaryOp, arg: JsExpr) -> JsExpr {
        self.expr(
            loc,
            JsExprKind::Postfix {
                op,
                arg: Box::new(arg),
            },
        )
    }

    pub fn array_access(&self, loc: SourceLocation, array: JsExpr, index: JsExpr) -> JsExpr {
        self.expr(
            loc,
            JsExprKind::ArrayAccess {
                array: Box::new(array),
                index: Box::new(index),
            },
        )
    }

    pub fn invoke(&self, loc: SourceLocation, target: JsExpr, args: Vec<JsExpr>) -> JsExpr {
        self.expr(
            loc,
            JsExprKind::Invocation {
                target: Box::new(target),
                args,
            },
        )
    }

    pub fn function(
        &self,
        loc: SourceLocation,
        name: Option<NameId>,
        params: Vec<NameId>,
        body: JsBlock,
    ) -> JsFunction {
        JsFunction {
            name,
            params,
            scope: self.new_scope(),
            body,
            loc,
        }
    }
}

/// A whole compiled program: the global statement block plus the allocator
/// for its names and node ids. The front end also registers a few functions
/// under well-known indexes, e.g. `Exceptions.caught`.
#[derive(Debug, Default)]
pub struct JsProgram {
    pub pool: NodePool,
    pub global_block: Vec<JsStmt>,
    pub indexed_functions: HashMap<String, NameId>,
}

impl JsProgram {
    pub fn new() -> Self {
        Self {
            pool: NodePool::new(),
            global_block: Vec::new(),
            indexed_functions: HashMap::new(),
        }
    }

    pub fn indexed_function(&self, index: &str) -> Option<NameId> {
        self.indexed_functions.get(index).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JsLiteral {
    Null,
    Undefined,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    /// Strict equality `===`
    RefEq,
    /// Strict inequality `!==`
    RefNeq,
    Lt,
    Gt,
    Comma,
}

impl BinaryOp {
    pub fn is_assignment(self) -> bool {
        self == BinaryOp::Assign
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Void,
    TypeOf,
    Delete,
    Inc,
    Dec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsExpr {
    pub id: ExprId,
    pub loc: SourceLocation,
    pub kind: JsExprKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JsExprKind {
    NameRef {
        name: NameId,
        qualifier: Option<Box<JsExpr>>,
    },
    This,
    Literal(JsLiteral),
    Array(Vec<JsExpr>),
    Binary {
        op: BinaryOp,
        lhs: Box<JsExpr>,
        rhs: Box<JsExpr>,
    },
    Prefix {
        op: UnaryOp,
        arg: Box<JsExpr>,
    },
    Postfix {
        op: UnaryOp,
        arg: Box<JsExpr>,
    },
    Conditional {
        cond: Box<JsExpr>,
        then: Box<JsExpr>,
        otherwise: Box<JsExpr>,
    },
    ArrayAccess {
        array: Box<JsExpr>,
        index: Box<JsExpr>,
    },
    Invocation {
        target: Box<JsExpr>,
        args: Vec<JsExpr>,
    },
    New {
        ctor: Box<JsExpr>,
        args: Vec<JsExpr>,
    },
    Function(Box<JsFunction>),
}

impl JsExpr {
    /// Whether evaluating this expression is known to yield a non-null,
    /// non-undefined value. Used to prove that a qualified reference through
    /// it cannot raise a TypeError.
    pub fn is_definitely_not_null(&self) -> bool {
        match &self.kind {
            JsExprKind::Literal(JsLiteral::Null) | JsExprKind::Literal(JsLiteral::Undefined) => {
                false
            }
            JsExprKind::Literal(_) | JsExprKind::Array(_) | JsExprKind::Function(_) => true,
            JsExprKind::This => true,
            _ => false,
        }
    }

    pub fn unqualified_name(&self) -> Option<NameId> {
        match &self.kind {
            JsExprKind::NameRef {
                name,
                qualifier: None,
            } => Some(*name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsFunction {
    /// `None` for anonymous functions, which push a null frame identity.
    pub name: Option<NameId>,
    pub params: Vec<NameId>,
    pub scope: ScopeId,
    pub body: JsBlock,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JsBlock {
    pub stmts: Vec<JsStmt>,
}

impl JsBlock {
    pub fn new(stmts: Vec<JsStmt>) -> Self {
        Self { stmts }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsVar {
    pub name: NameId,
    pub init: Option<JsExpr>,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsCatch {
    pub param: NameId,
    pub body: JsBlock,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsTry {
    pub block: JsBlock,
    pub catches: Vec<JsCatch>,
    pub finally: Option<JsBlock>,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JsStmt {
    Block(JsBlock),
    Vars(Vec<JsVar>),
    Expr(JsExpr),
    If {
        cond: JsExpr,
        then: Box<JsStmt>,
        otherwise: Option<Box<JsStmt>>,
    },
    For {
        init_vars: Vec<JsVar>,
        init: Option<JsExpr>,
        cond: Option<JsExpr>,
        incr: Option<JsExpr>,
        body: Box<JsStmt>,
    },
    While {
        cond: JsExpr,
        body: Box<JsStmt>,
    },
    Return {
        expr: Option<JsExpr>,
        loc: SourceLocation,
    },
    Throw {
        expr: JsExpr,
        loc: SourceLocation,
    },
    Try(JsTry),
    Empty,
}

impl JsStmt {
    /// A statement after which control cannot fall through, so a stack pop
    /// inserted behind it would be dead code.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JsStmt::Return { .. } | JsStmt::Throw { .. })
    }
}
