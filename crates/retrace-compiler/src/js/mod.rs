//! The JavaScript IR the instrumentation pass operates on.

pub mod ast;
pub mod walk;

pub use ast::{
    BinaryOp, ExprId, JsBlock, JsCatch, JsExpr, JsExprKind, JsFunction, JsLiteral, JsProgram,
    JsStmt, JsTry, JsVar, NameId, NodePool, ScopeId, SourceLocation, UnaryOp,
};
