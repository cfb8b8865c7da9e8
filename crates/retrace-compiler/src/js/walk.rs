//! In-place traversal over the IR for rewriting passes that do not change
//! statement structure.

use super::ast::{JsExpr, JsExprKind, JsFunction, JsStmt};

/// Post-order mutable visitor. `exit_expr` runs after an expression's
/// children have been visited and may replace the node wholesale.
pub trait MutVisitor {
    fn exit_expr(&mut self, expr: &mut JsExpr);

    /// Whether to descend into a nested function's body.
    fn enter_function(&mut self, _func: &mut JsFunction) -> bool {
        true
    }
}

pub fn visit_stmts<V: MutVisitor + ?Sized>(v: &mut V, stmts: &mut [JsStmt]) {
    for stmt in stmts {
        visit_stmt(v, stmt);
    }
}

pub fn visit_stmt<V: MutVisitor + ?Sized>(v: &mut V, stmt: &mut JsStmt) {
    match stmt {
        JsStmt::Block(block) => visit_stmts(v, &mut block.stmts),
        JsStmt::Vars(vars) => {
            for var in vars {
                if let Some(init) = &mut var.init {
                    visit_expr(v, init);
                }
            }
        }
        JsStmt::Expr(expr) => visit_expr(v, expr),
        JsStmt::If {
            cond,
            then,
            otherwise,
        } => {
            visit_expr(v, cond);
            visit_stmt(v, then);
            if let Some(otherwise) = otherwise {
                visit_stmt(v, otherwise);
            }
        }
        JsStmt::For {
            init_vars,
            init,
            cond,
            incr,
            body,
        } => {
            for var in init_vars {
                if let Some(e) = &mut var.init {
                    visit_expr(v, e);
                }
            }
            for e in [init, cond, incr].into_iter().flatten() {
                visit_expr(v, e);
            }
            visit_stmt(v, body);
        }
        JsStmt::While { cond, body } => {
            visit_expr(v, cond);
            visit_stmt(v, body);
        }
        JsStmt::Return { expr, .. } => {
            if let Some(expr) = expr {
                visit_expr(v, expr);
            }
        }
        JsStmt::Throw { expr, .. } => visit_expr(v, expr),
        JsStmt::Try(try_stmt) => {
            visit_stmts(v, &mut try_stmt.block.stmts);
            for catch in &mut try_stmt.catches {
                visit_stmts(v, &mut catch.body.stmts);
            }
            if let Some(finally) = &mut try_stmt.finally {
                visit_stmts(v, &mut finally.stmts);
            }
        }
        JsStmt::Empty => {}
    }
}

pub fn visit_expr<V: MutVisitor + ?Sized>(v: &mut V, expr: &mut JsExpr) {
    match &mut expr.kind {
        JsExprKind::NameRef { qualifier, .. } => {
            if let Some(q) = qualifier {
                visit_expr(v, q);
            }
        }
        JsExprKind::This | JsExprKind::Literal(_) => {}
        JsExprKind::Array(items) => {
            for item in items {
                visit_expr(v, item);
            }
        }
        JsExprKind::Binary { lhs, rhs, .. } => {
            visit_expr(v, lhs);
            visit_expr(v, rhs);
        }
        JsExprKind::Prefix { arg, .. } | JsExprKind::Postfix { arg, .. } => visit_expr(v, arg),
        JsExprKind::Conditional {
            cond,
            then,
            otherwise,
        } => {
            visit_expr(v, cond);
            visit_expr(v, then);
            visit_expr(v, otherwise);
        }
        JsExprKind::ArrayAccess { array, index } => {
            visit_expr(v, array);
            visit_expr(v, index);
        }
        JsExprKind::Invocation { target, args } => {
            visit_expr(v, target);
            for arg in args {
                visit_expr(v, arg);
            }
        }
        JsExprKind::New { ctor, args } => {
            visit_expr(v, ctor);
            for arg in args {
                visit_expr(v, arg);
            }
        }
        JsExprKind::Function(func) => {
            if v.enter_function(func) {
                visit_stmts(v, &mut func.body.stmts);
            }
        }
    }
    v.exit_expr(expr);
}
