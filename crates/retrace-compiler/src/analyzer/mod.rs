//! Heuristic static analysis that determines which expressions in a
//! function cannot throw. This is what keeps location recording affordable:
//! every expression the analyzer fails to exclude gets instrumented.
//!
//! Unlike Java, in JavaScript almost any operation can raise: evaluating
//! `x + 1` calls `x.toString()` when `x` is an object, and that call can do
//! anything. The only implicit cast that never throws is ToBoolean. Without
//! type inference we can still prove a useful residue of expression shapes
//! safe, and everything else is conservatively "may throw". Invocations and
//! `new` are always "may throw" regardless of what the Java-side analysis
//! claims.

use std::collections::{HashMap, HashSet};

use crate::java::JavaHints;
use crate::js::ast::{
    BinaryOp, ExprId, JsBlock, JsExpr, JsExprKind, JsFunction, JsStmt, NameId, NodePool, ScopeId,
    SourceLocation, UnaryOp,
};

/// Program-wide facts the per-function analysis needs: which global names
/// were explicitly declared (implicit globals are mere property assignments
/// to the global object and can raise a ReferenceError when read).
pub struct ThrowabilityAnalyzer<'p> {
    pool: &'p NodePool,
    declared_globals: HashSet<NameId>,
    hints: Option<&'p JavaHints>,
}

impl<'p> ThrowabilityAnalyzer<'p> {
    /// Borrows the pool and scans the global block for explicit
    /// declarations. The block is released on return so callers can go on to
    /// rewrite it while the analyzer lives.
    pub fn new(
        pool: &'p NodePool,
        global_block: &[JsStmt],
        hints: Option<&'p JavaHints>,
    ) -> Self {
        let mut declared_globals = HashSet::new();
        for stmt in global_block {
            match stmt {
                JsStmt::Vars(vars) => {
                    for var in vars {
                        declared_globals.insert(var.name);
                    }
                }
                JsStmt::Expr(JsExpr {
                    kind: JsExprKind::Function(func),
                    ..
                }) => {
                    if let Some(name) = func.name {
                        declared_globals.insert(name);
                    }
                }
                _ => {}
            }
        }
        Self {
            pool,
            declared_globals,
            hints,
        }
    }

    pub fn analyze_function(&self, func: &JsFunction) -> FunctionAnalysis {
        let mut analysis = FunctionAnalysis::default();

        // 1) structural rules over the JS IR
        let mut js_pass = JsRules {
            analyzer: self,
            analysis: &mut analysis,
        };
        js_pass.block(&func.body);

        // 2) refine through the Java-side results, when the function was
        // lowered from a Java method body
        if let Some(hints) = self.hints {
            let is_java = func
                .name
                .map(|n| hints.is_java_method(&self.pool.long_ident(n)))
                .unwrap_or(false);
            if is_java {
                let mut matcher = JavaMatcher {
                    hints,
                    analysis: &mut analysis,
                    ancestors: Vec::new(),
                };
                matcher.block(&func.body);
            }
        }

        // 3) aggregate: per-expression "descendants also cannot throw",
        // whole-function throwability, try-statement presence
        analysis.nothing_can_throw = true;
        let mut report = Report {
            analysis: &mut analysis,
            _marker: std::marker::PhantomData,
        };
        report.block(&func.body);

        analysis
    }

    fn name_ref_can_not_throw(&self, name: NameId, qualifier: Option<&JsExpr>) -> bool {
        match qualifier {
            // a) reading a member off a provably non-null qualifier cannot
            //    raise a TypeError
            Some(q) => q.is_definitely_not_null(),
            // b) unqualified: root-scope and function-local bindings always
            //    exist; globals only when explicitly declared
            None => {
                let scope = self.pool.scope_of(name);
                scope == ScopeId::ROOT
                    || scope != ScopeId::GLOBAL
                    || self.declared_globals.contains(&name)
            }
        }
    }
}

/// Per-function analysis results, keyed by expression identity. Expressions
/// synthesized after the analysis ran get fresh ids, so they are neither
/// "visited" nor "cannot throw" and are skipped by location recording.
#[derive(Debug, Default)]
pub struct FunctionAnalysis {
    /// Expressions that cannot throw per JS rules. The value records whether
    /// all descendants also cannot throw.
    js_can_not_throw: HashMap<ExprId, bool>,
    /// Expressions whose Java counterpart was proven unable to throw.
    java_can_not_throw: HashSet<ExprId>,
    /// Every expression the analysis actually examined.
    visited: HashSet<ExprId>,
    /// Whether the function contains at least one try statement.
    pub contains_try: bool,
    /// Whether no expression in the function can throw (JS rules only).
    pub nothing_can_throw: bool,
}

impl FunctionAnalysis {
    /// Soft condition: x itself cannot throw per either analysis. There is a
    /// small chance the Java-derived half is wrong about a particular
    /// lowered expression, so never use this to skip a whole function or to
    /// drop the temporary-return-value extraction.
    pub fn can_not_throw(&self, id: ExprId) -> bool {
        self.js_can_not_throw.contains_key(&id) || self.java_can_not_throw.contains(&id)
    }

    /// Hard condition: neither x nor any descendant can throw, per JS rules
    /// alone.
    pub fn can_not_throw_recursive(&self, id: ExprId) -> bool {
        self.js_can_not_throw.get(&id).copied().unwrap_or(false)
    }

    pub fn was_visited(&self, id: ExprId) -> bool {
        self.visited.contains(&id)
    }

    /// A function needs no instrumentation at all iff nothing in it can
    /// throw and it has no try statement.
    pub fn needs_instrumentation(&self) -> bool {
        !self.nothing_can_throw || self.contains_try
    }
}

/// Walks every expression of a function body without descending into nested
/// functions (each function is analyzed on its own).
macro_rules! body_walker {
    ($name:ident, $self:ident, $expr_hook:ident) => {
        impl<'a, 'p> $name<'a, 'p> {
            fn block(&mut $self, block: &JsBlock) {
                for stmt in &block.stmts {
                    $self.stmt(stmt);
                }
            }

            fn stmt(&mut $self, stmt: &JsStmt) {
                match stmt {
                    JsStmt::Block(block) => $self.block(block),
                    JsStmt::Vars(vars) => {
                        for var in vars {
                            if let Some(init) = &var.init {
                                $self.$expr_hook(init);
                            }
                        }
                    }
                    JsStmt::Expr(expr) => $self.$expr_hook(expr),
                    JsStmt::If {
                        cond,
                        then,
                        otherwise,
                    } => {
                        $self.$expr_hook(cond);
                        $self.stmt(then);
                        if let Some(otherwise) = otherwise {
                            $self.stmt(otherwise);
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
                            if let Some(e) = &var.init {
                                $self.$expr_hook(e);
                            }
                        }
                        if let Some(e) = init {
                            $self.$expr_hook(e);
                        }
                        if let Some(e) = cond {
                            $self.$expr_hook(e);
                        }
                        if let Some(e) = incr {
                            $self.$expr_hook(e);
                        }
                        $self.stmt(body);
                    }
                    JsStmt::While { cond, body } => {
                        $self.$expr_hook(cond);
                        $self.stmt(body);
                    }
                    JsStmt::Return { expr, .. } => {
                        if let Some(expr) = expr {
                            $self.$expr_hook(expr);
                        }
                    }
                    JsStmt::Throw { expr, .. } => $self.$expr_hook(expr),
                    JsStmt::Try(try_stmt) => {
                        $self.try_stmt(try_stmt);
                    }
                    JsStmt::Empty => {}
                }
            }

            fn try_stmt(&mut $self, try_stmt: &crate::js::ast::JsTry) {
                $self.try_hook();
                $self.block(&try_stmt.block);
                for catch in &try_stmt.catches {
                    $self.block(&catch.body);
                }
                if let Some(finally) = &try_stmt.finally {
                    $self.block(finally);
                }
            }
        }
    };
}

struct JsRules<'a, 'p> {
    analyzer: &'a ThrowabilityAnalyzer<'p>,
    analysis: &'a mut FunctionAnalysis,
}

body_walker!(JsRules, self, expr);

impl<'a, 'p> JsRules<'a, 'p> {
    fn try_hook(&mut self) {}

    fn expr(&mut self, expr: &JsExpr) {
        self.analysis.visited.insert(expr.id);

        let can_not_throw = match &expr.kind {
            JsExprKind::NameRef { name, qualifier } => {
                if let Some(q) = qualifier {
                    self.expr(q);
                }
                self.analyzer.name_ref_can_not_throw(*name, qualifier.as_deref())
            }
            // a literal shell cannot throw; its component expressions can
            JsExprKind::Literal(_) => true,
            JsExprKind::Array(items) => {
                for item in items {
                    self.expr(item);
                }
                true
            }
            // nested functions are literals here; their bodies are analyzed
            // separately when their own turn comes
            JsExprKind::Function(_) => true,
            JsExprKind::This => true,
            JsExprKind::Prefix { op, arg } => {
                self.expr(arg);
                matches!(op, UnaryOp::Not | UnaryOp::Void | UnaryOp::TypeOf | UnaryOp::Delete)
            }
            JsExprKind::Postfix { arg, .. } => {
                self.expr(arg);
                // ++/-- perform a ToNumber cast
                false
            }
            JsExprKind::Binary { op, lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
                match op {
                    BinaryOp::And
                    | BinaryOp::Or
                    | BinaryOp::RefEq
                    | BinaryOp::RefNeq
                    | BinaryOp::Comma => true,
                    // writing to a plain identifier cannot throw
                    BinaryOp::Assign => lhs.unqualified_name().is_some(),
                    _ => false,
                }
            }
            // selection itself only casts the condition to boolean
            JsExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond);
                self.expr(then);
                self.expr(otherwise);
                true
            }
            JsExprKind::ArrayAccess { array, index } => {
                self.expr(array);
                self.expr(index);
                false
            }
            JsExprKind::Invocation { target, args } => {
                self.expr(target);
                for arg in args {
                    self.expr(arg);
                }
                false
            }
            JsExprKind::New { ctor, args } => {
                self.expr(ctor);
                for arg in args {
                    self.expr(arg);
                }
                false
            }
        };

        if can_not_throw {
            self.analysis.js_can_not_throw.insert(expr.id, false);
        }
    }
}

/// Invocations and object construction must stay instrumented regardless of
/// what the Java analysis says about their location.
fn definitely_can_throw(expr: &JsExpr) -> bool {
    matches!(
        expr.kind,
        JsExprKind::Invocation { .. } | JsExprKind::New { .. }
    )
}

struct JavaMatcher<'a, 'p> {
    hints: &'p JavaHints,
    analysis: &'a mut FunctionAnalysis,
    ancestors: Vec<SourceLocation>,
}

body_walker!(JavaMatcher, self, expr);

impl<'a, 'p> JavaMatcher<'a, 'p> {
    fn try_hook(&mut self) {}

    fn expr(&mut self, expr: &JsExpr) {
        self.ancestors.push(expr.loc.clone());
        match &expr.kind {
            JsExprKind::NameRef { qualifier, .. } => {
                if let Some(q) = qualifier {
                    self.expr(q);
                }
            }
            JsExprKind::Literal(_) | JsExprKind::This | JsExprKind::Function(_) => {}
            JsExprKind::Array(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            JsExprKind::Prefix { arg, .. } | JsExprKind::Postfix { arg, .. } => self.expr(arg),
            JsExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            JsExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond);
                self.expr(then);
                self.expr(otherwise);
            }
            JsExprKind::ArrayAccess { array, index } => {
                self.expr(array);
                self.expr(index);
            }
            JsExprKind::Invocation { target, args } => {
                self.expr(target);
                for arg in args {
                    self.expr(arg);
                }
            }
            JsExprKind::New { ctor, args } => {
                self.expr(ctor);
                for arg in args {
                    self.expr(arg);
                }
            }
        }
        self.ancestors.pop();

        if !definitely_can_throw(expr) {
            // chain = own location, then enclosing locations innermost first
            let chain = std::iter::once(&expr.loc).chain(self.ancestors.iter().rev());
            if self.hints.chain_can_not_throw(chain) {
                self.analysis.java_can_not_throw.insert(expr.id);
            }
        }
    }
}

struct Report<'a, 'p> {
    analysis: &'a mut FunctionAnalysis,
    _marker: std::marker::PhantomData<&'p ()>,
}

// the macro expects two lifetimes; Report only needs one
impl<'a, 'p> Report<'a, 'p> {
    fn try_hook(&mut self) {
        self.analysis.contains_try = true;
    }
}

body_walker!(Report, self, expr);

impl<'a, 'p> Report<'a, 'p> {
    fn expr(&mut self, expr: &JsExpr) {
        self.expr_inner(expr);
    }

    /// Returns whether the whole subtree rooted at `expr` cannot throw.
    fn expr_inner(&mut self, expr: &JsExpr) -> bool {
        let mut children_ok = true;
        let mut child = |report: &mut Self, e: &JsExpr| {
            if !report.expr_inner(e) {
                children_ok = false;
            }
        };
        match &expr.kind {
            JsExprKind::NameRef { qualifier, .. } => {
                if let Some(q) = qualifier {
                    child(self, q);
                }
            }
            JsExprKind::Literal(_) | JsExprKind::This | JsExprKind::Function(_) => {}
            JsExprKind::Array(items) => {
                for item in items {
                    child(self, item);
                }
            }
            JsExprKind::Prefix { arg, .. } | JsExprKind::Postfix { arg, .. } => child(self, arg),
            JsExprKind::Binary { lhs, rhs, .. } => {
                child(self, lhs);
                child(self, rhs);
            }
            JsExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                child(self, cond);
                child(self, then);
                child(self, otherwise);
            }
            JsExprKind::ArrayAccess { array, index } => {
                child(self, array);
                child(self, index);
            }
            JsExprKind::Invocation { target, args } => {
                child(self, target);
                for arg in args {
                    child(self, arg);
                }
            }
            JsExprKind::New { ctor, args } => {
                child(self, ctor);
                for arg in args {
                    child(self, arg);
                }
            }
        }

        let self_ok = self.analysis.js_can_not_throw.contains_key(&expr.id);
        if self_ok {
            self.analysis
                .js_can_not_throw
                .insert(expr.id, children_ok);
        } else {
            self.analysis.nothing_can_throw = false;
        }
        self_ok && children_ok
    }
}

#[cfg(test)]
mod tests;
