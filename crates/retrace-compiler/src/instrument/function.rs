//! Per-function rewriting: entry push, exit pops, catch resets, early-exit
//! bookkeeping around finally blocks, and (optionally) location recording.
//!
//! The general shape of an instrumented function:
//!
//! ```text
//! function foo() {
//!   var stackIndex;
//!   $stack[stackIndex = ++$stackDepth] = foo;
//!   ... body ...
//!   $stackDepth = stackIndex - 1;
//! }
//! ```
//!
//! The local `stackIndex` is only needed when the function contains a try
//! statement; otherwise the shared `$stackDepth` counter is used directly
//! and the pop degrades to `$stackDepth--`.
//!
//! A return inside a try block with an associated finally block cannot pop
//! immediately (the finally code still runs in this frame), so such returns
//! set a per-finally flag instead and the outermost finally block ends with
//! `exitingEarly && pop()`:
//!
//! ```text
//! var exitingEarly0;
//! try {
//!   if (...) return (exitingEarly0 = true, new Foo());
//! } finally {
//!   ... existing finally code ...
//!   exitingEarly0 && ($stackDepth = stackIndex - 1);
//! }
//! ```
//!
//! Catchless try/finally statements get a synthetic catch block so that
//! catch blocks are the only places flow control can jump to, and every
//! catch block starts by resetting `$stackDepth = stackIndex`. There is no
//! special handling for explicit throw statements: the instrumentation must
//! cover browser-generated exceptions (`null.a()`) anyway.

use super::{make_stack_push_expr, EmulatorNames, EmulatorOptions};
use crate::analyzer::FunctionAnalysis;
use crate::js::ast::{
    BinaryOp, ExprId, JsBlock, JsCatch, JsExpr, JsExprKind, JsFunction, JsLiteral, JsStmt, JsTry,
    JsVar, NameId, NodePool, ScopeId, SourceLocation, UnaryOp,
};
use crate::obfuscate::FileNameObfuscator;
use crate::{CompilerError, Result};

fn syn() -> SourceLocation {
    SourceLocation::synthetic()
}

pub(crate) struct FunctionInstrumenter<'a> {
    pool: &'a NodePool,
    names: &'a EmulatorNames,
    analysis: &'a FunctionAnalysis,
    obfuscator: Option<&'a mut FileNameObfuscator>,
    record: bool,
    record_file_names: bool,
    func_name: Option<NameId>,
    func_scope: ScopeId,
    /// The file the function was declared in. Recorded locations from the
    /// same file need only a line number; the file is recoverable from the
    /// symbol map. Code inlined from other files records the file too.
    func_file: String,
    stack_index: Option<NameId>,
    /// Early-exit flags, in declaration order.
    extra_locals: Vec<NameId>,
    /// `Some` while inside the try block (or catches) of the outermost
    /// try/finally. The flag variable is allocated lazily by the first
    /// return that needs it.
    outer_flag: Option<FlagSlot>,
    flag_counter: usize,
    /// Location dedup state: the (file, line) recorded last.
    last: Option<(String, u32)>,
    parents: Vec<ParentFrame>,
}

struct FlagSlot {
    name: Option<NameId>,
}

struct ParentFrame {
    id: ExprId,
    loc: SourceLocation,
    /// Set when a descendant changed the recorded location, meaning this
    /// expression's own location must be restored after the descendant's
    /// evaluation.
    restore: bool,
    /// Whether this node may legally be replaced by a comma expression.
    wrappable: bool,
}

/// Syntactic context of an expression during the location walk.
#[derive(Debug, Clone, Copy, Default)]
struct ExprCtx {
    /// The expression is written to; assignments to comma expressions are
    /// not legal.
    lvalue: bool,
    /// The position expects a reference, not an arbitrary expression:
    /// `delete (line='123',foo).bar` would be wrong, and
    /// `(line='123',"abc").indexOf("b")` would lose the string receiver.
    no_wrap: bool,
}

impl ExprCtx {
    fn wrappable(self) -> bool {
        !self.lvalue && !self.no_wrap
    }
}

impl<'a> FunctionInstrumenter<'a> {
    pub fn new(
        pool: &'a NodePool,
        names: &'a EmulatorNames,
        analysis: &'a FunctionAnalysis,
        options: &EmulatorOptions,
        obfuscator: Option<&'a mut FileNameObfuscator>,
        func: &JsFunction,
    ) -> Self {
        let stack_index = analysis
            .contains_try
            .then(|| pool.declare_name(func.scope, "JsStackEmulator_stackIndex", "stackIndex"));
        Self {
            pool,
            names,
            analysis,
            obfuscator,
            record: options.record_line_numbers,
            record_file_names: options.record_file_names,
            func_name: func.name,
            func_scope: func.scope,
            func_file: func.loc.file.clone(),
            stack_index,
            extra_locals: Vec::new(),
            outer_flag: None,
            flag_counter: 0,
            last: None,
            parents: Vec::new(),
        }
    }

    /// The local stack-slot variable, when the function needed one.
    pub fn stack_index(&self) -> Option<NameId> {
        self.stack_index
    }

    pub fn run(&mut self, func: &mut JsFunction) -> Result<()> {
        let stmts = std::mem::take(&mut func.body.stmts);
        let mut out = Vec::with_capacity(stmts.len() + 2);
        for stmt in stmts {
            self.stmt(stmt, &mut out)?;
        }

        // anonymous functions push a null frame identity
        let fn_ref = match self.func_name {
            Some(name) => self.pool.name_ref(func.loc.clone(), name),
            None => self.pool.null(func.loc.clone()),
        };
        let push = if self.record {
            // $stackPush(fn) also nulls out the location slot
            let helper = self.names.stack_push.ok_or_else(|| {
                CompilerError::Internal("location recording without a push helper".into())
            })?;
            self.pool
                .invoke(syn(), self.pool.name_ref(syn(), helper), vec![fn_ref])
        } else {
            make_stack_push_expr(self.pool, self.names, fn_ref, self.stack_index.is_some())
        };

        let entry = match self.stack_index {
            Some(stack_index) => {
                // the stack-slot variable goes first so the push expression
                // is evaluated before anything else
                let mut vars = vec![JsVar {
                    name: stack_index,
                    init: Some(push),
                    loc: syn(),
                }];
                for name in self.extra_locals.drain(..) {
                    vars.push(JsVar {
                        name,
                        init: None,
                        loc: syn(),
                    });
                }
                JsStmt::Vars(vars)
            }
            None => {
                if !self.extra_locals.is_empty() {
                    return Err(CompilerError::Internal(
                        "early-exit flags allocated without a local stack index".into(),
                    ));
                }
                JsStmt::Expr(push)
            }
        };
        out.insert(0, entry);

        // falling off the end of the body pops; a pop after a terminal
        // return or throw would be dead code
        if !out.last().map_or(false, JsStmt::is_terminal) {
            out.push(JsStmt::Expr(self.pop_expr()));
        }
        func.body.stmts = out;
        Ok(())
    }

    // -- shared snippets --------------------------------------------------

    fn depth_ref(&self) -> JsExpr {
        self.pool.name_ref(syn(), self.names.depth)
    }

    fn stack_index_ref(&self) -> JsExpr {
        self.pool
            .name_ref(syn(), self.stack_index.unwrap_or(self.names.depth))
    }

    fn temp_ref(&self) -> JsExpr {
        self.pool.name_ref(syn(), self.names.temp)
    }

    fn pop_expr(&self) -> JsExpr {
        match self.stack_index {
            // $stackDepth = stackIndex - 1
            Some(stack_index) => self.pool.assign(
                syn(),
                self.depth_ref(),
                self.pool.binary(
                    syn(),
                    BinaryOp::Sub,
                    self.pool.name_ref(syn(), stack_index),
                    self.pool.num(syn(), 1.0),
                ),
            ),
            // $stackDepth--
            None => self.pool.postfix(syn(), UnaryOp::Dec, self.depth_ref()),
        }
    }

    /// The early-exit flag for the active outermost finally block, when one
    /// is active; allocated on first use.
    fn early_exit_flag(&mut self) -> Option<NameId> {
        let slot = self.outer_flag.as_ref()?;
        if let Some(name) = slot.name {
            return Some(name);
        }
        let name = self.pool.declare_name(
            self.func_scope,
            format!("JsStackEmulator_exitingEarly{}", self.flag_counter),
            "exitingEarly",
        );
        self.flag_counter += 1;
        self.extra_locals.push(name);
        if let Some(slot) = self.outer_flag.as_mut() {
            slot.name = Some(name);
        }
        Some(name)
    }

    // -- statement rewriting ----------------------------------------------

    fn block(&mut self, block: JsBlock) -> Result<JsBlock> {
        let mut out = Vec::with_capacity(block.stmts.len());
        for stmt in block.stmts {
            self.stmt(stmt, &mut out)?;
        }
        Ok(JsBlock::new(out))
    }

    /// Rewrites one statement into a position that can hold only one; pops
    /// inserted around it force a block.
    fn stmt_one(&mut self, stmt: JsStmt) -> Result<JsStmt> {
        let mut out = Vec::with_capacity(1);
        self.stmt(stmt, &mut out)?;
        Ok(if out.len() == 1 {
            out.remove(0)
        } else {
            JsStmt::Block(JsBlock::new(out))
        })
    }

    fn stmt(&mut self, stmt: JsStmt, out: &mut Vec<JsStmt>) -> Result<()> {
        match stmt {
            JsStmt::Block(block) => {
                let block = self.block(block)?;
                out.push(JsStmt::Block(block));
            }
            JsStmt::Vars(vars) => {
                let vars = vars
                    .into_iter()
                    .map(|mut var| {
                        if let Some(init) = var.init.take() {
                            var.init = Some(self.expr_root(init));
                        }
                        var
                    })
                    .collect();
                out.push(JsStmt::Vars(vars));
            }
            JsStmt::Expr(expr) => {
                let expr = self.expr_root(expr);
                out.push(JsStmt::Expr(expr));
            }
            JsStmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.expr_root(cond);
                let then = Box::new(self.stmt_one(*then)?);
                let otherwise = match otherwise {
                    Some(otherwise) => Some(Box::new(self.stmt_one(*otherwise)?)),
                    None => None,
                };
                out.push(JsStmt::If {
                    cond,
                    then,
                    otherwise,
                });
            }
            JsStmt::For {
                init_vars,
                init,
                cond,
                incr,
                body,
            } => {
                let init_vars = init_vars
                    .into_iter()
                    .map(|mut var| {
                        if let Some(e) = var.init.take() {
                            var.init = Some(self.expr_root(e));
                        }
                        var
                    })
                    .collect();
                let init = init.map(|e| self.expr_root(e));
                // flow control diverges from visitation order: the recorded
                // location on entry to the condition or increment is
                // whatever the body last set, not the lexically previous
                // expression
                self.reset_position();
                let cond = cond.map(|e| self.expr_root(e));
                self.reset_position();
                let incr = incr.map(|e| self.expr_root(e));
                let body = Box::new(self.stmt_one(*body)?);
                out.push(JsStmt::For {
                    init_vars,
                    init,
                    cond,
                    incr,
                    body,
                });
            }
            JsStmt::While { cond, body } => {
                self.reset_position();
                let cond = self.expr_root(cond);
                let body = Box::new(self.stmt_one(*body)?);
                out.push(JsStmt::While { cond, body });
            }
            JsStmt::Return { expr, loc } => self.return_stmt(expr, loc, out)?,
            JsStmt::Throw { expr, loc } => {
                let expr = self.expr_root(expr);
                out.push(JsStmt::Throw { expr, loc });
            }
            JsStmt::Try(try_stmt) => self.try_stmt(try_stmt, out)?,
            JsStmt::Empty => out.push(JsStmt::Empty),
        }
        Ok(())
    }

    fn return_stmt(
        &mut self,
        expr: Option<JsExpr>,
        loc: SourceLocation,
        out: &mut Vec<JsStmt>,
    ) -> Result<()> {
        let expr = expr.map(|e| self.expr_root(e));

        if let Some(flag) = self.early_exit_flag() {
            // a finally block still runs in this frame; flag the early exit
            // instead of popping here
            let set_flag = self.pool.assign(
                loc.clone(),
                self.pool.name_ref(loc.clone(), flag),
                self.pool.bool(loc.clone(), true),
            );
            match expr {
                None => {
                    out.push(JsStmt::Expr(set_flag));
                    out.push(JsStmt::Return { expr: None, loc });
                }
                Some(expr) => {
                    // return (exitingEarly = true, expr)
                    let combined = self.pool.comma(loc.clone(), set_flag, expr);
                    out.push(JsStmt::Return {
                        expr: Some(combined),
                        loc,
                    });
                }
            }
            return Ok(());
        }

        match expr {
            Some(expr) if !self.analysis.can_not_throw_recursive(expr.id) => {
                // the evaluation may throw, so the pop must not precede it:
                // temp = expr; pop; return temp
                out.push(JsStmt::Expr(self.pool.assign(syn(), self.temp_ref(), expr)));
                out.push(JsStmt::Expr(self.pop_expr()));
                out.push(JsStmt::Return {
                    expr: Some(self.temp_ref()),
                    loc,
                });
            }
            expr => {
                out.push(JsStmt::Expr(self.pop_expr()));
                out.push(JsStmt::Return { expr, loc });
            }
        }
        Ok(())
    }

    fn try_stmt(&mut self, try_stmt: JsTry, out: &mut Vec<JsStmt>) -> Result<()> {
        let JsTry {
            block,
            mut catches,
            finally,
            loc,
        } = try_stmt;

        // Only the outermost finally block of a nesting chain needs the
        // early-exit treatment: its pop covers the whole chain.
        let owns_finally = finally.is_some() && self.outer_flag.is_none();
        if owns_finally {
            self.outer_flag = Some(FlagSlot { name: None });
        }

        let block = self.block(block)?;

        if owns_finally && catches.is_empty() {
            // catch blocks must be the only places flow control can jump
            // to, so the depth reset runs before the finally code does
            catches.push(self.synthetic_catch(&loc));
        } else {
            catches = catches
                .into_iter()
                .map(|c| self.catch_clause(c))
                .collect::<Result<Vec<_>>>()?;
        }

        let finally = match finally {
            Some(finally) => {
                // exceptions inside the finally block itself just exit the
                // function; clear the context so a try/finally nested in it
                // becomes its own outermost
                let slot = if owns_finally {
                    self.outer_flag.take()
                } else {
                    None
                };
                let mut finally = self.block(finally)?;
                if let Some(flag) = slot.and_then(|s| s.name) {
                    if !finally.stmts.last().map_or(false, JsStmt::is_terminal) {
                        // exitingEarly && pop()
                        finally.stmts.push(JsStmt::Expr(self.pool.binary(
                            syn(),
                            BinaryOp::And,
                            self.pool.name_ref(syn(), flag),
                            self.pop_expr(),
                        )));
                    }
                }
                Some(finally)
            }
            None => None,
        };

        out.push(JsStmt::Try(JsTry {
            block,
            catches,
            finally,
            loc,
        }));
        Ok(())
    }

    /// Every catch block resets the shared depth to this frame's slot as
    /// its first action, so browser-native exceptions are constructed with
    /// the correct depth before any catch or finally code runs.
    fn catch_clause(&mut self, catch: JsCatch) -> Result<JsCatch> {
        let JsCatch { param, body, loc } = catch;
        let mut body = self.block(body)?;
        let reset = self
            .pool
            .assign(loc.clone(), self.depth_ref(), self.stack_index_ref());
        body.stmts.insert(0, JsStmt::Expr(reset));
        Ok(JsCatch { param, body, loc })
    }

    /// `catch (e) { $stackDepth = stackIndex; e = caught(e); throw e; }`
    fn synthetic_catch(&mut self, loc: &SourceLocation) -> JsCatch {
        let param = self
            .pool
            .declare_name(self.func_scope, "JsStackEmulator_e", "e");
        let reset = self
            .pool
            .assign(loc.clone(), self.depth_ref(), self.stack_index_ref());
        let caught_call = self.pool.invoke(
            loc.clone(),
            self.pool.name_ref(loc.clone(), self.names.caught),
            vec![self.pool.name_ref(loc.clone(), param)],
        );
        let normalize = self.pool.assign(
            loc.clone(),
            self.pool.name_ref(loc.clone(), param),
            caught_call,
        );
        let rethrow = JsStmt::Throw {
            expr: self.pool.name_ref(loc.clone(), param),
            loc: loc.clone(),
        };
        JsCatch {
            param,
            body: JsBlock::new(vec![JsStmt::Expr(reset), JsStmt::Expr(normalize), rethrow]),
            loc: loc.clone(),
        }
    }

    // -- location recording -----------------------------------------------

    fn reset_position(&mut self) {
        self.last = None;
    }

    fn expr_root(&mut self, expr: JsExpr) -> JsExpr {
        if !self.record {
            return expr;
        }
        self.expr(expr, ExprCtx::default())
    }

    fn expr(&mut self, mut expr: JsExpr, ctx: ExprCtx) -> JsExpr {
        // leave exception-normalization code alone; recording locations in
        // `e = caught(e)` would only make traces more confusing
        if self.is_caught_normalization(&expr) {
            return expr;
        }
        self.parents.push(ParentFrame {
            id: expr.id,
            loc: expr.loc.clone(),
            restore: false,
            wrappable: ctx.wrappable(),
        });
        self.rewrite_children(&mut expr);
        self.parents.pop();
        self.maybe_record(expr, ctx)
    }

    fn child(&mut self, slot: &mut JsExpr, ctx: ExprCtx) {
        let owned = std::mem::replace(slot, placeholder());
        *slot = self.expr(owned, ctx);
    }

    fn rewrite_children(&mut self, expr: &mut JsExpr) {
        match &mut expr.kind {
            JsExprKind::NameRef { qualifier, .. } => {
                if let Some(q) = qualifier {
                    self.child(q, ExprCtx::default());
                }
            }
            // nested functions were instrumented on their own
            JsExprKind::This | JsExprKind::Literal(_) | JsExprKind::Function(_) => {}
            JsExprKind::Array(items) => {
                for item in items {
                    self.child(item, ExprCtx::default());
                }
            }
            JsExprKind::Binary { op, lhs, rhs } => {
                let lhs_ctx = ExprCtx {
                    lvalue: op.is_assignment(),
                    no_wrap: false,
                };
                self.child(lhs, lhs_ctx);
                self.child(rhs, ExprCtx::default());
            }
            JsExprKind::Prefix { op, arg } => {
                let ctx = match op {
                    UnaryOp::Delete | UnaryOp::TypeOf => ExprCtx {
                        lvalue: false,
                        no_wrap: true,
                    },
                    UnaryOp::Inc | UnaryOp::Dec => ExprCtx {
                        lvalue: true,
                        no_wrap: false,
                    },
                    _ => ExprCtx::default(),
                };
                self.child(arg, ctx);
            }
            JsExprKind::Postfix { op, arg } => {
                let ctx = ExprCtx {
                    lvalue: matches!(op, UnaryOp::Inc | UnaryOp::Dec),
                    no_wrap: false,
                };
                self.child(arg, ctx);
            }
            JsExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                self.child(cond, ExprCtx::default());
                self.child(then, ExprCtx::default());
                self.child(otherwise, ExprCtx::default());
            }
            JsExprKind::ArrayAccess { array, index } => {
                self.child(array, ExprCtx::default());
                self.child(index, ExprCtx::default());
            }
            JsExprKind::Invocation { target, args } => {
                // the callee must stay a reference: rewriting `"abc".indexOf`
                // into `(loc, "abc".indexOf)` would detach the receiver
                self.child(
                    target,
                    ExprCtx {
                        lvalue: false,
                        no_wrap: true,
                    },
                );
                for arg in args {
                    self.child(arg, ExprCtx::default());
                }
            }
            JsExprKind::New { ctor, args } => {
                self.child(ctor, ExprCtx::default());
                for arg in args {
                    self.child(arg, ExprCtx::default());
                }
            }
        }
    }

    /// Possibly replaces x with `($location[stackIndex] = X, x)`, and when
    /// x (or a descendant) changed the recorded location, restores the
    /// nearest restorable ancestor's location after x's evaluation:
    ///
    /// ```text
    /// ($temp = ($location[stackIndex] = X, x), ($location[stackIndex] = P, $temp))
    /// ```
    ///
    /// This mirrors actual execution order: the recorded location is always
    /// that of the next expression to be evaluated.
    fn maybe_record(&mut self, expr: JsExpr, ctx: ExprCtx) -> JsExpr {
        if !ctx.wrappable() {
            return expr;
        }
        let mut replacement = expr;

        let own_loc = replacement.loc.clone();
        if let Some(record) = self.location_assignment(replacement.id, &own_loc) {
            replacement = self.pool.comma(own_loc, record, replacement);
            // every enclosing expression's location is now stale
            for parent in &mut self.parents {
                parent.restore = true;
            }
        }

        // restore the nearest ancestor whose location went stale, if its
        // location actually differs and is worth recording
        let mut i = self.parents.len();
        while i > 0 {
            i -= 1;
            if !self.parents[i].restore || !self.parents[i].wrappable {
                continue;
            }
            let (parent_id, parent_loc) = (self.parents[i].id, self.parents[i].loc.clone());
            if let Some(restore) = self.location_assignment(parent_id, &parent_loc) {
                replacement = self.introduce_temp(replacement, restore);
                break;
            }
        }
        replacement
    }

    /// `$location[stackIndex] = <encoded location>`, or `None` when the
    /// location should not be recorded here. Updates the dedup state.
    fn location_assignment(&mut self, id: ExprId, loc: &SourceLocation) -> Option<JsExpr> {
        if loc.is_synthetic() {
            return None;
        }
        if let Some((file, line)) = &self.last {
            if *line == loc.line && file == &loc.file {
                return None;
            }
        }
        // expressions synthesized since the analysis ran are never recorded
        if !self.analysis.was_visited(id) {
            return None;
        }
        if self.analysis.can_not_throw(id) {
            return None;
        }
        self.last = Some((loc.file.clone(), loc.line));

        let value = if self.record_file_names {
            // 'Example.java:' + 42
            self.pool.binary(
                loc.clone(),
                BinaryOp::Add,
                self.pool.str(loc.clone(), format!("{}:", loc.base_name())),
                self.pool.num(loc.clone(), loc.line as f64),
            )
        } else if self.func_name.is_some() && self.func_file == loc.file {
            // same file as the function: the symbol map recovers it
            self.pool.num(loc.clone(), loc.line as f64)
        } else {
            // inlined from another file: record it, obfuscated
            let base = loc.base_name().to_owned();
            match self.obfuscator.as_deref_mut() {
                Some(obfuscator) => {
                    obfuscator.location_literal(self.pool, loc.clone(), &base, loc.line)
                }
                None => self.pool.str(loc.clone(), format!("{}:{}", base, loc.line)),
            }
        };

        let slot = self.pool.array_access(
            syn(),
            self.pool.name_ref(syn(), self.names.location),
            self.stack_index_ref(),
        );
        Some(self.pool.assign(loc.clone(), slot, value))
    }

    /// `($temp = value, (restore, $temp))`
    fn introduce_temp(&self, value: JsExpr, restore: JsExpr) -> JsExpr {
        let loc = value.loc.clone();
        let hold = self.pool.assign(loc.clone(), self.temp_ref(), value);
        let inner = self.pool.comma(loc.clone(), restore, self.temp_ref());
        self.pool.comma(loc, hold, inner)
    }

    fn is_caught_call(&self, expr: &JsExpr) -> bool {
        matches!(
            &expr.kind,
            JsExprKind::Invocation { target, .. }
                if target.unqualified_name() == Some(self.names.caught)
        )
    }

    fn is_caught_normalization(&self, expr: &JsExpr) -> bool {
        if self.is_caught_call(expr) {
            return true;
        }
        matches!(
            &expr.kind,
            JsExprKind::Binary { op, rhs, .. }
                if op.is_assignment() && self.is_caught_call(rhs)
        )
    }
}

fn placeholder() -> JsExpr {
    JsExpr {
        id: ExprId(u32::MAX),
        loc: SourceLocation::synthetic(),
        kind: JsExprKind::Literal(JsLiteral::Null),
    }
}
