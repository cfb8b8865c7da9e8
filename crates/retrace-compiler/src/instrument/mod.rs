//! The stack-instrumentation pass.
//!
//! Rewrites every function in the program to maintain an emulated call
//! stack: a push on entry, a pop at every exit point, depth resets in catch
//! blocks, early-exit bookkeeping around finally blocks, and a depth cap
//! around the construction of Throwable subtypes so the trace ends at the
//! `new` site, matching Java semantics. With location recording enabled it
//! additionally tracks the source line (and, when needed, an obfuscated
//! filename) of the expression about to be evaluated in each frame.

mod function;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use tracing::{debug, info};

use crate::analyzer::ThrowabilityAnalyzer;
use crate::java::JavaHints;
use crate::js::ast::{
    BinaryOp, JsBlock, JsExpr, JsExprKind, JsFunction, JsProgram, JsStmt, JsTry, JsVar, NameId,
    NodePool, ScopeId, SourceLocation, UnaryOp,
};
use crate::js::walk::{self, MutVisitor};
use crate::obfuscate::FileNameObfuscator;
use crate::{CompilerError, Result};

pub use crate::obfuscate::FilenameTableArtifact;

use function::FunctionInstrumenter;

pub const STACK_MODE_PROPERTY: &str = "compiler.stackMode";
pub const RECORD_LINE_NUMBERS_PROPERTY: &str = "compiler.emulatedStack.recordLineNumbers";
pub const RECORD_FILE_NAMES_PROPERTY: &str = "compiler.emulatedStack.recordFileNames";

/// The indexed name of the exception-normalization helper the front end
/// registers. Its invocations are whitelisted from instrumentation.
pub const CAUGHT_FUNCTION_INDEX: &str = "Exceptions.caught";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMode {
    /// No instrumentation at all.
    Strip,
    /// Rely on native browser traces; only pin them at exception
    /// construction so they match Java's cut-off point.
    Native,
    /// Full stack emulation.
    Emulated,
}

impl FromStr for StackMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strip" => Ok(StackMode::Strip),
            "native" => Ok(StackMode::Native),
            "emulated" => Ok(StackMode::Emulated),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmulatorOptions {
    pub stack_mode: StackMode,
    pub record_line_numbers: bool,
    pub record_file_names: bool,
}

impl EmulatorOptions {
    /// Reads the pass configuration from the build's property map. A missing
    /// or unusable `compiler.stackMode` reflects a misconfigured build and
    /// is fatal; the record flags default to off.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        let raw = props
            .get(STACK_MODE_PROPERTY)
            .ok_or_else(|| CompilerError::MissingProperty(STACK_MODE_PROPERTY.into()))?;
        let stack_mode = raw
            .parse()
            .map_err(|_| CompilerError::InvalidProperty {
                property: STACK_MODE_PROPERTY.into(),
                value: raw.clone(),
            })?;
        let record_file_names = bool_property(props, RECORD_FILE_NAMES_PROPERTY)?;
        // file names are useless without line numbers
        let record_line_numbers =
            record_file_names || bool_property(props, RECORD_LINE_NUMBERS_PROPERTY)?;
        Ok(Self {
            stack_mode,
            record_line_numbers,
            record_file_names,
        })
    }
}

fn bool_property(props: &BTreeMap<String, String>, key: &str) -> Result<bool> {
    match props.get(key) {
        None => Ok(false),
        Some(value) => value.parse().map_err(|_| CompilerError::InvalidProperty {
            property: key.into(),
            value: value.clone(),
        }),
    }
}

/// The obfuscatable global names the pass declares, plus the helper
/// functions the rewritten code calls into.
pub(crate) struct EmulatorNames {
    pub stack: NameId,
    pub depth: NameId,
    pub cap: NameId,
    pub location: NameId,
    pub temp: NameId,
    pub caught: NameId,
    pub cap_depth: NameId,
    pub stack_push: Option<NameId>,
}

pub struct StackEmulator;

impl StackEmulator {
    /// Runs the pass appropriate for the configured stack mode. Returns the
    /// filename table artifact when location recording produced one.
    pub fn exec(
        program: &mut JsProgram,
        options: &EmulatorOptions,
        hints: Option<&JavaHints>,
        permutation_id: u32,
    ) -> Result<Option<FilenameTableArtifact>> {
        match options.stack_mode {
            StackMode::Strip => {
                debug!("stack mode is strip, leaving program untouched");
                Ok(None)
            }
            StackMode::Native => {
                cap_for_native(program, hints);
                Ok(None)
            }
            StackMode::Emulated => emulate(program, options, hints, permutation_id),
        }
    }
}

fn emulate(
    program: &mut JsProgram,
    options: &EmulatorOptions,
    hints: Option<&JavaHints>,
    permutation_id: u32,
) -> Result<Option<FilenameTableArtifact>> {
    let Some(caught) = program.indexed_function(CAUGHT_FUNCTION_INDEX) else {
        // no exceptions caught anywhere: weird, but possible
        debug!("no {CAUGHT_FUNCTION_INDEX} function, skipping stack emulation");
        return Ok(None);
    };

    let names = declare_support_code(program, options, caught);
    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, hints);

    let mut pass = Pass {
        pool: &program.pool,
        names: &names,
        analyzer,
        hints,
        options,
        obfuscator: options.record_line_numbers.then(FileNameObfuscator::new),
        instrumented: 0,
    };
    pass.stmts(&mut program.global_block)?;
    info!(functions = pass.instrumented, "instrumented emulated stack");

    let artifact = match pass.obfuscator {
        Some(mut obfuscator) => {
            obfuscator.obfuscate(&mut program.global_block)?;
            obfuscator.make_artifact(permutation_id)
        }
        None => None,
    };

    rebind_root_idents(program, &names);
    Ok(artifact)
}

/// Declares the emulation globals and synthesizes the support functions,
/// inserting them at the front of the global block.
fn declare_support_code(
    program: &mut JsProgram,
    options: &EmulatorOptions,
    caught: NameId,
) -> EmulatorNames {
    let pool = &program.pool;
    let global = ScopeId::GLOBAL;
    let stack = pool.declare_name(global, "JsStackEmulator_stack", "$stack");
    let depth = pool.declare_name(global, "JsStackEmulator_stackDepth", "$stackDepth");
    let cap = pool.declare_name(global, "JsStackEmulator_stackDepthCap", "$stackDepthCap");
    let location = pool.declare_name(global, "JsStackEmulator_location", "$location");
    let temp = pool.declare_name(global, "JsStackEmulator_globalTemp", "$temp");

    let names = EmulatorNames {
        stack,
        depth,
        cap,
        location,
        temp,
        caught,
        cap_depth: pool.declare_name(global, "JsStackEmulator_capDepth", "$capDepth"),
        stack_push: options
            .record_line_numbers
            .then(|| pool.declare_name(global, "JsStackEmulator_push", "$stackPush")),
    };

    let syn = SourceLocation::synthetic;
    let vars = JsStmt::Vars(vec![
        JsVar {
            name: stack,
            init: Some(pool.expr(syn(), JsExprKind::Array(Vec::new()))),
            loc: syn(),
        },
        JsVar {
            name: depth,
            init: Some(pool.num(syn(), -1.0)),
            loc: syn(),
        },
        JsVar {
            name: cap,
            init: Some(pool.null(syn())),
            loc: syn(),
        },
        JsVar {
            name: location,
            init: Some(pool.expr(syn(), JsExprKind::Array(Vec::new()))),
            loc: syn(),
        },
        JsVar {
            name: temp,
            init: None,
            loc: syn(),
        },
    ]);

    let mut prologue = vec![vars, JsStmt::Expr(make_cap_depth_function(pool, &names))];
    if let Some(name) = names.stack_push {
        prologue.push(JsStmt::Expr(make_stack_push_function(pool, &names, name)));
    }
    program.global_block.splice(0..0, prologue);
    names
}

/// ```text
/// function $capDepth(stackIndex, closure) {
///   if ($stackDepthCap === null) $stackDepthCap = stackIndex;
///   try { return closure(); }
///   finally { if ($stackDepthCap === stackIndex) $stackDepthCap = null; }
/// }
/// ```
fn make_cap_depth_function(pool: &NodePool, names: &EmulatorNames) -> JsExpr {
    let syn = SourceLocation::synthetic;
    let scope = pool.new_scope();
    let stack_index = pool.declare_name(scope, "stackIndex", "stackIndex");
    let closure = pool.declare_name(scope, "closure", "closure");

    let pin = JsStmt::If {
        cond: pool.binary(
            syn(),
            BinaryOp::RefEq,
            pool.name_ref(syn(), names.cap),
            pool.null(syn()),
        ),
        then: Box::new(JsStmt::Expr(pool.assign(
            syn(),
            pool.name_ref(syn(), names.cap),
            pool.name_ref(syn(), stack_index),
        ))),
        otherwise: None,
    };
    let run = JsStmt::Return {
        expr: Some(pool.invoke(syn(), pool.name_ref(syn(), closure), Vec::new())),
        loc: syn(),
    };
    let unpin = JsStmt::If {
        cond: pool.binary(
            syn(),
            BinaryOp::RefEq,
            pool.name_ref(syn(), names.cap),
            pool.name_ref(syn(), stack_index),
        ),
        then: Box::new(JsStmt::Expr(pool.assign(
            syn(),
            pool.name_ref(syn(), names.cap),
            pool.null(syn()),
        ))),
        otherwise: None,
    };
    let body = JsBlock::new(vec![
        pin,
        JsStmt::Try(JsTry {
            block: JsBlock::new(vec![run]),
            catches: Vec::new(),
            finally: Some(JsBlock::new(vec![unpin])),
            loc: syn(),
        }),
    ]);
    let func = JsFunction {
        name: Some(names.cap_depth),
        params: vec![stack_index, closure],
        scope,
        body,
        loc: syn(),
    };
    pool.expr(syn(), JsExprKind::Function(Box::new(func)))
}

/// ```text
/// function $stackPush(currentFunction) {
///   $stack[++$stackDepth] = currentFunction;
///   $location[$stackDepth] = null;
///   return $stackDepth;
/// }
/// ```
fn make_stack_push_function(pool: &NodePool, names: &EmulatorNames, name: NameId) -> JsExpr {
    let syn = SourceLocation::synthetic;
    let scope = pool.new_scope();
    let current = pool.declare_name(scope, "currentFunction", "currentFunction");

    let push = JsStmt::Expr(make_stack_push_expr(
        pool,
        names,
        pool.name_ref(syn(), current),
        false,
    ));
    let clear_location = JsStmt::Expr(pool.assign(
        syn(),
        pool.array_access(
            syn(),
            pool.name_ref(syn(), names.location),
            pool.name_ref(syn(), names.depth),
        ),
        pool.null(syn()),
    ));
    let ret = JsStmt::Return {
        expr: Some(pool.name_ref(syn(), names.depth)),
        loc: syn(),
    };
    let func = JsFunction {
        name: Some(name),
        params: vec![current],
        scope,
        body: JsBlock::new(vec![push, clear_location, ret]),
        loc: syn(),
    };
    pool.expr(syn(), JsExprKind::Function(Box::new(func)))
}

/// `$stack[++$stackDepth] = fnRef`, optionally comma-extended with the new
/// depth as the expression's value.
pub(crate) fn make_stack_push_expr(
    pool: &NodePool,
    names: &EmulatorNames,
    fn_ref: JsExpr,
    yield_new_depth: bool,
) -> JsExpr {
    let syn = SourceLocation::synthetic;
    let inc = pool.prefix(syn(), UnaryOp::Inc, pool.name_ref(syn(), names.depth));
    let slot = pool.array_access(syn(), pool.name_ref(syn(), names.stack), inc);
    let push = pool.assign(syn(), slot, fn_ref);
    if yield_new_depth {
        pool.comma(syn(), push, pool.name_ref(syn(), names.depth))
    } else {
        push
    }
}

/// Per-program walk that instruments every function, innermost first.
struct Pass<'a> {
    pool: &'a NodePool,
    names: &'a EmulatorNames,
    analyzer: ThrowabilityAnalyzer<'a>,
    hints: Option<&'a JavaHints>,
    options: &'a EmulatorOptions,
    obfuscator: Option<FileNameObfuscator>,
    instrumented: usize,
}

impl<'a> Pass<'a> {
    fn stmts(&mut self, stmts: &mut Vec<JsStmt>) -> Result<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &mut JsStmt) -> Result<()> {
        match stmt {
            JsStmt::Block(block) => self.stmts(&mut block.stmts),
            JsStmt::Vars(vars) => {
                for var in vars {
                    if let Some(init) = &mut var.init {
                        self.expr(init)?;
                    }
                }
                Ok(())
            }
            JsStmt::Expr(expr) => self.expr(expr),
            JsStmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond)?;
                self.stmt(then)?;
                if let Some(otherwise) = otherwise {
                    self.stmt(otherwise)?;
                }
                Ok(())
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
                        self.expr(e)?;
                    }
                }
                for e in [init, cond, incr].into_iter().flatten() {
                    self.expr(e)?;
                }
                self.stmt(body)
            }
            JsStmt::While { cond, body } => {
                self.expr(cond)?;
                self.stmt(body)
            }
            JsStmt::Return { expr, .. } => match expr {
                Some(expr) => self.expr(expr),
                None => Ok(()),
            },
            JsStmt::Throw { expr, .. } => self.expr(expr),
            JsStmt::Try(try_stmt) => {
                self.stmts(&mut try_stmt.block.stmts)?;
                for catch in &mut try_stmt.catches {
                    self.stmts(&mut catch.body.stmts)?;
                }
                if let Some(finally) = &mut try_stmt.finally {
                    self.stmts(&mut finally.stmts)?;
                }
                Ok(())
            }
            JsStmt::Empty => Ok(()),
        }
    }

    fn expr(&mut self, expr: &mut JsExpr) -> Result<()> {
        match &mut expr.kind {
            JsExprKind::NameRef { qualifier, .. } => match qualifier {
                Some(q) => self.expr(q),
                None => Ok(()),
            },
            JsExprKind::This | JsExprKind::Literal(_) => Ok(()),
            JsExprKind::Array(items) => {
                for item in items {
                    self.expr(item)?;
                }
                Ok(())
            }
            JsExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
            JsExprKind::Prefix { arg, .. } | JsExprKind::Postfix { arg, .. } => self.expr(arg),
            JsExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond)?;
                self.expr(then)?;
                self.expr(otherwise)
            }
            JsExprKind::ArrayAccess { array, index } => {
                self.expr(array)?;
                self.expr(index)
            }
            JsExprKind::Invocation { target, args } => {
                self.expr(target)?;
                for arg in args {
                    self.expr(arg)?;
                }
                Ok(())
            }
            JsExprKind::New { ctor, args } => {
                self.expr(ctor)?;
                for arg in args {
                    self.expr(arg)?;
                }
                Ok(())
            }
            JsExprKind::Function(func) => self.function(func),
        }
    }

    fn function(&mut self, func: &mut JsFunction) -> Result<()> {
        // innermost functions first
        self.stmts(&mut func.body.stmts)?;

        if func.body.stmts.is_empty() || self.is_support_function(func.name) {
            return Ok(());
        }

        let analysis = self.analyzer.analyze_function(func);
        let mut stack_index = None;
        if analysis.needs_instrumentation() {
            let mut instrumenter = FunctionInstrumenter::new(
                self.pool,
                self.names,
                &analysis,
                self.options,
                self.obfuscator.as_mut(),
                func,
            );
            instrumenter.run(func)?;
            stack_index = instrumenter.stack_index();
            self.instrumented += 1;
        }

        if let Some(hints) = self.hints {
            wrap_exception_instantiations(
                self.pool,
                hints,
                self.names.cap_depth,
                Some(stack_index.unwrap_or(self.names.depth)),
                func,
            );
        }
        Ok(())
    }

    fn is_support_function(&self, name: Option<NameId>) -> bool {
        let Some(name) = name else { return false };
        name == self.names.caught
            || name == self.names.cap_depth
            || self.names.stack_push == Some(name)
    }
}

/// Replaces `new X(...)` with `$capDepth(stackIndex, function() { return
/// new X(...); })` for every Throwable-subtype constructor, so the trace
/// captured inside the constructor ends at the instantiation site.
fn wrap_exception_instantiations(
    pool: &NodePool,
    hints: &JavaHints,
    wrapper: NameId,
    stack_index: Option<NameId>,
    func: &mut JsFunction,
) {
    let mut visitor = ExceptionWrapper {
        pool,
        hints,
        wrapper,
        stack_index,
        descend: false,
    };
    walk::visit_stmts(&mut visitor, &mut func.body.stmts);
}

struct ExceptionWrapper<'a> {
    pool: &'a NodePool,
    hints: &'a JavaHints,
    wrapper: NameId,
    stack_index: Option<NameId>,
    /// Whether nested function bodies are wrapped by this same pass (native
    /// mode) or left for their own per-function pass (emulated mode).
    descend: bool,
}

impl MutVisitor for ExceptionWrapper<'_> {
    fn exit_expr(&mut self, expr: &mut JsExpr) {
        let JsExprKind::New { ctor, .. } = &expr.kind else {
            return;
        };
        let Some(name) = ctor.unqualified_name() else {
            return;
        };
        if !self.hints.is_throwable_ctor(&self.pool.long_ident(name)) {
            return;
        }

        let loc = expr.loc.clone();
        let instantiation = std::mem::replace(expr, self.pool.null(loc.clone()));
        let closure = JsFunction {
            name: None,
            params: Vec::new(),
            scope: self.pool.new_scope(),
            body: JsBlock::new(vec![JsStmt::Return {
                expr: Some(instantiation),
                loc: loc.clone(),
            }]),
            loc: loc.clone(),
        };
        let mut args = Vec::new();
        if let Some(stack_index) = self.stack_index {
            args.push(self.pool.name_ref(loc.clone(), stack_index));
        }
        args.push(
            self.pool
                .expr(loc.clone(), JsExprKind::Function(Box::new(closure))),
        );
        *expr = self
            .pool
            .invoke(loc.clone(), self.pool.name_ref(loc, self.wrapper), args);
    }

    // in emulated mode each function wraps its own instantiations with its
    // own stack index
    fn enter_function(&mut self, _func: &mut JsFunction) -> bool {
        self.descend
    }
}

/// Native mode: browsers produce real traces, but Java semantics still want
/// them cut off at the `new ThrowableSubtype` site. The trace collector
/// passes the `$newException` helper to `Error.captureStackTrace`, so every
/// Throwable instantiation is routed through it.
fn cap_for_native(program: &mut JsProgram, hints: Option<&JavaHints>) {
    let syn = SourceLocation::synthetic;
    let pool = &program.pool;
    let new_exception = pool.declare_name(
        ScopeId::GLOBAL,
        "JsStackEmulator_newException",
        "$newException",
    );
    // function $newException(closure) { return closure(); }
    let scope = pool.new_scope();
    let closure = pool.declare_name(scope, "closure", "closure");
    let func = JsFunction {
        name: Some(new_exception),
        params: vec![closure],
        scope,
        body: JsBlock::new(vec![JsStmt::Return {
            expr: Some(pool.invoke(syn(), pool.name_ref(syn(), closure), Vec::new())),
            loc: syn(),
        }]),
        loc: syn(),
    };
    let decl = JsStmt::Expr(pool.expr(syn(), JsExprKind::Function(Box::new(func))));
    program.global_block.insert(0, decl);

    if let Some(hints) = hints {
        // a single post-order walk visits each original instantiation once;
        // the closures it synthesizes are never revisited
        let mut wrap_pass = ExceptionWrapper {
            pool: &program.pool,
            hints,
            wrapper: new_exception,
            stack_index: None,
            descend: true,
        };
        walk::visit_stmts(&mut wrap_pass, &mut program.global_block);
    }

    let mut rebinds = HashMap::new();
    if let Some(root) = program.pool.find_root("$newException") {
        rebinds.insert(root, new_exception);
    }
    let mut rebinder = Rebinder { rebinds };
    walk::visit_stmts(&mut rebinder, &mut program.global_block);
}

/// Pre-instrumentation support code refers to the unobfuscatable root-scope
/// intrinsics. Rebind those references to the locally declared,
/// obfuscatable globals.
fn rebind_root_idents(program: &mut JsProgram, names: &EmulatorNames) {
    let mut rebinds = HashMap::new();
    for (ident, target) in [
        ("$stack", names.stack),
        ("$stackDepth", names.depth),
        ("$stackDepthCap", names.cap),
        ("$location", names.location),
    ] {
        if let Some(root) = program.pool.find_root(ident) {
            rebinds.insert(root, target);
        }
    }
    let mut rebinder = Rebinder { rebinds };
    walk::visit_stmts(&mut rebinder, &mut program.global_block);
}

struct Rebinder {
    rebinds: HashMap<NameId, NameId>,
}

impl MutVisitor for Rebinder {
    fn exit_expr(&mut self, expr: &mut JsExpr) {
        if let JsExprKind::NameRef {
            name,
            qualifier: None,
        } = &mut expr.kind
        {
            if let Some(target) = self.rebinds.get(name) {
                *name = *target;
            }
        }
    }
}

#[cfg(test)]
mod tests;
