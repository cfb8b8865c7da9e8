//! A small tree-walking interpreter over the JS IR, plus helpers to read the
//! emulated stack back out of an executed program.
//!
//! This is how instrumented programs are exercised: run the rewritten global
//! block, call into it, and inspect `$stack`/`$stackDepth`/`$stackDepthCap`/
//! `$location` afterwards. The integration tests use it to check push/pop
//! balance and depth capping over real control flow, including exceptions.
//!
//! Only the semantics the IR can express are implemented. Property access on
//! objects, prototypes and `this` binding are out; the instrumented support
//! code never needs them.

mod trace;

pub use trace::{collect_trace, dedup_trailing_recursion, EmulatedStackSnapshot, RawTraceFrame};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::js::ast::{
    BinaryOp, JsExpr, JsExprKind, JsFunction, JsLiteral, JsStmt, NameId, NodePool, ScopeId,
    UnaryOp,
};

/// A thrown JavaScript value propagating out of evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("uncaught: {0:?}")]
pub struct Thrown(pub Value);

pub type Eval<T> = std::result::Result<T, Thrown>;

/// An interpreted function together with its defining environment.
pub struct Closure {
    func: JsFunction,
    env: EnvRef,
}

impl Closure {
    pub fn name(&self) -> Option<NameId> {
        self.func.name
    }
}

pub type NativeFn = dyn Fn(&[Value]) -> Eval<Value>;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Function(Rc<Closure>),
    Native(Rc<NativeFn>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(items) => write!(f, "{:?}", items.borrow()),
            Value::Function(_) => write!(f, "[function]"),
            Value::Native(_) => write!(f, "[native]"),
        }
    }
}

impl PartialEq for Value {
    /// Strict (`===`) equality: values by value, arrays and functions by
    /// identity, `null !== undefined`.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Function(_) | Value::Native(_) => true,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "object",
            Value::Function(_) | Value::Native(_) => "function",
        }
    }

    fn as_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => format!("{other:?}"),
        }
    }
}

/// One lexical environment frame. Bindings are keyed by interned name, so
/// shadowing across recursive calls falls out of the chain structure.
#[derive(Default)]
struct Env {
    vars: RefCell<HashMap<NameId, Value>>,
    parent: Option<EnvRef>,
}

type EnvRef = Rc<Env>;

impl Env {
    fn child(parent: &EnvRef) -> EnvRef {
        Rc::new(Env {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
        })
    }

    fn get(&self, name: NameId) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(&name) {
            return Some(value.clone());
        }
        self.parent.as_ref()?.get(name)
    }

    fn define(&self, name: NameId, value: Value) {
        self.vars.borrow_mut().insert(name, value);
    }

    /// Writes an existing binding; `false` if no frame in the chain has one.
    fn assign(&self, name: NameId, value: Value) -> bool {
        if self.vars.borrow().contains_key(&name) {
            self.vars.borrow_mut().insert(name, value);
            return true;
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }
}

/// Statement completion. The IR has no break/continue, so return is the only
/// non-exceptional early exit.
enum Flow {
    Normal,
    Return(Value),
}

pub struct Interpreter<'p> {
    pool: &'p NodePool,
    globals: EnvRef,
}

impl<'p> Interpreter<'p> {
    pub fn new(pool: &'p NodePool) -> Self {
        Self {
            pool,
            globals: Rc::new(Env::default()),
        }
    }

    /// Executes a global statement block.
    pub fn run(&self, stmts: &[JsStmt]) -> Eval<()> {
        let env = Rc::clone(&self.globals);
        for stmt in stmts {
            if let Flow::Return(_) = self.stmt(stmt, &env)? {
                break;
            }
        }
        Ok(())
    }

    /// Calls a global function by name.
    pub fn call_global(&self, name: NameId, args: Vec<Value>) -> Eval<Value> {
        let callee = self.globals.get(name).ok_or_else(|| {
            Thrown(Value::Str(format!(
                "{} is not defined",
                self.pool.ident(name)
            )))
        })?;
        self.call_value(callee, args)
    }

    pub fn global(&self, name: NameId) -> Option<Value> {
        self.globals.get(name)
    }

    /// Reads a global by its short (obfuscated) identifier.
    pub fn global_by_ident(&self, short_ident: &str) -> Option<Value> {
        let name = self.pool.find_in_scope(ScopeId::GLOBAL, short_ident)?;
        self.global(name)
    }

    /// Installs a host function under a global name, for test probes.
    pub fn register_native(&self, name: NameId, f: impl Fn(&[Value]) -> Eval<Value> + 'static) {
        self.globals.define(name, Value::Native(Rc::new(f)));
    }

    // -- statements -------------------------------------------------------

    fn block(&self, stmts: &[JsStmt], env: &EnvRef) -> Eval<Flow> {
        for stmt in stmts {
            if let Flow::Return(value) = self.stmt(stmt, env)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn stmt(&self, stmt: &JsStmt, env: &EnvRef) -> Eval<Flow> {
        match stmt {
            JsStmt::Block(block) => self.block(&block.stmts, env),
            JsStmt::Vars(vars) => {
                for var in vars {
                    let value = match &var.init {
                        Some(init) => self.expr(init, env)?,
                        None => Value::Undefined,
                    };
                    env.define(var.name, value);
                }
                Ok(Flow::Normal)
            }
            JsStmt::Expr(expr) => {
                self.expr(expr, env)?;
                Ok(Flow::Normal)
            }
            JsStmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.expr(cond, env)?.truthy() {
                    self.stmt(then, env)
                } else if let Some(otherwise) = otherwise {
                    self.stmt(otherwise, env)
                } else {
                    Ok(Flow::Normal)
                }
            }
            JsStmt::While { cond, body } => {
                while self.expr(cond, env)?.truthy() {
                    if let Flow::Return(value) = self.stmt(body, env)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            JsStmt::For {
                init_vars,
                init,
                cond,
                incr,
                body,
            } => {
                for var in init_vars {
                    let value = match &var.init {
                        Some(e) => self.expr(e, env)?,
                        None => Value::Undefined,
                    };
                    env.define(var.name, value);
                }
                if let Some(init) = init {
                    self.expr(init, env)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !self.expr(cond, env)?.truthy() {
                            break;
                        }
                    }
                    if let Flow::Return(value) = self.stmt(body, env)? {
                        return Ok(Flow::Return(value));
                    }
                    if let Some(incr) = incr {
                        self.expr(incr, env)?;
                    }
                }
                Ok(Flow::Normal)
            }
            JsStmt::Return { expr, .. } => {
                let value = match expr {
                    Some(expr) => self.expr(expr, env)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            JsStmt::Throw { expr, .. } => Err(Thrown(self.expr(expr, env)?)),
            JsStmt::Try(try_stmt) => {
                let mut outcome = self.block(&try_stmt.block.stmts, env);
                if let Err(thrown) = &outcome {
                    if let Some(catch) = try_stmt.catches.first() {
                        let catch_env = Env::child(env);
                        catch_env.define(catch.param, thrown.0.clone());
                        outcome = self.block(&catch.body.stmts, &catch_env);
                    }
                }
                if let Some(finally) = &try_stmt.finally {
                    // a finally that returns or throws overrides the pending
                    // completion
                    if let Flow::Return(value) = self.block(&finally.stmts, env)? {
                        return Ok(Flow::Return(value));
                    }
                }
                outcome
            }
            JsStmt::Empty => Ok(Flow::Normal),
        }
    }

    // -- expressions ------------------------------------------------------

    fn expr(&self, expr: &JsExpr, env: &EnvRef) -> Eval<Value> {
        match &expr.kind {
            JsExprKind::NameRef { name, qualifier } => match qualifier {
                None => env.get(*name).ok_or_else(|| {
                    Thrown(Value::Str(format!(
                        "{} is not defined",
                        self.pool.ident(*name)
                    )))
                }),
                Some(qualifier) => {
                    let receiver = self.expr(qualifier, env)?;
                    if matches!(receiver, Value::Null | Value::Undefined) {
                        return Err(Thrown(Value::Str(format!(
                            "cannot read {} of {receiver:?}",
                            self.pool.ident(*name)
                        ))));
                    }
                    // property model: absent
                    Ok(Value::Undefined)
                }
            },
            JsExprKind::This => Ok(Value::Undefined),
            JsExprKind::Literal(lit) => Ok(match lit {
                JsLiteral::Null => Value::Null,
                JsLiteral::Undefined => Value::Undefined,
                JsLiteral::Bool(b) => Value::Bool(*b),
                JsLiteral::Num(n) => Value::Num(*n),
                JsLiteral::Str(s) => Value::Str(s.clone()),
            }),
            JsExprKind::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.expr(item, env)?);
                }
                Ok(Value::Array(Rc::new(RefCell::new(values))))
            }
            JsExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, env),
            JsExprKind::Prefix { op, arg } => match op {
                UnaryOp::Not => Ok(Value::Bool(!self.expr(arg, env)?.truthy())),
                UnaryOp::Neg => Ok(Value::Num(-self.number(arg, env)?)),
                UnaryOp::Void => {
                    self.expr(arg, env)?;
                    Ok(Value::Undefined)
                }
                UnaryOp::TypeOf => {
                    // typeof never throws on unbound names
                    if let Some(name) = arg.unqualified_name() {
                        if env.get(name).is_none() {
                            return Ok(Value::Str("undefined".to_owned()));
                        }
                    }
                    let value = self.expr(arg, env)?;
                    Ok(Value::Str(value.type_name().to_owned()))
                }
                UnaryOp::Delete => {
                    if let JsExprKind::ArrayAccess { array, index } = &arg.kind {
                        let items = self.array(array, env)?;
                        let idx = self.index(index, env)?;
                        let mut items = items.borrow_mut();
                        if idx < items.len() {
                            items[idx] = Value::Undefined;
                        }
                    } else {
                        self.expr(arg, env)?;
                    }
                    Ok(Value::Bool(true))
                }
                UnaryOp::Inc => self.step(arg, env, 1.0, true),
                UnaryOp::Dec => self.step(arg, env, -1.0, true),
            },
            JsExprKind::Postfix { op, arg } => match op {
                UnaryOp::Inc => self.step(arg, env, 1.0, false),
                UnaryOp::Dec => self.step(arg, env, -1.0, false),
                other => Err(Thrown(Value::Str(format!(
                    "unsupported postfix operator {other:?}"
                )))),
            },
            JsExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.expr(cond, env)?.truthy() {
                    self.expr(then, env)
                } else {
                    self.expr(otherwise, env)
                }
            }
            JsExprKind::ArrayAccess { array, index } => {
                let items = self.array(array, env)?;
                let idx = self.index(index, env)?;
                let items = items.borrow();
                Ok(items.get(idx).cloned().unwrap_or(Value::Undefined))
            }
            JsExprKind::Invocation { target, args } => {
                let callee = self.expr(target, env)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expr(arg, env)?);
                }
                self.call_value(callee, values)
            }
            JsExprKind::New { ctor, args } => {
                // constructors are plain functions here; their return value
                // stands in for the constructed object
                let callee = self.expr(ctor, env)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expr(arg, env)?);
                }
                self.call_value(callee, values)
            }
            JsExprKind::Function(func) => {
                let closure = Value::Function(Rc::new(Closure {
                    func: (**func).clone(),
                    env: Rc::clone(env),
                }));
                if let Some(name) = func.name {
                    env.define(name, closure.clone());
                }
                Ok(closure)
            }
        }
    }

    fn binary(&self, op: BinaryOp, lhs: &JsExpr, rhs: &JsExpr, env: &EnvRef) -> Eval<Value> {
        match op {
            BinaryOp::Assign => {
                let value = self.expr(rhs, env)?;
                self.write_target(lhs, env, value.clone())?;
                Ok(value)
            }
            BinaryOp::Comma => {
                self.expr(lhs, env)?;
                self.expr(rhs, env)
            }
            BinaryOp::And => {
                let left = self.expr(lhs, env)?;
                if left.truthy() {
                    self.expr(rhs, env)
                } else {
                    Ok(left)
                }
            }
            BinaryOp::Or => {
                let left = self.expr(lhs, env)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    self.expr(rhs, env)
                }
            }
            BinaryOp::Add => {
                let left = self.expr(lhs, env)?;
                let right = self.expr(rhs, env)?;
                match (&left, &right) {
                    (Value::Str(_), _) | (_, Value::Str(_)) => {
                        Ok(Value::Str(left.as_string() + &right.as_string()))
                    }
                    _ => Ok(Value::Num(to_number(&left)? + to_number(&right)?)),
                }
            }
            BinaryOp::RefEq => Ok(Value::Bool(self.expr(lhs, env)? == self.expr(rhs, env)?)),
            BinaryOp::RefNeq => Ok(Value::Bool(self.expr(lhs, env)? != self.expr(rhs, env)?)),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Lt | BinaryOp::Gt => {
                let left = self.number(lhs, env)?;
                let right = self.number(rhs, env)?;
                Ok(match op {
                    BinaryOp::Sub => Value::Num(left - right),
                    BinaryOp::Mul => Value::Num(left * right),
                    BinaryOp::Div => Value::Num(left / right),
                    BinaryOp::Lt => Value::Bool(left < right),
                    _ => Value::Bool(left > right),
                })
            }
        }
    }

    /// Shared read-modify-write for `++`/`--`, both fixities.
    fn step(&self, target: &JsExpr, env: &EnvRef, delta: f64, yield_new: bool) -> Eval<Value> {
        let old = to_number(&self.expr(target, env)?)?;
        let new = old + delta;
        self.write_target(target, env, Value::Num(new))?;
        Ok(Value::Num(if yield_new { new } else { old }))
    }

    fn write_target(&self, target: &JsExpr, env: &EnvRef, value: Value) -> Eval<()> {
        match &target.kind {
            JsExprKind::NameRef {
                name,
                qualifier: None,
            } => {
                // assignment to an unbound name creates a global
                if !env.assign(*name, value.clone()) {
                    self.globals.define(*name, value);
                }
                Ok(())
            }
            JsExprKind::ArrayAccess { array, index } => {
                let items = self.array(array, env)?;
                let idx = self.index(index, env)?;
                let mut items = items.borrow_mut();
                if idx >= items.len() {
                    items.resize(idx + 1, Value::Undefined);
                }
                items[idx] = value;
                Ok(())
            }
            other => Err(Thrown(Value::Str(format!(
                "unsupported assignment target {other:?}"
            )))),
        }
    }

    fn call_value(&self, callee: Value, args: Vec<Value>) -> Eval<Value> {
        match callee {
            Value::Function(closure) => {
                let call_env = Env::child(&closure.env);
                for (i, param) in closure.func.params.iter().enumerate() {
                    let arg = args.get(i).cloned().unwrap_or(Value::Undefined);
                    call_env.define(*param, arg);
                }
                match self.block(&closure.func.body.stmts, &call_env)? {
                    Flow::Return(value) => Ok(value),
                    Flow::Normal => Ok(Value::Undefined),
                }
            }
            Value::Native(f) => f(&args),
            other => Err(Thrown(Value::Str(format!(
                "{} is not a function",
                other.type_name()
            )))),
        }
    }

    fn number(&self, expr: &JsExpr, env: &EnvRef) -> Eval<f64> {
        to_number(&self.expr(expr, env)?)
    }

    fn array(&self, expr: &JsExpr, env: &EnvRef) -> Eval<Rc<RefCell<Vec<Value>>>> {
        match self.expr(expr, env)? {
            Value::Array(items) => Ok(items),
            other => Err(Thrown(Value::Str(format!(
                "{} is not an array",
                other.type_name()
            )))),
        }
    }

    fn index(&self, expr: &JsExpr, env: &EnvRef) -> Eval<usize> {
        let n = self.number(expr, env)?;
        if n < 0.0 || n.fract() != 0.0 {
            return Err(Thrown(Value::Str(format!("bad array index {n}"))));
        }
        Ok(n as usize)
    }
}

fn to_number(value: &Value) -> Eval<f64> {
    match value {
        Value::Num(n) => Ok(*n),
        Value::Bool(true) => Ok(1.0),
        Value::Bool(false) | Value::Null => Ok(0.0),
        Value::Undefined => Ok(f64::NAN),
        other => Err(Thrown(Value::Str(format!(
            "{} is not a number",
            other.type_name()
        )))),
    }
}
