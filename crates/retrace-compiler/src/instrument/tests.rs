use std::collections::BTreeMap;

use pretty_assertions::assert_eq;

use super::*;
use crate::js::ast::JsLiteral;
use crate::js::JsCatch;

fn loc(line: u32) -> SourceLocation {
    SourceLocation::new("Example.java", line)
}

fn options(stack_mode: StackMode) -> EmulatorOptions {
    EmulatorOptions {
        stack_mode,
        record_line_numbers: false,
        record_file_names: false,
    }
}

/// A program whose front end registered the exception-normalization helper.
fn new_program() -> JsProgram {
    let mut program = JsProgram::new();
    let caught = program
        .pool
        .declare_name(ScopeId::GLOBAL, "Exceptions_caught", "caught");
    program
        .indexed_functions
        .insert(CAUGHT_FUNCTION_INDEX.to_owned(), caught);
    program
}

fn add_named_function(
    program: &mut JsProgram,
    ident: &str,
    make_body: impl FnOnce(&NodePool, ScopeId) -> Vec<JsStmt>,
) -> NameId {
    let pool = &program.pool;
    let name = pool.declare_name(ScopeId::GLOBAL, ident, ident);
    let scope = pool.new_scope();
    let body = JsBlock::new(make_body(pool, scope));
    let func = JsFunction {
        name: Some(name),
        params: Vec::new(),
        scope,
        body,
        loc: loc(1),
    };
    let expr = pool.expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(expr));
    name
}

fn function_named(program: &JsProgram, name: NameId) -> &JsFunction {
    program
        .global_block
        .iter()
        .find_map(|stmt| match stmt {
            JsStmt::Expr(JsExpr {
                kind: JsExprKind::Function(f),
                ..
            }) if f.name == Some(name) => Some(f.as_ref()),
            _ => None,
        })
        .expect("function not found in global block")
}

fn unwrap_expr(stmt: &JsStmt) -> &JsExpr {
    match stmt {
        JsStmt::Expr(expr) => expr,
        other => panic!("expected an expression statement, got {other:?}"),
    }
}

fn short_ident(pool: &NodePool, expr: &JsExpr) -> String {
    pool.ident(expr.unqualified_name().expect("expected a name reference"))
}

/// `$stack[++$stackDepth] = <pushed>`
fn assert_push(pool: &NodePool, expr: &JsExpr, pushed: NameId) {
    let JsExprKind::Binary {
        op: BinaryOp::Assign,
        lhs,
        rhs,
    } = &expr.kind
    else {
        panic!("expected a push assignment, got {expr:?}");
    };
    let JsExprKind::ArrayAccess { array, index } = &lhs.kind else {
        panic!("expected a stack slot, got {lhs:?}");
    };
    assert_eq!(short_ident(pool, array), "$stack");
    let JsExprKind::Prefix {
        op: UnaryOp::Inc,
        arg,
    } = &index.kind
    else {
        panic!("expected a depth pre-increment, got {index:?}");
    };
    assert_eq!(short_ident(pool, arg), "$stackDepth");
    assert_eq!(rhs.unqualified_name(), Some(pushed));
}

/// `$stackDepth--`
fn assert_simple_pop(pool: &NodePool, expr: &JsExpr) {
    let JsExprKind::Postfix {
        op: UnaryOp::Dec,
        arg,
    } = &expr.kind
    else {
        panic!("expected a depth decrement, got {expr:?}");
    };
    assert_eq!(short_ident(pool, arg), "$stackDepth");
}

/// `$stackDepth = stackIndex - 1`
fn assert_indexed_pop(pool: &NodePool, expr: &JsExpr) {
    let JsExprKind::Binary {
        op: BinaryOp::Assign,
        lhs,
        rhs,
    } = &expr.kind
    else {
        panic!("expected a pop assignment, got {expr:?}");
    };
    assert_eq!(short_ident(pool, lhs), "$stackDepth");
    let JsExprKind::Binary {
        op: BinaryOp::Sub,
        lhs: index,
        ..
    } = &rhs.kind
    else {
        panic!("expected stackIndex - 1, got {rhs:?}");
    };
    assert_eq!(short_ident(pool, index), "stackIndex");
}

// -- option parsing -------------------------------------------------------

#[test]
fn stack_mode_property_is_required() {
    let err = EmulatorOptions::from_properties(&BTreeMap::new()).unwrap_err();
    assert!(matches!(err, CompilerError::MissingProperty(p) if p == STACK_MODE_PROPERTY));
}

#[test]
fn unknown_stack_mode_is_fatal() {
    let mut props = BTreeMap::new();
    props.insert(STACK_MODE_PROPERTY.to_owned(), "sideways".to_owned());
    let err = EmulatorOptions::from_properties(&props).unwrap_err();
    assert!(matches!(err, CompilerError::InvalidProperty { value, .. } if value == "sideways"));
}

#[test]
fn record_file_names_implies_line_numbers() {
    let mut props = BTreeMap::new();
    props.insert(STACK_MODE_PROPERTY.to_owned(), "EMULATED".to_owned());
    props.insert(RECORD_FILE_NAMES_PROPERTY.to_owned(), "true".to_owned());
    let opts = EmulatorOptions::from_properties(&props).unwrap();
    assert_eq!(opts.stack_mode, StackMode::Emulated);
    assert!(opts.record_file_names);
    assert!(opts.record_line_numbers);
}

// -- mode dispatch --------------------------------------------------------

#[test]
fn strip_mode_leaves_the_program_untouched() {
    let mut program = new_program();
    add_named_function(&mut program, "foo", |pool, _| {
        vec![JsStmt::Return {
            expr: Some(pool.num(loc(2), 1.0)),
            loc: loc(2),
        }]
    });
    let before = program.global_block.clone();
    let artifact =
        StackEmulator::exec(&mut program, &options(StackMode::Strip), None, 0).unwrap();
    assert!(artifact.is_none());
    assert_eq!(program.global_block, before);
}

#[test]
fn missing_caught_function_skips_emulation() {
    let mut program = JsProgram::new();
    add_named_function(&mut program, "foo", |pool, _| {
        let bar = pool.declare_name(ScopeId::GLOBAL, "bar", "bar");
        vec![JsStmt::Expr(pool.invoke(
            loc(2),
            pool.name_ref(loc(2), bar),
            Vec::new(),
        ))]
    });
    let before = program.global_block.clone();
    let artifact =
        StackEmulator::exec(&mut program, &options(StackMode::Emulated), None, 0).unwrap();
    assert!(artifact.is_none());
    assert_eq!(program.global_block, before);
}

// -- entry/exit instrumentation -------------------------------------------

#[test]
fn calls_get_push_and_pop_around_the_body() {
    let mut program = new_program();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        let bar = pool.declare_name(ScopeId::GLOBAL, "bar", "bar");
        vec![JsStmt::Expr(pool.invoke(
            loc(3),
            pool.name_ref(loc(3), bar),
            Vec::new(),
        ))]
    });
    StackEmulator::exec(&mut program, &options(StackMode::Emulated), None, 0).unwrap();

    let pool = &program.pool;
    let func = function_named(&program, foo);
    assert_eq!(func.body.stmts.len(), 3);
    assert_push(pool, unwrap_expr(&func.body.stmts[0]), foo);
    assert_simple_pop(pool, unwrap_expr(&func.body.stmts[2]));
}

#[test]
fn provably_safe_functions_are_left_alone() {
    let mut program = new_program();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        vec![JsStmt::Return {
            expr: Some(pool.binary(
                loc(2),
                BinaryOp::Add,
                pool.num(loc(2), 1.0),
                pool.num(loc(2), 2.0),
            )),
            loc: loc(2),
        }]
    });
    StackEmulator::exec(&mut program, &options(StackMode::Emulated), None, 0).unwrap();
    assert_eq!(function_named(&program, foo).body.stmts.len(), 1);
}

#[test]
fn return_value_that_may_throw_is_held_in_a_temp() {
    let mut program = new_program();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        let bar = pool.declare_name(ScopeId::GLOBAL, "bar", "bar");
        vec![JsStmt::Return {
            expr: Some(pool.invoke(loc(4), pool.name_ref(loc(4), bar), Vec::new())),
            loc: loc(4),
        }]
    });
    StackEmulator::exec(&mut program, &options(StackMode::Emulated), None, 0).unwrap();

    let pool = &program.pool;
    let func = function_named(&program, foo);
    // push; $temp = bar(); pop; return $temp
    assert_eq!(func.body.stmts.len(), 4);
    let hold = unwrap_expr(&func.body.stmts[1]);
    let JsExprKind::Binary {
        op: BinaryOp::Assign,
        lhs,
        ..
    } = &hold.kind
    else {
        panic!("expected the return value held in a temp, got {hold:?}");
    };
    assert_eq!(short_ident(pool, lhs), "$temp");
    assert_simple_pop(pool, unwrap_expr(&func.body.stmts[2]));
    let JsStmt::Return {
        expr: Some(returned),
        ..
    } = &func.body.stmts[3]
    else {
        panic!("expected a trailing return");
    };
    assert_eq!(short_ident(pool, returned), "$temp");
}

// -- try/catch/finally ----------------------------------------------------

#[test]
fn catch_blocks_reset_the_shared_depth() {
    let mut program = new_program();
    let foo = add_named_function(&mut program, "foo", |pool, scope| {
        let bar = pool.declare_name(ScopeId::GLOBAL, "bar", "bar");
        let err = pool.declare_name(scope, "err", "err");
        vec![JsStmt::Try(JsTry {
            block: JsBlock::new(vec![JsStmt::Expr(pool.invoke(
                loc(3),
                pool.name_ref(loc(3), bar),
                Vec::new(),
            ))]),
            catches: vec![JsCatch {
                param: err,
                body: JsBlock::default(),
                loc: loc(4),
            }],
            finally: None,
            loc: loc(2),
        })]
    });
    StackEmulator::exec(&mut program, &options(StackMode::Emulated), None, 0).unwrap();

    let pool = &program.pool;
    let func = function_named(&program, foo);
    assert_eq!(func.body.stmts.len(), 3);

    // var stackIndex = ($stack[++$stackDepth] = foo, $stackDepth)
    let JsStmt::Vars(vars) = &func.body.stmts[0] else {
        panic!("expected the stack-slot declaration first");
    };
    assert_eq!(vars.len(), 1);
    assert_eq!(pool.ident(vars[0].name), "stackIndex");
    let init = vars[0].init.as_ref().expect("stackIndex needs an init");
    let JsExprKind::Binary {
        op: BinaryOp::Comma,
        lhs,
        rhs,
    } = &init.kind
    else {
        panic!("expected (push, depth), got {init:?}");
    };
    assert_push(pool, lhs, foo);
    assert_eq!(short_ident(pool, rhs), "$stackDepth");

    // the catch body starts with $stackDepth = stackIndex
    let JsStmt::Try(try_stmt) = &func.body.stmts[1] else {
        panic!("expected the try statement");
    };
    let reset = unwrap_expr(&try_stmt.catches[0].body.stmts[0]);
    let JsExprKind::Binary {
        op: BinaryOp::Assign,
        lhs,
        rhs,
    } = &reset.kind
    else {
        panic!("expected a depth reset, got {reset:?}");
    };
    assert_eq!(short_ident(pool, lhs), "$stackDepth");
    assert_eq!(short_ident(pool, rhs), "stackIndex");

    assert_indexed_pop(pool, unwrap_expr(&func.body.stmts[2]));
}

#[test]
fn catchless_finally_gets_a_synthetic_catch_and_early_exit_pop() {
    let mut program = new_program();
    let caught = program.indexed_function(CAUGHT_FUNCTION_INDEX).unwrap();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        let bar = pool.declare_name(ScopeId::GLOBAL, "bar", "bar");
        vec![JsStmt::Try(JsTry {
            block: JsBlock::new(vec![JsStmt::Return {
                expr: Some(pool.invoke(loc(3), pool.name_ref(loc(3), bar), Vec::new())),
                loc: loc(3),
            }]),
            catches: Vec::new(),
            finally: Some(JsBlock::default()),
            loc: loc(2),
        })]
    });
    StackEmulator::exec(&mut program, &options(StackMode::Emulated), None, 0).unwrap();

    let pool = &program.pool;
    let func = function_named(&program, foo);

    // the early-exit flag joins stackIndex in the declaration
    let JsStmt::Vars(vars) = &func.body.stmts[0] else {
        panic!("expected the stack-slot declaration first");
    };
    assert_eq!(vars.len(), 2);
    assert_eq!(pool.ident(vars[1].name), "exitingEarly");
    assert!(vars[1].init.is_none());

    let JsStmt::Try(try_stmt) = &func.body.stmts[1] else {
        panic!("expected the try statement");
    };

    // return (exitingEarly = true, bar()) instead of popping inside the try
    let JsStmt::Return {
        expr: Some(returned),
        ..
    } = &try_stmt.block.stmts[0]
    else {
        panic!("expected the rewritten return");
    };
    let JsExprKind::Binary {
        op: BinaryOp::Comma,
        lhs,
        ..
    } = &returned.kind
    else {
        panic!("expected (flag, value), got {returned:?}");
    };
    let JsExprKind::Binary {
        op: BinaryOp::Assign,
        lhs: flag,
        rhs: truth,
    } = &lhs.kind
    else {
        panic!("expected the flag assignment, got {lhs:?}");
    };
    assert_eq!(short_ident(pool, flag), "exitingEarly");
    assert_eq!(truth.kind, JsExprKind::Literal(JsLiteral::Bool(true)));

    // catch (e) { $stackDepth = stackIndex; e = caught(e); throw e; }
    assert_eq!(try_stmt.catches.len(), 1);
    let synthetic = &try_stmt.catches[0];
    assert_eq!(synthetic.body.stmts.len(), 3);
    let normalize = unwrap_expr(&synthetic.body.stmts[1]);
    let JsExprKind::Binary {
        op: BinaryOp::Assign,
        rhs,
        ..
    } = &normalize.kind
    else {
        panic!("expected e = caught(e), got {normalize:?}");
    };
    let JsExprKind::Invocation { target, .. } = &rhs.kind else {
        panic!("expected a caught() call, got {rhs:?}");
    };
    assert_eq!(target.unqualified_name(), Some(caught));
    assert!(matches!(
        &synthetic.body.stmts[2],
        JsStmt::Throw { expr, .. } if expr.unqualified_name() == Some(synthetic.param)
    ));

    // finally { exitingEarly && ($stackDepth = stackIndex - 1) }
    let finally = try_stmt.finally.as_ref().unwrap();
    assert_eq!(finally.stmts.len(), 1);
    let guard = unwrap_expr(&finally.stmts[0]);
    let JsExprKind::Binary {
        op: BinaryOp::And,
        lhs,
        rhs,
    } = &guard.kind
    else {
        panic!("expected a guarded pop, got {guard:?}");
    };
    assert_eq!(short_ident(pool, lhs), "exitingEarly");
    assert_indexed_pop(pool, rhs);
}

// -- exception capping ----------------------------------------------------

#[test]
fn throwable_instantiations_are_depth_capped() {
    let mut program = new_program();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        let ctor = pool.declare_name(ScopeId::GLOBAL, "MyException", "MyException");
        let instantiation = pool.expr(
            loc(5),
            JsExprKind::New {
                ctor: Box::new(pool.name_ref(loc(5), ctor)),
                args: Vec::new(),
            },
        );
        vec![JsStmt::Throw {
            expr: instantiation,
            loc: loc(5),
        }]
    });
    let mut hints = JavaHints::new();
    hints.add_throwable_ctor("MyException");
    StackEmulator::exec(&mut program, &options(StackMode::Emulated), Some(&hints), 0).unwrap();

    let pool = &program.pool;
    let func = function_named(&program, foo);
    // push; throw $capDepth($stackDepth, function() { return new MyException(); })
    assert_eq!(func.body.stmts.len(), 2);
    let JsStmt::Throw { expr, .. } = &func.body.stmts[1] else {
        panic!("expected the throw statement");
    };
    let JsExprKind::Invocation { target, args } = &expr.kind else {
        panic!("expected a $capDepth call, got {expr:?}");
    };
    assert_eq!(short_ident(pool, target), "$capDepth");
    assert_eq!(args.len(), 2);
    assert_eq!(short_ident(pool, &args[0]), "$stackDepth");
    let JsExprKind::Function(closure) = &args[1].kind else {
        panic!("expected a closure argument, got {:?}", args[1]);
    };
    assert!(matches!(
        &closure.body.stmts[0],
        JsStmt::Return {
            expr: Some(JsExpr {
                kind: JsExprKind::New { .. },
                ..
            }),
            ..
        }
    ));
}

#[test]
fn native_mode_routes_instantiations_through_new_exception() {
    let mut program = JsProgram::new();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        let ctor = pool.declare_name(ScopeId::GLOBAL, "MyException", "MyException");
        let instantiation = pool.expr(
            loc(5),
            JsExprKind::New {
                ctor: Box::new(pool.name_ref(loc(5), ctor)),
                args: Vec::new(),
            },
        );
        vec![JsStmt::Expr(instantiation)]
    });
    let mut hints = JavaHints::new();
    hints.add_throwable_ctor("MyException");
    StackEmulator::exec(&mut program, &options(StackMode::Native), Some(&hints), 0).unwrap();

    let pool = &program.pool;
    // the helper is declared up front
    let helper = unwrap_expr(&program.global_block[0]);
    let JsExprKind::Function(helper) = &helper.kind else {
        panic!("expected the $newException declaration, got {helper:?}");
    };
    assert_eq!(pool.ident(helper.name.unwrap()), "$newException");

    // the instantiation is routed through it, without a stack index
    let func = function_named(&program, foo);
    let wrapped = unwrap_expr(&func.body.stmts[0]);
    let JsExprKind::Invocation { target, args } = &wrapped.kind else {
        panic!("expected a $newException call, got {wrapped:?}");
    };
    assert_eq!(short_ident(pool, target), "$newException");
    assert_eq!(args.len(), 1);
    assert!(matches!(&args[0].kind, JsExprKind::Function(_)));
}

// -- root-scope rebinding -------------------------------------------------

#[test]
fn support_library_references_are_rebound_to_globals() {
    let mut program = new_program();
    let root_depth = program.pool.find_root("$stackDepth").unwrap();
    program.global_block.push(JsStmt::Expr(
        program.pool.name_ref(loc(1), root_depth),
    ));
    StackEmulator::exec(&mut program, &options(StackMode::Emulated), None, 0).unwrap();

    let reference = unwrap_expr(program.global_block.last().unwrap());
    let name = reference.unqualified_name().unwrap();
    assert_eq!(program.pool.long_ident(name), "JsStackEmulator_stackDepth");
    assert_eq!(program.pool.scope_of(name), ScopeId::GLOBAL);
}

// -- location recording ---------------------------------------------------

fn recording_options() -> EmulatorOptions {
    EmulatorOptions {
        stack_mode: StackMode::Emulated,
        record_line_numbers: true,
        record_file_names: false,
    }
}

/// `($location[$stackDepth] = <value>, <call>)`
fn unwrap_recorded<'a>(expr: &'a JsExpr, pool: &NodePool) -> (&'a JsExpr, &'a JsExpr) {
    let JsExprKind::Binary {
        op: BinaryOp::Comma,
        lhs,
        rhs,
    } = &expr.kind
    else {
        panic!("expected a location-recording comma, got {expr:?}");
    };
    let JsExprKind::Binary {
        op: BinaryOp::Assign,
        lhs: slot,
        rhs: value,
    } = &lhs.kind
    else {
        panic!("expected a location assignment, got {lhs:?}");
    };
    let JsExprKind::ArrayAccess { array, .. } = &slot.kind else {
        panic!("expected a $location slot, got {slot:?}");
    };
    assert_eq!(short_ident(pool, array), "$location");
    (value, rhs)
}

#[test]
fn line_numbers_are_recorded_and_deduplicated() {
    let mut program = new_program();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        let bar = pool.declare_name(ScopeId::GLOBAL, "bar", "bar");
        let call = |line| {
            JsStmt::Expr(pool.invoke(loc(line), pool.name_ref(loc(line), bar), Vec::new()))
        };
        vec![call(5), call(5), call(6)]
    });
    let artifact = StackEmulator::exec(&mut program, &recording_options(), None, 0).unwrap();
    // all locations were in the function's own file: no table needed
    assert!(artifact.is_none());

    let pool = &program.pool;
    let func = function_named(&program, foo);
    assert_eq!(func.body.stmts.len(), 5);

    // recording mode pushes through the helper
    let entry = unwrap_expr(&func.body.stmts[0]);
    let JsExprKind::Invocation { target, args } = &entry.kind else {
        panic!("expected a $stackPush call, got {entry:?}");
    };
    assert_eq!(short_ident(pool, target), "$stackPush");
    assert_eq!(args[0].unqualified_name(), Some(foo));

    // first call records line 5 as a bare number (same file as foo)
    let (value, _) = unwrap_recorded(unwrap_expr(&func.body.stmts[1]), pool);
    assert_eq!(value.kind, JsExprKind::Literal(JsLiteral::Num(5.0)));

    // second call on the same line is not re-recorded
    assert!(matches!(
        &unwrap_expr(&func.body.stmts[2]).kind,
        JsExprKind::Invocation { .. }
    ));

    // the line change is recorded again
    let (value, _) = unwrap_recorded(unwrap_expr(&func.body.stmts[3]), pool);
    assert_eq!(value.kind, JsExprKind::Literal(JsLiteral::Num(6.0)));
}

#[test]
fn cross_file_locations_are_obfuscated_into_the_table() {
    let mut program = new_program();
    let foo = add_named_function(&mut program, "foo", |pool, _| {
        let bar = pool.declare_name(ScopeId::GLOBAL, "bar", "bar");
        let inlined = SourceLocation::new("Other.java", 17);
        vec![JsStmt::Expr(pool.invoke(
            inlined.clone(),
            pool.name_ref(inlined, bar),
            Vec::new(),
        ))]
    });
    let artifact = StackEmulator::exec(&mut program, &recording_options(), None, 7)
        .unwrap()
        .expect("a cross-file location must produce a filename table");
    assert_eq!(artifact.permutation_id, 7);
    assert_eq!(artifact.filenames, vec!["Other.java"]);

    let pool = &program.pool;
    let func = function_named(&program, foo);
    let (value, _) = unwrap_recorded(unwrap_expr(&func.body.stmts[1]), pool);
    assert_eq!(
        value.kind,
        JsExprKind::Literal(JsLiteral::Str("0:17".to_owned()))
    );
}
