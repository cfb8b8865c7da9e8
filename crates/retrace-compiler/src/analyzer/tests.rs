use pretty_assertions::assert_eq;

use super::*;
use crate::java::JavaHints;
use crate::js::ast::{BinaryOp, JsBlock, JsProgram, JsStmt, JsTry, UnaryOp};

fn loc(line: u32) -> SourceLocation {
    SourceLocation::new("Widget.java", line)
}

fn the_fn(program: &JsProgram) -> &JsFunction {
    match &program.global_block[0] {
        JsStmt::Expr(JsExpr {
            kind: JsExprKind::Function(func),
            ..
        }) => func,
        other => panic!("unexpected global statement: {other:?}"),
    }
}

#[test]
fn literal_comparisons_cannot_throw() {
    let mut program = JsProgram::new();
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let cmp = program.pool.binary(
        loc(2),
        BinaryOp::RefEq,
        program.pool.num(loc(2), 1.0),
        program.pool.num(loc(2), 2.0),
    );
    let func = program.pool.function(
        loc(1),
        Some(f),
        vec![],
        JsBlock::new(vec![JsStmt::Return {
            expr: Some(cmp),
            loc: loc(2),
        }]),
    );
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, None);
    let analysis = analyzer.analyze_function(the_fn(&program));

    assert!(analysis.nothing_can_throw);
    assert!(!analysis.contains_try);
    assert!(!analysis.needs_instrumentation());
}

#[test]
fn invocation_of_declared_global_forces_instrumentation() {
    let mut program = JsProgram::new();
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let g = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::helper()", "g");
    let call = program
        .pool
        .invoke(loc(3), program.pool.name_ref(loc(3), g), vec![]);
    let call_id = call.id;
    let callee_id = match &call.kind {
        JsExprKind::Invocation { target, .. } => target.id,
        _ => unreachable!(),
    };
    let func = program.pool.function(
        loc(1),
        Some(f),
        vec![],
        JsBlock::new(vec![JsStmt::Expr(call)]),
    );
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));
    program.global_block.push(JsStmt::Vars(vec![crate::js::ast::JsVar {
        name: g,
        init: None,
        loc: loc(1),
    }]));

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, None);
    let analysis = analyzer.analyze_function(the_fn(&program));

    assert!(!analysis.nothing_can_throw);
    assert!(analysis.needs_instrumentation());
    // the call may throw, the read of the declared global g may not
    assert!(!analysis.can_not_throw(call_id));
    assert!(analysis.can_not_throw(callee_id));
    assert!(analysis.was_visited(call_id));
}

#[test]
fn implicit_global_read_may_throw() {
    let mut program = JsProgram::new();
    // referenced but never declared in the global block
    let phantom = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::phantom", "q");
    let read = program.pool.name_ref(loc(2), phantom);
    let read_id = read.id;
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let func = program.pool.function(
        loc(1),
        Some(f),
        vec![],
        JsBlock::new(vec![JsStmt::Expr(read)]),
    );
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, None);
    let analysis = analyzer.analyze_function(the_fn(&program));

    assert!(!analysis.can_not_throw(read_id));
    assert!(!analysis.nothing_can_throw);
}

#[test]
fn function_locals_cannot_throw() {
    let mut program = JsProgram::new();
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let scope = program.pool.new_scope();
    let a = program.pool.declare_name(scope, "a", "a");
    let assign = program.pool.assign(
        loc(2),
        program.pool.name_ref(loc(2), a),
        program.pool.num(loc(2), 7.0),
    );
    let assign_id = assign.id;
    let func = JsFunction {
        name: Some(f),
        params: vec![a],
        scope,
        body: JsBlock::new(vec![JsStmt::Expr(assign)]),
        loc: loc(1),
    };
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, None);
    let analysis = analyzer.analyze_function(the_fn(&program));

    assert!(analysis.can_not_throw(assign_id));
    assert!(analysis.can_not_throw_recursive(assign_id));
    assert!(analysis.nothing_can_throw);
}

#[test]
fn try_statement_forces_instrumentation_even_when_safe() {
    let mut program = JsProgram::new();
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let scope = program.pool.new_scope();
    let e = program.pool.declare_name(scope, "e", "e");
    let try_stmt = JsStmt::Try(JsTry {
        block: JsBlock::new(vec![JsStmt::Empty]),
        catches: vec![crate::js::ast::JsCatch {
            param: e,
            body: JsBlock::new(vec![]),
            loc: loc(3),
        }],
        finally: None,
        loc: loc(2),
    });
    let func = JsFunction {
        name: Some(f),
        params: vec![],
        scope,
        body: JsBlock::new(vec![try_stmt]),
        loc: loc(1),
    };
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, None);
    let analysis = analyzer.analyze_function(the_fn(&program));

    assert!(analysis.nothing_can_throw);
    assert!(analysis.contains_try);
    assert!(analysis.needs_instrumentation());
}

#[test]
fn comma_shell_is_safe_but_not_recursively() {
    let mut program = JsProgram::new();
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let g = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::helper()", "g");
    let call = program
        .pool
        .invoke(loc(2), program.pool.name_ref(loc(2), g), vec![]);
    let comma = program
        .pool
        .comma(loc(2), call, program.pool.num(loc(2), 1.0));
    let comma_id = comma.id;
    let func = program.pool.function(
        loc(1),
        Some(f),
        vec![],
        JsBlock::new(vec![JsStmt::Expr(comma)]),
    );
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));
    program.global_block.push(JsStmt::Vars(vec![crate::js::ast::JsVar {
        name: g,
        init: None,
        loc: loc(1),
    }]));

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, None);
    let analysis = analyzer.analyze_function(the_fn(&program));

    assert!(analysis.can_not_throw(comma_id));
    assert!(!analysis.can_not_throw_recursive(comma_id));
}

#[test]
fn java_hints_refine_postfix_but_never_calls() {
    let mut program = JsProgram::new();
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let g = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::helper()", "g");
    let scope = program.pool.new_scope();
    let i = program.pool.declare_name(scope, "i", "i");
    // i++ at line 4: ToNumber may throw per JS rules, Java knows i is int
    let incr = program
        .pool
        .postfix(loc(4), UnaryOp::Inc, program.pool.name_ref(loc(4), i));
    let incr_id = incr.id;
    // g() at the same line: calls stay instrumented no matter what
    let call = program
        .pool
        .invoke(loc(4), program.pool.name_ref(loc(4), g), vec![]);
    let call_id = call.id;
    let func = JsFunction {
        name: Some(f),
        params: vec![i],
        scope,
        body: JsBlock::new(vec![JsStmt::Expr(incr), JsStmt::Expr(call)]),
        loc: loc(1),
    };
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));
    program.global_block.push(JsStmt::Vars(vec![crate::js::ast::JsVar {
        name: g,
        init: None,
        loc: loc(1),
    }]));

    let mut hints = JavaHints::new();
    hints.add_java_method("test.Widget::run()");
    hints.can_not_throw.add([&loc(4)]);

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, Some(&hints));
    let analysis = analyzer.analyze_function(the_fn(&program));

    assert!(analysis.can_not_throw(incr_id));
    // soft only: the hard recursive check stays JS-derived
    assert!(!analysis.can_not_throw_recursive(incr_id));
    assert!(!analysis.can_not_throw(call_id));
}

#[test]
fn synthesized_nodes_are_not_visited() {
    let mut program = JsProgram::new();
    let f = program
        .pool
        .declare_name(ScopeId::GLOBAL, "test.Widget::run()", "f");
    let func = program.pool.function(loc(1), Some(f), vec![], JsBlock::new(vec![]));
    let func_expr = program
        .pool
        .expr(loc(1), JsExprKind::Function(Box::new(func)));
    program.global_block.push(JsStmt::Expr(func_expr));

    let analyzer = ThrowabilityAnalyzer::new(&program.pool, &program.global_block, None);
    let analysis = analyzer.analyze_function(the_fn(&program));

    let later = program.pool.num(SourceLocation::synthetic(), 0.0);
    assert!(!analysis.was_visited(later.id));
    assert_eq!(analysis.can_not_throw(later.id), false);
}
