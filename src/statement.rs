//! Statement execution: the tree-walk half of every statement kind.
//! Each statement runs inside whatever scope its caller already pushed;
//! blocks, loops, namespaces, and struct bodies push their own via
//! [`ScopeGuard`] so scope exit happens along every path, including a thrown
//! error.

use std::rc::Rc;

use crate::ast::{Stmt, StmtKind};
use crate::domain::ScopeGuard;
use crate::error::CsError;
use crate::eval::Evaluator;
use crate::value::{Callable, CallableBody, CallableKind, Repr, Value};

/// Runs a statement sequence, stopping early once a `return`/`break`/
/// `continue` flag is set so the remaining statements in this body are
/// skipped - these flags never escape the function call boundary; each
/// loop/function runner is responsible for clearing the ones it owns.
pub fn run_block(ev: &Evaluator, stmts: &[Stmt]) -> Result<(), CsError> {
    for stmt in stmts {
        run_stmt(ev, stmt)?;
        if ev.control.borrow().unwinding() {
            break;
        }
    }
    Ok(())
}

/// Runs one statement, attaching file/line/raw-source context to any
/// generic failure exactly once. Language errors and
/// already-wrapped runtime exceptions pass through unchanged.
fn run_stmt(ev: &Evaluator, stmt: &Stmt) -> Result<(), CsError> {
    execute(ev, stmt).map_err(|e| e.wrap_with_context(stmt.loc.file.to_string(), stmt.loc.line, stmt.loc.raw_source.to_string()))
}

fn execute(ev: &Evaluator, stmt: &Stmt) -> Result<(), CsError> {
    match &stmt.kind {
        StmtKind::Expression(node) => {
            ev.eval(node)?;
            Ok(())
        }
        StmtKind::VarDef { name, init } => {
            let value = ev.eval(init)?.deep_copy();
            ev.domains.borrow_mut().declare_and_bind(name, value)
        }
        StmtKind::Return(opt) => {
            let value = match opt {
                Some(n) => ev.eval(n)?,
                None => Value::null(),
            };
            let mut control = ev.control.borrow_mut();
            control.return_value = value;
            control.return_requested = true;
            Ok(())
        }
        StmtKind::Break => {
            ev.control.borrow_mut().break_requested = true;
            Ok(())
        }
        StmtKind::Continue => {
            ev.control.borrow_mut().continue_requested = true;
            Ok(())
        }
        StmtKind::Block(body) => run_scoped_block(ev, body),
        StmtKind::Namespace { name, body } => {
            let domain = crate::domain::new_domain();
            {
                let guard = ScopeGuard::enter_with_domain(&ev.domains, domain.clone());
                run_block(ev, body)?;
                drop(guard);
            }
            ev.domains.borrow_mut().declare_and_bind(name, Value::namespace(name.as_str(), domain).protect())
        }
        StmtKind::If { cond, body } => {
            if eval_bool(ev, cond)? {
                run_scoped_block(ev, body)?;
            }
            Ok(())
        }
        StmtKind::IfElse { cond, then_body, else_body } => {
            if eval_bool(ev, cond)? {
                run_scoped_block(ev, then_body)
            } else {
                run_scoped_block(ev, else_body)
            }
        }
        StmtKind::Switch { scrutinee, cases, default } => run_switch(ev, scrutinee, cases, default),
        StmtKind::While { cond, body } => run_while(ev, cond, body),
        StmtKind::Loop { cond, body } => run_do_until(ev, cond, body),
        StmtKind::For { spec, body } => run_for(ev, spec, body),
        StmtKind::Foreach { var_name, iterable, body } => run_foreach(ev, var_name, iterable, body),
        StmtKind::Try { body, catch_name, catch_body } => run_try(ev, body, catch_name, catch_body),
        StmtKind::Throw(node) => {
            let value = ev.eval(node)?;
            Err(CsError::throw(value))
        }
        StmtKind::Function(decl) => {
            let kind = if ev.domains.borrow().current_set_is_struct_definition() { CallableKind::MemberFn } else { CallableKind::Free };
            let context = ev.domains.borrow().current_domain().clone();
            let callable = Callable {
                body: CallableBody::Function { args: Rc::new(decl.args.clone()), body: Rc::new(decl.body.clone()), context },
                kind,
                arity: decl.args.len(),
            };
            ev.domains.borrow_mut().declare_and_bind(&decl.name, Value::callable(callable).protect().make_constant())
        }
        StmtKind::Struct(decl) => {
            ev.register_struct(&decl.name, decl.body.clone());
            ev.domains.borrow_mut().declare_and_bind(&decl.name, Value::type_desc(decl.name.as_str()).protect().make_constant())
        }
    }
}

fn run_scoped_block(ev: &Evaluator, body: &[Stmt]) -> Result<(), CsError> {
    let guard = ScopeGuard::enter(&ev.domains);
    let result = run_block(ev, body);
    drop(guard);
    result
}

fn eval_bool(ev: &Evaluator, cond: &crate::ast::Node) -> Result<bool, CsError> {
    ev.eval(cond)?.as_bool().ok_or_else(|| CsError::unsupported("condition must be a bool"))
}

fn run_switch(
    ev: &Evaluator,
    scrutinee: &crate::ast::Node,
    cases: &[crate::ast::SwitchCase],
    default: &Option<Vec<Stmt>>,
) -> Result<(), CsError> {
    let value = ev.eval(scrutinee)?;
    for case in cases {
        let case_value = ev.eval(&case.value)?;
        if value.value_equal(&case_value) {
            return run_scoped_block(ev, &case.body);
        }
    }
    match default {
        Some(body) => run_scoped_block(ev, body),
        None => Ok(()),
    }
}

/// Clears whichever loop-control flag fired this iteration and reports
/// whether the loop should stop (`break`, `return`, or a propagated error
/// already unwound past `run_block`).
fn loop_should_stop(ev: &Evaluator) -> bool {
    let mut control = ev.control.borrow_mut();
    if control.return_requested {
        return true;
    }
    if control.break_requested {
        control.break_requested = false;
        return true;
    }
    control.continue_requested = false;
    false
}

fn run_while(ev: &Evaluator, cond: &crate::ast::Node, body: &[Stmt]) -> Result<(), CsError> {
    while eval_bool(ev, cond)? {
        run_scoped_block(ev, body)?;
        if loop_should_stop(ev) {
            break;
        }
    }
    Ok(())
}

/// `do body until cond` (`loop`): runs the body at least once, stopping
/// once `cond` evaluates true.
fn run_do_until(ev: &Evaluator, cond: &crate::ast::Node, body: &[Stmt]) -> Result<(), CsError> {
    loop {
        run_scoped_block(ev, body)?;
        if loop_should_stop(ev) {
            break;
        }
        if eval_bool(ev, cond)? {
            break;
        }
    }
    Ok(())
}

fn run_for(ev: &Evaluator, spec: &crate::ast::ForSpec, body: &[Stmt]) -> Result<(), CsError> {
    let start = ev.eval(&spec.start)?;
    let end = ev.eval(&spec.end)?;
    let step = match &spec.step {
        Some(s) => ev.eval(s)?,
        None => Value::int(1),
    };
    let use_int = matches!(start.repr, Repr::Int(_)) && matches!(step.repr, Repr::Int(_));
    let end_n = end.as_number().ok_or_else(|| CsError::unsupported("`for` bound must be a number"))?;
    let step_n = step.as_number().ok_or_else(|| CsError::unsupported("`for` step must be a number"))?;
    if step_n == 0.0 {
        return Err(CsError::unsupported("`for` step must not be zero"));
    }
    let mut current = start.as_number().ok_or_else(|| CsError::unsupported("`for` start must be a number"))?;
    loop {
        let keep_going = if step_n > 0.0 { current <= end_n } else { current >= end_n };
        if !keep_going {
            break;
        }
        {
            let guard = ScopeGuard::enter(&ev.domains);
            let loop_value = if use_int { Value::int(current as i64) } else { Value::float(current) };
            ev.domains.borrow_mut().declare_and_bind(&spec.var_name, loop_value)?;
            let result = run_block(ev, body);
            drop(guard);
            result?;
        }
        if loop_should_stop(ev) {
            break;
        }
        current += step_n;
    }
    Ok(())
}

fn run_foreach(ev: &Evaluator, var_name: &str, iterable: &crate::ast::Node, body: &[Stmt]) -> Result<(), CsError> {
    let iterable = ev.eval(iterable)?;
    let elements: Vec<Value> = match &iterable.repr {
        Repr::Str(s) => s.borrow().iter().map(|b| Value::new(Repr::Char(*b as char))).collect(),
        Repr::Array(a) => a.borrow().clone(),
        Repr::Map(m) => m.borrow().iter().map(|(k, v)| Value::pair(k.clone(), v.clone())).collect(),
        _ => return Err(CsError::unsupported("`foreach` requires a string, array, or hash-map")),
    };
    for element in elements {
        {
            let guard = ScopeGuard::enter(&ev.domains);
            ev.domains.borrow_mut().declare_and_bind(var_name, element)?;
            let result = run_block(ev, body);
            drop(guard);
            result?;
        }
        if loop_should_stop(ev) {
            break;
        }
    }
    Ok(())
}

fn run_try(ev: &Evaluator, body: &[Stmt], catch_name: &str, catch_body: &[Stmt]) -> Result<(), CsError> {
    match run_scoped_block(ev, body) {
        Ok(()) => Ok(()),
        Err(err) => match err.as_lang_error() {
            Some(value) => {
                let value = value.clone();
                let guard = ScopeGuard::enter(&ev.domains);
                let bound = ev.domains.borrow_mut().declare_and_bind(catch_name, value);
                let result = bound.and_then(|()| run_block(ev, catch_body));
                drop(guard);
                result
            }
            None => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ForSpec, Node, SignalOp, SourceLoc, StructDecl, SwitchCase};

    fn loc() -> SourceLoc {
        SourceLoc { file: "t.cs".into(), line: 1, raw_source: "".into() }
    }

    fn stmt(kind: StmtKind) -> Stmt {
        Stmt::new(kind, loc())
    }

    #[test]
    fn vardef_then_expression_binds_and_reads() {
        let ev = Evaluator::new();
        let body = vec![
            stmt(StmtKind::VarDef { name: "x".into(), init: Node::Value(Value::int(41)) }),
            stmt(StmtKind::Expression(Node::signal(SignalOp::Add, Some(Node::Id("x".into())), Some(Node::Value(Value::int(1)))))),
        ];
        run_block(&ev, &body).unwrap();
        assert_eq!(ev.domains.borrow().get_var("x").unwrap().as_int(), Some(41));
    }

    #[test]
    fn while_loop_with_break_stops_early() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("i", Value::int(0)).unwrap();
        let body = vec![
            stmt(StmtKind::Expression(Node::signal(SignalOp::Inc, Some(Node::Id("i".into())), None))),
            stmt(StmtKind::If {
                cond: Node::signal(SignalOp::Equ, Some(Node::Id("i".into())), Some(Node::Value(Value::int(2)))),
                body: vec![stmt(StmtKind::Break)],
            }),
        ];
        let while_stmt = stmt(StmtKind::While {
            cond: Node::signal(SignalOp::Und, Some(Node::Id("i".into())), Some(Node::Value(Value::int(3)))),
            body,
        });
        run_block(&ev, std::slice::from_ref(&while_stmt)).unwrap();
        assert_eq!(ev.domains.borrow().get_var("i").unwrap().as_int(), Some(2));
    }

    #[test]
    fn for_loop_counts_inclusive_range() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("sum", Value::int(0)).unwrap();
        let spec = ForSpec { var_name: "i".into(), start: Node::Value(Value::int(1)), end: Node::Value(Value::int(3)), step: None };
        let body = vec![stmt(StmtKind::Expression(Node::signal(
            SignalOp::AddAsi,
            Some(Node::Id("sum".into())),
            Some(Node::Id("i".into())),
        )))];
        run_block(&ev, &[stmt(StmtKind::For { spec, body })]).unwrap();
        assert_eq!(ev.domains.borrow().get_var("sum").unwrap().as_int(), Some(6));
    }

    #[test]
    fn foreach_over_array_binds_each_element() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("sum", Value::int(0)).unwrap();
        let arr = stmt(StmtKind::VarDef {
            name: "a".into(),
            init: Node::Array(vec![Node::Value(Value::int(1)), Node::Value(Value::int(2)), Node::Value(Value::int(3))]),
        });
        let foreach = stmt(StmtKind::Foreach {
            var_name: "x".into(),
            iterable: Node::Id("a".into()),
            body: vec![stmt(StmtKind::Expression(Node::signal(
                SignalOp::AddAsi,
                Some(Node::Id("sum".into())),
                Some(Node::Id("x".into())),
            )))],
        });
        run_block(&ev, &[arr, foreach]).unwrap();
        assert_eq!(ev.domains.borrow().get_var("sum").unwrap().as_int(), Some(6));
    }

    #[test]
    fn throw_of_lang_error_is_caught_by_try() {
        let ev = Evaluator::new();
        let try_stmt = stmt(StmtKind::Try {
            body: vec![stmt(StmtKind::Throw(Node::Value(Value::lang_error("boom"))))],
            catch_name: "e".into(),
            catch_body: vec![stmt(StmtKind::VarDef { name: "caught".into(), init: Node::Id("e".into()) })],
        });
        run_block(&ev, std::slice::from_ref(&try_stmt)).unwrap();
    }

    #[test]
    fn throw_of_non_lang_error_raises_syntax() {
        let ev = Evaluator::new();
        let err = run_block(&ev, &[stmt(StmtKind::Throw(Node::Value(Value::int(1))))]).unwrap_err();
        match err {
            CsError::Wrapped(inner) => assert!(matches!(inner.kind, CsError::Syntax(_))),
            other => panic!("expected a wrapped syntax error, got {other:?}"),
        }
    }

    #[test]
    fn generic_failure_is_wrapped_with_source_location() {
        let ev = Evaluator::new();
        let loc = SourceLoc { file: "prog.cs".into(), line: 7, raw_source: "x + 1".into() };
        let bad = Stmt::new(StmtKind::Expression(Node::Id("missing".into())), loc);
        let err = run_block(&ev, &[bad]).unwrap_err();
        match err {
            CsError::Wrapped(inner) => {
                assert_eq!(inner.line, Some(7));
                assert_eq!(inner.file.as_deref(), Some("prog.cs"));
            }
            other => panic!("expected a wrapped error, got {other:?}"),
        }
    }

    #[test]
    fn struct_definition_marks_member_functions() {
        let ev = Evaluator::new();
        let struct_decl = StructDecl {
            name: "Point".into(),
            body: vec![
                stmt(StmtKind::VarDef { name: "x".into(), init: Node::Value(Value::int(0)) }),
                stmt(StmtKind::Function(crate::ast::FunctionDecl {
                    name: "get_x".into(),
                    args: vec![],
                    body: vec![stmt(StmtKind::Return(Some(Node::Id("x".into()))))],
                })),
            ],
        };
        run_block(&ev, &[stmt(StmtKind::Struct(struct_decl))]).unwrap();
        let type_value = ev.domains.borrow().get_var("Point").unwrap();
        let instance = ev.construct(&type_value).unwrap();
        let method = crate::extension::resolve_dot(&ev.domains.borrow(), &ev.registry, &instance, "get_x").unwrap();
        assert!(matches!(method.repr, Repr::ObjectMethod(_)));
        let result = ev.call(method, vec![]).unwrap();
        assert_eq!(result.as_int(), Some(0));
    }

    #[test]
    fn switch_runs_matching_case_only() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("out", Value::int(0)).unwrap();
        let switch_stmt = stmt(StmtKind::Switch {
            scrutinee: Node::Value(Value::int(2)),
            cases: vec![
                SwitchCase {
                    value: Node::Value(Value::int(1)),
                    body: vec![stmt(StmtKind::Expression(Node::signal(SignalOp::Asi, Some(Node::Id("out".into())), Some(Node::Value(Value::int(10))))))],
                },
                SwitchCase {
                    value: Node::Value(Value::int(2)),
                    body: vec![stmt(StmtKind::Expression(Node::signal(SignalOp::Asi, Some(Node::Id("out".into())), Some(Node::Value(Value::int(20))))))],
                },
            ],
            default: Some(vec![stmt(StmtKind::Expression(Node::signal(SignalOp::Asi, Some(Node::Id("out".into())), Some(Node::Value(Value::int(99))))))]),
        });
        run_block(&ev, &[switch_stmt]).unwrap();
        assert_eq!(ev.domains.borrow().get_var("out").unwrap().as_int(), Some(20));
    }
}
