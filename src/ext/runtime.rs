//! Illustrative runtime extension, grounded in the reference
//! implementation's `runtime` extension header: a `runtime` namespace
//! exposing a handful of host services (timing, randomness, hashing,
//! raising a language error) through the same native-callable mechanism a
//! stdlib module would use.
//!
//! `build`/`solve`/`dynamic_import` depend on the lexer/parser and a module
//! loader, both out of scope here, so they're wired in as `Unsupported`
//! rather than silently dropped - a script that reaches for them gets a
//! clear error instead of an undefined-name lookup failure.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::domain::new_domain;
use crate::error::CsError;
use crate::eval::Evaluator;
use crate::value::{Callable, CallableBody, CallableKind, Value};

const STD_VERSION: i64 = 1;

fn native(arity: usize, constant: bool, f: impl Fn(&Evaluator, Vec<Value>) -> Result<Value, CsError> + 'static) -> Value {
    let callable = Callable { body: CallableBody::Native(Rc::new(f)), kind: CallableKind::Free, arity };
    let v = Value::callable(callable).protect();
    if constant { v.make_constant() } else { v }
}

fn number_arg(args: &[Value], index: usize) -> Result<f64, CsError> {
    args.get(index).and_then(Value::as_number).ok_or_else(|| CsError::unsupported("expected a number argument"))
}

fn string_arg(args: &[Value], index: usize) -> Result<String, CsError> {
    let Some(Value { repr: crate::value::Repr::Str(s), .. }) = args.get(index) else {
        return Err(CsError::unsupported("expected a string argument"));
    };
    Ok(String::from_utf8_lossy(&s.borrow()).into_owned())
}

fn unsupported_stub(name: &'static str, reason: &'static str) -> Value {
    native(0, false, move |_, _| Err(CsError::unsupported(format!("`{name}` is unavailable: {reason}"))))
}

/// Builds and installs the `runtime` namespace into `ev`'s global domain.
pub fn install(ev: &Evaluator) -> Result<(), CsError> {
    let domain = new_domain();
    {
        let mut vars = domain.borrow_mut();
        vars.insert("std_version".to_string(), Value::int(STD_VERSION).make_constant());
        vars.insert(
            "get_import_path".to_string(),
            native(0, true, |_, _| Ok(Value::string("<embedded>"))),
        );
        vars.insert(
            "info".to_string(),
            native(0, false, |_, _| {
                Ok(Value::string("Covariant Script core (embedded build, no CLI)."))
            }),
        );
        vars.insert(
            "time".to_string(),
            native(0, false, |_, _| {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|e| CsError::unsupported(format!("system clock error: {e}")))?
                    .as_millis();
                Ok(Value::float(millis as f64))
            }),
        );
        vars.insert(
            "delay".to_string(),
            native(1, false, |_, a| {
                let millis = number_arg(&a, 0)?;
                if millis.is_sign_negative() {
                    return Err(CsError::unsupported("`delay` requires a non-negative duration"));
                }
                std::thread::sleep(std::time::Duration::from_millis(millis as u64));
                Ok(Value::null())
            }),
        );
        vars.insert("rand".to_string(), native(2, false, |_, a| Ok(Value::float(rand_range(&a)?))));
        vars.insert("randint".to_string(), native(2, false, |_, a| Ok(Value::int(rand_range(&a)?.floor() as i64))));
        vars.insert(
            "exception".to_string(),
            native(1, false, |_, a| Ok(Value::lang_error(string_arg(&a, 0)?))),
        );
        vars.insert("hash".to_string(), native(1, true, |_, a| {
            let v = a.first().ok_or_else(|| CsError::unsupported("`hash` requires one argument"))?;
            Ok(Value::int(v.hash_value() as i64))
        }));
        vars.insert("build".to_string(), unsupported_stub("build", "no lexer/parser is part of this core"));
        vars.insert("solve".to_string(), unsupported_stub("solve", "no lexer/parser is part of this core"));
        vars.insert(
            "dynamic_import".to_string(),
            unsupported_stub("dynamic_import", "no module loader is part of this core"),
        );
    }
    ev.domains.borrow_mut().add_var_global("runtime", Value::namespace("runtime", domain).protect())
}

fn rand_range(args: &[Value]) -> Result<f64, CsError> {
    let begin = number_arg(args, 0)?;
    let end = number_arg(args, 1)?;
    if !(begin < end) {
        return Err(CsError::unsupported("`rand`/`randint` requires begin < end"));
    }
    Ok(rand::thread_rng().gen_range(begin..end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Node, SignalOp};

    fn eval_dot(ev: &Evaluator, receiver: &str, member: &str) -> Value {
        let node = Node::signal(SignalOp::Dot, Some(Node::Id(receiver.to_string())), Some(Node::Id(member.to_string())));
        ev.eval(&node).unwrap()
    }

    #[test]
    fn std_version_and_import_path_are_installed() {
        let ev = Evaluator::new();
        install(&ev).unwrap();
        assert_eq!(eval_dot(&ev, "runtime", "std_version").as_int(), Some(STD_VERSION));
        let path_fn = eval_dot(&ev, "runtime", "get_import_path");
        let result = ev.call(path_fn, vec![]).unwrap();
        assert_eq!(result.as_bool(), None);
    }

    #[test]
    fn exception_produces_a_lang_error_value() {
        let ev = Evaluator::new();
        install(&ev).unwrap();
        let exc_fn = eval_dot(&ev, "runtime", "exception");
        let result = ev.call(exc_fn, vec![Value::string("boom")]).unwrap();
        assert!(result.is_lang_error());
    }

    #[test]
    fn randint_respects_its_bounds() {
        let ev = Evaluator::new();
        install(&ev).unwrap();
        let randint_fn = eval_dot(&ev, "runtime", "randint");
        let result = ev.call(randint_fn, vec![Value::int(0), Value::int(10)]).unwrap();
        let n = result.as_int().unwrap();
        assert!((0..10).contains(&n));
    }

    #[test]
    fn build_is_an_explicit_unsupported_stub() {
        let ev = Evaluator::new();
        install(&ev).unwrap();
        let build_fn = eval_dot(&ev, "runtime", "build");
        assert!(matches!(ev.call(build_fn, vec![]), Err(CsError::Unsupported(_))));
    }
}
