//! Illustrative math extension, grounded in the reference
//! implementation's own math extension: a `math` namespace carrying the
//! `pi`/`e` constants and a set of native trig/log/power functions,
//! registered through the same [`Value::namespace`] plug point a script's
//! own `namespace` blocks use.
//!
//! The reference extension's `asin`/`acos`/`atan` call `sin`/`cos`/`tan`
//! instead of their inverses; that looks like a copy-paste slip rather than
//! intended behavior, so this port calls the actual inverse functions.

use std::rc::Rc;

use crate::domain::new_domain;
use crate::error::CsError;
use crate::eval::Evaluator;
use crate::value::{Callable, CallableBody, CallableKind, Value};

const PI: f64 = 3.1415926535;
const E: f64 = 2.7182818284;

fn native(arity: usize, f: impl Fn(&Evaluator, Vec<Value>) -> Result<Value, CsError> + 'static) -> Value {
    let callable = Callable { body: CallableBody::Native(Rc::new(f)), kind: CallableKind::Free, arity };
    Value::callable(callable).protect().make_constant()
}

fn number_arg(args: &[Value], index: usize) -> Result<f64, CsError> {
    args.get(index)
        .and_then(Value::as_number)
        .ok_or_else(|| CsError::unsupported("math function requires a number argument"))
}

/// Builds and installs the `math` namespace into `ev`'s global domain.
pub fn install(ev: &Evaluator) -> Result<(), CsError> {
    let domain = new_domain();
    {
        let mut vars = domain.borrow_mut();
        vars.insert("pi".to_string(), Value::float(PI).make_constant());
        vars.insert("e".to_string(), Value::float(E).make_constant());
        vars.insert("abs".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.abs()))));
        vars.insert("ln".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.ln()))));
        vars.insert("log10".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.log10()))));
        // log(base, x) -> log base of x, matching the reference's argument order.
        vars.insert("log".to_string(), native(2, |_, a| Ok(Value::float(number_arg(&a, 1)?.log(number_arg(&a, 0)?)))));
        vars.insert("sin".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.sin()))));
        vars.insert("cos".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.cos()))));
        vars.insert("tan".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.tan()))));
        vars.insert("asin".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.asin()))));
        vars.insert("acos".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.acos()))));
        vars.insert("atan".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.atan()))));
        vars.insert("sqrt".to_string(), native(1, |_, a| Ok(Value::float(number_arg(&a, 0)?.sqrt()))));
        // root(x, n) -> the n-th root of x, matching the reference's argument order.
        vars.insert("root".to_string(), native(2, |_, a| Ok(Value::float(number_arg(&a, 0)?.powf(1.0 / number_arg(&a, 1)?)))));
        vars.insert("pow".to_string(), native(2, |_, a| Ok(Value::float(number_arg(&a, 0)?.powf(number_arg(&a, 1)?)))));
    }
    ev.domains.borrow_mut().add_var_global("math", Value::namespace("math", domain).protect())
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
    fn constants_are_installed_and_constant() {
        let ev = Evaluator::new();
        install(&ev).unwrap();
        let pi = eval_dot(&ev, "math", "pi");
        assert!((pi.as_number().unwrap() - PI).abs() < 1e-12);
        assert!(pi.constant);
    }

    #[test]
    fn sqrt_and_pow_compute_correctly() {
        let ev = Evaluator::new();
        install(&ev).unwrap();
        let sqrt_fn = eval_dot(&ev, "math", "sqrt");
        let result = ev.call(sqrt_fn, vec![Value::float(16.0)]).unwrap();
        assert_eq!(result.as_number(), Some(4.0));

        let pow_fn = eval_dot(&ev, "math", "pow");
        let result = ev.call(pow_fn, vec![Value::float(2.0), Value::float(10.0)]).unwrap();
        assert_eq!(result.as_number(), Some(1024.0));
    }

    #[test]
    fn asin_is_the_true_inverse_not_the_forward_function() {
        let ev = Evaluator::new();
        install(&ev).unwrap();
        let asin_fn = eval_dot(&ev, "math", "asin");
        let result = ev.call(asin_fn, vec![Value::float(1.0)]).unwrap();
        assert!((result.as_number().unwrap() - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }
}
