//! Expression Evaluator: recursive tree-walk interpretation of the
//! AST, implementing operator semantics, l-value update, member/index
//! access, and call dispatch.

use std::rc::Rc;

use crate::ast::{Node, SignalOp};
use crate::domain::{new_domain, Domain, DomainManager, ScopeGuard};
use crate::error::CsError;
use crate::extension::{self, ExtensionRegistry};
use crate::resource::{DepthTracker, NoLimitTracker};
use crate::trace::{NoopTracer, VmTracer};
use crate::value::{Callable, CallableBody, CallableKind, Repr, Sentinel, Value, ValueMap};
use std::cell::RefCell;

/// Per-call control-flow flags: `return`/`break`/`continue` are
/// signalled by setting a flag that statement runners check and unwind on,
/// rather than by Rust-level exceptions, matching the source's statement
/// loop shape.
#[derive(Default)]
pub struct ControlFlow {
    pub return_requested: bool,
    pub return_value: Value,
    pub break_requested: bool,
    pub continue_requested: bool,
}

impl ControlFlow {
    fn new() -> Self {
        Self { return_requested: false, return_value: Value::null(), break_requested: false, continue_requested: false }
    }

    /// True once any unwind flag is set; statement-sequence runners stop on it.
    pub fn unwinding(&self) -> bool {
        self.return_requested || self.break_requested || self.continue_requested
    }
}

pub struct Evaluator {
    pub domains: RefCell<DomainManager>,
    pub registry: ExtensionRegistry,
    pub struct_builders: RefCell<ahash::AHashMap<String, Rc<Vec<crate::ast::Stmt>>>>,
    pub depth: RefCell<Box<dyn DepthTracker>>,
    pub tracer: RefCell<Box<dyn VmTracer>>,
    pub control: RefCell<ControlFlow>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            domains: RefCell::new(DomainManager::new()),
            registry: ExtensionRegistry::new(),
            struct_builders: RefCell::new(ahash::AHashMap::new()),
            depth: RefCell::new(Box::new(NoLimitTracker)),
            tracer: RefCell::new(Box::new(NoopTracer)),
            control: RefCell::new(ControlFlow::new()),
        }
    }

    pub fn with_depth_tracker(depth: Box<dyn DepthTracker>) -> Self {
        let ev = Self::new();
        *ev.depth.borrow_mut() = depth;
        ev
    }

    pub fn register_struct(&self, name: &str, body: Vec<crate::ast::Stmt>) {
        self.struct_builders.borrow_mut().insert(name.to_string(), Rc::new(body));
    }

    /// Evaluates one AST node and returns the resulting value.
    pub fn eval(&self, node: &Node) -> Result<Value, CsError> {
        match node {
            Node::Value(v) => Ok(v.clone()),
            Node::Id(name) => self.domains.borrow().get_var(name),
            Node::Expr(inner) => self.eval(inner),
            Node::EndLine => Ok(Value::null()),
            Node::Array(items) => self.eval_array_literal(items),
            Node::ArgList(_) => Err(CsError::grammar("argument list evaluated outside a call")),
            Node::Signal { op, left, right } => self.eval_signal(*op, left.as_deref(), right.as_deref()),
        }
    }

    fn eval_array_literal(&self, items: &[Node]) -> Result<Value, CsError> {
        let values: Vec<Value> = items.iter().map(|n| self.eval(n)).collect::<Result<_, _>>()?;
        if !values.is_empty() && values.iter().all(|v| matches!(v.repr, Repr::Pair(_))) {
            let mut map = ValueMap::new();
            for v in values {
                if let Repr::Pair(pair) = v.repr {
                    map.insert(pair.0.clone(), pair.1.clone());
                }
            }
            Ok(Value::map(map))
        } else {
            Ok(Value::array(values))
        }
    }

    #[allow(clippy::too_many_lines)]
    fn eval_signal(&self, op: SignalOp, left: Option<&Node>, right: Option<&Node>) -> Result<Value, CsError> {
        use SignalOp as S;
        match op {
            S::Add | S::Sub | S::Mul | S::Div | S::Mod | S::Pow => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("binary operator missing operand"));
                };
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                self.binary_arith(op, &lv, &rv)
            }
            S::Minus => {
                let operand = right.or(left).ok_or_else(|| CsError::grammar("unary minus missing operand"))?;
                let v = self.eval(operand)?;
                match v.repr {
                    Repr::Int(n) => Ok(Value::int(-n)),
                    Repr::Float(n) => Ok(Value::float(-n)),
                    _ => Err(CsError::unsupported("unary `-` requires a number")),
                }
            }
            S::Escape => {
                let operand = right.or(left).ok_or_else(|| CsError::grammar("unary `*` missing operand"))?;
                let v = self.eval(operand)?;
                self.dereference(&v)
            }
            S::Und | S::Abo | S::Ueq | S::Aeq => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("comparison missing operand"));
                };
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let (a, b) = (
                    lv.as_number().ok_or_else(|| CsError::unsupported("comparison requires numbers"))?,
                    rv.as_number().ok_or_else(|| CsError::unsupported("comparison requires numbers"))?,
                );
                Ok(Value::bool(match op {
                    S::Und => a < b,
                    S::Abo => a > b,
                    S::Ueq => a <= b,
                    S::Aeq => a >= b,
                    _ => unreachable!(),
                }))
            }
            S::Equ | S::Neq => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("equality missing operand"));
                };
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let eq = lv.value_equal(&rv);
                Ok(Value::bool(if op == S::Equ { eq } else { !eq }))
            }
            S::And => {
                let l = left.ok_or_else(|| CsError::grammar("`&&` missing left operand"))?;
                let lv = self.eval(l)?.as_bool().ok_or_else(|| CsError::unsupported("`&&` requires booleans"))?;
                if !lv {
                    return Ok(Value::bool(false));
                }
                let r = right.ok_or_else(|| CsError::grammar("`&&` missing right operand"))?;
                let rv = self.eval(r)?.as_bool().ok_or_else(|| CsError::unsupported("`&&` requires booleans"))?;
                Ok(Value::bool(rv))
            }
            S::Or => {
                let l = left.ok_or_else(|| CsError::grammar("`||` missing left operand"))?;
                let lv = self.eval(l)?.as_bool().ok_or_else(|| CsError::unsupported("`||` requires booleans"))?;
                if lv {
                    return Ok(Value::bool(true));
                }
                let r = right.ok_or_else(|| CsError::grammar("`||` missing right operand"))?;
                let rv = self.eval(r)?.as_bool().ok_or_else(|| CsError::unsupported("`||` requires booleans"))?;
                Ok(Value::bool(rv))
            }
            S::Not => {
                let operand = right.or(left).ok_or_else(|| CsError::grammar("`!` missing operand"))?;
                let v = self.eval(operand)?.as_bool().ok_or_else(|| CsError::unsupported("`!` requires a bool"))?;
                Ok(Value::bool(!v))
            }
            S::Inc | S::Dec => self.eval_inc_dec(op, left, right),
            S::Asi => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("assignment missing operand"));
                };
                let rv = self.eval(r)?;
                self.assign(l, rv.deep_copy())
            }
            S::AddAsi | S::SubAsi | S::MulAsi | S::DivAsi | S::ModAsi | S::PowAsi => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("compound assignment missing operand"));
                };
                let current = self.eval(l)?;
                let rhs = self.eval(r)?;
                let base_op = match op {
                    S::AddAsi => S::Add,
                    S::SubAsi => S::Sub,
                    S::MulAsi => S::Mul,
                    S::DivAsi => S::Div,
                    S::ModAsi => S::Mod,
                    S::PowAsi => S::Pow,
                    _ => unreachable!(),
                };
                let updated = self.binary_arith(base_op, &current, &rhs)?;
                self.assign(l, updated)
            }
            S::Choice => {
                let cond_node = left.ok_or_else(|| CsError::grammar("`?:` missing condition"))?;
                let branches = right.ok_or_else(|| CsError::grammar("`?:` missing branches"))?;
                let Node::Signal { op: S::Pair, left: then_n, right: else_n } = branches else {
                    return Err(CsError::grammar("`?:` requires a `then:else` pair"));
                };
                let cond = self.eval(cond_node)?.as_bool().ok_or_else(|| CsError::unsupported("`?:` condition must be a bool"))?;
                let chosen = if cond { then_n } else { else_n };
                let chosen = chosen.as_deref().ok_or_else(|| CsError::grammar("`?:` missing a branch"))?;
                self.eval(chosen)
            }
            S::Pair => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("pair missing operand"));
                };
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                if matches!(lv.repr, Repr::Pair(_)) || matches!(rv.repr, Repr::Pair(_)) {
                    return Err(CsError::grammar("a pair operand may not itself be a pair"));
                }
                Ok(Value::pair(lv, rv))
            }
            S::Dot => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("`.` missing operand"));
                };
                let receiver = self.eval(l)?;
                let name = r.as_id().ok_or_else(|| CsError::grammar("`.` right operand must be an identifier"))?;
                extension::resolve_dot(&self.domains.borrow(), &self.registry, &receiver, name)
            }
            S::Arrow => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("`->` missing operand"));
                };
                let receiver = self.eval(l)?;
                let name = r.as_id().ok_or_else(|| CsError::grammar("`->` right operand must be an identifier"))?;
                extension::resolve_arrow(&self.domains.borrow(), &self.registry, &receiver, name)
            }
            S::TypeId => {
                let operand = right.or(left).ok_or_else(|| CsError::grammar("`typeid` missing operand"))?;
                let v = self.eval(operand)?;
                Ok(Value::int(v.type_id() as i64))
            }
            S::New | S::GcNew => {
                if left.is_some() {
                    return Err(CsError::grammar("`new`/`gcnew` may not have a left operand"));
                }
                let type_node = right.ok_or_else(|| CsError::grammar("`new`/`gcnew` missing a type operand"))?;
                let type_value = self.eval(type_node)?;
                let instance = self.construct(&type_value)?;
                if op == S::GcNew {
                    Ok(Value::pointer(Some(instance)))
                } else {
                    Ok(instance)
                }
            }
            S::Access => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("`[]` missing operand"));
                };
                let target = self.eval(l)?;
                let index = self.eval(r)?;
                self.index_get(&target, &index)
            }
            S::FCall => {
                let (Some(l), Some(r)) = (left, right) else {
                    return Err(CsError::grammar("call missing operand"));
                };
                let callee = self.eval(l)?;
                let Node::ArgList(arg_nodes) = r else {
                    return Err(CsError::grammar("call right operand must be an argument list"));
                };
                let args: Vec<Value> = arg_nodes.iter().map(|n| self.eval(n)).collect::<Result<_, _>>()?;
                self.call(callee, args)
            }
            S::Lambda => self.eval_lambda(left, right),
            S::Emb => Err(CsError::grammar("`emb` may only appear inside a lambda argument list")),
            S::VarDef => {
                if left.is_some() {
                    return Err(CsError::grammar("`var` may not have a left operand"));
                }
                let name = right
                    .and_then(Node::as_id)
                    .ok_or_else(|| CsError::grammar("`var` requires an identifier"))?;
                self.domains.borrow_mut().add_record(name)?;
                self.domains.borrow_mut().set_var_current(name, Value::null());
                Ok(Value::null())
            }
        }
    }

    fn eval_inc_dec(&self, op: SignalOp, left: Option<&Node>, right: Option<&Node>) -> Result<Value, CsError> {
        let (lvalue_node, prefix) = match (left, right) {
            (None, Some(r)) => (r, true),
            (Some(l), None) => (l, false),
            _ => return Err(CsError::grammar("`++`/`--` must have exactly one operand")),
        };
        let current = self.eval(lvalue_node)?;
        let Some(n) = current.as_int() else {
            return Err(CsError::unsupported("`++`/`--` requires an integer lvalue"));
        };
        let updated = Value::int(if op == SignalOp::Inc { n + 1 } else { n - 1 });
        self.assign(lvalue_node, updated.clone())?;
        Ok(if prefix { updated } else { current })
    }

    fn eval_lambda(&self, left: Option<&Node>, right: Option<&Node>) -> Result<Value, CsError> {
        let args_node = left.ok_or_else(|| CsError::grammar("lambda missing argument list"))?;
        let body_expr = right.ok_or_else(|| CsError::grammar("lambda missing body"))?.clone();
        let Node::ArgList(arg_nodes) = args_node else {
            return Err(CsError::grammar("lambda argument list is malformed"));
        };
        let mut args = Vec::with_capacity(arg_nodes.len());
        for n in arg_nodes {
            let name = n.as_id().ok_or_else(|| CsError::grammar("lambda arguments must be identifiers"))?;
            if args.contains(&name.to_string()) {
                return Err(CsError::syntax("redefinition of function argument"));
            }
            args.push(name.to_string());
        }
        let body = vec![crate::ast::Stmt::new(
            crate::ast::StmtKind::Return(Some(body_expr)),
            crate::ast::SourceLoc::default(),
        )];
        let context = self.domains.borrow().current_domain().clone();
        let callable = Callable {
            body: CallableBody::Function { args: Rc::new(args.clone()), body: Rc::new(body), context },
            kind: CallableKind::Free,
            arity: args.len(),
        };
        Ok(Value::callable(callable).protect().make_constant())
    }

    fn binary_arith(&self, op: SignalOp, lv: &Value, rv: &Value) -> Result<Value, CsError> {
        if op == SignalOp::Add {
            if let Repr::Str(s) = &lv.repr {
                let mut out = s.borrow().clone();
                out.extend_from_slice(rv.display_lossy().as_bytes());
                return Ok(Value::string(out));
            }
        }
        let (Some(a), Some(b)) = (lv.as_number(), rv.as_number()) else {
            return Err(CsError::unsupported(format!("`{op}` requires numeric operands")));
        };
        let both_int = matches!((&lv.repr, &rv.repr), (Repr::Int(_), Repr::Int(_)));
        match op {
            SignalOp::Add if both_int => Ok(Value::int(lv.as_int().unwrap().wrapping_add(rv.as_int().unwrap()))),
            SignalOp::Add => Ok(Value::float(a + b)),
            SignalOp::Sub if both_int => Ok(Value::int(lv.as_int().unwrap().wrapping_sub(rv.as_int().unwrap()))),
            SignalOp::Sub => Ok(Value::float(a - b)),
            SignalOp::Mul if both_int => Ok(Value::int(lv.as_int().unwrap().wrapping_mul(rv.as_int().unwrap()))),
            SignalOp::Mul => Ok(Value::float(a * b)),
            SignalOp::Div => Ok(Value::float(a / b)),
            SignalOp::Mod => Ok(Value::float(a % b)),
            SignalOp::Pow => Ok(Value::float(a.powf(b))),
            _ => unreachable!(),
        }
    }

    fn dereference(&self, v: &Value) -> Result<Value, CsError> {
        match &v.repr {
            Repr::Pointer(cell) => cell.borrow().clone().ok_or_else(|| CsError::unsupported("dereference of a null pointer")),
            _ => Err(CsError::unsupported("unary `*` requires a pointer")),
        }
    }

    pub fn construct(&self, type_value: &Value) -> Result<Value, CsError> {
        let Repr::Type(name) = &type_value.repr else {
            return Err(CsError::unsupported("`new`/`gcnew` requires a type operand"));
        };
        let body = self
            .struct_builders
            .borrow()
            .get(name.as_ref())
            .cloned()
            .ok_or_else(|| CsError::unsupported(format!("no struct named `{name}`")))?;
        let instance_domain = new_domain();
        {
            let guard = ScopeGuard::enter_with_domain(&self.domains, instance_domain.clone());
            self.domains.borrow_mut().mark_set_as_struct();
            crate::statement::run_block(self, &body)?;
            drop(guard);
        }
        Ok(Value::struct_instance(name.clone(), instance_domain))
    }

    /// Array/map/string indexing with auto-extend (`x[i]`).
    pub fn index_get(&self, target: &Value, index: &Value) -> Result<Value, CsError> {
        match &target.repr {
            Repr::Array(arr) => {
                let i = index.as_int().ok_or_else(|| CsError::unsupported("array index must be a number"))?;
                if i < 0 {
                    return Err(CsError::unsupported("array index must be non-negative"));
                }
                let i = i as usize;
                let mut arr = arr.borrow_mut();
                if i >= arr.len() {
                    arr.resize_with(i + 1, || Value::int(0));
                }
                Ok(arr[i].clone())
            }
            Repr::Map(map) => {
                let mut map = map.borrow_mut();
                if let Some(v) = map.get(index) {
                    Ok(v.clone())
                } else {
                    map.insert(index.deep_copy(), Value::int(0));
                    Ok(Value::int(0))
                }
            }
            Repr::Str(s) => {
                let i = index.as_int().ok_or_else(|| CsError::unsupported("string index must be a number"))?;
                let bytes = s.borrow();
                if i < 0 || i as usize >= bytes.len() {
                    return Err(CsError::unsupported("string index out of range"));
                }
                Ok(Value::new(Repr::Char(bytes[i as usize] as char)))
            }
            _ => Err(CsError::unsupported("`[]` requires an array, hash-map, or string")),
        }
    }

    pub fn index_set(&self, target: &Value, index: &Value, value: Value) -> Result<(), CsError> {
        match &target.repr {
            Repr::Array(arr) => {
                let i = index.as_int().ok_or_else(|| CsError::unsupported("array index must be a number"))?;
                if i < 0 {
                    return Err(CsError::unsupported("array index must be non-negative"));
                }
                let i = i as usize;
                let mut arr = arr.borrow_mut();
                if i >= arr.len() {
                    arr.resize_with(i, Value::null);
                    arr.push(value);
                } else {
                    arr[i] = value;
                }
                Ok(())
            }
            Repr::Map(map) => {
                map.borrow_mut().insert(index.deep_copy(), value);
                Ok(())
            }
            Repr::Str(_) => Err(CsError::unsupported("compound index-assignment on strings is unsupported")),
            _ => Err(CsError::unsupported("`[]=` requires an array or hash-map")),
        }
    }

    /// Assigns `value` to the l-value denoted by `lhs`, returning the
    /// assigned value (`=`).
    pub fn assign(&self, lhs: &Node, value: Value) -> Result<Value, CsError> {
        match lhs {
            Node::Id(name) => {
                self.domains.borrow_mut().set_var_current_or_outer(name, value.clone())?;
                Ok(value)
            }
            Node::Signal { op: SignalOp::VarDef, left: None, right: Some(id) } => {
                let name = id.as_id().ok_or_else(|| CsError::grammar("`var` requires an identifier"))?;
                self.domains.borrow_mut().add_record(name)?;
                self.domains.borrow_mut().set_var_current(name, value.clone());
                Ok(value)
            }
            Node::Signal { op: SignalOp::Access, left: Some(target_node), right: Some(index_node) } => {
                let target = self.eval(target_node)?;
                let index = self.eval(index_node)?;
                self.index_set(&target, &index, value.clone())?;
                Ok(value)
            }
            Node::Signal { op: SignalOp::Dot, left: Some(recv_node), right: Some(name_node) } => {
                let receiver = self.eval(recv_node)?;
                let name = name_node.as_id().ok_or_else(|| CsError::grammar("`.` right operand must be an identifier"))?;
                self.field_set(&receiver, name, value.clone())?;
                Ok(value)
            }
            Node::Signal { op: SignalOp::Arrow, left: Some(ptr_node), right: Some(name_node) } => {
                let pointer = self.eval(ptr_node)?;
                let Repr::Pointer(cell) = &pointer.repr else {
                    return Err(CsError::unsupported("`->` requires a pointer operand"));
                };
                let receiver = cell.borrow().clone().ok_or_else(|| CsError::unsupported("dereference of a null pointer"))?;
                let name = name_node.as_id().ok_or_else(|| CsError::grammar("`->` right operand must be an identifier"))?;
                self.field_set(&receiver, name, value.clone())?;
                Ok(value)
            }
            _ => Err(CsError::grammar("malformed l-value")),
        }
    }

    fn field_set(&self, receiver: &Value, name: &str, value: Value) -> Result<(), CsError> {
        match &receiver.repr {
            Repr::Struct { domain, .. } | Repr::Namespace { domain, .. } => {
                domain.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(CsError::unsupported("field assignment requires a struct instance or namespace")),
        }
    }

    /// Dispatches a call (`f(args)`): object-methods prepend their
    /// receiver; arity must match exactly.
    pub fn call(&self, callee: Value, mut args: Vec<Value>) -> Result<Value, CsError> {
        let callable = match callee.repr {
            Repr::Callable(c) => c,
            Repr::ObjectMethod(om) => {
                args.insert(0, (*om.receiver).clone());
                om.callable.clone()
            }
            _ => return Err(CsError::unsupported("call target is not callable")),
        };
        if args.len() != callable.arity {
            return Err(CsError::arg_count(callable.arity, args.len()));
        }
        match &callable.body {
            CallableBody::Native(f) => f(self, args),
            CallableBody::Function { args: formals, body, context } => self.call_function(formals, body, context, args),
            CallableBody::Bytecode { .. } => Err(CsError::unsupported("bytecode closures are not invocable by the tree walker")),
        }
    }

    fn call_function(
        &self,
        formals: &[String],
        body: &[crate::ast::Stmt],
        context: &Domain,
        args: Vec<Value>,
    ) -> Result<Value, CsError> {
        self.depth.borrow_mut().enter_call()?;
        let saved_frame = self.domains.borrow_mut().swap_for_call(context.clone());
        let result = (|| {
            for (name, value) in formals.iter().zip(args) {
                self.domains.borrow_mut().add_var(name, value)?;
            }
            let saved_return = std::mem::take(&mut self.control.borrow_mut().return_value);
            let saved_flags = {
                let mut c = self.control.borrow_mut();
                let flags = (c.return_requested, c.break_requested, c.continue_requested);
                c.return_requested = false;
                c.break_requested = false;
                c.continue_requested = false;
                flags
            };
            crate::statement::run_block(self, body)?;
            let returned = std::mem::replace(&mut self.control.borrow_mut().return_value, saved_return);
            {
                let mut c = self.control.borrow_mut();
                c.return_requested = saved_flags.0;
                c.break_requested = saved_flags.1;
                c.continue_requested = saved_flags.2;
            }
            Ok(returned)
        })();
        self.domains.borrow_mut().restore_from_call(saved_frame);
        self.depth.borrow_mut().exit_call();
        result
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Node;

    fn id(name: &str) -> Node {
        Node::Id(name.to_string())
    }

    fn num(n: i64) -> Node {
        Node::Value(Value::int(n))
    }

    #[test]
    fn precedence_is_whatever_the_tree_already_encodes() {
        // `1 + 2 * 3` arrives as `1 + (2 * 3)`; the evaluator just walks it.
        let ev = Evaluator::new();
        let mul = Node::signal(SignalOp::Mul, Some(num(2)), Some(num(3)));
        let add = Node::signal(SignalOp::Add, Some(num(1)), Some(mul));
        assert_eq!(ev.eval(&add).unwrap().as_int(), Some(7));
    }

    #[test]
    fn array_index_past_the_end_auto_extends_with_zeros() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("a", Value::array(vec![Value::int(1), Value::int(2), Value::int(3)])).unwrap();
        let a = ev.domains.borrow().get_var("a").unwrap();
        ev.index_set(&a, &Value::int(5), Value::int(9)).unwrap();
        let Repr::Array(cells) = &a.repr else { panic!("expected array") };
        assert_eq!(cells.borrow().len(), 6);
        assert_eq!(cells.borrow()[3].as_int(), Some(0));
        assert_eq!(cells.borrow()[4].as_int(), Some(0));
        assert_eq!(cells.borrow()[5].as_int(), Some(9));
    }

    #[test]
    fn map_index_miss_inserts_zero_then_reads_it_back() {
        let ev = Evaluator::new();
        let map = Value::map(ValueMap::new());
        let first = ev.index_get(&map, &Value::string(b"z".to_vec())).unwrap();
        assert_eq!(first.as_int(), Some(0));
        let second = ev.index_get(&map, &Value::string(b"z".to_vec())).unwrap();
        assert_eq!(second.as_int(), Some(0));
        let Repr::Map(m) = &map.repr else { panic!("expected map") };
        assert_eq!(m.borrow().len(), 1);
    }

    #[test]
    fn array_literal_of_all_pairs_promotes_to_a_map() {
        let ev = Evaluator::new();
        let lit = Node::Array(vec![
            Node::signal(SignalOp::Pair, Some(Node::Value(Value::string(b"x".to_vec()))), Some(num(1))),
            Node::signal(SignalOp::Pair, Some(Node::Value(Value::string(b"y".to_vec()))), Some(num(2))),
        ]);
        let v = ev.eval(&lit).unwrap();
        assert!(matches!(v.repr, Repr::Map(_)));
    }

    #[test]
    fn array_literal_with_one_non_pair_stays_an_array() {
        let ev = Evaluator::new();
        let lit = Node::Array(vec![
            Node::signal(SignalOp::Pair, Some(Node::Value(Value::string(b"x".to_vec()))), Some(num(1))),
            num(2),
        ]);
        let v = ev.eval(&lit).unwrap();
        assert!(matches!(v.repr, Repr::Array(_)));
    }

    #[test]
    fn assignment_copies_rather_than_aliases_a_container() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("a", Value::array(vec![Value::int(1)])).unwrap();
        ev.domains.borrow_mut().declare_and_bind("b", Value::int(0)).unwrap();
        ev.eval(&Node::signal(SignalOp::Asi, Some(id("b")), Some(id("a")))).unwrap();
        let a = ev.domains.borrow().get_var("a").unwrap();
        ev.index_set(&a, &Value::int(0), Value::int(99)).unwrap();
        let b = ev.domains.borrow().get_var("b").unwrap();
        assert_eq!(ev.index_get(&b, &Value::int(0)).unwrap().as_int(), Some(1));
    }

    #[test]
    fn prefix_increment_returns_the_new_value() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("i", Value::int(1)).unwrap();
        let result = ev.eval(&Node::signal(SignalOp::Inc, None, Some(id("i")))).unwrap();
        assert_eq!(result.as_int(), Some(2));
        assert_eq!(ev.domains.borrow().get_var("i").unwrap().as_int(), Some(2));
    }

    #[test]
    fn postfix_increment_returns_the_old_value() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("i", Value::int(1)).unwrap();
        let result = ev.eval(&Node::signal(SignalOp::Inc, Some(id("i")), None)).unwrap();
        assert_eq!(result.as_int(), Some(1));
        assert_eq!(ev.domains.borrow().get_var("i").unwrap().as_int(), Some(2));
    }

    #[test]
    fn increment_with_both_operands_is_a_grammar_error() {
        let ev = Evaluator::new();
        ev.domains.borrow_mut().declare_and_bind("i", Value::int(1)).unwrap();
        let err = ev.eval(&Node::signal(SignalOp::Inc, Some(id("i")), Some(id("i")))).unwrap_err();
        assert!(matches!(err, CsError::Grammar(_)));
    }

    #[test]
    fn ternary_only_evaluates_the_chosen_branch() {
        let ev = Evaluator::new();
        // `false ? (1/0) : 5` must not touch the divide-by-zero side.
        let branches = Node::signal(SignalOp::Pair, Some(num(1)), Some(num(5)));
        let choice = Node::signal(SignalOp::Choice, Some(Node::Value(Value::bool(false))), Some(branches));
        let result = ev.eval(&choice).unwrap();
        assert_eq!(result.as_int(), Some(5));
    }

    #[test]
    fn logical_and_short_circuits_without_evaluating_the_right_side() {
        let ev = Evaluator::new();
        let and = Node::signal(SignalOp::And, Some(Node::Value(Value::bool(false))), Some(id("undeclared")));
        assert_eq!(ev.eval(&and).unwrap().as_bool(), Some(false));
    }

    #[test]
    fn logical_or_short_circuits_without_evaluating_the_right_side() {
        let ev = Evaluator::new();
        let or = Node::signal(SignalOp::Or, Some(Node::Value(Value::bool(true))), Some(id("undeclared")));
        assert_eq!(ev.eval(&or).unwrap().as_bool(), Some(true));
    }

    #[test]
    fn dereferencing_a_null_pointer_is_unsupported() {
        let ev = Evaluator::new();
        let ptr = Value::pointer(None);
        let escape = Node::signal(SignalOp::Escape, None, Some(Node::Value(ptr)));
        let err = ev.eval(&escape).unwrap_err();
        assert!(matches!(err, CsError::Unsupported(_)));
    }

    #[test]
    fn call_dispatch_rejects_a_wrong_argument_count() {
        let ev = Evaluator::new();
        let callable = Callable {
            body: CallableBody::Native(Rc::new(|_ev: &Evaluator, args: Vec<Value>| Ok(Value::int(args.len() as i64)))),
            kind: CallableKind::Free,
            arity: 2,
        };
        let err = ev.call(Value::callable(callable), vec![Value::int(1)]).unwrap_err();
        assert!(matches!(err, CsError::ArgumentCountMismatch { .. }));
    }

    #[test]
    fn object_method_call_prepends_the_receiver() {
        let ev = Evaluator::new();
        let callable = Rc::new(Callable {
            body: CallableBody::Native(Rc::new(|_ev: &Evaluator, args: Vec<Value>| Ok(args[0].clone()))),
            kind: CallableKind::MemberFn,
            arity: 1,
        });
        let receiver = Value::int(42);
        let om = Value::object_method(receiver, callable);
        let result = ev.call(om, vec![]).unwrap();
        assert_eq!(result.as_int(), Some(42));
    }

    #[test]
    fn lambda_builds_a_protected_constant_single_expression_callable() {
        let ev = Evaluator::new();
        let args = Node::ArgList(vec![id("x")]);
        let body = Node::signal(SignalOp::Add, Some(id("x")), Some(num(1)));
        let lambda = ev.eval(&Node::signal(SignalOp::Lambda, Some(args), Some(body))).unwrap();
        assert!(lambda.protected);
        assert!(lambda.constant);
        let result = ev.call(lambda, vec![Value::int(41)]).unwrap();
        assert_eq!(result.as_int(), Some(42));
    }

    #[test]
    fn typeid_is_stable_for_equal_values() {
        let ev = Evaluator::new();
        let a = ev.eval(&Node::signal(SignalOp::TypeId, None, Some(num(1)))).unwrap();
        let b = ev.eval(&Node::signal(SignalOp::TypeId, None, Some(num(2)))).unwrap();
        assert_eq!(a.as_int(), b.as_int());
    }

    #[test]
    fn string_concat_coerces_the_right_operand_to_its_display_form() {
        let ev = Evaluator::new();
        let concat = Node::signal(SignalOp::Add, Some(Node::Value(Value::string(b"n=".to_vec()))), Some(num(7)));
        let result = ev.eval(&concat).unwrap();
        assert_eq!(result.display_lossy(), "n=7");
    }
}

