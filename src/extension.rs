//! Extension Registry: named, shared domains keyed by the type they
//! augment, consulted on member access when the left operand isn't itself a
//! namespace/struct/type.

use crate::domain::{new_domain, Domain};
use crate::error::CsError;
use crate::value::{CallableKind, Repr, Sentinel, Value};

/// One shared domain per augmented type, keyed by `Value::type_name`.
pub struct ExtensionRegistry {
    by_type: ahash::AHashMap<&'static str, Domain>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self { by_type: ahash::AHashMap::new() }
    }

    /// Registers (or fetches) the shared extension domain for `type_name`.
    pub fn extension_for(&mut self, type_name: &'static str) -> Domain {
        self.by_type.entry(type_name).or_insert_with(new_domain).clone()
    }

    pub fn get(&self, type_name: &str) -> Option<&Domain> {
        self.by_type.get(type_name)
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves `receiver.name` per the five-step priority order: global/current
/// sentinel, type extension, struct instance, then a per-type extension
/// fallback.
pub fn resolve_dot(
    domain_manager: &crate::domain::DomainManager,
    registry: &ExtensionRegistry,
    receiver: &Value,
    name: &str,
) -> Result<Value, CsError> {
    match &receiver.repr {
        Repr::Sentinel(Sentinel::Global) => domain_manager.get_var_global(name),
        Repr::Sentinel(Sentinel::Current) => domain_manager.get_var_current(name),
        Repr::Type(_) => lookup_extension_domain(registry, receiver, name),
        Repr::Struct { domain, .. } | Repr::Namespace { domain, .. } => {
            let found = domain
                .borrow()
                .get(name)
                .cloned()
                .ok_or_else(|| CsError::undefined(name, crate::error::LookupScope::Current))?;
            Ok(bind_member_fn(receiver, found))
        }
        _ => {
            let member = lookup_extension_domain(registry, receiver, name)?;
            Ok(bind_member_fn(receiver, member))
        }
    }
}

fn lookup_extension_domain(registry: &ExtensionRegistry, receiver: &Value, name: &str) -> Result<Value, CsError> {
    let type_name = receiver.type_name();
    let domain = registry
        .get(type_name)
        .ok_or_else(|| CsError::unsupported(format!("no extension registered for type `{type_name}`")))?;
    domain.borrow().get(name).cloned().ok_or_else(|| CsError::undefined(name, crate::error::LookupScope::Any))
}

/// If `found` is a `member_fn` callable, binds it to `receiver` as an
/// object-method (steps 4-5); otherwise returns it unchanged.
fn bind_member_fn(receiver: &Value, found: Value) -> Value {
    if let Repr::Callable(callable) = &found.repr {
        if callable.kind == CallableKind::MemberFn {
            return Value::object_method(receiver.deep_copy_shallow_for_method(), callable.clone());
        }
    }
    found
}

impl Value {
    /// Object-methods bind the receiver by (cheap, shallow) reference, not a
    /// deep copy - mutation through `self` inside the method must be visible.
    fn deep_copy_shallow_for_method(&self) -> Value {
        self.clone()
    }
}

/// Arrow (`->`): dereference then dot.
pub fn resolve_arrow(
    domain_manager: &crate::domain::DomainManager,
    registry: &ExtensionRegistry,
    pointer: &Value,
    name: &str,
) -> Result<Value, CsError> {
    match &pointer.repr {
        Repr::Pointer(cell) => {
            let inner = cell.borrow().clone().ok_or_else(|| CsError::unsupported("dereference of a null pointer"))?;
            resolve_dot(domain_manager, registry, &inner, name)
        }
        _ => Err(CsError::unsupported("`->` requires a pointer operand")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Callable, CallableBody};
    use std::rc::Rc;

    #[test]
    fn global_sentinel_routes_to_global_domain() {
        let mut dm = crate::domain::DomainManager::new();
        dm.add_var_global("x", Value::int(7)).unwrap();
        let registry = ExtensionRegistry::new();
        let v = resolve_dot(&dm, &registry, &Value::sentinel(Sentinel::Global), "x").unwrap();
        assert_eq!(v.as_int(), Some(7));
    }

    #[test]
    fn struct_member_fn_binds_receiver() {
        let dm = crate::domain::DomainManager::new();
        let registry = ExtensionRegistry::new();
        let instance_domain = new_domain();
        let callable = Callable {
            body: CallableBody::Native(Rc::new(|_, _| Ok(Value::int(1)))),
            kind: CallableKind::MemberFn,
            arity: 0,
        };
        instance_domain.borrow_mut().insert("go".to_string(), Value::callable(callable));
        let instance = Value::struct_instance("Point", instance_domain);
        let resolved = resolve_dot(&dm, &registry, &instance, "go").unwrap();
        assert!(matches!(resolved.repr, Repr::ObjectMethod(_)));
    }

    #[test]
    fn namespace_dot_resolves_into_its_own_domain() {
        let dm = crate::domain::DomainManager::new();
        let registry = ExtensionRegistry::new();
        let ns_domain = new_domain();
        ns_domain.borrow_mut().insert("pi".to_string(), Value::float(3.25));
        let ns = Value::namespace("math", ns_domain);
        let resolved = resolve_dot(&dm, &registry, &ns, "pi").unwrap();
        assert_eq!(resolved.as_number(), Some(3.25));
    }

    #[test]
    fn arrow_on_null_pointer_fails() {
        let dm = crate::domain::DomainManager::new();
        let registry = ExtensionRegistry::new();
        let p = Value::pointer(None);
        assert!(resolve_arrow(&dm, &registry, &p, "foo").is_err());
    }
}
