//! Domain Manager: the scope stack.
//!
//! Two parallel stacks are pushed/popped together: a *record set* (declared
//! names, for hoisting and redeclaration checks) and a *domain* (name to
//! value bindings). Front of each deque is innermost; the back-most domain
//! is global and is never popped.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::error::{CsError, LookupScope};
use crate::value::Value;

/// A mapping from identifier to value, shared by reference ("Domain").
/// Backs scopes, struct instances, namespaces, and extensions alike.
pub type Domain = Rc<RefCell<ahash::AHashMap<String, Value>>>;

pub fn new_domain() -> Domain {
    Rc::new(RefCell::new(ahash::AHashMap::new()))
}

/// Sentinel marking a record set as a struct-definition region (scope
/// stack invariants, `mark_set_as_struct`).
pub const STRUCT_DEFINITION_MARKER: &str = "__PRAGMA_CS_STRUCT_DEFINITION__";

struct RecordSet {
    names: HashSet<String>,
}

impl RecordSet {
    fn new() -> Self {
        Self { names: HashSet::new() }
    }

    fn is_struct_definition(&self) -> bool {
        self.names.contains(STRUCT_DEFINITION_MARKER)
    }
}

/// The scope stack: innermost at the front of each deque.
pub struct DomainManager {
    sets: Vec<RecordSet>,
    domains: Vec<Domain>,
}

impl DomainManager {
    pub fn new() -> Self {
        Self { sets: vec![RecordSet::new()], domains: vec![new_domain()] }
    }

    pub fn global_domain(&self) -> &Domain {
        self.domains.last().expect("global domain is never popped")
    }

    pub fn current_domain(&self) -> &Domain {
        self.domains.first().expect("domain stack is never empty")
    }

    pub fn depth(&self) -> usize {
        self.domains.len()
    }

    pub fn add_set(&mut self) {
        self.sets.insert(0, RecordSet::new());
    }

    pub fn remove_set(&mut self) {
        self.sets.remove(0);
    }

    pub fn add_domain(&mut self) {
        self.domains.insert(0, new_domain());
    }

    pub fn add_domain_with(&mut self, domain: Domain) {
        self.domains.insert(0, domain);
    }

    pub fn remove_domain(&mut self) {
        assert!(self.domains.len() > 1, "the global domain must never be popped");
        self.domains.remove(0);
    }

    /// Declares `name` in the innermost record set; `Redefinition` if already present.
    pub fn add_record(&mut self, name: &str) -> Result<(), CsError> {
        let set = self.sets.first_mut().expect("record-set stack is never empty");
        if !set.names.insert(name.to_string()) {
            return Err(CsError::redefinition(name));
        }
        Ok(())
    }

    pub fn mark_set_as_struct(&mut self) {
        self.sets.first_mut().expect("record-set stack is never empty").names.insert(STRUCT_DEFINITION_MARKER.to_string());
    }

    pub fn current_set_is_struct_definition(&self) -> bool {
        self.sets.first().is_some_and(RecordSet::is_struct_definition)
    }

    pub fn add_var(&mut self, name: &str, value: Value) -> Result<(), CsError> {
        let domain = self.current_domain();
        if domain.borrow().contains_key(name) {
            return Err(CsError::already_bound(name));
        }
        domain.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    pub fn add_var_global(&mut self, name: &str, value: Value) -> Result<(), CsError> {
        let domain = self.global_domain();
        if domain.borrow().contains_key(name) {
            return Err(CsError::already_bound(name));
        }
        domain.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    /// Unconditional bind-or-overwrite; used by assignment to an
    /// already-declared local where `add_var`'s uniqueness check would fire.
    pub fn set_var_current(&mut self, name: &str, value: Value) {
        self.current_domain().borrow_mut().insert(name.to_string(), value);
    }

    /// Assignment target resolution (`=`): overwrite the first binding
    /// found walking innermost-to-global; `Undefined` if never declared.
    pub fn set_var_current_or_outer(&mut self, name: &str, value: Value) -> Result<(), CsError> {
        for domain in &self.domains {
            if domain.borrow().contains_key(name) {
                domain.borrow_mut().insert(name.to_string(), value);
                return Ok(());
            }
        }
        Err(CsError::undefined(name, LookupScope::Any))
    }

    pub fn var_exist(&self, name: &str) -> bool {
        self.domains.iter().any(|d| d.borrow().contains_key(name))
    }

    pub fn var_exist_current(&self, name: &str) -> bool {
        self.current_domain().borrow().contains_key(name)
    }

    pub fn var_exist_global(&self, name: &str) -> bool {
        self.global_domain().borrow().contains_key(name)
    }

    pub fn get_var(&self, name: &str) -> Result<Value, CsError> {
        for domain in &self.domains {
            if let Some(v) = domain.borrow().get(name) {
                return Ok(v.clone());
            }
        }
        Err(CsError::undefined(name, LookupScope::Any))
    }

    pub fn get_var_current(&self, name: &str) -> Result<Value, CsError> {
        self.current_domain()
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| CsError::undefined(name, LookupScope::Current))
    }

    pub fn get_var_global(&self, name: &str) -> Result<Value, CsError> {
        self.global_domain()
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| CsError::undefined(name, LookupScope::Global))
    }

    /// Merges `other`'s bindings into the innermost domain, failing per-name
    /// on collision (`involve_domain`).
    pub fn involve_domain(&mut self, other: &Domain) -> Result<(), CsError> {
        let incoming: Vec<(String, Value)> = other.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (name, value) in incoming {
            self.add_var(&name, value)?;
        }
        Ok(())
    }

    /// Declares a record and binds it in one step, as `var x = e` does.
    pub fn declare_and_bind(&mut self, name: &str, value: Value) -> Result<(), CsError> {
        self.add_record(name)?;
        self.add_var(name, value)
    }

    /// Replaces the entire live scope stack with `[locals, context, global]`
    /// for the duration of a function call, so the callee sees only its own
    /// captured context and the global domain - never the caller's locals
    /// ("Function": "a captured context reference enabling recursion and
    /// closure over enclosing declarations"). Pair with [`Self::restore_from_call`].
    pub fn swap_for_call(&mut self, context: Domain) -> SavedFrame {
        let global = self.global_domain().clone();
        let saved_domains = std::mem::replace(&mut self.domains, vec![new_domain(), context, global]);
        let saved_sets = std::mem::replace(&mut self.sets, vec![RecordSet::new()]);
        SavedFrame { domains: saved_domains, sets: saved_sets }
    }

    pub fn restore_from_call(&mut self, saved: SavedFrame) {
        self.domains = saved.domains;
        self.sets = saved.sets;
    }
}

/// Opaque snapshot of the scope stack saved across a function call by
/// [`DomainManager::swap_for_call`].
pub struct SavedFrame {
    domains: Vec<Domain>,
    sets: Vec<RecordSet>,
}

impl Default for DomainManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard pushing a (record-set, domain) pair and popping both on drop,
/// so scope exit happens along every path including a thrown error.
pub struct ScopeGuard<'a> {
    manager: &'a RefCell<DomainManager>,
    pushed_domain: bool,
}

impl<'a> ScopeGuard<'a> {
    pub fn enter(manager: &'a RefCell<DomainManager>) -> Self {
        manager.borrow_mut().add_set();
        manager.borrow_mut().add_domain();
        Self { manager, pushed_domain: true }
    }

    /// Enters a scope that reuses an existing domain (e.g. a struct's own
    /// domain while running its definition statements) instead of a fresh one.
    pub fn enter_with_domain(manager: &'a RefCell<DomainManager>, domain: Domain) -> Self {
        manager.borrow_mut().add_set();
        manager.borrow_mut().add_domain_with(domain);
        Self { manager, pushed_domain: true }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.pushed_domain {
            self.manager.borrow_mut().remove_set();
            self.manager.borrow_mut().remove_domain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn redeclaration_in_same_scope_fails() {
        let mut dm = DomainManager::new();
        dm.add_record("x").unwrap();
        assert!(matches!(dm.add_record("x"), Err(CsError::Redefinition(_))));
    }

    #[test]
    fn shadowing_and_scope_pop_restores_outer_binding() {
        let manager = StdRefCell::new(DomainManager::new());
        manager.borrow_mut().add_var("x", Value::int(1)).unwrap();
        {
            let _guard = ScopeGuard::enter(&manager);
            manager.borrow_mut().add_var("x", Value::int(2)).unwrap();
            assert_eq!(manager.borrow().get_var("x").unwrap().as_int(), Some(2));
        }
        assert_eq!(manager.borrow().get_var("x").unwrap().as_int(), Some(1));
        assert_eq!(manager.borrow().depth(), 1);
    }

    #[test]
    fn global_domain_never_pops() {
        let mut dm = DomainManager::new();
        dm.add_domain();
        dm.remove_domain();
        assert_eq!(dm.depth(), 1);
    }

    #[test]
    fn undefined_lookup_reports_scope() {
        let dm = DomainManager::new();
        match dm.get_var_current("missing") {
            Err(CsError::Undefined { scope: LookupScope::Current, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
