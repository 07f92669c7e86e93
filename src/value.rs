//! The dynamic value type shared by the evaluator and the bytecode backend.
//!
//! A [`Value`] pairs a [`Repr`] payload with the `protected`/`constant` bits
//! the language attaches to every slot. Containers (`Array`, `Map`, `Str`)
//! are reference-counted handles; copy-assignment deep-copies them
//! explicitly via [`Value::deep_copy`] rather than through `Clone`, which
//! stays a cheap reference bump (shallow copy otherwise).

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::domain::Domain;

pub type Shared<T> = Rc<RefCell<T>>;

fn shared<T>(v: T) -> Shared<T> {
    Rc::new(RefCell::new(v))
}

/// A map keyed by `Value`. Keys compare and hash on a canonical bit-stable
/// form so the underlying `ahash` map never panics on NaN; the *language's*
/// `==` operator has its own IEEE-754-faithful semantics (`value_equal`) and
/// is not used for map-key identity.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: ahash::AHashMap<ValueKey, (Value, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(&ValueKey(key.clone())).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.contains_key(&ValueKey(key.clone()))
    }

    /// Inserts or overwrites `key -> value`, keeping the original key Value.
    pub fn insert(&mut self, key: Value, value: Value) {
        self.entries
            .entry(ValueKey(key.clone()))
            .and_modify(|(_, v)| *v = value.clone())
            .or_insert((key, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(k, v)| (k, v))
    }
}

#[derive(Debug, Clone)]
struct ValueKey(Value);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.canonical_bits().eq(&other.0.canonical_bits())
    }
}
impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.canonical_bits().hash(state);
    }
}

/// A first-class callable: either a user-defined function or a native one.
#[derive(Clone)]
pub enum CallableBody {
    /// Interpreted function: formal argument names, body statements, and the
    /// captured context domain (enables recursion and closure).
    Function { args: Rc<Vec<String>>, body: Rc<Vec<crate::ast::Stmt>>, context: Domain },
    /// A compiled bytecode closure, referenced by the name it was pinned
    /// under in the shared global registry.
    Bytecode { registry_name: Rc<str> },
    /// A host function exposed through the extension protocol. Evaluator
    /// state is all behind `RefCell`, so natives take a shared reference
    /// like every other dispatch path.
    Native(Rc<dyn Fn(&crate::eval::Evaluator, Vec<Value>) -> Result<Value, crate::error::CsError>>),
}

/// Whether a callable is a bare function or a struct method bound to `self`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Free,
    MemberFn,
}

pub struct Callable {
    pub body: CallableBody,
    pub kind: CallableKind,
    pub arity: usize,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("kind", &self.kind).field("arity", &self.arity).finish()
    }
}

/// A callable pre-bound to a receiver, materialized when dot-resolution
/// finds a `member_fn` on a struct instance or extension.
#[derive(Debug, Clone)]
pub struct ObjectMethod {
    pub receiver: Box<Value>,
    pub callable: Rc<Callable>,
}

/// Pair, array, hash-map, pointer, struct, namespace, callable, etc - the
/// concrete payload kinds a dynamic `Value` can hold.
#[derive(Clone)]
pub enum Repr {
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(Shared<Vec<u8>>),
    Array(Shared<Vec<Value>>),
    Pair(Rc<(Value, Value)>),
    Map(Shared<ValueMap>),
    /// A nullable shared handle produced by `gcnew` (`x[i]`, unary `*`).
    Pointer(Shared<Option<Value>>),
    Callable(Rc<Callable>),
    ObjectMethod(Rc<ObjectMethod>),
    /// Type descriptor, identified by a stable name + hash.
    Type(Rc<str>),
    /// A named bag of fields backed by its own domain.
    Struct { type_name: Rc<str>, domain: Domain },
    /// A domain exported by name; the plug point for namespaces.
    Namespace { name: Rc<str>, domain: Domain },
    /// A user-throwable error value, carried until a `try` catches it.
    LangError(Rc<str>),
    /// `global` / `current` constant-value sentinels consumed by dot-resolution.
    Sentinel(Sentinel),
    /// The `null` literal; also the implicit content of an un-dereferenceable pointer.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Global,
    Current,
}

/// A dynamic value: payload plus the protected/constant bits every slot
/// carries.
#[derive(Clone)]
pub struct Value {
    pub repr: Repr,
    pub protected: bool,
    pub constant: bool,
}

impl Value {
    pub fn new(repr: Repr) -> Self {
        Self { repr, protected: false, constant: false }
    }

    #[must_use]
    pub fn protect(mut self) -> Self {
        self.protected = true;
        self
    }

    #[must_use]
    pub fn make_constant(mut self) -> Self {
        self.constant = true;
        self
    }

    pub fn null() -> Self {
        Self::new(Repr::Null)
    }
    pub fn bool(b: bool) -> Self {
        Self::new(Repr::Bool(b))
    }
    pub fn int(i: i64) -> Self {
        Self::new(Repr::Int(i))
    }
    pub fn float(f: f64) -> Self {
        Self::new(Repr::Float(f))
    }
    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        Self::new(Repr::Str(shared(s.into())))
    }
    pub fn array(items: Vec<Value>) -> Self {
        Self::new(Repr::Array(shared(items)))
    }
    pub fn pair(key: Value, value: Value) -> Self {
        Self::new(Repr::Pair(Rc::new((key, value))))
    }
    pub fn map(m: ValueMap) -> Self {
        Self::new(Repr::Map(shared(m)))
    }
    pub fn pointer(inner: Option<Value>) -> Self {
        Self::new(Repr::Pointer(shared(inner)))
    }
    pub fn callable(c: Callable) -> Self {
        Self::new(Repr::Callable(Rc::new(c)))
    }
    pub fn object_method(receiver: Value, callable: Rc<Callable>) -> Self {
        let constant = callable.body_is_constant();
        let mut v = Self::new(Repr::ObjectMethod(Rc::new(ObjectMethod { receiver: Box::new(receiver), callable })));
        v.constant = constant;
        v
    }
    pub fn sentinel(s: Sentinel) -> Self {
        Self::new(Repr::Sentinel(s))
    }
    pub fn lang_error(msg: impl Into<Rc<str>>) -> Self {
        Self::new(Repr::LangError(msg.into()))
    }
    pub fn type_desc(name: impl Into<Rc<str>>) -> Self {
        Self::new(Repr::Type(name.into()))
    }
    pub fn namespace(name: impl Into<Rc<str>>, domain: Domain) -> Self {
        Self::new(Repr::Namespace { name: name.into(), domain })
    }
    pub fn struct_instance(type_name: impl Into<Rc<str>>, domain: Domain) -> Self {
        Self::new(Repr::Struct { type_name: type_name.into(), domain })
    }

    pub fn is_null(&self) -> bool {
        matches!(self.repr, Repr::Null)
    }
    pub fn is_lang_error(&self) -> bool {
        matches!(self.repr, Repr::LangError(_))
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self.repr {
            Repr::Bool(b) => Some(b),
            _ => None,
        }
    }
    pub fn as_int(&self) -> Option<i64> {
        match self.repr {
            Repr::Int(i) => Some(i),
            _ => None,
        }
    }
    pub fn as_number(&self) -> Option<f64> {
        match self.repr {
            Repr::Int(i) => Some(i as f64),
            Repr::Float(f) => Some(f),
            _ => None,
        }
    }
    pub fn is_number(&self) -> bool {
        matches!(self.repr, Repr::Int(_) | Repr::Float(_))
    }

    /// A type tag accessible by identity ((i)). Used to implement `typeid`.
    pub fn type_name(&self) -> &'static str {
        match &self.repr {
            Repr::Bool(_) => "bool",
            Repr::Int(_) => "number",
            Repr::Float(_) => "number",
            Repr::Char(_) => "char",
            Repr::Str(_) => "string",
            Repr::Array(_) => "array",
            Repr::Pair(_) => "pair",
            Repr::Map(_) => "hash_map",
            Repr::Pointer(_) => "pointer",
            Repr::Callable(_) => "callable",
            Repr::ObjectMethod(_) => "callable",
            Repr::Type(_) => "type",
            Repr::Struct { .. } => "struct",
            Repr::Namespace { .. } => "namespace",
            Repr::LangError(_) => "lang_error",
            Repr::Sentinel(_) => "sentinel",
            Repr::Null => "null",
        }
    }

    /// `typeid(v)`: a stable integer identifying the dynamic type.
    pub fn type_id(&self) -> u64 {
        let mut h = DefaultHasher::new();
        match &self.repr {
            Repr::Struct { type_name, .. } => type_name.hash(&mut h),
            Repr::Type(name) => name.hash(&mut h),
            _ => self.type_name().hash(&mut h),
        };
        h.finish()
    }

    /// Stable, copy-invariant bit pattern used both for `ValueKey` map
    /// identity and for `hash()`, so `hash(v) == hash(copy(v))` always holds.
    fn canonical_bits(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.repr {
            Repr::Bool(b) => out.extend_from_slice(&[0u8, u8::from(*b)]),
            Repr::Int(i) => {
                out.push(1);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Repr::Float(f) => {
                out.push(2);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Repr::Char(c) => {
                out.push(3);
                out.extend_from_slice(&(*c as u32).to_le_bytes());
            }
            Repr::Str(s) => {
                out.push(4);
                out.extend_from_slice(&s.borrow());
            }
            Repr::Array(a) => {
                out.push(5);
                for item in a.borrow().iter() {
                    out.extend_from_slice(&item.canonical_bits());
                }
            }
            Repr::Pair(p) => {
                out.push(6);
                out.extend_from_slice(&p.0.canonical_bits());
                out.extend_from_slice(&p.1.canonical_bits());
            }
            Repr::Map(m) => {
                out.push(7);
                let mut parts: Vec<_> = m.borrow().iter().map(|(k, v)| (k.canonical_bits(), v.canonical_bits())).collect();
                parts.sort();
                for (k, v) in parts {
                    out.extend(k);
                    out.extend(v);
                }
            }
            Repr::Pointer(p) => {
                out.push(8);
                if let Some(inner) = p.borrow().as_ref() {
                    out.extend(inner.canonical_bits());
                }
            }
            Repr::Null => out.push(9),
            Repr::LangError(s) => {
                out.push(10);
                out.extend_from_slice(s.as_bytes());
            }
            Repr::Type(s) => {
                out.push(11);
                out.extend_from_slice(s.as_bytes());
            }
            Repr::Sentinel(s) => out.extend_from_slice(&[12u8, *s as u8]),
            // Reference-identity kinds: hash the pointer address, matching
            // "a cheap hash derived from the concrete payload" for kinds
            // without value semantics.
            Repr::Callable(c) => {
                out.push(13);
                out.extend_from_slice(&(Rc::as_ptr(c) as usize).to_le_bytes());
            }
            Repr::ObjectMethod(m) => {
                out.push(14);
                out.extend_from_slice(&(Rc::as_ptr(m) as usize).to_le_bytes());
            }
            Repr::Struct { domain, .. } => {
                out.push(15);
                out.extend_from_slice(&(domain.as_ptr() as usize).to_le_bytes());
            }
            Repr::Namespace { domain, .. } => {
                out.push(16);
                out.extend_from_slice(&(domain.as_ptr() as usize).to_le_bytes());
            }
        }
        out
    }

    /// `hash(v)` ((iv), runtime extension `hash`).
    pub fn hash_value(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.canonical_bits().hash(&mut h);
        h.finish()
    }

    /// Copy-assign semantics: deep copy for containers, shallow
    /// (reference bump) otherwise. The `protect` bit never propagates.
    pub fn deep_copy(&self) -> Value {
        let repr = match &self.repr {
            Repr::Str(s) => Repr::Str(shared(s.borrow().clone())),
            Repr::Array(a) => Repr::Array(shared(a.borrow().iter().map(Value::deep_copy).collect())),
            Repr::Pair(p) => Repr::Pair(Rc::new((p.0.deep_copy(), p.1.deep_copy()))),
            Repr::Map(m) => {
                let mut new_map = ValueMap::new();
                for (k, v) in m.borrow().iter() {
                    new_map.insert(k.deep_copy(), v.deep_copy());
                }
                Repr::Map(shared(new_map))
            }
            other => other.clone(),
        };
        Value { repr, protected: false, constant: self.constant }
    }

    /// A best-effort textual rendering, used for string concatenation
    /// (`+` on (string, any)) and diagnostics.
    pub fn display_lossy(&self) -> String {
        match &self.repr {
            Repr::Bool(b) => b.to_string(),
            Repr::Int(i) => i.to_string(),
            Repr::Float(f) => {
                let mut buf = ryu::Buffer::new();
                buf.format(*f).to_string()
            }
            Repr::Char(c) => c.to_string(),
            Repr::Str(s) => String::from_utf8_lossy(&s.borrow()).into_owned(),
            Repr::Null => "null".to_string(),
            Repr::Array(a) => {
                let items: Vec<String> = a.borrow().iter().map(Value::display_lossy).collect();
                format!("[{}]", items.join(", "))
            }
            Repr::Pair(p) => format!("{}: {}", p.0.display_lossy(), p.1.display_lossy()),
            Repr::Map(m) => {
                let items: Vec<String> =
                    m.borrow().iter().map(|(k, v)| format!("{}: {}", k.display_lossy(), v.display_lossy())).collect();
                format!("{{{}}}", items.join(", "))
            }
            Repr::LangError(s) => s.to_string(),
            Repr::Type(s) => format!("<type {s}>"),
            Repr::Struct { type_name, .. } => format!("<struct {type_name}>"),
            Repr::Namespace { name, .. } => format!("<namespace {name}>"),
            Repr::Sentinel(Sentinel::Global) => "<global>".to_string(),
            Repr::Sentinel(Sentinel::Current) => "<current>".to_string(),
            Repr::Pointer(p) => match p.borrow().as_ref() {
                Some(v) => format!("->{}", v.display_lossy()),
                None => "null".to_string(),
            },
            Repr::Callable(_) | Repr::ObjectMethod(_) => "<callable>".to_string(),
        }
    }

    /// `==`/`!=` (); structural, IEEE-754-faithful for floats (so
    /// `NaN == NaN` is `false`, independent of `hash_value`'s canonical form).
    pub fn value_equal(&self, other: &Value) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Bool(a), Repr::Bool(b)) => a == b,
            (Repr::Int(a), Repr::Int(b)) => a == b,
            (Repr::Float(a), Repr::Float(b)) => a == b,
            (Repr::Int(a), Repr::Float(b)) | (Repr::Float(b), Repr::Int(a)) => (*a as f64) == *b,
            (Repr::Char(a), Repr::Char(b)) => a == b,
            (Repr::Str(a), Repr::Str(b)) => *a.borrow() == *b.borrow(),
            (Repr::Null, Repr::Null) => true,
            (Repr::Array(a), Repr::Array(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.value_equal(y))
            }
            (Repr::Pair(a), Repr::Pair(b)) => a.0.value_equal(&b.0) && a.1.value_equal(&b.1),
            (Repr::Map(a), Repr::Map(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| bv.value_equal(v)))
            }
            (Repr::Pointer(a), Repr::Pointer(b)) => Rc::ptr_eq(a, b),
            (Repr::LangError(a), Repr::LangError(b)) => a == b,
            (Repr::Type(a), Repr::Type(b)) => a == b,
            (Repr::Sentinel(a), Repr::Sentinel(b)) => a == b,
            (Repr::Struct { domain: a, .. }, Repr::Struct { domain: b, .. }) => Rc::ptr_eq(a, b),
            (Repr::Namespace { domain: a, .. }, Repr::Namespace { domain: b, .. }) => Rc::ptr_eq(a, b),
            (Repr::Callable(a), Repr::Callable(b)) => Rc::ptr_eq(a, b),
            (Repr::ObjectMethod(a), Repr::ObjectMethod(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Callable {
    pub fn body_is_constant(&self) -> bool {
        matches!(self.body, CallableBody::Native(_))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.display_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_stable_across_copy() {
        let a = Value::array(vec![Value::int(1), Value::int(2)]);
        let b = a.deep_copy();
        assert_eq!(a.hash_value(), b.hash_value());
        assert!(a.value_equal(&b));
    }

    #[test]
    fn typeid_is_reflexive() {
        let v = Value::string("hi");
        assert_eq!(v.type_id(), v.type_id());
    }

    #[test]
    fn protect_bit_does_not_propagate_through_copy() {
        let v = Value::int(5).protect();
        let copied = v.deep_copy();
        assert!(!copied.protected);
    }

    #[test]
    fn nan_inequal_but_hashable() {
        let a = Value::float(f64::NAN);
        let b = Value::float(f64::NAN);
        assert!(!a.value_equal(&b));
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn map_insert_and_get() {
        let mut m = ValueMap::new();
        m.insert(Value::string("x"), Value::int(1));
        assert!(m.get(&Value::string("x")).unwrap().value_equal(&Value::int(1)));
        assert!(m.get(&Value::string("y")).is_none());
    }
}
