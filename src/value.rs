//! Value Model
//!
//! The tagged value type shared by the interpreter, the embedding API and
//! the native-function layer. Scalars are stored inline; strings, lists,
//! maps, string buffers, functions and promises are reference-counted heap
//! objects. Cloning a `Value` bumps the relevant refcount; dropping the
//! last clone releases the object.

use std::fmt;
use std::rc::Rc;
use std::cell::RefCell;

use indexmap::IndexMap;
use thiserror::Error;

use crate::ast::types::FuncDecl;
use crate::event_loop::promise::Promise;
use crate::interpreter::env::Env;
use crate::vm::Vm;

/// A script-defined function: its declaration plus the environment it
/// captured at definition time.
pub struct Function {
    pub decl: Rc<FuncDecl>,
    pub closure: Rc<Env>,
    /// Source name of the defining script, for stack traces.
    pub source: Rc<str>,
}

impl Function {
    pub fn name(&self) -> &str {
        self.decl.name.as_deref().unwrap_or("<fn>")
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.name())
    }
}

/// Error returned by a native function. The interpreter stamps the call
/// site onto the message when it surfaces.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<String> for NativeError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for NativeError {
    fn from(message: &str) -> Self {
        Self { message: message.to_string() }
    }
}

/// Implementation signature for host-provided functions. Host state
/// ("userdata") is captured by the closure itself.
pub type NativeImpl = Box<dyn Fn(&mut Vm, &[Value]) -> Result<Value, NativeError>>;

/// A host-provided callable bound into the global scope.
pub struct NativeFunction {
    pub name: String,
    pub f: NativeImpl,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Any script-visible datum.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Immutable string.
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    /// Insertion-ordered map from string keys to values.
    Map(Rc<RefCell<IndexMap<String, Value>>>),
    /// Mutable growable string buffer.
    StrBuf(Rc<RefCell<String>>),
    /// Lazy integer sequence.
    Range { start: i64, end: i64, inclusive: bool },
    Func(Rc<Function>),
    Native(Rc<NativeFunction>),
    Promise(Rc<Promise>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map() -> Value {
        Value::Map(Rc::new(RefCell::new(IndexMap::new())))
    }

    pub fn strbuf() -> Value {
        Value::StrBuf(Rc::new(RefCell::new(String::new())))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::StrBuf(_) => "strbuf",
            Value::Range { .. } => "range",
            Value::Func(_) => "function",
            Value::Native(_) => "native",
            Value::Promise(_) => "promise",
        }
    }

    /// `nil` and `false` are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Value equality: same-type scalar equality, string content equality,
    /// identity for containers and callables.
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::StrBuf(a), Value::StrBuf(b)) => Rc::ptr_eq(a, b),
            (
                Value::Range { start: a, end: b, inclusive: i },
                Value::Range { start: c, end: d, inclusive: j },
            ) => a == c && b == d && i == j,
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Promise(a), Value::Promise(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Render a value the way `print` and string concatenation do.
    pub fn stringify(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.to_string(),
            Value::StrBuf(b) => b.borrow().clone(),
            Value::Range { start, end, inclusive } => {
                if *inclusive {
                    format!("{}..={}", start, end)
                } else {
                    format!("{}..{}", start, end)
                }
            }
            Value::List(_) => "<list>".to_string(),
            Value::Map(_) => "<map>".to_string(),
            Value::Func(_) => "<function>".to_string(),
            Value::Native(_) => "<native>".to_string(),
            Value::Promise(_) => "<promise>".to_string(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    // ---- list helpers (embedding surface) ----

    pub fn list_len(&self) -> Option<usize> {
        match self {
            Value::List(l) => Some(l.borrow().len()),
            _ => None,
        }
    }

    /// Returns `Nil` when the index is out of bounds.
    pub fn list_get(&self, index: usize) -> Value {
        match self {
            Value::List(l) => l.borrow().get(index).cloned().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    /// Writing past the end grows the list, filling the gap with `nil`.
    pub fn list_set(&self, index: usize, value: Value) -> bool {
        match self {
            Value::List(l) => {
                let mut items = l.borrow_mut();
                if index >= items.len() {
                    items.resize(index + 1, Value::Nil);
                }
                items[index] = value;
                true
            }
            _ => false,
        }
    }

    pub fn list_push(&self, value: Value) -> bool {
        match self {
            Value::List(l) => {
                l.borrow_mut().push(value);
                true
            }
            _ => false,
        }
    }

    /// Returns `Nil` when the list is empty.
    pub fn list_pop(&self) -> Value {
        match self {
            Value::List(l) => l.borrow_mut().pop().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    // ---- map helpers (embedding surface) ----

    pub fn map_len(&self) -> Option<usize> {
        match self {
            Value::Map(m) => Some(m.borrow().len()),
            _ => None,
        }
    }

    /// Returns `Nil` when the key is missing.
    pub fn map_get(&self, key: &str) -> Value {
        match self {
            Value::Map(m) => m.borrow().get(key).cloned().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    /// Replacing an existing key keeps its original insertion slot.
    pub fn map_set(&self, key: &str, value: Value) -> bool {
        match self {
            Value::Map(m) => {
                m.borrow_mut().insert(key.to_string(), value);
                true
            }
            _ => false,
        }
    }

    pub fn map_has(&self, key: &str) -> bool {
        match self {
            Value::Map(m) => m.borrow().contains_key(key),
            _ => false,
        }
    }

    pub fn map_del(&self, key: &str) -> bool {
        match self {
            Value::Map(m) => m.borrow_mut().shift_remove(key).is_some(),
            _ => false,
        }
    }

    /// Keys in insertion order.
    pub fn map_keys(&self) -> Vec<String> {
        match self {
            Value::Map(m) => m.borrow().keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Rc::from(v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::str("").is_truthy());
        assert!(Value::list(vec![]).is_truthy());
    }

    #[test]
    fn test_scalar_equality() {
        assert!(Value::Int(3).eq_value(&Value::Int(3)));
        assert!(!Value::Int(3).eq_value(&Value::Int(4)));
        // Cross-type comparison is never equal.
        assert!(!Value::Int(1).eq_value(&Value::Float(1.0)));
        assert!(Value::str("ab").eq_value(&Value::str("ab")));
    }

    #[test]
    fn test_container_identity_equality() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = Value::list(vec![Value::Int(1)]);
        let a2 = a.clone();
        assert!(!a.eq_value(&b));
        assert!(a.eq_value(&a2));
    }

    #[test]
    fn test_list_set_grows_with_nil() {
        let l = Value::list(vec![Value::Int(1)]);
        assert!(l.list_set(3, Value::Int(9)));
        assert_eq!(l.list_len(), Some(4));
        assert!(l.list_get(1).is_nil());
        assert!(l.list_get(2).is_nil());
        assert_eq!(l.list_get(3).as_int(), Some(9));
    }

    #[test]
    fn test_map_insertion_order_preserved() {
        let m = Value::map();
        m.map_set("a", Value::Int(1));
        m.map_set("b", Value::Int(2));
        m.map_set("c", Value::Int(3));
        // Replacing a key keeps its slot.
        m.map_set("a", Value::Int(10));
        assert_eq!(m.map_keys(), vec!["a", "b", "c"]);
        assert_eq!(m.map_get("a").as_int(), Some(10));
    }

    #[test]
    fn test_map_del() {
        let m = Value::map();
        m.map_set("x", Value::Int(1));
        assert!(m.map_has("x"));
        assert!(m.map_del("x"));
        assert!(!m.map_has("x"));
        assert!(!m.map_del("x"));
    }

    #[test]
    fn test_stringify() {
        assert_eq!(Value::Nil.stringify(), "nil");
        assert_eq!(Value::Bool(true).stringify(), "true");
        assert_eq!(Value::Int(-7).stringify(), "-7");
        assert_eq!(Value::str("hi").stringify(), "hi");
        assert_eq!(
            Value::Range { start: 1, end: 5, inclusive: false }.stringify(),
            "1..5"
        );
    }
}
