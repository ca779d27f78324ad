//! Lexical Environments
//!
//! A scope is a node with a parent link and an ordered list of bindings.
//! Scopes are small, so a linear scan beats a hash table once interpreter
//! dispatch cost is factored in. Environments are reference-counted so a
//! closure can keep its defining scope alive after the enclosing call
//! returns.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

#[derive(Debug)]
struct Binding {
    name: String,
    value: Value,
    is_const: bool,
}

/// Outcome of an assignment through the scope chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResult {
    Updated,
    ConstViolation,
    NotFound,
}

#[derive(Debug)]
pub struct Env {
    parent: Option<Rc<Env>>,
    bindings: RefCell<Vec<Binding>>,
}

impl Env {
    pub fn new(parent: Option<Rc<Env>>) -> Self {
        Self { parent, bindings: RefCell::new(Vec::new()) }
    }

    pub fn parent(&self) -> Option<&Rc<Env>> {
        self.parent.as_ref()
    }

    /// Bind a name in this scope. `let`/`const` always bind here, even if
    /// an outer scope has the same name. Redeclaring in the same scope
    /// replaces the binding in place, unless it was declared `const`.
    pub fn define(&self, name: &str, value: Value, is_const: bool) -> Result<(), ()> {
        let mut bindings = self.bindings.borrow_mut();
        if let Some(b) = bindings.iter_mut().find(|b| b.name == name) {
            if b.is_const {
                return Err(());
            }
            b.value = value;
            b.is_const = is_const;
            return Ok(());
        }
        bindings.push(Binding { name: name.to_string(), value, is_const });
        Ok(())
    }

    /// Look a name up through the scope chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut env = self;
        loop {
            if let Some(b) = env.bindings.borrow().iter().find(|b| b.name == name) {
                return Some(b.value.clone());
            }
            match &env.parent {
                Some(p) => env = p,
                None => return None,
            }
        }
    }

    pub fn has(&self, name: &str) -> bool {
        let mut env = self;
        loop {
            if env.bindings.borrow().iter().any(|b| b.name == name) {
                return true;
            }
            match &env.parent {
                Some(p) => env = p,
                None => return false,
            }
        }
    }

    /// Write to the nearest scope that already binds `name`.
    pub fn set(&self, name: &str, value: Value) -> SetResult {
        let mut env = self;
        loop {
            {
                let mut bindings = env.bindings.borrow_mut();
                if let Some(b) = bindings.iter_mut().find(|b| b.name == name) {
                    if b.is_const {
                        return SetResult::ConstViolation;
                    }
                    b.value = value;
                    return SetResult::Updated;
                }
            }
            match &env.parent {
                Some(p) => env = p,
                None => return SetResult::NotFound,
            }
        }
    }

    /// Values bound in this scope (not the chain). Used by the cycle
    /// collector's mark phase.
    pub fn local_values(&self) -> Vec<Value> {
        self.bindings.borrow().iter().map(|b| b.value.clone()).collect()
    }

    /// Drop every binding in this scope. Used by the cycle collector to
    /// break unreachable environment cycles.
    pub fn clear_bindings(&self) {
        self.bindings.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_get() {
        let env = Rc::new(Env::new(None));
        env.define("x", Value::Int(1), false).unwrap();
        assert_eq!(env.get("x").unwrap().as_int(), Some(1));
        assert!(env.get("y").is_none());
    }

    #[test]
    fn test_lookup_walks_parent_chain() {
        let outer = Rc::new(Env::new(None));
        outer.define("x", Value::Int(1), false).unwrap();
        let inner = Rc::new(Env::new(Some(outer.clone())));
        assert_eq!(inner.get("x").unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_set_updates_nearest_scope() {
        let outer = Rc::new(Env::new(None));
        outer.define("x", Value::Int(1), false).unwrap();
        let inner = Rc::new(Env::new(Some(outer.clone())));
        assert_eq!(inner.set("x", Value::Int(2)), SetResult::Updated);
        assert_eq!(outer.get("x").unwrap().as_int(), Some(2));
        assert_eq!(inner.set("missing", Value::Nil), SetResult::NotFound);
    }

    #[test]
    fn test_shadowing_binds_in_current_scope() {
        let outer = Rc::new(Env::new(None));
        outer.define("x", Value::Int(1), false).unwrap();
        let inner = Rc::new(Env::new(Some(outer.clone())));
        inner.define("x", Value::Int(9), false).unwrap();
        assert_eq!(inner.get("x").unwrap().as_int(), Some(9));
        assert_eq!(outer.get("x").unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_const_cannot_be_reassigned() {
        let env = Rc::new(Env::new(None));
        env.define("k", Value::Int(1), true).unwrap();
        assert_eq!(env.set("k", Value::Int(2)), SetResult::ConstViolation);
        assert!(env.define("k", Value::Int(2), false).is_err());
    }
}
