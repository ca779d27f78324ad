//! Promises
//!
//! A one-shot settlement cell. Transitions are one-way from `Pending`;
//! a second resolve or reject is a no-op, so settlement is idempotent.

use std::cell::RefCell;
use std::fmt;

use crate::value::Value;

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

pub struct Promise {
    state: RefCell<PromiseState>,
}

impl Promise {
    pub fn new() -> Self {
        Self { state: RefCell::new(PromiseState::Pending) }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), PromiseState::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.state.borrow(), PromiseState::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.state.borrow(), PromiseState::Rejected(_))
    }

    /// Fulfill a pending promise. Returns false if already settled.
    pub fn resolve(&self, value: Value) -> bool {
        let mut state = self.state.borrow_mut();
        if matches!(*state, PromiseState::Pending) {
            *state = PromiseState::Fulfilled(value);
            true
        } else {
            false
        }
    }

    /// Reject a pending promise. Returns false if already settled.
    pub fn reject(&self, value: Value) -> bool {
        let mut state = self.state.borrow_mut();
        if matches!(*state, PromiseState::Pending) {
            *state = PromiseState::Rejected(value);
            true
        } else {
            false
        }
    }

    /// `None` while pending, otherwise the settlement.
    pub fn settlement(&self) -> Option<Result<Value, Value>> {
        match &*self.state.borrow() {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(v) => Some(Ok(v.clone())),
            PromiseState::Rejected(v) => Some(Err(v.clone())),
        }
    }

    /// The settled value, if any, for the cycle collector's mark phase.
    pub fn settled_value(&self) -> Option<Value> {
        match &*self.state.borrow() {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(v) | PromiseState::Rejected(v) => Some(v.clone()),
        }
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match &*self.state.borrow() {
            PromiseState::Pending => "pending",
            PromiseState::Fulfilled(_) => "fulfilled",
            PromiseState::Rejected(_) => "rejected",
        };
        write!(f, "Promise({})", tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settles_at_most_once() {
        let p = Promise::new();
        assert!(p.is_pending());
        assert!(p.resolve(Value::Int(1)));
        assert!(!p.resolve(Value::Int(2)));
        assert!(!p.reject(Value::Int(3)));
        match p.settlement() {
            Some(Ok(v)) => assert_eq!(v.as_int(), Some(1)),
            other => panic!("unexpected settlement: {:?}", other.is_some()),
        }
    }

    #[test]
    fn test_reject_wins_when_first() {
        let p = Promise::new();
        assert!(p.reject(Value::str("boom")));
        assert!(!p.resolve(Value::Int(1)));
        assert!(p.is_rejected());
    }
}
