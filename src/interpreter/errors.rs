//! Control Flow and Runtime Errors
//!
//! The interpreter threads a `Control` signal through `Result`: loop and
//! function control flow (`break`, `continue`, `return`), script-thrown
//! values, runtime errors with formatted positions and stack traces, and
//! non-catchable safety aborts (interrupt, instruction limit, timeout).

use std::fmt;

use crate::ast::types::Span;
use crate::value::Value;

/// A runtime error with its fully formatted message, including the
/// `Runtime error at src:line:col:` prefix and the captured stack trace.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Non-value outcome of evaluating a statement or expression.
#[derive(Debug)]
pub enum Control {
    /// `break` unwinding to the nearest loop.
    Break(Span),
    /// `continue` unwinding to the nearest loop.
    Continue(Span),
    /// `return` unwinding to the nearest function call.
    Return(Value),
    /// A script-thrown value unwinding to the nearest `try`.
    Throw(Value),
    /// A runtime error; catchable as an error map by `catch`.
    Error(RuntimeError),
    /// A safety abort (interrupt, instruction limit, timeout). Never
    /// catchable by script code.
    Abort(RuntimeError),
}

impl Control {
    /// True for signals that must not be intercepted by `catch`.
    pub fn is_abort(&self) -> bool {
        matches!(self, Control::Abort(_))
    }
}

impl From<RuntimeError> for Control {
    fn from(e: RuntimeError) -> Self {
        Control::Error(e)
    }
}
