//! skylark - an embeddable async scripting language
//!
//! A tree-walking interpreter over a dynamically typed, reference-
//! counted value model, with a cooperative event loop that suspends
//! script-level operations on non-blocking sockets (plain TCP and TLS)
//! and resumes them as they become ready. Hosts embed the runtime by
//! creating a [`vm::Vm`], registering native functions and running
//! source.

pub mod ast;
pub mod event_loop;
pub mod interpreter;
#[cfg(unix)]
pub mod network;
pub mod parser;
pub mod value;
pub mod vm;

pub use interpreter::env::Env;
pub use parser::{parse, ParseError};
pub use value::{NativeError, Value};
pub use vm::{AssignMode, InterruptHandle, OutputSink, Vm, VmError, VmOptions};
