//! Virtual Machine
//!
//! Main entry point for embedding the language. Ties together the
//! parser, the interpreter, the async scheduler and the networking
//! layer, and exposes the host-facing surface: running source,
//! registering native functions, calling script functions, value
//! construction, safety limits and cycle collection.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use thiserror::Error;

use crate::ast::types::Span;
use crate::event_loop::scheduler::Task;
#[cfg(unix)]
use crate::event_loop::scheduler::PendingIo;
use crate::event_loop::promise::Promise;
use crate::event_loop::scheduler::Timer;
use crate::interpreter::env::Env;
use crate::interpreter::errors::{Control, RuntimeError};
use crate::parser::{parse, ParseError};
use crate::value::{NativeError, NativeFunction, Value};

/// Default timeout applied to network operations that did not specify one.
pub const DEFAULT_NET_TIMEOUT_MS: u64 = 30_000;
/// Maximum script call depth; guards the host stack ahead of the
/// instruction limit.
pub const MAX_CALL_DEPTH: usize = 1000;

/// Error returned across the embedding boundary.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Runtime(String),
}

/// What happens when a script assigns to a name with no prior binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignMode {
    /// Assignment to an unbound name is a runtime error.
    #[default]
    Strict,
    /// Assignment to an unbound name binds in the current scope
    /// (historical behavior).
    Lenient,
}

/// Where `print` output goes. Tests capture it in a buffer.
#[derive(Clone, Default)]
pub enum OutputSink {
    #[default]
    Inherit,
    Buffer(Rc<RefCell<String>>),
}

/// Options for creating a VM.
#[derive(Default)]
pub struct VmOptions {
    pub assign_mode: AssignMode,
    pub stdout: OutputSink,
}

/// Cloneable, thread-safe handle for interrupting a running script.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// One pending call frame, for stack traces.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub func: String,
    pub source: Rc<str>,
    pub line: usize,
    pub col: usize,
}

/// Weak tracking of every container and environment the VM allocates,
/// so `collect_cycles` can find unreachable cycles and break them.
#[derive(Default)]
pub(crate) struct GcRegistry {
    pub lists: Vec<Weak<RefCell<Vec<Value>>>>,
    pub maps: Vec<Weak<RefCell<IndexMap<String, Value>>>>,
    pub envs: Vec<Weak<Env>>,
    pub threshold: usize,
    pub alloc_trigger: usize,
    pub allocations: usize,
    pub collections: u64,
    pub objects_collected: u64,
}

impl GcRegistry {
    fn tracked_count(&self) -> usize {
        self.lists.len() + self.maps.len() + self.envs.len()
    }
}

/// The virtual machine. Not safe to share across threads; hosts that
/// need parallelism create one VM per thread.
pub struct Vm {
    pub(crate) globals: Rc<Env>,
    pub(crate) options: VmOptions,
    pub(crate) last_error: String,

    pub(crate) frames: Vec<Frame>,
    pub(crate) source_stack: Vec<Rc<str>>,
    pub(crate) dir_stack: Vec<PathBuf>,
    pub(crate) modules: HashMap<PathBuf, Value>,
    pub(crate) exports_stack: Vec<Value>,
    /// Yield sinks for currently executing generator calls.
    pub(crate) yield_stack: Vec<Vec<Value>>,

    // Async scheduler
    pub(crate) tasks: VecDeque<Task>,
    pub(crate) timers: Vec<Timer>,
    pub(crate) timer_seq: u64,
    #[cfg(unix)]
    pub(crate) pending_io: Vec<PendingIo>,
    pub(crate) net_default_timeout_ms: u64,
    #[cfg(unix)]
    pub(crate) tls_sessions: HashMap<i32, crate::network::tls::TlsSession>,

    // Safety controls
    pub(crate) instruction_count: u64,
    pub(crate) instruction_limit: u64,
    pub(crate) exec_timeout_ms: u64,
    pub(crate) exec_start: Instant,
    pub(crate) interrupt_flag: Arc<AtomicBool>,

    pub(crate) gc: GcRegistry,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut vm = Self {
            globals: Rc::new(Env::new(None)),
            options,
            last_error: String::new(),
            frames: Vec::new(),
            source_stack: Vec::new(),
            dir_stack: Vec::new(),
            modules: HashMap::new(),
            exports_stack: Vec::new(),
            yield_stack: Vec::new(),
            tasks: VecDeque::new(),
            timers: Vec::new(),
            timer_seq: 0,
            #[cfg(unix)]
            pending_io: Vec::new(),
            net_default_timeout_ms: DEFAULT_NET_TIMEOUT_MS,
            #[cfg(unix)]
            tls_sessions: HashMap::new(),
            instruction_count: 0,
            instruction_limit: 0,
            exec_timeout_ms: 0,
            exec_start: Instant::now(),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            gc: GcRegistry::default(),
        };
        vm.gc.envs.push(Rc::downgrade(&vm.globals));
        crate::interpreter::stdlib::register_stdlib(&mut vm);
        #[cfg(unix)]
        {
            crate::network::tcp::register_net_stdlib(&mut vm);
            crate::network::tls::register_tls_stdlib(&mut vm);
        }
        vm
    }

    // ------------------------------------------------------------------
    // Running code
    // ------------------------------------------------------------------

    /// Parse and execute a source string under a virtual file name.
    pub fn run_string(&mut self, source: &str, virtual_name: &str) -> Result<(), VmError> {
        let program = match parse(source, virtual_name) {
            Ok(p) => p,
            Err(e) => {
                self.last_error = e.to_string();
                return Err(VmError::Parse(e));
            }
        };

        let dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        self.enter_run(&program.source_name, dir);
        let result = self.exec_program(&program);
        self.leave_run();

        self.finish_run(result)
    }

    /// Read and execute a script file.
    pub fn run_file(&mut self, path: &str) -> Result<(), VmError> {
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                let msg = format!("cannot read '{}': {}", path, e);
                self.last_error = msg.clone();
                return Err(VmError::Runtime(msg));
            }
        };
        let program = match parse(&source, path) {
            Ok(p) => p,
            Err(e) => {
                self.last_error = e.to_string();
                return Err(VmError::Parse(e));
            }
        };

        let dir = Path::new(path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.enter_run(&program.source_name, dir);
        let result = self.exec_program(&program);
        self.leave_run();

        self.finish_run(result)
    }

    /// The last error message, or "" when there was none.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    fn enter_run(&mut self, source_name: &Rc<str>, dir: PathBuf) {
        if self.source_stack.is_empty() {
            self.instruction_count = 0;
            self.exec_start = Instant::now();
            self.interrupt_flag.store(false, Ordering::SeqCst);
        }
        self.source_stack.push(source_name.clone());
        self.dir_stack.push(dir);
        self.frames.push(Frame {
            func: "(script)".to_string(),
            source: source_name.clone(),
            line: 0,
            col: 0,
        });
        self.exports_stack.push(Value::map());
    }

    fn leave_run(&mut self) {
        self.exports_stack.pop();
        self.frames.pop();
        self.dir_stack.pop();
        self.source_stack.pop();
        // Auto-collect only between top-level runs: mid-run, values can
        // be held solely by interpreter temporaries the mark phase
        // cannot see.
        if self.source_stack.is_empty() {
            self.maybe_auto_collect();
        }
    }

    fn finish_run(&mut self, result: Result<(), Control>) -> Result<(), VmError> {
        match result {
            Ok(()) => {
                self.last_error.clear();
                Ok(())
            }
            Err(ctl) => {
                let msg = self.control_to_message(ctl);
                self.last_error = msg.clone();
                Err(VmError::Runtime(msg))
            }
        }
    }

    /// Render an escaped control signal as a host-visible error string.
    pub(crate) fn control_to_message(&mut self, ctl: Control) -> String {
        match ctl {
            Control::Error(e) | Control::Abort(e) => e.message,
            Control::Throw(v) => {
                // An error map renders as its message; anything else is
                // stringified.
                let text = match &v {
                    Value::Map(_) => {
                        let msg = v.map_get("msg");
                        if msg.is_nil() {
                            v.stringify()
                        } else {
                            msg.stringify()
                        }
                    }
                    other => other.stringify(),
                };
                format!("Uncaught throw: {}", text)
            }
            Control::Return(_) => "'return' outside of a function".to_string(),
            Control::Break(_) => "'break' outside of a loop".to_string(),
            Control::Continue(_) => "'continue' outside of a loop".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    /// Execute a file once and return its export map. Subsequent loads
    /// of the same canonical path return the cached exports.
    pub fn require_module(&mut self, path: &str) -> Result<Value, VmError> {
        match self.load_module(path, Span::default()) {
            Ok(v) => Ok(v),
            Err(ctl) => {
                let msg = self.control_to_message(ctl);
                self.last_error = msg.clone();
                Err(VmError::Runtime(msg))
            }
        }
    }

    pub(crate) fn load_module(&mut self, path: &str, span: Span) -> Result<Value, Control> {
        let mut resolved = PathBuf::from(path);
        if resolved.is_relative() {
            if let Some(dir) = self.dir_stack.last() {
                resolved = dir.join(resolved);
            }
        }
        let canonical = std::fs::canonicalize(&resolved).map_err(|e| {
            self.error(format!("cannot resolve module '{}': {}", path, e), span)
        })?;

        if let Some(exports) = self.modules.get(&canonical) {
            return Ok(exports.clone());
        }

        let source = std::fs::read_to_string(&canonical).map_err(|e| {
            self.error(format!("cannot read module '{}': {}", path, e), span)
        })?;
        let source_name = canonical.to_string_lossy().to_string();
        let program = parse(&source, &source_name)
            .map_err(|e| Control::Error(RuntimeError::new(e.to_string())))?;

        let module_env = self.new_env(Some(self.globals.clone()));
        let exports = self.new_map();
        // Cached before execution so cyclic imports observe the partial
        // export map instead of recursing forever.
        self.modules.insert(canonical.clone(), exports.clone());

        let dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.source_stack.push(program.source_name.clone());
        self.dir_stack.push(dir);
        self.frames.push(Frame {
            func: "(module)".to_string(),
            source: program.source_name.clone(),
            line: 0,
            col: 0,
        });
        self.exports_stack.push(exports.clone());

        let result = self.exec_block_in(&program.body, &module_env);

        self.exports_stack.pop();
        self.frames.pop();
        self.dir_stack.pop();
        self.source_stack.pop();

        match result {
            Ok(()) | Err(Control::Return(_)) => Ok(exports),
            Err(ctl) => {
                self.modules.remove(&canonical);
                Err(ctl)
            }
        }
    }

    // ------------------------------------------------------------------
    // Host-driven calls and globals
    // ------------------------------------------------------------------

    /// Register a native function under a (possibly dotted) global name.
    pub fn register_native<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Value, NativeError> + 'static,
    {
        let native = Rc::new(NativeFunction { name: name.to_string(), f: Box::new(f) });
        let _ = self.globals.define(name, Value::Native(native), false);
    }

    /// Bind a value (constant, config, …) as a global.
    pub fn register_global(&mut self, name: &str, value: Value) {
        let _ = self.globals.define(name, value, false);
    }

    /// Call a script function by global name.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        let callee = match self.globals.get(name) {
            Some(v) => v,
            None => {
                let msg = format!("undefined function '{}'", name);
                self.last_error = msg.clone();
                return Err(VmError::Runtime(msg));
            }
        };
        self.call_value(callee, args)
    }

    /// Call any callable value from the host.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, VmError> {
        let host: Rc<str> = Rc::from("(host)");
        self.frames.push(Frame {
            func: "(host)".to_string(),
            source: host.clone(),
            line: 0,
            col: 0,
        });
        self.source_stack.push(host);

        let result = self.call_callable(&callee, args.to_vec(), Span::default());

        self.source_stack.pop();
        self.frames.pop();

        match result {
            Ok(v) => {
                self.last_error.clear();
                Ok(v)
            }
            Err(ctl) => {
                let msg = self.control_to_message(ctl);
                self.last_error = msg.clone();
                Err(VmError::Runtime(msg))
            }
        }
    }

    /// Drive the event loop until a promise settles; pass-through for
    /// non-promise values. This is the host-side `await`.
    pub fn await_value(&mut self, value: Value) -> Result<Value, VmError> {
        match value {
            Value::Promise(p) => match self.wait_promise(&p, Span::default()) {
                Ok(v) => Ok(v),
                Err(ctl) => {
                    let msg = self.control_to_message(ctl);
                    self.last_error = msg.clone();
                    Err(VmError::Runtime(msg))
                }
            },
            other => Ok(other),
        }
    }

    // ------------------------------------------------------------------
    // Safety controls
    // ------------------------------------------------------------------

    /// Abort the script once it has executed this many statements
    /// (0 = unlimited).
    pub fn set_instruction_limit(&mut self, limit: u64) {
        self.instruction_limit = limit;
    }

    /// Abort the script after this much wall-clock time (0 = unlimited).
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.exec_timeout_ms = timeout_ms;
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Request interruption of the running script. Also available from
    /// other threads via [`Vm::interrupt_handle`].
    pub fn interrupt(&self) {
        self.interrupt_flag.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle { flag: self.interrupt_flag.clone() }
    }

    /// Statement-boundary check: interrupt flag, instruction limit,
    /// wall-clock timeout, and the auto-collect policy.
    pub(crate) fn check_safepoint(&mut self, span: Span) -> Result<(), Control> {
        self.instruction_count += 1;
        if self.interrupt_flag.load(Ordering::Relaxed) {
            return Err(Control::Abort(self.rt_err("script interrupted by host", span)));
        }
        if self.instruction_limit != 0 && self.instruction_count > self.instruction_limit {
            return Err(Control::Abort(self.rt_err("instruction limit exceeded", span)));
        }
        if self.exec_timeout_ms != 0
            && self.exec_start.elapsed().as_millis() as u64 > self.exec_timeout_ms
        {
            return Err(Control::Abort(self.rt_err("execution timeout exceeded", span)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Error formatting
    // ------------------------------------------------------------------

    pub(crate) fn current_source(&self) -> Rc<str> {
        self.source_stack
            .last()
            .cloned()
            .unwrap_or_else(|| Rc::from("<input>"))
    }

    /// Build a runtime error: `Runtime error at src:line:col: msg` plus
    /// the captured stack trace, innermost frame first.
    pub(crate) fn rt_err(&self, msg: impl AsRef<str>, span: Span) -> RuntimeError {
        let mut out = format!(
            "Runtime error at {}:{}:{}: {}",
            self.current_source(),
            span.line,
            span.col,
            msg.as_ref()
        );
        if !self.frames.is_empty() {
            out.push_str("\nStack trace:");
            for f in self.frames.iter().rev() {
                if f.line > 0 {
                    out.push_str(&format!(
                        "\n  at {} ({}:{}:{})",
                        f.func, f.source, f.line, f.col
                    ));
                } else {
                    out.push_str(&format!("\n  at {} ({})", f.func, f.source));
                }
            }
        }
        RuntimeError::new(out)
    }

    pub(crate) fn error(&self, msg: impl AsRef<str>, span: Span) -> Control {
        Control::Error(self.rt_err(msg, span))
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    pub(crate) fn write_stdout(&mut self, text: &str) {
        match &self.options.stdout {
            OutputSink::Inherit => print!("{}", text),
            OutputSink::Buffer(buf) => buf.borrow_mut().push_str(text),
        }
    }

    // ------------------------------------------------------------------
    // Tracked allocation
    // ------------------------------------------------------------------

    /// Allocate a list tracked by the cycle collector.
    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        let rc = Rc::new(RefCell::new(items));
        self.gc.lists.push(Rc::downgrade(&rc));
        self.gc.allocations += 1;
        Value::List(rc)
    }

    /// Allocate a map tracked by the cycle collector.
    pub fn new_map(&mut self) -> Value {
        let rc = Rc::new(RefCell::new(IndexMap::new()));
        self.gc.maps.push(Rc::downgrade(&rc));
        self.gc.allocations += 1;
        Value::Map(rc)
    }

    pub(crate) fn new_env(&mut self, parent: Option<Rc<Env>>) -> Rc<Env> {
        let env = Rc::new(Env::new(parent));
        self.gc.envs.push(Rc::downgrade(&env));
        self.gc.allocations += 1;
        env
    }

    pub(crate) fn new_promise(&mut self) -> Rc<Promise> {
        Rc::new(Promise::new())
    }

    // ------------------------------------------------------------------
    // Cycle collection
    // ------------------------------------------------------------------

    /// Collect when the tracked-object count reaches `threshold`
    /// (0 = disabled).
    pub fn set_gc_threshold(&mut self, threshold: usize) {
        self.gc.threshold = threshold;
    }

    /// Collect every `interval` tracked allocations (0 = disabled).
    pub fn set_gc_alloc_trigger(&mut self, interval: usize) {
        self.gc.alloc_trigger = interval;
    }

    pub fn gc_collections(&self) -> u64 {
        self.gc.collections
    }

    pub fn gc_objects_collected(&self) -> u64 {
        self.gc.objects_collected
    }

    #[cfg(unix)]
    fn io_gc_roots(&self) -> Vec<Value> {
        let mut roots = Vec::new();
        for io in &self.pending_io {
            roots.push(io.op.socket_value());
            if let Some(v) = io.promise.settled_value() {
                roots.push(v);
            }
        }
        roots
    }

    #[cfg(not(unix))]
    fn io_gc_roots(&self) -> Vec<Value> {
        Vec::new()
    }

    fn maybe_auto_collect(&mut self) {
        let by_threshold =
            self.gc.threshold != 0 && self.gc.tracked_count() >= self.gc.threshold;
        let by_allocs =
            self.gc.alloc_trigger != 0 && self.gc.allocations >= self.gc.alloc_trigger;
        if by_threshold || by_allocs {
            self.gc.allocations = 0;
            self.collect_cycles();
        }
    }

    /// Mark everything reachable from the VM roots, then break any
    /// tracked container or environment that is still alive but
    /// unreached. Returns the number of objects broken.
    pub fn collect_cycles(&mut self) -> usize {
        enum Work {
            Val(Value),
            Env(Rc<Env>),
        }

        let mut marked: HashSet<usize> = HashSet::new();
        let mut work: Vec<Work> = Vec::new();

        work.push(Work::Env(self.globals.clone()));
        for exports in self.modules.values() {
            work.push(Work::Val(exports.clone()));
        }
        for exports in &self.exports_stack {
            work.push(Work::Val(exports.clone()));
        }
        for values in &self.yield_stack {
            for v in values {
                work.push(Work::Val(v.clone()));
            }
        }
        for task in &self.tasks {
            work.push(Work::Env(task.func.closure.clone()));
            for v in &task.args {
                work.push(Work::Val(v.clone()));
            }
            if let Some(v) = task.promise.settled_value() {
                work.push(Work::Val(v));
            }
        }
        for timer in &self.timers {
            if let Some(v) = timer.promise.settled_value() {
                work.push(Work::Val(v));
            }
        }
        for v in self.io_gc_roots() {
            work.push(Work::Val(v));
        }

        while let Some(item) = work.pop() {
            match item {
                Work::Env(env) => {
                    if marked.insert(Rc::as_ptr(&env) as usize) {
                        for v in env.local_values() {
                            work.push(Work::Val(v));
                        }
                        if let Some(parent) = env.parent() {
                            work.push(Work::Env(parent.clone()));
                        }
                    }
                }
                Work::Val(value) => match value {
                    Value::List(l) => {
                        if marked.insert(Rc::as_ptr(&l) as usize) {
                            for v in l.borrow().iter() {
                                work.push(Work::Val(v.clone()));
                            }
                        }
                    }
                    Value::Map(m) => {
                        if marked.insert(Rc::as_ptr(&m) as usize) {
                            for v in m.borrow().values() {
                                work.push(Work::Val(v.clone()));
                            }
                        }
                    }
                    Value::Func(f) => {
                        if marked.insert(Rc::as_ptr(&f) as usize) {
                            work.push(Work::Env(f.closure.clone()));
                        }
                    }
                    Value::Promise(p) => {
                        if marked.insert(Rc::as_ptr(&p) as usize) {
                            if let Some(v) = p.settled_value() {
                                work.push(Work::Val(v));
                            }
                        }
                    }
                    _ => {}
                },
            }
        }

        // Sweep: prune dead weaks; clear live-but-unreached objects so
        // their refcounts can fall to zero.
        let mut broken = 0usize;

        self.gc.lists.retain(|w| match w.upgrade() {
            None => false,
            Some(rc) => {
                if !marked.contains(&(Rc::as_ptr(&rc) as usize)) {
                    rc.borrow_mut().clear();
                    broken += 1;
                    false
                } else {
                    true
                }
            }
        });
        self.gc.maps.retain(|w| match w.upgrade() {
            None => false,
            Some(rc) => {
                if !marked.contains(&(Rc::as_ptr(&rc) as usize)) {
                    rc.borrow_mut().clear();
                    broken += 1;
                    false
                } else {
                    true
                }
            }
        });
        self.gc.envs.retain(|w| match w.upgrade() {
            None => false,
            Some(env) => {
                if !marked.contains(&(Rc::as_ptr(&env) as usize)) {
                    env.clear_bindings();
                    broken += 1;
                    false
                } else {
                    true
                }
            }
        });

        self.gc.collections += 1;
        self.gc.objects_collected += broken as u64;
        broken
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_with_buffer() -> (Vm, Rc<RefCell<String>>) {
        let buf = Rc::new(RefCell::new(String::new()));
        let vm = Vm::with_options(VmOptions {
            stdout: OutputSink::Buffer(buf.clone()),
            ..Default::default()
        });
        (vm, buf)
    }

    fn run(src: &str) -> String {
        let (mut vm, buf) = vm_with_buffer();
        if let Err(e) = vm.run_string(src, "<test>") {
            panic!("script failed: {}", e);
        }
        let out = buf.borrow().clone();
        out
    }

    fn run_expect_err(src: &str) -> String {
        let (mut vm, _buf) = vm_with_buffer();
        assert!(vm.run_string(src, "<test>").is_err(), "script unexpectedly succeeded");
        vm.last_error().to_string()
    }

    // ------------------------------------------------------------------
    // End-to-end scenarios
    // ------------------------------------------------------------------

    #[test]
    fn test_arithmetic_and_strings() {
        let out = run(
            r#"
            let n = 21; print(n * 2);
            let s = "hello, " + "world"; print(s);
            "#,
        );
        assert_eq!(out, "42\nhello, world\n");
    }

    #[test]
    fn test_closures_capture_by_reference() {
        let out = run(
            r#"
            fn make_counter() { let i = 0; return fn() { i = i + 1; return i; }; }
            let c = make_counter(); print(c(), c(), c());
            "#,
        );
        assert_eq!(out, "1 2 3\n");
    }

    #[test]
    fn test_defer_runs_on_return() {
        let out = run(
            r#"
            fn run() {
              defer print("cleanup");
              if (true) { return 7; }
            }
            print(run());
            "#,
        );
        assert_eq!(out, "cleanup\n7\n");
    }

    #[test]
    fn test_map_insertion_order_and_destructuring() {
        let out = run(
            r#"
            let m = { a: 1, b: 2, c: 3 };
            let { b, c: x } = m;
            for k in m { print(k); }
            print(b, x);
            "#,
        );
        assert_eq!(out, "a\nb\nc\n2 3\n");
    }

    #[test]
    fn test_sleep_and_await() {
        let out = run(
            r#"
            let p = sleep(10); let t0 = now_ms(); await p; let dt = now_ms() - t0;
            print(dt >= 10);
            print(typeof(p));
            "#,
        );
        assert_eq!(out, "true\npromise\n");
    }

    #[test]
    fn test_instruction_limit_abort() {
        let err = run_expect_err(
            r#"
            set_instruction_limit(10000);
            let i = 0; while (true) { i = i + 1; }
            "#,
        );
        assert!(err.contains("instruction limit"), "error was: {}", err);
        assert!(err.contains("Stack trace"), "error was: {}", err);
    }

    // ------------------------------------------------------------------
    // Operators and control flow
    // ------------------------------------------------------------------

    #[test]
    fn test_numeric_widening() {
        let out = run("print(7 / 2, 7.0 / 2, 7 % 3, 1 + 2.5)");
        assert_eq!(out, "3 3.5 1 3.5\n");
    }

    #[test]
    fn test_division_by_zero() {
        let err = run_expect_err("print(1 / 0)");
        assert!(err.contains("division by zero"));
        let err = run_expect_err("print(1 % 0)");
        assert!(err.contains("mod by zero"));
    }

    #[test]
    fn test_string_concat_stringifies() {
        let out = run(r#"print("n=" + 3, "b=" + true, "x=" + nil, 1 + "!")"#);
        assert_eq!(out, "n=3 b=true x=nil 1!\n");
    }

    #[test]
    fn test_comparison_type_error() {
        let err = run_expect_err(r#"print(1 < "a")"#);
        assert!(err.contains("comparisons require"));
    }

    #[test]
    fn test_logic_and_coalesce_and_ternary() {
        let out = run(
            r#"
            print(1 && "x", nil || false, nil ?? 5, false ?? 7);
            print(true ? "yes" : "no", 0 ? "zero-true" : "unreached");
            print(!nil, !0);
            "#,
        );
        assert_eq!(out, "true false 5 false\nyes zero-true\ntrue false\n");
    }

    #[test]
    fn test_optional_chaining() {
        let out = run(
            r#"
            let m = nil;
            print(m?.field);
            let n = { a: 1 };
            print(n?.a);
            "#,
        );
        assert_eq!(out, "nil\n1\n");
    }

    #[test]
    fn test_truthiness_of_zero_and_empty() {
        let out = run(r#"print(0 ? "t" : "f", "" ? "t" : "f", [] ? "t" : "f")"#);
        assert_eq!(out, "t t t\n");
    }

    #[test]
    fn test_equality_rules() {
        let out = run(
            r#"
            let a = [1]; let b = [1]; let c = a;
            print(a == b, a == c, "x" == "x", 1 == 1.0, nil == nil);
            "#,
        );
        assert_eq!(out, "false true true false true\n");
    }

    #[test]
    fn test_list_grow_on_indexed_assignment() {
        let out = run(
            r#"
            let l = [1];
            l[3] = 9;
            print(len(l), l[1], l[2], l[3]);
            "#,
        );
        assert_eq!(out, "4 nil nil 9\n");
    }

    #[test]
    fn test_index_out_of_range() {
        let err = run_expect_err("let l = [1]; print(l[5])");
        assert!(err.contains("out of range"));
    }

    #[test]
    fn test_while_for_break_continue() {
        let out = run(
            r#"
            let total = 0;
            for (let i = 0; i < 10; i += 1) {
              if (i == 3) { continue; }
              if (i == 6) { break; }
              total += i;
            }
            print(total);
            let s = "";
            for i in 0..3 { s = s + i; }
            for i in 7..=8 { s = s + i; }
            print(s);
            "#,
        );
        // 0+1+2+4+5 = 12
        assert_eq!(out, "12\n01278\n");
    }

    #[test]
    fn test_for_in_two_variables() {
        let out = run(
            r#"
            let m = { a: 1, b: 2 };
            for k, v in m { print(k, v); }
            for i, x in ["p", "q"] { print(i, x); }
            "#,
        );
        assert_eq!(out, "a 1\nb 2\n0 p\n1 q\n");
    }

    #[test]
    fn test_string_iteration() {
        let out = run(r#"for c in "ab" { print(c); }"#);
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn test_switch() {
        let out = run(
            r#"
            fn pick(x) {
              switch (x) {
                case 1: return "one";
                case "two": return "TWO";
                default: return "other";
              }
            }
            print(pick(1), pick("two"), pick(99));
            "#,
        );
        assert_eq!(out, "one TWO other\n");
    }

    #[test]
    fn test_match_expression() {
        let out = run(
            r#"
            fn describe(v) {
              return match (v) {
                case 0: "zero";
                case [a, b]: "pair:" + a + "," + b;
                case { kind: k } if k == "x": "map-x";
                case s if typeof(s) == "string": "str:" + s;
                case _: "other";
              };
            }
            print(describe(0));
            print(describe([1, 2]));
            print(describe({ kind: "x" }));
            print(describe("hi"));
            print(describe(3.5));
            "#,
        );
        assert_eq!(out, "zero\npair:1,2\nmap-x\nstr:hi\nother\n");
    }

    #[test]
    fn test_match_no_arm_is_error() {
        let err = run_expect_err("match (5) { case 1: 1 }");
        assert!(err.contains("no pattern matched"));
    }

    #[test]
    fn test_defer_lifo_order() {
        let out = run(
            r#"
            fn f() { defer print("a"); defer print("b"); print("c"); }
            f();
            "#,
        );
        assert_eq!(out, "c\nb\na\n");
    }

    #[test]
    fn test_defer_runs_on_throw() {
        let out = run(
            r#"
            fn f() {
              defer print("cleanup");
              throw "boom";
            }
            try { f(); } catch (e) { print("caught", e); }
            "#,
        );
        assert_eq!(out, "cleanup\ncaught boom\n");
    }

    // ------------------------------------------------------------------
    // Errors, throw, try/catch/finally
    // ------------------------------------------------------------------

    #[test]
    fn test_throw_catch_finally() {
        let out = run(
            r#"
            fn f() {
              try { throw "bad"; } catch (e) { print("caught", e); return 1; }
              finally { print("fin"); }
            }
            print(f());
            "#,
        );
        assert_eq!(out, "caught bad\nfin\n1\n");
    }

    #[test]
    fn test_runtime_error_catchable_as_map() {
        let out = run(
            r#"
            try { no_such_fn(); } catch (e) { print(e.code, e.msg != nil); }
            "#,
        );
        assert_eq!(out, "RUNTIME true\n");
    }

    #[test]
    fn test_finally_runs_on_return() {
        let out = run(
            r#"
            fn f() { try { return 1; } finally { print("fin"); } }
            print(f());
            "#,
        );
        assert_eq!(out, "fin\n1\n");
    }

    #[test]
    fn test_uncaught_throw_reaches_host() {
        let err = run_expect_err(r#"throw "boom""#);
        assert!(err.contains("Uncaught throw: boom"), "error was: {}", err);
    }

    #[test]
    fn test_error_format_and_stack_trace() {
        let err = run_expect_err(
            r#"
            fn inner() { return 1 / 0; }
            fn outer() { return inner(); }
            outer();
            "#,
        );
        assert!(err.starts_with("Runtime error at <test>:"), "error was: {}", err);
        assert!(err.contains("division by zero"));
        assert!(err.contains("Stack trace"));
        assert!(err.contains("at inner ("));
        assert!(err.contains("at outer ("));
    }

    #[test]
    fn test_undefined_variable() {
        let err = run_expect_err("print(nope)");
        assert!(err.contains("undefined variable 'nope'"));
    }

    #[test]
    fn test_const_rules() {
        let err = run_expect_err("const k = 1; k = 2;");
        assert!(err.contains("cannot assign to constant 'k'"));
        let out = run("const k = 1; print(k);");
        assert_eq!(out, "1\n");
    }

    #[test]
    fn test_strict_vs_lenient_assignment() {
        let err = run_expect_err("x = 5");
        assert!(err.contains("undefined variable 'x'"));

        let buf = Rc::new(RefCell::new(String::new()));
        let mut vm = Vm::with_options(VmOptions {
            assign_mode: AssignMode::Lenient,
            stdout: OutputSink::Buffer(buf.clone()),
        });
        vm.run_string("x = 5; print(x)", "<test>").unwrap();
        assert_eq!(*buf.borrow(), "5\n");
    }

    #[test]
    fn test_block_scoping() {
        let err = run_expect_err("{ let x = 1; } print(x)");
        assert!(err.contains("undefined variable 'x'"));
    }

    #[test]
    fn test_top_level_return_is_noop() {
        let out = run(r#"print("before"); return; print("after");"#);
        assert_eq!(out, "before\n");
    }

    #[test]
    fn test_break_outside_loop() {
        let err = run_expect_err("fn f() { break; } f();");
        assert!(err.contains("'break' outside of a loop"));
    }

    #[test]
    fn test_parse_error_reported() {
        let (mut vm, _buf) = vm_with_buffer();
        let err = vm.run_string("let = 3", "<virt>").unwrap_err();
        assert!(matches!(err, VmError::Parse(_)));
        assert!(vm.last_error().starts_with("<virt>:1:"));
    }

    #[test]
    fn test_call_depth_limit() {
        let err = run_expect_err("fn rec(n) { return rec(n + 1); } rec(0);");
        assert!(err.contains("maximum call depth exceeded"));
    }

    // ------------------------------------------------------------------
    // Functions: defaults, rest, spread, pipe, generators
    // ------------------------------------------------------------------

    #[test]
    fn test_defaults_rest_spread() {
        let out = run(
            r#"
            fn f(a, b = 10, ...r) { return a + b + len(r); }
            print(f(1), f(1, 2), f(1, 2, 3, 4));
            let args = [1, 2, 3, 4];
            print(f(...args));
            "#,
        );
        assert_eq!(out, "11 3 5\n5\n");
    }

    #[test]
    fn test_wrong_arity() {
        let err = run_expect_err("fn f(a, b) { return a; } f(1);");
        assert!(err.contains("wrong argument count"));
    }

    #[test]
    fn test_pipe_operator() {
        let out = run(
            r#"
            fn double(x) { return x * 2; }
            fn add(x, y) { return x + y; }
            print(5 |> double, 5 |> add(3));
            "#,
        );
        assert_eq!(out, "10 8\n");
    }

    #[test]
    fn test_generator_collects_yields() {
        let out = run(
            r#"
            fn g(n) { for i in 0..n { yield i * i; } }
            let xs = g(4);
            print(len(xs), xs[0], xs[3]);
            "#,
        );
        assert_eq!(out, "4 0 9\n");
    }

    #[test]
    fn test_spread_in_list_literal() {
        let out = run(
            r#"
            let a = [2, 3];
            let b = [1, ...a, 4];
            print(b.join(","));
            "#,
        );
        assert_eq!(out, "1,2,3,4\n");
    }

    // ------------------------------------------------------------------
    // Builtin methods and stdlib
    // ------------------------------------------------------------------

    #[test]
    fn test_list_methods() {
        let out = run(
            r#"
            let l = [3, 1, 2];
            l.push(4);
            print(l.len(), l.pop(), l.contains(3), l.index_of(2));
            l.sort();
            print(l.join("-"));
            l.reverse();
            print(l.join("-"));
            print(l.slice(1, 3).join(","));
            "#,
        );
        assert_eq!(out, "4 4 true 2\n1-2-3\n3-2-1\n2,1\n");
    }

    #[test]
    fn test_map_methods() {
        let out = run(
            r#"
            let m = { a: 1 };
            m.set("b", 2);
            print(m.len(), m.has("a"), m.get("zz", "dflt"));
            print(m.keys().join(","));
            print(m.del("a"), m.has("a"));
            "#,
        );
        assert_eq!(out, "2 true dflt\na,b\ntrue false\n");
    }

    #[test]
    fn test_string_methods() {
        let out = run(
            r#"
            let s = "  Hello, World  ";
            print(s.trim());
            print("a,b,c".split(",").join("|"));
            print("abc".upper(), "ABC".lower());
            print("hello".contains("ell"), "hello".starts_with("he"), "hello".ends_with("lo"));
            print("hello".index_of("ll"), "hello".substr(1, 3));
            print("42".parse_int() + 1, "x".parse_int());
            "#,
        );
        assert_eq!(
            out,
            "Hello, World\na|b|c\nABC abc\ntrue true true\n2 ell\n43 nil\n"
        );
    }

    #[test]
    fn test_strbuf_methods() {
        let out = run(
            r#"
            let b = strbuf();
            b.append("ab");
            b.append(12);
            b.append(true);
            print(b.str(), b.len());
            b.clear();
            print(b.len());
            "#,
        );
        assert_eq!(out, "ab12true 8\n0\n");
    }

    #[test]
    fn test_string_interpolation() {
        let out = run(
            r#"
            let x = 5;
            print("v=${x + 1}!");
            print("${ {a: 2}.a } and ${"nested ${x}"}");
            "#,
        );
        assert_eq!(out, "v=6!\n2 and nested 5\n");
    }

    #[test]
    fn test_typeof_len_conversions() {
        let out = run(
            r#"
            print(typeof(nil), typeof(1), typeof(1.0), typeof("s"), typeof([]), typeof({}));
            print(len("abc"), len([1, 2]), len({ a: 1 }));
            print(int("42"), int(3.9), float("1.5"), str(42) + "!");
            "#,
        );
        assert_eq!(
            out,
            "nil int float string list map\n3 2 1\n42 3 1.5 42!\n"
        );
    }

    #[test]
    fn test_str_int_round_trip() {
        let out = run("print(int(str(12345)) == 12345, int(str(0 - 7)) == 0 - 7)");
        assert_eq!(out, "true true\n");
    }

    #[test]
    fn test_assert_builtin() {
        let out = run("assert(true); print(\"ok\")");
        assert_eq!(out, "ok\n");
        let err = run_expect_err(r#"assert(false, "custom message")"#);
        assert!(err.contains("custom message"));
    }

    // ------------------------------------------------------------------
    // Async: tasks, promises, ordering
    // ------------------------------------------------------------------

    #[test]
    fn test_async_fn_returns_promise() {
        let out = run(
            r#"
            async fn work() { return 5; }
            let p = work();
            print(typeof(p), p.is_pending());
            print(await p, p.is_fulfilled());
            "#,
        );
        assert_eq!(out, "promise true\n5 true\n");
    }

    #[test]
    fn test_async_rejection_rethrows() {
        let out = run(
            r#"
            async fn boom() { throw "bad"; }
            try { await boom(); } catch (e) { print("caught", e); }
            "#,
        );
        assert_eq!(out, "caught bad\n");
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let out = run(
            r#"
            let log = [];
            async fn a() { log.push("a"); }
            async fn b() { log.push("b"); }
            let pa = a();
            let pb = b();
            await pb;
            print(log.join(","));
            "#,
        );
        assert_eq!(out, "a,b\n");
    }

    #[test]
    fn test_promise_settles_once() {
        let out = run(
            r#"
            let p = promise();
            promise_resolve(p, 1);
            promise_resolve(p, 2);
            promise_reject(p, 3);
            print(await p, p.is_fulfilled(), p.is_rejected());
            "#,
        );
        assert_eq!(out, "1 true false\n");
    }

    #[test]
    fn test_await_non_promise_passthrough() {
        let out = run("print(await 42)");
        assert_eq!(out, "42\n");
    }

    #[test]
    fn test_await_deadlock_detected() {
        let err = run_expect_err("let p = promise(); await p;");
        assert!(err.contains("deadlock"), "error was: {}", err);
    }

    #[test]
    fn test_timer_ordering() {
        let out = run(
            r#"
            let log = [];
            async fn waiter(name, ms) { await sleep(ms); log.push(name); }
            let p1 = waiter("slow", 30);
            let p2 = waiter("fast", 5);
            await p1;
            await p2;
            print(log.join(","));
            "#,
        );
        assert_eq!(out, "fast,slow\n");
    }

    // ------------------------------------------------------------------
    // Embedding surface
    // ------------------------------------------------------------------

    #[test]
    fn test_register_native_with_state() {
        let (mut vm, buf) = vm_with_buffer();
        let counter = Rc::new(RefCell::new(0i64));
        let state = counter.clone();
        vm.register_native("bump", move |_vm, _args| {
            *state.borrow_mut() += 1;
            Ok(Value::Int(*state.borrow()))
        });
        vm.run_string("print(bump(), bump())", "<test>").unwrap();
        assert_eq!(*buf.borrow(), "1 2\n");
        assert_eq!(*counter.borrow(), 2);
    }

    #[test]
    fn test_dotted_native_fallback() {
        let (mut vm, buf) = vm_with_buffer();
        vm.register_native("fm.status", |_vm, args| {
            Ok(args.first().cloned().unwrap_or(Value::Nil))
        });
        vm.run_string(r#"print(fm.status("ready"))"#, "<test>").unwrap();
        assert_eq!(*buf.borrow(), "ready\n");
    }

    #[test]
    fn test_native_error_stamped_with_call_site() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.register_native("fail", |_vm, _args| -> Result<Value, crate::value::NativeError> {
            Err(crate::value::NativeError::new("it broke"))
        });
        let err = vm.run_string("fail()", "<test>").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Runtime error at <test>:1"));
        assert!(text.contains("it broke"));
    }

    #[test]
    fn test_host_call_script_function() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.run_string("fn add(a, b) { return a + b; }", "<test>").unwrap();
        let out = vm.call("add", &[Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(out.as_int(), Some(5));

        let callee = vm.globals.get("add").unwrap();
        let out = vm.call_value(callee, &[Value::Int(10), Value::Int(1)]).unwrap();
        assert_eq!(out.as_int(), Some(11));
    }

    #[test]
    fn test_host_call_undefined() {
        let (mut vm, _buf) = vm_with_buffer();
        assert!(vm.call("nope", &[]).is_err());
        assert!(vm.last_error().contains("undefined function"));
    }

    #[test]
    fn test_host_await_async_call() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.run_string("async fn work(x) { return x * 2; }", "<test>").unwrap();
        let promise = vm.call("work", &[Value::Int(21)]).unwrap();
        assert!(matches!(promise, Value::Promise(_)));
        let out = vm.await_value(promise).unwrap();
        assert_eq!(out.as_int(), Some(42));
    }

    #[test]
    fn test_register_global() {
        let (mut vm, buf) = vm_with_buffer();
        vm.register_global("version", Value::str("1.2"));
        vm.run_string("print(version)", "<test>").unwrap();
        assert_eq!(*buf.borrow(), "1.2\n");
    }

    #[test]
    fn test_value_clone_is_refcount_copy() {
        let v = Value::list(vec![Value::Int(1)]);
        let rc = match &v {
            Value::List(rc) => rc.clone(),
            _ => unreachable!(),
        };
        assert_eq!(Rc::strong_count(&rc), 2);
        let copy = v.clone();
        assert_eq!(Rc::strong_count(&rc), 3);
        drop(copy);
        assert_eq!(Rc::strong_count(&rc), 2);
        assert_eq!(v.list_get(0).as_int(), Some(1));
    }

    #[test]
    fn test_interrupt_aborts_at_safepoint() {
        let (mut vm, buf) = vm_with_buffer();
        vm.register_native("interrupt_me", |vm, _args| {
            vm.interrupt();
            Ok(Value::Nil)
        });
        let err = vm
            .run_string(r#"print("go"); interrupt_me(); print("never");"#, "<test>")
            .unwrap_err();
        assert!(err.to_string().contains("interrupted"));
        assert_eq!(*buf.borrow(), "go\n");
    }

    #[test]
    fn test_wall_clock_timeout() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.set_timeout(50);
        let err = vm.run_string("while (true) { }", "<test>").unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_vm_usable_after_error() {
        let (mut vm, buf) = vm_with_buffer();
        assert!(vm.run_string("1 / 0", "<test>").is_err());
        vm.run_string("print(2 + 2)", "<test>").unwrap();
        assert_eq!(*buf.borrow(), "4\n");
        assert_eq!(vm.last_error(), "");
    }

    #[test]
    fn test_instruction_count_advances() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.run_string("let a = 1; let b = 2;", "<test>").unwrap();
        assert!(vm.instruction_count() >= 2);
    }

    // ------------------------------------------------------------------
    // Cycle collection
    // ------------------------------------------------------------------

    #[test]
    fn test_collect_cycles_breaks_self_referential_list() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.run_string(
            r#"
            fn make() { let l = []; l.push(l); return nil; }
            make();
            "#,
        "<test>")
            .unwrap();
        let broken = vm.collect_cycles();
        assert!(broken >= 1, "expected at least one broken object, got {}", broken);
        // A second pass finds nothing new.
        assert_eq!(vm.collect_cycles(), 0);
    }

    #[test]
    fn test_collect_cycles_keeps_reachable_data() {
        let (mut vm, buf) = vm_with_buffer();
        vm.run_string("let keep = [1, 2, 3];", "<test>").unwrap();
        vm.collect_cycles();
        vm.run_string("print(len(keep), keep[0])", "<test>").unwrap();
        assert_eq!(*buf.borrow(), "3 1\n");
    }

    #[test]
    fn test_closure_env_cycle_collected() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.run_string(
            r#"
            fn spawn() {
              let self_ref = nil;
              let f = fn() { return self_ref; };
              self_ref = f;
              return nil;
            }
            spawn();
            "#,
        "<test>")
            .unwrap();
        assert!(vm.collect_cycles() >= 1);
    }

    #[test]
    fn test_gc_alloc_trigger_auto_collects() {
        let (mut vm, _buf) = vm_with_buffer();
        vm.set_gc_alloc_trigger(10);
        vm.run_string(
            r#"
            for (let i = 0; i < 100; i += 1) {
              let l = []; l.push(l);
            }
            "#,
        "<test>")
            .unwrap();
        assert!(vm.gc_collections() > 0);
        assert!(vm.gc_objects_collected() > 0);
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    fn write_temp_module(dir: &std::path::Path, name: &str, source: &str) -> String {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, source).unwrap();
        path.to_string_lossy().to_string()
    }

    fn temp_module_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("skylark-test-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_import_named_and_default() {
        let dir = temp_module_dir("import");
        write_temp_module(
            &dir,
            "lib.sky",
            r#"
            export greet = fn(name) { return "hi " + name; }
            let internal = 2
            export { internal as two }
            "#,
        );
        let main = write_temp_module(
            &dir,
            "main.sky",
            r#"
            import { greet, two as n } from "./lib.sky"
            import lib from "./lib.sky"
            print(greet("bob"), n, lib.two);
            "#,
        );

        let buf = Rc::new(RefCell::new(String::new()));
        let mut vm = Vm::with_options(VmOptions {
            stdout: OutputSink::Buffer(buf.clone()),
            ..Default::default()
        });
        vm.run_file(&main).unwrap();
        assert_eq!(*buf.borrow(), "hi bob 2 2\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_require_module_caches() {
        let dir = temp_module_dir("require");
        let lib = write_temp_module(
            &dir,
            "counter.sky",
            r#"
            let hits = []
            hits.push(1)
            export count = len(hits)
            "#,
        );

        let (mut vm, _buf) = vm_with_buffer();
        let first = vm.require_module(&lib).unwrap();
        let second = vm.require_module(&lib).unwrap();
        assert_eq!(first.map_get("count").as_int(), Some(1));
        // Cached: the same exports map comes back.
        assert!(first.eq_value(&second));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_import_missing_name_fails() {
        let dir = temp_module_dir("missing");
        write_temp_module(&dir, "lib.sky", "export a = 1");
        let main = write_temp_module(&dir, "main.sky", r#"import { nope } from "./lib.sky""#);

        let (mut vm, _buf) = vm_with_buffer();
        let err = vm.run_file(&main).unwrap_err();
        assert!(err.to_string().contains("does not export 'nope'"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    // ------------------------------------------------------------------
    // Networking (loopback, single-threaded)
    // ------------------------------------------------------------------

    #[cfg(unix)]
    #[test]
    fn test_tcp_loopback_roundtrip() {
        let out = run(
            r#"
            let server = tcp_listen("127.0.0.1", 0);
            print(server._type, server._fd >= 0);
            let cp = tcp_connect("127.0.0.1", server.port);
            let ap = socket_accept(server);
            let client = await cp;
            let conn = await ap;
            print(client._type);

            await socket_send(client, "hello");
            let got = await socket_recv(conn, 1024);
            print(got);

            await socket_send(conn, "world");
            print(await socket_recv(client, 1024));

            socket_close(client);
            socket_close(conn);
            socket_close(server);
            print(server._fd);
            "#,
        );
        assert_eq!(out, "tcp_server true\ntcp\nhello\nworld\n-1\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_recv_rejects_on_peer_close() {
        let out = run(
            r#"
            let server = tcp_listen("127.0.0.1", 0);
            let cp = tcp_connect("127.0.0.1", server.port);
            let ap = socket_accept(server);
            let client = await cp;
            let conn = await ap;

            socket_close(client);
            let code = "";
            try { await socket_recv(conn, 64); } catch (e) { code = e.code; }
            print(code);
            socket_close(conn);
            socket_close(server);
            "#,
        );
        assert_eq!(out, "NET_CLOSED\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_recv_times_out() {
        let out = run(
            r#"
            let server = tcp_listen("127.0.0.1", 0);
            let cp = tcp_connect("127.0.0.1", server.port);
            let ap = socket_accept(server);
            let client = await cp;
            let conn = await ap;

            let code = "";
            try { await socket_recv(conn, 64, 50); } catch (e) { code = e.code; }
            print(code);
            socket_close(client);
            socket_close(conn);
            socket_close(server);
            "#,
        );
        assert_eq!(out, "NET_TIMEOUT\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_recv_validates_max_bytes() {
        let err = run_expect_err(
            r#"
            let server = tcp_listen("127.0.0.1", 0);
            socket_recv(server, 0);
            "#,
        );
        assert!(err.contains("between 1 and 1048576"));
    }

    #[cfg(unix)]
    #[test]
    fn test_closed_socket_rejected() {
        let err = run_expect_err(
            r#"
            let server = tcp_listen("127.0.0.1", 0);
            socket_close(server);
            socket_accept(server);
            "#,
        );
        assert!(err.contains("invalid socket"));
    }

    #[cfg(unix)]
    #[test]
    fn test_connect_rejects_unroutable() {
        // Nothing listens on this port of the loopback.
        let out = run(
            r#"
            let code = "";
            try { await tcp_connect("127.0.0.1", 1); } catch (e) { code = e.code; }
            print(code == "NET_CONNECT" || code == "NET_TIMEOUT");
            "#,
        );
        assert_eq!(out, "true\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_is_secure_default_false() {
        let out = run(
            r#"
            let server = tcp_listen("127.0.0.1", 0);
            print(socket_is_secure(server), tls_info(server));
            socket_close(server);
            "#,
        );
        assert_eq!(out, "false nil\n");
    }
}
