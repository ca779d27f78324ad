//! Core Standard Library
//!
//! The native functions registered on every VM: printing, type
//! introspection, conversions, assertions, the clock, timers and the
//! script-visible promise utilities. Networking natives live in the
//! network module and are registered separately.

use crate::event_loop::scheduler::now_millis;
use crate::value::{NativeError, Value};
use crate::vm::Vm;

pub(crate) fn want_arg(args: &[Value], index: usize, what: &str) -> Result<Value, NativeError> {
    args.get(index)
        .cloned()
        .ok_or_else(|| NativeError::new(format!("missing argument: {}", what)))
}

pub(crate) fn want_str(args: &[Value], index: usize, what: &str) -> Result<String, NativeError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(NativeError::new(format!(
            "{} must be a string, got {}",
            what,
            other.type_name()
        ))),
        None => Err(NativeError::new(format!("missing argument: {}", what))),
    }
}

pub(crate) fn want_int(args: &[Value], index: usize, what: &str) -> Result<i64, NativeError> {
    match args.get(index) {
        Some(Value::Int(i)) => Ok(*i),
        Some(other) => Err(NativeError::new(format!(
            "{} must be an integer, got {}",
            what,
            other.type_name()
        ))),
        None => Err(NativeError::new(format!("missing argument: {}", what))),
    }
}

fn nf_print(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&arg.stringify());
    }
    out.push('\n');
    vm.write_stdout(&out);
    Ok(Value::Nil)
}

fn nf_typeof(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let v = want_arg(args, 0, "typeof(value)")?;
    Ok(Value::str(v.type_name()))
}

fn nf_getenv(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let key = want_str(args, 0, "getenv() name")?;
    match std::env::var(&key) {
        Ok(v) => Ok(Value::from(v)),
        Err(_) => Ok(Value::Nil),
    }
}

fn nf_assert(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let cond = want_arg(args, 0, "assert(condition)")?;
    if cond.is_truthy() {
        return Ok(Value::Nil);
    }
    match args.get(1) {
        Some(Value::Str(msg)) => Err(NativeError::new(msg.to_string())),
        _ => Err(NativeError::new("assertion failed")),
    }
}

fn nf_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let v = want_arg(args, 0, "len(value)")?;
    let n = match &v {
        Value::Str(s) => s.len(),
        Value::List(l) => l.borrow().len(),
        Value::Map(m) => m.borrow().len(),
        Value::StrBuf(b) => b.borrow().len(),
        other => {
            return Err(NativeError::new(format!(
                "len() expects string, list, map or strbuf, got {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(n as i64))
}

fn nf_str(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let v = want_arg(args, 0, "str(value)")?;
    Ok(Value::from(v.stringify()))
}

fn nf_int(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let v = want_arg(args, 0, "int(value)")?;
    match &v {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| NativeError::new(format!("int() cannot parse '{}'", s))),
        other => Err(NativeError::new(format!(
            "int() expects number or string, got {}",
            other.type_name()
        ))),
    }
}

fn nf_float(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let v = want_arg(args, 0, "float(value)")?;
    match &v {
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| NativeError::new(format!("float() cannot parse '{}'", s))),
        other => Err(NativeError::new(format!(
            "float() expects number or string, got {}",
            other.type_name()
        ))),
    }
}

fn nf_strbuf(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let _ = args;
    Ok(Value::strbuf())
}

fn nf_range(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let start = want_int(args, 0, "range() start")?;
    let end = want_int(args, 1, "range() end")?;
    Ok(Value::Range { start, end, inclusive: false })
}

fn nf_now_ms(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let _ = args;
    Ok(Value::Int(now_millis() as i64))
}

fn nf_sleep(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let ms = want_int(args, 0, "sleep() milliseconds")?;
    if ms < 0 {
        return Err(NativeError::new("sleep() milliseconds must be >= 0"));
    }
    let promise = vm.new_promise();
    vm.schedule_timer(promise.clone(), now_millis() + ms as u64);
    Ok(Value::Promise(promise))
}

fn nf_set_instruction_limit(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let limit = want_int(args, 0, "set_instruction_limit() limit")?;
    if limit < 0 {
        return Err(NativeError::new("set_instruction_limit() limit must be >= 0"));
    }
    vm.set_instruction_limit(limit as u64);
    Ok(Value::Nil)
}

fn nf_set_timeout(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let ms = want_int(args, 0, "set_timeout() ms")?;
    if ms < 0 {
        return Err(NativeError::new("set_timeout() ms must be >= 0"));
    }
    vm.set_timeout(ms as u64);
    Ok(Value::Nil)
}

fn nf_promise(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let _ = args;
    Ok(Value::Promise(vm.new_promise()))
}

fn nf_promise_resolve(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let value = args.get(1).cloned().unwrap_or(Value::Nil);
    match args.first() {
        Some(Value::Promise(p)) => {
            // Settling an already settled promise is a no-op.
            p.resolve(value);
            Ok(Value::Nil)
        }
        _ => Err(NativeError::new("promise_resolve() expects a promise")),
    }
}

fn nf_promise_reject(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let value = args.get(1).cloned().unwrap_or(Value::Nil);
    match args.first() {
        Some(Value::Promise(p)) => {
            p.reject(value);
            Ok(Value::Nil)
        }
        _ => Err(NativeError::new("promise_reject() expects a promise")),
    }
}

pub fn register_stdlib(vm: &mut Vm) {
    vm.register_native("print", nf_print);
    vm.register_native("typeof", nf_typeof);
    vm.register_native("getenv", nf_getenv);
    vm.register_native("assert", nf_assert);
    vm.register_native("len", nf_len);
    vm.register_native("str", nf_str);
    vm.register_native("int", nf_int);
    vm.register_native("float", nf_float);
    vm.register_native("strbuf", nf_strbuf);
    vm.register_native("range", nf_range);
    vm.register_native("now_ms", nf_now_ms);
    vm.register_native("sleep", nf_sleep);
    vm.register_native("set_instruction_limit", nf_set_instruction_limit);
    vm.register_native("set_timeout", nf_set_timeout);
    vm.register_native("promise", nf_promise);
    vm.register_native("promise_resolve", nf_promise_resolve);
    vm.register_native("promise_reject", nf_promise_reject);
}
