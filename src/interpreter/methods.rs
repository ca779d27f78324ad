//! Builtin Method Dispatch
//!
//! `obj.method(args)` dispatches on the receiver's type: string buffers,
//! lists, maps, strings and promises carry builtin methods. Map entries
//! holding callables win over builtin map methods so module objects and
//! plugin tables behave naturally. When the receiver identifier has no
//! binding at all, the dotted name is looked up as a global, which is
//! the flat-namespace convention hosts use to register `ns.fn` natives.

use std::rc::Rc;

use crate::ast::types::{Expr, Span};
use crate::interpreter::env::Env;
use crate::interpreter::errors::Control;
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    pub(crate) fn eval_method_call(
        &mut self,
        target: &Expr,
        method: &str,
        args: &[Expr],
        env: &Rc<Env>,
        span: Span,
    ) -> Result<Value, Control> {
        // Unbound receiver identifier: fall back to the dotted global
        // (`fm.status(...)` -> global function "fm.status").
        if let Expr::Ident { name, .. } = target {
            if !env.has(name) {
                let dotted = format!("{}.{}", name, method);
                if let Some(f) = self.globals.get(&dotted) {
                    let argv = self.eval_args(args, env)?;
                    return self.call_callable(&f, argv, span);
                }
                return Err(self.error(format!("undefined variable '{}'", name), span));
            }
        }

        let recv = self.eval_expr(target, env)?;
        let argv = self.eval_args(args, env)?;

        match &recv {
            Value::StrBuf(_) => self.strbuf_method(&recv, method, argv, span),
            Value::List(_) => self.list_method(&recv, method, argv, span),
            Value::Map(_) => {
                // A callable entry shadows the builtin method set.
                let entry = recv.map_get(method);
                if matches!(entry, Value::Func(_) | Value::Native(_)) {
                    return self.call_callable(&entry, argv, span);
                }
                self.map_method(&recv, method, argv, span)
            }
            Value::Str(_) => self.str_method(&recv, method, argv, span),
            Value::Promise(_) => self.promise_method(&recv, method, argv, span),
            other => Err(self.error(
                format!("no methods on value of type {}", other.type_name()),
                span,
            )),
        }
    }

    fn want_arity(
        &mut self,
        recv: &str,
        method: &str,
        args: &[Value],
        n: usize,
        span: Span,
    ) -> Result<(), Control> {
        if args.len() != n {
            return Err(self.error(
                format!(
                    "{}.{} expects {} argument(s), got {}",
                    recv,
                    method,
                    n,
                    args.len()
                ),
                span,
            ));
        }
        Ok(())
    }

    fn strbuf_method(
        &mut self,
        recv: &Value,
        method: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Control> {
        let buf = match recv {
            Value::StrBuf(b) => b.clone(),
            _ => unreachable!(),
        };
        match method {
            "append" => {
                self.want_arity("strbuf", "append", &args, 1, span)?;
                match &args[0] {
                    Value::Str(_)
                    | Value::Int(_)
                    | Value::Float(_)
                    | Value::Bool(_)
                    | Value::Nil => {
                        buf.borrow_mut().push_str(&args[0].stringify());
                        Ok(Value::Nil)
                    }
                    other => Err(self.error(
                        format!("strbuf.append expects a scalar, got {}", other.type_name()),
                        span,
                    )),
                }
            }
            "str" => {
                self.want_arity("strbuf", "str", &args, 0, span)?;
                let s = buf.borrow().clone();
                Ok(Value::from(s))
            }
            "clear" => {
                self.want_arity("strbuf", "clear", &args, 0, span)?;
                buf.borrow_mut().clear();
                Ok(Value::Nil)
            }
            "len" => {
                self.want_arity("strbuf", "len", &args, 0, span)?;
                Ok(Value::Int(buf.borrow().len() as i64))
            }
            _ => Err(self.error(format!("unknown strbuf method '{}'", method), span)),
        }
    }

    fn list_method(
        &mut self,
        recv: &Value,
        method: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Control> {
        let items = match recv {
            Value::List(l) => l.clone(),
            _ => unreachable!(),
        };
        match method {
            "len" => {
                self.want_arity("list", "len", &args, 0, span)?;
                Ok(Value::Int(items.borrow().len() as i64))
            }
            "push" => {
                self.want_arity("list", "push", &args, 1, span)?;
                items.borrow_mut().push(args[0].clone());
                Ok(Value::Nil)
            }
            "pop" => {
                self.want_arity("list", "pop", &args, 0, span)?;
                Ok(items.borrow_mut().pop().unwrap_or(Value::Nil))
            }
            "insert" => {
                self.want_arity("list", "insert", &args, 2, span)?;
                let idx = match args[0].as_int() {
                    Some(i) if i >= 0 && (i as usize) <= items.borrow().len() => i as usize,
                    _ => return Err(self.error("list.insert index out of range", span)),
                };
                items.borrow_mut().insert(idx, args[1].clone());
                Ok(Value::Nil)
            }
            "remove" => {
                self.want_arity("list", "remove", &args, 1, span)?;
                let idx = match args[0].as_int() {
                    Some(i) if i >= 0 && (i as usize) < items.borrow().len() => i as usize,
                    _ => return Err(self.error("list.remove index out of range", span)),
                };
                Ok(items.borrow_mut().remove(idx))
            }
            "contains" => {
                self.want_arity("list", "contains", &args, 1, span)?;
                let found = items.borrow().iter().any(|v| v.eq_value(&args[0]));
                Ok(Value::Bool(found))
            }
            "index_of" => {
                self.want_arity("list", "index_of", &args, 1, span)?;
                let idx = items
                    .borrow()
                    .iter()
                    .position(|v| v.eq_value(&args[0]))
                    .map(|i| i as i64)
                    .unwrap_or(-1);
                Ok(Value::Int(idx))
            }
            "join" => {
                self.want_arity("list", "join", &args, 1, span)?;
                let sep = match args[0].as_str() {
                    Some(s) => s.to_string(),
                    None => return Err(self.error("list.join expects a string", span)),
                };
                let joined = items
                    .borrow()
                    .iter()
                    .map(Value::stringify)
                    .collect::<Vec<_>>()
                    .join(&sep);
                Ok(Value::from(joined))
            }
            "slice" => {
                self.want_arity("list", "slice", &args, 2, span)?;
                let len = items.borrow().len() as i64;
                let (a, b) = match (args[0].as_int(), args[1].as_int()) {
                    (Some(a), Some(b)) => (a.clamp(0, len) as usize, b.clamp(0, len) as usize),
                    _ => return Err(self.error("list.slice expects integer bounds", span)),
                };
                let out: Vec<Value> = if a < b {
                    items.borrow()[a..b].to_vec()
                } else {
                    Vec::new()
                };
                Ok(self.new_list(out))
            }
            "reverse" => {
                self.want_arity("list", "reverse", &args, 0, span)?;
                items.borrow_mut().reverse();
                Ok(Value::Nil)
            }
            "sort" => {
                self.want_arity("list", "sort", &args, 0, span)?;
                let mut values = items.borrow().clone();
                let all_numbers = values
                    .iter()
                    .all(|v| matches!(v, Value::Int(_) | Value::Float(_)));
                let all_strings = values.iter().all(|v| matches!(v, Value::Str(_)));
                if all_numbers {
                    values.sort_by(|a, b| {
                        let x = match a {
                            Value::Int(i) => *i as f64,
                            Value::Float(f) => *f,
                            _ => 0.0,
                        };
                        let y = match b {
                            Value::Int(i) => *i as f64,
                            Value::Float(f) => *f,
                            _ => 0.0,
                        };
                        x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
                    });
                } else if all_strings {
                    values.sort_by(|a, b| match (a, b) {
                        (Value::Str(x), Value::Str(y)) => x.as_bytes().cmp(y.as_bytes()),
                        _ => std::cmp::Ordering::Equal,
                    });
                } else {
                    return Err(
                        self.error("list.sort expects all numbers or all strings", span)
                    );
                }
                *items.borrow_mut() = values;
                Ok(Value::Nil)
            }
            "clear" => {
                self.want_arity("list", "clear", &args, 0, span)?;
                items.borrow_mut().clear();
                Ok(Value::Nil)
            }
            _ => Err(self.error(format!("unknown list method '{}'", method), span)),
        }
    }

    fn map_method(
        &mut self,
        recv: &Value,
        method: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Control> {
        match method {
            "len" => {
                self.want_arity("map", "len", &args, 0, span)?;
                Ok(Value::Int(recv.map_len().unwrap_or(0) as i64))
            }
            "keys" => {
                self.want_arity("map", "keys", &args, 0, span)?;
                let keys: Vec<Value> = recv.map_keys().into_iter().map(Value::from).collect();
                Ok(self.new_list(keys))
            }
            "values" => {
                self.want_arity("map", "values", &args, 0, span)?;
                let values = match recv {
                    Value::Map(m) => m.borrow().values().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(self.new_list(values))
            }
            "has" => {
                self.want_arity("map", "has", &args, 1, span)?;
                let key = match args[0].as_str() {
                    Some(k) => k,
                    None => return Err(self.error("map.has expects a string key", span)),
                };
                Ok(Value::Bool(recv.map_has(key)))
            }
            "get" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(self.error("map.get expects 1 or 2 argument(s)", span));
                }
                let key = match args[0].as_str() {
                    Some(k) => k,
                    None => return Err(self.error("map.get expects a string key", span)),
                };
                if recv.map_has(key) {
                    Ok(recv.map_get(key))
                } else {
                    Ok(args.get(1).cloned().unwrap_or(Value::Nil))
                }
            }
            "set" => {
                self.want_arity("map", "set", &args, 2, span)?;
                let key = match args[0].as_str() {
                    Some(k) => k.to_string(),
                    None => return Err(self.error("map.set expects a string key", span)),
                };
                recv.map_set(&key, args[1].clone());
                Ok(Value::Nil)
            }
            "del" => {
                self.want_arity("map", "del", &args, 1, span)?;
                let key = match args[0].as_str() {
                    Some(k) => k.to_string(),
                    None => return Err(self.error("map.del expects a string key", span)),
                };
                Ok(Value::Bool(recv.map_del(&key)))
            }
            "clear" => {
                self.want_arity("map", "clear", &args, 0, span)?;
                if let Value::Map(m) = recv {
                    m.borrow_mut().clear();
                }
                Ok(Value::Nil)
            }
            _ => Err(self.error(format!("unknown map method '{}'", method), span)),
        }
    }

    fn str_method(
        &mut self,
        recv: &Value,
        method: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Control> {
        let s = match recv {
            Value::Str(s) => s.clone(),
            _ => unreachable!(),
        };
        match method {
            "len" => {
                self.want_arity("string", "len", &args, 0, span)?;
                Ok(Value::Int(s.len() as i64))
            }
            "upper" => {
                self.want_arity("string", "upper", &args, 0, span)?;
                Ok(Value::from(s.to_uppercase()))
            }
            "lower" => {
                self.want_arity("string", "lower", &args, 0, span)?;
                Ok(Value::from(s.to_lowercase()))
            }
            "trim" => {
                self.want_arity("string", "trim", &args, 0, span)?;
                Ok(Value::from(s.trim().to_string()))
            }
            "split" => {
                self.want_arity("string", "split", &args, 1, span)?;
                let sep = match args[0].as_str() {
                    Some(sep) => sep,
                    None => return Err(self.error("string.split expects a string", span)),
                };
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::str(c.to_string())).collect()
                } else {
                    s.split(sep).map(Value::from).collect()
                };
                Ok(self.new_list(parts))
            }
            "contains" => {
                self.want_arity("string", "contains", &args, 1, span)?;
                match args[0].as_str() {
                    Some(needle) => Ok(Value::Bool(s.contains(needle))),
                    None => Err(self.error("string.contains expects a string", span)),
                }
            }
            "starts_with" => {
                self.want_arity("string", "starts_with", &args, 1, span)?;
                match args[0].as_str() {
                    Some(prefix) => Ok(Value::Bool(s.starts_with(prefix))),
                    None => Err(self.error("string.starts_with expects a string", span)),
                }
            }
            "ends_with" => {
                self.want_arity("string", "ends_with", &args, 1, span)?;
                match args[0].as_str() {
                    Some(suffix) => Ok(Value::Bool(s.ends_with(suffix))),
                    None => Err(self.error("string.ends_with expects a string", span)),
                }
            }
            "index_of" => {
                self.want_arity("string", "index_of", &args, 1, span)?;
                let needle = match args[0].as_str() {
                    Some(n) => n,
                    None => return Err(self.error("string.index_of expects a string", span)),
                };
                // Character index, consistent with substr.
                let idx = s
                    .find(needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1);
                Ok(Value::Int(idx))
            }
            "replace" => {
                self.want_arity("string", "replace", &args, 2, span)?;
                match (args[0].as_str(), args[1].as_str()) {
                    (Some(from), Some(to)) => Ok(Value::from(s.replace(from, to))),
                    _ => Err(self.error("string.replace expects two strings", span)),
                }
            }
            "substr" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(self.error("string.substr expects 1 or 2 argument(s)", span));
                }
                let start = match args[0].as_int() {
                    Some(i) if i >= 0 => i as usize,
                    _ => return Err(self.error("string.substr start must be >= 0", span)),
                };
                let take = match args.get(1) {
                    None => usize::MAX,
                    Some(v) => match v.as_int() {
                        Some(n) if n >= 0 => n as usize,
                        _ => return Err(self.error("string.substr length must be >= 0", span)),
                    },
                };
                let out: String = s.chars().skip(start).take(take).collect();
                Ok(Value::from(out))
            }
            "parse_int" => {
                self.want_arity("string", "parse_int", &args, 0, span)?;
                match s.trim().parse::<i64>() {
                    Ok(i) => Ok(Value::Int(i)),
                    Err(_) => Ok(Value::Nil),
                }
            }
            "parse_float" => {
                self.want_arity("string", "parse_float", &args, 0, span)?;
                match s.trim().parse::<f64>() {
                    Ok(f) => Ok(Value::Float(f)),
                    Err(_) => Ok(Value::Nil),
                }
            }
            _ => Err(self.error(format!("unknown string method '{}'", method), span)),
        }
    }

    fn promise_method(
        &mut self,
        recv: &Value,
        method: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Control> {
        let p = match recv {
            Value::Promise(p) => p.clone(),
            _ => unreachable!(),
        };
        match method {
            "is_pending" => {
                self.want_arity("promise", "is_pending", &args, 0, span)?;
                Ok(Value::Bool(p.is_pending()))
            }
            "is_fulfilled" => {
                self.want_arity("promise", "is_fulfilled", &args, 0, span)?;
                Ok(Value::Bool(p.is_fulfilled()))
            }
            "is_rejected" => {
                self.want_arity("promise", "is_rejected", &args, 0, span)?;
                Ok(Value::Bool(p.is_rejected()))
            }
            _ => Err(self.error(format!("unknown promise method '{}'", method), span)),
        }
    }
}
