//! Tree-Walking Interpreter
//!
//! Statement execution and expression evaluation over the AST. Control
//! flow (`break`/`continue`/`return`/`throw`) and errors travel through
//! `Result<_, Control>`; every statement and loop back-edge is a
//! safepoint that checks the interrupt flag, the instruction limit and
//! the wall-clock timeout.

use std::rc::Rc;

use crate::ast::types::{
    AssignOp, AssignTarget, BinaryOp, Expr, LetPattern, Program, Span, Stmt,
};
use crate::interpreter::env::{Env, SetResult};
use crate::interpreter::errors::Control;
use crate::value::{Function, Value};
use crate::vm::{AssignMode, Frame, Vm, MAX_CALL_DEPTH};

impl Vm {
    /// Execute a parsed program at global scope. A top-level `return`
    /// stops execution without error.
    pub(crate) fn exec_program(&mut self, program: &Program) -> Result<(), Control> {
        let globals = self.globals.clone();
        match self.exec_block_in(&program.body, &globals) {
            Err(Control::Return(_)) | Ok(()) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// Execute the statements of one block. Deferred statements
    /// accumulate here and run in LIFO order on every exit path.
    pub(crate) fn exec_block_in(&mut self, block: &[Stmt], env: &Rc<Env>) -> Result<(), Control> {
        let mut defers: Vec<&Stmt> = Vec::new();
        let mut result = Ok(());
        for stmt in block {
            result = self.exec_stmt(stmt, env, &mut defers);
            if result.is_err() {
                break;
            }
        }
        self.run_defers(&defers, env, result)
    }

    /// Execute a single statement that forms its own block (loop bodies
    /// and branch arms that are not `{ … }` blocks).
    fn exec_standalone(&mut self, stmt: &Stmt, env: &Rc<Env>) -> Result<(), Control> {
        let mut defers: Vec<&Stmt> = Vec::new();
        let result = self.exec_stmt(stmt, env, &mut defers);
        self.run_defers(&defers, env, result)
    }

    /// Run deferred statements LIFO. An error raised by a deferred
    /// statement is swallowed when we are already unwinding; otherwise
    /// it becomes the block's result. Safety aborts always win.
    fn run_defers(
        &mut self,
        defers: &[&Stmt],
        env: &Rc<Env>,
        mut result: Result<(), Control>,
    ) -> Result<(), Control> {
        for stmt in defers.iter().rev() {
            let r = self.exec_standalone(stmt, env);
            if let Err(ctl) = r {
                if ctl.is_abort() || result.is_ok() {
                    result = Err(ctl);
                }
            }
        }
        result
    }

    fn exec_stmt<'a>(
        &mut self,
        stmt: &'a Stmt,
        env: &Rc<Env>,
        defers: &mut Vec<&'a Stmt>,
    ) -> Result<(), Control> {
        self.check_safepoint(stmt.span())?;

        match stmt {
            Stmt::Expr(e) => {
                self.eval_expr(e, env)?;
                Ok(())
            }

            Stmt::Let { pattern, init, is_const, span } => {
                let value = match init {
                    Some(e) => self.eval_expr(e, env)?,
                    None => Value::Nil,
                };
                self.bind_pattern(pattern, value, *is_const, env, *span)
            }

            Stmt::Assign { target, op, value, span } => {
                self.exec_assign(target, *op, value, env, *span)
            }

            Stmt::Block(block, _) => {
                let child = self.new_env(Some(env.clone()));
                self.exec_block_in(block, &child)
            }

            Stmt::If { cond, then_branch, else_branch, .. } => {
                let c = self.eval_expr(cond, env)?;
                if c.is_truthy() {
                    self.exec_standalone(then_branch, env)
                } else if let Some(else_branch) = else_branch {
                    self.exec_standalone(else_branch, env)
                } else {
                    Ok(())
                }
            }

            Stmt::While { cond, body, span } => {
                loop {
                    let c = self.eval_expr(cond, env)?;
                    if !c.is_truthy() {
                        return Ok(());
                    }
                    match self.exec_standalone(body, env) {
                        Ok(()) | Err(Control::Continue(_)) => {}
                        Err(Control::Break(_)) => return Ok(()),
                        Err(other) => return Err(other),
                    }
                    self.check_safepoint(*span)?;
                }
            }

            Stmt::ForIn { name, name2, iterable, body, span } => {
                self.exec_for_in(name, name2.as_deref(), iterable, body, env, *span)
            }

            Stmt::ForC { init, cond, incr, body, span } => {
                let loop_env = self.new_env(Some(env.clone()));
                if let Some(init) = init {
                    self.exec_standalone(init, &loop_env)?;
                }
                loop {
                    if let Some(cond) = cond {
                        let c = self.eval_expr(cond, &loop_env)?;
                        if !c.is_truthy() {
                            return Ok(());
                        }
                    }
                    match self.exec_standalone(body, &loop_env) {
                        Ok(()) | Err(Control::Continue(_)) => {}
                        Err(Control::Break(_)) => return Ok(()),
                        Err(other) => return Err(other),
                    }
                    if let Some(incr) = incr {
                        self.exec_standalone(incr, &loop_env)?;
                    }
                    self.check_safepoint(*span)?;
                }
            }

            Stmt::Return { value, .. } => {
                let v = match value {
                    Some(e) => self.eval_expr(e, env)?,
                    None => Value::Nil,
                };
                Err(Control::Return(v))
            }

            Stmt::Break(span) => Err(Control::Break(*span)),
            Stmt::Continue(span) => Err(Control::Continue(*span)),

            Stmt::FnDef { decl, span } => {
                let func = Value::Func(Rc::new(Function {
                    decl: decl.clone(),
                    closure: env.clone(),
                    source: self.current_source(),
                }));
                let name = decl.name.as_deref().unwrap_or("<fn>");
                env.define(name, func, false).map_err(|_| {
                    self.error(format!("cannot redeclare constant '{}'", name), *span)
                })
            }

            Stmt::Switch { scrutinee, cases, default, .. } => {
                let value = self.eval_expr(scrutinee, env)?;
                for (test, block) in cases {
                    let t = self.eval_expr(test, env)?;
                    if value.eq_value(&t) {
                        let child = self.new_env(Some(env.clone()));
                        return self.exec_block_in(block, &child);
                    }
                }
                if let Some(block) = default {
                    let child = self.new_env(Some(env.clone()));
                    return self.exec_block_in(block, &child);
                }
                Ok(())
            }

            Stmt::Defer { stmt, .. } => {
                defers.push(stmt.as_ref());
                Ok(())
            }

            Stmt::Throw { value, .. } => {
                let v = self.eval_expr(value, env)?;
                Err(Control::Throw(v))
            }

            Stmt::Try { body, catch, finally, span } => {
                self.exec_try(body, catch, finally, env, *span)
            }

            Stmt::Import { default_name, names, path, span } => {
                let path_value = self.eval_expr(path, env)?;
                let path_str = match path_value.as_str() {
                    Some(s) => s.to_string(),
                    None => {
                        return Err(self.error("import path must be a string", *span));
                    }
                };
                let exports = self.load_module(&path_str, *span)?;
                if let Some(local) = default_name {
                    env.define(local, exports, false).map_err(|_| {
                        self.error(format!("cannot redeclare constant '{}'", local), *span)
                    })?;
                    return Ok(());
                }
                for name in names {
                    let value = exports.map_get(&name.export);
                    if value.is_nil() && !exports.map_has(&name.export) {
                        return Err(self.error(
                            format!("module '{}' does not export '{}'", path_str, name.export),
                            *span,
                        ));
                    }
                    env.define(&name.local, value, false).map_err(|_| {
                        self.error(format!("cannot redeclare constant '{}'", name.local), *span)
                    })?;
                }
                Ok(())
            }

            Stmt::Export { name, value, span } => {
                let v = self.eval_expr(value, env)?;
                env.define(name, v.clone(), false).map_err(|_| {
                    self.error(format!("cannot redeclare constant '{}'", name), *span)
                })?;
                if let Some(exports) = self.exports_stack.last() {
                    exports.map_set(name, v);
                }
                Ok(())
            }

            Stmt::ExportList { names, span } => {
                for name in names {
                    let value = match env.get(&name.local) {
                        Some(v) => v,
                        None => {
                            return Err(self.error(
                                format!("undefined variable '{}'", name.local),
                                *span,
                            ));
                        }
                    };
                    if let Some(exports) = self.exports_stack.last() {
                        exports.map_set(&name.export, value);
                    }
                }
                Ok(())
            }

            Stmt::Yield { value, span } => {
                let v = self.eval_expr(value, env)?;
                match self.yield_stack.last_mut() {
                    Some(sink) => {
                        sink.push(v);
                        Ok(())
                    }
                    None => Err(self.error("yield outside of a generator", *span)),
                }
            }
        }
    }

    fn bind_pattern(
        &mut self,
        pattern: &LetPattern,
        value: Value,
        is_const: bool,
        env: &Rc<Env>,
        span: Span,
    ) -> Result<(), Control> {
        match pattern {
            LetPattern::Name(name) => env.define(name, value, is_const).map_err(|_| {
                self.error(format!("cannot redeclare constant '{}'", name), span)
            }),
            LetPattern::List(names) => {
                let len = match value.list_len() {
                    Some(n) => n,
                    None => {
                        return Err(self.error(
                            format!("cannot destructure {} as a list", value.type_name()),
                            span,
                        ));
                    }
                };
                if len < names.len() {
                    return Err(self.error(
                        format!(
                            "list destructuring expects at least {} elements, got {}",
                            names.len(),
                            len
                        ),
                        span,
                    ));
                }
                for (i, name) in names.iter().enumerate() {
                    env.define(name, value.list_get(i), is_const).map_err(|_| {
                        self.error(format!("cannot redeclare constant '{}'", name), span)
                    })?;
                }
                Ok(())
            }
            LetPattern::Map(entries) => {
                if !matches!(value, Value::Map(_)) {
                    return Err(self.error(
                        format!("cannot destructure {} as a map", value.type_name()),
                        span,
                    ));
                }
                for (key, local) in entries {
                    env.define(local, value.map_get(key), is_const).map_err(|_| {
                        self.error(format!("cannot redeclare constant '{}'", local), span)
                    })?;
                }
                Ok(())
            }
        }
    }

    fn exec_assign(
        &mut self,
        target: &AssignTarget,
        op: AssignOp,
        value: &Expr,
        env: &Rc<Env>,
        span: Span,
    ) -> Result<(), Control> {
        let binop = match op {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
        };

        match target {
            AssignTarget::Name(name) => {
                let new_value = match binop {
                    None => self.eval_expr(value, env)?,
                    Some(op) => {
                        let current = match env.get(name) {
                            Some(v) => v,
                            None => {
                                return Err(self
                                    .error(format!("undefined variable '{}'", name), span));
                            }
                        };
                        let rhs = self.eval_expr(value, env)?;
                        self.apply_binary(op, current, rhs, span)?
                    }
                };
                match env.set(name, new_value.clone()) {
                    SetResult::Updated => Ok(()),
                    SetResult::ConstViolation => {
                        Err(self.error(format!("cannot assign to constant '{}'", name), span))
                    }
                    SetResult::NotFound => match self.options.assign_mode {
                        AssignMode::Strict => {
                            Err(self.error(format!("undefined variable '{}'", name), span))
                        }
                        AssignMode::Lenient => env.define(name, new_value, false).map_err(|_| {
                            self.error(format!("cannot assign to constant '{}'", name), span)
                        }),
                    },
                }
            }

            AssignTarget::Index { target, index } => {
                let container = self.eval_expr(target, env)?;
                let index = self.eval_expr(index, env)?;
                let new_value = match binop {
                    None => self.eval_expr(value, env)?,
                    Some(op) => {
                        let current = self.index_get(&container, &index, span)?;
                        let rhs = self.eval_expr(value, env)?;
                        self.apply_binary(op, current, rhs, span)?
                    }
                };
                match (&container, &index) {
                    (Value::List(_), Value::Int(i)) => {
                        if *i < 0 {
                            return Err(
                                self.error("list index must be non-negative", span)
                            );
                        }
                        container.list_set(*i as usize, new_value);
                        Ok(())
                    }
                    (Value::Map(_), Value::Str(key)) => {
                        container.map_set(key, new_value);
                        Ok(())
                    }
                    _ => Err(self.error(
                        "index assignment expects list[int] or map[string]",
                        span,
                    )),
                }
            }

            AssignTarget::Field { target, name } => {
                let container = self.eval_expr(target, env)?;
                let new_value = match binop {
                    None => self.eval_expr(value, env)?,
                    Some(op) => {
                        let current = match &container {
                            Value::Map(_) => container.map_get(name),
                            _ => {
                                return Err(
                                    self.error("field assignment expects map", span)
                                );
                            }
                        };
                        let rhs = self.eval_expr(value, env)?;
                        self.apply_binary(op, current, rhs, span)?
                    }
                };
                if !container.map_set(name, new_value) {
                    return Err(self.error("field assignment expects map", span));
                }
                Ok(())
            }
        }
    }

    fn exec_for_in(
        &mut self,
        name: &str,
        name2: Option<&str>,
        iterable: &Expr,
        body: &Stmt,
        env: &Rc<Env>,
        span: Span,
    ) -> Result<(), Control> {
        let iter_value = self.eval_expr(iterable, env)?;
        let loop_env = self.new_env(Some(env.clone()));

        // Ranges iterate lazily; nothing to snapshot.
        if let Value::Range { start, end, inclusive } = iter_value {
            if name2.is_some() {
                return Err(self.error("two loop variables require a list or map", span));
            }
            let mut i = start;
            loop {
                let done = if inclusive { i > end } else { i >= end };
                if done {
                    return Ok(());
                }
                loop_env.define(name, Value::Int(i), false).map_err(|_| {
                    self.error(format!("cannot redeclare constant '{}'", name), span)
                })?;
                match self.exec_standalone(body, &loop_env) {
                    Ok(()) | Err(Control::Continue(_)) => {}
                    Err(Control::Break(_)) => return Ok(()),
                    Err(other) => return Err(other),
                }
                self.check_safepoint(span)?;
                i = match i.checked_add(1) {
                    Some(next) => next,
                    None => return Ok(()),
                };
            }
        }

        // Snapshot the iteration space so mutation inside the body
        // cannot invalidate it.
        let pairs: Vec<(Value, Value)> = match &iter_value {
            Value::List(items) => items
                .borrow()
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v.clone()))
                .collect(),
            Value::Map(m) => m
                .borrow()
                .iter()
                .map(|(k, v)| (Value::str(k), v.clone()))
                .collect(),
            Value::Str(s) => s
                .chars()
                .map(|c| (Value::str(c.to_string()), Value::Nil))
                .collect(),
            other => {
                return Err(self.error(
                    format!("cannot iterate value of type {}", other.type_name()),
                    span,
                ));
            }
        };

        for (first, second) in pairs {
            match name2 {
                None => {
                    // Single-variable form: lists iterate values, maps
                    // iterate keys, ranges and strings their elements.
                    let element = match &iter_value {
                        Value::List(_) => second,
                        _ => first,
                    };
                    loop_env.define(name, element, false).map_err(|_| {
                        self.error(format!("cannot redeclare constant '{}'", name), span)
                    })?;
                }
                Some(name2) => {
                    if matches!(&iter_value, Value::Range { .. } | Value::Str(_)) {
                        return Err(self.error(
                            "two loop variables require a list or map",
                            span,
                        ));
                    }
                    loop_env.define(name, first, false).map_err(|_| {
                        self.error(format!("cannot redeclare constant '{}'", name), span)
                    })?;
                    loop_env.define(name2, second, false).map_err(|_| {
                        self.error(format!("cannot redeclare constant '{}'", name2), span)
                    })?;
                }
            }

            match self.exec_standalone(body, &loop_env) {
                Ok(()) | Err(Control::Continue(_)) => {}
                Err(Control::Break(_)) => return Ok(()),
                Err(other) => return Err(other),
            }
            self.check_safepoint(span)?;
        }
        Ok(())
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        catch: &Option<(String, Vec<Stmt>)>,
        finally: &Option<Vec<Stmt>>,
        env: &Rc<Env>,
        span: Span,
    ) -> Result<(), Control> {
        let _ = span;
        let body_env = self.new_env(Some(env.clone()));
        let mut result = match (self.exec_block_in(body, &body_env), catch) {
            (Err(Control::Throw(v)), Some((name, handler))) => {
                let catch_env = self.new_env(Some(env.clone()));
                let _ = catch_env.define(name, v, false);
                self.exec_block_in(handler, &catch_env)
            }
            (Err(Control::Error(e)), Some((name, handler))) => {
                // Runtime errors surface to script code as an error map;
                // safety aborts never do.
                let err_map = self.new_map();
                err_map.map_set("msg", Value::str(&e.message));
                err_map.map_set("code", Value::str("RUNTIME"));
                let catch_env = self.new_env(Some(env.clone()));
                let _ = catch_env.define(name, err_map, false);
                self.exec_block_in(handler, &catch_env)
            }
            (other, _) => other,
        };

        if let Some(finally) = finally {
            let finally_env = self.new_env(Some(env.clone()));
            let fin = self.exec_block_in(finally, &finally_env);
            if let Err(ctl) = fin {
                if ctl.is_abort() || result.is_ok() {
                    result = Err(ctl);
                }
            }
        }

        result
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub(crate) fn eval_expr(&mut self, expr: &Expr, env: &Rc<Env>) -> Result<Value, Control> {
        match expr {
            Expr::Int(v, _) => Ok(Value::Int(*v)),
            Expr::Float(v, _) => Ok(Value::Float(*v)),
            Expr::Str(s, _) => Ok(Value::Str(s.clone())),
            Expr::Bool(b, _) => Ok(Value::Bool(*b)),
            Expr::Nil(_) => Ok(Value::Nil),

            Expr::Interp { parts, .. } => {
                let mut out = String::new();
                for part in parts {
                    let v = self.eval_expr(part, env)?;
                    out.push_str(&v.stringify());
                }
                Ok(Value::from(out))
            }

            Expr::Ident { name, span } => match env.get(name) {
                Some(v) => Ok(v),
                None => Err(self.error(format!("undefined variable '{}'", name), *span)),
            },

            Expr::List { items, .. } => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Expr::Spread { expr, span } => {
                            let v = self.eval_expr(expr, env)?;
                            match &v {
                                Value::List(l) => out.extend(l.borrow().iter().cloned()),
                                other => {
                                    return Err(self.error(
                                        format!("spread expects a list, got {}", other.type_name()),
                                        *span,
                                    ));
                                }
                            }
                        }
                        _ => out.push(self.eval_expr(item, env)?),
                    }
                }
                Ok(self.new_list(out))
            }

            Expr::MapLit { entries, .. } => {
                let map = self.new_map();
                for (key, value) in entries {
                    let v = self.eval_expr(value, env)?;
                    map.map_set(key, v);
                }
                Ok(map)
            }

            Expr::Spread { span, .. } => {
                Err(self.error("spread is only allowed in calls and list literals", *span))
            }

            Expr::Unary { op, expr, span } => {
                let v = self.eval_expr(expr, env)?;
                self.apply_unary(*op, v, *span)
            }

            Expr::Binary { op: BinaryOp::And, left, right, .. } => {
                let l = self.eval_expr(left, env)?;
                if !l.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                let r = self.eval_expr(right, env)?;
                Ok(Value::Bool(r.is_truthy()))
            }
            Expr::Binary { op: BinaryOp::Or, left, right, .. } => {
                let l = self.eval_expr(left, env)?;
                if l.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                let r = self.eval_expr(right, env)?;
                Ok(Value::Bool(r.is_truthy()))
            }
            Expr::Binary { op: BinaryOp::Coalesce, left, right, .. } => {
                let l = self.eval_expr(left, env)?;
                if l.is_nil() {
                    self.eval_expr(right, env)
                } else {
                    Ok(l)
                }
            }
            Expr::Binary { op, left, right, span } => {
                let l = self.eval_expr(left, env)?;
                let r = self.eval_expr(right, env)?;
                self.apply_binary(*op, l, r, *span)
            }

            Expr::Range { start, end, inclusive, span } => {
                let s = self.eval_expr(start, env)?;
                let e = self.eval_expr(end, env)?;
                match (s, e) {
                    (Value::Int(a), Value::Int(b)) => {
                        Ok(Value::Range { start: a, end: b, inclusive: *inclusive })
                    }
                    _ => Err(self.error("range bounds must be integers", *span)),
                }
            }

            Expr::Ternary { cond, then_expr, else_expr, .. } => {
                let c = self.eval_expr(cond, env)?;
                if c.is_truthy() {
                    self.eval_expr(then_expr, env)
                } else {
                    self.eval_expr(else_expr, env)
                }
            }

            Expr::Index { target, index, span } => {
                let container = self.eval_expr(target, env)?;
                let index = self.eval_expr(index, env)?;
                self.index_get(&container, &index, *span)
            }

            Expr::Field { target, name, optional, span } => {
                let container = self.eval_expr(target, env)?;
                if *optional && container.is_nil() {
                    return Ok(Value::Nil);
                }
                match &container {
                    Value::Map(_) => Ok(container.map_get(name)),
                    other => Err(self.error(
                        format!("field access expects map, got {}", other.type_name()),
                        *span,
                    )),
                }
            }

            Expr::MethodCall { target, method, args, span } => {
                self.eval_method_call(target, method, args, env, *span)
            }

            Expr::Call { callee, args, span } => {
                let callee_value = self.eval_expr(callee, env)?;
                let argv = self.eval_args(args, env)?;
                self.call_callable(&callee_value, argv, *span)
            }

            Expr::FuncLit { decl, .. } => Ok(Value::Func(Rc::new(Function {
                decl: decl.clone(),
                closure: env.clone(),
                source: self.current_source(),
            }))),

            Expr::Match { scrutinee, arms, default, span } => {
                self.eval_match(scrutinee, arms, default.as_deref(), env, *span)
            }

            Expr::Await { expr, span } => {
                let v = self.eval_expr(expr, env)?;
                match v {
                    Value::Promise(p) => self.wait_promise(&p, *span),
                    other => Ok(other),
                }
            }
        }
    }

    pub(crate) fn index_get(
        &mut self,
        container: &Value,
        index: &Value,
        span: Span,
    ) -> Result<Value, Control> {
        match (container, index) {
            (Value::List(items), Value::Int(i)) => {
                let items = items.borrow();
                if *i < 0 || *i as usize >= items.len() {
                    return Err(self.error(
                        format!("list index {} out of range (len {})", i, items.len()),
                        span,
                    ));
                }
                Ok(items[*i as usize].clone())
            }
            (Value::Map(_), Value::Str(key)) => Ok(container.map_get(key)),
            _ => Err(self.error(
                format!(
                    "indexing expects list[int] or map[string], got {}[{}]",
                    container.type_name(),
                    index.type_name()
                ),
                span,
            )),
        }
    }

    /// Evaluate call arguments left-to-right, splicing spreads.
    pub(crate) fn eval_args(
        &mut self,
        args: &[Expr],
        env: &Rc<Env>,
    ) -> Result<Vec<Value>, Control> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Expr::Spread { expr, span } => {
                    let v = self.eval_expr(expr, env)?;
                    match &v {
                        Value::List(l) => out.extend(l.borrow().iter().cloned()),
                        other => {
                            return Err(self.error(
                                format!("spread expects a list, got {}", other.type_name()),
                                *span,
                            ));
                        }
                    }
                }
                _ => out.push(self.eval_expr(arg, env)?),
            }
        }
        Ok(out)
    }

    /// Call any callable value. Async functions enqueue a task and
    /// return its promise immediately.
    pub(crate) fn call_callable(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Control> {
        match callee {
            Value::Native(nf) => {
                let nf = nf.clone();
                self.frames.push(Frame {
                    func: nf.name.clone(),
                    source: self.current_source(),
                    line: span.line,
                    col: span.col,
                });
                let result = (nf.f)(self, &args);
                let result = match result {
                    Ok(v) => Ok(v),
                    Err(e) => {
                        let msg = if e.message.is_empty() {
                            "native call failed".to_string()
                        } else {
                            e.message
                        };
                        Err(self.error(msg, span))
                    }
                };
                self.frames.pop();
                result
            }
            Value::Func(f) => {
                if f.decl.is_async {
                    let promise = self.new_promise();
                    self.tasks.push_back(crate::event_loop::scheduler::Task {
                        func: f.clone(),
                        args,
                        promise: promise.clone(),
                    });
                    return Ok(Value::Promise(promise));
                }
                self.invoke_function(f, args, span)
            }
            other => Err(self.error(
                format!("attempted to call non-function ({})", other.type_name()),
                span,
            )),
        }
    }

    /// Synchronously run a script function: bind parameters (including
    /// defaults and the rest list), execute the body, map `return` to a
    /// value. Generator calls collect their yields into a list.
    pub(crate) fn invoke_function(
        &mut self,
        f: &Rc<Function>,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Control> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.error("maximum call depth exceeded", span));
        }

        let params = &f.decl.params;
        let required = params.iter().filter(|p| p.default.is_none()).count();
        if args.len() < required || (args.len() > params.len() && f.decl.rest.is_none()) {
            return Err(self.error(
                format!(
                    "wrong argument count: {} expects {}{} argument(s), got {}",
                    f.name(),
                    if required == params.len() { "" } else { "at least " },
                    required,
                    args.len()
                ),
                span,
            ));
        }

        let call_env = self.new_env(Some(f.closure.clone()));

        self.frames.push(Frame {
            func: f.name().to_string(),
            source: self.current_source(),
            line: span.line,
            col: span.col,
        });
        self.source_stack.push(f.source.clone());

        let result = (|| -> Result<Value, Control> {
            for (i, param) in params.iter().enumerate() {
                let value = match args.get(i) {
                    Some(v) => v.clone(),
                    None => match &param.default {
                        Some(default) => self.eval_expr(default, &call_env)?,
                        None => Value::Nil,
                    },
                };
                call_env.define(&param.name, value, false).map_err(|_| {
                    self.error(format!("cannot redeclare constant '{}'", param.name), span)
                })?;
            }
            if let Some(rest) = &f.decl.rest {
                let extra: Vec<Value> = args.iter().skip(params.len()).cloned().collect();
                let rest_list = self.new_list(extra);
                call_env.define(rest, rest_list, false).map_err(|_| {
                    self.error(format!("cannot redeclare constant '{}'", rest), span)
                })?;
            }

            if f.decl.is_generator {
                self.yield_stack.push(Vec::new());
                let r = self.exec_block_in(&f.decl.body, &call_env);
                let yielded = self.yield_stack.pop().unwrap_or_default();
                match r {
                    Ok(()) | Err(Control::Return(_)) => Ok(self.new_list(yielded)),
                    Err(Control::Break(s)) => Err(self.error("'break' outside of a loop", s)),
                    Err(Control::Continue(s)) => {
                        Err(self.error("'continue' outside of a loop", s))
                    }
                    Err(other) => Err(other),
                }
            } else {
                match self.exec_block_in(&f.decl.body, &call_env) {
                    Ok(()) => Ok(Value::Nil),
                    Err(Control::Return(v)) => Ok(v),
                    Err(Control::Break(s)) => Err(self.error("'break' outside of a loop", s)),
                    Err(Control::Continue(s)) => {
                        Err(self.error("'continue' outside of a loop", s))
                    }
                    Err(other) => Err(other),
                }
            }
        })();

        self.source_stack.pop();
        self.frames.pop();
        result
    }
}
