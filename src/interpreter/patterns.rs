//! Pattern Matching
//!
//! `match (e) { case P if G: V; … default: D }`. Patterns are tried top
//! to bottom; the first pattern that matches (and whose guard, if any,
//! is truthy in the scope of the pattern's bindings) selects the arm.
//! No match and no default is a runtime error.

use std::rc::Rc;

use crate::ast::types::{Expr, MatchArm, Pattern, Span};
use crate::interpreter::env::Env;
use crate::interpreter::errors::Control;
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    pub(crate) fn eval_match(
        &mut self,
        scrutinee: &Expr,
        arms: &[MatchArm],
        default: Option<&Expr>,
        env: &Rc<Env>,
        span: Span,
    ) -> Result<Value, Control> {
        let value = self.eval_expr(scrutinee, env)?;

        for arm in arms {
            let mut bindings = Vec::new();
            if !self.match_pattern(&arm.pattern, &value, &mut bindings, env)? {
                continue;
            }

            let arm_env = self.new_env(Some(env.clone()));
            for (name, bound) in bindings {
                arm_env.define(&name, bound, false).map_err(|_| {
                    self.error(format!("cannot redeclare constant '{}'", name), arm.span)
                })?;
            }

            if let Some(guard) = &arm.guard {
                let g = self.eval_expr(guard, &arm_env)?;
                if !g.is_truthy() {
                    continue;
                }
            }

            return self.eval_expr(&arm.value, &arm_env);
        }

        match default {
            Some(d) => self.eval_expr(d, env),
            None => Err(self.error("no pattern matched and no default case", span)),
        }
    }

    fn match_pattern(
        &mut self,
        pattern: &Pattern,
        value: &Value,
        bindings: &mut Vec<(String, Value)>,
        env: &Rc<Env>,
    ) -> Result<bool, Control> {
        match pattern {
            Pattern::Wildcard => Ok(true),
            Pattern::Binding(name) => {
                bindings.push((name.clone(), value.clone()));
                Ok(true)
            }
            Pattern::Literal(lit) => {
                let lit_value = self.eval_expr(lit, env)?;
                Ok(lit_value.eq_value(value))
            }
            Pattern::List(patterns) => {
                let items = match value {
                    Value::List(l) => l.borrow().clone(),
                    _ => return Ok(false),
                };
                if items.len() != patterns.len() {
                    return Ok(false);
                }
                for (p, v) in patterns.iter().zip(items.iter()) {
                    if !self.match_pattern(p, v, bindings, env)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Pattern::Map(entries) => {
                if !matches!(value, Value::Map(_)) {
                    return Ok(false);
                }
                for (key, p) in entries {
                    if !value.map_has(key) {
                        return Ok(false);
                    }
                    let entry = value.map_get(key);
                    if !self.match_pattern(p, &entry, bindings, env)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}
