//! Operator Semantics
//!
//! Binary and unary operator evaluation. `+` concatenates when either
//! side is a string; arithmetic widens to float when either operand is a
//! float and stays integral otherwise; division and modulo by zero are
//! runtime errors; ordering requires two numbers or two strings.

use crate::ast::types::{BinaryOp, Span, UnaryOp};
use crate::interpreter::errors::Control;
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    pub(crate) fn apply_unary(
        &mut self,
        op: UnaryOp,
        value: Value,
        span: Span,
    ) -> Result<Value, Control> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
            UnaryOp::Neg => match value {
                Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(self.error(
                    format!("type error: unary '-' expects a number, got {}", other.type_name()),
                    span,
                )),
            },
        }
    }

    pub(crate) fn apply_binary(
        &mut self,
        op: BinaryOp,
        a: Value,
        b: Value,
        span: Span,
    ) -> Result<Value, Control> {
        match op {
            BinaryOp::Add => self.op_add(a, b, span),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                self.op_arith(op, a, b, span)
            }
            BinaryOp::Eq => Ok(Value::Bool(a.eq_value(&b))),
            BinaryOp::Ne => Ok(Value::Bool(!a.eq_value(&b))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                self.op_compare(op, a, b, span)
            }
            // Short-circuit forms are handled by the evaluator; reaching
            // here means both sides were already evaluated.
            BinaryOp::And => Ok(Value::Bool(a.is_truthy() && b.is_truthy())),
            BinaryOp::Or => Ok(Value::Bool(a.is_truthy() || b.is_truthy())),
            BinaryOp::Coalesce => Ok(if a.is_nil() { b } else { a }),
        }
    }

    fn op_add(&mut self, a: Value, b: Value, span: Span) -> Result<Value, Control> {
        match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 + y)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + *y as f64)),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
            _ if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) => {
                let mut out = a.stringify();
                out.push_str(&b.stringify());
                Ok(Value::from(out))
            }
            _ => Err(self.error(
                format!(
                    "type error: '+' expects numbers or strings, got {} and {}",
                    a.type_name(),
                    b.type_name()
                ),
                span,
            )),
        }
    }

    fn op_arith(
        &mut self,
        op: BinaryOp,
        a: Value,
        b: Value,
        span: Span,
    ) -> Result<Value, Control> {
        // Two ints stay integral; otherwise widen to float.
        if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
            let (x, y) = (*x, *y);
            return match op {
                BinaryOp::Sub => Ok(Value::Int(x.wrapping_sub(y))),
                BinaryOp::Mul => Ok(Value::Int(x.wrapping_mul(y))),
                BinaryOp::Div => {
                    if y == 0 {
                        Err(self.error("division by zero", span))
                    } else {
                        Ok(Value::Int(x.wrapping_div(y)))
                    }
                }
                BinaryOp::Mod => {
                    if y == 0 {
                        Err(self.error("mod by zero", span))
                    } else {
                        Ok(Value::Int(x.wrapping_rem(y)))
                    }
                }
                _ => unreachable!(),
            };
        }

        let to_f64 = |v: &Value| match v {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        };
        let (x, y) = match (to_f64(&a), to_f64(&b)) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(self.error(
                    format!(
                        "type error: arithmetic expects numbers, got {} and {}",
                        a.type_name(),
                        b.type_name()
                    ),
                    span,
                ));
            }
        };

        match op {
            BinaryOp::Sub => Ok(Value::Float(x - y)),
            BinaryOp::Mul => Ok(Value::Float(x * y)),
            BinaryOp::Div => {
                if y == 0.0 {
                    Err(self.error("division by zero", span))
                } else {
                    Ok(Value::Float(x / y))
                }
            }
            BinaryOp::Mod => {
                if y == 0.0 {
                    Err(self.error("mod by zero", span))
                } else {
                    Ok(Value::Float(x % y))
                }
            }
            _ => unreachable!(),
        }
    }

    fn op_compare(
        &mut self,
        op: BinaryOp,
        a: Value,
        b: Value,
        span: Span,
    ) -> Result<Value, Control> {
        let ordering = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
            (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
            (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
            (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
            (Value::Str(x), Value::Str(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
            _ => {
                return Err(self.error(
                    "type error: comparisons require two numbers or two strings",
                    span,
                ));
            }
        };

        let ordering = match ordering {
            Some(o) => o,
            // NaN comparisons are false.
            None => return Ok(Value::Bool(false)),
        };

        let result = match op {
            BinaryOp::Lt => ordering.is_lt(),
            BinaryOp::Le => ordering.is_le(),
            BinaryOp::Gt => ordering.is_gt(),
            BinaryOp::Ge => ordering.is_ge(),
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }
}
