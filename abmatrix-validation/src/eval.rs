//! Tree-walking interpreter for parsed rules.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::expr::{BinaryOp, Expr, UnaryOp};
use crate::functions::FunctionRegistry;
use crate::rule::RuleError;
use crate::value::{Context, ContextValue};

// Scope

/// Variables visible to a rule: test constants, then special constants,
/// then the request context.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    constants: Option<&'a BTreeMap<String, ContextValue>>,
    special_constants: Option<&'a BTreeMap<String, ContextValue>>,
    context: &'a Context,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a Context) -> Self {
        Self {
            constants: None,
            special_constants: None,
            context,
        }
    }

    pub fn with_constants(
        mut self,
        constants: &'a BTreeMap<String, ContextValue>,
        special_constants: &'a BTreeMap<String, ContextValue>,
    ) -> Self {
        self.constants = Some(constants);
        self.special_constants = Some(special_constants);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&'a ContextValue> {
        self.constants
            .and_then(|c| c.get(name))
            .or_else(|| self.special_constants.and_then(|c| c.get(name)))
            .or_else(|| self.context.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Every name defined in any layer.
    pub fn names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.context.keys().map(str::to_string).collect();
        for layer in [self.constants, self.special_constants].into_iter().flatten() {
            names.extend(layer.keys().cloned());
        }
        names
    }
}

// Coercions

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

/// Numbers, and strings that parse as numbers.
pub(crate) fn as_number(value: &ContextValue) -> Option<Number> {
    match value {
        ContextValue::Int(i) => Some(Number::Int(*i)),
        ContextValue::Float(f) => Some(Number::Float(*f)),
        ContextValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .map(Number::Int)
                .or_else(|_| s.parse::<f64>().map(Number::Float))
                .ok()
        }
        _ => None,
    }
}

fn is_numeric(value: &ContextValue) -> bool {
    matches!(value, ContextValue::Int(_) | ContextValue::Float(_))
}

/// Null is false and strings are true only when they read "true".
pub(crate) fn to_bool(value: &ContextValue) -> Result<bool, String> {
    match value {
        ContextValue::Bool(b) => Ok(*b),
        ContextValue::Null => Ok(false),
        ContextValue::String(s) => Ok(s.trim().eq_ignore_ascii_case("true")),
        other => Err(format!("cannot coerce {} to boolean", other.kind())),
    }
}

fn numeric_cmp(a: Number, b: Number) -> Option<Ordering> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => Some(x.cmp(&y)),
        (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
    }
}

fn coerce_pair(a: &ContextValue, b: &ContextValue) -> Result<(Number, Number), String> {
    let left = as_number(a).ok_or_else(|| format!("cannot coerce '{a}' to a number"))?;
    let right = as_number(b).ok_or_else(|| format!("cannot coerce '{b}' to a number"))?;
    Ok((left, right))
}

pub(crate) fn equals(a: &ContextValue, b: &ContextValue) -> Result<bool, String> {
    use ContextValue as V;
    match (a, b) {
        (V::Null, V::Null) => Ok(true),
        (V::Null, _) | (_, V::Null) => Ok(false),
        _ if is_numeric(a) || is_numeric(b) => {
            let (left, right) = coerce_pair(a, b)?;
            Ok(numeric_cmp(left, right) == Some(Ordering::Equal))
        }
        (V::Bool(_), _) | (_, V::Bool(_)) => Ok(to_bool(a)? == to_bool(b)?),
        (V::String(x), V::String(y)) => Ok(x == y),
        (V::List(_), V::List(_)) | (V::Map(_), V::Map(_)) => Ok(a == b),
        _ => Err(format!("cannot compare {} with {}", a.kind(), b.kind())),
    }
}

/// Equality that treats incomparable values as different.
pub(crate) fn loosely_equal(a: &ContextValue, b: &ContextValue) -> bool {
    equals(a, b).unwrap_or(false)
}

fn compare(a: &ContextValue, b: &ContextValue) -> Result<Option<Ordering>, String> {
    use ContextValue as V;
    match (a, b) {
        (V::Null, _) | (_, V::Null) => Ok(None),
        _ if is_numeric(a) || is_numeric(b) => {
            let (left, right) = coerce_pair(a, b)?;
            Ok(numeric_cmp(left, right))
        }
        (V::String(x), V::String(y)) => Ok(Some(x.cmp(y))),
        _ => Err(format!("cannot order {} and {}", a.kind(), b.kind())),
    }
}

fn arithmetic(op: BinaryOp, a: &ContextValue, b: &ContextValue) -> Result<ContextValue, String> {
    let zero = ContextValue::Int(0);
    let a = if a.is_null() { &zero } else { a };
    let b = if b.is_null() { &zero } else { b };
    let (left, right) = coerce_pair(a, b)?;

    if op == BinaryOp::Divide {
        return Ok(ContextValue::Float(left.as_f64() / right.as_f64()));
    }

    if let (Number::Int(x), Number::Int(y)) = (left, right) {
        let result = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Subtract => x.checked_sub(y),
            BinaryOp::Multiply => x.checked_mul(y),
            BinaryOp::Modulo if y == 0 => return Err("division by zero".to_string()),
            BinaryOp::Modulo => x.checked_rem(y),
            _ => None,
        };
        return result
            .map(ContextValue::Int)
            .ok_or_else(|| "integer overflow".to_string());
    }

    let (x, y) = (left.as_f64(), right.as_f64());
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Subtract => x - y,
        BinaryOp::Multiply => x * y,
        _ => x % y,
    };
    Ok(ContextValue::Float(result))
}

fn is_empty(value: &ContextValue) -> bool {
    match value {
        ContextValue::Null => true,
        ContextValue::String(s) => s.is_empty(),
        ContextValue::List(items) => items.is_empty(),
        ContextValue::Map(entries) => entries.is_empty(),
        _ => false,
    }
}

// Interpreter

pub(crate) struct Interpreter<'a> {
    pub(crate) functions: &'a FunctionRegistry,
    pub(crate) scope: Scope<'a>,
    pub(crate) rule: &'a str,
}

impl Interpreter<'_> {
    fn fail(&self, message: String) -> RuleError {
        RuleError::Evaluation {
            rule: self.rule.to_string(),
            message,
        }
    }

    pub(crate) fn eval_bool(&self, expr: &Expr) -> Result<bool, RuleError> {
        let value = self.eval(expr)?;
        match &value {
            ContextValue::Bool(b) => Ok(*b),
            ContextValue::Null | ContextValue::String(_) => {
                to_bool(&value).map_err(|e| self.fail(e))
            }
            other => Err(RuleError::NonBoolean {
                rule: self.rule.to_string(),
                kind: other.kind(),
            }),
        }
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<ContextValue, RuleError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Identifier(name) => {
                self.scope
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| RuleError::UndefinedVariable {
                        rule: self.rule.to_string(),
                        name: name.clone(),
                    })
            }
            Expr::Property(base, name) => match self.eval(base)? {
                ContextValue::Map(mut entries) => {
                    Ok(entries.remove(name).unwrap_or(ContextValue::Null))
                }
                ContextValue::Null => Ok(ContextValue::Null),
                other => Err(self.fail(format!(
                    "cannot read property '{name}' of {}",
                    other.kind()
                ))),
            },
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                match base {
                    ContextValue::List(mut items) => {
                        let Some(Number::Int(i)) = as_number(&index) else {
                            return Err(self.fail(format!("invalid list index '{index}'")));
                        };
                        if i < 0 || i as usize >= items.len() {
                            return Ok(ContextValue::Null);
                        }
                        Ok(items.swap_remove(i as usize))
                    }
                    ContextValue::Map(mut entries) => {
                        let key = match index {
                            ContextValue::String(s) => s,
                            other => other.to_string(),
                        };
                        Ok(entries.remove(&key).unwrap_or(ContextValue::Null))
                    }
                    ContextValue::Null => Ok(ContextValue::Null),
                    other => Err(self.fail(format!("cannot index into {}", other.kind()))),
                }
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(ContextValue::Bool(
                        !to_bool(&value).map_err(|e| self.fail(e))?,
                    )),
                    UnaryOp::Empty => Ok(ContextValue::Bool(is_empty(&value))),
                    UnaryOp::Negate => {
                        arithmetic(BinaryOp::Subtract, &ContextValue::Int(0), &value)
                            .map_err(|e| self.fail(e))
                    }
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                let result = match op {
                    BinaryOp::Equal => equals(&left, &right).map(ContextValue::Bool),
                    BinaryOp::NotEqual => equals(&left, &right).map(|eq| ContextValue::Bool(!eq)),
                    BinaryOp::Less => ordered(&left, &right, |o| o == Ordering::Less),
                    BinaryOp::Greater => ordered(&left, &right, |o| o == Ordering::Greater),
                    BinaryOp::LessEqual => ordered(&left, &right, |o| o != Ordering::Greater),
                    BinaryOp::GreaterEqual => ordered(&left, &right, |o| o != Ordering::Less),
                    arith => arithmetic(*arith, &left, &right),
                };
                result.map_err(|e| self.fail(e))
            }
            Expr::And(left, right) => {
                if !self.eval_operand(left)? {
                    return Ok(ContextValue::Bool(false));
                }
                Ok(ContextValue::Bool(self.eval_operand(right)?))
            }
            Expr::Or(left, right) => {
                if self.eval_operand(left)? {
                    return Ok(ContextValue::Bool(true));
                }
                Ok(ContextValue::Bool(self.eval_operand(right)?))
            }
            Expr::Conditional(cond, then, otherwise) => {
                if self.eval_operand(cond)? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call { function, args } => {
                let Some(callable) = self.functions.get(function) else {
                    return Err(RuleError::UnknownFunction {
                        rule: self.rule.to_string(),
                        name: function.clone(),
                    });
                };
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                callable(&values).map_err(|e| self.fail(e))
            }
        }
    }

    fn eval_operand(&self, expr: &Expr) -> Result<bool, RuleError> {
        let value = self.eval(expr)?;
        to_bool(&value).map_err(|e| self.fail(e))
    }
}

fn ordered(
    left: &ContextValue,
    right: &ContextValue,
    test: impl Fn(Ordering) -> bool,
) -> Result<ContextValue, String> {
    Ok(ContextValue::Bool(compare(left, right)?.is_some_and(test)))
}
