//! Row-level expression evaluator.
//!
//! Semantics follow SQL: comparisons and arithmetic propagate null, boolean
//! connectives use three-valued logic, and `CASE` treats a null condition as
//! not matched. Columns are resolved through a caller-supplied closure so the
//! evaluator stays independent of the row representation.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use medallion_types::{MedallionError, Result};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::dtype::{display_value, float_value, DataType};

/// Evaluate `expr`, resolving column paths with `resolve`.
///
/// `resolve` returns `None` when the column does not exist, which is an
/// evaluation error; a column holding null returns `Some(Value::Null)`.
pub fn evaluate(expr: &Expr, resolve: &dyn Fn(&str) -> Option<Value>) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(path) => resolve(path)
            .ok_or_else(|| MedallionError::EvalError(format!("column '{path}' not found"))),
        Expr::Unary { op, expr } => {
            let v = evaluate(expr, resolve)?;
            match op {
                UnaryOp::Not => Ok(as_bool(&v)?.map(|b| Value::Bool(!b)).unwrap_or(Value::Null)),
                UnaryOp::Neg => negate(&v),
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                let l = as_bool(&evaluate(left, resolve)?)?;
                if l == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let r = as_bool(&evaluate(right, resolve)?)?;
                Ok(match (l, r) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            BinaryOp::Or => {
                let l = as_bool(&evaluate(left, resolve)?)?;
                if l == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let r = as_bool(&evaluate(right, resolve)?)?;
                Ok(match (l, r) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            _ => {
                let l = evaluate(left, resolve)?;
                let r = evaluate(right, resolve)?;
                binary(*op, &l, &r)
            }
        },
        Expr::IsNull { expr, negated } => {
            let v = evaluate(expr, resolve)?;
            Ok(Value::Bool(v.is_null() != *negated))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let v = evaluate(expr, resolve)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in list {
                let candidate = evaluate(item, resolve)?;
                if candidate.is_null() {
                    saw_null = true;
                    continue;
                }
                if compare(&v, &candidate)? == Some(Ordering::Equal) {
                    return Ok(Value::Bool(!*negated));
                }
            }
            if saw_null {
                Ok(Value::Null)
            } else {
                Ok(Value::Bool(*negated))
            }
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let v = evaluate(expr, resolve)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            let re = like_regex(pattern)?;
            Ok(Value::Bool(re.is_match(&display_value(&v)) != *negated))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = evaluate(expr, resolve)?;
            let lo = evaluate(low, resolve)?;
            let hi = evaluate(high, resolve)?;
            let ge = compare(&v, &lo)?.map(|o| o != Ordering::Less);
            let le = compare(&v, &hi)?.map(|o| o != Ordering::Greater);
            let within = match (ge, le) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            };
            Ok(within
                .map(|b| Value::Bool(b != *negated))
                .unwrap_or(Value::Null))
        }
        Expr::Case {
            branches,
            otherwise,
        } => {
            for (cond, value) in branches {
                if as_bool(&evaluate(cond, resolve)?)? == Some(true) {
                    return evaluate(value, resolve);
                }
            }
            match otherwise {
                Some(e) => evaluate(e, resolve),
                None => Ok(Value::Null),
            }
        }
        Expr::Function { name, args } => {
            let values = args
                .iter()
                .map(|a| evaluate(a, resolve))
                .collect::<Result<Vec<_>>>()?;
            call_function(name, &values)
        }
    }
}

/// Interpret a value as a SQL boolean. Null is unknown; anything else is a type error.
pub fn as_bool(v: &Value) -> Result<Option<bool>> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(MedallionError::EvalError(format!(
            "expected boolean, got {} value {other}",
            DataType::of(other)
        ))),
    }
}

/// SQL comparison. Returns `None` when either side is null.
pub fn compare(a: &Value, b: &Value) -> Result<Option<Ordering>> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(None),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Ok(Some(x.cmp(&y)));
            }
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            Ok(x.partial_cmp(&y))
        }
        (Value::String(x), Value::String(y)) => Ok(Some(x.cmp(y))),
        (Value::Bool(x), Value::Bool(y)) => Ok(Some(x.cmp(y))),
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_)) => {
            Ok(if a == b { Some(Ordering::Equal) } else { None })
        }
        _ => Err(type_mismatch("compare", a, b)),
    }
}

/// Total ordering over values used for sorting: nulls first, then booleans,
/// numbers, strings, and nested values by their JSON text.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match compare(a, b) {
            Ok(Some(o)) => o,
            _ => a.to_string().cmp(&b.to_string()),
        },
        o => o,
    }
}

fn type_mismatch(op: &str, a: &Value, b: &Value) -> MedallionError {
    MedallionError::EvalError(format!(
        "cannot {op} {} and {}",
        DataType::of(a),
        DataType::of(b)
    ))
}

fn negate(v: &Value) -> Result<Value> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(i
                .checked_neg()
                .map(Value::from)
                .unwrap_or_else(|| float_value(-(i as f64)))),
            None => Ok(float_value(-n.as_f64().unwrap_or(f64::NAN))),
        },
        other => Err(MedallionError::EvalError(format!(
            "cannot negate {} value",
            DataType::of(other)
        ))),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt
        | BinaryOp::GtEq => {
            let ord = compare(l, r)?;
            Ok(match ord {
                None if !l.is_null() && !r.is_null() => {
                    // Unordered but non-null: nested values that differ, or NaN.
                    Value::Bool(op == BinaryOp::NotEq)
                }
                None => Value::Null,
                Some(o) => Value::Bool(match op {
                    BinaryOp::Eq => o == Ordering::Equal,
                    BinaryOp::NotEq => o != Ordering::Equal,
                    BinaryOp::Lt => o == Ordering::Less,
                    BinaryOp::LtEq => o != Ordering::Greater,
                    BinaryOp::Gt => o == Ordering::Greater,
                    _ => o != Ordering::Less,
                }),
            })
        }
        BinaryOp::Concat => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::String(format!(
                "{}{}",
                display_value(l),
                display_value(r)
            )))
        }
        _ => arithmetic(op, l, r),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    let (x, y) = match (l, r) {
        (Value::Null, _) | (_, Value::Null) => return Ok(Value::Null),
        (Value::Number(x), Value::Number(y)) => (x, y),
        _ => return Err(type_mismatch("apply arithmetic to", l, r)),
    };

    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Mod => {
                if b == 0 {
                    return Ok(Value::Null);
                }
                a.checked_rem(b)
            }
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let a = x.as_f64().unwrap_or(f64::NAN);
    let b = y.as_f64().unwrap_or(f64::NAN);
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Ok(Value::Null);
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Ok(Value::Null);
            }
            a % b
        }
        _ => {
            return Err(MedallionError::EvalError(format!(
                "{op:?} is not an arithmetic operator"
            )))
        }
    };
    Ok(float_value(v))
}

/// Translate a SQL `LIKE` pattern (`%`, `_`) into an anchored regex.
fn like_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push_str("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| MedallionError::EvalError(format!("invalid LIKE pattern: {e}")))
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(MedallionError::EvalError(format!(
            "function {name}() takes {} argument(s), got {}",
            if min == max {
                min.to_string()
            } else {
                format!("{min} to {max}")
            },
            args.len()
        )));
    }
    Ok(())
}

fn number_arg(name: &str, v: &Value) -> Result<Option<f64>> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        other => Err(MedallionError::EvalError(format!(
            "function {name}() expects a number, got {}",
            DataType::of(other)
        ))),
    }
}

fn string_fn(name: &str, args: &[Value], f: impl Fn(&str) -> Value) -> Result<Value> {
    arity(name, args, 1, 1)?;
    match &args[0] {
        Value::Null => Ok(Value::Null),
        v => Ok(f(&display_value(v))),
    }
}

/// Names of the scalar functions understood by the evaluator.
pub const SCALAR_FUNCTIONS: &[&str] = &[
    "lower", "upper", "trim", "length", "abs", "round", "floor", "ceil", "sqrt", "coalesce",
    "concat", "substring", "cast",
];

fn call_function(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "lower" => string_fn(name, args, |s| Value::String(s.to_lowercase())),
        "upper" => string_fn(name, args, |s| Value::String(s.to_uppercase())),
        "trim" => string_fn(name, args, |s| Value::String(s.trim().to_string())),
        "length" => string_fn(name, args, |s| Value::from(s.chars().count() as i64)),
        "abs" => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::Number(n) if n.as_i64().is_some() => {
                    let i = n.as_i64().unwrap_or_default();
                    Ok(i.checked_abs()
                        .map(Value::from)
                        .unwrap_or_else(|| float_value((i as f64).abs())))
                }
                v => Ok(number_arg(name, v)?
                    .map(|f| float_value(f.abs()))
                    .unwrap_or(Value::Null)),
            }
        }
        "round" => {
            arity(name, args, 1, 2)?;
            let Some(x) = number_arg(name, &args[0])? else {
                return Ok(Value::Null);
            };
            let digits = match args.get(1) {
                Some(d) => number_arg(name, d)?.unwrap_or(0.0) as i32,
                None => 0,
            };
            let scale = 10f64.powi(digits);
            let rounded = (x * scale).round() / scale;
            if digits <= 0 && args[0].as_i64().is_some() {
                Ok(Value::from(rounded as i64))
            } else {
                Ok(float_value(rounded))
            }
        }
        "floor" | "ceil" => {
            arity(name, args, 1, 1)?;
            if let Some(i) = args[0].as_i64() {
                return Ok(Value::from(i));
            }
            Ok(match number_arg(name, &args[0])? {
                Some(f) => {
                    let r = if name == "floor" { f.floor() } else { f.ceil() };
                    DataType::Integer.cast(&float_value(r))
                }
                None => Value::Null,
            })
        }
        "sqrt" => {
            arity(name, args, 1, 1)?;
            Ok(match number_arg(name, &args[0])? {
                Some(f) if f >= 0.0 => float_value(f.sqrt()),
                _ => Value::Null,
            })
        }
        "coalesce" => {
            if args.is_empty() {
                return Err(MedallionError::EvalError(
                    "function coalesce() needs at least one argument".into(),
                ));
            }
            Ok(args
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null))
        }
        "concat" => {
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            Ok(Value::String(args.iter().map(display_value).collect()))
        }
        "substring" => {
            arity(name, args, 2, 3)?;
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            let s: Vec<char> = display_value(&args[0]).chars().collect();
            let pos = number_arg(name, &args[1])?.unwrap_or(1.0) as i64;
            // 1-based; negative positions count from the end.
            let start = if pos > 0 {
                (pos - 1) as usize
            } else if pos < 0 {
                s.len().saturating_sub(pos.unsigned_abs() as usize)
            } else {
                0
            };
            let len = match args.get(2) {
                Some(l) => number_arg(name, l)?.unwrap_or(0.0).max(0.0) as usize,
                None => usize::MAX,
            };
            Ok(Value::String(
                s.iter().skip(start).take(len).collect::<String>(),
            ))
        }
        "cast" => {
            arity(name, args, 2, 2)?;
            let Value::String(ty) = &args[1] else {
                return Err(MedallionError::EvalError(
                    "cast() target type must be a type name".into(),
                ));
            };
            let dtype = DataType::parse(ty).map_err(|e| MedallionError::EvalError(e.to_string()))?;
            Ok(dtype.cast(&args[0]))
        }
        other => Err(MedallionError::EvalError(format!(
            "unknown function '{other}'"
        ))),
    }
}
