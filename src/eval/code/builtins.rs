//! The curated numerical scope available to evaluated code.
//!
//! Top-level names, the `math` module surface and the `numpy` surface all
//! dispatch through [`call`]. Everything here is pure and side-effect free.

use crate::error::EvalError;
use crate::eval::expr::round_half_even;

use super::interp::{Value, iterate};

/// Names pre-bound at the top level of every execution scope.
pub const TOP_LEVEL: &[&str] = &[
    "range", "len", "sin", "cos", "tan", "sqrt", "exp", "log", "log10", "log2", "floor", "ceil",
    "round", "sum", "mean", "median", "std", "var", "min", "max", "power", "square", "abs",
    "sign", "clip", "arcsin", "arccos", "arctan", "arctan2", "sinh", "cosh", "tanh",
];

const MATH_FUNCS: &[&str] = &[
    "sqrt", "pow", "exp", "log", "log10", "log2", "sin", "cos", "tan", "asin", "acos", "atan",
    "atan2", "sinh", "cosh", "tanh", "ceil", "floor", "trunc", "degrees", "radians", "fabs",
];

const NUMPY_FUNCS: &[&str] = &[
    "mean", "median", "std", "var", "sum", "min", "max", "sqrt", "exp", "log", "log10", "log2",
    "power", "square", "abs", "sign", "clip", "sin", "cos", "tan", "arcsin", "arccos", "arctan",
    "arctan2", "sinh", "cosh", "tanh", "floor", "ceil", "round",
];

/// Resolves an attribute of one of the two allowed modules.
pub fn module_attr(module: &str, attr: &str) -> Result<Value, EvalError> {
    let constant = |name: &str| -> Option<f64> {
        match name {
            "pi" => Some(std::f64::consts::PI),
            "e" => Some(std::f64::consts::E),
            "tau" => Some(std::f64::consts::TAU),
            "inf" => Some(f64::INFINITY),
            "nan" => Some(f64::NAN),
            _ => None,
        }
    };
    if let Some(value) = constant(attr) {
        return Ok(Value::Float(value));
    }
    let known = match module {
        "math" => MATH_FUNCS.contains(&attr),
        "numpy" => NUMPY_FUNCS.contains(&attr),
        _ => false,
    };
    if known {
        // The path is interned so bound builtins stay 'static.
        let path = intern_path(module, attr)?;
        Ok(Value::Builtin(path))
    } else {
        Err(EvalError::Evaluation(format!(
            "module '{module}' has no attribute '{attr}'"
        )))
    }
}

fn intern_path(module: &str, attr: &str) -> Result<&'static str, EvalError> {
    macro_rules! paths {
        ($($name:literal),* $(,)?) => {
            match (module, attr) {
                $(
                    ("math", $name) => Ok(concat!("math.", $name)),
                    ("numpy", $name) => Ok(concat!("numpy.", $name)),
                )*
                _ => Err(EvalError::Evaluation(format!(
                    "module '{module}' has no attribute '{attr}'"
                ))),
            }
        };
    }
    paths!(
        "sqrt", "pow", "exp", "log", "log10", "log2", "sin", "cos", "tan", "asin", "acos",
        "atan", "atan2", "sinh", "cosh", "tanh", "ceil", "floor", "trunc", "degrees", "radians",
        "fabs", "mean", "median", "std", "var", "sum", "min", "max", "power", "square", "abs",
        "sign", "clip", "arcsin", "arccos", "arctan", "arctan2", "round",
    )
}

pub fn call(path: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let (module, name) = match path.split_once('.') {
        Some((module, name)) => (module, name),
        None => ("", path),
    };
    match name {
        "range" => builtin_range(&args),
        "len" => builtin_len(&args),
        _ => numeric_call(module, name, args),
    }
}

fn builtin_range(args: &[Value]) -> Result<Value, EvalError> {
    let ints: Vec<i64> = args
        .iter()
        .map(Value::as_index)
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(EvalError::Evaluation(format!(
                "range() takes 1 to 3 arguments, got {}",
                args.len()
            )));
        }
    };
    if step == 0 {
        return Err(EvalError::Evaluation(
            "range() step must not be zero".to_string(),
        ));
    }
    Ok(Value::Range { start, stop, step })
}

fn builtin_len(args: &[Value]) -> Result<Value, EvalError> {
    let [value] = args else {
        return Err(EvalError::Evaluation(format!(
            "len() takes 1 argument, got {}",
            args.len()
        )));
    };
    let len = match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) | Value::Set(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(pairs) => pairs.borrow().len(),
        other => {
            return Err(EvalError::Evaluation(format!(
                "{} has no length",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(len as i64))
}

/// Aggregates accept either one container argument or plain scalars.
fn scalars(name: &str, args: &[Value]) -> Result<Vec<f64>, EvalError> {
    let values = if args.len() == 1 {
        match &args[0] {
            Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::Range { .. } => {
                iterate(&args[0])?
            }
            _ => args.to_vec(),
        }
    } else {
        args.to_vec()
    };
    if values.is_empty() {
        return Err(EvalError::Evaluation(format!(
            "{name}() of an empty sequence"
        )));
    }
    values.iter().map(Value::as_number).collect()
}

fn one(name: &str, args: &[Value]) -> Result<f64, EvalError> {
    let [value] = args else {
        return Err(EvalError::Evaluation(format!(
            "{name}() takes 1 argument, got {}",
            args.len()
        )));
    };
    value.as_number()
}

fn two(name: &str, args: &[Value]) -> Result<(f64, f64), EvalError> {
    let [a, b] = args else {
        return Err(EvalError::Evaluation(format!(
            "{name}() takes 2 arguments, got {}",
            args.len()
        )));
    };
    Ok((a.as_number()?, b.as_number()?))
}

fn domain(cond: bool, msg: &str) -> Result<(), EvalError> {
    if cond {
        Ok(())
    } else {
        Err(EvalError::Evaluation(format!("math domain error: {msg}")))
    }
}

fn numeric_call(module: &str, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let float = |v: f64| Ok(Value::Float(v));
    match name {
        // Aggregates over containers or scalar lists.
        "sum" => float(scalars(name, &args)?.iter().sum()),
        "mean" => {
            let xs = scalars(name, &args)?;
            float(xs.iter().sum::<f64>() / xs.len() as f64)
        }
        "median" => {
            let mut xs = scalars(name, &args)?;
            xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let n = xs.len();
            float(if n % 2 == 1 {
                xs[n / 2]
            } else {
                (xs[n / 2 - 1] + xs[n / 2]) / 2.0
            })
        }
        "std" | "var" => {
            let xs = scalars(name, &args)?;
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64;
            float(if name == "std" { var.sqrt() } else { var })
        }
        "min" | "max" => {
            let xs = scalars(name, &args)?;
            let value = if name == "min" {
                xs.iter().copied().fold(f64::INFINITY, f64::min)
            } else {
                xs.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            };
            float(value)
        }
        // Scalar functions.
        "sqrt" => {
            let x = one(name, &args)?;
            domain(x >= 0.0, "sqrt of a negative number")?;
            float(x.sqrt())
        }
        "pow" | "power" => {
            let (a, b) = two(name, &args)?;
            float(a.powf(b))
        }
        "exp" => float(one(name, &args)?.exp()),
        "log" => {
            let x = one(name, &args)?;
            domain(x > 0.0, "log of a non-positive number")?;
            float(x.ln())
        }
        "log10" => {
            let x = one(name, &args)?;
            domain(x > 0.0, "log10 of a non-positive number")?;
            float(x.log10())
        }
        "log2" => {
            let x = one(name, &args)?;
            domain(x > 0.0, "log2 of a non-positive number")?;
            float(x.log2())
        }
        "sin" => float(one(name, &args)?.sin()),
        "cos" => float(one(name, &args)?.cos()),
        "tan" => float(one(name, &args)?.tan()),
        "asin" | "arcsin" => {
            let x = one(name, &args)?;
            domain((-1.0..=1.0).contains(&x), "arcsin outside [-1, 1]")?;
            float(x.asin())
        }
        "acos" | "arccos" => {
            let x = one(name, &args)?;
            domain((-1.0..=1.0).contains(&x), "arccos outside [-1, 1]")?;
            float(x.acos())
        }
        "atan" | "arctan" => float(one(name, &args)?.atan()),
        "atan2" | "arctan2" => {
            let (a, b) = two(name, &args)?;
            float(a.atan2(b))
        }
        "sinh" => float(one(name, &args)?.sinh()),
        "cosh" => float(one(name, &args)?.cosh()),
        "tanh" => float(one(name, &args)?.tanh()),
        "ceil" => {
            let x = one(name, &args)?;
            if module == "math" {
                Ok(Value::Int(x.ceil() as i64))
            } else {
                float(x.ceil())
            }
        }
        "floor" => {
            let x = one(name, &args)?;
            if module == "math" {
                Ok(Value::Int(x.floor() as i64))
            } else {
                float(x.floor())
            }
        }
        "trunc" => Ok(Value::Int(one(name, &args)?.trunc() as i64)),
        "degrees" => float(one(name, &args)?.to_degrees()),
        "radians" => float(one(name, &args)?.to_radians()),
        "fabs" | "abs" => {
            // abs preserves int-ness like the source language.
            if name == "abs" && args.len() == 1 {
                if let Value::Int(i) = args[0] {
                    return Ok(Value::Int(i.abs()));
                }
            }
            float(one(name, &args)?.abs())
        }
        "round" => {
            if args.len() == 2 {
                let (x, digits) = two(name, &args)?;
                let factor = 10f64.powi(digits as i32);
                float((x * factor).round() / factor)
            } else {
                let x = one(name, &args)?;
                Ok(Value::Int(round_half_even(x) as i64))
            }
        }
        "square" => {
            let x = one(name, &args)?;
            float(x * x)
        }
        "sign" => {
            let x = one(name, &args)?;
            float(if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            })
        }
        "clip" => {
            let [x, lo, hi] = args.as_slice() else {
                return Err(EvalError::Evaluation(format!(
                    "clip() takes 3 arguments, got {}",
                    args.len()
                )));
            };
            float(x.as_number()?.clamp(lo.as_number()?, hi.as_number()?))
        }
        other => Err(EvalError::Evaluation(format!(
            "'{other}' is not a known function"
        ))),
    }
}

/// Seeds an execution scope: curated builtins only; modules join the scope
/// when the code imports them.
pub fn seed_scope() -> Vec<(String, Value)> {
    TOP_LEVEL
        .iter()
        .map(|name| (name.to_string(), Value::Builtin(*name)))
        .collect()
}
