//! Tree-walking interpreter for the restricted code language.
//!
//! Values follow the host scripting semantics the model authors write in:
//! ints and floats promote on mixed arithmetic, `/` always divides as float,
//! `//` and `%` floor toward the divisor's sign. Every loop iteration and
//! function call checks the evaluation deadline so a runaway computation
//! stops itself shortly after the caller has given up on it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::error::EvalError;

use super::ast::{BinOp, BoolOpKind, CmpOp, CompClause, Expr, FuncDef, Stmt, Target};
use super::builtins;

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<String>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Set(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Func(Arc<FuncDef>),
    Builtin(&'static str),
    Module(&'static str),
    Bound {
        recv: Box<Value>,
        method: &'static str,
    },
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Set(_) => "set",
            Self::Dict(_) => "dict",
            Self::Range { .. } => "range",
            Self::Func(_) => "function",
            Self::Builtin(_) => "builtin",
            Self::Module(_) => "module",
            Self::Bound { .. } => "method",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.borrow().is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::Set(items) => !items.borrow().is_empty(),
            Self::Dict(pairs) => !pairs.borrow().is_empty(),
            Self::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            _ => true,
        }
    }

    /// Numeric coercion; booleans count as 0/1 like in the source language.
    pub fn as_number(&self) -> Result<f64, EvalError> {
        match self {
            Self::Bool(b) => Ok(f64::from(*b as u8)),
            Self::Int(i) => Ok(*i as f64),
            Self::Float(f) => Ok(*f),
            other => Err(EvalError::Evaluation(format!(
                "expected a number, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_index(&self) -> Result<i64, EvalError> {
        match self {
            Self::Bool(b) => Ok(i64::from(*b as u8)),
            Self::Int(i) => Ok(*i),
            other => Err(EvalError::Evaluation(format!(
                "indices must be integers, got {}",
                other.type_name()
            ))),
        }
    }
}

fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 {
        ((stop - start).max(0) + step - 1) / step
    } else {
        ((start - stop).max(0) + (-step) - 1) / (-step)
    }
}

/// Structural equality across numeric and container values.
pub fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_eq(a, b))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_eq(a, b))
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().all(|a| y.iter().any(|b| values_eq(a, b)))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter()
                        .any(|(k2, v2)| values_eq(k, k2) && values_eq(v, v2))
                })
        }
        _ => match (a.as_number(), b.as_number()) {
            (Ok(x), Ok(y)) => x == y,
            _ => false,
        },
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Variable scopes: one global frame plus a stack of function-local frames.
/// Reads fall through the innermost frame to globals; writes stay local.
pub struct Env {
    globals: HashMap<String, Value>,
    locals: Vec<HashMap<String, Value>>,
}

impl Env {
    pub fn new(globals: HashMap<String, Value>) -> Self {
        Self {
            globals,
            locals: Vec::new(),
        }
    }

    fn get(&self, name: &str) -> Option<Value> {
        if let Some(frame) = self.locals.last() {
            if let Some(value) = frame.get(name) {
                return Some(value.clone());
            }
        }
        self.globals.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: Value) {
        match self.locals.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }
}

const MAX_CALL_DEPTH: usize = 64;

pub struct Interp {
    deadline: Option<Instant>,
}

impl Interp {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline }
    }

    pub fn run(&self, body: &[Stmt], env: &mut Env) -> Result<(), EvalError> {
        match self.exec_block(body, env)? {
            Flow::Return(_) => Err(EvalError::Evaluation(
                "'return' outside of a function".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn check_deadline(&self) -> Result<(), EvalError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(EvalError::Timeout(Default::default()));
            }
        }
        Ok(())
    }

    fn exec_block(&self, stmts: &[Stmt], env: &mut Env) -> Result<Flow, EvalError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&self, stmt: &Stmt, env: &mut Env) -> Result<Flow, EvalError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign { target, value } => {
                let value = self.eval(value, env)?;
                self.assign(target, value, env)?;
                Ok(Flow::Normal)
            }
            Stmt::AugAssign { target, op, value } => {
                let current = match target {
                    Target::Name(name) => env.get(name).ok_or_else(|| {
                        EvalError::Evaluation(format!("name '{name}' is not defined"))
                    })?,
                    Target::Subscript { value, index } => {
                        let container = self.eval(value, env)?;
                        let index = self.eval(index, env)?;
                        read_index(&container, &index)?
                    }
                    Target::Tuple(_) => {
                        return Err(EvalError::Evaluation(
                            "augmented assignment needs a single target".to_string(),
                        ));
                    }
                };
                let rhs = self.eval(value, env)?;
                let updated = binary_op(*op, &current, &rhs)?;
                self.assign(target, updated, env)?;
                Ok(Flow::Normal)
            }
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond, env)?.truthy() {
                        return self.exec_block(body, env);
                    }
                }
                self.exec_block(orelse, env)
            }
            Stmt::While { cond, body } => {
                while self.eval(cond, env)?.truthy() {
                    self.check_deadline()?;
                    match self.exec_block(body, env)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For { target, iter, body } => {
                let iterable = self.eval(iter, env)?;
                // Ranges iterate lazily so a huge bound never materializes.
                if let Value::Range { start, stop, step } = &iterable {
                    let (mut i, stop, step) = (*start, *stop, *step);
                    while (step > 0 && i < stop) || (step < 0 && i > stop) {
                        self.check_deadline()?;
                        self.assign(target, Value::Int(i), env)?;
                        match self.exec_block(body, env)? {
                            Flow::Break => break,
                            Flow::Continue | Flow::Normal => {}
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                        i += step;
                    }
                    return Ok(Flow::Normal);
                }
                for item in iterate(&iterable)? {
                    self.check_deadline()?;
                    self.assign(target, item, env)?;
                    match self.exec_block(body, env)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::FuncDef(def) => {
                env.set(&def.name, Value::Func(def.clone()));
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Pass => Ok(Flow::Normal),
            Stmt::Import { module, alias } => {
                let (bound_name, canonical) = match module.as_str() {
                    "math" => (alias.as_deref().unwrap_or("math"), "math"),
                    "numpy" => (alias.as_deref().unwrap_or("numpy"), "numpy"),
                    other => {
                        return Err(EvalError::Security(format!(
                            "import of '{other}' is not allowed"
                        )));
                    }
                };
                env.set(bound_name, Value::Module(canonical));
                Ok(Flow::Normal)
            }
        }
    }

    fn assign(&self, target: &Target, value: Value, env: &mut Env) -> Result<(), EvalError> {
        match target {
            Target::Name(name) => {
                env.set(name, value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = iterate(&value)?;
                if items.len() != targets.len() {
                    return Err(EvalError::Evaluation(format!(
                        "cannot unpack {} values into {} targets",
                        items.len(),
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
                Ok(())
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, env)?;
                let index = self.eval(index, env)?;
                write_index(&container, &index, value)
            }
        }
    }

    // ============================================================================================
    // Expressions
    // ============================================================================================

    fn eval(&self, expr: &Expr, env: &mut Env) -> Result<Value, EvalError> {
        match expr {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Float(v) => Ok(Value::Float(*v)),
            Expr::Str(v) => Ok(Value::Str(Rc::new(v.clone()))),
            Expr::Bool(v) => Ok(Value::Bool(*v)),
            Expr::NoneLit => Ok(Value::None),
            Expr::Name(name) => env
                .get(name)
                .ok_or_else(|| EvalError::Evaluation(format!("name '{name}' is not defined"))),
            Expr::Unary { negate, operand } => {
                let value = self.eval(operand, env)?;
                if !negate {
                    return Ok(value);
                }
                match value {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Bool(b) => Ok(Value::Int(-i64::from(b as u8))),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(EvalError::Evaluation(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(operand, env)?.truthy())),
            Expr::Bin { op, left, right } => {
                let l = self.eval(left, env)?;
                let r = self.eval(right, env)?;
                binary_op(*op, &l, &r)
            }
            Expr::BoolOp { op, values } => {
                // Short-circuit, returning the deciding operand.
                let mut last = Value::None;
                for value in values {
                    last = self.eval(value, env)?;
                    match op {
                        BoolOpKind::And if !last.truthy() => return Ok(last),
                        BoolOpKind::Or if last.truthy() => return Ok(last),
                        _ => {}
                    }
                }
                Ok(last)
            }
            Expr::Compare { left, rest } => {
                let mut prev = self.eval(left, env)?;
                for (op, right) in rest {
                    let next = self.eval(right, env)?;
                    if !compare(*op, &prev, &next)? {
                        return Ok(Value::Bool(false));
                    }
                    prev = next;
                }
                Ok(Value::Bool(true))
            }
            Expr::Ternary { cond, then, orelse } => {
                if self.eval(cond, env)?.truthy() {
                    self.eval(then, env)
                } else {
                    self.eval(orelse, env)
                }
            }
            Expr::Call { func, args } => {
                let callee = self.eval(func, env)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval(arg, env)?);
                }
                self.call(callee, evaluated, env)
            }
            Expr::Attribute { value, attr } => {
                let value = self.eval(value, env)?;
                attribute(&value, attr)
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value, env)?;
                let index = self.eval(index, env)?;
                read_index(&container, &index)
            }
            Expr::List(items) => {
                let items = self.eval_all(items, env)?;
                Ok(Value::list(items))
            }
            Expr::Tuple(items) => Ok(Value::Tuple(Rc::new(self.eval_all(items, env)?))),
            Expr::Set(items) => {
                let mut unique: Vec<Value> = Vec::new();
                for item in self.eval_all(items, env)? {
                    if !unique.iter().any(|v| values_eq(v, &item)) {
                        unique.push(item);
                    }
                }
                Ok(Value::Set(Rc::new(RefCell::new(unique))))
            }
            Expr::Dict(pairs) => {
                let mut entries: Vec<(Value, Value)> = Vec::new();
                for (key, value) in pairs {
                    let key = self.eval(key, env)?;
                    let value = self.eval(value, env)?;
                    dict_insert(&mut entries, key, value);
                }
                Ok(Value::Dict(Rc::new(RefCell::new(entries))))
            }
            Expr::ListComp { elt, clauses } => {
                let mut out = Vec::new();
                self.run_comp(clauses, 0, env, &mut |interp, env| {
                    out.push(interp.eval(elt, env)?);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            Expr::SetComp { elt, clauses } => {
                let mut out: Vec<Value> = Vec::new();
                self.run_comp(clauses, 0, env, &mut |interp, env| {
                    let item = interp.eval(elt, env)?;
                    if !out.iter().any(|v| values_eq(v, &item)) {
                        out.push(item);
                    }
                    Ok(())
                })?;
                Ok(Value::Set(Rc::new(RefCell::new(out))))
            }
            Expr::DictComp {
                key,
                value,
                clauses,
            } => {
                let mut entries: Vec<(Value, Value)> = Vec::new();
                self.run_comp(clauses, 0, env, &mut |interp, env| {
                    let k = interp.eval(key, env)?;
                    let v = interp.eval(value, env)?;
                    dict_insert(&mut entries, k, v);
                    Ok(())
                })?;
                Ok(Value::Dict(Rc::new(RefCell::new(entries))))
            }
        }
    }

    fn eval_all(&self, exprs: &[Expr], env: &mut Env) -> Result<Vec<Value>, EvalError> {
        exprs.iter().map(|e| self.eval(e, env)).collect()
    }

    fn run_comp(
        &self,
        clauses: &[CompClause],
        depth: usize,
        env: &mut Env,
        emit: &mut dyn FnMut(&Self, &mut Env) -> Result<(), EvalError>,
    ) -> Result<(), EvalError> {
        let Some(clause) = clauses.get(depth) else {
            return emit(self, env);
        };
        let iterable = self.eval(&clause.iter, env)?;
        'outer: for item in iterate(&iterable)? {
            self.check_deadline()?;
            self.assign(&clause.target, item, env)?;
            for cond in &clause.conds {
                if !self.eval(cond, env)?.truthy() {
                    continue 'outer;
                }
            }
            self.run_comp(clauses, depth + 1, env, emit)?;
        }
        Ok(())
    }

    fn call(&self, callee: Value, args: Vec<Value>, env: &mut Env) -> Result<Value, EvalError> {
        self.check_deadline()?;
        match callee {
            Value::Func(def) => {
                if args.len() != def.params.len() {
                    return Err(EvalError::Evaluation(format!(
                        "{}() takes {} argument(s), got {}",
                        def.name,
                        def.params.len(),
                        args.len()
                    )));
                }
                if env.locals.len() >= MAX_CALL_DEPTH {
                    return Err(EvalError::Evaluation(
                        "maximum recursion depth exceeded".to_string(),
                    ));
                }
                let frame: HashMap<String, Value> =
                    def.params.iter().cloned().zip(args).collect();
                env.locals.push(frame);
                let outcome = self.exec_block(&def.body, env);
                env.locals.pop();
                match outcome? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(Value::None),
                }
            }
            Value::Builtin(path) => builtins::call(path, args),
            Value::Bound { recv, method } => call_method(&recv, method, args),
            other => Err(EvalError::Evaluation(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }
}

// ================================================================================================
// Operators
// ================================================================================================

pub fn binary_op(op: BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    // Container and string forms first; everything else is numeric.
    match (op, l, r) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            Ok(Value::Str(Rc::new(format!("{a}{b}"))))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            Ok(Value::list(out))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut out = a.as_ref().clone();
            out.extend(b.iter().cloned());
            Ok(Value::Tuple(Rc::new(out)))
        }
        (BinOp::Mul, Value::List(a), Value::Int(n)) => {
            let items = a.borrow();
            let mut out = Vec::with_capacity(items.len() * (*n).max(0) as usize);
            for _ in 0..(*n).max(0) {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        (BinOp::Mul, Value::Str(a), Value::Int(n)) => {
            Ok(Value::Str(Rc::new(a.repeat((*n).max(0) as usize))))
        }
        _ => numeric_op(op, l, r),
    }
}

fn numeric_op(op: BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    let int_pair = match (promote(l)?, promote(r)?) {
        (Num::Int(a), Num::Int(b)) => Some((a, b)),
        _ => None,
    };

    if let Some((a, b)) = int_pair {
        match op {
            BinOp::Add => {
                return a
                    .checked_add(b)
                    .map(Value::Int)
                    .ok_or_else(overflow);
            }
            BinOp::Sub => {
                return a
                    .checked_sub(b)
                    .map(Value::Int)
                    .ok_or_else(overflow);
            }
            BinOp::Mul => {
                return a
                    .checked_mul(b)
                    .map(Value::Int)
                    .ok_or_else(overflow);
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(zero_division());
                }
                let mut q = a / b;
                if a % b != 0 && (a < 0) != (b < 0) {
                    q -= 1;
                }
                return Ok(Value::Int(q));
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(zero_division());
                }
                let mut m = a % b;
                if m != 0 && (m < 0) != (b < 0) {
                    m += b;
                }
                return Ok(Value::Int(m));
            }
            BinOp::Pow if b >= 0 => {
                let exp = u32::try_from(b).map_err(|_| overflow())?;
                return a.checked_pow(exp).map(Value::Int).ok_or_else(overflow);
            }
            // int / int and int ** negative fall through to float math.
            _ => {}
        }
    }

    let a = l.as_number()?;
    let b = r.as_number()?;
    match op {
        BinOp::Add => Ok(Value::Float(a + b)),
        BinOp::Sub => Ok(Value::Float(a - b)),
        BinOp::Mul => Ok(Value::Float(a * b)),
        BinOp::Div => {
            if b == 0.0 {
                Err(zero_division())
            } else {
                Ok(Value::Float(a / b))
            }
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                Err(zero_division())
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Err(zero_division())
            } else {
                Ok(Value::Float(a - b * (a / b).floor()))
            }
        }
        BinOp::Pow => Ok(Value::Float(a.powf(b))),
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

fn promote(value: &Value) -> Result<Num, EvalError> {
    match value {
        Value::Bool(b) => Ok(Num::Int(i64::from(*b as u8))),
        Value::Int(i) => Ok(Num::Int(*i)),
        Value::Float(f) => Ok(Num::Float(*f)),
        other => Err(EvalError::Evaluation(format!(
            "unsupported operand type {}",
            other.type_name()
        ))),
    }
}

fn overflow() -> EvalError {
    EvalError::Evaluation("integer overflow".to_string())
}

fn zero_division() -> EvalError {
    EvalError::Evaluation("division by zero".to_string())
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_eq(l, r)),
        CmpOp::Ne => Ok(!values_eq(l, r)),
        CmpOp::In => contains(r, l),
        CmpOp::NotIn => contains(r, l).map(|b| !b),
        _ => {
            let ord = match (l, r) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => {
                    let a = l.as_number()?;
                    let b = r.as_number()?;
                    a.partial_cmp(&b).ok_or_else(|| {
                        EvalError::Evaluation("cannot order NaN values".to_string())
                    })?
                }
            };
            Ok(match op {
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match container {
        Value::List(items) | Value::Set(items) => {
            Ok(items.borrow().iter().any(|v| values_eq(v, item)))
        }
        Value::Tuple(items) => Ok(items.iter().any(|v| values_eq(v, item))),
        Value::Dict(pairs) => Ok(pairs.borrow().iter().any(|(k, _)| values_eq(k, item))),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_str())),
            _ => Ok(false),
        },
        other => Err(EvalError::Evaluation(format!(
            "{} does not support membership tests",
            other.type_name()
        ))),
    }
}

/// Snapshot iteration over the safe built-in containers.
pub fn iterate(value: &Value) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::List(items) | Value::Set(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        Value::Dict(pairs) => Ok(pairs.borrow().iter().map(|(k, _)| k.clone()).collect()),
        Value::Str(s) => Ok(s
            .chars()
            .map(|c| Value::Str(Rc::new(c.to_string())))
            .collect()),
        Value::Range { start, stop, step } => {
            let mut out = Vec::new();
            let mut i = *start;
            if *step > 0 {
                while i < *stop {
                    out.push(Value::Int(i));
                    i += step;
                }
            } else {
                while i > *stop {
                    out.push(Value::Int(i));
                    i += step;
                }
            }
            Ok(out)
        }
        other => Err(EvalError::Evaluation(format!(
            "{} is not iterable",
            other.type_name()
        ))),
    }
}

fn read_index(container: &Value, index: &Value) -> Result<Value, EvalError> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(index.as_index()?, items.len())?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(index.as_index()?, items.len())?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(index.as_index()?, chars.len())?;
            Ok(Value::Str(Rc::new(chars[i].to_string())))
        }
        Value::Dict(pairs) => pairs
            .borrow()
            .iter()
            .find(|(k, _)| values_eq(k, index))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| EvalError::Evaluation("key not found".to_string())),
        other => Err(EvalError::Evaluation(format!(
            "{} is not subscriptable",
            other.type_name()
        ))),
    }
}

fn write_index(container: &Value, index: &Value, value: Value) -> Result<(), EvalError> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let i = normalize_index(index.as_index()?, len)?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(pairs) => {
            let mut pairs = pairs.borrow_mut();
            dict_insert(&mut pairs, index.clone(), value);
            Ok(())
        }
        other => Err(EvalError::Evaluation(format!(
            "{} does not support item assignment",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Result<usize, EvalError> {
    let len = len as i64;
    let normalized = if index < 0 { index + len } else { index };
    if (0..len).contains(&normalized) {
        Ok(normalized as usize)
    } else {
        Err(EvalError::Evaluation(format!(
            "index {index} out of range for length {len}"
        )))
    }
}

pub fn dict_insert(entries: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    if let Some(slot) = entries.iter_mut().find(|(k, _)| values_eq(k, &key)) {
        slot.1 = value;
    } else {
        entries.push((key, value));
    }
}

// ================================================================================================
// Attributes & methods
// ================================================================================================

fn attribute(value: &Value, attr: &str) -> Result<Value, EvalError> {
    match value {
        Value::Module(module) => builtins::module_attr(module, attr),
        Value::List(_) => bound(value, attr, &["append", "extend", "pop"]),
        Value::Dict(_) => bound(value, attr, &["get", "keys", "values", "items"]),
        Value::Set(_) => bound(value, attr, &["add", "remove"]),
        other => Err(EvalError::Evaluation(format!(
            "{} has no attribute '{attr}'",
            other.type_name()
        ))),
    }
}

fn bound(value: &Value, attr: &str, allowed: &[&'static str]) -> Result<Value, EvalError> {
    allowed
        .iter()
        .find(|m| **m == attr)
        .map(|method| Value::Bound {
            recv: Box::new(value.clone()),
            method,
        })
        .ok_or_else(|| {
            EvalError::Evaluation(format!(
                "{} has no attribute '{attr}'",
                value.type_name()
            ))
        })
}

fn call_method(recv: &Value, method: &str, mut args: Vec<Value>) -> Result<Value, EvalError> {
    let arity = |n: usize| -> Result<(), EvalError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(EvalError::Evaluation(format!(
                "{method}() takes {n} argument(s), got {}",
                args.len()
            )))
        }
    };
    match (recv, method) {
        (Value::List(items), "append") => {
            arity(1)?;
            items.borrow_mut().push(args.remove(0));
            Ok(Value::None)
        }
        (Value::List(items), "extend") => {
            arity(1)?;
            let extra = iterate(&args[0])?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        (Value::List(items), "pop") => {
            if args.is_empty() {
                items
                    .borrow_mut()
                    .pop()
                    .ok_or_else(|| EvalError::Evaluation("pop from empty list".to_string()))
            } else {
                arity(1)?;
                let mut items = items.borrow_mut();
                let len = items.len();
                let i = normalize_index(args[0].as_index()?, len)?;
                Ok(items.remove(i))
            }
        }
        (Value::Dict(pairs), "get") => {
            let default = if args.len() == 2 {
                args.pop().unwrap_or(Value::None)
            } else {
                arity(1)?;
                Value::None
            };
            Ok(pairs
                .borrow()
                .iter()
                .find(|(k, _)| values_eq(k, &args[0]))
                .map(|(_, v)| v.clone())
                .unwrap_or(default))
        }
        (Value::Dict(pairs), "keys") => {
            arity(0)?;
            Ok(Value::list(
                pairs.borrow().iter().map(|(k, _)| k.clone()).collect(),
            ))
        }
        (Value::Dict(pairs), "values") => {
            arity(0)?;
            Ok(Value::list(
                pairs.borrow().iter().map(|(_, v)| v.clone()).collect(),
            ))
        }
        (Value::Dict(pairs), "items") => {
            arity(0)?;
            Ok(Value::list(
                pairs
                    .borrow()
                    .iter()
                    .map(|(k, v)| Value::Tuple(Rc::new(vec![k.clone(), v.clone()])))
                    .collect(),
            ))
        }
        (Value::Set(items), "add") => {
            arity(1)?;
            let item = args.remove(0);
            let mut items = items.borrow_mut();
            if !items.iter().any(|v| values_eq(v, &item)) {
                items.push(item);
            }
            Ok(Value::None)
        }
        (Value::Set(items), "remove") => {
            arity(1)?;
            let mut items = items.borrow_mut();
            let pos = items
                .iter()
                .position(|v| values_eq(v, &args[0]))
                .ok_or_else(|| EvalError::Evaluation("element not in set".to_string()))?;
            items.remove(pos);
            Ok(Value::None)
        }
        _ => Err(EvalError::Evaluation(format!(
            "{} has no method '{method}'",
            recv.type_name()
        ))),
    }
}
