//! The restricted single-line expression language.
//!
//! An expression is compiled to a small syntax tree accepting only a closed
//! set of constructs: numeric literals, variable names, binary and unary
//! arithmetic, comparisons, the conditional `a if cond else b`, calls into a
//! closed set of pure functions, and the constants `pi`, `e`, `tau`, `inf`,
//! `nan`. Anything else is rejected at compile time with a security error —
//! disallowed input is never executed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EvalError;

/// Call targets accepted in expressions. All pure, all side-effect free.
const ALLOWED_FUNCS: &[&str] = &[
    "abs", "round", "min", "max", "sum", "sqrt", "pow", "exp", "log", "log10", "log2", "sin",
    "cos", "tan", "asin", "acos", "atan", "atan2", "sinh", "cosh", "tanh", "ceil", "floor",
    "trunc", "degrees", "radians",
];

const CONSTANTS: &[(&str, f64)] = &[
    ("pi", std::f64::consts::PI),
    ("e", std::f64::consts::E),
    ("tau", std::f64::consts::TAU),
    ("inf", f64::INFINITY),
    ("nan", f64::NAN),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Num(f64),
    Name(String),
    Unary {
        negate: bool,
        operand: Box<Node>,
    },
    Bin {
        op: BinOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Cmp {
        op: CmpOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Ternary {
        cond: Box<Node>,
        then: Box<Node>,
        orelse: Box<Node>,
    },
    Call {
        func: &'static str,
        args: Vec<Node>,
    },
}

/// A compiled, validated expression. Cheap to clone and safe to share
/// between worker tasks.
#[derive(Debug, Clone)]
pub struct ExprProgram {
    ast: Arc<Node>,
    free: Arc<Vec<String>>,
}

impl ExprProgram {
    pub fn compile(text: &str) -> Result<Self, EvalError> {
        let tokens = lex(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_ternary()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvalError::Evaluation(format!(
                "unexpected trailing input at token {}",
                parser.pos + 1
            )));
        }
        let mut free = Vec::new();
        collect_names(&ast, &mut free);
        Ok(Self {
            ast: Arc::new(ast),
            free: Arc::new(free),
        })
    }

    /// Variable names the expression reads, constants excluded.
    pub fn free_names(&self) -> &[String] {
        &self.free
    }

    pub fn eval(&self, bindings: &HashMap<String, f64>) -> Result<f64, EvalError> {
        eval_node(&self.ast, bindings)
    }
}

/// Free variable names of an expression, for declaration checking.
pub fn free_names(text: &str) -> Result<Vec<String>, EvalError> {
    Ok(ExprProgram::compile(text)?.free_names().to_vec())
}

fn collect_names(node: &Node, out: &mut Vec<String>) {
    match node {
        Node::Num(_) => {}
        Node::Name(name) => {
            if !CONSTANTS.iter().any(|(c, _)| *c == name) && !out.contains(name) {
                out.push(name.clone());
            }
        }
        Node::Unary { operand, .. } => collect_names(operand, out),
        Node::Bin { left, right, .. } | Node::Cmp { left, right, .. } => {
            collect_names(left, out);
            collect_names(right, out);
        }
        Node::Ternary { cond, then, orelse } => {
            collect_names(cond, out);
            collect_names(then, out);
            collect_names(orelse, out);
        }
        Node::Call { args, .. } => args.iter().for_each(|a| collect_names(a, out)),
    }
}

// ================================================================================================
// Lexer
// ================================================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    DblStar,
    Slash,
    DblSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Comma,
    If,
    Else,
}

fn lex(text: &str) -> Result<Vec<Tok>, EvalError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '.' if !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                return Err(EvalError::Security(
                    "attribute access is not allowed in expressions".to_string(),
                ));
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    i += 1;
                    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                        i += 1;
                    }
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let raw: String = chars[start..i].iter().collect();
                let value = raw.parse().map_err(|_| {
                    EvalError::Evaluation(format!("malformed number literal '{raw}'"))
                })?;
                tokens.push(Tok::Num(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "if" => tokens.push(Tok::If),
                    "else" => tokens.push(Tok::Else),
                    "and" | "or" | "not" | "in" | "is" | "lambda" => {
                        return Err(EvalError::Security(format!(
                            "'{word}' is not allowed in expressions"
                        )));
                    }
                    _ => tokens.push(Tok::Ident(word)),
                }
            }
            '+' => {
                tokens.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Tok::DblStar);
                    i += 2;
                } else {
                    tokens.push(Tok::Star);
                    i += 1;
                }
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Tok::DblSlash);
                    i += 2;
                } else {
                    tokens.push(Tok::Slash);
                    i += 1;
                }
            }
            '%' => {
                tokens.push(Tok::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Eq);
                    i += 2;
                } else {
                    return Err(EvalError::Security(
                        "assignment is not allowed in expressions".to_string(),
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Ne);
                    i += 2;
                } else {
                    return Err(EvalError::Security("'!' is not allowed".to_string()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Le);
                    i += 2;
                } else {
                    tokens.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Tok::Ge);
                    i += 2;
                } else {
                    tokens.push(Tok::Gt);
                    i += 1;
                }
            }
            other => {
                return Err(EvalError::Security(format!(
                    "character '{other}' is not allowed in expressions"
                )));
            }
        }
    }
    Ok(tokens)
}

// ================================================================================================
// Parser
// ================================================================================================

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Tok, EvalError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| EvalError::Evaluation("unexpected end of expression".to_string()))?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, expected: Tok) -> Result<(), EvalError> {
        let tok = self.next()?;
        if tok == expected {
            Ok(())
        } else {
            Err(EvalError::Evaluation(format!(
                "expected {expected:?}, found {tok:?}"
            )))
        }
    }

    /// `body if cond else orelse`, right-associative.
    fn parse_ternary(&mut self) -> Result<Node, EvalError> {
        let body = self.parse_comparison()?;
        if self.peek() == Some(&Tok::If) {
            self.pos += 1;
            let cond = self.parse_comparison()?;
            self.expect(Tok::Else)?;
            let orelse = self.parse_ternary()?;
            return Ok(Node::Ternary {
                cond: Box::new(cond),
                then: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_comparison(&mut self) -> Result<Node, EvalError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Tok::Eq) => CmpOp::Eq,
            Some(Tok::Ne) => CmpOp::Ne,
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Le) => CmpOp::Le,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Node::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_additive(&mut self) -> Result<Node, EvalError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Node::Bin {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_term(&mut self) -> Result<Node, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::DblSlash) => BinOp::FloorDiv,
                Some(Tok::Percent) => BinOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Node::Bin {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Node, EvalError> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Node::Unary {
                    negate: true,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Some(Tok::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    /// `**` binds tighter than unary minus on the left; the exponent may
    /// itself be signed (`2 ** -3`).
    fn parse_power(&mut self) -> Result<Node, EvalError> {
        let base = self.parse_atom()?;
        if self.peek() == Some(&Tok::DblStar) {
            self.pos += 1;
            let exp = self.parse_unary()?;
            return Ok(Node::Bin {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Node, EvalError> {
        match self.next()? {
            Tok::Num(value) => Ok(Node::Num(value)),
            Tok::LParen => {
                let inner = self.parse_ternary()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Tok::Ident(name) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    self.parse_call(&name)
                } else {
                    Ok(Node::Name(name))
                }
            }
            other => Err(EvalError::Evaluation(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Node, EvalError> {
        let func = ALLOWED_FUNCS
            .iter()
            .find(|f| **f == name)
            .copied()
            .ok_or_else(|| {
                EvalError::Security(format!("call to '{name}' is not allowed"))
            })?;
        let mut args = Vec::new();
        if self.peek() != Some(&Tok::RParen) {
            loop {
                args.push(self.parse_ternary()?);
                match self.peek() {
                    Some(Tok::Comma) => self.pos += 1,
                    _ => break,
                }
            }
        }
        self.expect(Tok::RParen)?;
        check_arity(func, args.len())?;
        Ok(Node::Call { func, args })
    }
}

fn check_arity(func: &str, n: usize) -> Result<(), EvalError> {
    let ok = match func {
        "min" | "max" | "sum" => n >= 1,
        "round" | "log" => n == 1 || n == 2,
        "pow" | "atan2" => n == 2,
        _ => n == 1,
    };
    if ok {
        Ok(())
    } else {
        Err(EvalError::Evaluation(format!(
            "{func}() called with {n} argument(s)"
        )))
    }
}

// ================================================================================================
// Evaluation
// ================================================================================================

fn eval_node(node: &Node, bindings: &HashMap<String, f64>) -> Result<f64, EvalError> {
    match node {
        Node::Num(value) => Ok(*value),
        Node::Name(name) => bindings.get(name).copied().or_else(|| constant(name)).ok_or_else(
            || EvalError::Evaluation(format!("undefined variable '{name}'")),
        ),
        Node::Unary { negate, operand } => {
            let value = eval_node(operand, bindings)?;
            Ok(if *negate { -value } else { value })
        }
        Node::Bin { op, left, right } => {
            let l = eval_node(left, bindings)?;
            let r = eval_node(right, bindings)?;
            apply_bin(*op, l, r)
        }
        Node::Cmp { op, left, right } => {
            let l = eval_node(left, bindings)?;
            let r = eval_node(right, bindings)?;
            let truth = match op {
                CmpOp::Eq => l == r,
                CmpOp::Ne => l != r,
                CmpOp::Lt => l < r,
                CmpOp::Le => l <= r,
                CmpOp::Gt => l > r,
                CmpOp::Ge => l >= r,
            };
            Ok(if truth { 1.0 } else { 0.0 })
        }
        Node::Ternary { cond, then, orelse } => {
            if eval_node(cond, bindings)? != 0.0 {
                eval_node(then, bindings)
            } else {
                eval_node(orelse, bindings)
            }
        }
        Node::Call { func, args } => {
            let values = args
                .iter()
                .map(|a| eval_node(a, bindings))
                .collect::<Result<Vec<f64>, _>>()?;
            apply_func(func, &values)
        }
    }
}

fn constant(name: &str) -> Option<f64> {
    CONSTANTS
        .iter()
        .find(|(c, _)| *c == name)
        .map(|(_, v)| *v)
}

pub(crate) fn apply_bin(op: BinOp, l: f64, r: f64) -> Result<f64, EvalError> {
    match op {
        BinOp::Add => Ok(l + r),
        BinOp::Sub => Ok(l - r),
        BinOp::Mul => Ok(l * r),
        BinOp::Div => {
            if r == 0.0 {
                Err(EvalError::Evaluation("division by zero".to_string()))
            } else {
                Ok(l / r)
            }
        }
        BinOp::FloorDiv => {
            if r == 0.0 {
                Err(EvalError::Evaluation("division by zero".to_string()))
            } else {
                Ok((l / r).floor())
            }
        }
        BinOp::Mod => {
            if r == 0.0 {
                Err(EvalError::Evaluation("modulo by zero".to_string()))
            } else {
                // The result takes the sign of the divisor.
                Ok(l - r * (l / r).floor())
            }
        }
        BinOp::Pow => Ok(l.powf(r)),
    }
}

fn apply_func(func: &str, args: &[f64]) -> Result<f64, EvalError> {
    let domain = |cond: bool, msg: &str| {
        if cond {
            Ok(())
        } else {
            Err(EvalError::Evaluation(format!("math domain error: {msg}")))
        }
    };
    let x = args.first().copied().unwrap_or(0.0);
    match func {
        "abs" => Ok(x.abs()),
        "round" => {
            if args.len() == 2 {
                let factor = 10f64.powi(args[1] as i32);
                Ok((x * factor).round() / factor)
            } else {
                Ok(round_half_even(x))
            }
        }
        "min" => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        "sum" => Ok(args.iter().sum()),
        "sqrt" => {
            domain(x >= 0.0, "sqrt of a negative number")?;
            Ok(x.sqrt())
        }
        "pow" => Ok(x.powf(args[1])),
        "exp" => Ok(x.exp()),
        "log" => {
            domain(x > 0.0, "log of a non-positive number")?;
            if args.len() == 2 {
                domain(args[1] > 0.0 && args[1] != 1.0, "invalid log base")?;
                Ok(x.log(args[1]))
            } else {
                Ok(x.ln())
            }
        }
        "log10" => {
            domain(x > 0.0, "log10 of a non-positive number")?;
            Ok(x.log10())
        }
        "log2" => {
            domain(x > 0.0, "log2 of a non-positive number")?;
            Ok(x.log2())
        }
        "sin" => Ok(x.sin()),
        "cos" => Ok(x.cos()),
        "tan" => Ok(x.tan()),
        "asin" => {
            domain((-1.0..=1.0).contains(&x), "asin outside [-1, 1]")?;
            Ok(x.asin())
        }
        "acos" => {
            domain((-1.0..=1.0).contains(&x), "acos outside [-1, 1]")?;
            Ok(x.acos())
        }
        "atan" => Ok(x.atan()),
        "atan2" => Ok(x.atan2(args[1])),
        "sinh" => Ok(x.sinh()),
        "cosh" => Ok(x.cosh()),
        "tanh" => Ok(x.tanh()),
        "ceil" => Ok(x.ceil()),
        "floor" => Ok(x.floor()),
        "trunc" => Ok(x.trunc()),
        "degrees" => Ok(x.to_degrees()),
        "radians" => Ok(x.to_radians()),
        other => Err(EvalError::Security(format!(
            "call to '{other}' is not allowed"
        ))),
    }
}

/// Banker's rounding: exact halves go to the even neighbour.
pub(crate) fn round_half_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}
